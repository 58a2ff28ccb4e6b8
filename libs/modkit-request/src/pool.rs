//! Process-wide pool of write buffers used by the body encoders.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

/// Buffers kept idle at most.
const MAX_IDLE: usize = 32;

/// Buffers that grew beyond this are dropped instead of pooled.
const MAX_RETAINED_CAPACITY: usize = 256 * 1024;

const INITIAL_CAPACITY: usize = 4 * 1024;

static IDLE: Mutex<Vec<BytesMut>> = Mutex::new(Vec::new());

/// Take an empty buffer from the pool.
#[must_use]
pub fn get() -> PooledBuf {
    let mut buf = IDLE
        .lock()
        .pop()
        .unwrap_or_else(|| BytesMut::with_capacity(INITIAL_CAPACITY));
    buf.clear();
    PooledBuf { buf }
}

/// Buffer that goes back to the pool when dropped.
#[derive(Debug)]
pub struct PooledBuf {
    buf: BytesMut,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        if buf.capacity() == 0 || buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        let mut idle = IDLE.lock();
        if idle.len() < MAX_IDLE {
            idle.push(buf);
        }
    }
}
