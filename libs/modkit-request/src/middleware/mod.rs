//! Standard middlewares.

pub mod body;
pub mod client;
pub mod cookie;
pub mod dump;
pub mod header;
pub mod multipart;
pub mod options;
pub mod query;
pub mod url;

pub use self::body::{
    BodyOptions, BytesFactory, body, body_get, body_get_bytes, form, form_raw, json, json_raw,
    xml, xml_raw,
};
pub use self::client::{CLIENT_OPTIONS, ClientFn, client_fn, client_funcs, prepare_client_middleware};
pub use self::cookie::{COOKIE_OPTIONS, add_cookies, cookie_option, delete_all_cookies, prepare_cookie_middleware};
pub use self::dump::{DumpFilter, DumpInfo, dump};
pub use self::header::{
    HEADER_OPTIONS, HeaderFn, add_header, basic_auth, bearer_auth, del_header, header_funcs,
    header_option, prepare_header_middleware, set_header,
};
pub use self::multipart::{MultipartField, MultipartOptions, ProgressFn, ProgressUpdate, multipart};
pub use self::options::{prepare_tail, with_options_middleware};
pub use self::query::{QueryFn, QueryValues, add_query, del_query, query_funcs, set_query};
pub use self::url::{URL_OPTIONS, UrlOptions, prepare_url_middleware, url_funcs};
