//! The request and response model.
//!
//! - [`RequestHeader`] and [`ResponseHead`] are the raw heads produced and
//!   consumed by the codecs.
//! - [`HttpRequest`] is the lazily resolved request handed to listeners and
//!   interceptors: parameters, cookies, session, attachments and body access.
//! - [`HttpResponse`] is its write-once counterpart.
//! - [`ParseError`], [`SendError`], [`RequestError`] and [`HttpError`] cover
//!   decoding, writing, request access and the exchange as a whole.

mod message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;

mod response;
pub use response::ResponseHead;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::RequestError;
pub use error::SendError;

mod request_body;
pub use request_body::RequestBody;
pub use request_body::TempFiles;
pub use request_body::UploadedFile;

mod params;
pub use params::ParamMap;

mod cookie;
pub use cookie::Cookie;

mod attributes;
pub use attributes::Attributes;

mod session;
pub use session::MemorySessionStore;
pub use session::Session;
pub use session::SessionStore;

mod http_request;
pub use http_request::HttpRequest;

mod http_response;
pub use http_response::HttpResponse;
