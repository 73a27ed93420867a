//! The parsed head of a request.
//!
//! [`RequestHeader`] wraps an `http::Request<()>` built by the header decoder,
//! and adds the few protocol decisions the server takes from the head alone.

use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri, Version, header};

/// The method, target, version and header fields of one request.
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl RequestHeader {
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Whether the client asked for the connection to end after this exchange.
    ///
    /// An explicit `Connection: close` always wins; HTTP/1.0 closes unless it
    /// asked for `keep-alive`.
    pub fn wants_close(&self) -> bool {
        let token = |name: &str| {
            self.headers()
                .get_all(header::CONNECTION)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .any(|t| t.trim().eq_ignore_ascii_case(name))
        };

        if token("close") {
            return true;
        }
        self.version() == Version::HTTP_10 && !token("keep-alive")
    }
}

impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(version: Version, connection: Option<&str>) -> RequestHeader {
        let mut builder = Request::builder().method(Method::GET).uri("/").version(version);
        if let Some(value) = connection {
            builder = builder.header(header::CONNECTION, value);
        }
        builder.body(()).unwrap().into()
    }

    #[test]
    fn http11_defaults_to_keep_alive() {
        assert!(!header(Version::HTTP_11, None).wants_close());
        assert!(!header(Version::HTTP_11, Some("keep-alive")).wants_close());
        assert!(header(Version::HTTP_11, Some("Close")).wants_close());
        assert!(header(Version::HTTP_11, Some("upgrade, close")).wants_close());
    }

    #[test]
    fn http10_defaults_to_close() {
        assert!(header(Version::HTTP_10, None).wants_close());
        assert!(!header(Version::HTTP_10, Some("Keep-Alive")).wants_close());
    }
}
