//! The request object handed to listeners and interceptors.
//!
//! An [`HttpRequest`] is a read-mostly view over one [`DecodedRequest`]. The
//! parts that need work or shared state are resolved lazily and memoized:
//! cookies and the session are resolved at most once, the attribute map is
//! created on first use, and the query string plus a form or multipart body
//! are parsed on first parameter access.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, Uri, Version, header};
use mime::Mime;
use parking_lot::Mutex;
use tempfile::TempPath;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{DecodedRequest, parse_boundary, read_multipart};
use crate::protocol::{
    Attributes, Cookie, ParamMap, ParseError, RequestBody, RequestError, RequestHeader, Session, SessionStore,
    TempFiles, UploadedFile,
};
use crate::server::RequestConfig;

/// Parameters of the query string and body, with the files of a multipart body.
#[derive(Debug, Default)]
struct Form {
    params: ParamMap,
    uploads: Vec<UploadedFile>,
}

#[derive(Debug, Default)]
struct CookieJar {
    cookies: Option<Vec<Cookie>>,
    session: Option<Arc<Session>>,
}

/// One decoded request and its lazily resolved state.
pub struct HttpRequest {
    header: RequestHeader,
    raw_head: Bytes,
    body: RequestBody,
    form: OnceLock<Form>,
    temp_files: Mutex<Option<TempFiles>>,
    remote_addr: SocketAddr,
    create_time: Instant,
    config: Arc<RequestConfig>,
    session_store: Arc<dyn SessionStore>,
    jar: Mutex<CookieJar>,
    attributes: OnceLock<Attributes>,
}

impl HttpRequest {
    pub fn new(
        decoded: DecodedRequest,
        remote_addr: SocketAddr,
        config: Arc<RequestConfig>,
        session_store: Arc<dyn SessionStore>,
    ) -> Self {
        let DecodedRequest { header, raw_head, body, temp_files } = decoded;
        Self {
            header,
            raw_head,
            body,
            form: OnceLock::new(),
            temp_files: Mutex::new(Some(temp_files)),
            remote_addr,
            create_time: Instant::now(),
            config,
            session_store,
            jar: Mutex::new(CookieJar::default()),
            attributes: OnceLock::new(),
        }
    }

    pub fn method(&self) -> &Method {
        self.header.method()
    }

    pub fn uri(&self) -> &Uri {
        self.header.uri()
    }

    pub fn path(&self) -> &str {
        self.header.uri().path()
    }

    pub fn query_str(&self) -> Option<&str> {
        self.header.uri().query()
    }

    pub fn version(&self) -> Version {
        self.header.version()
    }

    /// The protocol token of the request line, `HTTP/1.0` or `HTTP/1.1`.
    pub fn http_version(&self) -> &'static str {
        if self.version() == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" }
    }

    pub fn headers(&self) -> &HeaderMap {
        self.header.headers()
    }

    /// The first value of header `name`.
    ///
    /// Tries an exact lookup first, then scans the fields ignoring case, which
    /// also finds fields whose name would not parse as a header name.
    pub fn header(&self, name: &str) -> Option<&str> {
        if let Some(value) = self.headers().get(name) {
            return value.to_str().ok();
        }
        self.headers()
            .iter()
            .find(|(key, _)| key.as_str().eq_ignore_ascii_case(name))
            .and_then(|(_, value)| value.to_str().ok())
    }

    pub fn is_connect(&self) -> bool {
        self.method() == Method::CONNECT
    }

    pub(crate) fn request_header(&self) -> &RequestHeader {
        &self.header
    }

    /// Parses the query string and a form or multipart body, once.
    ///
    /// Upload files become owned by the request and are removed with its
    /// other temp files.
    pub(crate) fn resolve_form(&self) -> Result<(), ParseError> {
        if self.form.get().is_some() {
            return Ok(());
        }
        let (form, temp_paths) = self.read_form()?;
        if self.form.set(form).is_ok() {
            // already deleted when taken, dropping the paths removes the files
            if let Some(files) = self.temp_files.lock().as_mut() {
                temp_paths.into_iter().for_each(|path| files.push(path));
            }
        }
        Ok(())
    }

    fn read_form(&self) -> Result<(Form, Vec<TempPath>), ParseError> {
        let mut form = Form::default();
        let mut temp_paths = Vec::new();
        if let Some(query) = self.query_str() {
            form.params.extend_urlencoded(query.as_bytes())?;
        }

        let Some(content_type) = self.header(header::CONTENT_TYPE.as_str()) else {
            return Ok((form, temp_paths));
        };
        if self.body.is_empty() {
            return Ok((form, temp_paths));
        }

        if is_form_urlencoded(content_type) {
            let bytes = self.body.bytes_from(0).map_err(ParseError::io)?;
            form.params.extend_urlencoded(&bytes)?;
        } else if let Some(boundary) = parse_boundary(content_type)? {
            let reader = self.body.reader().map_err(ParseError::io)?;
            let parts = read_multipart(reader, &boundary, &mut form.params, self.config.temp_dir.as_deref())?;
            form.uploads = parts.uploads;
            temp_paths = parts.temp_paths;
        }
        Ok((form, temp_paths))
    }

    fn form(&self) -> &Form {
        if let Err(e) = self.resolve_form() {
            warn!(cause = %e, path = self.path(), "request body parameters ignored");
        }
        self.form.get_or_init(|| {
            let mut params = ParamMap::new();
            if let Some(query) = self.query_str()
                && let Err(e) = params.extend_urlencoded(query.as_bytes())
            {
                debug!(cause = %e, "query string ignored");
            }
            Form { params, uploads: Vec::new() }
        })
    }

    pub fn params(&self) -> &ParamMap {
        &self.form().params
    }

    /// The first value of parameter `key`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params().get_str(key)
    }

    /// Parameter `key` as an integer, 0 when absent.
    pub fn param_int(&self, key: &str) -> Result<i64, RequestError> {
        self.params().get_int(key)
    }

    /// Parameter `key` as a boolean, false when absent.
    pub fn param_bool(&self, key: &str) -> Result<bool, RequestError> {
        self.params().get_bool(key)
    }

    pub fn decoded_params(&self) -> &HashMap<String, Vec<String>> {
        self.params().as_map()
    }

    /// The file uploaded under form field `field`.
    pub fn file(&self, field: &str) -> Option<&UploadedFile> {
        self.files().iter().find(|f| f.field() == field)
    }

    pub fn files(&self) -> &[UploadedFile] {
        &self.form().uploads
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn remote_host(&self) -> IpAddr {
        self.remote_addr.ip()
    }

    pub fn scheme(&self) -> &'static str {
        "http"
    }

    /// The `Host` header, or the authority of an absolute request target.
    pub fn host(&self) -> Option<&str> {
        self.header(header::HOST.as_str()).or_else(|| self.uri().authority().map(|a| a.as_str()))
    }

    /// `scheme://host/path`, without the query string.
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme(), self.host().unwrap_or("localhost"), self.path())
    }

    /// [`url`](Self::url) followed by the query string, if any.
    pub fn full_url(&self) -> String {
        match self.query_str() {
            Some(query) => format!("{}?{query}", self.url()),
            None => self.url(),
        }
    }

    pub fn create_time(&self) -> Instant {
        self.create_time
    }

    pub fn elapsed(&self) -> Duration {
        self.create_time.elapsed()
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// The cookies sent by the client plus any minted while handling this request.
    ///
    /// Always empty when cookies are disabled.
    pub fn cookies(&self) -> Vec<Cookie> {
        let mut jar = self.jar.lock();
        self.resolve_cookies(&mut jar, false);
        jar.cookies.clone().unwrap_or_default()
    }

    pub fn cookie(&self, name: &str) -> Option<Cookie> {
        self.cookies().into_iter().find(|c| c.name() == name)
    }

    /// Cookies that must be sent back with `Set-Cookie`.
    pub(crate) fn fresh_cookies(&self) -> Vec<Cookie> {
        let jar = self.jar.lock();
        jar.cookies.iter().flatten().filter(|c| c.is_fresh()).cloned().collect()
    }

    /// The session of this client, created on first call when the request
    /// carries no valid session cookie.
    ///
    /// Returns the same session on every call, `None` only when cookies are
    /// disabled.
    pub fn session(&self) -> Option<Arc<Session>> {
        let mut jar = self.jar.lock();
        self.resolve_cookies(&mut jar, true);
        jar.session.clone()
    }

    fn resolve_cookies(&self, jar: &mut CookieJar, create: bool) {
        if self.config.disable_cookie {
            jar.cookies.get_or_insert_with(Vec::new);
            return;
        }

        if jar.cookies.is_none() {
            let cookies: Vec<Cookie> = self
                .headers()
                .get_all(header::COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(Cookie::parse_header)
                .collect();
            jar.session = cookies
                .iter()
                .find(|c| c.name() == self.config.session_cookie_name)
                .and_then(|c| self.session_store.get(c.value()));
            jar.cookies = Some(cookies);
        }

        if create && jar.session.is_none() {
            let id = Uuid::new_v4().to_string();
            debug!(session_id = %id, "creating session");
            let cookie = Cookie::new(self.config.session_cookie_name.as_str(), id.as_str())
                .with_path("/")
                .with_http_only(true);
            jar.cookies.get_or_insert_with(Vec::new).push(cookie);

            let session = Arc::new(Session::new(id.as_str()));
            self.session_store.put(&id, Arc::clone(&session));
            jar.session = Some(session);
        }
    }

    /// Per-request attachments, created on first access.
    pub fn attributes(&self) -> &Attributes {
        self.attributes.get_or_init(Attributes::new)
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// A stream over the body: the spilled file, the in-memory bytes, or nothing.
    pub fn input_stream(&self) -> Result<Box<dyn Read + Send>, RequestError> {
        Ok(self.body.reader()?)
    }

    /// The body bytes from `offset` on.
    pub fn body_bytes(&self, offset: u64) -> Result<Bytes, RequestError> {
        Ok(self.body.bytes_from(offset)?)
    }

    /// The raw request, head and body, as received.
    ///
    /// Fails with [`RequestError::BodyNotRecorded`] unless `record_request_body`
    /// is enabled.
    pub fn input_bytes(&self) -> Result<Bytes, RequestError> {
        if !self.config.record_request_body {
            return Err(RequestError::BodyNotRecorded);
        }
        let body = self.body.bytes_from(0)?;
        let mut buf = BytesMut::with_capacity(self.raw_head.len() + body.len());
        buf.extend_from_slice(&self.raw_head);
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }

    /// Removes the spilled body and uploaded files. Only the first call has an effect.
    pub fn delete_temp_files(&self) {
        if let Some(files) = self.temp_files.lock().take()
            && !files.is_empty()
        {
            debug!(count = files.len(), path = self.path(), "deleting request temp files");
            files.delete();
        }
    }
}

fn is_form_urlencoded(content_type: &str) -> bool {
    content_type
        .parse::<Mime>()
        .is_ok_and(|m| m.type_() == mime::APPLICATION && m.subtype() == mime::WWW_FORM_URLENCODED)
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", self.method())
            .field("uri", self.uri())
            .field("version", &self.version())
            .field("remote_addr", &self.remote_addr)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::{DecoderConfig, RequestDecoder};
    use crate::protocol::MemorySessionStore;

    pub(crate) fn decode(raw: &[u8], config: RequestConfig, store: Arc<dyn SessionStore>) -> HttpRequest {
        let mut decoder = RequestDecoder::new(Arc::new(DecoderConfig { spill_threshold: 8, ..DecoderConfig::default() }));
        assert!(decoder.decode(raw).unwrap());
        let decoded = decoder.take_request().unwrap();
        HttpRequest::new(decoded, "127.0.0.1:40000".parse().unwrap(), Arc::new(config), store)
    }

    fn request(raw: &str) -> HttpRequest {
        decode(raw.as_bytes(), RequestConfig::default(), Arc::new(MemorySessionStore::new()))
    }

    #[test]
    fn get_root_defaults() {
        let req = request("GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");

        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.uri(), "/");
        assert!(req.params().is_empty());
        assert!(req.cookies().is_empty());
        assert_eq!(req.http_version(), "HTTP/1.1");
        assert_eq!(req.url(), "http://example.com/");
        assert_eq!(req.remote_host().to_string(), "127.0.0.1");
    }

    #[test]
    fn header_lookup_ignores_case() {
        let req = request("GET / HTTP/1.1\r\nContent-Type: text/plain\r\n\r\n");
        assert_eq!(req.header("content-type"), Some("text/plain"));
        assert_eq!(req.header("Content-Type"), Some("text/plain"));
        assert_eq!(req.header("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(req.header("x-missing"), None);
    }

    #[test]
    fn full_url_keeps_query() {
        let req = request("GET /search?q=a+b&page=2 HTTP/1.0\r\nHost: h:8080\r\n\r\n");
        assert_eq!(req.full_url(), "http://h:8080/search?q=a+b&page=2");
        assert_eq!(req.param("q"), Some("a b"));
        assert_eq!(req.param_int("page").unwrap(), 2);
        assert_eq!(req.http_version(), "HTTP/1.0");
    }

    #[test]
    fn session_is_memoized() {
        let store = Arc::new(MemorySessionStore::new());
        let req = decode(b"GET / HTTP/1.1\r\n\r\n", RequestConfig::default(), store.clone());

        let first = req.session().unwrap();
        let second = req.session().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);

        let fresh = req.fresh_cookies();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].name(), "SESSIONID");
        assert_eq!(fresh[0].value(), first.id());
        assert_eq!(fresh[0].path(), Some("/"));
    }

    #[test]
    fn session_from_cookie() {
        let store = Arc::new(MemorySessionStore::new());
        let existing = Arc::new(Session::new("known"));
        store.put("known", existing.clone());

        let req = decode(b"GET / HTTP/1.1\r\nCookie: a=1; SESSIONID=known\r\n\r\n", RequestConfig::default(), store);
        assert_eq!(req.cookies().len(), 2);
        assert!(Arc::ptr_eq(&req.session().unwrap(), &existing));
        assert!(req.fresh_cookies().is_empty());
    }

    #[test]
    fn unknown_session_cookie_mints_new_session() {
        let store = Arc::new(MemorySessionStore::new());
        let req = decode(b"GET / HTTP/1.1\r\nCookie: SESSIONID=stale\r\n\r\n", RequestConfig::default(), store);
        let session = req.session().unwrap();
        assert_ne!(session.id(), "stale");
        assert_eq!(req.cookies().len(), 2);
    }

    #[test]
    fn cookies_disabled() {
        let config = RequestConfig { disable_cookie: true, ..RequestConfig::default() };
        let req = decode(b"GET / HTTP/1.1\r\nCookie: a=1\r\n\r\n", config, Arc::new(MemorySessionStore::new()));
        assert!(req.cookies().is_empty());
        assert!(req.session().is_none());
    }

    #[test]
    fn attributes_are_shared() {
        let req = request("GET / HTTP/1.1\r\n\r\n");
        req.attributes().insert("user", 7_u8);
        assert_eq!(req.attributes().get::<u8>("user").as_deref(), Some(&7));
    }

    #[test]
    fn body_access() {
        let req = request("POST /p HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        let mut s = String::new();
        req.input_stream().unwrap().read_to_string(&mut s).unwrap();
        assert_eq!(s, "hello");
        assert_eq!(req.body_bytes(2).unwrap(), "llo");
        assert!(matches!(req.input_bytes(), Err(RequestError::BodyNotRecorded)));
    }

    #[test]
    fn recorded_request_bytes() {
        let raw = "PUT /p HTTP/1.1\r\nContent-Length: 12\r\n\r\nspilled body";
        let config = RequestConfig { record_request_body: true, ..RequestConfig::default() };
        let req = decode(raw.as_bytes(), config, Arc::new(MemorySessionStore::new()));
        assert!(req.body().is_spilled());
        assert_eq!(req.input_bytes().unwrap(), raw.as_bytes());

        let RequestBody::File { path, .. } = req.body() else { unreachable!() };
        assert!(path.exists());
        req.delete_temp_files();
        assert!(!path.exists());
        req.delete_temp_files();
    }

    #[test]
    fn form_body_params() {
        let body = "name=micro+poll&tags=a%2Cb&from=body";
        let raw = format!(
            "POST /submit?from=query HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let req = request(&raw);
        assert!(req.body().is_spilled());

        assert_eq!(req.param("name"), Some("micro poll"));
        assert_eq!(req.param("tags"), Some("a,b"));
        assert_eq!(req.params().get_all("from"), ["query", "body"]);
        assert_eq!(req.decoded_params().len(), 3);
    }

    const UPLOAD: &str = "--b\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\n50%+off\r\n\
                          --b\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x.bin\"\r\n\r\nDATA\r\n--b--\r\n";

    fn upload_request(body: &str, config: RequestConfig) -> HttpRequest {
        let raw = format!(
            "POST /up?id=3 HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=b\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        decode(raw.as_bytes(), config, Arc::new(MemorySessionStore::new()))
    }

    #[test]
    fn multipart_from_spilled_body() {
        let dir = tempfile::tempdir().unwrap();
        let config = RequestConfig { temp_dir: Some(dir.path().to_path_buf()), ..RequestConfig::default() };
        let req = upload_request(UPLOAD, config);
        assert!(req.body().is_spilled());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        req.resolve_form().unwrap();
        // text fields are taken as sent
        assert_eq!(req.param("note"), Some("50%+off"));
        assert_eq!(req.param_int("id").unwrap(), 3);

        let upload = req.file("f").unwrap();
        assert_eq!(upload.file_name(), "x.bin");
        assert_eq!(std::fs::read(upload.path()).unwrap(), b"DATA");
        assert!(upload.path().starts_with(dir.path()));

        let path = upload.path().to_path_buf();
        req.delete_temp_files();
        assert!(!path.exists());
    }

    #[test]
    fn form_is_parsed_once() {
        let req = upload_request(UPLOAD, RequestConfig::default());
        req.resolve_form().unwrap();
        let first = req.file("f").unwrap().path().to_path_buf();
        req.resolve_form().unwrap();
        assert_eq!(req.files().len(), 1);
        assert_eq!(req.file("f").unwrap().path(), first);
        req.delete_temp_files();
    }

    #[test]
    fn malformed_multipart_keeps_query() {
        let req = upload_request("--b\r\nno headers end", RequestConfig::default());
        let err = req.resolve_form().unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::BAD_REQUEST);

        assert_eq!(req.param("id"), Some("3"));
        assert!(req.files().is_empty());
    }
}
