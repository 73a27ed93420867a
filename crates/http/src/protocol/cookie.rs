use std::fmt;

/// One cookie, either received in a `Cookie` header or minted by the server.
///
/// Server-minted cookies are `fresh` and get sent back as `Set-Cookie`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    path: Option<String>,
    http_only: bool,
    fresh: bool,
}

impl Cookie {
    /// A new cookie to be sent to the client.
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self { name: name.into(), value: value.into(), path: None, http_only: false, fresh: true }
    }

    pub fn with_path<P: Into<String>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    /// Parses the `name=value` pairs of a `Cookie` request header, skipping
    /// malformed pairs.
    pub fn parse_header(header: &str) -> Vec<Cookie> {
        header
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                let value = value.trim().trim_matches('"');
                Some(Cookie {
                    name: name.to_string(),
                    value: value.to_string(),
                    path: None,
                    http_only: false,
                    fresh: false,
                })
            })
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn is_http_only(&self) -> bool {
        self.http_only
    }

    /// Whether the cookie was created while handling this request.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// The value of a `Set-Cookie` header for this cookie.
    pub fn to_set_cookie(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(path) = &self.path {
            write!(f, "; Path={path}")?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_header() {
        let cookies = Cookie::parse_header("SESSIONID=abc-123; theme=\"dark\"; broken; =nameless; empty=");

        assert_eq!(cookies.len(), 3);
        assert_eq!(cookies[0].name(), "SESSIONID");
        assert_eq!(cookies[0].value(), "abc-123");
        assert_eq!(cookies[1].value(), "dark");
        assert_eq!(cookies[2].value(), "");
        assert!(cookies.iter().all(|c| !c.is_fresh()));
    }

    #[test]
    fn set_cookie_value() {
        let cookie = Cookie::new("SESSIONID", "id").with_path("/").with_http_only(true);
        assert!(cookie.is_fresh());
        assert_eq!(cookie.to_set_cookie(), "SESSIONID=id; Path=/; HttpOnly");
        assert_eq!(Cookie::new("a", "b").to_set_cookie(), "a=b");
    }
}
