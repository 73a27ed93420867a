//! Request parameters collected from the query string and form bodies.
//!
//! The map is filled from `application/x-www-form-urlencoded` text with
//! `serde_urlencoded`, and from the text fields of multipart bodies. The
//! request builds it on the worker, once, the first time it is needed.

use std::collections::HashMap;

use crate::protocol::{ParseError, RequestError};

/// Parameter name to decoded values, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct ParamMap {
    inner: HashMap<String, Vec<String>>,
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends every pair of an urlencoded string. Pairs without `=` get an
    /// empty value.
    pub fn extend_urlencoded(&mut self, encoded: &[u8]) -> Result<(), ParseError> {
        let pairs: Vec<(String, String)> =
            serde_urlencoded::from_bytes(encoded).map_err(|e| ParseError::invalid_body(e.to_string()))?;
        for (key, value) in pairs {
            self.push(key, value);
        }
        Ok(())
    }

    pub(crate) fn push(&mut self, key: String, value: String) {
        self.inner.entry(key).or_default().push(value);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    /// The first value of `key`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.inner.get(key).and_then(|values| values.first()).map(String::as_str)
    }

    /// Every value of `key`.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.inner.get(key).map_or(&[], Vec::as_slice)
    }

    /// Parses the first value of `key` as an integer, 0 when absent.
    pub fn get_int(&self, key: &str) -> Result<i64, RequestError> {
        match self.get_str(key).map(str::trim) {
            None | Some("") => Ok(0),
            Some(value) => value.parse::<i64>().map_err(|e| RequestError::invalid_param(key, value, e)),
        }
    }

    /// Parses the first value of `key` as a boolean, false when absent.
    ///
    /// Accepts `true`/`on`/`1` and `false`/`off`/`0`, ignoring case.
    pub fn get_bool(&self, key: &str) -> Result<bool, RequestError> {
        let value = match self.get_str(key).map(str::trim) {
            None | Some("") => return Ok(false),
            Some(value) => value,
        };
        if ["true", "on", "1"].iter().any(|t| value.eq_ignore_ascii_case(t)) {
            Ok(true)
        } else if ["false", "off", "0"].iter().any(|t| value.eq_ignore_ascii_case(t)) {
            Ok(false)
        } else {
            Err(RequestError::invalid_param(key, value, "expected one of true/false/on/off/1/0"))
        }
    }

    pub fn as_map(&self) -> &HashMap<String, Vec<String>> {
        &self.inner
    }
}
