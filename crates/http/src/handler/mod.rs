//! The collaborator seams of request execution.
//!
//! [`RequestListener`]s are told when a request is created and destroyed.
//! [`Interceptors`] run in registration order after the creation listeners and
//! may stop the chain by returning `Ok(false)`. Both see the request and its
//! response, and either may write the response.

use std::error::Error;
use std::fmt;

use crate::protocol::{HttpRequest, HttpResponse};

mod request_handler;
pub use request_handler::RequestHandler;

pub type BoxError = Box<dyn Error + Send + Sync>;

pub trait Interceptor: Send + Sync {
    /// Returns `Ok(false)` to skip the interceptors after this one.
    fn intercept(&self, request: &HttpRequest, response: &HttpResponse) -> Result<bool, BoxError>;
}

impl<F> Interceptor for F
where
    F: Fn(&HttpRequest, &HttpResponse) -> Result<bool, BoxError> + Send + Sync,
{
    fn intercept(&self, request: &HttpRequest, response: &HttpResponse) -> Result<bool, BoxError> {
        (self)(request, response)
    }
}

pub trait RequestListener: Send + Sync {
    /// Called once, before the interceptors run.
    fn create(&self, _request: &HttpRequest, _response: &HttpResponse) {}

    /// Called exactly once, when the request completes or its connection dies.
    fn destroy(&self, _request: &HttpRequest, _response: &HttpResponse) {}
}

/// An ordered interceptor chain.
pub struct Interceptors {
    inner: Vec<Box<dyn Interceptor>>,
}

impl Interceptors {
    pub fn builder() -> InterceptorsBuilder {
        InterceptorsBuilder::new()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Runs the chain until an interceptor stops it or fails.
    ///
    /// Returns whether every interceptor ran.
    pub fn run(&self, request: &HttpRequest, response: &HttpResponse) -> Result<bool, BoxError> {
        for interceptor in &self.inner {
            if !interceptor.intercept(request, response)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Default for Interceptors {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptors").field("len", &self.inner.len()).finish()
    }
}

pub struct InterceptorsBuilder {
    inner: Vec<Box<dyn Interceptor>>,
}

impl InterceptorsBuilder {
    fn new() -> Self {
        Self { inner: vec![] }
    }

    pub fn add_last<I: Interceptor + 'static>(mut self, interceptor: I) -> Self {
        self.inner.push(Box::new(interceptor));
        self
    }

    pub fn add_first<I: Interceptor + 'static>(mut self, interceptor: I) -> Self {
        self.inner.insert(0, Box::new(interceptor));
        self
    }

    pub fn build(self) -> Interceptors {
        Interceptors { inner: self.inner }
    }
}

impl fmt::Debug for InterceptorsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorsBuilder").field("len", &self.inner.len()).finish()
    }
}
