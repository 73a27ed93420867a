//! Sessions and the store they live in.
//!
//! The request model only needs `get` and `put`; expiry and persistence are
//! up to the [`SessionStore`] implementation.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::protocol::Attributes;

/// A session bound to the client through the session cookie.
pub struct Session {
    id: String,
    created: Instant,
    values: Attributes,
}

impl Session {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self { id: id.into(), created: Instant::now(), values: Attributes::new() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Values stored in this session.
    pub fn values(&self) -> &Attributes {
        &self.values
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).field("values", &self.values).finish_non_exhaustive()
    }
}

/// Where sessions are kept between requests.
pub trait SessionStore: Send + Sync {
    fn get(&self, id: &str) -> Option<Arc<Session>>;

    fn put(&self, id: &str, session: Arc<Session>);
}

/// A process-wide in-memory [`SessionStore`].
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Arc<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn put(&self, id: &str, session: Arc<Session>) {
        self.sessions.insert(id.to_string(), session);
    }
}
