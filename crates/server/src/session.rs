//! Server-side sessions addressed by a cookie.
//!
//! The store itself is a collaborator behind [`SessionStore`]; the broker only
//! reads and writes a few small typed values through a request-scoped
//! [`Session`] handle.

use crate::cache::ExpiringMap;
use crate::error::SsoError;
use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use axum_extra::extract::CookieJar;
use cookie::{Cookie, SameSite};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const SESSION_COOKIE: &str = "sso_sid";

/// Local user id of the signed-in user.
pub const SESSION_USER: &str = "sso.user";
/// Name of the upstream provider the current session was established through.
pub const SESSION_PROVIDER: &str = "sso.provider";

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str, key: &str) -> Option<Value>;
    async fn set(&self, session_id: &str, key: &str, value: Value);
    async fn clear(&self, session_id: &str);
}

/// In-process session store; sessions expire after `idle_ttl` without writes.
#[derive(Clone)]
pub struct MemorySessionStore {
    sessions: ExpiringMap<String, HashMap<String, Value>>,
}

impl MemorySessionStore {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: ExpiringMap::new(idle_ttl, Duration::from_secs(60)),
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.sessions.purge_expired()
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(8 * 3600))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str, key: &str) -> Option<Value> {
        self.sessions
            .get(&session_id.to_string())
            .and_then(|values| values.get(key).cloned())
    }

    async fn set(&self, session_id: &str, key: &str, value: Value) {
        self.sessions.upsert(session_id.to_string(), |values| {
            values.insert(key.to_string(), value);
        });
    }

    async fn clear(&self, session_id: &str) {
        self.sessions.invalidate(&session_id.to_string());
    }
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

struct SessionId {
    value: String,
    /// Set once the id must be (re)sent to the browser.
    issue_cookie: bool,
}

/// Request-scoped handle to the caller's session.
///
/// Clones share the id, so a [`Session::renew`] through one clone is seen by
/// every other clone of the same handle.
#[derive(Clone)]
pub struct Session {
    id: Arc<Mutex<SessionId>>,
    store: Arc<dyn SessionStore>,
}

impl Session {
    pub fn new(id: String, store: Arc<dyn SessionStore>) -> Self {
        Self {
            id: Arc::new(Mutex::new(SessionId {
                value: id,
                issue_cookie: false,
            })),
            store,
        }
    }

    fn current(&self) -> MutexGuard<'_, SessionId> {
        self.id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> String {
        self.current().value.clone()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let id = self.id();
        let value = self.store.get(&id, key).await?;
        serde_json::from_value(value).ok()
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SsoError> {
        let value = serde_json::to_value(value)
            .map_err(|e| SsoError::Internal(format!("session value: {e}")))?;
        let id = self.id();
        self.store.set(&id, key, value).await;
        Ok(())
    }

    pub async fn clear(&self) {
        let id = self.id();
        self.store.clear(&id).await;
    }

    /// Move the caller to a fresh session id and drop everything stored under
    /// the old one. Called whenever a user signs in.
    pub async fn renew(&self) {
        let old = {
            let mut current = self.current();
            current.issue_cookie = true;
            std::mem::replace(&mut current.value, new_session_id())
        };
        self.store.clear(&old).await;
    }

    /// Id of the signed-in local user, if any.
    pub async fn user_id(&self) -> Option<String> {
        self.get::<String>(SESSION_USER).await
    }

    /// Add the session cookie to `jar` when this request issued a new id.
    pub fn attach(&self, jar: CookieJar) -> CookieJar {
        let current = self.current();
        if !current.issue_cookie {
            return jar;
        }
        jar.add(
            Cookie::build((SESSION_COOKIE, current.value.clone()))
                .http_only(true)
                .same_site(SameSite::Lax)
                .path("/")
                .build(),
        )
    }

    /// Tell the browser to drop the session cookie.
    pub fn detach(jar: CookieJar) -> CookieJar {
        jar.remove(Cookie::build(SESSION_COOKIE).path("/"))
    }
}

impl<S> FromRequestParts<S> for Session
where
    Arc<dyn SessionStore>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let store = Arc::<dyn SessionStore>::from_ref(state);
        let jar = CookieJar::from_headers(&parts.headers);
        let id = jar
            .get(SESSION_COOKIE)
            .map(|cookie| cookie.value())
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(new_session_id);
        Ok(Session::new(id, store))
    }
}
