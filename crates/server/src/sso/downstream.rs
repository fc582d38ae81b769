//! Authorization server for downstream subsystems.
//!
//! A subsystem sends its user to `authorize`, which parks the request under
//! a random key. Once a local session exists the key is resolved into a
//! one-time code bound to the subsystem's redirect URI. The subsystem then
//! trades the code for an access token server-to-server and uses the token to
//! read the user's profile.
//!
//! Pending requests, codes and tokens live in memory only.

use super::upstream::UpstreamBroker;
use crate::cache::ExpiringMap;
use crate::config::DownstreamConfig;
use crate::error::SsoError;
use crate::identity::{ClientService, IdentityService};
use crate::session::Session;
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use time::OffsetDateTime;
use url::Url;
use utoipa::ToSchema;

pub const AUTH2_PATH: &str = "/sso/auth2";
const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";

/// A parked `authorize` request.
#[derive(Clone, Debug)]
pub struct PendingAuthorization {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub created_at: OffsetDateTime,
    /// Set once the request is resolved for a signed-in user.
    pub user_id: Option<String>,
}

#[derive(Clone, Debug)]
struct IssuedToken {
    user_id: String,
    client_id: String,
}

/// Query of the downstream `authorize` call.
#[derive(Clone, Debug, Default)]
pub struct AuthorizeParams<'a> {
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub response_type: Option<&'a str>,
    pub scope: Option<&'a str>,
    pub state: Option<&'a str>,
}

/// Where the browser goes after `authorize` or `auth2`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthorizeOutcome {
    /// Back to the subsystem with `code` and `state`.
    CodeIssued { redirect: String },
    /// No local session yet; sign in first and come back to `auth2`.
    NeedsLogin { redirect: String, key: u64 },
}

impl AuthorizeOutcome {
    pub fn redirect(&self) -> &str {
        match self {
            AuthorizeOutcome::CodeIssued { redirect }
            | AuthorizeOutcome::NeedsLogin { redirect, .. } => redirect,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct TokenEnvelope {
    pub access_token: String,
    pub expires_in: u64,
    pub refresh_token: String,
    pub openid: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct UserInfo {
    pub userid: String,
    pub username: String,
    pub nickname: Option<String>,
    pub mail: Option<String>,
    pub mobile: Option<String>,
    pub avatar: Option<String>,
    pub openid: String,
}

pub struct AuthorizationServer {
    clients: ClientService,
    identities: IdentityService,
    pending: ExpiringMap<u64, PendingAuthorization>,
    codes: ExpiringMap<String, PendingAuthorization>,
    tokens: ExpiringMap<String, IssuedToken>,
    access_token_lifetime: Duration,
}

/// 32 random bytes, URL-safe base64.
fn generate_token() -> Result<String, SsoError> {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes)
        .map_err(|e| SsoError::Internal(format!("random source failed: {e}")))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Random key in `1..=i64::MAX`, so it survives any signed integer parsing.
fn generate_key() -> Result<u64, SsoError> {
    let mut bytes = [0u8; 8];
    getrandom::fill(&mut bytes)
        .map_err(|e| SsoError::Internal(format!("random source failed: {e}")))?;
    Ok((u64::from_le_bytes(bytes) >> 1).max(1))
}

/// Per-client user identifier: hex SHA-256 of `client_id:user_id`.
pub fn pairwise_openid(client_id: &str, user_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_id.as_bytes());
    hasher.update(b":");
    hasher.update(user_id.as_bytes());
    hex::encode(hasher.finalize())
}

fn required<'a>(value: &'a str, name: &str) -> Result<&'a str, SsoError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SsoError::InvalidRequest(format!("{name} is required")));
    }
    Ok(value)
}

impl AuthorizationServer {
    pub fn new(clients: ClientService, identities: IdentityService, config: &DownstreamConfig) -> Self {
        let code_lifetime = Duration::from_secs(config.code_lifetime_secs);
        let sweep = Duration::from_secs(60);
        Self {
            clients,
            identities,
            pending: ExpiringMap::new(code_lifetime, sweep),
            codes: ExpiringMap::new(code_lifetime, sweep),
            tokens: ExpiringMap::new(Duration::from_secs(config.access_token_lifetime_secs), sweep),
            access_token_lifetime: Duration::from_secs(config.access_token_lifetime_secs),
        }
    }

    /// Validate an `authorize` request and park it. Returns the pending key.
    #[tracing::instrument(skip(self))]
    pub async fn register(&self, params: AuthorizeParams<'_>) -> Result<u64, SsoError> {
        let client_id = required(params.client_id, "client_id")?;
        let redirect_uri = required(params.redirect_uri, "redirect_uri")?;
        let response_type = params
            .response_type
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("code");
        if !response_type.eq_ignore_ascii_case("code") {
            return Err(SsoError::Unsupported(format!("response_type {response_type}")));
        }

        let app = self
            .clients
            .find_enabled(client_id)
            .await?
            .ok_or_else(|| SsoError::NotFound(format!("client {client_id}")))?;
        if Url::parse(redirect_uri).is_err() || !app.is_redirect_uri_allowed(redirect_uri) {
            return Err(SsoError::InvalidRequest(format!(
                "redirect_uri not allowed for client {client_id}"
            )));
        }

        let pending = PendingAuthorization {
            client_id: client_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            scope: params.scope.map(String::from),
            state: params.state.map(String::from),
            created_at: OffsetDateTime::now_utc(),
            user_id: None,
        };
        loop {
            let key = generate_key()?;
            if self.pending.try_insert(key, pending.clone()) {
                tracing::debug!(key, client_id, "Parked authorization request");
                return Ok(key);
            }
        }
    }

    /// Turn a pending key into a one-time code for `user_id` and build the
    /// redirect back to the subsystem. A key resolves at most once.
    #[tracing::instrument(skip(self))]
    pub fn resolve(&self, key: u64, user_id: &str) -> Result<String, SsoError> {
        let mut pending = self.pending.take(&key).ok_or_else(|| {
            SsoError::InvalidGrant(format!("authorization request {key} is unknown or expired"))
        })?;

        let mut redirect = Url::parse(&pending.redirect_uri)
            .map_err(|e| SsoError::InvalidRequest(format!("redirect_uri: {e}")))?;
        pending.user_id = Some(user_id.to_string());

        let code = loop {
            let code = generate_token()?;
            if self.codes.try_insert(code.clone(), pending.clone()) {
                break code;
            }
        };

        {
            let mut query = redirect.query_pairs_mut();
            query.append_pair("code", &code);
            if let Some(state) = &pending.state {
                query.append_pair("state", state);
            }
        }
        tracing::info!(client_id = %pending.client_id, user_id, "Issued authorization code");
        Ok(redirect.to_string())
    }

    /// `authorize`: park the request, then either finish it right away for a
    /// signed-in user or send the browser to log in first.
    pub async fn authorize(
        &self,
        params: AuthorizeParams<'_>,
        session: &Session,
        upstream: &UpstreamBroker,
    ) -> Result<AuthorizeOutcome, SsoError> {
        let key = self.register(params).await?;
        self.complete(key, session, upstream).await
    }

    /// `auth2`: resume a parked request after the user signed in.
    #[tracing::instrument(skip(self, session, upstream))]
    pub async fn complete(
        &self,
        key: u64,
        session: &Session,
        upstream: &UpstreamBroker,
    ) -> Result<AuthorizeOutcome, SsoError> {
        if key == 0 {
            return Err(SsoError::InvalidRequest("authorization key is required".into()));
        }

        match session.user_id().await {
            Some(user_id) => Ok(AuthorizeOutcome::CodeIssued {
                redirect: self.resolve(key, &user_id)?,
            }),
            None => {
                let resume = format!("{AUTH2_PATH}/{key}");
                Ok(AuthorizeOutcome::NeedsLogin {
                    redirect: upstream.login_redirect(&resume),
                    key,
                })
            }
        }
    }

    /// Server-to-server code exchange.
    #[tracing::instrument(skip(self, client_secret, code))]
    pub async fn access_token(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        grant_type: Option<&str>,
    ) -> Result<TokenEnvelope, SsoError> {
        let client_id = required(client_id, "client_id")?;
        let client_secret = required(client_secret, "client_secret")?;
        let code = required(code, "code")?;
        let grant_type = grant_type
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .unwrap_or(GRANT_AUTHORIZATION_CODE);
        if !grant_type.eq_ignore_ascii_case(GRANT_AUTHORIZATION_CODE) {
            return Err(SsoError::Unsupported(format!("grant_type {grant_type}")));
        }

        let app = self
            .clients
            .find_enabled(client_id)
            .await?
            .filter(|app| app.secret_matches(client_secret))
            .ok_or_else(|| SsoError::InvalidClient(format!("bad credentials for {client_id}")))?;

        let pending = self.codes.take(&code.to_string()).ok_or_else(|| {
            SsoError::InvalidGrant("code is unknown, expired or already used".into())
        })?;
        if pending.client_id != app.id {
            return Err(SsoError::InvalidGrant("code was issued to another client".into()));
        }
        let user_id = pending
            .user_id
            .ok_or_else(|| SsoError::InvalidGrant("code was never resolved".into()))?;

        let access_token = generate_token()?;
        self.tokens.insert(
            access_token.clone(),
            IssuedToken {
                user_id: user_id.clone(),
                client_id: app.id.clone(),
            },
        );

        tracing::info!(client_id, %user_id, "Issued access token");
        Ok(TokenEnvelope {
            access_token,
            expires_in: self.access_token_lifetime.as_secs(),
            refresh_token: generate_token()?,
            openid: pairwise_openid(&app.id, &user_id),
        })
    }

    /// Profile of the user behind `access_token`.
    pub async fn user_info(&self, access_token: &str) -> Result<UserInfo, SsoError> {
        let access_token = required(access_token, "access_token")?;
        let issued = self
            .tokens
            .get(&access_token.to_string())
            .ok_or_else(|| SsoError::InvalidToken("access token is unknown or expired".into()))?;

        let user = self
            .identities
            .find_user(&issued.user_id)
            .await?
            .filter(|u| u.enabled)
            .ok_or_else(|| SsoError::InvalidToken("user no longer exists".into()))?;

        Ok(UserInfo {
            openid: pairwise_openid(&issued.client_id, &user.id),
            userid: user.id,
            username: user.name,
            nickname: user.display_name,
            mail: user.mail,
            mobile: user.mobile,
            avatar: user.avatar,
        })
    }

    /// Drop expired pending requests, codes and tokens.
    pub fn purge_expired(&self) -> usize {
        self.pending.purge_expired() + self.codes.purge_expired() + self.tokens.purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SsoConfig;
    use crate::identity::tests::{insert_app, setup_test_db};
    use crate::identity::{NewUser, ParameterService};
    use crate::providers::ProviderRegistry;
    use crate::session::{MemorySessionStore, SESSION_USER, SessionStore};
    use std::collections::HashMap;
    use std::sync::Arc;

    struct Fixture {
        server: Arc<AuthorizationServer>,
        upstream: UpstreamBroker,
        store: Arc<dyn SessionStore>,
        user_id: String,
    }

    impl Fixture {
        async fn signed_in(&self, id: &str) -> Session {
            let session = Session::new(id.into(), self.store.clone());
            session.set(SESSION_USER, &self.user_id).await.unwrap();
            session
        }

        fn anonymous(&self, id: &str) -> Session {
            Session::new(id.into(), self.store.clone())
        }

        async fn code_for(&self, state: Option<&str>) -> String {
            let session = self.signed_in("code").await;
            let outcome = self
                .server
                .authorize(params(state), &session, &self.upstream)
                .await
                .unwrap();
            let url = Url::parse(outcome.redirect()).unwrap();
            let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
            query["code"].clone()
        }
    }

    fn params(state: Option<&str>) -> AuthorizeParams<'_> {
        AuthorizeParams {
            client_id: "crm",
            redirect_uri: "https://crm.example.com/callback",
            state,
            ..Default::default()
        }
    }

    async fn fixture() -> Fixture {
        let db = setup_test_db().await;
        insert_app(&db, "crm", "crm-secret", &["https://crm.example.com/"], true).await;
        insert_app(&db, "erp", "erp-secret", &[], true).await;

        let identities = IdentityService::new(db.clone());
        let user = identities
            .register_user(NewUser {
                name: "alice",
                display_name: Some("Alice"),
                mail: Some("alice@example.com"),
                ..Default::default()
            })
            .await
            .unwrap();

        Fixture {
            server: Arc::new(AuthorizationServer::new(
                ClientService::new(db.clone()),
                identities.clone(),
                &DownstreamConfig::default(),
            )),
            upstream: UpstreamBroker::new(
                ProviderRegistry::default(),
                identities,
                ParameterService::new(db),
                SsoConfig::default(),
            ),
            store: Arc::new(MemorySessionStore::default()),
            user_id: user.id,
        }
    }

    #[test]
    fn pairwise_openid_is_stable_per_client() {
        let a = pairwise_openid("crm", "u1");
        assert_eq!(a, pairwise_openid("crm", "u1"));
        assert_ne!(a, pairwise_openid("erp", "u1"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn keys_are_positive() {
        for _ in 0..100 {
            let key = generate_key().unwrap();
            assert!(key >= 1 && key <= i64::MAX as u64);
        }
    }

    #[tokio::test]
    async fn authorize_with_session_issues_code_and_echoes_state() {
        let f = fixture().await;
        let session = f.signed_in("s1").await;

        let outcome = f
            .server
            .authorize(params(Some("xyz 1")), &session, &f.upstream)
            .await
            .unwrap();
        let AuthorizeOutcome::CodeIssued { redirect } = outcome else {
            panic!("expected a code");
        };

        let url = Url::parse(&redirect).unwrap();
        assert!(redirect.starts_with("https://crm.example.com/callback?"));
        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert!(!query["code"].is_empty());
        assert_eq!(query["state"], "xyz 1");
    }

    #[tokio::test]
    async fn authorize_without_session_needs_login_then_completes() {
        let f = fixture().await;

        let outcome = f
            .server
            .authorize(params(None), &f.anonymous("s1"), &f.upstream)
            .await
            .unwrap();
        let AuthorizeOutcome::NeedsLogin { redirect, key } = outcome else {
            panic!("expected login redirect");
        };
        assert_eq!(redirect, format!("/login?r=%2Fsso%2Fauth2%2F{key}"));

        // Still anonymous: bounce again with the same key
        let again = f.server.complete(key, &f.anonymous("s1"), &f.upstream).await.unwrap();
        assert_eq!(again, AuthorizeOutcome::NeedsLogin { redirect, key });

        let done = f.server.complete(key, &f.signed_in("s1").await, &f.upstream).await.unwrap();
        assert!(matches!(done, AuthorizeOutcome::CodeIssued { .. }));
        assert!(!done.redirect().contains("state="));

        // A key resolves once
        let err = f.server.complete(key, &f.signed_in("s1").await, &f.upstream).await.unwrap_err();
        assert!(matches!(err, SsoError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn authorize_validates_input() {
        let f = fixture().await;
        let s = f.anonymous("s1");

        let missing = AuthorizeParams {
            client_id: "",
            ..params(None)
        };
        assert!(matches!(
            f.server.authorize(missing, &s, &f.upstream).await,
            Err(SsoError::InvalidRequest(_))
        ));

        let token = AuthorizeParams {
            response_type: Some("token"),
            ..params(None)
        };
        assert!(matches!(
            f.server.authorize(token, &s, &f.upstream).await,
            Err(SsoError::Unsupported(_))
        ));

        let unknown = AuthorizeParams {
            client_id: "nobody",
            ..params(None)
        };
        assert!(matches!(
            f.server.authorize(unknown, &s, &f.upstream).await,
            Err(SsoError::NotFound(_))
        ));

        let elsewhere = AuthorizeParams {
            redirect_uri: "https://evil.example.net/cb",
            ..params(None)
        };
        assert!(matches!(
            f.server.authorize(elsewhere, &s, &f.upstream).await,
            Err(SsoError::InvalidRequest(_))
        ));

        assert!(matches!(
            f.server.complete(0, &s, &f.upstream).await,
            Err(SsoError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn code_exchanges_once_for_token_and_profile() {
        let f = fixture().await;
        let code = f.code_for(Some("s")).await;

        let envelope = f
            .server
            .access_token("crm", "crm-secret", &code, None)
            .await
            .unwrap();
        assert_eq!(envelope.expires_in, 7200);
        assert_eq!(envelope.openid, pairwise_openid("crm", &f.user_id));
        assert!(!envelope.refresh_token.is_empty());

        let err = f
            .server
            .access_token("crm", "crm-secret", &code, Some("authorization_code"))
            .await
            .unwrap_err();
        assert!(matches!(err, SsoError::InvalidGrant(_)));

        let info = f.server.user_info(&envelope.access_token).await.unwrap();
        assert_eq!(info.userid, f.user_id);
        assert_eq!(info.username, "alice");
        assert_eq!(info.nickname.as_deref(), Some("Alice"));
        assert_eq!(info.openid, envelope.openid);
    }

    #[tokio::test]
    async fn exchange_rejects_bad_input() {
        let f = fixture().await;
        let code = f.code_for(None).await;

        assert!(matches!(
            f.server.access_token("crm", "crm-secret", "", None).await,
            Err(SsoError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.server.access_token("crm", "crm-secret", &code, Some("password")).await,
            Err(SsoError::Unsupported(_))
        ));
        assert!(matches!(
            f.server.access_token("crm", "wrong", &code, None).await,
            Err(SsoError::InvalidClient(_))
        ));
        assert!(matches!(
            f.server.access_token("crm", "crm-secret", "never-issued", None).await,
            Err(SsoError::InvalidGrant(_))
        ));

        // Failed client checks above must not burn the code
        assert!(f.server.access_token("crm", "crm-secret", &code, None).await.is_ok());
    }

    #[tokio::test]
    async fn code_is_bound_to_its_client() {
        let f = fixture().await;
        let code = f.code_for(None).await;
        assert!(matches!(
            f.server.access_token("erp", "erp-secret", &code, None).await,
            Err(SsoError::InvalidGrant(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_exchanges_yield_one_token() {
        let f = fixture().await;
        let code = f.code_for(None).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let server = f.server.clone();
            let code = code.clone();
            handles.push(tokio::spawn(async move {
                server.access_token("crm", "crm-secret", &code, None).await
            }));
        }

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert!(matches!(e, SsoError::InvalidGrant(_))),
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let f = fixture().await;
        assert!(matches!(
            f.server.user_info("nope").await,
            Err(SsoError::InvalidToken(_))
        ));
        assert!(matches!(
            f.server.user_info("").await,
            Err(SsoError::InvalidRequest(_))
        ));
    }
}
