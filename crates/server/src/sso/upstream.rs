//! Signing in through an upstream provider.
//!
//! The callback (`login_info`) walks a fixed sequence: decode state, guard
//! against missing or replayed codes, exchange the code, enrich and complete
//! the profile, resolve the local account, then establish the session.

use super::context::RequestContext;
use super::state::OAuthState;
use crate::cache::ReplayGuard;
use crate::config::SsoConfig;
use crate::entity::sso_user;
use crate::error::SsoError;
use crate::identity::{IdentityService, LinkParams, NewUser, ParameterService};
use crate::providers::{Provider, ProviderRegistry, UpstreamIdentity};
use crate::session::{SESSION_PROVIDER, SESSION_USER, Session};
use std::sync::Arc;
use std::time::Duration;

pub const LOGIN_PATH: &str = "/sso/login";
pub const CALLBACK_PATH: &str = "/sso/login_info";

/// Result of an upstream callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// A local session was established.
    SignedIn { user_id: String, redirect: String },
    /// The code was missing or already used; start over at the provider.
    Retry { redirect: String },
}

impl CallbackOutcome {
    pub fn redirect(&self) -> &str {
        match self {
            CallbackOutcome::SignedIn { redirect, .. } | CallbackOutcome::Retry { redirect } => {
                redirect
            }
        }
    }
}

pub struct UpstreamBroker {
    providers: ProviderRegistry,
    replay: ReplayGuard,
    identities: IdentityService,
    params: ParameterService,
    config: SsoConfig,
}

/// Callback URL registered with providers. The return target rides along as
/// `r` so the exact same URL can be rebuilt when exchanging the code.
pub fn callback_uri(ctx: &RequestContext, return_url: Option<&str>) -> String {
    match return_url {
        Some(r) => ctx.absolute(&format!("{CALLBACK_PATH}?r={}", urlencoding::encode(r))),
        None => ctx.absolute(CALLBACK_PATH),
    }
}

/// `base` with `r=<target>` appended to its query.
pub fn append_return(base: &str, target: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}r={}", urlencoding::encode(target))
}

impl UpstreamBroker {
    pub fn new(
        providers: ProviderRegistry,
        identities: IdentityService,
        params: ParameterService,
        config: SsoConfig,
    ) -> Self {
        let replay = ReplayGuard::new(
            Duration::from_secs(config.code_cache_ttl_secs),
            Duration::from_secs(config.code_cache_period_secs),
        );
        Self {
            providers,
            replay,
            identities,
            params,
            config,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn replay_guard(&self) -> &ReplayGuard {
        &self.replay
    }

    pub fn config(&self) -> &SsoConfig {
        &self.config
    }

    fn provider(&self, name: &str) -> Result<Arc<dyn Provider>, SsoError> {
        self.providers
            .get(name)
            .ok_or_else(|| SsoError::NotFound(format!("provider `{name}`")))
    }

    fn authorize(
        &self,
        provider: &dyn Provider,
        state: &OAuthState,
        return_url: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<String, SsoError> {
        let redirect = callback_uri(ctx, return_url);
        provider.authorize_url(&redirect, &state.encode(), ctx)
    }

    /// Where to send a browser that needs to sign in locally before coming
    /// back to `return_to`.
    ///
    /// Without local login and with a single provider the login page would
    /// only offer that provider, so go there directly.
    pub fn login_redirect(&self, return_to: &str) -> String {
        if !self.config.allow_local_login
            && let Some(provider) = self.providers.sole()
        {
            let login = format!("{LOGIN_PATH}?name={}", urlencoding::encode(provider.name()));
            return append_return(&login, return_to);
        }
        append_return(&self.config.login_url, return_to)
    }

    /// Authorize URL of provider `name`.
    #[tracing::instrument(skip(self, ctx))]
    pub fn login(
        &self,
        name: &str,
        caller_state: Option<String>,
        return_url: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<String, SsoError> {
        let provider = self.provider(name)?;
        let state = OAuthState::new(provider.name(), caller_state);
        let return_url = ctx.safe_return_url(return_url.or(ctx.referer.as_deref()));
        self.authorize(provider.as_ref(), &state, return_url.as_deref(), ctx)
    }

    /// Handle the provider redirecting back with `code` and `state`.
    #[tracing::instrument(skip_all, fields(state = raw_state))]
    pub async fn callback(
        &self,
        code: Option<&str>,
        raw_state: &str,
        return_url: Option<&str>,
        session: &Session,
        ctx: &RequestContext,
    ) -> Result<CallbackOutcome, SsoError> {
        let state = OAuthState::decode(raw_state);
        let provider = self.provider(&state.provider)?;
        let code = code.map(str::trim).unwrap_or_default();
        let return_url = ctx.safe_return_url(return_url);

        tracing::info!(
            provider = provider.name(),
            code,
            caller_state = ?state.caller_state,
            "Upstream callback"
        );

        if code.is_empty() {
            if state.is_refresh() {
                return Err(SsoError::InvalidRequest(
                    "provider returned no code after a retry".into(),
                ));
            }
            return self.retry(provider.as_ref(), return_url.as_deref(), ctx);
        }

        if !self.replay.first_use(code) {
            tracing::warn!(provider = provider.name(), code, "Callback code already used");
            return self.retry(provider.as_ref(), return_url.as_deref(), ctx);
        }

        let redirect_uri = callback_uri(ctx, return_url.as_deref());
        let mut identity = if provider.has_access_token_endpoint() {
            let identity = provider.exchange_token(code, &redirect_uri).await?;
            if !identity.has_identity_signal() {
                tracing::error!(
                    provider = provider.name(),
                    code,
                    %redirect_uri,
                    raw = identity.raw.as_deref().unwrap_or_default(),
                    "Token exchange yielded no identity"
                );
                return Err(SsoError::UpstreamAuthFailure(format!(
                    "no access token for code {code}"
                )));
            }
            identity
        } else {
            // The code is the only credential such providers hand out
            UpstreamIdentity {
                access_token: code.to_string(),
                ..Default::default()
            }
        };

        provider.enrich(&mut identity, &self.params).await;
        if provider.has_open_id_endpoint() {
            provider.fetch_open_id(&mut identity).await?;
        }
        if provider.has_profile_endpoint() {
            provider.fetch_profile(&mut identity).await?;
        }

        let user = self
            .resolve_user(provider.as_ref(), &identity, state.is_bind(), session)
            .await?;

        session.renew().await;
        session.set(SESSION_USER, &user.id).await?;
        session.set(SESSION_PROVIDER, &provider.name()).await?;
        self.identities.touch_login(&user.id).await?;

        tracing::info!(
            provider = provider.name(),
            user_id = %user.id,
            user = %user.name,
            "Signed in through upstream provider"
        );

        Ok(CallbackOutcome::SignedIn {
            user_id: user.id,
            redirect: return_url.unwrap_or_else(|| self.config.success_url.clone()),
        })
    }

    fn retry(
        &self,
        provider: &dyn Provider,
        return_url: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<CallbackOutcome, SsoError> {
        let state = OAuthState::refresh(provider.name());
        Ok(CallbackOutcome::Retry {
            redirect: self.authorize(provider, &state, return_url, ctx)?,
        })
    }

    /// Find or create the local account behind an upstream identity and make
    /// sure the link is recorded.
    async fn resolve_user(
        &self,
        provider: &dyn Provider,
        identity: &UpstreamIdentity,
        bind: bool,
        session: &Session,
    ) -> Result<sso_user::Model, SsoError> {
        let subject = identity.subject().ok_or_else(|| {
            SsoError::UpstreamAuthFailure("provider returned no stable user id".into())
        })?;
        let current = session.user_id().await;
        if bind && current.is_none() {
            return Err(SsoError::Unauthenticated(
                "sign in before linking an account".into(),
            ));
        }

        let mut registered = false;
        let mut user = match self
            .identities
            .find_enabled_link(provider.name(), &subject)
            .await?
        {
            Some(link) => {
                if bind && current.as_deref().is_some_and(|c| c != link.user_id) {
                    return Err(SsoError::InvalidRequest(format!(
                        "this {} account is already linked to another user",
                        provider.name()
                    )));
                }
                self.identities.find_user(&link.user_id).await?.ok_or_else(|| {
                    SsoError::Unauthenticated("linked account no longer exists".into())
                })?
            }
            None => match current {
                Some(user_id) => self.identities.find_user(&user_id).await?.ok_or_else(|| {
                    SsoError::Unauthenticated("session user no longer exists".into())
                })?,
                None if self.config.auto_register || !self.config.allow_local_login => {
                    registered = true;
                    self.register(provider, identity, &subject).await?
                }
                None => {
                    return Err(SsoError::Unauthenticated(format!(
                        "no local account is linked to this {} account; sign in and bind it first",
                        provider.name()
                    )));
                }
            },
        };

        if !user.enabled {
            return Err(SsoError::Unauthenticated(format!(
                "account {} is disabled",
                user.name
            )));
        }

        let link = self
            .identities
            .link_identity(LinkParams {
                user_id: &user.id,
                provider: provider.name(),
                open_id: &subject,
                union_id: identity.union_id.as_deref(),
                name: identity
                    .nick_name
                    .as_deref()
                    .or(Some(identity.user_name.as_str()).filter(|n| !n.is_empty())),
                avatar: identity.avatar.as_deref(),
                access_token: Some(identity.access_token.as_str()).filter(|t| !t.is_empty()),
                refresh_token: identity.refresh_token.as_deref(),
            })
            .await?;

        if link.user_id != user.id {
            // A concurrent callback linked this identity first
            if !registered {
                return Err(SsoError::InvalidRequest(format!(
                    "this {} account is already linked to another user",
                    provider.name()
                )));
            }
            tracing::info!(
                provider = provider.name(),
                dropped = %user.id,
                user_id = %link.user_id,
                "Identity linked concurrently, adopting the existing account"
            );
            self.identities.delete_user(&user.id).await?;
            user = self.identities.find_user(&link.user_id).await?.ok_or_else(|| {
                SsoError::Unauthenticated("linked account no longer exists".into())
            })?;
            if !user.enabled {
                return Err(SsoError::Unauthenticated(format!(
                    "account {} is disabled",
                    user.name
                )));
            }
        }

        Ok(user)
    }

    async fn register(
        &self,
        provider: &dyn Provider,
        identity: &UpstreamIdentity,
        subject: &str,
    ) -> Result<sso_user::Model, SsoError> {
        let fallback = format!("{}_{}", provider.name(), subject);
        let name = [identity.user_name.as_str(), identity.nick_name.as_deref().unwrap_or_default()]
            .into_iter()
            .find(|n| !n.is_empty())
            .unwrap_or(&fallback);

        let user = self
            .identities
            .register_user(NewUser {
                name,
                display_name: identity.nick_name.as_deref(),
                mail: identity.mail.as_deref(),
                mobile: identity.mobile.as_deref(),
                avatar: identity.avatar.as_deref(),
                registered_from: Some(provider.name()),
            })
            .await?;
        Ok(user)
    }

    /// Start linking another provider account to the signed-in user.
    #[tracing::instrument(skip(self, session, ctx))]
    pub async fn bind(
        &self,
        name: &str,
        session: &Session,
        ctx: &RequestContext,
    ) -> Result<String, SsoError> {
        if session.user_id().await.is_none() {
            return Err(SsoError::Unauthenticated("sign in before linking an account".into()));
        }
        let provider = self.provider(name)?;
        let return_url = ctx.safe_return_url(ctx.referer.as_deref());
        self.authorize(
            provider.as_ref(),
            &OAuthState::bind(provider.name()),
            return_url.as_deref(),
            ctx,
        )
    }

    /// Disable the signed-in user's links to `name`; returns where to go next.
    #[tracing::instrument(skip(self, session, ctx))]
    pub async fn unbind(
        &self,
        name: &str,
        session: &Session,
        ctx: &RequestContext,
    ) -> Result<String, SsoError> {
        let user_id = session
            .user_id()
            .await
            .ok_or_else(|| SsoError::Unauthenticated("sign in before unlinking an account".into()))?;
        if name.trim().is_empty() {
            return Err(SsoError::InvalidRequest("provider name is required".into()));
        }

        let disabled = self.identities.disable_links(&user_id, name.trim()).await?;
        tracing::info!(%user_id, provider = name, disabled, "Unlinked provider account");

        Ok(ctx
            .safe_return_url(ctx.referer.as_deref())
            .unwrap_or_else(|| "/".to_string()))
    }

    /// Clear the session and decide where the browser goes: through the
    /// provider's logout when global logout is on, else straight back.
    #[tracing::instrument(skip(self, session, ctx))]
    pub async fn logout(
        &self,
        session: &Session,
        return_url: Option<&str>,
        caller_state: Option<String>,
        ctx: &RequestContext,
    ) -> String {
        let provider_name = session
            .get::<String>(SESSION_PROVIDER)
            .await
            .filter(|n| !n.is_empty());
        session.clear().await;

        let target = ctx
            .safe_return_url(return_url)
            .unwrap_or_else(|| self.config.success_url.clone());

        if self.config.logout_all
            && let Some(provider) = provider_name.and_then(|n| self.providers.get(&n))
        {
            let state = OAuthState::new(provider.name(), caller_state).encode();
            if let Some(url) = provider.logout_url(&ctx.absolute(&target), &state) {
                tracing::info!(provider = provider.name(), "Redirecting to provider logout");
                return url;
            }
        }

        target
    }
}
