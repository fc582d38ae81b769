//! Identity federation broker.
//!
//! Signs users in through external OAuth2-style providers (GitHub-like
//! services, DingTalk, or another broker instance), maps those identities to
//! local accounts, and in turn acts as a minimal OAuth2 authorization server
//! for downstream subsystems.

use std::sync::Arc;

use axum::extract::FromRef;
use axum::http::HeaderMap;
use sea_orm::DatabaseConnection;
use url::Url;

use crate::config::AppConfig;
use crate::error::SsoError;
use crate::identity::{ClientService, IdentityService, ParameterService};
use crate::providers::ProviderRegistry;
use crate::session::SessionStore;
use crate::sso::context::RequestContext;
use crate::sso::downstream::AuthorizationServer;
use crate::sso::upstream::UpstreamBroker;

pub mod api;
pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod identity;
pub mod providers;
pub mod session;
pub mod sso;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub upstream: Arc<UpstreamBroker>,
    pub downstream: Arc<AuthorizationServer>,
    pub sessions: Arc<dyn SessionStore>,
    pub base_url: Url,
}

impl AppContext {
    /// Wire up providers and services from a validated configuration.
    pub fn new(
        config: AppConfig,
        db: Arc<DatabaseConnection>,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Self, SsoError> {
        let providers = ProviderRegistry::from_config(&config.providers)?;
        Self::with_providers(config, db, sessions, providers)
    }

    pub fn with_providers(
        config: AppConfig,
        db: Arc<DatabaseConnection>,
        sessions: Arc<dyn SessionStore>,
        providers: ProviderRegistry,
    ) -> Result<Self, SsoError> {
        let base_url = config
            .base_url()
            .map_err(|e| SsoError::Internal(e.to_string()))?;
        tracing::info!(
            providers = ?providers.names().collect::<Vec<_>>(),
            %base_url,
            "Configured upstream providers"
        );

        let upstream = UpstreamBroker::new(
            providers,
            IdentityService::new(db.clone()),
            ParameterService::new(db.clone()),
            config.sso.clone(),
        );
        let downstream = AuthorizationServer::new(
            ClientService::new(db.clone()),
            IdentityService::new(db),
            &config.downstream,
        );

        Ok(Self {
            config: Arc::new(config),
            upstream: Arc::new(upstream),
            downstream: Arc::new(downstream),
            sessions,
            base_url,
        })
    }

    pub fn request_context(&self, headers: &HeaderMap) -> RequestContext {
        RequestContext::from_headers(headers, self.base_url.clone())
    }
}

impl FromRef<AppContext> for Arc<dyn SessionStore> {
    fn from_ref(ctx: &AppContext) -> Self {
        ctx.sessions.clone()
    }
}
