//! Upstream identity providers.
//!
//! Every provider exposes the same capability surface through [`Provider`].
//! Variant quirks (in-app browser detection, enterprise enrichment) stay
//! inside the variant, so the callback orchestration never branches on which
//! provider it is talking to.

pub mod broker;
pub mod dingtalk;
pub mod generic;
pub mod template;

use crate::config::{ProviderConfig, ProviderKind, endpoint_declared};
use crate::error::SsoError;
use crate::identity::ParameterService;
use crate::sso::context::RequestContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use dingtalk::DingTalkProvider;
pub use generic::GenericProvider;

/// What an upstream provider told us about the user so far.
#[derive(Clone, Debug, Default)]
pub struct UpstreamIdentity {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub open_id: String,
    pub union_id: Option<String>,
    pub user_id: i64,
    pub user_name: String,
    pub nick_name: Option<String>,
    pub mail: Option<String>,
    pub mobile: Option<String>,
    pub avatar: Option<String>,
    /// Provider specific values, e.g. an enterprise employee id.
    pub extra: HashMap<String, String>,
    /// Last raw response body, kept for diagnostics.
    pub raw: Option<String>,
}

impl UpstreamIdentity {
    /// Whether the exchange produced anything that identifies a user.
    pub fn has_identity_signal(&self) -> bool {
        !self.access_token.is_empty()
            || !self.open_id.is_empty()
            || self.user_id != 0
            || !self.user_name.is_empty()
    }

    /// Stable external subject used as the link key.
    pub fn subject(&self) -> Option<String> {
        if !self.open_id.is_empty() {
            return Some(self.open_id.clone());
        }
        if let Some(union_id) = self.union_id.as_ref().filter(|u| !u.is_empty()) {
            return Some(union_id.clone());
        }
        if self.user_id > 0 {
            return Some(self.user_id.to_string());
        }
        (!self.user_name.is_empty()).then(|| self.user_name.clone())
    }

    /// Copy recognised fields from a decoded response. Values already set
    /// are only replaced by non-empty ones.
    pub fn absorb(&mut self, fields: &HashMap<String, String>) {
        use template::first;

        if let Some(v) = first(fields, &["access_token"]) {
            self.access_token = v.to_string();
        }
        if let Some(v) = first(fields, &["refresh_token"]) {
            self.refresh_token = Some(v.to_string());
        }
        if let Some(v) = first(fields, &["expires_in"]).and_then(|v| v.parse().ok()) {
            self.expires_in = Some(v);
        }
        if let Some(v) = first(fields, &["openid", "open_id"]) {
            self.open_id = v.to_string();
        }
        if let Some(v) = first(fields, &["unionid", "union_id"]) {
            self.union_id = Some(v.to_string());
        }
        if let Some(v) = first(fields, &["uid", "userid", "user_id", "id"])
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v != 0)
        {
            self.user_id = v;
        }
        if let Some(v) = first(fields, &["username", "user_name", "login"]) {
            self.user_name = v.to_string();
        }
        if let Some(v) = first(fields, &["nickname", "nick", "name", "display_name"]) {
            self.nick_name = Some(v.to_string());
        }
        if let Some(v) = first(fields, &["email", "mail"]) {
            self.mail = Some(v.to_string());
        }
        if let Some(v) = first(fields, &["mobile", "phone"]) {
            self.mobile = Some(v.to_string());
        }
        if let Some(v) = first(fields, &["avatar", "avatar_url", "avatarurl", "headimgurl"]) {
            self.avatar = Some(v.to_string());
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &ProviderConfig;

    /// External authorize URL. Must not have side effects.
    fn authorize_url(
        &self,
        redirect_uri: &str,
        state: &str,
        ctx: &RequestContext,
    ) -> Result<String, SsoError>;

    fn has_access_token_endpoint(&self) -> bool {
        endpoint_declared(&self.config().access_token_url)
    }

    /// Exchange the callback code. `redirect_uri` must equal the one used for
    /// [`Provider::authorize_url`].
    async fn exchange_token(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<UpstreamIdentity, SsoError>;

    fn has_open_id_endpoint(&self) -> bool {
        endpoint_declared(&self.config().open_id_url)
    }

    async fn fetch_open_id(&self, identity: &mut UpstreamIdentity) -> Result<(), SsoError>;

    fn has_profile_endpoint(&self) -> bool {
        endpoint_declared(&self.config().user_info_url)
    }

    async fn fetch_profile(&self, identity: &mut UpstreamIdentity) -> Result<(), SsoError>;

    /// Best-effort extra profile data. Never fails the login.
    async fn enrich(&self, _identity: &mut UpstreamIdentity, _params: &ParameterService) {}

    /// Provider-side logout redirect, if the provider has one.
    fn logout_url(&self, return_url: &str, state: &str) -> Option<String>;
}

/// Enabled providers by name, built once at start-up.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    /// Build adapters for every enabled configured provider.
    pub fn from_config(configs: &[ProviderConfig]) -> Result<Self, SsoError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("sso-broker/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(15))
            .build()?;

        let providers = configs
            .iter()
            .filter(|c| c.enabled)
            .map(|c| -> Arc<dyn Provider> {
                match c.kind {
                    ProviderKind::Generic => Arc::new(GenericProvider::new(c.clone(), http.clone())),
                    ProviderKind::Broker => Arc::new(broker::provider(c, http.clone())),
                    ProviderKind::DingTalk => Arc::new(DingTalkProvider::new(c.clone(), http.clone())),
                }
            })
            .collect::<Vec<_>>();

        tracing::info!(
            providers = ?providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "Loaded identity providers"
        );
        Ok(Self { providers })
    }

    /// Case-insensitive lookup. An empty name selects the default (first)
    /// provider.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        let name = name.trim();
        if name.is_empty() {
            return self.providers.first().cloned();
        }
        self.providers
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// The only provider, when exactly one is enabled.
    pub fn sole(&self) -> Option<Arc<dyn Provider>> {
        match self.providers.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.name())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn provider_config(name: &str, kind: ProviderKind, server: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            kind,
            server: server.into(),
            app_id: "app-key".into(),
            secret: "app-secret".into(),
            authorize_url: String::new(),
            access_token_url: String::new(),
            open_id_url: String::new(),
            user_info_url: String::new(),
            logout_url: String::new(),
            scope: String::new(),
            enabled: true,
        }
    }

    #[test]
    fn identity_signal_and_subject() {
        let mut identity = UpstreamIdentity::default();
        assert!(!identity.has_identity_signal());
        assert_eq!(identity.subject(), None);

        identity.access_token = "t".into();
        assert!(identity.has_identity_signal());
        assert_eq!(identity.subject(), None);

        identity.user_id = 42;
        assert_eq!(identity.subject().as_deref(), Some("42"));
        identity.union_id = Some("u1".into());
        assert_eq!(identity.subject().as_deref(), Some("u1"));
        identity.open_id = "o1".into();
        assert_eq!(identity.subject().as_deref(), Some("o1"));
    }

    #[test]
    fn absorb_maps_common_field_aliases() {
        let fields = template::parse_response(
            r#"{"access_token":"t1","uid":"17","login":"ann","name":"Ann","avatar_url":"https://a/1.png","email":"ann@example.com"}"#,
        );
        let mut identity = UpstreamIdentity::default();
        identity.absorb(&fields);

        assert_eq!(identity.access_token, "t1");
        assert_eq!(identity.user_id, 17);
        assert_eq!(identity.user_name, "ann");
        assert_eq!(identity.nick_name.as_deref(), Some("Ann"));
        assert_eq!(identity.mail.as_deref(), Some("ann@example.com"));
        assert_eq!(identity.avatar.as_deref(), Some("https://a/1.png"));
    }

    #[test]
    fn absorb_keeps_existing_values_on_empty_fields() {
        let mut identity = UpstreamIdentity {
            access_token: "t1".into(),
            ..Default::default()
        };
        identity.absorb(&template::parse_response(r#"{"access_token":"","openid":"o1"}"#));
        assert_eq!(identity.access_token, "t1");
        assert_eq!(identity.open_id, "o1");
    }

    #[test]
    fn registry_lookup() {
        let mut disabled = provider_config("Off", ProviderKind::Generic, "https://off.example.com");
        disabled.enabled = false;
        let registry = ProviderRegistry::from_config(&[
            provider_config("GitHub", ProviderKind::Generic, "https://github.example.com"),
            provider_config("DingTalk", ProviderKind::DingTalk, ""),
            disabled,
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("github").unwrap().name(), "GitHub");
        assert_eq!(registry.get("DINGTALK").unwrap().name(), "DingTalk");
        assert_eq!(registry.get("").unwrap().name(), "GitHub");
        assert!(registry.get("off").is_none());
        assert!(registry.get("unknown").is_none());
        assert!(registry.sole().is_none());
    }
}
