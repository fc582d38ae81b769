use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Which adapter implementation a configured provider uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Plain OAuth2 provider driven entirely by URL templates.
    #[default]
    Generic,
    /// DingTalk, with in-app fast login and enterprise profile enrichment.
    DingTalk,
    /// Another instance of this broker acting as the upstream.
    Broker,
}

/// One external identity provider.
///
/// URL templates may be absolute or relative to `server` and understand the
/// placeholders `{key}`, `{secret}`, `{redirect}`, `{state}`, `{scope}`,
/// `{code}`, `{token}`, `{openid}` and `{userid}`. Empty templates fall back to
/// the defaults of the provider kind; [`NO_ENDPOINT`] turns an endpoint off.
/// A provider whose `access_token_url` is `none` hands the identity over in the
/// callback itself and the callback code is used as the access token.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default)]
    pub server: String,
    /// Client id / app key registered with the provider
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub authorize_url: String,
    #[serde(default)]
    pub access_token_url: String,
    #[serde(default)]
    pub open_id_url: String,
    #[serde(default)]
    pub user_info_url: String,
    #[serde(default)]
    pub logout_url: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Template value declaring that the provider has no such endpoint.
pub const NO_ENDPOINT: &str = "none";

/// Whether a URL template names an endpoint to call.
pub fn endpoint_declared(template: &str) -> bool {
    let template = template.trim();
    !template.is_empty() && !template.eq_ignore_ascii_case(NO_ENDPOINT)
}

#[derive(Clone, Debug, Deserialize)]
pub struct SsoConfig {
    /// Interactive local login page. Receives the return target as `r`.
    #[serde(default = "default_login_url")]
    pub login_url: String,
    /// Where to land after login/logout when no return URL was supplied.
    #[serde(default = "default_success_url")]
    pub success_url: String,
    #[serde(default = "default_true")]
    pub allow_local_login: bool,
    /// Create a local account when an unknown external identity signs in.
    #[serde(default = "default_true")]
    pub auto_register: bool,
    /// Also sign out of the upstream provider on logout.
    #[serde(default)]
    pub logout_all: bool,
    #[serde(default = "default_code_cache_ttl")]
    pub code_cache_ttl_secs: u64,
    #[serde(default = "default_code_cache_period")]
    pub code_cache_period_secs: u64,
}

impl Default for SsoConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            success_url: default_success_url(),
            allow_local_login: true,
            auto_register: true,
            logout_all: false,
            code_cache_ttl_secs: default_code_cache_ttl(),
            code_cache_period_secs: default_code_cache_period(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DownstreamConfig {
    #[serde(default = "default_code_lifetime")]
    pub code_lifetime_secs: u64,
    #[serde(default = "default_access_token_lifetime")]
    pub access_token_lifetime_secs: u64,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            code_lifetime_secs: default_code_lifetime(),
            access_token_lifetime_secs: default_access_token_lifetime(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Absolute external base URL of this broker, e.g. `https://sso.example.com`.
    pub public_url: String,
    #[serde(default)]
    pub sso: SsoConfig,
    #[serde(default)]
    pub downstream: DownstreamConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl AppConfig {
    /// Checks the invariants `serde` cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = Url::parse(&self.public_url)
            .map_err(|e| ConfigError::Validation(format!("public_url is not a URL: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ConfigError::Validation(
                "public_url must be an absolute http(s) URL".into(),
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            let name = provider.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Validation("provider name must not be empty".into()));
            }
            if !seen.insert(name.to_lowercase()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate provider name: {name}"
                )));
            }
        }

        if self.sso.code_cache_period_secs == 0 {
            return Err(ConfigError::Validation(
                "sso.code_cache_period_secs must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// The parsed `public_url`. Only valid after [`AppConfig::validate`].
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.public_url).map_err(|e| ConfigError::Validation(e.to_string()))
    }
}

fn default_true() -> bool {
    true
}

fn default_login_url() -> String {
    "/login".into()
}

fn default_success_url() -> String {
    "/".into()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".into()
}

fn default_code_cache_ttl() -> u64 {
    600
}

fn default_code_cache_period() -> u64 {
    60
}

fn default_code_lifetime() -> u64 {
    600
}

fn default_access_token_lifetime() -> u64 {
    7200
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Any environment variable matching the key path separated by double
/// underscores (e.g. `SSO__LOGOUT_ALL`) overrides the file value.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name("config.yaml"))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;

    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            kind: ProviderKind::Generic,
            server: String::new(),
            app_id: String::new(),
            secret: String::new(),
            authorize_url: String::new(),
            access_token_url: String::new(),
            open_id_url: String::new(),
            user_info_url: String::new(),
            logout_url: String::new(),
            scope: String::new(),
            enabled: true,
        }
    }

    fn config() -> AppConfig {
        AppConfig {
            database_url: "sqlite::memory:".into(),
            listen_addr: default_listen_addr(),
            public_url: "https://sso.example.com".into(),
            sso: SsoConfig::default(),
            downstream: DownstreamConfig::default(),
            providers: vec![provider("github")],
        }
    }

    #[test]
    fn accepts_minimal_config() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn rejects_relative_public_url() {
        let mut cfg = config();
        cfg.public_url = "/sso".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_duplicate_provider_names_ignoring_case() {
        let mut cfg = config();
        cfg.providers.push(provider("GitHub"));
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_blank_provider_name() {
        let mut cfg = config();
        cfg.providers.push(provider("  "));
        assert!(cfg.validate().is_err());
    }
}
