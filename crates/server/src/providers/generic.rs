//! Plain OAuth2 provider driven by URL templates.

use super::template::{self, parse_response};
use super::{Provider, UpstreamIdentity};
use crate::config::{ProviderConfig, endpoint_declared};
use crate::error::SsoError;
use crate::sso::context::RequestContext;
use async_trait::async_trait;

const DEFAULT_AUTHORIZE: &str =
    "oauth/authorize?client_id={key}&redirect_uri={redirect}&response_type=code&scope={scope}&state={state}";
const DEFAULT_ACCESS_TOKEN: &str = "oauth/access_token?client_id={key}&client_secret={secret}&code={code}&grant_type=authorization_code&redirect_uri={redirect}";

pub struct GenericProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl GenericProvider {
    /// Empty authorize and token templates fall back to the usual
    /// `oauth/authorize` and `oauth/access_token` paths below `server`.
    /// `none` keeps the token endpoint switched off.
    pub fn new(mut config: ProviderConfig, http: reqwest::Client) -> Self {
        if config.authorize_url.is_empty() {
            config.authorize_url = DEFAULT_AUTHORIZE.into();
        }
        if config.access_token_url.is_empty() {
            config.access_token_url = DEFAULT_ACCESS_TOKEN.into();
        }
        Self { config, http }
    }

    fn expand(&self, template: &str, vars: &[(&str, &str)]) -> Result<String, SsoError> {
        let mut all = vec![
            ("key", self.config.app_id.as_str()),
            ("secret", self.config.secret.as_str()),
            ("scope", self.config.scope.as_str()),
        ];
        all.extend_from_slice(vars);
        template::expand(template, &self.config.server, &all)
    }

    async fn get(&self, url: &str) -> Result<String, SsoError> {
        let body = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }

    /// GET an expanded template and fold the answer into `identity`.
    async fn fetch_into(
        &self,
        template: &str,
        identity: &mut UpstreamIdentity,
    ) -> Result<(), SsoError> {
        let user_id = identity.user_id.to_string();
        let url = self.expand(
            template,
            &[
                ("token", identity.access_token.as_str()),
                ("openid", identity.open_id.as_str()),
                ("userid", user_id.as_str()),
            ],
        )?;
        let body = self.get(&url).await?;
        let fields = parse_response(&body);
        identity.raw = Some(body);
        template::check_errcode(&fields)?;
        identity.absorb(&fields);
        Ok(())
    }
}

#[async_trait]
impl Provider for GenericProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn authorize_url(
        &self,
        redirect_uri: &str,
        state: &str,
        _ctx: &RequestContext,
    ) -> Result<String, SsoError> {
        self.expand(
            &self.config.authorize_url,
            &[("redirect", redirect_uri), ("state", state)],
        )
    }

    #[tracing::instrument(skip(self, code), fields(provider = %self.config.name))]
    async fn exchange_token(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<UpstreamIdentity, SsoError> {
        let url = self.expand(
            &self.config.access_token_url,
            &[("code", code), ("redirect", redirect_uri)],
        )?;
        let body = self.get(&url).await?;
        let fields = parse_response(&body);

        let mut identity = UpstreamIdentity::default();
        identity.absorb(&fields);
        identity.raw = Some(body);
        template::check_errcode(&fields)?;
        Ok(identity)
    }

    async fn fetch_open_id(&self, identity: &mut UpstreamIdentity) -> Result<(), SsoError> {
        let template = self.config.open_id_url.clone();
        self.fetch_into(&template, identity).await
    }

    async fn fetch_profile(&self, identity: &mut UpstreamIdentity) -> Result<(), SsoError> {
        let template = self.config.user_info_url.clone();
        self.fetch_into(&template, identity).await
    }

    fn logout_url(&self, return_url: &str, state: &str) -> Option<String> {
        if !endpoint_declared(&self.config.logout_url) {
            return None;
        }
        self.expand(
            &self.config.logout_url,
            &[("redirect", return_url), ("state", state)],
        )
        .inspect_err(|e| tracing::warn!(provider = %self.config.name, error = %e, "Bad logout url"))
        .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::providers::tests::provider_config;
    use url::Url;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> RequestContext {
        RequestContext::new(Url::parse("https://sso.example.com").unwrap())
    }

    #[test]
    fn default_authorize_url() {
        let provider = GenericProvider::new(
            provider_config("generic", ProviderKind::Generic, "https://id.example.com"),
            reqwest::Client::new(),
        );
        let url = provider
            .authorize_url("https://sso.example.com/sso/login_info", "generic_xyz", &ctx())
            .unwrap();
        assert_eq!(
            url,
            "https://id.example.com/oauth/authorize?client_id=app-key&redirect_uri=https%3A%2F%2Fsso.example.com%2Fsso%2Flogin_info&response_type=code&scope=&state=generic_xyz"
        );
        assert!(provider.has_access_token_endpoint());
        assert!(!provider.has_open_id_endpoint());
        assert!(provider.logout_url("/", "generic").is_none());
    }

    #[test]
    fn none_switches_endpoints_off() {
        let mut config = provider_config("generic", ProviderKind::Generic, "https://id.example.com");
        config.access_token_url = "none".into();
        config.logout_url = "NONE".into();
        config.user_info_url = "api/user?access_token={token}".into();
        let provider = GenericProvider::new(config, reqwest::Client::new());

        assert_eq!(provider.config().access_token_url, "none");
        assert!(!provider.has_access_token_endpoint());
        assert!(provider.has_profile_endpoint());
        assert!(provider.logout_url("/", "generic").is_none());
    }

    #[tokio::test]
    async fn exchanges_code_and_fetches_profile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/access_token"))
            .and(query_param("code", "abc"))
            .and(query_param("client_secret", "app-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "access_token=tok-1&expires_in=3600&refresh_token=ref-1",
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/user"))
            .and(query_param("access_token", "tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 99,
                "login": "octo",
                "name": "Octo Cat",
                "email": "octo@example.com"
            })))
            .mount(&server)
            .await;

        let mut config = provider_config("generic", ProviderKind::Generic, &server.uri());
        config.user_info_url = "api/user?access_token={token}".into();
        let provider = GenericProvider::new(config, reqwest::Client::new());

        let mut identity = provider
            .exchange_token("abc", "https://sso.example.com/sso/login_info")
            .await
            .unwrap();
        assert_eq!(identity.access_token, "tok-1");
        assert_eq!(identity.refresh_token.as_deref(), Some("ref-1"));
        assert_eq!(identity.expires_in, Some(3600));

        assert!(provider.has_profile_endpoint());
        provider.fetch_profile(&mut identity).await.unwrap();
        assert_eq!(identity.user_id, 99);
        assert_eq!(identity.user_name, "octo");
        assert_eq!(identity.subject().as_deref(), Some("99"));
    }

    #[tokio::test]
    async fn http_failure_surfaces_as_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/access_token"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = GenericProvider::new(
            provider_config("generic", ProviderKind::Generic, &server.uri()),
            reqwest::Client::new(),
        );
        let err = provider.exchange_token("abc", "https://x/").await.unwrap_err();
        assert!(matches!(err, SsoError::Upstream(_)));
    }
}
