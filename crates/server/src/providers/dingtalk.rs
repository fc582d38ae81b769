//! DingTalk login.
//!
//! Browsers get the QR-connect page; DingTalk's own in-app browser (detected
//! through its user agent) gets the silent `snsapi_auth` flow instead. The
//! code is exchanged through a signed `getuserinfo_bycode` call. When the
//! enterprise app key and secret are provisioned as parameters, the login is
//! enriched with the employee profile of the organisation.

use super::template::{self, parse_response};
use super::{Provider, UpstreamIdentity};
use crate::cache::TokenSlot;
use crate::config::{ProviderConfig, endpoint_declared};
use crate::error::SsoError;
use crate::identity::ParameterService;
use crate::sso::context::RequestContext;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_SERVER: &str = "https://oapi.dingtalk.com/";
const QR_CONNECT: &str = "connect/qrconnect?appid={key}&response_type=code&scope=snsapi_login&state={state}&redirect_uri={redirect}";
const IN_APP: &str = "connect/oauth2/sns_authorize?appid={key}&response_type=code&scope=snsapi_auth&state={state}&redirect_uri={redirect}";
const USER_INFO_BY_CODE: &str =
    "sns/getuserinfo_bycode?accessKey={key}&timestamp={timestamp}&signature={signature}";
const CORP_TOKEN: &str = "gettoken?appkey={appkey}&appsecret={appsecret}";
const USERID_BY_UNIONID: &str = "user/getUseridByUnionid?access_token={token}&unionid={unionid}";
const USER_DETAIL: &str = "user/get?access_token={token}&userid={userid}";

/// Parameter category holding the enterprise app credentials.
pub const PARAMETER_CATEGORY: &str = "DingTalk";

const CORP_TOKEN_TTL: Duration = Duration::from_secs(7200);
const CORP_TOKEN_MARGIN: Duration = Duration::from_secs(60);

pub struct DingTalkProvider {
    config: ProviderConfig,
    http: reqwest::Client,
    corp_token: TokenSlot,
}

impl DingTalkProvider {
    pub fn new(mut config: ProviderConfig, http: reqwest::Client) -> Self {
        if config.server.is_empty() {
            config.server = DEFAULT_SERVER.into();
        }
        Self {
            config,
            http,
            corp_token: TokenSlot::new(CORP_TOKEN_TTL, CORP_TOKEN_MARGIN),
        }
    }

    fn is_in_app(ctx: &RequestContext) -> bool {
        ctx.user_agent.contains("DingTalk")
    }

    fn expand(&self, template: &str, vars: &[(&str, &str)]) -> Result<String, SsoError> {
        let mut all = vec![("key", self.config.app_id.as_str())];
        all.extend_from_slice(vars);
        template::expand(template, &self.config.server, &all)
    }

    async fn get_fields(&self, url: &str) -> Result<HashMap<String, String>, SsoError> {
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let fields = parse_response(&body);
        template::check_errcode(&fields)?;
        Ok(fields)
    }

    async fn load_corp_token(&self, params: &ParameterService) -> Result<Option<String>, SsoError> {
        let app_key = params.value(PARAMETER_CATEGORY, "appkey").await?;
        let app_secret = params.value(PARAMETER_CATEGORY, "appsecret").await?;
        let (Some(app_key), Some(app_secret)) = (app_key, app_secret) else {
            tracing::debug!("DingTalk enterprise credentials not provisioned");
            return Ok(None);
        };

        let url = self.expand(
            CORP_TOKEN,
            &[("appkey", app_key.as_str()), ("appsecret", app_secret.as_str())],
        )?;
        let fields = self.get_fields(&url).await?;
        Ok(template::first(&fields, &["access_token"]).map(String::from))
    }

    async fn enrich_from_corp(
        &self,
        identity: &mut UpstreamIdentity,
        params: &ParameterService,
    ) -> Result<(), SsoError> {
        let Some(union_id) = identity.union_id.clone().filter(|u| !u.is_empty()) else {
            return Ok(());
        };
        let Some(token) = self
            .corp_token
            .get_or_refresh(|| self.load_corp_token(params))
            .await?
        else {
            return Ok(());
        };

        // Fails for users outside the organisation
        let url = self.expand(
            USERID_BY_UNIONID,
            &[("token", token.as_str()), ("unionid", union_id.as_str())],
        )?;
        let fields = self.get_fields(&url).await?;
        let Some(user_id) = template::first(&fields, &["userid"]).map(String::from) else {
            return Ok(());
        };

        let url = self.expand(
            USER_DETAIL,
            &[("token", token.as_str()), ("userid", user_id.as_str())],
        )?;
        let detail = self.get_fields(&url).await?;

        if identity.user_name.is_empty() {
            identity.user_name = user_id.clone();
        }
        if let Some(name) = template::first(&detail, &["name"]) {
            identity.nick_name = Some(name.to_string());
        }
        if let Some(mobile) = template::first(&detail, &["mobile"]) {
            identity.mobile = Some(mobile.to_string());
        }
        if let Some(mail) = template::first(&detail, &["email", "orgemail"]) {
            identity.mail = Some(mail.to_string());
        }
        if let Some(avatar) = template::first(&detail, &["avatar"]) {
            identity.avatar = Some(avatar.to_string());
        }
        identity.extra.insert("userid".into(), user_id);
        Ok(())
    }
}

/// Base64 HMAC-SHA256 of the millisecond timestamp, keyed by the app secret.
pub fn sign(timestamp: &str, secret: &str) -> Result<String, SsoError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SsoError::Internal("invalid DingTalk secret".into()))?;
    mac.update(timestamp.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl Provider for DingTalkProvider {
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
        ctx: &RequestContext,
    ) -> Result<String, SsoError> {
        let template = if Self::is_in_app(ctx) {
            IN_APP
        } else if !self.config.authorize_url.is_empty() {
            self.config.authorize_url.as_str()
        } else {
            QR_CONNECT
        };
        self.expand(template, &[("redirect", redirect_uri), ("state", state)])
    }

    fn has_access_token_endpoint(&self) -> bool {
        // Empty selects the built-in `getuserinfo_bycode` call
        self.config.access_token_url.is_empty() || endpoint_declared(&self.config.access_token_url)
    }

    #[tracing::instrument(skip(self, code), fields(provider = %self.config.name))]
    async fn exchange_token(
        &self,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<UpstreamIdentity, SsoError> {
        let timestamp = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).to_string();
        let signature = sign(&timestamp, &self.config.secret)?;
        let url = self.expand(
            USER_INFO_BY_CODE,
            &[("timestamp", timestamp.as_str()), ("signature", signature.as_str())],
        )?;

        let body = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "tmp_auth_code": code }))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let fields = parse_response(&body);

        let mut identity = UpstreamIdentity {
            raw: Some(body),
            ..Default::default()
        };
        template::check_errcode(&fields)?;
        identity.absorb(&fields);
        Ok(identity)
    }

    fn has_open_id_endpoint(&self) -> bool {
        false
    }

    async fn fetch_open_id(&self, _identity: &mut UpstreamIdentity) -> Result<(), SsoError> {
        Ok(())
    }

    fn has_profile_endpoint(&self) -> bool {
        false
    }

    async fn fetch_profile(&self, _identity: &mut UpstreamIdentity) -> Result<(), SsoError> {
        Ok(())
    }

    async fn enrich(&self, identity: &mut UpstreamIdentity, params: &ParameterService) {
        if let Err(e) = self.enrich_from_corp(identity, params).await {
            tracing::warn!(
                provider = %self.config.name,
                union_id = ?identity.union_id,
                error = %e,
                "DingTalk enterprise enrichment skipped"
            );
        }
    }

    fn logout_url(&self, return_url: &str, state: &str) -> Option<String> {
        if self.config.logout_url.is_empty() {
            return None;
        }
        self.expand(
            &self.config.logout_url,
            &[("redirect", return_url), ("state", state)],
        )
        .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::identity::tests::setup_test_db;
    use crate::providers::tests::provider_config;
    use axum::http::{HeaderMap, HeaderValue, header};
    use url::Url;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &str) -> DingTalkProvider {
        DingTalkProvider::new(
            provider_config("DingTalk", ProviderKind::DingTalk, server),
            reqwest::Client::new(),
        )
    }

    fn base() -> Url {
        Url::parse("https://sso.example.com").unwrap()
    }

    #[test]
    fn signature_is_base64_hmac_of_timestamp() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        assert_eq!(
            sign("The quick brown fox jumps over the lazy dog", "key").unwrap(),
            "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg="
        );
    }

    #[test]
    fn token_exchange_can_be_switched_off() {
        assert!(provider("").has_access_token_endpoint());

        let mut config = provider_config("DingTalk", ProviderKind::DingTalk, "");
        config.access_token_url = "none".into();
        let dingtalk = DingTalkProvider::new(config, reqwest::Client::new());
        assert!(!dingtalk.has_access_token_endpoint());
    }

    #[test]
    fn switches_to_in_app_flow_for_dingtalk_browser() {
        let dingtalk = provider("");

        let desktop = RequestContext::new(base());
        let url = dingtalk.authorize_url("https://sso.example.com/cb", "DingTalk", &desktop).unwrap();
        assert!(url.starts_with("https://oapi.dingtalk.com/connect/qrconnect?appid=app-key"));
        assert!(url.contains("scope=snsapi_login"));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 (iPhone) AliApp(DingTalk/7.0.0)"),
        );
        let in_app = RequestContext::from_headers(&headers, base());
        let url = dingtalk.authorize_url("https://sso.example.com/cb", "DingTalk", &in_app).unwrap();
        assert!(url.starts_with("https://oapi.dingtalk.com/connect/oauth2/sns_authorize?"));
        assert!(url.contains("scope=snsapi_auth"));
    }

    #[tokio::test]
    async fn exchanges_temporary_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sns/getuserinfo_bycode"))
            .and(query_param("accessKey", "app-key"))
            .and(body_json(serde_json::json!({ "tmp_auth_code": "tmp-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 0,
                "errmsg": "ok",
                "user_info": { "nick": "Ann", "unionid": "union-1", "openid": "open-1" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let identity = provider(&server.uri()).exchange_token("tmp-1", "").await.unwrap();
        assert_eq!(identity.open_id, "open-1");
        assert_eq!(identity.union_id.as_deref(), Some("union-1"));
        assert_eq!(identity.nick_name.as_deref(), Some("Ann"));
        assert!(identity.has_identity_signal());
    }

    #[tokio::test]
    async fn exchange_error_code_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sns/getuserinfo_bycode"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 40078, "errmsg": "temporary code expired"
            })))
            .mount(&server)
            .await;

        let err = provider(&server.uri()).exchange_token("old", "").await.unwrap_err();
        assert!(matches!(err, SsoError::UpstreamApi { code: 40078, .. }));
    }

    #[tokio::test]
    async fn enrichment_without_credentials_is_a_no_op() {
        let params = ParameterService::new(setup_test_db().await);
        let mut identity = UpstreamIdentity {
            open_id: "open-1".into(),
            union_id: Some("union-1".into()),
            ..Default::default()
        };

        provider("http://127.0.0.1:9").enrich(&mut identity, &params).await;
        assert!(identity.extra.is_empty());
        // Empty rows are provisioned for the operator to fill in
        assert_eq!(params.value(PARAMETER_CATEGORY, "appkey").await.unwrap(), None);
    }

    #[tokio::test]
    async fn enrichment_resolves_employee_profile_and_caches_corp_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gettoken"))
            .and(query_param("appkey", "corp-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 0, "access_token": "corp-token", "expires_in": 7200
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/user/getUseridByUnionid"))
            .and(query_param("access_token", "corp-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 0, "userid": "emp-7"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/user/get"))
            .and(query_param("userid", "emp-7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 0, "name": "Ann Lee", "mobile": "13800000000",
                "email": "ann@corp.example.com", "avatar": "https://static/ann.png"
            })))
            .mount(&server)
            .await;

        let params = provisioned_params().await;

        let dingtalk = provider(&server.uri());
        for _ in 0..2 {
            let mut identity = UpstreamIdentity {
                open_id: "open-1".into(),
                union_id: Some("union-1".into()),
                ..Default::default()
            };
            dingtalk.enrich(&mut identity, &params).await;

            assert_eq!(identity.user_name, "emp-7");
            assert_eq!(identity.nick_name.as_deref(), Some("Ann Lee"));
            assert_eq!(identity.mail.as_deref(), Some("ann@corp.example.com"));
            assert_eq!(identity.extra.get("userid").map(String::as_str), Some("emp-7"));
        }
    }

    #[tokio::test]
    async fn enrichment_errors_are_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gettoken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 0, "access_token": "corp-token"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/user/getUseridByUnionid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 60121, "errmsg": "user not in organisation"
            })))
            .mount(&server)
            .await;

        let params = provisioned_params().await;

        let mut identity = UpstreamIdentity {
            open_id: "open-1".into(),
            union_id: Some("outsider".into()),
            nick_name: Some("Guest".into()),
            ..Default::default()
        };
        provider(&server.uri()).enrich(&mut identity, &params).await;
        assert_eq!(identity.nick_name.as_deref(), Some("Guest"));
        assert!(identity.user_name.is_empty());
    }

    async fn provisioned_params() -> ParameterService {
        use sea_orm::{ActiveModelTrait, ActiveValue::Set};

        let db = setup_test_db().await;
        let params = ParameterService::new(db.clone());
        for (name, value) in [("appkey", "corp-key"), ("appsecret", "corp-secret")] {
            let row = params.get_or_create(PARAMETER_CATEGORY, name).await.unwrap();
            let mut active: crate::entity::sso_parameter::ActiveModel = row.into();
            active.value = Set(Some(value.to_string()));
            active.update(db.as_ref()).await.unwrap();
        }
        params
    }
}
