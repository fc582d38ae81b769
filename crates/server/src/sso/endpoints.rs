//! HTTP surface of the broker, mounted under `/sso`.
//!
//! Browser-facing endpoints answer with redirects and surface hard failures
//! through [`SsoError`]'s `IntoResponse`. `access_token` and `user_info` are
//! called server-to-server and always answer 200 with a JSON body.

use super::downstream::{AuthorizeParams, TokenEnvelope, UserInfo};
use crate::AppContext;
use crate::error::{ErrorPayload, SsoError};
use crate::session::Session;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Redirect,
};
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::{router::OpenApiRouter, routes};

/// Tag for OpenAPI documentation.
pub const SSO_TAG: &str = "Single Sign-On";

/// Creates the `/sso` router.
pub fn router(state: AppContext) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(login))
        .routes(routes!(login_info))
        .routes(routes!(logout))
        .routes(routes!(bind))
        .routes(routes!(unbind))
        .routes(routes!(authorize))
        .routes(routes!(auth2))
        .routes(routes!(access_token))
        .routes(routes!(user_info))
        .with_state(state)
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct LoginQuery {
    /// Provider name; empty selects the default provider
    pub name: Option<String>,
    /// Where to go after signing in
    pub r: Option<String>,
    /// Caller state to carry through the provider
    pub state: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub r: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct LogoutQuery {
    pub r: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ProviderQuery {
    /// Provider name
    pub id: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct AuthorizeQuery {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    /// Defaults to `code`, the only supported value
    pub response_type: Option<String>,
    pub scope: Option<String>,
    /// Returned verbatim with the code
    pub state: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct AccessTokenQuery {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code: Option<String>,
    /// Defaults to `authorization_code`, the only supported value
    pub grant_type: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct UserInfoQuery {
    pub access_token: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(untagged)]
pub enum TokenReply {
    Token(TokenEnvelope),
    Error(ErrorPayload),
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(untagged)]
pub enum UserInfoReply {
    User(UserInfo),
    Error(ErrorPayload),
}

/// Start signing in through an upstream provider.
#[tracing::instrument(skip(app, headers))]
#[utoipa::path(
    get,
    path = "/login",
    tag = SSO_TAG,
    operation_id = "SSO Login",
    summary = "Redirect to an upstream identity provider",
    params(LoginQuery),
    responses(
        (status = 303, description = "Redirect to the provider's authorize page"),
        (status = 404, description = "Unknown provider", body = crate::error::ErrorResponse),
    )
)]
pub async fn login(
    State(app): State<AppContext>,
    headers: HeaderMap,
    Query(query): Query<LoginQuery>,
) -> Result<Redirect, SsoError> {
    let ctx = app.request_context(&headers);
    let url = app.upstream.login(
        query.name.as_deref().unwrap_or_default(),
        query.state,
        query.r.as_deref(),
        &ctx,
    )?;
    Ok(Redirect::to(&url))
}

/// Callback from the upstream provider.
#[tracing::instrument(skip(app, headers, jar, session, query))]
#[utoipa::path(
    get,
    path = "/login_info",
    tag = SSO_TAG,
    operation_id = "SSO Callback",
    summary = "Complete an upstream login",
    description = "Exchanges the provider's code, resolves or creates the local account and \
                   establishes the session. Missing or already used codes restart the provider \
                   login once.",
    params(CallbackQuery),
    responses(
        (status = 303, description = "Signed in, or retrying at the provider"),
        (status = 400, description = "No code even after a retry", body = crate::error::ErrorResponse),
        (status = 502, description = "The provider returned no usable identity", body = crate::error::ErrorResponse),
    )
)]
pub async fn login_info(
    State(app): State<AppContext>,
    headers: HeaderMap,
    jar: CookieJar,
    session: Session,
    Query(query): Query<CallbackQuery>,
) -> Result<(CookieJar, Redirect), SsoError> {
    let ctx = app.request_context(&headers);
    let outcome = app
        .upstream
        .callback(
            query.code.as_deref(),
            query.state.as_deref().unwrap_or_default(),
            query.r.as_deref(),
            &session,
            &ctx,
        )
        .await
        .inspect_err(|e| tracing::error!(error = %e, state = ?query.state, "Upstream login failed"))?;

    Ok((session.attach(jar), Redirect::to(outcome.redirect())))
}

/// Sign out, optionally through the upstream provider.
#[tracing::instrument(skip(app, headers, jar, session))]
#[utoipa::path(
    get,
    path = "/logout",
    tag = SSO_TAG,
    operation_id = "SSO Logout",
    summary = "Clear the local session",
    params(LogoutQuery),
    responses(
        (status = 303, description = "Redirect to the provider's logout or the return URL"),
    )
)]
pub async fn logout(
    State(app): State<AppContext>,
    headers: HeaderMap,
    jar: CookieJar,
    session: Session,
    Query(query): Query<LogoutQuery>,
) -> (CookieJar, Redirect) {
    let ctx = app.request_context(&headers);
    let url = app
        .upstream
        .logout(&session, query.r.as_deref(), query.state, &ctx)
        .await;
    (Session::detach(jar), Redirect::to(&url))
}

/// Link another provider account to the signed-in user.
#[tracing::instrument(skip(app, headers, session))]
#[utoipa::path(
    get,
    path = "/bind",
    tag = SSO_TAG,
    operation_id = "SSO Bind",
    summary = "Link a provider account",
    params(ProviderQuery),
    responses(
        (status = 303, description = "Redirect to the provider"),
        (status = 401, description = "Not signed in", body = crate::error::ErrorResponse),
    )
)]
pub async fn bind(
    State(app): State<AppContext>,
    headers: HeaderMap,
    session: Session,
    Query(query): Query<ProviderQuery>,
) -> Result<Redirect, SsoError> {
    let ctx = app.request_context(&headers);
    let url = app
        .upstream
        .bind(query.id.as_deref().unwrap_or_default(), &session, &ctx)
        .await?;
    Ok(Redirect::to(&url))
}

/// Unlink a provider account from the signed-in user.
#[tracing::instrument(skip(app, headers, session))]
#[utoipa::path(
    get,
    path = "/unbind",
    tag = SSO_TAG,
    operation_id = "SSO Unbind",
    summary = "Unlink a provider account",
    params(ProviderQuery),
    responses(
        (status = 303, description = "Redirect back to the referring page"),
        (status = 401, description = "Not signed in", body = crate::error::ErrorResponse),
    )
)]
pub async fn unbind(
    State(app): State<AppContext>,
    headers: HeaderMap,
    session: Session,
    Query(query): Query<ProviderQuery>,
) -> Result<Redirect, SsoError> {
    let ctx = app.request_context(&headers);
    let url = app
        .upstream
        .unbind(query.id.as_deref().unwrap_or_default(), &session, &ctx)
        .await?;
    Ok(Redirect::to(&url))
}

/// Downstream authorization endpoint.
#[tracing::instrument(skip(app, session))]
#[utoipa::path(
    get,
    path = "/authorize",
    tag = SSO_TAG,
    operation_id = "SSO Authorize",
    summary = "Authenticate a user for a downstream subsystem",
    description = "Issues a one-time code right away when the user is signed in, otherwise sends \
                   the user through local login and resumes at `/sso/auth2/{id}`.",
    params(AuthorizeQuery),
    responses(
        (status = 303, description = "Redirect to the subsystem with `code` and `state`, or to the login page"),
        (status = 400, description = "Missing parameter or redirect_uri not allowed", body = crate::error::ErrorResponse),
        (status = 404, description = "Unknown client", body = crate::error::ErrorResponse),
    )
)]
pub async fn authorize(
    State(app): State<AppContext>,
    session: Session,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Redirect, SsoError> {
    let params = AuthorizeParams {
        client_id: query.client_id.as_deref().unwrap_or_default(),
        redirect_uri: query.redirect_uri.as_deref().unwrap_or_default(),
        response_type: query.response_type.as_deref(),
        scope: query.scope.as_deref(),
        state: query.state.as_deref(),
    };
    let outcome = app
        .downstream
        .authorize(params, &session, &app.upstream)
        .await?;
    Ok(Redirect::to(outcome.redirect()))
}

/// Resume a parked authorization after local login.
#[tracing::instrument(skip(app, session))]
#[utoipa::path(
    get,
    path = "/auth2/{id}",
    tag = SSO_TAG,
    operation_id = "SSO Authorize Resume",
    summary = "Finish a downstream authorization after login",
    params(
        ("id" = i64, Path, description = "Key returned by the authorize step"),
    ),
    responses(
        (status = 303, description = "Redirect to the subsystem, or back to the login page"),
        (status = 400, description = "Invalid or expired key", body = crate::error::ErrorResponse),
    )
)]
pub async fn auth2(
    State(app): State<AppContext>,
    session: Session,
    Path(id): Path<i64>,
) -> Result<Redirect, SsoError> {
    let key = u64::try_from(id)
        .ok()
        .filter(|k| *k > 0)
        .ok_or_else(|| SsoError::InvalidRequest("authorization key must be positive".into()))?;
    let outcome = app.downstream.complete(key, &session, &app.upstream).await?;
    Ok(Redirect::to(outcome.redirect()))
}

/// Server-to-server code exchange.
#[tracing::instrument(skip(app, query), fields(client_id = ?query.client_id))]
#[utoipa::path(
    get,
    path = "/access_token",
    tag = SSO_TAG,
    operation_id = "SSO Access Token",
    summary = "Exchange a code for an access token",
    description = "Always answers 200. Failures are reported as `{\"error\": message}`.",
    params(AccessTokenQuery),
    responses(
        (status = 200, description = "Token envelope or error payload", body = TokenReply),
    )
)]
pub async fn access_token(
    State(app): State<AppContext>,
    Query(query): Query<AccessTokenQuery>,
) -> Json<TokenReply> {
    let client_id = query.client_id.as_deref().unwrap_or_default();
    let code = query.code.as_deref().unwrap_or_default();

    match app
        .downstream
        .access_token(
            client_id,
            query.client_secret.as_deref().unwrap_or_default(),
            code,
            query.grant_type.as_deref(),
        )
        .await
    {
        Ok(envelope) => Json(TokenReply::Token(envelope)),
        Err(e) => {
            tracing::warn!(client_id, code, error = %e, "Access token request failed");
            Json(TokenReply::Error(ErrorPayload::from(&e)))
        }
    }
}

/// Server-to-server profile lookup.
#[tracing::instrument(skip(app, query))]
#[utoipa::path(
    get,
    path = "/user_info",
    tag = SSO_TAG,
    operation_id = "SSO User Info",
    summary = "Profile of the user behind an access token",
    description = "Always answers 200. Failures are reported as `{\"error\": message}`.",
    params(UserInfoQuery),
    responses(
        (status = 200, description = "User profile or error payload", body = UserInfoReply),
    )
)]
pub async fn user_info(
    State(app): State<AppContext>,
    Query(query): Query<UserInfoQuery>,
) -> Json<UserInfoReply> {
    let token = query.access_token.as_deref().unwrap_or_default();
    let result = app.downstream.user_info(token).await;

    let (user, message) = match &result {
        Ok(info) => (Some(info.username.as_str()), String::new()),
        Err(e) => (None, e.to_string()),
    };
    tracing::info!(user, access_token = token, message = %message, "User info request");

    Json(match result {
        Ok(info) => UserInfoReply::User(info),
        Err(e) => UserInfoReply::Error(ErrorPayload::from(&e)),
    })
}
