//! OpenAPI/Utoipa configuration.

use crate::api::{MISC_TAG, SSO_TAG};
use utoipa::OpenApi;

/// OpenAPI documentation configuration.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "SSO Broker API",
        version = "1.0.0",
        description = "Single sign-on through upstream identity providers, and OAuth2 \
                       authorization for downstream subsystems."
    ),
    tags(
        (name = MISC_TAG, description = "Miscellaneous endpoints"),
        (name = SSO_TAG, description = "Login, account linking and downstream authorization")
    )
)]
pub struct ApiDoc;
