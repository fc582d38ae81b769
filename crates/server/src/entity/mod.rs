//! SeaORM entities backing the user, identity-link, parameter and
//! downstream-application stores.

pub mod sso_app;
pub mod sso_identity;
pub mod sso_parameter;
pub mod sso_user;
