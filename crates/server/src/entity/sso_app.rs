//! Downstream applications allowed to delegate login to this broker.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sso_app")]
pub struct Model {
    /// The `client_id` presented by the downstream subsystem
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub secret: String,
    pub name: String,
    /// JSON array of allowed redirect URI prefixes; empty allows any.
    /// A prefix matches URIs with the same origin whose path is the prefix's
    /// path or lies below it.
    pub redirect_uris: String,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parse redirect URI prefixes from JSON string
    pub fn redirect_uris_list(&self) -> Vec<String> {
        serde_json::from_str(&self.redirect_uris).unwrap_or_default()
    }

    /// Check if a redirect URI is allowed for this application
    pub fn is_redirect_uri_allowed(&self, uri: &str) -> bool {
        let allowed = self.redirect_uris_list();
        if allowed.is_empty() {
            return true;
        }
        let Ok(target) = Url::parse(uri) else {
            return false;
        };
        allowed
            .iter()
            .filter_map(|prefix| Url::parse(prefix).ok())
            .any(|prefix| {
                prefix.origin() == target.origin() && path_within(prefix.path(), target.path())
            })
    }

    pub fn secret_matches(&self, provided: &str) -> bool {
        !self.secret.is_empty() && self.secret == provided
    }
}

/// `path` equals `prefix` or continues it at a segment boundary.
fn path_within(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty()
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}
