//! Identity links - bind a local user to an external `(provider, open_id)`.
//!
//! Links are soft-deleted by clearing `enabled`; the `(provider, open_id)`
//! pair is unique, so re-binding reuses the row.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sso_identity")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Reference to sso_user.id
    pub user_id: String,
    /// Provider name as configured
    pub provider: String,
    /// Provider-specific user identifier
    pub open_id: String,
    pub union_id: Option<String>,
    /// Display name reported by the provider
    pub name: Option<String>,
    pub avatar: Option<String>,
    /// Last upstream access token
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::sso_user::Entity",
        from = "Column::UserId",
        to = "super::sso_user::Column::Id"
    )]
    User,
}

impl Related<super::sso_user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
