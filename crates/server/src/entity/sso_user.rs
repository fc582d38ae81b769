//! Local user accounts.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sso_user")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Login name, unique
    #[sea_orm(unique)]
    pub name: String,
    pub display_name: Option<String>,
    pub mail: Option<String>,
    pub mobile: Option<String>,
    /// Avatar URL as reported by the provider the account was created from
    pub avatar: Option<String>,
    pub enabled: bool,
    /// Provider that auto-registered this account, if any
    pub registered_from: Option<String>,
    pub created_at: OffsetDateTime,
    pub last_login_at: Option<OffsetDateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::sso_identity::Entity")]
    Identities,
}

impl Related<super::sso_identity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Identities.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
