//! User, identity-link and parameter stores.
//!
//! These are the only places the broker touches the database. Every lookup is
//! keyed and every write is safe to repeat: linking upserts on
//! `(provider, open_id)` and parameters are created on first read.

use crate::entity::{sso_app, sso_identity, sso_parameter, sso_user};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    SqlErr,
};
use std::sync::Arc;
use time::OffsetDateTime;

const MAX_NAME_ATTEMPTS: usize = 3;

fn with_suffix(name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", name, &suffix[..6])
}

fn is_unique_violation(err: &sea_orm::DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

/// Profile data for a user created from an upstream identity.
#[derive(Debug, Clone, Default)]
pub struct NewUser<'a> {
    pub name: &'a str,
    pub display_name: Option<&'a str>,
    pub mail: Option<&'a str>,
    pub mobile: Option<&'a str>,
    pub avatar: Option<&'a str>,
    pub registered_from: Option<&'a str>,
}

/// Parameters for linking an external identity to a local user.
#[derive(Debug, Clone)]
pub struct LinkParams<'a> {
    pub user_id: &'a str,
    pub provider: &'a str,
    pub open_id: &'a str,
    pub union_id: Option<&'a str>,
    pub name: Option<&'a str>,
    pub avatar: Option<&'a str>,
    pub access_token: Option<&'a str>,
    pub refresh_token: Option<&'a str>,
}

#[derive(Clone)]
pub struct IdentityService {
    db: Arc<DatabaseConnection>,
}

impl IdentityService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[tracing::instrument(skip(self))]
    pub async fn find_user(&self, user_id: &str) -> Result<Option<sso_user::Model>, sea_orm::DbErr> {
        sso_user::Entity::find_by_id(user_id)
            .one(self.db.as_ref())
            .await
    }

    /// Find the enabled link for an external identity, if any.
    #[tracing::instrument(skip(self))]
    pub async fn find_enabled_link(
        &self,
        provider: &str,
        open_id: &str,
    ) -> Result<Option<sso_identity::Model>, sea_orm::DbErr> {
        sso_identity::Entity::find()
            .filter(sso_identity::Column::Provider.eq(provider))
            .filter(sso_identity::Column::OpenId.eq(open_id))
            .filter(sso_identity::Column::Enabled.eq(true))
            .one(self.db.as_ref())
            .await
    }

    /// Create a local account. A taken login name gets a short random suffix,
    /// also when another request claims the name between check and insert.
    #[tracing::instrument(skip(self, new_user), fields(name = new_user.name))]
    pub async fn register_user(
        &self,
        new_user: NewUser<'_>,
    ) -> Result<sso_user::Model, sea_orm::DbErr> {
        let mut name = new_user.name.to_string();
        if sso_user::Entity::find()
            .filter(sso_user::Column::Name.eq(&name))
            .one(self.db.as_ref())
            .await?
            .is_some()
        {
            name = with_suffix(new_user.name);
        }

        let mut attempts = 0;
        loop {
            let user = sso_user::ActiveModel {
                id: Set(uuid::Uuid::new_v4().to_string()),
                name: Set(name.clone()),
                display_name: Set(new_user.display_name.map(String::from)),
                mail: Set(new_user.mail.map(String::from)),
                mobile: Set(new_user.mobile.map(String::from)),
                avatar: Set(new_user.avatar.map(String::from)),
                enabled: Set(true),
                registered_from: Set(new_user.registered_from.map(String::from)),
                created_at: Set(OffsetDateTime::now_utc()),
                last_login_at: Set(None),
            };

            match user.insert(self.db.as_ref()).await {
                Ok(user) => {
                    tracing::info!(user_id = %user.id, name = %user.name, "Registered local user");
                    return Ok(user);
                }
                Err(e) if is_unique_violation(&e) && attempts < MAX_NAME_ATTEMPTS => {
                    tracing::debug!(name = %name, "Login name taken concurrently, retrying");
                    attempts += 1;
                    name = with_suffix(new_user.name);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove a user that never got to own anything.
    #[tracing::instrument(skip(self))]
    pub async fn delete_user(&self, user_id: &str) -> Result<(), sea_orm::DbErr> {
        sso_user::Entity::delete_by_id(user_id)
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Link an external identity to a user, re-enabling a previously
    /// disabled link for the same identity.
    ///
    /// An identity already linked to another user through an enabled link is
    /// left alone and that link is returned; callers compare `user_id`.
    #[tracing::instrument(skip(self, params), fields(provider = params.provider, open_id = params.open_id))]
    pub async fn link_identity(
        &self,
        params: LinkParams<'_>,
    ) -> Result<sso_identity::Model, sea_orm::DbErr> {
        let now = OffsetDateTime::now_utc();

        if let Some(existing) = sso_identity::Entity::find()
            .filter(sso_identity::Column::Provider.eq(params.provider))
            .filter(sso_identity::Column::OpenId.eq(params.open_id))
            .one(self.db.as_ref())
            .await?
        {
            if existing.enabled && existing.user_id != params.user_id {
                return Ok(existing);
            }
            let mut active: sso_identity::ActiveModel = existing.into();
            active.user_id = Set(params.user_id.to_string());
            active.enabled = Set(true);
            active.access_token = Set(params.access_token.map(String::from));
            active.refresh_token = Set(params.refresh_token.map(String::from));
            active.updated_at = Set(now);
            if let Some(u) = params.union_id {
                active.union_id = Set(Some(u.to_string()));
            }
            if let Some(n) = params.name {
                active.name = Set(Some(n.to_string()));
            }
            if let Some(a) = params.avatar {
                active.avatar = Set(Some(a.to_string()));
            }
            return active.update(self.db.as_ref()).await;
        }

        let identity = sso_identity::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            user_id: Set(params.user_id.to_string()),
            provider: Set(params.provider.to_string()),
            open_id: Set(params.open_id.to_string()),
            union_id: Set(params.union_id.map(String::from)),
            name: Set(params.name.map(String::from)),
            avatar: Set(params.avatar.map(String::from)),
            access_token: Set(params.access_token.map(String::from)),
            refresh_token: Set(params.refresh_token.map(String::from)),
            enabled: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match identity.insert(self.db.as_ref()).await {
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!("Identity linked concurrently, reading the winning link");
                sso_identity::Entity::find()
                    .filter(sso_identity::Column::Provider.eq(params.provider))
                    .filter(sso_identity::Column::OpenId.eq(params.open_id))
                    .one(self.db.as_ref())
                    .await?
                    .ok_or(e)
            }
            other => other,
        }
    }

    /// All links of a user, enabled or not.
    #[tracing::instrument(skip(self))]
    pub async fn user_links(
        &self,
        user_id: &str,
    ) -> Result<Vec<sso_identity::Model>, sea_orm::DbErr> {
        sso_identity::Entity::find()
            .filter(sso_identity::Column::UserId.eq(user_id))
            .all(self.db.as_ref())
            .await
    }

    /// Soft-unbind: disable the user's enabled links to `provider`
    /// (matched case-insensitively). Returns how many were disabled.
    #[tracing::instrument(skip(self))]
    pub async fn disable_links(&self, user_id: &str, provider: &str) -> Result<u64, sea_orm::DbErr> {
        let mut disabled = 0;
        for link in self.user_links(user_id).await? {
            if !link.enabled || !link.provider.eq_ignore_ascii_case(provider) {
                continue;
            }
            let mut active: sso_identity::ActiveModel = link.into();
            active.enabled = Set(false);
            active.updated_at = Set(OffsetDateTime::now_utc());
            active.update(self.db.as_ref()).await?;
            disabled += 1;
        }
        Ok(disabled)
    }

    /// Update user's last login time
    #[tracing::instrument(skip(self))]
    pub async fn touch_login(&self, user_id: &str) -> Result<(), sea_orm::DbErr> {
        if let Some(user) = sso_user::Entity::find_by_id(user_id)
            .one(self.db.as_ref())
            .await?
        {
            let mut active: sso_user::ActiveModel = user.into();
            active.last_login_at = Set(Some(OffsetDateTime::now_utc()));
            active.update(self.db.as_ref()).await?;
        }
        Ok(())
    }
}

/// Category/name keyed configuration values, provisioned on first use so an
/// operator finds an empty row to fill in.
#[derive(Clone)]
pub struct ParameterService {
    db: Arc<DatabaseConnection>,
}

impl ParameterService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_or_create(
        &self,
        category: &str,
        name: &str,
    ) -> Result<sso_parameter::Model, sea_orm::DbErr> {
        if let Some(param) = sso_parameter::Entity::find()
            .filter(sso_parameter::Column::Category.eq(category))
            .filter(sso_parameter::Column::Name.eq(name))
            .one(self.db.as_ref())
            .await?
        {
            return Ok(param);
        }

        let now = OffsetDateTime::now_utc();
        let param = sso_parameter::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            category: Set(category.to_string()),
            name: Set(name.to_string()),
            value: Set(None),
            enabled: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        };
        tracing::info!(category, name, "Provisioned empty parameter");
        param.insert(self.db.as_ref()).await
    }

    /// The parameter's value, if set.
    pub async fn value(&self, category: &str, name: &str) -> Result<Option<String>, sea_orm::DbErr> {
        let param = self.get_or_create(category, name).await?;
        Ok(param.effective_value().map(String::from))
    }
}

/// Registered downstream applications.
#[derive(Clone)]
pub struct ClientService {
    db: Arc<DatabaseConnection>,
}

impl ClientService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// An enabled application by client id.
    #[tracing::instrument(skip(self))]
    pub async fn find_enabled(&self, client_id: &str) -> Result<Option<sso_app::Model>, sea_orm::DbErr> {
        Ok(sso_app::Entity::find_by_id(client_id)
            .one(self.db.as_ref())
            .await?
            .filter(|app| app.enabled))
    }
}
