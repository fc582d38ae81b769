use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SsoUser::Table)
                    .if_not_exists()
                    .col(string(SsoUser::Id).primary_key())
                    .col(string(SsoUser::Name).not_null().unique_key())
                    .col(string_null(SsoUser::DisplayName))
                    .col(string_null(SsoUser::Mail))
                    .col(string_null(SsoUser::Mobile))
                    .col(string_null(SsoUser::Avatar))
                    .col(boolean(SsoUser::Enabled).default(true))
                    .col(string_null(SsoUser::RegisteredFrom))
                    .col(timestamp_with_time_zone(SsoUser::CreatedAt))
                    .col(timestamp_with_time_zone_null(SsoUser::LastLoginAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(SsoIdentity::Table)
                    .if_not_exists()
                    .col(string(SsoIdentity::Id).primary_key())
                    .col(string(SsoIdentity::UserId))
                    .col(string(SsoIdentity::Provider))
                    .col(string(SsoIdentity::OpenId))
                    .col(string_null(SsoIdentity::UnionId))
                    .col(string_null(SsoIdentity::Name))
                    .col(string_null(SsoIdentity::Avatar))
                    .col(text_null(SsoIdentity::AccessToken))
                    .col(text_null(SsoIdentity::RefreshToken))
                    .col(boolean(SsoIdentity::Enabled).default(true))
                    .col(timestamp_with_time_zone(SsoIdentity::CreatedAt))
                    .col(timestamp_with_time_zone(SsoIdentity::UpdatedAt))
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_sso_identity_provider_open_id")
                    .table(SsoIdentity::Table)
                    .col(SsoIdentity::Provider)
                    .col(SsoIdentity::OpenId)
                    .unique()
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_sso_identity_user_id")
                    .table(SsoIdentity::Table)
                    .col(SsoIdentity::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(SsoParameter::Table)
                    .if_not_exists()
                    .col(string(SsoParameter::Id).primary_key())
                    .col(string(SsoParameter::Category))
                    .col(string(SsoParameter::Name))
                    .col(text_null(SsoParameter::Value))
                    .col(boolean(SsoParameter::Enabled).default(true))
                    .col(timestamp_with_time_zone(SsoParameter::CreatedAt))
                    .col(timestamp_with_time_zone(SsoParameter::UpdatedAt))
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_sso_parameter_category_name")
                    .table(SsoParameter::Table)
                    .col(SsoParameter::Category)
                    .col(SsoParameter::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(SsoApp::Table)
                    .if_not_exists()
                    .col(string(SsoApp::Id).primary_key())
                    .col(string(SsoApp::Secret))
                    .col(string(SsoApp::Name))
                    .col(text(SsoApp::RedirectUris).default("[]"))
                    .col(boolean(SsoApp::Enabled).default(true))
                    .col(timestamp_with_time_zone(SsoApp::CreatedAt))
                    .col(timestamp_with_time_zone(SsoApp::UpdatedAt))
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SsoApp::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SsoParameter::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SsoIdentity::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SsoUser::Table).if_exists().to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SsoUser {
    Table,
    Id,
    Name,
    DisplayName,
    Mail,
    Mobile,
    Avatar,
    Enabled,
    RegisteredFrom,
    CreatedAt,
    LastLoginAt,
}

#[derive(DeriveIden)]
enum SsoIdentity {
    Table,
    Id,
    UserId,
    Provider,
    OpenId,
    UnionId,
    Name,
    Avatar,
    AccessToken,
    RefreshToken,
    Enabled,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum SsoParameter {
    Table,
    Id,
    Category,
    Name,
    Value,
    Enabled,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum SsoApp {
    Table,
    Id,
    Secret,
    Name,
    RedirectUris,
    Enabled,
    CreatedAt,
    UpdatedAt,
}
