use migration::{Migrator, MigratorTrait};
use sea_orm::Database;
use sso_broker::AppContext;
use sso_broker::api::start_webserver;
use sso_broker::config::load_config;
use sso_broker::session::MemorySessionStore;
use std::sync::Arc;
use tokio::time::{Duration, interval};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_tracing() {
    let default_directives = "sso_broker=info,tower_http=info,sea_orm=info";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .init();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();
    initialize_tracing();

    let config = load_config()?;
    tracing::info!(
        public_url = %config.public_url,
        providers = config.providers.len(),
        allow_local_login = config.sso.allow_local_login,
        auto_register = config.sso.auto_register,
        logout_all = config.sso.logout_all,
        "Loaded configuration"
    );

    let db = Arc::new(Database::connect(&config.database_url).await?);
    Migrator::up(db.as_ref(), None).await?;

    let sessions = MemorySessionStore::default();
    let listen_addr = config.listen_addr.clone();
    let ctx = AppContext::new(config, db, Arc::new(sessions.clone()))?;

    // Sweep expired codes, parked authorizations, tokens and sessions
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let codes = ctx.upstream.replay_guard().purge_expired();
                let grants = ctx.downstream.purge_expired();
                let sessions = sessions.purge_expired();
                tracing::debug!(codes, grants, sessions, "Purged expired entries");
            }
        });
    }

    start_webserver(ctx, &listen_addr).await?;
    Ok(())
}
