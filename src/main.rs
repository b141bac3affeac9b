use mimalloc::MiMalloc;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tradedesk::Config;
use tradedesk::db::MongoStore;
use tradedesk::mail::Mailer;
use tradedesk::platform::TerminalSupport;
use tradedesk::server::{DeskState, desk_router};
use tradedesk::service::{AccountService, AccountSettings, SWEEP_INTERVAL, spawn_sweeper};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        database = %cfg.db_name,
        host = %cfg.host,
        port = cfg.port,
        loglevel = %cfg.loglevel,
        email_dev_mode = cfg.email_dev_mode,
        worker_timeout_secs = cfg.worker_timeout,
        "starting tradedesk"
    );
    if cfg.uses_default_secret() {
        warn!("SECRET_KEY is the built-in default; set a unique value in production");
    }

    let store = MongoStore::connect(&cfg.mongodb_uri, &cfg.db_name).await?;
    let db_ready = match store.wait_until_ready().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "MongoDB unreachable; account features are limited until it recovers");
            false
        }
    };

    let mailer = Mailer::from_config(&cfg)?;
    let accounts = AccountService::new(
        Arc::new(store.clone()),
        mailer,
        AccountSettings::from_config(&cfg),
    );

    if db_ready {
        if let Err(e) = store.ensure_indexes().await {
            warn!(error = %e, "failed to create indexes");
        }
        if let Err(e) = accounts.seed_default_admin().await {
            error!(error = %e, "failed to seed default admin");
        }
    }

    let terminal = TerminalSupport::detect();
    info!(terminal = %terminal, "trading terminal integration");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = spawn_sweeper(accounts.clone(), SWEEP_INTERVAL, shutdown_rx.clone());

    let state = DeskState::new(accounts, &cfg.secret_key, cfg.insecure_cookie, terminal);
    let app = desk_router(state, cfg.worker_timeout());

    let addr = cfg.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let mut stop = shutdown_rx.clone();
    let mut server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.wait_for(|stopping| *stopping).await;
            })
            .into_future(),
    );

    tokio::select! {
        res = &mut server => {
            let _ = shutdown_tx.send(true);
            res??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    info!(
        grace_secs = cfg.graceful_timeout,
        "shutdown requested; draining in-flight requests"
    );
    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(cfg.graceful_timeout(), server).await {
        Ok(res) => res??,
        Err(_) => warn!("graceful shutdown timed out; dropping remaining connections"),
    }
    let _ = sweeper.await;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
