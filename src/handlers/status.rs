use crate::platform::TerminalSupport;
use crate::server::DeskState;
use axum::{Json, extract::State};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub version: &'static str,
    pub database: &'static str,
    pub terminal: TerminalSupport,
}

/// GET /status -> always 200 while the process serves requests.
pub async fn status(State(state): State<DeskState>) -> Json<StatusReport> {
    let database = match state.accounts.store().ping().await {
        Ok(()) => "connected",
        Err(e) => {
            warn!(error = %e, "database ping failed");
            "unavailable"
        }
    };
    Json(StatusReport {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        database,
        terminal: state.terminal.clone(),
    })
}
