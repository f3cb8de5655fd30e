//! # kindred
//!
//! Headless realtime session. Connects to the server named by
//! `KINDRED_SERVER_URL`, signs in as `KINDRED_USER_ID` with `KINDRED_TOKEN`
//! and logs every session event until Ctrl+C.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use kindred_client::{logging, Session, SessionConfig, SessionEvent};
use kindred_net::{StaticToken, WebSocketConnector};
use kindred_shared::constants::CLIENT_VERSION;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Logging and configuration
    // -----------------------------------------------------------------------
    logging::init();
    info!("Starting kindred session client v{}", CLIENT_VERSION);

    let config = SessionConfig::from_env();
    info!(server = %config.server_url, "Loaded configuration");

    let (user_id, token) = config.credentials()?;

    // -----------------------------------------------------------------------
    // 2. Session
    // -----------------------------------------------------------------------
    let connector = Arc::new(WebSocketConnector::new(config.server_url.clone()));
    let credentials = Arc::new(StaticToken::new(token));
    let session = Session::new(user_id.clone(), connector, credentials, config);

    session.subscribe_all(|event| match event {
        SessionEvent::Server(_) => {}
        SessionEvent::ConnectionChanged(state) => info!(state = ?state, "Connection"),
        SessionEvent::CallUpdated(call) => {
            info!(call = %call.local_id, peer = %call.peer_id, state = %call.state, "Call")
        }
        SessionEvent::MessageUpdated(message) => info!(
            peer = %message.peer_id,
            status = ?message.status,
            "Message"
        ),
        other => info!(event = ?other, "Session event"),
    });

    session
        .connect()
        .await
        .context("Failed to connect to the realtime server")?;
    info!(user = %user_id, "Session ready");

    // -----------------------------------------------------------------------
    // 3. Run until Ctrl+C
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down");
    session.disconnect().await;
    Ok(())
}
