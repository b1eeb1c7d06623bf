use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use super::AppContext;
use super::session::handle_session;

pub async fn start_listener(app: AppContext) -> Result<()> {
    let bind_addr = app.settings.listen;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", bind_addr))?;
    serve(listener, app).await
}

/// Accept connections forever, one task per client.
pub async fn serve(listener: TcpListener, app: AppContext) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(
        address = %local_addr,
        cache = app.cache.is_some(),
        "proxy listener started"
    );

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        debug!(peer = %peer_addr, "accepted connection");
        let connection_app = app.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer_addr, connection_app).await;
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, app: AppContext) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY on client stream");
    }
    let outcome = handle_session(stream, peer, &app).await;
    debug!(peer = %peer, outcome = outcome.label(), "connection closed");
}
