//! Shared helpers for the end-to-end tests.

use std::net::SocketAddr;

use tokio::net::TcpListener;

use crate::build_router;
use crate::state::RelayState;

/// Serve the full router on an ephemeral local port.
pub async fn spawn_server(state: RelayState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    addr
}
