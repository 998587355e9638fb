//! The liveness sweep.
//!
//! Websocket-level ping/pong is not enough here: a remote program can crash
//! while its socket stays open, so the relay runs its own application-level
//! challenge. Every tick, clients that produced no traffic at all since the
//! previous tick are force-closed, and everyone else gets a ping to answer.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use super::session::SessionRegistry;
use crate::protocol::codec;
use crate::protocol::packet::Packet;

/// How often every socket must prove liveness.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(15);

/// Start the sweep task over every session in the registry.
pub fn spawn_sweeper(registry: Arc<SessionRegistry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ping = match codec::encode(&Packet::ConnectionPing) {
            Ok(text) => Utf8Bytes::from(text),
            Err(err) => {
                error!(%err, "cannot encode ping packet, liveness sweep disabled");
                return;
            }
        };

        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately; skip it so freshly admitted
        // clients get a full period before their first challenge.
        interval.tick().await;

        loop {
            interval.tick().await;
            let mut closed = 0;
            for connection in registry.snapshot() {
                closed += connection.sweep(&ping).await;
            }
            if closed > 0 {
                warn!(closed, "liveness sweep closed unresponsive clients");
            }
        }
    })
}
