//! # Termlink - Terminal and File Relay
//!
//! Termlink lets a remote program share a live terminal and a set of files
//! with browser viewers, through one relay process that neither side has to
//! open a port for. Both parties dial out to the relay's single websocket
//! endpoint, name the same session token, and declare what they are there
//! to do; the relay validates, routes and fans out every packet between
//! them.
//!
//! ## Quick Start
//!
//! ```bash
//! # Start the relay
//! termlink --host 0.0.0.0 --port 8080
//! ```
//!
//! Endpoints then connect to
//! `ws://relay:8080/connect?id=<token>&capabilities=<tags>`, where the token
//! is any 32-character alphanumeric string both sides agreed on and the tags
//! are a comma-separated subset of `terminal:host`, `terminal:view`,
//! `file:host`, `file:edit`.
//!
//! ## Library Usage
//!
//! ```rust,no_run
//! use termlink::relay::{Args, run_relay_server};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let args = Args {
//!     host: "0.0.0.0".to_string(),
//!     port: 8080,
//! };
//! run_relay_server(args).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **[protocol]**: the typed packet model, capability declarations and the
//!   panic-free wire codec
//! - **[sync]**: checksums, character diffs and the optimistic-concurrency
//!   file replica that endpoints reconcile through
//! - **[relay]**: the websocket server: session registry, admission,
//!   capability-checked routing and the liveness sweep
//!
//! ## Guarantees (and non-guarantees)
//!
//! The relay enforces capability routing and host exclusivity, keeps client
//! ids stable and unique within a session, and detects dead sockets within
//! one sweep period. It does not authenticate beyond token possession, does
//! not persist anything, and forwards best-effort: a slow or broken
//! recipient loses its own socket, never anyone else's.

pub mod protocol;
pub mod relay;
pub mod sync;
pub mod token;
