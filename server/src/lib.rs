//! # Arena Server Library
//!
//! This library provides the authoritative netcode core of a real-time
//! multiplayer arena. It accepts bursty, lossy, out-of-order UDP traffic from
//! many peers and turns it into ordered, fair simulation steps.
//!
//! ## Core Responsibilities
//!
//! ### Peer Lifecycle
//! Peers handshake over UDP, are kept alive by any valid traffic and are
//! dropped exactly once after a period of silence. A re-handshake from a
//! known address keeps the peer's id.
//!
//! ### Input Pacing
//! Clients send one control per client tick and resend recent ones with
//! every frame. The server keeps a short history per session and hands the
//! simulation each control once, in order, skipping the ones that never
//! arrived and never injecting more backlog per step than time has passed.
//!
//! ### Lag Compensation
//! Every snapshot sent is kept for as long as the highest tolerated ping. A
//! shot is judged against the snapshot the shooter had acknowledged, so
//! what the player aimed at is what gets hit.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! One task owns the socket, the peer table, the sessions and the histories.
//! The only suspension point is a bounded wait for traffic that never
//! outlasts the next tick deadline, so no state needs locking.
//!
//! ### Two Tick Rates
//! Controls are applied at the client rate, snapshots go out at the slower
//! server rate. Missed ticks are skipped, not replayed.
//!
//! ### Bulk Side Channel
//! Static data too large for a datagram is streamed once over a short-lived
//! TCP listener drawn from a port pool.
//!
//! ## Module Organization
//!
//! - `ring`: fixed-capacity history keyed by increasing ids, with ack bitmaps
//! - `input`: per-session control pacing and scripted control sources
//! - `peers`: peer slots, idempotent handshake, timeout eviction
//! - `transport`: UDP socket, burst splitting, handshake and keepalive
//! - `bulk`: one-shot TCP payload delivery and its port pool
//! - `history`: snapshots retained over the max-ping window
//! - `lag`: hit resolution against past snapshots
//! - `clock`: fixed-period tick numbering
//! - `session`: per-player state tying an entity to its controls
//! - `game`: the `World` collaborator and the reference `ArenaWorld`
//! - `network`: the server loop and message dispatch
//! - `config`: server settings
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::game::ArenaWorld;
//! use server::network::Server;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let mut server = Server::bind(config, ArenaWorld::default()).await?;
//!
//!     // Runs the tick loop until Ctrl+C
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod bulk;
pub mod clock;
pub mod config;
pub mod game;
pub mod history;
pub mod input;
pub mod lag;
pub mod network;
pub mod peers;
pub mod ring;
pub mod session;
pub mod transport;
