//! # rill
//!
//! Reliable session transport over lossy datagrams.
//!
//! Windowed ARQ with selective retransmission, optional Reed-Solomon FEC
//! ahead of the retransmit path, and an event-driven session layer that
//! keeps the protocol core single-threaded while producers write from
//! anywhere.
//!
//! ## Crate structure
//!
//! - [`wire`] — Segment framing and the FEC shard prefix
//! - [`config`] — Tuning surface, validation, stock profiles
//! - [`transport`] — ARQ core: windows, RTT/RTO, congestion, pacing
//! - [`fec`] — Reed-Solomon shard encoder/decoder and the wrapping sink
//! - [`session`] — Queues, listener/registry seams, lifecycle
//! - [`runtime`] — Worker thread that owns a session
//! - [`stats`] — Per-session metrics
//! - [`error`] — Error taxonomy

pub mod config;
pub mod error;
pub mod fec;
pub mod runtime;
pub mod session;
pub mod stats;
pub mod transport;
pub mod wire;

pub use config::{FecConfig, SessionConfig};
pub use error::TransportError;
pub use runtime::SessionRuntime;
pub use session::{ConnectionRegistry, SessionHandle, SessionListener};
pub use stats::MetricsSnapshot;
pub use transport::{DirectSink, OutputSink};
