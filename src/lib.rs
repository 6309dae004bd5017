//! # DAQ Collector Library
//!
//! Event-distribution and flow-control stages for a data acquisition pipeline:
//! data sources → collectors → a pool of workers → storage and monitoring sinks.
//! Payloads are opaque bytes; this crate moves them with delivery guarantees, balances
//! them over workers and coordinates the end of a run.
//!
//! ## Crate Structure
//!
//! - **`message`**: the `Message` unit exchanged between stages and its wire encoding.
//! - **`network`**: `Context`/`Socket` transport over `inproc://` and `tcp://` endpoints,
//!   with per-peer addressing.
//! - **`connection`**: the input and output abstractions (`ConfirmedConnection`,
//!   `LoadBalancedConnection`, `RawConnection`, `DataAndRoiOutput`, `ConfirmedOutput`).
//! - **`state`**: the `Running → Draining → Stopped` drain state machine and `StopCounter`.
//! - **`monitor`**: the out-of-band control channel (Start, Stop, Terminate, status).
//! - **`app`**: `CollectorApp`, the single-threaded control loop, and the five variants.
//! - **`config`**: `CollectorConfig` loaded with Figment from TOML and environment.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: the `CollectorError` enum shared by every module.

pub mod app;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod message;
pub mod monitor;
pub mod network;
pub mod state;

pub use app::{AppKind, CollectorApp, ExitReason, Stage};
pub use config::CollectorConfig;
pub use error::{CollectorError, CollectorResult};
pub use message::{Message, MessageKind};
pub use network::Context;
