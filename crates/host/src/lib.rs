//! # termrelay host
//!
//! Shares a live shell with remote viewers over TCP.
//!
//! The operator runs a shell under a pseudo-terminal. Its output is mirrored
//! locally and broadcast to every authenticated viewer as TERMINAL_DATA
//! frames. Viewers join with a short passphrase that rotates on a timer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Session                            │
//! │  accept loop ─► handshake ─► registry ─► per-client reads    │
//! │  passphrase rotation                     shutdown sequencing  │
//! ├──────────────────────────────────────────────────────────────┤
//! │                      Broadcast Pipeline                      │
//! │  PTY read ─► wrap + encode once ─► per-viewer queue + writer │
//! ├───────────────────────────────┬──────────────────────────────┤
//! │          PTY Bridge           │    Reliable I/O + Tracker    │
//! └───────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! The wire format lives in the `protocol` crate.
//!
//! ## Modules
//!
//! - [`io`]: deadline-bounded framed reads and retried writes
//! - [`connection`]: closable framed byte stream
//! - [`pty`]: shell under a pseudo-terminal, plus an in-memory source
//! - [`pipeline`]: terminal output fan-out
//! - [`session`]: listener, handshake, registry, rotation, shutdown
//! - [`passphrase`]: diceware passphrases hashed with bcrypt
//! - [`viewer`]: the joining side
//! - [`config`]: TOML configuration

pub mod config;
pub mod connection;
pub mod error;
pub mod io;
pub mod passphrase;
pub mod pipeline;
pub mod pty;
pub mod session;
pub mod viewer;

pub use connection::{Connection, ConnectionId};
pub use error::{HostError, Result};
pub use passphrase::{DicewareAuthority, PassphraseAuthority, Secret};
pub use pipeline::{Pipeline, PipelineOptions, PipelineState};
pub use pty::{ChannelFeed, ChannelSource, PtyBridge, PtyError, TerminalSource};
pub use session::{ClientSummary, Session, SessionConfig, ShutdownReport};
pub use viewer::{Viewer, ViewerEvent};
