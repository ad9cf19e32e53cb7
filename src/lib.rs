#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! tunshare library — shared-tunnel session management.
//!
//! Building blocks:
//! - `config` — configuration loading
//! - `store` — flock-gated state directory and reference-count ledger
//! - `supervisor` — tunnel process spawn/liveness/termination
//! - `session` — acquire/release lifecycle tying the pieces together
//! - `naming` — tunnel name resolution
//! - `workload` — foreground command execution with signal forwarding

pub mod config;
pub mod naming;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod util;
pub mod workload;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use session::{AcquireOutcome, ReleaseOutcome, SessionContext};
pub use store::{LockStore, ResourceRecord};
