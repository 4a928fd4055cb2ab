//! Engine crate – headless core of the SnapDesk backup client.
//!
//! Everything that talks to the external backup engine lives here: action
//! descriptors, the adapter, the task runner, snapshot data and the view
//! models front-ends render. OS integrations sit behind the traits in
//! [`traits`], so the CLI, a GUI shell and the tests share the same code.

pub mod action;
pub mod adapter;
pub mod commands;
pub mod config;
pub mod context;
pub mod doctor;
pub mod hooks;
pub mod metrics;
pub mod platform;
pub mod repo;
pub mod scenario;
pub mod snapshot;
pub mod tasks;
pub mod traits;
pub mod tree;
pub mod types;
pub mod view;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use action::{Action, ActionOutcome};
pub use adapter::{AdapterError, ResticAdapter};
pub use commands::CommandRegistry;
pub use config::EngineConfig;
pub use context::AppContext;
pub use snapshot::{Freshness, Snapshot, TreeNode};
pub use tasks::{OutputSink, TaskError, TaskHandle, TaskRunner};
pub use types::{CommandResult, ErrorCode, ErrorInfo, Status};
