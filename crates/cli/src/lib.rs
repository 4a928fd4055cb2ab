//! Library half of `snapctl`: configuration loading and logging setup shared
//! by the `snapctl` and `snapdesk-package` binaries.

pub mod config;
pub mod logging;
