//! Command implementations for bundle-cli

pub mod locks;
pub mod migrate;
pub mod status;
pub mod sync;

pub use locks::{run_ignore_lock, run_locks};
pub use migrate::{run_migrate, run_unmigrate};
pub use status::run_status;
pub use sync::{run_flush, run_update};
