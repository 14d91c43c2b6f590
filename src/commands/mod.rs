// ABOUTME: Command implementations for the rollup CLI
// ABOUTME: Exports run, daemon, status, validate, diff, install-tracking and prune

pub mod check;
pub mod daemon;
pub mod run;
pub mod status;
pub mod tracking;

pub use check::{diff, validate};
pub use daemon::daemon;
pub use run::run;
pub use status::status;
pub use tracking::{install_tracking, prune};
