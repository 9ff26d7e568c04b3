//! CLI command implementations.

mod build;
mod scan;
mod worker;

pub use build::{cmd_build, BuildArgs};
pub use scan::cmd_scan;
pub use worker::cmd_worker;
