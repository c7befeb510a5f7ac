//! portlift - joined lifecycle supervision for a local service and a tunnel relay
//!
//! This crate starts a local application process, starts an external
//! tunnel-relay CLI that exposes the application's port to the public
//! internet, watches the relay's streamed output for the dynamically
//! assigned public endpoint, and guarantees that the two processes live
//! and die together.

mod config;
mod endpoint;
mod error;
mod install;
mod process;
mod relay;
mod spawner;
mod supervisor;

pub use config::*;
pub use endpoint::*;
pub use error::*;
pub use install::*;
pub use process::*;
pub use relay::*;
pub use spawner::*;
pub use supervisor::*;
