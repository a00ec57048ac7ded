//! Session orchestrator that runs coding agents inside sandboxes and
//! multiplexes their output into one event stream.

pub mod app;
pub mod cli;
pub mod config;
pub mod multiplexer;
pub mod orchestrator;
pub mod registry;
pub mod router_setup;

pub use app::build_router;
pub use config::{RelayConfig, RouterSettings};
pub use orchestrator::{Orchestrator, RunRequest, RunState};
pub use registry::{RecordOutcome, SessionRegistry};
pub use router_setup::RouterStatus;
