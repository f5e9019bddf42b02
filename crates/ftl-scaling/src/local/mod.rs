//! Local scaling: runners as child processes on this machine.

mod balancer;
mod engine;
mod ide;
mod launcher;
mod ports;

pub use balancer::RoundRobin;
pub use engine::{LocalEndpoint, LocalScaling, LocalSettings};
pub use ide::{DebugInfo, IdeError, IdeIntegration};
pub use launcher::{LaunchError, ProcessLauncher, RunnerConfig, RunnerLauncher};
pub use ports::allocate_port;
