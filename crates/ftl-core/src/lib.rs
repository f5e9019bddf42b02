//! ftl-core — shared types for the FTL control plane.
//!
//! - **`keys`** — ULID-backed `DeploymentKey` / `RunnerKey` with a stable
//!   `ftl:<kind>:<ulid>` textual form
//! - **`schema`** — the slice of the module schema the scaling engines
//!   consume (runtime, verbs and their `calls` metadata)
//! - **`config`** — TOML control plane configuration

pub mod config;
pub mod keys;
pub mod schema;

pub use config::{ConfigError, ControlPlaneConfig, ReplicaPolicy};
pub use keys::{DeploymentKey, KeyError, RunnerKey};
pub use schema::{ChangeType, Module, SchemaChange};
