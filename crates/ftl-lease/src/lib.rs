//! ftl-lease — cluster-wide TTL leases.
//!
//! A [`Leaser`] grants at most one live [`Lease`] per [`Key`]. Holders get
//! a cancellation token that fires as soon as the lease can no longer be
//! confirmed.
//!
//! ```text
//! Leaser
//!   ├── FakeLeaser   in-memory, presence only (tests)
//!   └── GrpcLeaser   AcquireLease bidi stream, keep-alive every ttl/2
//!                        │
//!                        ▼
//!                  LeaseServer ── LeaseTable (lazy expiry + sweeper)
//! ```

pub mod client;
pub mod error;
pub mod fake;
pub mod key;
pub mod leaser;
pub mod server;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("ftl.lease.v1");
}

pub use client::GrpcLeaser;
pub use error::{LeaseError, LeaseResult};
pub use fake::FakeLeaser;
pub use key::Key;
pub use leaser::{Lease, LeaseInfo, Leaser, MIN_TTL};
pub use server::{LeaseServer, LeaseTable};
