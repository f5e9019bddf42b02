//! ftl-leader — one leader per lease key, everyone else follows.
//!
//! A [`Coordinator`] hands callers a value `P` that is either the local
//! leader (built when this process wins the lease) or a follower routed to
//! the URL the current leader advertised in the lease metadata. Callers
//! never need to know which one they hold.
//!
//! [`ErrorFilter`] helps followers tell a leader failover apart from a
//! persistent failure.

pub mod coordinator;
pub mod error;
pub mod error_filter;

pub use coordinator::{Coordinator, FollowerFactory, LeaderFactory, follower_factory, leader_factory};
pub use error::CoordinatorError;
pub use error_filter::{ErrorFilter, FailureKind};
