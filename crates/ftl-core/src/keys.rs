//! Typed identifiers.
//!
//! Both key kinds wrap a ULID and render as `ftl:<kind>:<ULID>` using
//! Crockford's base32 alphabet. Parsing rejects any other shape.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

const ULID_LEN: usize = 26;

/// A string that is not a valid key of the expected kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} key: {input:?}")]
pub struct KeyError {
    pub kind: &'static str,
    pub input: String,
}

macro_rules! typed_key {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(Ulid);

        impl $name {
            /// Textual prefix preceding the ULID.
            pub const PREFIX: &'static str = concat!("ftl:", $kind, ":");

            /// Generate a fresh key.
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            pub fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            pub fn ulid(&self) -> Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", Self::PREFIX, self.0)
            }
        }

        impl FromStr for $name {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let invalid = || KeyError {
                    kind: $kind,
                    input: s.to_string(),
                };
                let encoded = s.strip_prefix(Self::PREFIX).ok_or_else(invalid)?;
                if encoded.len() != ULID_LEN {
                    return Err(invalid());
                }
                Ulid::from_string(encoded).map(Self).map_err(|_| invalid())
            }
        }

        impl TryFrom<String> for $name {
            type Error = KeyError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(key: $name) -> String {
                key.to_string()
            }
        }
    };
}

typed_key!(
    /// Identifies one immutable deployment of a module.
    DeploymentKey,
    "deployment"
);

typed_key!(
    /// Identifies a runner process hosting a deployment.
    RunnerKey,
    "runner"
);

impl RunnerKey {
    /// Deterministic key for locally supervised runners.
    ///
    /// The counter is encoded in the random component with a zero
    /// timestamp, so runner `n` always renders the same way.
    pub fn new_local(suffix: u64) -> Self {
        Self(Ulid::from_parts(0, u128::from(suffix)))
    }
}
