//! Structured lease keys.
//!
//! A key is an ordered list of segments whose first segment is either
//! `system` (internal singletons) or `module` (user leases, second segment
//! is the module name). The textual form joins the percent-escaped
//! segments with `/`, e.g. `/module/echo/cron%2Fjob`.

use std::fmt;
use std::str::FromStr;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

use crate::error::LeaseError;

/// Everything but RFC 3986 unreserved characters is escaped.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const SYSTEM: &str = "system";
const MODULE: &str = "module";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(Vec<String>);

impl Key {
    /// Internal key, `/system/<parts...>`.
    pub fn system<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut segments = vec![SYSTEM.to_string()];
        segments.extend(parts.into_iter().map(Into::into));
        Self(segments)
    }

    /// Key scoped to a module, `/module/<module>/<parts...>`.
    pub fn module<I, S>(module: impl Into<String>, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut segments = vec![MODULE.to_string(), module.into()];
        segments.extend(parts.into_iter().map(Into::into));
        Self(segments)
    }

    /// Build a key from raw (unescaped) segments, as carried on the wire.
    pub fn from_segments(segments: Vec<String>) -> Result<Self, LeaseError> {
        match segments.first().map(String::as_str) {
            Some(SYSTEM) if segments.len() >= 2 => Ok(Self(segments)),
            Some(MODULE) if segments.len() >= 2 => Ok(Self(segments)),
            _ => Err(LeaseError::InvalidArgument(format!(
                "lease key must start with /system/ or /module/: {segments:?}"
            ))),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Module owning a `/module/...` key.
    pub fn module_name(&self) -> Option<&str> {
        match self.0.as_slice() {
            [kind, module, ..] if kind == MODULE => Some(module.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            write!(f, "/{}", utf8_percent_encode(segment, SEGMENT))?;
        }
        Ok(())
    }
}

impl FromStr for Key {
    type Err = LeaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !(s.starts_with("/system/") || s.starts_with("/module/")) {
            return Err(LeaseError::InvalidArgument(format!(
                "lease key must start with /system/ or /module/: {s:?}"
            )));
        }
        let segments = s[1..]
            .split('/')
            .map(|segment| {
                percent_decode_str(segment)
                    .decode_utf8()
                    .map(|decoded| decoded.into_owned())
                    .map_err(|_| {
                        LeaseError::InvalidArgument(format!("invalid escape in lease key {s:?}"))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_segments(segments)
    }
}
