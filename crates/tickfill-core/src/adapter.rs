//! Source adapter contract.
//!
//! An adapter turns a [`Cursor`] for one entity into raw records. The sync
//! loop never inspects provider payloads beyond the [`FetchBatch`] it gets
//! back; "no more data" is signalled through [`FetchBatch::exhausted`] rather
//! than through an error.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;

use crate::cursor::Cursor;
use crate::domain::{Entity, RawRecord};

/// Whether retrying the same request can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    Timeout,
    RateLimited,
    Unavailable,
    InvalidRequest,
    MalformedResponse,
    Internal,
}

/// Adapter failure surfaced to the sync loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterError {
    kind: AdapterErrorKind,
    message: String,
    class: ErrorClass,
}

impl AdapterError {
    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: AdapterErrorKind::Timeout,
            message: format!("adapter call timed out after {}ms", after.as_millis()),
            class: ErrorClass::Transient,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::RateLimited,
            message: message.into(),
            class: ErrorClass::Transient,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Unavailable,
            message: message.into(),
            class: ErrorClass::Transient,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::InvalidRequest,
            message: message.into(),
            class: ErrorClass::Permanent,
        }
    }

    pub fn malformed_response(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::MalformedResponse,
            message: message.into(),
            class: ErrorClass::Permanent,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Internal,
            message: message.into(),
            class: ErrorClass::Permanent,
        }
    }

    pub const fn kind(&self) -> AdapterErrorKind {
        self.kind
    }

    pub const fn class(&self) -> ErrorClass {
        self.class
    }

    pub const fn is_transient(&self) -> bool {
        matches!(self.class, ErrorClass::Transient)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            AdapterErrorKind::Timeout => "adapter.timeout",
            AdapterErrorKind::RateLimited => "adapter.rate_limited",
            AdapterErrorKind::Unavailable => "adapter.unavailable",
            AdapterErrorKind::InvalidRequest => "adapter.invalid_request",
            AdapterErrorKind::MalformedResponse => "adapter.malformed_response",
            AdapterErrorKind::Internal => "adapter.internal",
        }
    }
}

impl Display for AdapterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message)
    }
}

impl std::error::Error for AdapterError {}

/// Records returned by one adapter call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchBatch {
    pub records: Vec<RawRecord>,
    /// The source has nothing beyond these records for now.
    pub exhausted: bool,
}

impl FetchBatch {
    pub fn new(records: Vec<RawRecord>, exhausted: bool) -> Self {
        Self { records, exhausted }
    }

    /// Batch marked exhausted when fewer than `requested` records came back.
    pub fn sized(records: Vec<RawRecord>, requested: usize) -> Self {
        let exhausted = records.len() < requested;
        Self { records, exhausted }
    }

    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            exhausted: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Pluggable record source.
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn fetch<'a>(
        &'a self,
        entity: &'a Entity,
        cursor: &'a Cursor,
    ) -> Pin<Box<dyn Future<Output = Result<FetchBatch, AdapterError>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_class_follows_kind() {
        assert!(AdapterError::rate_limited("slow down").is_transient());
        assert!(AdapterError::timeout(Duration::from_secs(1)).is_transient());
        assert_eq!(AdapterError::invalid_request("bad").class(), ErrorClass::Permanent);
        assert_eq!(AdapterError::unavailable("503").code(), "adapter.unavailable");
    }

    #[test]
    fn sized_batch_flags_short_reads() {
        assert!(FetchBatch::sized(Vec::new(), 10).exhausted);
        assert!(!FetchBatch::sized(vec![RawRecord::new()], 1).exhausted);
    }
}
