//! Error classification shared by every component.
//!
//! Each area owns its own error enum; this module only answers the question
//! the executor and the bulk engine care about: may this failure be retried?

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input. Surfaced immediately, never retried.
    Validation,
    /// Network timeout, rate limit, busy runtime. Retried with backoff.
    Transient,
    /// Not found, permission denied, unsupported strategy. Never retried.
    Permanent,
    /// Some targets of a batch failed.
    PartialFailure,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Validation => write!(f, "validation"),
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::PartialFailure => write!(f, "partial_failure"),
        }
    }
}

pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
