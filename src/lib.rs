//! SPF (Sender Policy Framework) policy evaluator, RFC 7208.
//!
//! The entry point is [`SpfVerifier::check_host`]: given a client IP, a
//! sending domain, the sender mailbox and the EHLO parameter, it decides
//! whether the IP is authorized to send mail for that domain. DNS I/O goes
//! through the [`common::dns::DnsResolver`] trait; implement it with caching
//! at the resolver layer if you need caching.

pub mod common;
pub mod eval;
pub mod macros;
pub mod mechanism;
pub mod policy;

pub use common::dns::{DnsError, DnsResolver, HickoryResolver, MockResolver};
pub use eval::{Settings, SpfVerifier};
pub use policy::{Policy, SpfParseError};

use std::fmt;

/// SPF evaluation outcome codes (RFC 7208 Section 2.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// The client is authorized.
    Pass,
    /// The client is explicitly not authorized.
    Fail,
    /// The client is probably not authorized.
    Softfail,
    /// The domain makes no assertion.
    Neutral,
    /// No SPF record was published, or the domain is not checkable.
    None,
    /// A transient DNS error prevented a verdict.
    Temperror,
    /// The published record is invalid or exceeded processing limits.
    Permerror,
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResultCode::Pass => "pass",
            ResultCode::Fail => "fail",
            ResultCode::Softfail => "softfail",
            ResultCode::Neutral => "neutral",
            ResultCode::None => "none",
            ResultCode::Temperror => "temperror",
            ResultCode::Permerror => "permerror",
        })
    }
}

/// The result of a `check_host` evaluation: a code plus an optional
/// human-readable explanation (the `exp=` text for `Fail`, otherwise a short
/// description of what matched or went wrong).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfResult {
    pub code: ResultCode,
    pub explanation: Option<String>,
}

impl SpfResult {
    pub(crate) fn with_explanation(code: ResultCode, explanation: impl Into<String>) -> Self {
        Self {
            code,
            explanation: Some(explanation.into()),
        }
    }
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.explanation {
            Some(explanation) => write!(f, "{} ({})", self.code, explanation),
            None => write!(f, "{}", self.code),
        }
    }
}
