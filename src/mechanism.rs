//! SPF mechanism and directive types (RFC 7208 Section 5).

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::macros::MacroString;
use crate::ResultCode;

/// Qualifier prefix on a directive. Defaults to Pass if omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Pass,     // +
    Fail,     // -
    Softfail, // ~
    Neutral,  // ?
}

impl Qualifier {
    /// Split an optional qualifier prefix off a term. Defaults to Pass.
    pub fn parse_prefix(s: &str) -> (Qualifier, &str) {
        match s.as_bytes().first() {
            Some(b'+') => (Qualifier::Pass, &s[1..]),
            Some(b'-') => (Qualifier::Fail, &s[1..]),
            Some(b'~') => (Qualifier::Softfail, &s[1..]),
            Some(b'?') => (Qualifier::Neutral, &s[1..]),
            _ => (Qualifier::Pass, s),
        }
    }

    /// The result code a match under this qualifier produces.
    pub fn result_code(self) -> ResultCode {
        match self {
            Qualifier::Pass => ResultCode::Pass,
            Qualifier::Fail => ResultCode::Fail,
            Qualifier::Softfail => ResultCode::Softfail,
            Qualifier::Neutral => ResultCode::Neutral,
        }
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Qualifier::Pass => "+",
            Qualifier::Fail => "-",
            Qualifier::Softfail => "~",
            Qualifier::Neutral => "?",
        })
    }
}

/// CIDR prefix length pair for the `a` and `mx` mechanisms.
/// Defaults to full length (32 / 128) when not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualCidr {
    pub v4: u8,
    pub v6: u8,
}

impl Default for DualCidr {
    fn default() -> Self {
        Self { v4: 32, v6: 128 }
    }
}

/// SPF mechanism (RFC 7208 Section 5). Domain specs are pre-compiled macro
/// strings; `None` means "use the current domain".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    /// `all`
    All,
    /// `include:<domain-spec>`
    Include(MacroString),
    /// `a[:<domain-spec>][/cidr4][//cidr6]`
    A {
        domain: Option<MacroString>,
        cidr: DualCidr,
    },
    /// `mx[:<domain-spec>][/cidr4][//cidr6]`
    Mx {
        domain: Option<MacroString>,
        cidr: DualCidr,
    },
    /// `ptr[:<domain-spec>]`
    Ptr(Option<MacroString>),
    /// `ip4:<network>[/cidr]`
    Ip4 { addr: Ipv4Addr, prefix_len: u8 },
    /// `ip6:<network>[/cidr]`
    Ip6 { addr: Ipv6Addr, prefix_len: u8 },
    /// `exists:<domain-spec>`
    Exists(MacroString),
}

/// A directive = qualifier + mechanism. Keeps the term as written in the
/// record for the default `"Matched ..."` explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
    pub term: String,
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.term)
    }
}
