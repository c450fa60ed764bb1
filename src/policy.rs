//! SPF record parsing: `"v=spf1" *(SP term)` into a [`Policy`].

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::macros::{MacroParseError, MacroScope, MacroString};
use crate::mechanism::{Directive, DualCidr, Mechanism, Qualifier};

/// A parsed SPF record: directives in order, at most one `redirect` and one
/// `exp` modifier. Unknown modifiers are validated and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub directives: Vec<Directive>,
    pub redirect: Option<MacroString>,
    pub exp: Option<MacroString>,
}

/// Record parse failures. Every variant maps to Permerror with the fixed
/// `"Invalid spf record syntax."` explanation at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpfParseError {
    #[error("record does not start with v=spf1")]
    InvalidVersion,
    #[error("unknown mechanism: {0}")]
    UnknownMechanism(String),
    #[error("duplicate {0} modifier")]
    DuplicateModifier(&'static str),
    #[error("missing argument for {0}")]
    MissingArgument(&'static str),
    #[error("mechanism {0} takes no argument")]
    UnexpectedArgument(&'static str),
    #[error("invalid CIDR prefix: {0}")]
    InvalidCidr(String),
    #[error("invalid {0} address: {1}")]
    InvalidAddress(&'static str, String),
    #[error(transparent)]
    Macro(#[from] MacroParseError),
}

impl Policy {
    pub fn parse(record: &str) -> Result<Self, SpfParseError> {
        let record = record.trim();
        if record.len() < 6 || !record.as_bytes()[..6].eq_ignore_ascii_case(b"v=spf1") {
            return Err(SpfParseError::InvalidVersion);
        }
        let body = &record[6..];
        if !body.is_empty() && !body.starts_with(' ') {
            return Err(SpfParseError::InvalidVersion);
        }

        let mut directives = Vec::new();
        let mut redirect = None;
        let mut exp = None;

        for term in body.split_whitespace() {
            if let Some((name, value)) = split_modifier(term) {
                if name.eq_ignore_ascii_case("redirect") {
                    if redirect.is_some() {
                        return Err(SpfParseError::DuplicateModifier("redirect"));
                    }
                    if value.is_empty() {
                        return Err(SpfParseError::MissingArgument("redirect"));
                    }
                    redirect = Some(MacroString::parse(value, MacroScope::DomainSpec)?);
                } else if name.eq_ignore_ascii_case("exp") {
                    if exp.is_some() {
                        return Err(SpfParseError::DuplicateModifier("exp"));
                    }
                    if value.is_empty() {
                        return Err(SpfParseError::MissingArgument("exp"));
                    }
                    exp = Some(MacroString::parse(value, MacroScope::DomainSpec)?);
                } else {
                    // Unknown modifier: must still be a well-formed macro
                    // string, but is otherwise ignored, even when repeated.
                    // The value is never expanded, so the explanation-only
                    // letters are tolerated here.
                    MacroString::parse(value, MacroScope::Explanation)?;
                }
                continue;
            }
            directives.push(parse_directive(term)?);
        }

        Ok(Policy {
            directives,
            redirect,
            exp,
        })
    }

}

/// Split a term into modifier name and value. A term is a modifier when the
/// text before the first `=` is a valid modifier name:
/// `ALPHA *( ALPHA / DIGIT / "-" / "_" / "." )`.
fn split_modifier(term: &str) -> Option<(&str, &str)> {
    let eq = term.find('=')?;
    let name = &term[..eq];
    let mut chars = name.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return None;
    }
    Some((name, &term[eq + 1..]))
}

fn parse_directive(term: &str) -> Result<Directive, SpfParseError> {
    let (qualifier, rest) = Qualifier::parse_prefix(term);
    let name_end = rest.find([':', '/']).unwrap_or(rest.len());
    let name = &rest[..name_end];
    let after = &rest[name_end..];

    let mechanism = if name.eq_ignore_ascii_case("all") {
        if !after.is_empty() {
            return Err(SpfParseError::UnexpectedArgument("all"));
        }
        Mechanism::All
    } else if name.eq_ignore_ascii_case("include") {
        Mechanism::Include(required_domain_spec(after, "include")?)
    } else if name.eq_ignore_ascii_case("a") {
        let (domain, cidr) = parse_domain_and_cidr(after, "a")?;
        Mechanism::A { domain, cidr }
    } else if name.eq_ignore_ascii_case("mx") {
        let (domain, cidr) = parse_domain_and_cidr(after, "mx")?;
        Mechanism::Mx { domain, cidr }
    } else if name.eq_ignore_ascii_case("ptr") {
        Mechanism::Ptr(optional_domain_spec(after, "ptr")?)
    } else if name.eq_ignore_ascii_case("ip4") {
        parse_ip4(after)?
    } else if name.eq_ignore_ascii_case("ip6") {
        parse_ip6(after)?
    } else if name.eq_ignore_ascii_case("exists") {
        Mechanism::Exists(required_domain_spec(after, "exists")?)
    } else {
        return Err(SpfParseError::UnknownMechanism(term.to_string()));
    };

    Ok(Directive {
        qualifier,
        mechanism,
        term: term.to_string(),
    })
}

/// `":" domain-spec` where the domain spec is mandatory and no CIDR suffix
/// is allowed (include, exists).
fn required_domain_spec(after: &str, mech: &'static str) -> Result<MacroString, SpfParseError> {
    match after.strip_prefix(':') {
        Some(spec) if !spec.is_empty() => Ok(MacroString::parse(spec, MacroScope::DomainSpec)?),
        _ => Err(SpfParseError::MissingArgument(mech)),
    }
}

/// `[":" domain-spec]` with no CIDR suffix (ptr).
fn optional_domain_spec(
    after: &str,
    mech: &'static str,
) -> Result<Option<MacroString>, SpfParseError> {
    if after.is_empty() {
        return Ok(None);
    }
    required_domain_spec(after, mech).map(Some)
}

/// `[":" domain-spec]["/" cidr4]["//" cidr6]` for the a and mx mechanisms.
fn parse_domain_and_cidr(
    after: &str,
    mech: &'static str,
) -> Result<(Option<MacroString>, DualCidr), SpfParseError> {
    let (domain_part, cidr_part) = match after.strip_prefix(':') {
        Some(body) => match body.find('/') {
            Some(slash) => (&body[..slash], &body[slash..]),
            None => (body, ""),
        },
        None => ("", after),
    };

    let domain = if after.starts_with(':') {
        if domain_part.is_empty() {
            return Err(SpfParseError::MissingArgument(mech));
        }
        Some(MacroString::parse(domain_part, MacroScope::DomainSpec)?)
    } else {
        None
    };

    Ok((domain, parse_dual_cidr(cidr_part)?))
}

/// Parse `""`, `"/N"`, `"//M"`, or `"/N//M"`.
fn parse_dual_cidr(s: &str) -> Result<DualCidr, SpfParseError> {
    let mut cidr = DualCidr::default();
    if s.is_empty() {
        return Ok(cidr);
    }

    let (v4_part, v6_part) = match s.find("//") {
        Some(pos) => (&s[..pos], Some(&s[pos + 2..])),
        None => (s, None),
    };

    if !v4_part.is_empty() {
        let digits = v4_part
            .strip_prefix('/')
            .ok_or_else(|| SpfParseError::InvalidCidr(s.to_string()))?;
        cidr.v4 = parse_prefix_len(digits, 32)?;
    }
    if let Some(digits) = v6_part {
        cidr.v6 = parse_prefix_len(digits, 128)?;
    }
    Ok(cidr)
}

fn parse_prefix_len(digits: &str, max: u8) -> Result<u8, SpfParseError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SpfParseError::InvalidCidr(digits.to_string()));
    }
    let len: u8 = digits
        .parse()
        .map_err(|_| SpfParseError::InvalidCidr(digits.to_string()))?;
    if len > max {
        return Err(SpfParseError::InvalidCidr(digits.to_string()));
    }
    Ok(len)
}

fn parse_ip4(after: &str) -> Result<Mechanism, SpfParseError> {
    let arg = after
        .strip_prefix(':')
        .filter(|a| !a.is_empty())
        .ok_or(SpfParseError::MissingArgument("ip4"))?;
    let (addr_str, prefix_len) = match arg.find('/') {
        Some(slash) => (&arg[..slash], parse_prefix_len(&arg[slash + 1..], 32)?),
        None => (arg, 32),
    };
    // Ipv4Addr's parser already rejects omitted octets like "10.10.100".
    let addr: Ipv4Addr = addr_str
        .parse()
        .map_err(|_| SpfParseError::InvalidAddress("ip4", addr_str.to_string()))?;
    Ok(Mechanism::Ip4 { addr, prefix_len })
}

fn parse_ip6(after: &str) -> Result<Mechanism, SpfParseError> {
    let arg = after
        .strip_prefix(':')
        .filter(|a| !a.is_empty())
        .ok_or(SpfParseError::MissingArgument("ip6"))?;
    // The address itself contains colons but never '/', so the prefix is
    // whatever follows the last slash.
    let (addr_str, prefix_len) = match arg.rfind('/') {
        Some(slash) => (&arg[..slash], parse_prefix_len(&arg[slash + 1..], 128)?),
        None => (arg, 128),
    };
    let addr: Ipv6Addr = addr_str
        .parse()
        .map_err(|_| SpfParseError::InvalidAddress("ip6", addr_str.to_string()))?;
    Ok(Mechanism::Ip6 { addr, prefix_len })
}
