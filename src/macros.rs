//! SPF macro strings (RFC 7208 Section 7).
//!
//! Macro strings are compiled at record-parse time into a flat list of
//! literal and macro elements, so expansion is a linear walk and the
//! explanation-only letters (`c`, `r`, `t`) are rejected once, at parse time.
//! Expansion itself lives in the evaluator (`%{p}` performs a DNS lookup);
//! this module owns parsing and the pure string transforms.

use std::fmt;
use std::net::IpAddr;

/// Where a macro string appears. The `c`, `r` and `t` letters are legal only
/// in explanation text fetched through `exp=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroScope {
    DomainSpec,
    Explanation,
}

/// One macro letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroLetter {
    /// `s` - the sender mailbox.
    Sender,
    /// `l` - local part of the sender.
    LocalPart,
    /// `o` - domain of the sender.
    SenderDomain,
    /// `d` - the current domain.
    Domain,
    /// `i` - the client IP (dotted for v4, dotted nibbles for v6).
    Ip,
    /// `p` - the validated reverse-DNS name of the client IP.
    PtrName,
    /// `v` - `in-addr` for v4, `ip6` for v6.
    IpVersion,
    /// `h` - the EHLO/HELO parameter.
    Helo,
    /// `c` - client IP in readable form (explanation only).
    ClientIp,
    /// `r` - domain of the host performing the check (explanation only).
    Receiver,
    /// `t` - current epoch seconds (explanation only).
    Timestamp,
}

impl MacroLetter {
    /// Map a letter to its macro; uppercase selects URL escaping.
    fn from_char(c: char) -> Option<(Self, bool)> {
        let escape = c.is_ascii_uppercase();
        let letter = match c.to_ascii_lowercase() {
            's' => Self::Sender,
            'l' => Self::LocalPart,
            'o' => Self::SenderDomain,
            'd' => Self::Domain,
            'i' => Self::Ip,
            'p' => Self::PtrName,
            'v' => Self::IpVersion,
            'h' => Self::Helo,
            'c' => Self::ClientIp,
            'r' => Self::Receiver,
            't' => Self::Timestamp,
            _ => return None,
        };
        Some((letter, escape))
    }

    fn explanation_only(self) -> bool {
        matches!(self, Self::ClientIp | Self::Receiver | Self::Timestamp)
    }
}

/// A single `%{...}` expansion: letter plus transformers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroTerm {
    pub letter: MacroLetter,
    /// Keep only the rightmost N labels after splitting.
    pub digits: Option<u32>,
    /// Reverse the label order before truncating.
    pub reverse: bool,
    /// Characters to split on; empty means `.`.
    pub delimiters: String,
    /// URL-escape the expansion (uppercase letter).
    pub url_escape: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroElement {
    Literal(String),
    Macro(MacroTerm),
}

/// A parsed macro string: literal text interleaved with macro expansions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroString {
    raw: String,
    pub(crate) elements: Vec<MacroElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MacroParseError {
    #[error("dangling % at end of macro string")]
    DanglingPercent,
    #[error("invalid macro escape: %{0}")]
    InvalidEscape(char),
    #[error("unclosed macro expression")]
    Unclosed,
    #[error("empty macro expression")]
    EmptyExpression,
    #[error("unknown macro letter: {0}")]
    UnknownLetter(char),
    #[error("macro letter {0} is only valid in explanation text")]
    ExplanationOnly(char),
    #[error("digit transformer must be non-zero")]
    ZeroDigits,
    #[error("invalid digit transformer")]
    BadDigits,
    #[error("invalid delimiter character: {0}")]
    BadDelimiter(char),
}

impl MacroString {
    pub fn parse(input: &str, scope: MacroScope) -> Result<Self, MacroParseError> {
        let mut elements = Vec::new();
        let mut literal = String::new();
        let mut rest = input;

        fn flush(elements: &mut Vec<MacroElement>, literal: &mut String) {
            if !literal.is_empty() {
                elements.push(MacroElement::Literal(std::mem::take(literal)));
            }
        }

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('%') {
                let Some(escape) = after.chars().next() else {
                    return Err(MacroParseError::DanglingPercent);
                };
                match escape {
                    '%' => {
                        literal.push('%');
                        rest = &after[1..];
                    }
                    '_' => {
                        literal.push(' ');
                        rest = &after[1..];
                    }
                    '-' => {
                        literal.push_str("%20");
                        rest = &after[1..];
                    }
                    '{' => {
                        let Some((body, remain)) = after[1..].split_once('}') else {
                            return Err(MacroParseError::Unclosed);
                        };
                        flush(&mut elements, &mut literal);
                        elements.push(MacroElement::Macro(parse_term(body, scope)?));
                        rest = remain;
                    }
                    other => return Err(MacroParseError::InvalidEscape(other)),
                }
            } else {
                let c = rest.chars().next().expect("rest is non-empty");
                literal.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
        flush(&mut elements, &mut literal);

        Ok(Self {
            raw: input.to_string(),
            elements,
        })
    }

    /// The macro string as written in the record.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for MacroString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_term(body: &str, scope: MacroScope) -> Result<MacroTerm, MacroParseError> {
    let mut chars = body.chars();
    let Some(letter_char) = chars.next() else {
        return Err(MacroParseError::EmptyExpression);
    };
    let (letter, url_escape) =
        MacroLetter::from_char(letter_char).ok_or(MacroParseError::UnknownLetter(letter_char))?;
    if scope == MacroScope::DomainSpec && letter.explanation_only() {
        return Err(MacroParseError::ExplanationOnly(
            letter_char.to_ascii_lowercase(),
        ));
    }

    let rest = chars.as_str();
    let digit_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let digits = if digit_end == 0 {
        None
    } else {
        let n: u32 = rest[..digit_end]
            .parse()
            .map_err(|_| MacroParseError::BadDigits)?;
        if n == 0 {
            return Err(MacroParseError::ZeroDigits);
        }
        Some(n)
    };

    let mut rest = &rest[digit_end..];
    let reverse = match rest.strip_prefix('r') {
        Some(after) => {
            rest = after;
            true
        }
        None => false,
    };

    for c in rest.chars() {
        if !matches!(c, '.' | '-' | '+' | ',' | '/' | '_' | '=') {
            return Err(MacroParseError::BadDelimiter(c));
        }
    }

    Ok(MacroTerm {
        letter,
        digits,
        reverse,
        delimiters: rest.to_string(),
        url_escape,
    })
}

/// Apply the label transformers: split by the delimiter set (default `.`),
/// optionally reverse, keep the rightmost N labels, rejoin with dots.
pub(crate) fn transform(value: &str, digits: Option<u32>, reverse: bool, delimiters: &str) -> String {
    let delimiters = if delimiters.is_empty() { "." } else { delimiters };
    let mut parts: Vec<&str> = value.split(|c: char| delimiters.contains(c)).collect();
    if reverse {
        parts.reverse();
    }
    if let Some(n) = digits {
        let n = n as usize;
        if n < parts.len() {
            parts = parts.split_off(parts.len() - n);
        }
    }
    parts.join(".")
}

/// Percent-encode everything outside the URL unreserved set.
pub(crate) fn url_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{byte:02X}"));
        }
    }
    escaped
}

/// `%{i}`: dotted decimal for v4, 32 dot-separated nibbles for v6.
pub(crate) fn ip_macro_value(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            let mut nibbles = Vec::with_capacity(32);
            for byte in v6.octets() {
                nibbles.push(format!("{:x}", byte >> 4));
                nibbles.push(format!("{:x}", byte & 0xf));
            }
            nibbles.join(".")
        }
    }
}

/// `%{c}`: the client IP in readable form. IPv6 is rendered as eight
/// colon-separated hex groups without zero compression.
pub(crate) fn ip_readable(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6
            .segments()
            .iter()
            .map(|segment| format!("{segment:x}"))
            .collect::<Vec<_>>()
            .join(":"),
    }
}

/// `%{v}`: `in-addr` for v4, `ip6` for v6.
pub(crate) fn ip_version_token(ip: IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "in-addr",
        IpAddr::V6(_) => "ip6",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ds(s: &str) -> Result<MacroString, MacroParseError> {
        MacroString::parse(s, MacroScope::DomainSpec)
    }

    #[test]
    fn plain_text_is_one_literal() {
        let ms = parse_ds("plain.example.com").unwrap();
        assert_eq!(
            ms.elements,
            vec![MacroElement::Literal("plain.example.com".into())]
        );
    }

    #[test]
    fn escapes_become_literals() {
        let ms = MacroString::parse("a%%b%_c%-d", MacroScope::Explanation).unwrap();
        assert_eq!(ms.elements, vec![MacroElement::Literal("a%b c%20d".into())]);
    }

    #[test]
    fn macro_between_literals() {
        let ms = parse_ds("%{ir}.%{v}.arpa").unwrap();
        assert_eq!(ms.elements.len(), 4);
        match &ms.elements[0] {
            MacroElement::Macro(term) => {
                assert_eq!(term.letter, MacroLetter::Ip);
                assert!(term.reverse);
                assert_eq!(term.digits, None);
                assert!(!term.url_escape);
            }
            other => panic!("expected macro, got {other:?}"),
        }
        assert_eq!(ms.elements[1], MacroElement::Literal(".".into()));
    }

    #[test]
    fn transformers_parse_in_order() {
        let ms = parse_ds("%{d2r+-}").unwrap();
        match &ms.elements[0] {
            MacroElement::Macro(term) => {
                assert_eq!(term.letter, MacroLetter::Domain);
                assert_eq!(term.digits, Some(2));
                assert!(term.reverse);
                assert_eq!(term.delimiters, "+-");
            }
            other => panic!("expected macro, got {other:?}"),
        }
    }

    #[test]
    fn uppercase_letter_selects_url_escape() {
        let ms = parse_ds("%{S}").unwrap();
        match &ms.elements[0] {
            MacroElement::Macro(term) => {
                assert_eq!(term.letter, MacroLetter::Sender);
                assert!(term.url_escape);
            }
            other => panic!("expected macro, got {other:?}"),
        }
    }

    #[test]
    fn dangling_percent_rejected() {
        assert_eq!(parse_ds("foo%"), Err(MacroParseError::DanglingPercent));
    }

    #[test]
    fn invalid_escape_rejected() {
        assert_eq!(parse_ds("foo%x"), Err(MacroParseError::InvalidEscape('x')));
    }

    #[test]
    fn unclosed_macro_rejected() {
        assert_eq!(parse_ds("%{d"), Err(MacroParseError::Unclosed));
    }

    #[test]
    fn unknown_letter_rejected() {
        assert_eq!(parse_ds("%{x}"), Err(MacroParseError::UnknownLetter('x')));
    }

    #[test]
    fn zero_digit_transformer_rejected() {
        assert_eq!(parse_ds("%{d0}"), Err(MacroParseError::ZeroDigits));
    }

    #[test]
    fn bad_delimiter_rejected() {
        assert_eq!(parse_ds("%{d2rz}"), Err(MacroParseError::BadDelimiter('z')));
    }

    #[test]
    fn uppercase_reverse_flag_is_not_a_delimiter() {
        assert_eq!(parse_ds("%{dR}"), Err(MacroParseError::BadDelimiter('R')));
    }

    #[test]
    fn explanation_letters_rejected_in_domain_spec() {
        for raw in ["%{c}", "%{r}", "%{t}", "%{C}"] {
            assert!(
                matches!(parse_ds(raw), Err(MacroParseError::ExplanationOnly(_))),
                "{raw} should be rejected outside explanation text"
            );
        }
    }

    #[test]
    fn explanation_letters_allowed_in_explanation_scope() {
        for raw in ["%{c}", "%{r}", "%{t}"] {
            assert!(MacroString::parse(raw, MacroScope::Explanation).is_ok());
        }
    }

    // --- transforms ---

    #[test]
    fn transform_noop_without_transformers() {
        assert_eq!(transform("example.com", None, false, ""), "example.com");
    }

    #[test]
    fn transform_reverse() {
        assert_eq!(transform("1.2.0.192", None, true, ""), "192.0.2.1");
    }

    #[test]
    fn transform_rightmost_n() {
        assert_eq!(transform("a.b.example.com", Some(2), false, ""), "example.com");
    }

    #[test]
    fn transform_reverse_then_truncate() {
        // reverse first, then keep the rightmost label
        assert_eq!(transform("example.com", Some(1), true, ""), "example");
    }

    #[test]
    fn transform_custom_delimiter_rejoins_with_dots() {
        assert_eq!(transform("user-name", None, false, "-"), "user.name");
    }

    #[test]
    fn transform_n_larger_than_parts_keeps_all() {
        assert_eq!(transform("example.com", Some(9), false, ""), "example.com");
    }

    #[test]
    fn url_escape_unreserved_passthrough() {
        assert_eq!(url_escape("user@example.com"), "user%40example.com");
        assert_eq!(url_escape("a-b_c.d~e"), "a-b_c.d~e");
    }

    #[test]
    fn ip_macro_v4_is_dotted_decimal() {
        assert_eq!(ip_macro_value("192.0.2.1".parse().unwrap()), "192.0.2.1");
    }

    #[test]
    fn ip_macro_v6_is_dotted_nibbles() {
        let value = ip_macro_value("2001:db8::1".parse().unwrap());
        assert_eq!(
            value,
            "2.0.0.1.0.d.b.8.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.1"
        );
        assert_eq!(value.chars().filter(|c| *c == '.').count(), 31);
    }

    #[test]
    fn ip_readable_v6_keeps_all_groups() {
        assert_eq!(
            ip_readable("1234:5678::90ab:cd3f".parse().unwrap()),
            "1234:5678:0:0:0:0:90ab:cd3f"
        );
    }

    #[test]
    fn ip_version_tokens() {
        assert_eq!(ip_version_token("1.2.3.4".parse().unwrap()), "in-addr");
        assert_eq!(ip_version_token("::1".parse().unwrap()), "ip6");
    }
}
