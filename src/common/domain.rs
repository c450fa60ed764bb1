/// Normalize a domain: lowercase + strip trailing dot.
pub fn normalize(domain: &str) -> String {
    let d = domain.to_ascii_lowercase();
    d.strip_suffix('.').unwrap_or(&d).to_string()
}

/// Compare two domains after normalization.
pub fn domains_equal(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

/// Check if `child` is a subdomain of `parent` (after normalization).
/// A domain is NOT a subdomain of itself.
pub fn is_subdomain_of(child: &str, parent: &str) -> bool {
    let nc = normalize(child);
    let np = normalize(parent);
    if nc == np {
        return false;
    }
    nc.ends_with(&format!(".{}", np))
}

/// Extract the local part and domain of a mailbox (split at the last `@`).
/// Returns None if no `@` is present.
pub fn split_mailbox(mailbox: &str) -> Option<(&str, &str)> {
    mailbox.rsplit_once('@')
}

/// Validate the shape of a domain before issuing any DNS query for it
/// (RFC 7208 Section 4.3): at least two labels, each 1-63 characters, at
/// most 255 characters total. The error text becomes the `None` result's
/// explanation.
pub fn validate_fqdn(domain: &str) -> Result<(), String> {
    if domain.is_empty() {
        return Err("Null domain".to_string());
    }
    if domain.len() > 255 {
        return Err(format!("Domain too long: {domain}"));
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(format!("Domain not FQDN: {domain}"));
    }
    for label in labels {
        if label.is_empty() {
            return Err(format!("Domain contains 0-length label: {domain}"));
        }
        if label.len() > 63 {
            return Err(format!("Domain label > 63 chars: {domain}"));
        }
    }
    Ok(())
}
