//! The `check_host` evaluation engine (RFC 7208 Section 4).
//!
//! One [`Evaluation`] is created per top-level `check_host` call and threaded
//! mutably through `include`/`redirect` recursion, so the DNS lookup and
//! void-lookup counters are shared across the whole call tree while the
//! client identity stays fixed and only the current domain is rewritten.
//! Aborting conditions (budget exceeded, transient DNS failures, structural
//! policy errors) unwind as the `Err` arm of an internal `Result` and are
//! materialized into an [`SpfResult`] at each `check_host` boundary.

use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace};

use crate::common::cidr;
use crate::common::dns::{reverse_name, DnsError, DnsResolver};
use crate::common::domain;
use crate::macros::{self, MacroElement, MacroLetter, MacroScope, MacroString};
use crate::mechanism::{DualCidr, Mechanism};
use crate::policy::Policy;
use crate::{ResultCode, SpfResult};

/// Injection-time knobs. There are no dynamic flags: construct a verifier
/// with the settings you want.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Total DNS-lookup budget per check (RFC 7208 mandates 10).
    pub lookup_limit: usize,
    /// Budget for lookups that produce no usable answer.
    pub void_lookup_limit: usize,
    /// Domain of the host performing the check, for the `%{r}` macro.
    pub host_domain: String,
    /// Macro string prepended to fetched `exp=` text before expansion.
    pub explain_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lookup_limit: 10,
            void_lookup_limit: 2,
            host_domain: "unknown".to_string(),
            explain_prefix: "%{d} explained: ".to_string(),
        }
    }
}

/// SPF verifier. Holds the resolver and settings; every `check_host` call
/// gets fresh counters, so a shared verifier is safe to use from concurrent
/// tasks as long as the resolver is.
pub struct SpfVerifier<R> {
    resolver: R,
    settings: Settings,
}

impl<R: DnsResolver> SpfVerifier<R> {
    pub fn new(resolver: R) -> Self {
        Self::with_settings(resolver, Settings::default())
    }

    pub fn with_settings(resolver: R, settings: Settings) -> Self {
        Self { resolver, settings }
    }

    /// Evaluate SPF for a client (RFC 7208 check_host()).
    ///
    /// `domain` is the sending domain per MAIL FROM or HELO; `sender` is the
    /// full mailbox, where `""`, whitespace and `"<>"` all mean "no sender";
    /// `helo` is the EHLO parameter. Never fails: every internal condition
    /// maps to one of the seven result codes.
    pub async fn check_host(
        &self,
        ip: IpAddr,
        domain: &str,
        sender: &str,
        helo: &str,
    ) -> SpfResult {
        let mut eval = Evaluation {
            resolver: &self.resolver,
            settings: &self.settings,
            subject: Subject::new(ip, domain, sender, helo),
            lookups_used: 0,
            void_lookups_used: 0,
        };
        let result = eval.check_host(domain).await;
        debug!(
            %ip,
            domain,
            code = %result.code,
            lookups = eval.lookups_used,
            "SPF check complete"
        );
        result
    }
}

/// Unwinds the recursion, replacing any in-flight result.
#[derive(Debug, Clone)]
struct Abort {
    code: ResultCode,
    message: String,
}

impl Abort {
    fn none(message: impl Into<String>) -> Self {
        Self {
            code: ResultCode::None,
            message: message.into(),
        }
    }

    fn temperror(message: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Temperror,
            message: message.into(),
        }
    }

    fn permerror(message: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Permerror,
            message: message.into(),
        }
    }
}

/// The parts of the evaluation that never change across recursion.
struct Subject {
    ip: IpAddr,
    sender: String,
    local_part: String,
    sender_domain: String,
    helo: String,
}

impl Subject {
    fn new(ip: IpAddr, domain: &str, sender: &str, helo: &str) -> Self {
        let sender = sender.trim();
        let (sender, local_part, sender_domain) = if sender.is_empty() || sender == "<>" {
            // RFC 7208 Section 2.4: a null reverse-path is checked as
            // postmaster at the given domain.
            (
                format!("postmaster@{domain}"),
                "postmaster".to_string(),
                domain.to_string(),
            )
        } else {
            match domain::split_mailbox(sender) {
                Some((local, mailbox_domain)) => {
                    let local = if local.is_empty() { "postmaster" } else { local };
                    let mailbox_domain = if mailbox_domain.is_empty() {
                        domain
                    } else {
                        mailbox_domain
                    };
                    (
                        sender.to_string(),
                        local.to_string(),
                        mailbox_domain.to_string(),
                    )
                }
                // A sender with no local-part is a bare domain; RFC 7208
                // Section 7.3 substitutes "postmaster".
                None => (
                    sender.to_string(),
                    "postmaster".to_string(),
                    sender.to_string(),
                ),
            }
        };
        Self {
            ip,
            sender,
            local_part,
            sender_domain,
            helo: helo.to_string(),
        }
    }
}

/// Per-top-level-check state: shared counters plus the fixed subject.
struct Evaluation<'a, R> {
    resolver: &'a R,
    settings: &'a Settings,
    subject: Subject,
    lookups_used: usize,
    void_lookups_used: usize,
}

impl<R: DnsResolver> Evaluation<'_, R> {
    /// One recursion frame: evaluate `domain` and materialize any abort.
    /// Boxed because `include`/`redirect` re-enter it recursively.
    fn check_host<'a>(
        &'a mut self,
        domain: &'a str,
    ) -> Pin<Box<dyn Future<Output = SpfResult> + Send + 'a>> {
        Box::pin(async move {
            trace!(domain, "evaluating SPF policy");
            match self.evaluate(domain).await {
                Ok(result) => result,
                Err(abort) => SpfResult {
                    code: abort.code,
                    explanation: Some(abort.message),
                },
            }
        })
    }

    async fn evaluate(&mut self, domain: &str) -> Result<SpfResult, Abort> {
        domain::validate_fqdn(domain).map_err(Abort::none)?;
        let record = self.lookup_spf_record(domain).await?;
        let policy = match Policy::parse(&record) {
            Ok(policy) => policy,
            Err(err) => {
                debug!(domain, %err, "unparsable SPF record");
                return Ok(SpfResult::with_explanation(
                    ResultCode::Permerror,
                    "Invalid spf record syntax.",
                ));
            }
        };

        let mut matched = None;
        for directive in &policy.directives {
            if self.eval_mechanism(&directive.mechanism, domain).await? {
                matched = Some(SpfResult::with_explanation(
                    directive.qualifier.result_code(),
                    format!("Matched {directive}."),
                ));
                break;
            }
        }

        match matched {
            Some(mut result) => {
                if result.code == ResultCode::Fail {
                    if let Some(exp) = &policy.exp {
                        if let Some(text) = self.expand_explanation(exp, domain).await? {
                            result.explanation = Some(text);
                        }
                    }
                }
                Ok(result)
            }
            // A record containing `all` always matches, so reaching this arm
            // implies there was no `all` directive and any `redirect=` is
            // live (RFC 7208 Section 6.1).
            None => match &policy.redirect {
                Some(redirect) => {
                    self.count_lookup()?;
                    let target = self.expand(redirect, domain).await?;
                    let mut inner = self.check_host(&target).await;
                    if inner.code == ResultCode::None {
                        inner.code = ResultCode::Permerror;
                    }
                    Ok(inner)
                }
                None => Ok(SpfResult::with_explanation(
                    ResultCode::Neutral,
                    "No directives matched.",
                )),
            },
        }
    }

    /// Fetch the single SPF TXT record for `domain`.
    async fn lookup_spf_record(&mut self, domain: &str) -> Result<String, Abort> {
        let records = match self.resolver.resolve_txt(domain).await {
            Ok(records) => records,
            Err(DnsError::NxDomain(_)) => Vec::new(),
            Err(err @ DnsError::InvalidName(_)) => return Err(Abort::none(err.to_string())),
            Err(err) => return Err(Abort::temperror(err.to_string())),
        };
        let mut spf: Vec<String> = records
            .into_iter()
            .filter(|r| has_spf_version(r))
            .collect();
        match spf.len() {
            0 => Err(Abort::none(format!("No SPF record found for: {domain}"))),
            1 => Ok(spf.remove(0)),
            _ => Err(Abort::permerror(format!(
                "Multiple SPF records found for: {domain}"
            ))),
        }
    }

    /// Returns whether the mechanism matches the client. Mechanisms after a
    /// match are never evaluated, so `all` shields anything behind it.
    async fn eval_mechanism(&mut self, mechanism: &Mechanism, domain: &str) -> Result<bool, Abort> {
        match mechanism {
            Mechanism::All => Ok(true),

            Mechanism::Ip4 { addr, prefix_len } => Ok(match self.subject.ip {
                IpAddr::V4(client) => cidr::ip4_in_network(client, *addr, *prefix_len),
                IpAddr::V6(_) => false,
            }),

            Mechanism::Ip6 { addr, prefix_len } => Ok(match self.subject.ip {
                IpAddr::V6(client) => cidr::ip6_in_network(client, *addr, *prefix_len),
                IpAddr::V4(_) => false,
            }),

            Mechanism::A { domain: spec, cidr } => {
                self.count_lookup()?;
                let target = self.target_name(spec.as_ref(), domain).await?;
                let ips = self.ips_by_host(&target, self.subject.ip.is_ipv4()).await?;
                Ok(self.any_cidr_match(&ips, *cidr))
            }

            Mechanism::Mx { domain: spec, cidr } => {
                self.count_lookup()?;
                let target = self.target_name(spec.as_ref(), domain).await?;
                let ips = self.ips_by_mx(&target, self.subject.ip.is_ipv4()).await?;
                Ok(self.any_cidr_match(&ips, *cidr))
            }

            Mechanism::Ptr(spec) => {
                self.count_lookup()?;
                let target = self.target_name(spec.as_ref(), domain).await?;
                Ok(self.validated_host_for_ip(&target, true).await?.is_some())
            }

            Mechanism::Exists(spec) => {
                self.count_lookup()?;
                let target = self.expand(spec, domain).await?;
                // Always an A query, even when the client IP is IPv6.
                match self.resolver.resolve_a(&target).await {
                    Ok(addrs) if !addrs.is_empty() => Ok(true),
                    Ok(_) | Err(DnsError::NxDomain(_)) => {
                        self.count_void()?;
                        Ok(false)
                    }
                    Err(DnsError::InvalidName(_)) => Ok(false),
                    Err(err) => Err(Abort::temperror(err.to_string())),
                }
            }

            Mechanism::Include(spec) => {
                self.count_lookup()?;
                let target = self.expand(spec, domain).await?;
                let inner = self.check_host(&target).await;
                match inner.code {
                    ResultCode::Pass => Ok(true),
                    ResultCode::Fail | ResultCode::Softfail | ResultCode::Neutral => Ok(false),
                    ResultCode::Temperror => {
                        Err(Abort::temperror(inner.explanation.unwrap_or_default()))
                    }
                    ResultCode::Permerror => {
                        Err(Abort::permerror(inner.explanation.unwrap_or_default()))
                    }
                    ResultCode::None => Err(Abort::permerror(format!(
                        "Included domain has no SPF record: {target}"
                    ))),
                }
            }
        }
    }

    /// Expand an optional domain spec, defaulting to the current domain.
    async fn target_name(
        &mut self,
        spec: Option<&MacroString>,
        domain: &str,
    ) -> Result<String, Abort> {
        match spec {
            Some(spec) => self.expand(spec, domain).await,
            None => Ok(domain.to_string()),
        }
    }

    fn any_cidr_match(&self, ips: &[IpAddr], cidr: DualCidr) -> bool {
        ips.iter()
            .any(|addr| cidr::ip_in_network(self.subject.ip, *addr, cidr.v4, cidr.v6))
    }

    /// Forward-resolve a host in the client's address family. Empty answers
    /// (including NXDOMAIN) charge the void-lookup budget; a transient
    /// failure aborts with Temperror.
    async fn ips_by_host(&mut self, name: &str, want_v4: bool) -> Result<Vec<IpAddr>, Abort> {
        let result = if want_v4 {
            self.resolver
                .resolve_a(name)
                .await
                .map(|addrs| addrs.into_iter().map(IpAddr::V4).collect::<Vec<_>>())
        } else {
            self.resolver
                .resolve_aaaa(name)
                .await
                .map(|addrs| addrs.into_iter().map(IpAddr::V6).collect::<Vec<_>>())
        };
        match result {
            Ok(addrs) if addrs.is_empty() => {
                self.count_void()?;
                Ok(addrs)
            }
            Ok(addrs) => Ok(addrs),
            Err(DnsError::NxDomain(_)) => {
                self.count_void()?;
                Ok(Vec::new())
            }
            Err(DnsError::InvalidName(_)) => Ok(Vec::new()),
            Err(err) => Err(Abort::temperror(err.to_string())),
        }
    }

    /// Resolve the MX targets of `name` and then every target's addresses.
    /// The per-mechanism target cap is separate from the global lookup
    /// budget: target address lookups are only void-counted, never charged.
    async fn ips_by_mx(&mut self, name: &str, want_v4: bool) -> Result<Vec<IpAddr>, Abort> {
        let targets = match self.resolver.resolve_mx(name).await {
            Ok(targets) => targets,
            Err(DnsError::NxDomain(_)) => Vec::new(),
            Err(DnsError::InvalidName(_)) => return Ok(Vec::new()),
            Err(err) => return Err(Abort::temperror(err.to_string())),
        };
        if targets.is_empty() {
            self.count_void()?;
            return Ok(Vec::new());
        }

        let distinct: HashSet<String> = targets.iter().map(|t| t.to_lowercase()).collect();
        if distinct.len() > self.settings.lookup_limit {
            return Err(Abort::permerror(format!(
                "More than 10 MX records for {name}"
            )));
        }

        let mut seen = HashSet::new();
        let mut ips = Vec::new();
        for target in &targets {
            for addr in self.ips_by_host(target, want_v4).await? {
                if seen.insert(addr) {
                    ips.push(addr);
                }
            }
        }
        Ok(ips)
    }

    /// The validated-PTR procedure shared by the `ptr` mechanism and the
    /// `%{p}` macro (RFC 7208 Section 5.5): reverse-resolve the client IP,
    /// inspect at most 10 names, and return one whose forward lookup
    /// contains the client IP. Candidates equal to `domain` are tried first,
    /// then subdomains, then (only when `require_match` is false) the rest.
    /// A failed PTR lookup yields no name rather than an abort.
    async fn validated_host_for_ip(
        &mut self,
        domain: &str,
        require_match: bool,
    ) -> Result<Option<String>, Abort> {
        let names = match self.resolver.resolve_ptr(&reverse_name(self.subject.ip)).await {
            Ok(names) => names,
            Err(DnsError::NxDomain(_)) => Vec::new(),
            Err(_) => return Ok(None),
        };
        if names.is_empty() {
            self.count_void()?;
            return Ok(None);
        }

        let mut exact = None;
        let mut subdomains = Vec::new();
        let mut others = Vec::new();
        for name in names.into_iter().take(10) {
            if domain::domains_equal(&name, domain) {
                if exact.is_none() {
                    exact = Some(name);
                }
            } else if domain::is_subdomain_of(&name, domain) {
                subdomains.push(name);
            } else {
                others.push(name);
            }
        }

        if let Some(name) = exact {
            if self.name_has_ip(&name).await? {
                return Ok(Some(name));
            }
        }
        for name in subdomains {
            if self.name_has_ip(&name).await? {
                return Ok(Some(name));
            }
        }
        if !require_match {
            for name in others {
                if self.name_has_ip(&name).await? {
                    return Ok(Some(name));
                }
            }
        }
        Ok(None)
    }

    /// Forward-validate one PTR candidate. A DNS failure here skips the
    /// name instead of aborting; an empty answer still charges the
    /// void-lookup budget.
    async fn name_has_ip(&mut self, name: &str) -> Result<bool, Abort> {
        let result = match self.subject.ip {
            IpAddr::V4(_) => self
                .resolver
                .resolve_a(name)
                .await
                .map(|addrs| addrs.into_iter().map(IpAddr::V4).collect::<Vec<_>>()),
            IpAddr::V6(_) => self
                .resolver
                .resolve_aaaa(name)
                .await
                .map(|addrs| addrs.into_iter().map(IpAddr::V6).collect::<Vec<_>>()),
        };
        match result {
            Ok(addrs) if addrs.is_empty() => {
                self.count_void()?;
                Ok(false)
            }
            Ok(addrs) => Ok(addrs.contains(&self.subject.ip)),
            Err(DnsError::NxDomain(_)) => {
                self.count_void()?;
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    /// Expand a pre-parsed macro string against the current evaluation.
    /// Only `%{p}` touches DNS; everything else is a pure substitution.
    async fn expand(&mut self, spec: &MacroString, domain: &str) -> Result<String, Abort> {
        let mut out = String::new();
        for element in &spec.elements {
            match element {
                MacroElement::Literal(text) => out.push_str(text),
                MacroElement::Macro(term) => {
                    let value = match term.letter {
                        MacroLetter::Sender => self.subject.sender.clone(),
                        MacroLetter::LocalPart => self.subject.local_part.clone(),
                        MacroLetter::SenderDomain => self.subject.sender_domain.clone(),
                        MacroLetter::Domain => domain.to_string(),
                        MacroLetter::Ip => macros::ip_macro_value(self.subject.ip),
                        MacroLetter::IpVersion => {
                            macros::ip_version_token(self.subject.ip).to_string()
                        }
                        MacroLetter::Helo => self.subject.helo.clone(),
                        MacroLetter::PtrName => {
                            self.count_lookup()?;
                            self.validated_host_for_ip(domain, false)
                                .await?
                                .unwrap_or_else(|| "unknown".to_string())
                        }
                        MacroLetter::ClientIp => macros::ip_readable(self.subject.ip),
                        MacroLetter::Receiver => self.settings.host_domain.clone(),
                        MacroLetter::Timestamp => SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_secs().to_string())
                            .unwrap_or_else(|_| "0".to_string()),
                    };
                    let transformed =
                        macros::transform(&value, term.digits, term.reverse, &term.delimiters);
                    if term.url_escape {
                        out.push_str(&macros::url_escape(&transformed));
                    } else {
                        out.push_str(&transformed);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Produce the `exp=` explanation for a Fail, or None to keep the
    /// default. Neither the TXT fetch nor its emptiness touches the budgets;
    /// only aborts raised while expanding (via `%{p}`) propagate.
    async fn expand_explanation(
        &mut self,
        exp: &MacroString,
        domain: &str,
    ) -> Result<Option<String>, Abort> {
        let target = self.expand(exp, domain).await?;
        let records = match self.resolver.resolve_txt(&target).await {
            Ok(records) => records,
            Err(_) => return Ok(None),
        };
        let Some(text) = records.first() else {
            return Ok(None);
        };
        if !text.is_ascii() {
            return Ok(None);
        }
        let full = format!("{}{}", self.settings.explain_prefix, text);
        match MacroString::parse(&full, MacroScope::Explanation) {
            Ok(parsed) => Ok(Some(self.expand(&parsed, domain).await?)),
            Err(err) => {
                trace!(%err, "unparsable explanation text, keeping default");
                Ok(None)
            }
        }
    }

    fn count_lookup(&mut self) -> Result<(), Abort> {
        self.lookups_used += 1;
        if self.lookups_used > self.settings.lookup_limit {
            return Err(Abort::permerror("Maximum total DNS lookups exceeded."));
        }
        Ok(())
    }

    fn count_void(&mut self) -> Result<(), Abort> {
        self.void_lookups_used += 1;
        if self.void_lookups_used > self.settings.void_lookup_limit {
            return Err(Abort::permerror("Maximum DNS void lookups exceeded."));
        }
        Ok(())
    }
}

fn has_spf_version(record: &str) -> bool {
    record.len() >= 6 && record.as_bytes()[..6].eq_ignore_ascii_case(b"v=spf1")
}
