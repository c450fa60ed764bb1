use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, RwLock};

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::{Name, RecordType};
use hickory_resolver::TokioResolver;

/// DNS failure modes the SPF engine distinguishes. An empty answer is NOT an
/// error: resolvers return `Ok(vec![])` (or `NxDomain`, which the engine
/// treats the same way) and the engine decides whether it counts as a void
/// lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnsError {
    /// NXDOMAIN: the name does not exist.
    #[error("domain not found: {0}")]
    NxDomain(String),
    /// The queried name is not a well-formed DNS name.
    #[error("invalid DNS name: {0}")]
    InvalidName(String),
    /// SERVFAIL, timeout, or any other transient condition.
    #[error("temporary DNS failure: {0}")]
    TempFail(String),
}

/// Abstract DNS facade consumed by the evaluator. `resolve_ptr` takes the
/// already-reversed name (see [`reverse_name`]); `resolve_mx` returns
/// exchange target names in answer order with duplicates preserved.
pub trait DnsResolver: Send + Sync {
    fn resolve_txt(&self, name: &str) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
    fn resolve_a(&self, name: &str) -> impl Future<Output = Result<Vec<Ipv4Addr>, DnsError>> + Send;
    fn resolve_aaaa(&self, name: &str)
        -> impl Future<Output = Result<Vec<Ipv6Addr>, DnsError>> + Send;
    fn resolve_mx(&self, name: &str) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
    fn resolve_ptr(&self, name: &str) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
}

/// Build the reverse-mapping name for an address: `d.c.b.a.in-addr.arpa`
/// for IPv4, nibble-reversed `*.ip6.arpa` for IPv6.
pub fn reverse_name(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut labels = Vec::with_capacity(32);
            for byte in v6.octets().iter().rev() {
                labels.push(format!("{:x}", byte & 0xf));
                labels.push(format!("{:x}", byte >> 4));
            }
            format!("{}.ip6.arpa", labels.join("."))
        }
    }
}

/// Production resolver backed by hickory.
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: TokioResolver,
}

impl HickoryResolver {
    pub fn new() -> Self {
        let resolver = TokioResolver::builder_with_config(
            ResolverConfig::cloudflare(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self { resolver }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_name(name: &str) -> Result<Name, DnsError> {
    Name::from_utf8(name).map_err(|e| DnsError::InvalidName(format!("{name}: {e}")))
}

impl DnsResolver for HickoryResolver {
    async fn resolve_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let name = parse_name(name)?;
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part))
                        .collect::<String>()
                })
                .collect()),
            Err(e) if e.is_no_records_found() => Ok(Vec::new()),
            Err(e) if e.is_nx_domain() => Err(DnsError::NxDomain(e.to_string())),
            Err(e) => Err(DnsError::TempFail(e.to_string())),
        }
    }

    async fn resolve_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        let name = parse_name(name)?;
        match self.resolver.ipv4_lookup(name).await {
            Ok(lookup) => Ok(lookup.iter().map(|a| a.0).collect()),
            Err(e) if e.is_no_records_found() => Ok(Vec::new()),
            Err(e) if e.is_nx_domain() => Err(DnsError::NxDomain(e.to_string())),
            Err(e) => Err(DnsError::TempFail(e.to_string())),
        }
    }

    async fn resolve_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        let name = parse_name(name)?;
        match self.resolver.ipv6_lookup(name).await {
            Ok(lookup) => Ok(lookup.iter().map(|a| a.0).collect()),
            Err(e) if e.is_no_records_found() => Ok(Vec::new()),
            Err(e) if e.is_nx_domain() => Err(DnsError::NxDomain(e.to_string())),
            Err(e) => Err(DnsError::TempFail(e.to_string())),
        }
    }

    async fn resolve_mx(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let name = parse_name(name)?;
        match self.resolver.mx_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|mx| {
                    let target = mx.exchange().to_utf8();
                    target.strip_suffix('.').unwrap_or(&target).to_string()
                })
                .collect()),
            Err(e) if e.is_no_records_found() => Ok(Vec::new()),
            Err(e) if e.is_nx_domain() => Err(DnsError::NxDomain(e.to_string())),
            Err(e) => Err(DnsError::TempFail(e.to_string())),
        }
    }

    async fn resolve_ptr(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let name = parse_name(name)?;
        match self.resolver.lookup(name, RecordType::PTR).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .filter_map(|rdata| rdata.as_ptr())
                .map(|ptr| {
                    let target = ptr.0.to_utf8();
                    target.strip_suffix('.').unwrap_or(&target).to_string()
                })
                .collect()),
            Err(e) if e.is_no_records_found() => Ok(Vec::new()),
            Err(e) if e.is_nx_domain() => Err(DnsError::NxDomain(e.to_string())),
            Err(e) => Err(DnsError::TempFail(e.to_string())),
        }
    }
}

type Zone<T> = Arc<RwLock<HashMap<String, Result<Vec<T>, DnsError>>>>;

/// In-memory resolver for tests. Records are appended per name; an injected
/// error replaces whatever was seeded for that name. Unconfigured names
/// resolve to NXDOMAIN.
#[derive(Clone, Default)]
pub struct MockResolver {
    txt_records: Zone<String>,
    a_records: Zone<Ipv4Addr>,
    aaaa_records: Zone<Ipv6Addr>,
    mx_records: Zone<String>,
    ptr_records: Zone<String>,
}

fn add_record<T>(zone: &Zone<T>, name: &str, value: T) {
    let mut zone = zone.write().unwrap();
    match zone.entry(name.to_lowercase()).or_insert_with(|| Ok(Vec::new())) {
        Ok(values) => values.push(value),
        Err(_) => {}
    }
}

fn query<T: Clone>(zone: &Zone<T>, name: &str) -> Result<Vec<T>, DnsError> {
    zone.read()
        .unwrap()
        .get(&name.to_lowercase())
        .cloned()
        .unwrap_or_else(|| Err(DnsError::NxDomain(name.to_string())))
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn txt(&self, name: &str, record: &str) -> &Self {
        add_record(&self.txt_records, name, record.to_string());
        self
    }

    pub fn a(&self, name: &str, addr: &str) -> &Self {
        add_record(&self.a_records, name, addr.parse().expect("IPv4 literal"));
        self
    }

    pub fn aaaa(&self, name: &str, addr: &str) -> &Self {
        add_record(&self.aaaa_records, name, addr.parse().expect("IPv6 literal"));
        self
    }

    pub fn mx(&self, name: &str, exchange: &str) -> &Self {
        add_record(&self.mx_records, name, exchange.to_string());
        self
    }

    pub fn ptr(&self, reverse: &str, target: &str) -> &Self {
        add_record(&self.ptr_records, reverse, target.to_string());
        self
    }

    pub fn fail_txt(&self, name: &str, err: DnsError) -> &Self {
        self.txt_records.write().unwrap().insert(name.to_lowercase(), Err(err));
        self
    }

    pub fn fail_a(&self, name: &str, err: DnsError) -> &Self {
        self.a_records.write().unwrap().insert(name.to_lowercase(), Err(err));
        self
    }

    pub fn fail_aaaa(&self, name: &str, err: DnsError) -> &Self {
        self.aaaa_records.write().unwrap().insert(name.to_lowercase(), Err(err));
        self
    }

    pub fn fail_mx(&self, name: &str, err: DnsError) -> &Self {
        self.mx_records.write().unwrap().insert(name.to_lowercase(), Err(err));
        self
    }

    pub fn fail_ptr(&self, reverse: &str, err: DnsError) -> &Self {
        self.ptr_records.write().unwrap().insert(reverse.to_lowercase(), Err(err));
        self
    }
}

impl DnsResolver for MockResolver {
    async fn resolve_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        query(&self.txt_records, name)
    }

    async fn resolve_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        query(&self.a_records, name)
    }

    async fn resolve_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        query(&self.aaaa_records, name)
    }

    async fn resolve_mx(&self, name: &str) -> Result<Vec<String>, DnsError> {
        query(&self.mx_records, name)
    }

    async fn resolve_ptr(&self, name: &str) -> Result<Vec<String>, DnsError> {
        query(&self.ptr_records, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_name_v4() {
        assert_eq!(reverse_name("1.2.3.4".parse().unwrap()), "4.3.2.1.in-addr.arpa");
    }

    #[test]
    fn reverse_name_v6() {
        assert_eq!(
            reverse_name("1234:5678::90ab:cd3f".parse().unwrap()),
            "f.3.d.c.b.a.0.9.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.7.6.5.4.3.2.1.ip6.arpa"
        );
    }

    #[tokio::test]
    async fn mock_appends_records_per_name() {
        let dns = MockResolver::new();
        dns.txt("example.com", "one").txt("example.com", "two");
        assert_eq!(
            dns.resolve_txt("EXAMPLE.com").await.unwrap(),
            vec!["one".to_string(), "two".to_string()]
        );
    }

    #[tokio::test]
    async fn mock_unconfigured_name_is_nxdomain() {
        let dns = MockResolver::new();
        assert!(matches!(
            dns.resolve_a("missing.example.com").await,
            Err(DnsError::NxDomain(_))
        ));
    }

    #[tokio::test]
    async fn mock_error_injection_wins() {
        let dns = MockResolver::new();
        dns.txt("example.com", "v=spf1 -all");
        dns.fail_txt("example.com", DnsError::TempFail("injected".into()));
        assert!(matches!(
            dns.resolve_txt("example.com").await,
            Err(DnsError::TempFail(_))
        ));
    }

    #[tokio::test]
    async fn mock_mx_preserves_order_and_duplicates() {
        let dns = MockResolver::new();
        dns.mx("example.com", "b.example.com")
            .mx("example.com", "a.example.com")
            .mx("example.com", "b.example.com");
        assert_eq!(
            dns.resolve_mx("example.com").await.unwrap(),
            vec!["b.example.com", "a.example.com", "b.example.com"]
        );
    }
}
