//! Network guard: decides which targets the proxy may connect to.
//!
//! The guard runs at two points:
//!
//! 1. On every URL before a request is made: the initial target and every
//!    redirect `Location`. Literal IP hosts are fully checked here, because
//!    the HTTP client never resolves them.
//! 2. On every DNS answer, through [`GuardedResolver`], which is installed as
//!    the HTTP client's resolver. A name is refused if *any* of its
//!    addresses is blocked, and the client only ever connects to the
//!    addresses that were checked, so a rebinding DNS server cannot swap in
//!    an internal address between check and connect.

use std::error::Error as StdError;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_resolver::TokioResolver;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::{debug, warn};

use crate::blocklist::{is_hostname_blocked, is_ip_blocked};
use crate::config::Config;
use crate::error::Error;
use crate::host_matcher::HostMatcher;
use crate::policy::Policy;
use crate::safe_url::SafeUrl;

/// Host and address policy for outbound requests.
#[derive(Debug, Clone, Default)]
pub struct NetworkGuard {
    policy: Policy,
    allow_credentials: bool,
    deny: Option<HostMatcher>,
    allow: Option<HostMatcher>,
}

impl NetworkGuard {
    /// Create a guard with the given range policy and no host lists.
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// Build the guard described by a [`Config`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Trie`] if a host list cannot be compiled.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Ok(Self {
            policy: Policy::from_no_ip_filtering(config.no_ip_filtering),
            allow_credentials: config.allow_credential_urls,
            deny: HostMatcher::from_list(&config.deny_list)?,
            allow: HostMatcher::from_list(&config.allow_list)?,
        })
    }

    /// Permit `user:pass@` in target URLs.
    pub fn with_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    /// Refuse hosts matching `deny`, whatever else allows them.
    pub fn with_deny_list(mut self, deny: HostMatcher) -> Self {
        self.deny = Some(deny);
        self
    }

    /// Only permit hosts matching `allow`.
    pub fn with_allow_list(mut self, allow: HostMatcher) -> Self {
        self.allow = Some(allow);
        self
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Parse and check a target URL.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] / [`Error::CredentialUrl`] from parsing
    /// - [`Error::HostnameBlocked`] for denied, non-allowed or loopback names
    /// - [`Error::SsrfBlocked`] for literal addresses in blocked ranges
    pub fn check_url(&self, url: &str) -> Result<SafeUrl, Error> {
        let target = SafeUrl::parse(url, self.allow_credentials)?;
        self.check_target(&target)?;
        Ok(target)
    }

    /// Check an already parsed target.
    pub fn check_target(&self, target: &SafeUrl) -> Result<(), Error> {
        self.check_host(target.as_str(), target.host())?;
        if let Some(ip) = target.ip() {
            if let Some(reason) = self.check_ip(ip) {
                return Err(Error::ssrf_blocked(target.as_str(), ip, reason));
            }
        }
        Ok(())
    }

    /// Check a hostname against the host lists and, when filtering, the
    /// hostname blocklist.
    pub fn check_host(&self, url: &str, host: &str) -> Result<(), Error> {
        // explicit deny always wins
        if let Some(deny) = &self.deny {
            if deny.matches(host) {
                return Err(Error::hostname_blocked(url, host, "host is on the deny list"));
            }
        }

        if let Some(allow) = &self.allow {
            if !allow.matches(host) {
                return Err(Error::hostname_blocked(url, host, "host is not on the allow list"));
            }
        }

        if self.policy.filters_ranges() {
            if let Some(blocked) = is_hostname_blocked(host) {
                return Err(Error::hostname_blocked(
                    url,
                    host,
                    format!("hostname {} is blocked", blocked),
                ));
            }
        }

        Ok(())
    }

    /// Reason an address is refused, if it is.
    pub fn check_ip(&self, ip: IpAddr) -> Option<&'static str> {
        if self.policy.filters_ranges() {
            is_ip_blocked(ip)
        } else {
            None
        }
    }
}

/// DNS resolver that refuses names resolving into blocked ranges.
///
/// Installed on the outbound `reqwest::Client`, so it runs for the initial
/// target and for every redirect hop.
#[derive(Clone)]
pub struct GuardedResolver {
    guard: Arc<NetworkGuard>,
    resolver: Arc<TokioResolver>,
}

impl GuardedResolver {
    /// Create a resolver using the system DNS configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DnsError`] if the system configuration cannot be read.
    pub fn new(guard: Arc<NetworkGuard>) -> Result<Self, Error> {
        let resolver = TokioResolver::builder_tokio()
            .map_err(|e| Error::dns_error("system resolver", e.to_string()))?
            .build();

        Ok(Self {
            guard,
            resolver: Arc::new(resolver),
        })
    }

    /// Resolve `host` and check every address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HostnameBlocked`] or [`Error::SsrfBlocked`] if the
    /// guard refuses the name or any of its addresses, and
    /// [`Error::DnsError`] if resolution fails.
    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        self.guard.check_host(host, host)?;

        let host_str = host.trim_start_matches('[').trim_end_matches(']');
        let ips: Vec<IpAddr> = if let Ok(ip) = host_str.parse::<IpAddr>() {
            vec![ip]
        } else {
            self.resolver
                .lookup_ip(host)
                .await
                .map_err(|e| Error::dns_error(host, e.to_string()))?
                .iter()
                .collect()
        };

        if ips.is_empty() {
            return Err(Error::dns_error(host, "no IP addresses found"));
        }

        for &ip in &ips {
            if let Some(reason) = self.guard.check_ip(ip) {
                warn!(host, %ip, reason, "resolved address blocked");
                return Err(Error::ssrf_blocked(host, ip, reason));
            }
        }

        debug!(host, addrs = ?ips, "resolved");
        Ok(ips)
    }
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let this = self.clone();
        Box::pin(async move {
            match this.lookup(name.as_str()).await {
                Ok(ips) => {
                    // port 0 is replaced by the connector with the URL's port
                    let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
                    Ok(addrs)
                }
                Err(e) => Err(Box::new(e) as Box<dyn StdError + Send + Sync>),
            }
        })
    }
}
