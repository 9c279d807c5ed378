//! Split-tunnel routing.
//!
//! Destinations whose address falls inside the blacklist are dialed through
//! the fallback dialer; everything else goes through the primary one.

use crate::dns::DnsResolver;
use crate::transport::{Conn, Dialer, TransportError, split_host_port};
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info};

/// Set of networks parsed from a blacklist file.
#[derive(Debug, Default)]
pub struct Blacklist {
    v4: Vec<Ipv4Net>,
    v6: Vec<Ipv6Net>,
}

impl Blacklist {
    /// Parses one CIDR or bare IP per line; `#` starts a comment.
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        let mut blacklist = Blacklist::default();
        for (lineno, line) in text.lines().enumerate() {
            let entry = line.split('#').next().unwrap_or_default().trim();
            if entry.is_empty() {
                continue;
            }

            let net = match entry.parse::<IpNet>() {
                Ok(net) => net,
                Err(_) => entry.parse::<IpAddr>().map(IpNet::from).map_err(|_| {
                    TransportError::Configuration(format!(
                        "blacklist line {}: invalid network {:?}",
                        lineno + 1,
                        entry
                    ))
                })?,
            };
            match net.trunc() {
                IpNet::V4(v4) => blacklist.v4.push(v4),
                IpNet::V6(v6) => blacklist.v6.push(v6),
            }
        }
        blacklist.v4.sort();
        blacklist.v4.dedup();
        blacklist.v6.sort();
        blacklist.v6.dedup();
        Ok(blacklist)
    }

    pub fn load(path: &Path) -> Result<Self, TransportError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TransportError::Configuration(format!("blacklist {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.v4.iter().any(|net| net.contains(&v4)),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => self.contains(IpAddr::V4(v4)),
                None => self.v6.iter().any(|net| net.contains(&v6)),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dialer choosing, per call, between the tunnel and a direct route.
pub struct FilteredDialer {
    primary: Box<dyn Dialer>,
    fallback: Box<dyn Dialer>,
    blacklist: Blacklist,
    resolver: DnsResolver,
}

impl FilteredDialer {
    /// Loads `blackfile` and builds the filter. An unreadable file or a
    /// malformed line fails construction.
    pub fn new(
        primary: Box<dyn Dialer>,
        fallback: Box<dyn Dialer>,
        blackfile: &Path,
        resolver: DnsResolver,
    ) -> Result<FilteredDialer, TransportError> {
        let blacklist = Blacklist::load(blackfile)?;
        info!(
            blackfile = %blackfile.display(),
            networks = blacklist.len(),
            "Route filter loaded"
        );
        Ok(Self::with_blacklist(primary, fallback, blacklist, resolver))
    }

    pub fn with_blacklist(
        primary: Box<dyn Dialer>,
        fallback: Box<dyn Dialer>,
        blacklist: Blacklist,
        resolver: DnsResolver,
    ) -> FilteredDialer {
        FilteredDialer {
            primary,
            fallback,
            blacklist,
            resolver,
        }
    }

    async fn is_blacklisted(&self, host: &str) -> bool {
        match self.resolver.lookup(host).await {
            Ok(ips) => ips.into_iter().any(|ip| self.blacklist.contains(ip)),
            Err(e) => {
                debug!(host = %host, error = %e, "Resolution failed, keeping primary route");
                false
            }
        }
    }
}

#[async_trait]
impl Dialer for FilteredDialer {
    async fn dial(&self, addr: &str) -> Result<Conn, TransportError> {
        let (host, _) = split_host_port(addr)?;
        if self.is_blacklisted(host).await {
            debug!(addr = %addr, "Routing direct");
            self.fallback.dial(addr).await
        } else {
            debug!(addr = %addr, "Routing through tunnel");
            self.primary.dial(addr).await
        }
    }
}
