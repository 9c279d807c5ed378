//! Resolver configuration bootstrap and the async resolver handle.
//!
//! The resolver is loaded from a resolv.conf-style file found on a short
//! search path, then threaded into whatever needs name resolution.

use hickory_resolver::Resolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use resolv_conf::ScopedIp;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Tried when no explicit path is configured, relative to the working directory.
pub const LOCAL_RESOLV_CONF: &str = "resolv.conf";
/// Last entry of the search path; its outcome is final.
pub const SYSTEM_RESOLV_CONF: &str = "/etc/goproxy/resolv.conf";

const DNS_PORT: u16 = 53;

#[derive(Debug, Error)]
pub enum ResolverLoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("No nameserver in {0}")]
    NoNameserver(PathBuf),

    #[error("Lookup of {host} failed: {reason}")]
    Lookup { host: String, reason: String },
}

/// Cloneable handle to an async DNS resolver.
#[derive(Clone)]
pub struct DnsResolver {
    inner: Arc<Inner>,
}

struct Inner {
    resolver: Resolver<TokioConnectionProvider>,
    nameservers: Vec<IpAddr>,
}

impl fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsResolver")
            .field("nameservers", &self.inner.nameservers)
            .finish()
    }
}

impl DnsResolver {
    /// Builds a resolver querying `nameservers` over UDP and TCP port 53.
    pub fn from_nameservers(nameservers: Vec<IpAddr>, timeout: Duration, attempts: usize) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&nameservers, DNS_PORT, true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let mut builder = Resolver::builder_with_config(config, TokioConnectionProvider::default());
        let opts = builder.options_mut();
        opts.timeout = timeout;
        opts.attempts = attempts;
        DnsResolver {
            inner: Arc::new(Inner {
                resolver: builder.build(),
                nameservers,
            }),
        }
    }

    /// Loads a resolv.conf-style file.
    pub fn from_file(path: &Path) -> Result<Self, ResolverLoadError> {
        let raw = std::fs::read(path).map_err(|source| ResolverLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed = resolv_conf::Config::parse(&raw).map_err(|e| ResolverLoadError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let nameservers: Vec<IpAddr> = parsed
            .nameservers
            .iter()
            .map(|ns| match ns {
                ScopedIp::V4(ip) => IpAddr::V4(*ip),
                ScopedIp::V6(ip, _) => IpAddr::V6(*ip),
            })
            .collect();
        if nameservers.is_empty() {
            return Err(ResolverLoadError::NoNameserver(path.to_path_buf()));
        }

        debug!(
            path = %path.display(),
            nameservers = ?nameservers,
            timeout = parsed.timeout,
            attempts = parsed.attempts,
            "Parsed resolver configuration"
        );
        Ok(Self::from_nameservers(
            nameservers,
            Duration::from_secs(u64::from(parsed.timeout.max(1))),
            parsed.attempts.max(1) as usize,
        ))
    }

    pub fn nameservers(&self) -> &[IpAddr] {
        &self.inner.nameservers
    }

    /// Resolves `host` to its addresses; IP literals are returned as is.
    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolverLoadError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let response = self
            .inner
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| ResolverLoadError::Lookup {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        Ok(response.iter().collect())
    }
}

/// Finds and loads the resolver configuration.
pub struct ResolverBootstrap;

impl ResolverBootstrap {
    /// Loads the resolver from `explicit`, or from the first usable entry of
    /// the search path.
    pub fn load(explicit: Option<&Path>) -> Result<DnsResolver, ResolverLoadError> {
        let resolver = Self::search(explicit, DnsResolver::from_file)?;
        info!(nameservers = ?resolver.nameservers(), "Resolver configuration loaded");
        Ok(resolver)
    }

    /// Applies the search order with `loader`:
    ///
    /// 1. an explicit path is loaded and its outcome returned, with no fallback;
    /// 2. otherwise [`LOCAL_RESOLV_CONF`] is tried and returned on success;
    /// 3. otherwise [`SYSTEM_RESOLV_CONF`] is tried and its outcome is final.
    pub fn search<T, E, F>(explicit: Option<&Path>, mut loader: F) -> Result<T, E>
    where
        F: FnMut(&Path) -> Result<T, E>,
        E: fmt::Display,
    {
        if let Some(path) = explicit {
            return loader(path);
        }

        match loader(Path::new(LOCAL_RESOLV_CONF)) {
            Ok(loaded) => Ok(loaded),
            Err(e) => {
                warn!(error = %e, "Falling back to {}", SYSTEM_RESOLV_CONF);
                loader(Path::new(SYSTEM_RESOLV_CONF))
            }
        }
    }
}
