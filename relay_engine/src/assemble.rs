//! Builds the transport stack of each mode, outermost layer last.

use relay_utils::config::Config;
use relay_utils::crypto::{wrap_dialer, wrap_listener};
use relay_utils::dns::{ResolverBootstrap, ResolverLoadError};
use relay_utils::filter::FilteredDialer;
use relay_utils::mux::{Service, TunnelDialer, TunnelError};
use relay_utils::proxy::{AdminRouter, HttpProxy, ProxyError};
use relay_utils::tcp::{TcpAcceptor, TcpDialer};
use relay_utils::transport::{Dialer, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Failure of one assembly step; later steps never run.
#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("Resolver configuration: {0}")]
    Resolver(#[from] ResolverLoadError),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("Tunnel: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Proxy: {0}")]
    Proxy(#[from] ProxyError),
}

/// TCP listener, then the record layer, then the tunnel service.
pub async fn run_server(config: &Config, shutdown: CancellationToken) -> Result<(), AssembleError> {
    let acceptor = TcpAcceptor::bind(&config.listen).await?;
    let listener = wrap_listener(Box::new(acceptor), &config.cipher, &config.key)?;
    let service = Service::new(config.auth.clone(), Box::new(TcpDialer::new()))?;
    service.serve(listener, shutdown).await?;
    Ok(())
}

/// Resolver, encrypted dialer, tunnel, optional route filter, then the proxy.
pub async fn run_http(config: &Config, shutdown: CancellationToken) -> Result<(), AssembleError> {
    let resolver = ResolverBootstrap::load(config.resolv_conf())?;

    let encrypted = wrap_dialer(Box::new(TcpDialer::new()), &config.cipher, &config.key)?;
    let tunnel = Arc::new(
        TunnelDialer::connect(
            Box::new(encrypted),
            &config.server,
            &config.username,
            &config.password,
        )
        .await?,
    );

    let dialer: Box<dyn Dialer> = match config.blackfile() {
        Some(blackfile) => Box::new(FilteredDialer::new(
            Box::new(tunnel.clone()),
            Box::new(TcpDialer::new()),
            blackfile,
            resolver,
        )?),
        None => Box::new(tunnel.clone()),
    };

    let mut router = AdminRouter::new();
    tunnel.register(&mut router);
    info!(routes = ?router.paths().collect::<Vec<_>>(), "Admin routes mounted");

    let proxy = HttpProxy::bind(&config.listen, dialer, router).await?;
    proxy.serve(shutdown).await?;
    Ok(())
}
