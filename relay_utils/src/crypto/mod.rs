//! Confidentiality layer for raw transports.
//!
//! `wrap_dialer` and `wrap_listener` decorate a raw dialer or listener so that
//! every connection it hands out runs through an AES-GCM record layer. The
//! wrapped connection keeps the plain `Conn` contract.

pub mod aes_gcm;
mod stream;

use crate::transport::{Conn, Dialer, Listener, TransportError};
use async_trait::async_trait;
use base64::Engine;
use std::fmt;
use std::net::SocketAddr;
use tracing::debug;

pub use stream::seal;

/// Supported cipher identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
}

impl CipherKind {
    pub fn from_name(name: &str) -> Result<Self, TransportError> {
        match name.to_ascii_lowercase().as_str() {
            "aes" | "aes-256-gcm" | "aes256gcm" => Ok(CipherKind::Aes256Gcm),
            "aes-128-gcm" | "aes128gcm" => Ok(CipherKind::Aes128Gcm),
            _ => Err(TransportError::Configuration(format!(
                "unsupported cipher: {}",
                name
            ))),
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
        }
    }
}

/// A validated cipher identifier and key, shared by every wrapped connection.
#[derive(Clone)]
pub struct CipherSpec {
    kind: CipherKind,
    key: Vec<u8>,
}

impl fmt::Debug for CipherSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSpec")
            .field("kind", &self.kind)
            .field("key", &"[redacted]")
            .finish()
    }
}

impl CipherSpec {
    /// Validates `cipher` and decodes `key` (hex, then base64).
    pub fn new(cipher: &str, key: &str) -> Result<Self, TransportError> {
        let kind = CipherKind::from_name(cipher)?;
        let key = parse_key(key)?;
        if key.len() != kind.key_len() {
            return Err(TransportError::Configuration(format!(
                "{:?} needs a {}-byte key, got {} bytes",
                kind,
                kind.key_len(),
                key.len()
            )));
        }
        Ok(CipherSpec { kind, key })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }
}

pub fn parse_key(key_str: &str) -> Result<Vec<u8>, TransportError> {
    // Try hex, then base64 (RFC4648 standard)
    if let Ok(bytes) = hex::decode(key_str) {
        return Ok(bytes);
    }
    base64::engine::general_purpose::STANDARD
        .decode(key_str)
        .map_err(|_| TransportError::Configuration("Invalid key (hex or base64 expected)".into()))
}

/// Dialer decorator encrypting every connection of the wrapped dialer.
pub struct EncryptedDialer {
    inner: Box<dyn Dialer>,
    spec: CipherSpec,
}

#[async_trait]
impl Dialer for EncryptedDialer {
    async fn dial(&self, addr: &str) -> Result<Conn, TransportError> {
        let raw = self.inner.dial(addr).await?;
        debug!(remote = %addr, cipher = ?self.spec.kind, "Encrypting outbound connection");
        Ok(seal(raw, &self.spec))
    }
}

/// Listener decorator encrypting every connection of the wrapped listener.
pub struct EncryptedListener {
    inner: Box<dyn Listener>,
    spec: CipherSpec,
}

#[async_trait]
impl Listener for EncryptedListener {
    async fn accept(&mut self) -> Result<(Conn, SocketAddr), TransportError> {
        let (raw, peer) = self.inner.accept().await?;
        Ok((seal(raw, &self.spec), peer))
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.inner.local_addr()
    }
}

/// Wraps a raw dialer with the record layer for `cipher` / `key`.
pub fn wrap_dialer(
    inner: Box<dyn Dialer>,
    cipher: &str,
    key: &str,
) -> Result<EncryptedDialer, TransportError> {
    let spec = CipherSpec::new(cipher, key)?;
    Ok(EncryptedDialer { inner, spec })
}

/// Wraps a raw listener with the record layer for `cipher` / `key`.
pub fn wrap_listener(
    inner: Box<dyn Listener>,
    cipher: &str,
    key: &str,
) -> Result<EncryptedListener, TransportError> {
    let spec = CipherSpec::new(cipher, key)?;
    Ok(EncryptedListener { inner, spec })
}
