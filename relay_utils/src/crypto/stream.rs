//! AES-GCM record layer over an arbitrary byte stream.
//!
//! # Wire Format
//!
//! Each direction starts with a random 16-byte salt; the direction key is
//! `SHA-256(key || salt)` truncated to the cipher's key length. Records follow:
//!
//! ```text
//! +----------------+-----------------+-----------------------------+
//! |  Length (4)    |   Nonce (12)    |   Ciphertext + Tag (var)    |
//! +----------------+-----------------+-----------------------------+
//! ```
//!
//! Length counts nonce, ciphertext and tag. Nonces run as a fixed prefix plus
//! a counter starting at zero. A record that fails to authenticate or arrives
//! out of sequence terminates the connection.

use super::CipherSpec;
use super::aes_gcm::{AesGcmCipher, NONCE_SIZE, NonceWindow, TAG_SIZE};
use crate::transport::{Conn, TransportError};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

const SALT_SIZE: usize = 16;
const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;
const MAX_RECORD_SIZE: usize = NONCE_SIZE + MAX_RECORD_PLAINTEXT + TAG_SIZE;
const PIPE_CAPACITY: usize = 64 * 1024;

/// Wraps `raw` so that everything written is encrypted and everything read
/// is decrypted.
///
/// The returned connection is one end of an in-memory pipe; two background
/// tasks move records between the pipe and `raw`. Dropping the returned
/// connection closes the write direction of `raw`.
pub fn seal(raw: Conn, spec: &CipherSpec) -> Conn {
    let (app, local) = tokio::io::duplex(PIPE_CAPACITY);
    let (raw_rd, raw_wr) = tokio::io::split(raw);
    let (local_rd, local_wr) = tokio::io::split(local);

    let outbound = spec.clone();
    tokio::spawn(async move {
        if let Err(e) = encrypt_pump(local_rd, raw_wr, &outbound).await {
            debug!(error = %e, "Encrypting pump stopped");
        }
    });

    let inbound = spec.clone();
    tokio::spawn(async move {
        let mut local_wr = local_wr;
        if let Err(e) = decrypt_pump(raw_rd, &mut local_wr, &inbound).await {
            debug!(error = %e, "Decrypting pump stopped");
        }
        // The reader must observe EOF even when the pump failed
        let _ = local_wr.shutdown().await;
    });

    Box::new(app)
}

fn direction_cipher(spec: &CipherSpec, salt: &[u8]) -> Result<AesGcmCipher, TransportError> {
    let mut hasher = Sha256::new();
    hasher.update(spec.key());
    hasher.update(salt);
    let digest = hasher.finalize();
    AesGcmCipher::new(&digest[..spec.kind().key_len()])
        .map_err(|e| TransportError::Configuration(e.to_string()))
}

async fn encrypt_pump<R, W>(
    mut plain: R,
    mut wire: W,
    spec: &CipherSpec,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let cipher = direction_cipher(spec, &salt)?;
    wire.write_all(&salt).await?;

    let mut buf = vec![0u8; MAX_RECORD_PLAINTEXT];
    loop {
        let n = plain.read(&mut buf).await?;
        if n == 0 {
            wire.shutdown().await?;
            return Ok(());
        }

        let record = cipher
            .seal(&buf[..n])
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        wire.write_u32(record.len() as u32).await?;
        wire.write_all(&record).await?;
        trace!(plaintext_len = n, record_len = record.len(), "Record sealed");
    }
}

async fn decrypt_pump<R, W>(
    mut wire: R,
    plain: &mut W,
    spec: &CipherSpec,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut salt = [0u8; SALT_SIZE];
    wire.read_exact(&mut salt).await?;
    let cipher = direction_cipher(spec, &salt)?;
    let mut window = NonceWindow::new();

    let mut record = Vec::with_capacity(MAX_RECORD_SIZE);
    loop {
        let len = match wire.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !(NONCE_SIZE + TAG_SIZE..=MAX_RECORD_SIZE).contains(&len) {
            return Err(TransportError::Protocol(format!(
                "record length {} out of range",
                len
            )));
        }

        record.resize(len, 0);
        wire.read_exact(&mut record).await?;
        let plaintext = cipher
            .open(&record)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        window
            .accept(&record)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        plain.write_all(&plaintext).await?;
    }
}
