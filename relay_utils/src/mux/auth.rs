//! Session authentication for the tunnel (username / password challenge).
//!
//! The exchange runs once per underlying connection, before any stream is
//! opened:
//!
//! ```text
//! client                              server
//!   Hello { username }        ──▶
//!                             ◀──   Challenge { nonce }
//!   Response { HMAC(pw, nonce‖username) } ──▶
//!                             ◀──   Accept { session_id } | Reject { reason }
//! ```

use super::error::{TunnelError, TunnelResult};
use super::frame::{self, Frame, FrameReader, FrameType};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 32;
const AUTH_VERSION: u8 = 1;
const REJECT_REASON: &str = "authentication failed";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuthMessage {
    Hello { version: u8, username: String },
    Challenge { nonce: Vec<u8> },
    Response { mac: Vec<u8> },
    Accept { session_id: String },
    Reject { reason: String },
}

async fn send_auth<W: AsyncWrite + Unpin>(writer: &mut W, msg: &AuthMessage) -> TunnelResult<()> {
    let payload = bincode::serialize(msg)
        .map_err(|e| TunnelError::Protocol(format!("Serialize auth msg: {}", e)))?;
    let frame = Frame::new(FrameType::Auth, 0, payload)?;
    writer.write_all(&frame::encode(&frame)).await?;
    writer.flush().await?;
    Ok(())
}

async fn recv_auth<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> TunnelResult<AuthMessage> {
    let Some(frame) = reader.next_frame().await? else {
        return Err(TunnelError::Protocol("connection closed during authentication".into()));
    };
    if frame.frame_type != FrameType::Auth {
        return Err(TunnelError::Protocol(format!(
            "expected auth frame, got {:?}",
            frame.frame_type
        )));
    }
    bincode::deserialize(&frame.payload)
        .map_err(|e| TunnelError::Protocol(format!("Deserialize auth msg: {}", e)))
}

fn hmac_password(password: &str, nonce: &[u8], username: &str) -> TunnelResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(password.as_bytes())
        .map_err(|e| TunnelError::Config(format!("HMAC key: {}", e)))?;
    mac.update(nonce);
    mac.update(username.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Runs the client side of the exchange; returns the server-issued session id.
pub async fn authenticate_client<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    username: &str,
    password: &str,
) -> TunnelResult<String>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send_auth(
        writer,
        &AuthMessage::Hello {
            version: AUTH_VERSION,
            username: username.to_string(),
        },
    )
    .await?;

    let AuthMessage::Challenge { nonce } = recv_auth(reader).await? else {
        return Err(TunnelError::Protocol("expected Challenge".into()));
    };

    let mac = hmac_password(password, &nonce, username)?;
    send_auth(writer, &AuthMessage::Response { mac }).await?;

    match recv_auth(reader).await? {
        AuthMessage::Accept { session_id } => Ok(session_id),
        AuthMessage::Reject { reason } => Err(TunnelError::Authentication(format!(
            "rejected by server: {}",
            reason
        ))),
        _ => Err(TunnelError::Protocol(
            "unexpected message after response".into(),
        )),
    }
}

/// Outcome of a successful server-side exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub session_id: String,
}

/// Runs the server side of the exchange against the credential table.
///
/// Unknown principals and wrong passwords get the same rejection.
pub async fn authenticate_server<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    credentials: &HashMap<String, String>,
) -> TunnelResult<Principal>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let username = match recv_auth(reader).await? {
        AuthMessage::Hello { version, username } if version == AUTH_VERSION => username,
        AuthMessage::Hello { version, .. } => {
            return Err(TunnelError::Protocol(format!(
                "unsupported auth version {}",
                version
            )));
        }
        _ => return Err(TunnelError::Protocol("expected Hello".into())),
    };

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    send_auth(
        writer,
        &AuthMessage::Challenge {
            nonce: nonce.to_vec(),
        },
    )
    .await?;

    let AuthMessage::Response { mac } = recv_auth(reader).await? else {
        return Err(TunnelError::Protocol("expected Response".into()));
    };

    let verified = match credentials.get(&username) {
        Some(password) => {
            let expected = hmac_password(password, &nonce, &username)?;
            subtle::ConstantTimeEq::ct_eq(mac.as_slice(), expected.as_slice()).into()
        }
        None => false,
    };

    if !verified {
        warn!(username = %username, "Tunnel authentication failed");
        let _ = send_auth(
            writer,
            &AuthMessage::Reject {
                reason: REJECT_REASON.into(),
            },
        )
        .await;
        return Err(TunnelError::Authentication(format!(
            "{} for {}",
            REJECT_REASON, username
        )));
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    send_auth(
        writer,
        &AuthMessage::Accept {
            session_id: session_id.clone(),
        },
    )
    .await?;
    info!(username = %username, session_id = %session_id, "Tunnel client authenticated");
    Ok(Principal {
        username,
        session_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> HashMap<String, String> {
        HashMap::from([("alice".to_string(), "secret".to_string())])
    }

    async fn run_exchange(username: &str, password: &str) -> (TunnelResult<String>, TunnelResult<Principal>) {
        let (client, server) = tokio::io::duplex(4096);
        let (client_rd, mut client_wr) = tokio::io::split(client);
        let (server_rd, mut server_wr) = tokio::io::split(server);
        let mut client_reader = FrameReader::new(client_rd);
        let mut server_reader = FrameReader::new(server_rd);
        let credentials = table();

        tokio::join!(
            authenticate_client(&mut client_reader, &mut client_wr, username, password),
            authenticate_server(&mut server_reader, &mut server_wr, &credentials),
        )
    }

    #[test]
    fn test_hmac_binds_username() {
        let nonce = [7u8; NONCE_LEN];
        let a = hmac_password("secret", &nonce, "alice").unwrap();
        let b = hmac_password("secret", &nonce, "bob").unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_correct_password_is_accepted() {
        let (client, server) = run_exchange("alice", "secret").await;
        let principal = server.unwrap();
        assert_eq!(principal.username, "alice");
        assert_eq!(client.unwrap(), principal.session_id);
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let (client, server) = run_exchange("alice", "wrong").await;
        assert!(matches!(client, Err(TunnelError::Authentication(_))));
        assert!(matches!(server, Err(TunnelError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_client_answers_challenge_with_hmac() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_rd, mut client_wr) = tokio::io::split(client);
        let (server_rd, mut server_wr) = tokio::io::split(server);
        let mut client_reader = FrameReader::new(client_rd);
        let mut server_reader = FrameReader::new(server_rd);

        let scripted_server = async {
            assert!(matches!(
                recv_auth(&mut server_reader).await.unwrap(),
                AuthMessage::Hello { .. }
            ));
            let nonce = vec![42u8; NONCE_LEN];
            send_auth(&mut server_wr, &AuthMessage::Challenge { nonce: nonce.clone() })
                .await
                .unwrap();
            let AuthMessage::Response { mac } = recv_auth(&mut server_reader).await.unwrap() else {
                panic!("expected Response");
            };
            assert_eq!(mac, hmac_password("secret", &nonce, "alice").unwrap());
            send_auth(
                &mut server_wr,
                &AuthMessage::Accept {
                    session_id: "s-1".into(),
                },
            )
            .await
            .unwrap();
        };

        let (session_id, ()) = tokio::join!(
            authenticate_client(&mut client_reader, &mut client_wr, "alice", "secret"),
            scripted_server,
        );
        assert_eq!(session_id.unwrap(), "s-1");
    }

    #[tokio::test]
    async fn test_unknown_principal_is_rejected() {
        let (client, server) = run_exchange("mallory", "secret").await;
        assert!(matches!(client, Err(TunnelError::Authentication(_))));
        assert!(server.is_err());
    }
}
