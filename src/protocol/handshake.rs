//! Fixed token exchange that opens every session.
//!
//! The producer speaks first. This is a compatibility check between the two
//! apps; it authenticates nothing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EngineError, ProtocolError};

/// Sent by the producer.
pub const CLIENT_TOKEN: &[u8] = b"MicYouCheck1";
/// Answered by the consumer.
pub const SERVER_TOKEN: &[u8] = b"MicYouCheck2";

async fn expect_token<R>(reader: &mut R, expected: &[u8]) -> Result<(), EngineError>
where
    R: AsyncRead + Unpin,
{
    let mut received = vec![0u8; expected.len()];
    reader.read_exact(&mut received).await?;
    if received != expected {
        return Err(ProtocolError::HandshakeMismatch {
            expected: String::from_utf8_lossy(expected).into_owned(),
            actual: String::from_utf8_lossy(&received).into_owned(),
        }
        .into());
    }
    Ok(())
}

/// Producer side: send the client token and wait for the server token.
pub async fn client_handshake<S>(stream: &mut S) -> Result<(), EngineError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(CLIENT_TOKEN).await?;
    stream.flush().await?;
    expect_token(stream, SERVER_TOKEN).await?;
    log::info!("Handshake completed with server");
    Ok(())
}

/// Consumer side: check the client token and answer.
///
/// Nothing is written back when the token does not match.
pub async fn server_handshake<S>(stream: &mut S) -> Result<(), EngineError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    expect_token(stream, CLIENT_TOKEN).await?;
    stream.write_all(SERVER_TOKEN).await?;
    stream.flush().await?;
    log::info!("Handshake accepted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn both_sides_complete() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let (c, s) = tokio::join!(client_handshake(&mut client), server_handshake(&mut server));
        c.unwrap();
        s.unwrap();
    }

    #[tokio::test]
    async fn server_rejects_foreign_token() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(b"HTTP/1.1 200").await.unwrap();
        let err = server_handshake(&mut server).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Protocol(ProtocolError::HandshakeMismatch { .. })
        ));
        assert!(!err.is_expected_disconnect());
    }

    #[tokio::test]
    async fn client_rejects_wrong_answer() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let peer = tokio::spawn(async move {
            let mut buf = [0u8; 12];
            server.read_exact(&mut buf).await.unwrap();
            server.write_all(b"MicYouCheck9").await.unwrap();
            server
        });
        let err = client_handshake(&mut client).await.unwrap_err();
        assert!(err.to_string().contains("MicYouCheck9"));
        drop(peer.await.unwrap());
    }

    #[tokio::test]
    async fn closed_peer_is_a_quiet_disconnect() {
        let (mut client, server) = tokio::io::duplex(256);
        drop(server);
        let err = client_handshake(&mut client).await.unwrap_err();
        assert!(err.is_expected_disconnect());
    }
}
