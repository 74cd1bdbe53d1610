//! Framed envelope I/O over any tokio byte stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use crate::envelope::Envelope;
use crate::error::{Result, TransferError};
use crate::protocol::timeouts::write_deadline_ms;
use crate::protocol::HEADER_LEN;
use crate::protocol_core::{build_frame_header, parse_frame_header};

/// Read one frame payload. `Ok(None)` means the peer closed the stream
/// cleanly between frames.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; HEADER_LEN];
    match stream.read_exact(&mut hdr).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = parse_frame_header(&hdr)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await?;
    }
    Ok(Some(payload))
}

pub async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let ms = write_deadline_ms(payload.len());
    let hdr = build_frame_header(payload.len() as u32);
    match timeout(Duration::from_millis(ms), async {
        stream.write_all(&hdr).await?;
        if !payload.is_empty() {
            stream.write_all(payload).await?;
        }
        stream.flush().await
    })
    .await
    {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransferError::Transport(format!(
            "frame write timeout ({ms} ms)"
        ))),
    }
}

pub async fn write_envelope<W>(stream: &mut W, env: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = env.encode()?;
    crate::protocol_core::validate_frame_size(payload.len())?;
    write_frame(stream, &payload).await
}

/// Outcome of reading one frame off a connection.
#[derive(Debug)]
pub enum Inbound {
    Envelope(Envelope),
    /// Well-framed but not a valid envelope; the stream is still usable.
    Rejected(TransferError),
    Closed,
}

/// Read the next envelope. Framing failures are returned as errors (the
/// connection must be dropped); schema failures come back as
/// [`Inbound::Rejected`].
pub async fn read_envelope<R>(stream: &mut R) -> Result<Inbound>
where
    R: AsyncRead + Unpin,
{
    match read_frame(stream).await? {
        None => Ok(Inbound::Closed),
        Some(payload) => match Envelope::decode(&payload) {
            Ok(env) => Ok(Inbound::Envelope(env)),
            Err(e) => Ok(Inbound::Rejected(e)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_envelopes_survive_the_stream() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let id = Uuid::new_v4();
        write_envelope(
            &mut a,
            &Envelope::ClientInfo {
                client_id: "c1".into(),
            },
        )
        .await
        .unwrap();
        write_envelope(&mut a, &Envelope::DownloadComplete { request_id: id })
            .await
            .unwrap();
        drop(a);

        match read_envelope(&mut b).await.unwrap() {
            Inbound::Envelope(Envelope::ClientInfo { client_id }) => assert_eq!(client_id, "c1"),
            other => panic!("unexpected {other:?}"),
        }
        match read_envelope(&mut b).await.unwrap() {
            Inbound::Envelope(Envelope::DownloadComplete { request_id }) => {
                assert_eq!(request_id, id)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(read_envelope(&mut b).await.unwrap(), Inbound::Closed));
    }

    #[tokio::test]
    async fn test_malformed_payload_keeps_stream_usable() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, br#"{"type":"bogus"}"#).await.unwrap();
        write_envelope(&mut a, &Envelope::Ping).await.unwrap();

        assert!(matches!(
            read_envelope(&mut b).await.unwrap(),
            Inbound::Rejected(TransferError::Protocol(_))
        ));
        assert!(matches!(
            read_envelope(&mut b).await.unwrap(),
            Inbound::Envelope(Envelope::Ping)
        ));
    }

    #[tokio::test]
    async fn test_bad_magic_is_fatal() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(b"GARBAGE!!!").await.unwrap();
        assert!(read_envelope(&mut b).await.is_err());
    }
}
