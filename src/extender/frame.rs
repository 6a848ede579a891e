//! Tunnel header codec
//!
//! Exactly one header message crosses the tunnel, client to server,
//! immediately after the TLS handshake:
//!
//! ```text
//! +---------------+-------------------------------+
//! | len (u32 LE)  | serialized DestinationHeader  |
//! +---------------+-------------------------------+
//! ```
//!
//! `len` counts the message bytes only. The message is a proto3-canonical
//! encoding of the destination host (field 1) and port (field 2); any
//! proto3-compatible decoder accepts it. After the header the stream is
//! unframed and bytes flow verbatim in both directions.

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ExtenderError;

/// Upper bound on the declared header length
///
/// The server drops any connection declaring more than this without
/// reading further.
pub const MAX_HEADER_LEN: usize = 1024;

/// The destination a tunnel client asks the relay to splice to
#[derive(Clone, PartialEq, Message)]
pub struct DestinationHeader {
    /// True destination host: a DNS name or literal IP
    #[prost(string, tag = "1")]
    pub destination_host: String,
    /// True destination port; the value must fit in a u16
    #[prost(uint32, tag = "2")]
    pub destination_port: u32,
}

impl DestinationHeader {
    /// Build a header for the given host and port
    pub fn new(host: &str, port: u16) -> Self {
        DestinationHeader {
            destination_host: host.to_string(),
            destination_port: u32::from(port),
        }
    }

    /// The destination port as a u16
    ///
    /// Only valid after decode validation; encode never produces an
    /// out-of-range port because construction takes a u16.
    pub fn port(&self) -> u16 {
        self.destination_port as u16
    }
}

/// Write the length-prefixed header frame to the stream
pub async fn write_header<W>(conn: &mut W, header: &DestinationHeader) -> Result<(), ExtenderError>
where
    W: AsyncWrite + Unpin,
{
    let body = header.encode_to_vec();
    if body.len() > MAX_HEADER_LEN {
        return Err(ExtenderError::Framing(format!(
            "header length {} exceeds bound {}",
            body.len(),
            MAX_HEADER_LEN
        )));
    }

    conn.write_all(&(body.len() as u32).to_le_bytes()).await?;
    conn.write_all(&body).await?;
    conn.flush().await?;
    Ok(())
}

/// Read and decode a length-prefixed header frame from the stream
///
/// Fails with [`ExtenderError::Framing`] when the declared length is zero
/// or exceeds [`MAX_HEADER_LEN`], when the body does not decode, or when
/// the decoded port does not fit in a u16. Deadlines are the caller's
/// concern.
pub async fn read_header<R>(conn: &mut R) -> Result<DestinationHeader, ExtenderError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    conn.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len == 0 || len > MAX_HEADER_LEN {
        return Err(ExtenderError::Framing(format!(
            "declared header length {} out of bounds (1..={})",
            len, MAX_HEADER_LEN
        )));
    }

    let mut body = vec![0u8; len];
    conn.read_exact(&mut body).await?;

    decode_body(&body)
}

/// Decode a header message body that has already been read
pub fn decode_body(body: &[u8]) -> Result<DestinationHeader, ExtenderError> {
    let header = DestinationHeader::decode(body)
        .map_err(|e| ExtenderError::Framing(format!("header decode failed: {}", e)))?;

    if header.destination_port > u32::from(u16::MAX) {
        return Err(ExtenderError::Framing(format!(
            "destination port {} out of range",
            header.destination_port
        )));
    }

    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_header_roundtrip() {
        let (mut client, mut server) = duplex(2048);

        let header = DestinationHeader::new("upstream.test", 443);
        write_header(&mut client, &header).await.unwrap();

        let decoded = read_header(&mut server).await.unwrap();
        assert_eq!(decoded.destination_host, "upstream.test");
        assert_eq!(decoded.port(), 443);
        assert_eq!(decoded, header);
    }

    #[tokio::test]
    async fn test_header_roundtrip_long_host() {
        let (mut client, mut server) = duplex(2048);

        // Longest host that still fits the 1024-byte bound with the tag
        // and varint overhead.
        let host = "a".repeat(1016);
        let header = DestinationHeader::new(&host, 65535);
        write_header(&mut client, &header).await.unwrap();

        let decoded = read_header(&mut server).await.unwrap();
        assert_eq!(decoded.destination_host, host);
        assert_eq!(decoded.port(), 65535);
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_header() {
        let (mut client, _server) = duplex(4096);

        let header = DestinationHeader::new(&"a".repeat(2000), 443);
        let err = write_header(&mut client, &header).await.unwrap_err();
        assert!(matches!(err, ExtenderError::Framing(_)));
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_length() {
        let (mut client, mut server) = duplex(64);

        client.write_all(&4096u32.to_le_bytes()).await.unwrap();

        let err = read_header(&mut server).await.unwrap_err();
        assert!(matches!(err, ExtenderError::Framing(_)));
    }

    #[tokio::test]
    async fn test_read_rejects_zero_length() {
        let (mut client, mut server) = duplex(64);

        client.write_all(&0u32.to_le_bytes()).await.unwrap();

        let err = read_header(&mut server).await.unwrap_err();
        assert!(matches!(err, ExtenderError::Framing(_)));
    }

    #[tokio::test]
    async fn test_read_rejects_garbage_body() {
        let (mut client, mut server) = duplex(64);

        client.write_all(&4u32.to_le_bytes()).await.unwrap();
        client.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();

        let err = read_header(&mut server).await.unwrap_err();
        assert!(matches!(err, ExtenderError::Framing(_)));
    }

    #[tokio::test]
    async fn test_read_rejects_out_of_range_port() {
        let (mut client, mut server) = duplex(64);

        let oversized = DestinationHeader {
            destination_host: "h.test".to_string(),
            destination_port: 70_000,
        };
        let body = oversized.encode_to_vec();
        client
            .write_all(&(body.len() as u32).to_le_bytes())
            .await
            .unwrap();
        client.write_all(&body).await.unwrap();

        let err = read_header(&mut server).await.unwrap_err();
        assert!(matches!(err, ExtenderError::Framing(_)));
    }

    #[test]
    fn test_proto3_canonical_encoding() {
        // Field 1 is a length-delimited string (tag byte 0x0a), field 2 a
        // varint (tag byte 0x10); decoders compatible with proto3 rely on
        // these exact tags.
        let header = DestinationHeader::new("ab", 443);
        let body = header.encode_to_vec();
        assert_eq!(&body[..4], &[0x0a, 0x02, b'a', b'b']);
        assert_eq!(body[4], 0x10);
    }
}
