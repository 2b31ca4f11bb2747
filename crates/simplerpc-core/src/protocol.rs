//! Connection handshake and frame I/O.
//!
//! Every frame on the wire is a 4-byte big-endian length prefix followed by
//! that many payload bytes:
//!
//! ```text
//! [u32 BE: len][payload of len bytes]
//! ```
//!
//! A connection starts with exactly one JSON-encoded [`Options`] frame. After
//! that, each request and response is a pair of frames (header, body) encoded
//! with the codec the handshake negotiated.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::CodecType;
use crate::config::RpcConfig;
use crate::error::{Result, RpcError};

/// Handshake record exchanged once at connection start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    pub magic_number: u32,
    pub codec_type: CodecType,
    /// Bound on dial plus handshake; zero means no limit.
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Bound on each request's handling on the server; zero means no limit.
    #[serde(with = "duration_millis")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: RpcConfig::MAGIC_NUMBER,
            codec_type: CodecType::default(),
            connect_timeout: RpcConfig::DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(mut self, codec_type: CodecType) -> Self {
        self.codec_type = codec_type;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    /// Options as they go on the wire: the magic number is always ours.
    pub(crate) fn normalized(&self) -> Self {
        Self {
            magic_number: RpcConfig::MAGIC_NUMBER,
            ..self.clone()
        }
    }

    /// Check a received handshake.
    pub fn validate(&self) -> Result<()> {
        if self.magic_number != RpcConfig::MAGIC_NUMBER {
            return Err(RpcError::Handshake {
                message: format!("invalid magic number {:x}", self.magic_number),
            });
        }
        Ok(())
    }
}

/// Write the handshake frame.
pub async fn write_options<W: AsyncWrite + Unpin>(writer: &mut W, options: &Options) -> Result<()> {
    let payload = serde_json::to_vec(&options.normalized())?;
    write_frame(writer, &payload).await
}

/// Read and validate the handshake frame.
pub async fn read_options<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Options> {
    let payload = read_frame(reader, RpcConfig::MAX_FRAME_SIZE)
        .await?
        .ok_or(RpcError::ConnectionClosed)?;
    let options: Options = serde_json::from_slice(&payload).map_err(|e| RpcError::Handshake {
        message: format!("options error: {}", e),
    })?;
    options.validate()?;
    Ok(options)
}

/// Read a length-prefixed frame.
///
/// Returns `None` on clean EOF (peer closed the connection between frames).
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(RpcError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    put_frame(writer, payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a length-prefixed frame without flushing.
pub(crate) async fn put_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| RpcError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_wire_shape() {
        let options = Options::default()
            .with_codec(CodecType::Json)
            .with_handle_timeout(Duration::from_millis(1500));
        let value = serde_json::to_value(&options).unwrap();

        assert_eq!(value["magicNumber"], RpcConfig::MAGIC_NUMBER);
        assert_eq!(value["codecType"], "application/json");
        assert_eq!(value["connectTimeout"], 10_000);
        assert_eq!(value["handleTimeout"], 1500);
    }

    #[test]
    fn test_normalized_restores_magic_number() {
        let options = Options {
            magic_number: 7,
            ..Options::default()
        };
        assert_eq!(options.normalized().magic_number, RpcConfig::MAGIC_NUMBER);
        assert!(options.validate().is_err());
    }

    #[tokio::test]
    async fn test_options_roundtrip() {
        let options = Options::default().with_codec(CodecType::MsgPack);
        let mut buf = Vec::new();
        write_options(&mut buf, &options).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_options(&mut cursor).await.unwrap();
        assert_eq!(read_back, options);
    }

    #[tokio::test]
    async fn test_unknown_codec_rejected() {
        let payload = br#"{"magicNumber":3927900,"codecType":"application/gob","connectTimeout":0,"handleTimeout":0}"#;
        let mut buf = Vec::new();
        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_options(&mut cursor).await.unwrap_err();
        assert!(matches!(err, RpcError::Handshake { .. }));
        assert!(err.to_string().contains("application/gob"));
    }

    #[tokio::test]
    async fn test_bad_magic_rejected() {
        let payload = br#"{"magicNumber":1,"codecType":"application/json","connectTimeout":0,"handleTimeout":0}"#;
        let mut buf = Vec::new();
        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_options(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("invalid magic number"));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2048u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, RpcError::FrameTooLarge { size: 2048, max: 1024 }));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"abc");

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor, 1024).await.is_err());
    }
}
