//! Codec module - header/body serialization over a framed stream.
//!
//! - [`JsonCodec`] - JSON using `serde_json`
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde`
//!
//! The codec for a connection is chosen by [`CodecType`] in the handshake.
//! [`CodecReader`] and [`CodecWriter`] are the two halves of a connection's
//! codec: the reader pulls headers and bodies off the stream, the writer puts
//! a header and its body on the stream as one unit.
//!
//! # Example
//!
//! ```
//! use simplerpc::codec::CodecType;
//!
//! let codec = CodecType::Json;
//! let encoded = codec.encode(&(1, "two")).unwrap();
//! let decoded: (i32, String) = codec.decode(&encoded).unwrap();
//! assert_eq!(decoded, (1, "two".to_string()));
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::warn;

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::protocol::{put_frame, read_frame};

/// Boxed read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Header carried on every request and response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Format "Service.Method".
    pub service_method: String,
    /// Sequence number chosen by the client.
    pub seq: u64,
    /// Empty unless the call failed.
    #[serde(default)]
    pub error: String,
}

impl Header {
    pub fn new(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Body sent in place of a reply when a call fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidRequest {}

/// Negotiated serialization format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CodecType {
    Json,
    #[default]
    MsgPack,
}

impl CodecType {
    pub const JSON: &'static str = "application/json";
    pub const MSGPACK: &'static str = "application/msgpack";

    pub fn as_str(&self) -> &'static str {
        match self {
            CodecType::Json => Self::JSON,
            CodecType::MsgPack => Self::MSGPACK,
        }
    }

    /// Look a codec up by its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            Self::JSON => Some(CodecType::Json),
            Self::MSGPACK => Some(CodecType::MsgPack),
            _ => None,
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecType::Json => JsonCodec::encode(value),
            CodecType::MsgPack => MsgPackCodec::encode(value),
        }
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecType::Json => JsonCodec::decode(bytes),
            CodecType::MsgPack => MsgPackCodec::decode(bytes),
        }
    }
}

impl std::fmt::Display for CodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CodecType {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| RpcError::InvalidCodec(s.to_string()))
    }
}

impl Serialize for CodecType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CodecType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        CodecType::from_name(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid codec type {}", name)))
    }
}

/// Read half of a connection's codec.
pub struct CodecReader {
    reader: BufReader<BoxedReader>,
    codec: CodecType,
    max_frame_size: usize,
}

impl CodecReader {
    pub fn new(reader: BoxedReader, codec: CodecType) -> Self {
        Self {
            reader: BufReader::new(reader),
            codec,
            max_frame_size: RpcConfig::MAX_FRAME_SIZE,
        }
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    /// Read the next header.
    ///
    /// A clean disconnect between frames surfaces as `ConnectionClosed`.
    pub async fn read_header(&mut self) -> Result<Header> {
        let frame = read_frame(&mut self.reader, self.max_frame_size)
            .await?
            .ok_or(RpcError::ConnectionClosed)?;
        self.codec.decode(&frame)
    }

    /// Read the body that follows a header, still encoded.
    pub async fn read_body(&mut self) -> Result<Bytes> {
        let frame = read_frame(&mut self.reader, self.max_frame_size)
            .await?
            .ok_or(RpcError::ConnectionClosed)?;
        Ok(Bytes::from(frame))
    }

    /// Read and decode the body that follows a header.
    pub async fn read_body_into<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let body = self.read_body().await?;
        self.codec.decode(&body)
    }

    /// Consume the body that follows a header without decoding it.
    pub async fn discard_body(&mut self) -> Result<()> {
        self.read_body().await.map(drop)
    }
}

/// Write half of a connection's codec.
pub struct CodecWriter {
    writer: BufWriter<BoxedWriter>,
    codec: CodecType,
    closed: bool,
}

impl CodecWriter {
    pub fn new(writer: BoxedWriter, codec: CodecType) -> Self {
        Self {
            writer: BufWriter::new(writer),
            codec,
            closed: false,
        }
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    /// Write a header followed by its already-encoded body, then flush.
    ///
    /// Any failure closes the writer; a half-written pair leaves the stream
    /// unusable.
    pub async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        if self.closed {
            return Err(RpcError::Shutdown);
        }

        let result = self.write_pair(header, body).await;
        if let Err(e) = &result {
            warn!("rpc codec: error writing frame for {}: {}", header.service_method, e);
            let _ = self.close().await;
        }
        result
    }

    async fn write_pair(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header_bytes = self.codec.encode(header)?;
        put_frame(&mut self.writer, &header_bytes).await?;
        put_frame(&mut self.writer, body).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut the write side down. Closing twice is harmless.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.shutdown().await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe(codec: CodecType) -> (CodecReader, CodecWriter) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (read_half, _) = tokio::io::split(a);
        let (_, write_half) = tokio::io::split(b);
        (
            CodecReader::new(Box::new(read_half), codec),
            CodecWriter::new(Box::new(write_half), codec),
        )
    }

    #[test]
    fn test_codec_names() {
        assert_eq!(CodecType::from_name("application/json"), Some(CodecType::Json));
        assert_eq!(CodecType::from_name("application/msgpack"), Some(CodecType::MsgPack));
        assert_eq!(CodecType::from_name("application/gob"), None);
        assert!("text/plain".parse::<CodecType>().is_err());
        assert_eq!(CodecType::default(), CodecType::MsgPack);
    }

    #[test]
    fn test_invalid_request_is_empty_object() {
        assert_eq!(CodecType::Json.encode(&InvalidRequest {}).unwrap(), b"{}");
        assert_eq!(CodecType::MsgPack.encode(&InvalidRequest {}).unwrap(), vec![0x80]);
    }

    #[tokio::test]
    async fn test_header_and_body_roundtrip_every_codec() {
        for codec in [CodecType::Json, CodecType::MsgPack] {
            let (mut reader, mut writer) = pipe(codec);

            let mut header = Header::new("Foo.Sum", 7);
            header.error = "bad things".to_string();
            let body = codec.encode(&vec![1u32, 2, 3]).unwrap();
            writer.write(&header, &body).await.unwrap();

            assert_eq!(reader.read_header().await.unwrap(), header);
            let decoded: Vec<u32> = reader.read_body_into().await.unwrap();
            assert_eq!(decoded, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_discard_body_keeps_stream_aligned() {
        let (mut reader, mut writer) = pipe(CodecType::Json);

        writer
            .write(&Header::new("A.First", 1), b"\"skip me\"")
            .await
            .unwrap();
        writer.write(&Header::new("A.Second", 2), b"42").await.unwrap();

        assert_eq!(reader.read_header().await.unwrap().seq, 1);
        reader.discard_body().await.unwrap();
        assert_eq!(reader.read_header().await.unwrap().seq, 2);
        assert_eq!(reader.read_body_into::<u32>().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_closed_writer_rejects_writes() {
        let (mut reader, mut writer) = pipe(CodecType::MsgPack);
        writer.close().await.unwrap();
        writer.close().await.unwrap();

        let err = writer.write(&Header::new("A.B", 1), b"").await.unwrap_err();
        assert!(matches!(err, RpcError::Shutdown));
        assert!(matches!(
            reader.read_header().await.unwrap_err(),
            RpcError::ConnectionClosed
        ));
    }
}
