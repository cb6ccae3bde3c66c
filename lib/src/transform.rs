//! Primitives for blob stream transformations.

use std::pin::Pin;

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use bytes::Bytes;
use futures_lite::Stream;
use tokio_util::io::{ReaderStream, StreamReader};

/// Convenience alias for a chunk of bytes in a stream.
pub type Chunk = Result<Bytes, std::io::Error>;

/// Compression applied to a layer blob, selected from its media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Plain tar; the blob is passed through untouched.
    #[default]
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Decompress `stream` according to the selected compression.
    pub fn decode(
        self,
        stream: impl Stream<Item = Chunk> + Send + Unpin + 'static,
    ) -> Pin<Box<dyn Stream<Item = Chunk> + Send>> {
        match self {
            Compression::None => Box::pin(stream),
            Compression::Gzip => Box::pin(gzip(stream)),
            Compression::Zstd => Box::pin(zstd(stream)),
        }
    }
}

/// Decompress the stream using gzip.
pub fn gzip(
    stream: impl Stream<Item = Chunk> + Send + 'static,
) -> impl Stream<Item = Chunk> + Send {
    let reader = StreamReader::new(stream);
    let inner = GzipDecoder::new(reader);
    ReaderStream::new(inner)
}

/// Decompress the stream using zstd.
pub fn zstd(
    stream: impl Stream<Item = Chunk> + Send + 'static,
) -> impl Stream<Item = Chunk> + Send {
    let reader = StreamReader::new(stream);
    let inner = ZstdDecoder::new(reader);
    ReaderStream::new(inner)
}
