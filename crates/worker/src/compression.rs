//! Streaming compression stages for the content pipeline.
//!
//! Each stage wraps a byte stream in an async-compression codec through
//! `StreamReader`/`ReaderStream`, so no stage ever holds more than the codec
//! window and one read buffer.
//!
//! Decoders stop reading at the end of the compressed frame. The decode stage
//! therefore drains its input after the frame so that errors raised at the end
//! of the input (such as a digest mismatch) still reach the caller.

use crate::error::{ServiceError, ServiceResult};
use async_compression::Level;
use async_compression::tokio::bufread::{XzDecoder, XzEncoder, ZstdDecoder, ZstdEncoder};
use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use murmur_core::Compression;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::{ReaderStream, StreamReader};

/// Read buffer for codec output.
const CODEC_BUF_SIZE: usize = 64 * 1024;

/// Boxed pipeline stream of service results.
pub type PipelineStream = BoxStream<'static, ServiceResult<Bytes>>;

fn reader_to_stream<R>(reader: R) -> PipelineStream
where
    R: AsyncRead + Send + 'static,
{
    ReaderStream::with_capacity(reader, CODEC_BUF_SIZE)
        .map(|chunk| chunk.map_err(ServiceError::from))
        .boxed()
}

/// Compress `input` with `compression`. `Compression::None` passes through.
pub fn compress_stream<S>(input: S, compression: Compression) -> PipelineStream
where
    S: Stream<Item = ServiceResult<Bytes>> + Send + 'static,
{
    if compression.is_none() {
        return input.boxed();
    }
    let reader = StreamReader::new(input.map(|chunk| chunk.map_err(std::io::Error::from)));
    match compression {
        Compression::None | Compression::Zstd => {
            reader_to_stream(ZstdEncoder::with_quality(reader, Level::Default))
        }
        Compression::Xz => reader_to_stream(XzEncoder::with_quality(reader, Level::Default)),
    }
}

type SourceReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// Undo [`compress_stream`].
///
/// The whole input is consumed even when the compressed frame ends early, and
/// any error the input yields after the frame fails the stream.
pub fn decompress_stream<S>(input: S, compression: Compression) -> PipelineStream
where
    S: Stream<Item = ServiceResult<Bytes>> + Send + 'static,
{
    if compression.is_none() {
        return input.boxed();
    }
    let reader: SourceReader =
        StreamReader::new(input.map(|chunk| chunk.map_err(io::Error::from)).boxed());
    match compression {
        Compression::None | Compression::Zstd => {
            decode_to_end(ZstdDecoder::new(reader), ZstdDecoder::into_inner)
        }
        Compression::Xz => decode_to_end(XzDecoder::new(reader), XzDecoder::into_inner),
    }
}

fn decode_to_end<D>(mut decoder: D, into_source: fn(D) -> SourceReader) -> PipelineStream
where
    D: AsyncRead + Unpin + Send + 'static,
{
    try_stream! {
        loop {
            let mut buf = BytesMut::with_capacity(CODEC_BUF_SIZE);
            if decoder.read_buf(&mut buf).await? == 0 {
                break;
            }
            yield buf.freeze();
        }

        let (mut rest, pending) = into_source(decoder).into_inner_with_chunk();
        let mut trailing = pending.map_or(0, |chunk| chunk.len());
        while let Some(chunk) = rest.next().await {
            trailing += chunk?.len();
        }
        if trailing > 0 {
            tracing::debug!(trailing, "ignored bytes after compressed frame");
        }
    }
    .boxed()
}
