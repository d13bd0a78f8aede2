//! Multiplexed transport abstraction.
//!
//! The stream-per-request protocol runs over any transport that can open and
//! accept independent bidirectional or unidirectional streams inside one
//! connection. The traits below are that boundary: the runtime consumes them,
//! transports implement them. The in-memory implementation in [`mem`] backs
//! tests and in-process wiring.
//!
//! Stream ids follow the usual parity rule: the connection initiator opens
//! odd-numbered streams, the acceptor even-numbered ones.

use std::future::Future;

use bytes::{Bytes, BytesMut};
use floe_types::Error;

pub mod mem;

/// A connection carrying independent streams.
pub trait MultiplexedConnection: Send + Sync + 'static {
    type Stream: MultiplexedStream;

    /// Accept the next stream opened by the peer.
    fn accept_stream(&self) -> impl Future<Output = Result<Self::Stream, Error>> + Send;

    /// Open a stream carrying data both ways.
    fn open_bidirectional(&self) -> impl Future<Output = Result<Self::Stream, Error>> + Send;

    /// Open a stream the peer can only read from.
    fn open_unidirectional(&self) -> impl Future<Output = Result<Self::Stream, Error>> + Send;

    /// Close the connection. Pending accepts fail; later writes fail.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// One stream inside a multiplexed connection.
pub trait MultiplexedStream: Send + 'static {
    type Writer: StreamWriter;
    type Reader: StreamReader;

    fn id(&self) -> u64;

    fn is_bidirectional(&self) -> bool;

    /// Split into directional halves. The opener of a unidirectional stream
    /// gets only the writer; its acceptor only the reader.
    fn into_halves(self) -> (Option<Self::Writer>, Option<Self::Reader>);
}

/// Send half of a stream.
pub trait StreamWriter: Send + 'static {
    fn write(&mut self, chunk: Bytes) -> impl Future<Output = Result<(), Error>> + Send;

    /// Graceful end-of-stream; the peer observes it as a clean EOF.
    fn finish(&mut self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Abort the stream; the peer observes an error instead of an EOF.
    fn reset(&mut self);
}

/// Receive half of a stream.
pub trait StreamReader: Send + 'static {
    /// Next chunk; `None` at a clean end-of-stream; an error when the peer
    /// reset the stream or the transport failed.
    fn read(&mut self) -> impl Future<Output = Result<Option<Bytes>, Error>> + Send;
}

/// Buffered reader over a [`StreamReader`], for decoding framed data.
///
/// Partial reads stay buffered across calls, so the futures it returns are
/// safe to drop from a `select!`.
pub struct ChunkReader<R> {
    reader: R,
    buf: BytesMut,
    eos: bool,
}

impl<R: StreamReader> ChunkReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::new(),
            eos: false,
        }
    }

    /// Pull one chunk into the buffer. `false` at end-of-stream.
    async fn fill(&mut self) -> Result<bool, Error> {
        if self.eos {
            return Ok(false);
        }
        match self.reader.read().await? {
            Some(chunk) => {
                self.buf.extend_from_slice(&chunk);
                Ok(true)
            }
            None => {
                self.eos = true;
                Ok(false)
            }
        }
    }

    pub async fn read_exact(&mut self, len: usize) -> Result<Bytes, Error> {
        while self.buf.len() < len {
            if !self.fill().await? {
                return Err(Error::Protocol("unexpected end of stream".into()));
            }
        }
        Ok(self.buf.split_to(len).freeze())
    }

    /// Read a varuint62, or `None` when the stream ended cleanly before it.
    pub async fn try_read_varuint62(&mut self) -> Result<Option<u64>, Error> {
        while self.buf.is_empty() {
            if !self.fill().await? {
                return Ok(None);
            }
        }
        let width = 1usize << (self.buf[0] >> 6);
        let bytes = self.read_exact(width).await?;
        let mut dec = floe_wire::Decoder::new(&bytes);
        Ok(Some(dec.read_varuint62()?))
    }

    pub async fn read_varuint62(&mut self) -> Result<u64, Error> {
        self.try_read_varuint62()
            .await?
            .ok_or_else(|| Error::Protocol("unexpected end of stream".into()))
    }

    /// Next chunk of whatever remains: buffered bytes first, then the
    /// underlying stream. `None` at end-of-stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        if !self.buf.is_empty() {
            return Ok(Some(self.buf.split().freeze()));
        }
        if self.eos {
            return Ok(None);
        }
        match self.reader.read().await? {
            Some(chunk) => Ok(Some(chunk)),
            None => {
                self.eos = true;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mem;
    use super::*;

    #[tokio::test]
    async fn chunk_reader_reassembles_split_frames() {
        let (client, server) = mem::pair();
        let stream = client.open_bidirectional().await.unwrap();
        let (writer, _) = stream.into_halves();
        let mut writer = writer.unwrap();

        // One logical frame split across three chunks.
        let mut frame = Vec::new();
        floe_wire::varint::put_varuint62(&mut frame, 6);
        frame.extend_from_slice(b"abcdef");
        writer.write(Bytes::copy_from_slice(&frame[..2])).await.unwrap();
        writer.write(Bytes::copy_from_slice(&frame[2..5])).await.unwrap();
        writer.write(Bytes::copy_from_slice(&frame[5..])).await.unwrap();
        writer.finish().await.unwrap();

        let accepted = server.accept_stream().await.unwrap();
        let (_, reader) = accepted.into_halves();
        let mut reader = ChunkReader::new(reader.unwrap());
        let len = reader.read_varuint62().await.unwrap();
        assert_eq!(len, 6);
        assert_eq!(reader.read_exact(len as usize).await.unwrap().as_ref(), b"abcdef");
        assert_eq!(reader.try_read_varuint62().await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_exact_past_eos_is_a_protocol_error() {
        let (client, server) = mem::pair();
        let stream = client.open_unidirectional().await.unwrap();
        let (writer, reader) = stream.into_halves();
        assert!(reader.is_none());
        let mut writer = writer.unwrap();
        writer.write(Bytes::from_static(b"xy")).await.unwrap();
        writer.finish().await.unwrap();

        let accepted = server.accept_stream().await.unwrap();
        assert!(!accepted.is_bidirectional());
        let (_, reader) = accepted.into_halves();
        let mut reader = ChunkReader::new(reader.unwrap());
        assert!(matches!(
            reader.read_exact(5).await,
            Err(Error::Protocol(_))
        ));
    }
}
