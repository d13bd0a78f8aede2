//! In-memory multiplexed transport.
//!
//! Two paired connections exchange streams over channels, with no real I/O.
//! Used by the test suite and for wiring a client and server inside one
//! process.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use floe_types::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{MultiplexedConnection, MultiplexedStream, StreamReader, StreamWriter};

enum StreamEvent {
    Data(Bytes),
    Fin,
    Reset,
}

/// One side of an in-memory connection pair.
pub struct MemConnection {
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemStream>>,
    peer_tx: mpsc::UnboundedSender<MemStream>,
    next_stream_id: AtomicU64,
    link_closed: CancellationToken,
}

/// Create a connected pair. The first connection is the initiator and opens
/// odd-numbered streams; the second opens even-numbered ones.
pub fn pair() -> (MemConnection, MemConnection) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let link_closed = CancellationToken::new();
    let initiator = MemConnection {
        accept_rx: tokio::sync::Mutex::new(a_rx),
        peer_tx: b_tx,
        next_stream_id: AtomicU64::new(1),
        link_closed: link_closed.clone(),
    };
    let acceptor = MemConnection {
        accept_rx: tokio::sync::Mutex::new(b_rx),
        peer_tx: a_tx,
        next_stream_id: AtomicU64::new(2),
        link_closed,
    };
    (initiator, acceptor)
}

impl MemConnection {
    fn open(&self, bidirectional: bool) -> Result<MemStream, Error> {
        if self.link_closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (back_tx, back_rx) = if bidirectional {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let remote = MemStream {
            id,
            bidirectional,
            writer: back_tx.map(|tx| MemStreamWriter {
                tx,
                link_closed: self.link_closed.clone(),
                finished: false,
            }),
            reader: Some(MemStreamReader {
                rx: out_rx,
                done: false,
            }),
        };
        self.peer_tx
            .send(remote)
            .map_err(|_| Error::ConnectionClosed)?;

        Ok(MemStream {
            id,
            bidirectional,
            writer: Some(MemStreamWriter {
                tx: out_tx,
                link_closed: self.link_closed.clone(),
                finished: false,
            }),
            reader: back_rx.map(|rx| MemStreamReader { rx, done: false }),
        })
    }
}

impl MultiplexedConnection for MemConnection {
    type Stream = MemStream;

    async fn accept_stream(&self) -> Result<MemStream, Error> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.link_closed.cancelled() => Err(Error::ConnectionClosed),
            stream = rx.recv() => stream.ok_or(Error::ConnectionClosed),
        }
    }

    async fn open_bidirectional(&self) -> Result<MemStream, Error> {
        self.open(true)
    }

    async fn open_unidirectional(&self) -> Result<MemStream, Error> {
        self.open(false)
    }

    async fn close(&self) {
        self.link_closed.cancel();
    }
}

pub struct MemStream {
    id: u64,
    bidirectional: bool,
    writer: Option<MemStreamWriter>,
    reader: Option<MemStreamReader>,
}

impl MultiplexedStream for MemStream {
    type Writer = MemStreamWriter;
    type Reader = MemStreamReader;

    fn id(&self) -> u64 {
        self.id
    }

    fn is_bidirectional(&self) -> bool {
        self.bidirectional
    }

    fn into_halves(mut self) -> (Option<MemStreamWriter>, Option<MemStreamReader>) {
        (self.writer.take(), self.reader.take())
    }
}

pub struct MemStreamWriter {
    tx: mpsc::UnboundedSender<StreamEvent>,
    link_closed: CancellationToken,
    finished: bool,
}

impl StreamWriter for MemStreamWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<(), Error> {
        if self.link_closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        self.tx
            .send(StreamEvent::Data(chunk))
            .map_err(|_| Error::transport("stream closed by peer"))
    }

    async fn finish(&mut self) -> Result<(), Error> {
        self.finished = true;
        // The peer may already be gone; a lost Fin is indistinguishable
        // from a close that raced it.
        let _ = self.tx.send(StreamEvent::Fin);
        Ok(())
    }

    fn reset(&mut self) {
        self.finished = true;
        let _ = self.tx.send(StreamEvent::Reset);
    }
}

impl Drop for MemStreamWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.tx.send(StreamEvent::Reset);
        }
    }
}

pub struct MemStreamReader {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    done: bool,
}

impl StreamReader for MemStreamReader {
    async fn read(&mut self) -> Result<Option<Bytes>, Error> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(StreamEvent::Data(chunk)) => Ok(Some(chunk)),
            Some(StreamEvent::Fin) => {
                self.done = true;
                Ok(None)
            }
            Some(StreamEvent::Reset) => {
                self.done = true;
                Err(Error::transport("stream reset by peer"))
            }
            None => {
                self.done = true;
                Err(Error::transport("stream closed"))
            }
        }
    }
}
