/*
    transport.rs - Transport collaborator

    A transport is an ordered, reliable, already-authenticated channel to one peer.
    The router only reads and writes whole messages tagged with a code; any error
    ends the peer's loop.

    MemoryTransport::pair() gives two connected in-process ends, used by tests and
    by nodes that live in one process.
*/

use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::errors::TransportError;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Next message from the peer
    async fn read_message(&self) -> Result<(u64, Vec<u8>), TransportError>;

    async fn write_message(&self, code: u64, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Close the channel; pending and future reads on both ends fail
    async fn close(&self);
}

type Frame = (u64, Vec<u8>);

pub struct MemoryTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    closed: CancellationToken,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = MemoryTransport {
            tx: Mutex::new(Some(a_tx)),
            rx: tokio::sync::Mutex::new(b_rx),
            closed: CancellationToken::new(),
        };
        let b = MemoryTransport {
            tx: Mutex::new(Some(b_tx)),
            rx: tokio::sync::Mutex::new(a_rx),
            closed: CancellationToken::new(),
        };
        (a, b)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn read_message(&self) -> Result<(u64, Vec<u8>), TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            frame = rx.recv() => frame.ok_or(TransportError::Closed),
        }
    }

    async fn write_message(&self, code: u64, bytes: Vec<u8>) -> Result<(), TransportError> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) if !self.closed.is_cancelled() => {
                tx.send((code, bytes)).map_err(|_| TransportError::Closed)
            }
            _ => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        // dropping the sender ends the remote's reads
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}
