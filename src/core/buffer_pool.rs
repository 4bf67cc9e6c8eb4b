//! Fixed-capacity byte buffers shared by all response relays.
use crossbeam_channel::{Receiver, Sender, bounded};

/// Buffers retained beyond this are dropped on release.
const MAX_RETAINED: usize = 1024;

/// Lock-free pool of `Vec<u8>` with one configured capacity.
///
/// Every buffer handed out is empty and has exactly the configured capacity.
/// A buffer released with any other capacity is discarded instead of pooled.
#[derive(Clone)]
pub struct BufferPool {
    size: usize,
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        let (free_tx, free_rx) = bounded(MAX_RETAINED);
        Self {
            size: size.max(1),
            free_tx,
            free_rx,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn acquire(&self) -> Vec<u8> {
        match self.free_rx.try_recv() {
            Ok(mut buf) => {
                buf.clear();
                buf
            }
            Err(_) => Vec::with_capacity(self.size),
        }
    }

    pub fn release(&self, buf: Vec<u8>) {
        if buf.capacity() != self.size {
            return;
        }
        // Full pool: let it drop.
        let _ = self.free_tx.try_send(buf);
    }

    /// Buffers currently available for reuse.
    pub fn idle(&self) -> usize {
        self.free_rx.len()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("size", &self.size)
            .field("idle", &self.idle())
            .finish()
    }
}
