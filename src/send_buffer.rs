use std::collections::VecDeque;

use bytes::Bytes;
use tracing::trace;

use crate::error::{BdtError, BdtResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendBufferSignal {
    /// occupancy crossed below `capacity - drain_size`, i.e. the application may write again
    Drain,
    /// the buffer became empty
    Empty,
}

/// The application-facing write buffer of a transfer: a queue of byte chunks with a fixed
///  capacity. Chunk boundaries are preserved where possible when data is taken out.
pub struct SendBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
    capacity: usize,
    drain_size: usize,
}

impl SendBuffer {
    pub fn new(capacity: usize, drain_size: usize) -> SendBuffer {
        assert!(drain_size <= capacity);

        SendBuffer {
            chunks: VecDeque::new(),
            len: 0,
            capacity,
            drain_size,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn free(&self) -> usize {
        self.capacity - self.len
    }

    /// Returns the number of bytes accepted. If the chunk does not fit, a small chunk (below
    ///  `drain_size`) is rejected with `OutOfSize` while a big chunk is accepted partially.
    pub fn push(&mut self, data: &[u8]) -> BdtResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let accepted = if data.len() <= self.free() {
            data.len()
        }
        else if data.len() < self.drain_size || self.free() == 0 {
            trace!("send buffer full: rejecting {} bytes, {} free", data.len(), self.free());
            return Err(BdtError::OutOfSize);
        }
        else {
            self.free()
        };

        self.chunks.push_back(Bytes::copy_from_slice(&data[..accepted]));
        self.len += accepted;
        Ok(accepted)
    }

    /// Removes up to `n` bytes from the front of the buffer. The returned signals describe
    ///  occupancy thresholds crossed by this call.
    pub fn head(&mut self, n: usize) -> (Vec<Bytes>, Vec<SendBufferSignal>) {
        let len_before = self.len;

        let mut result = Vec::new();
        let mut remaining = n;
        while remaining > 0 {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };

            if chunk.len() > remaining {
                let tail = chunk.split_off(remaining);
                self.chunks.push_front(tail);
            }
            remaining -= chunk.len();
            self.len -= chunk.len();
            result.push(chunk);
        }

        let mut signals = Vec::new();
        let drain_threshold = self.capacity - self.drain_size;
        if len_before >= drain_threshold && self.len < drain_threshold {
            signals.push(SendBufferSignal::Drain);
        }
        if len_before > 0 && self.len == 0 {
            signals.push(SendBufferSignal::Empty);
        }

        (result, signals)
    }
}
