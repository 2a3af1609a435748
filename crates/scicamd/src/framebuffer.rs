//! Fixed pool of frame buffers shared between the acquisition thread and
//! the output workers.
//!
//! A [`FrameSlot`] owns its pixel storage while it is in flight and sends
//! it back to the pool when dropped, so a slot can never be lost or
//! returned twice.

use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

pub struct FramePool {
    free_tx: Sender<Vec<u16>>,
    free_rx: Receiver<Vec<u16>>,
    slots: usize,
    pixels: usize,
}

/// One frame worth of pixels checked out of a [`FramePool`].
pub struct FrameSlot {
    pixels: Vec<u16>,
    home: Sender<Vec<u16>>,
}

impl FramePool {
    /// Allocate `slots` buffers of `pixels` 16-bit values each.
    pub fn new(slots: usize, pixels: usize) -> Self {
        let (free_tx, free_rx) = mpsc::channel();
        for _ in 0..slots {
            // The receiver lives in `self`, so this cannot fail.
            let _ = free_tx.send(vec![0u16; pixels]);
        }

        Self {
            free_tx,
            free_rx,
            slots,
            pixels,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots
    }

    pub fn pixels_per_slot(&self) -> usize {
        self.pixels
    }

    /// Take a free slot, waiting at most `timeout` for one to be returned.
    pub fn take_timeout(&self, timeout: Duration) -> Option<FrameSlot> {
        let pixels = self.free_rx.recv_timeout(timeout).ok()?;
        Some(FrameSlot {
            pixels,
            home: self.free_tx.clone(),
        })
    }

    /// Block until every slot has been returned, consuming the pool.
    pub fn drain(self) {
        for _ in 0..self.slots {
            if self.free_rx.recv().is_err() {
                break;
            }
        }
    }
}

impl FrameSlot {
    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u16] {
        &mut self.pixels
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        // Fails only once the pool itself is gone.
        let _ = self.home.send(std::mem::take(&mut self.pixels));
    }
}
