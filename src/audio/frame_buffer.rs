//! Bounded FIFO of fixed-size PCM frames between the audio producer and the
//! send loop.
//!
//! Slots are allocated once up front and written under the lock, so neither
//! `pop` nor `clear` can ever observe a half-copied frame. A full buffer
//! parks the producer on a condvar; the consumer side never blocks.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{audio::constants::CANCEL_POLL_MS, common::errors::VoiceError};

struct Slots {
    frames: Vec<Box<[u8]>>,
    read: usize,
    len: usize,
    /// Bumped by every `clear`.
    generation: u64,
}

pub struct FrameBuffer {
    frame_size: usize,
    capacity: usize,
    slots: Mutex<Slots>,
    /// Signalled whenever a slot frees up.
    space: Condvar,
    /// Signalled when the buffer becomes empty.
    emptied: Condvar,
}

impl FrameBuffer {
    /// `capacity` is clamped to at least one slot.
    pub fn new(capacity: usize, frame_size: usize) -> Self {
        let capacity = capacity.max(1);
        let frames = (0..capacity)
            .map(|_| vec![0u8; frame_size].into_boxed_slice())
            .collect();

        Self {
            frame_size,
            capacity,
            slots: Mutex::new(Slots {
                frames,
                read: 0,
                len: 0,
                generation: 0,
            }),
            space: Condvar::new(),
            emptied: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies one frame into the next free slot, blocking while the buffer
    /// is full.
    pub fn push(&self, frame: &[u8], cancel: &CancellationToken) -> Result<(), VoiceError> {
        self.push_inner(frame, None, cancel).map(|_| ())
    }

    /// Current clear generation, for use with [`FrameBuffer::push_unless_cleared`].
    pub fn generation(&self) -> u64 {
        self.slots.lock().generation
    }

    /// Like `push`, but gives up with `Ok(false)` if a `clear` has happened
    /// since `generation` was read, including one that runs while this call
    /// is parked on a full buffer.
    pub fn push_unless_cleared(
        &self,
        frame: &[u8],
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<bool, VoiceError> {
        self.push_inner(frame, Some(generation), cancel)
    }

    fn push_inner(
        &self,
        frame: &[u8],
        generation: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<bool, VoiceError> {
        if frame.len() != self.frame_size {
            return Err(VoiceError::InvalidFrame {
                expected: self.frame_size,
                actual: frame.len(),
            });
        }

        let mut slots = self.slots.lock();
        loop {
            if cancel.is_cancelled() {
                return Err(VoiceError::Cancelled);
            }
            if generation.is_some_and(|g| g != slots.generation) {
                return Ok(false);
            }
            if slots.len < self.capacity {
                break;
            }
            self.space
                .wait_for(&mut slots, Duration::from_millis(CANCEL_POLL_MS));
        }

        let index = (slots.read + slots.len) % self.capacity;
        slots.frames[index].copy_from_slice(frame);
        slots.len += 1;
        Ok(true)
    }

    /// Moves the oldest frame into `destination`. Never blocks; returns
    /// `false` when there is nothing to send this tick.
    pub fn pop(&self, destination: &mut [u8]) -> bool {
        let mut slots = self.slots.lock();
        if slots.len == 0 {
            return false;
        }

        let index = slots.read;
        destination[..self.frame_size].copy_from_slice(&slots.frames[index]);
        slots.read = (index + 1) % self.capacity;
        slots.len -= 1;
        let now_empty = slots.len == 0;
        drop(slots);

        self.space.notify_one();
        if now_empty {
            self.emptied.notify_all();
        }
        true
    }

    /// Discards every buffered frame and wakes a blocked producer.
    pub fn clear(&self) {
        let mut slots = self.slots.lock();
        slots.read = 0;
        slots.len = 0;
        slots.generation = slots.generation.wrapping_add(1);
        drop(slots);

        self.space.notify_all();
        self.emptied.notify_all();
    }

    /// Blocks until the consumer has taken every buffered frame.
    pub fn drain(&self, cancel: &CancellationToken) -> Result<(), VoiceError> {
        let mut slots = self.slots.lock();
        while slots.len > 0 {
            if cancel.is_cancelled() {
                return Err(VoiceError::Cancelled);
            }
            self.emptied
                .wait_for(&mut slots, Duration::from_millis(CANCEL_POLL_MS));
        }
        Ok(())
    }
}
