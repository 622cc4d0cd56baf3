//! Frames and frame buffering.
//!
//! - `Frame`: owned RGB888 pixel buffer. Each capture produces a fresh one and
//!   hands ownership to the caller.
//! - `RingBuffer`: bounded FIFO that evicts its oldest entry to admit a new one,
//!   so a producer never blocks and the newest item is always retained.
//! - `SharedRingBuffer`: the ring behind a mutex, for one producer thread and
//!   one consumer. The lock is held for a single push/pop and nothing else.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Bytes per pixel. Channel order is always R, G, B.
pub const CHANNELS: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured image: RGB888, row-major, no padding between rows.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    /// Wrap raw RGB888 pixels. The buffer must be exactly `width * height * 3` bytes.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero ({}x{})", width, height));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(CHANNELS))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// A frame of a single colour. Zero dimensions are raised to 1.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::from_fn(width, height, |_, _| rgb)
    }

    /// Build a frame pixel by pixel. Zero dimensions are raised to 1.
    pub fn from_fn(width: u32, height: u32, mut pixel: impl FnMut(u32, u32) -> [u8; 3]) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let mut data = Vec::with_capacity(width as usize * height as usize * CHANNELS);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&pixel(x, y));
            }
        }
        Self {
            data,
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// All pixels, row-major RGB.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.data
    }

    /// Pixels of row `y`. Panics if `y >= height`.
    pub fn row(&self, y: u32) -> &[u8] {
        let stride = self.stride();
        let start = y as usize * stride;
        &self.data[start..start + stride]
    }

    /// Pixels of rows `start..start + count`, clipped to the frame.
    pub fn rows(&self, start: u32, count: u32) -> &[u8] {
        let stride = self.stride();
        let first = (start.min(self.height) as usize) * stride;
        let last = (start.saturating_add(count).min(self.height) as usize) * stride;
        &self.data[first..last]
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = (y as usize * self.width as usize + x as usize) * CHANNELS;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ]
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Resample to `width` x `height` (bilinear). Returns `self` untouched when the
    /// size already matches.
    pub fn into_resized(self, width: u32, height: u32) -> Frame {
        let width = width.max(1);
        let height = height.max(1);
        if self.dimensions() == (width, height) {
            return self;
        }
        let Frame {
            data,
            width: src_w,
            height: src_h,
        } = self;
        match RgbImage::from_raw(src_w, src_h, data) {
            Some(image) => {
                let resized = imageops::resize(&image, width, height, FilterType::Triangle);
                Frame {
                    data: resized.into_raw(),
                    width,
                    height,
                }
            }
            // Unreachable while `new` is the only way in with foreign pixels.
            None => Frame::filled(width, height, [0, 0, 0]),
        }
    }

    pub fn resized(&self, width: u32, height: u32) -> Frame {
        self.clone().into_resized(width, height)
    }

    fn stride(&self) -> usize {
        self.width as usize * CHANNELS
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// RingBuffer: bounded, evict-oldest FIFO
// ----------------------------------------------------------------------------

/// Upper bound accepted for `buffer_size` settings.
pub const MAX_BUFFER_FRAMES: usize = 1000;

/// Bounded FIFO. Pushing into a full buffer evicts the oldest element first,
/// so `len() <= capacity()` always holds and the newest element is retained.
#[derive(Debug)]
pub struct RingBuffer<T> {
    buffer: VecDeque<T>,
    capacity: NonZeroUsize,
    evicted: u64,
}

pub type FrameBuffer = RingBuffer<Frame>;

impl<T> RingBuffer<T> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.get().min(MAX_BUFFER_FRAMES)),
            capacity,
            evicted: 0,
        }
    }

    /// Append `item`, returning the element evicted to make room, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.buffer.len() >= self.capacity.get() {
            self.evicted += 1;
            self.buffer.pop_front()
        } else {
            None
        };
        self.buffer.push_back(item);
        evicted
    }

    /// Remove and return the oldest element.
    pub fn pop(&mut self) -> Option<T> {
        self.buffer.pop_front()
    }

    /// The most recently pushed element.
    pub fn latest(&self) -> Option<&T> {
        self.buffer.back()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Total elements dropped by eviction since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Change capacity. Shrinking evicts from the front until the bound holds.
    pub fn set_capacity(&mut self, capacity: NonZeroUsize) {
        self.capacity = capacity;
        while self.buffer.len() > capacity.get() {
            self.buffer.pop_front();
            self.evicted += 1;
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buffer.iter()
    }
}

/// `RingBuffer` shared between one producer and one consumer thread.
///
/// Every method takes the lock for exactly one buffer operation. Callers must
/// never perform I/O while holding it, which the API makes impossible.
#[derive(Debug)]
pub struct SharedRingBuffer<T> {
    inner: Arc<Mutex<RingBuffer<T>>>,
}

impl<T> Clone for SharedRingBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedRingBuffer<T> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RingBuffer::new(capacity))),
        }
    }

    pub fn push(&self, item: T) -> Option<T> {
        self.lock().push(item)
    }

    /// Push only if `accept` still holds once the lock is taken. A `clear()`
    /// that follows the condition turning false therefore cannot be undone by
    /// a push racing with it. Returns whether the item was stored.
    pub fn push_if(&self, item: T, accept: impl FnOnce() -> bool) -> bool {
        let mut ring = self.lock();
        if !accept() {
            return false;
        }
        ring.push(item);
        true
    }

    pub fn pop(&self) -> Option<T> {
        self.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn set_capacity(&self, capacity: NonZeroUsize) {
        self.lock().set_capacity(capacity)
    }

    pub fn clear(&self) {
        self.lock().clear()
    }

    // A panic mid-push cannot leave the deque half-updated, so a poisoned
    // buffer is still coherent.
    fn lock(&self) -> MutexGuard<'_, RingBuffer<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
