//! Media data model: frame identities, encoded packets, decoded frames
//! and the per-pipeline frame buffer pool.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Maximum number of planes in a decoded image.
pub const MAX_PLANES: usize = 4;

/// The inclusive epoch range `[i1, i2]` over which a frame is
/// authoritative.
///
/// Sources emit ids back to back: for consecutive frames,
/// `next.i1 == prev.i2 + 1`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId {
    /// First epoch covered by this frame.
    pub i1: i64,
    /// Last epoch covered by this frame.
    pub i2: i64,
}

impl FrameId {
    /// Create an id covering `[i1, i2]`.
    pub const fn new(i1: i64, i2: i64) -> Self {
        Self { i1, i2 }
    }

    /// The id directly following this one, covering `duration` epochs.
    pub const fn next(self, duration: i64) -> Self {
        Self {
            i1: self.i2 + 1,
            i2: self.i2 + duration,
        }
    }

    /// Whether `other` directly follows this id.
    pub const fn precedes(self, other: FrameId) -> bool {
        other.i1 == self.i2 + 1
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.i1, self.i2)
    }
}

/// Width and height in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Pixel layout of a decoded frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// Packed 8-bit RGB, 3 bytes per pixel.
    Rgb24,
    /// Packed 8-bit BGR, 3 bytes per pixel.
    #[default]
    Bgr24,
    /// Packed RGB with a padding byte, 4 bytes per pixel.
    Rgb0,
    /// Packed BGR with a padding byte, 4 bytes per pixel.
    Bgr0,
    /// Planar YUV 4:2:0, three planes.
    Yuv420p,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats; `None` for planar layouts.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Rgb0 | PixelFormat::Bgr0 => Some(4),
            PixelFormat::Yuv420p => None,
        }
    }

    /// Number of planes this format uses.
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            _ => 1,
        }
    }
}

/// Codec configuration for a stream. Infrequent; for H.264 the codec data
/// carries SPS and PPS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedMetadata {
    /// Codec name, e.g. `"h264"`.
    pub codec_name: String,
    /// Opaque codec configuration bytes.
    pub codec_data: Bytes,
    /// Source dimensions, when the container knows them.
    pub image_size: Option<ImageSize>,
}

/// One encoded video packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Encoded payload.
    pub data: Bytes,
    /// Epoch range this frame covers.
    pub id: FrameId,
    /// Capture timestamp in monotonic nanoseconds, when known.
    pub timestamp: Option<i64>,
}

/// An item on the encoded leg of a pipeline: codec metadata or a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncodedPacket {
    /// Codec configuration.
    Metadata(EncodedMetadata),
    /// Encoded frame payload.
    Frame(EncodedFrame),
}

impl EncodedPacket {
    /// Whether this packet is codec metadata.
    pub fn is_metadata(&self) -> bool {
        matches!(self, EncodedPacket::Metadata(_))
    }
}

/// A reference-counted image plane, possibly backed by a [`FramePool`]
/// buffer that returns to the pool when the last reference drops.
pub type Plane = Rc<PoolBuffer>;

/// A decoded video frame.
#[derive(Clone)]
pub struct ImageFrame {
    /// Epoch range inherited from the encoded frame.
    pub id: FrameId,
    /// Pixel data per plane; unused planes are empty.
    pub planes: [Plane; MAX_PLANES],
    /// Row stride in bytes per plane.
    pub strides: [u32; MAX_PLANES],
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel layout.
    pub pixel_format: PixelFormat,
}

impl ImageFrame {
    /// Build a single-plane packed frame.
    pub fn packed(
        id: FrameId,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        plane: Plane,
        stride: u32,
    ) -> Self {
        let mut frame = Self {
            id,
            planes: std::array::from_fn(|_| Rc::new(PoolBuffer::detached(Vec::new()))),
            strides: [0; MAX_PLANES],
            width,
            height,
            pixel_format,
        };
        frame.planes[0] = plane;
        frame.strides[0] = stride;
        frame
    }

    /// The first plane's pixel data.
    pub fn primary_plane(&self) -> &[u8] {
        &self.planes[0]
    }
}

impl fmt::Debug for ImageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageFrame")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_format", &self.pixel_format)
            .finish()
    }
}

/// Frame description handed to the user callback alongside each image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImageMetadata {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel layout.
    pub pixel_format: PixelFormat,
    /// Row stride in bytes per plane.
    pub strides: [u32; MAX_PLANES],
}

impl ImageMetadata {
    /// Describe `frame`.
    pub fn of(frame: &ImageFrame) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            pixel_format: frame.pixel_format,
            strides: frame.strides,
        }
    }
}

/// A byte buffer loaned from a [`FramePool`].
///
/// Dropping the buffer returns its storage to the pool (if the pool is
/// still alive), so a pipeline recycles a small set of large frame
/// buffers instead of allocating per frame.
pub struct PoolBuffer {
    data: Vec<u8>,
    pool: Weak<PoolShared>,
}

impl PoolBuffer {
    /// A buffer that is not connected to any pool.
    pub fn detached(data: Vec<u8>) -> Self {
        Self {
            data,
            pool: Weak::new(),
        }
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::ops::Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.free.borrow_mut().push(std::mem::take(&mut self.data));
        }
    }
}

struct PoolShared {
    free: RefCell<Vec<Vec<u8>>>,
}

/// Per-pipeline pool of reusable frame buffers.
///
/// `acquire` hands out a zeroed buffer of the requested size, reusing a
/// returned buffer when one with sufficient capacity is available.
#[derive(Clone)]
pub struct FramePool {
    shared: Rc<PoolShared>,
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            shared: Rc::new(PoolShared {
                free: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Acquire a buffer of exactly `len` bytes, zero-filled.
    pub fn acquire(&self, len: usize) -> PoolBuffer {
        let mut free = self.shared.free.borrow_mut();
        let reused = free.iter().position(|buf| buf.capacity() >= len);
        let mut data = match reused {
            Some(index) => free.swap_remove(index),
            None => Vec::with_capacity(len),
        };
        data.clear();
        data.resize(len, 0);
        PoolBuffer {
            data,
            pool: Rc::downgrade(&self.shared),
        }
    }

    /// Acquire a buffer and fill it from `contents`.
    pub fn acquire_from(&self, contents: &[u8]) -> PoolBuffer {
        let mut buffer = self.acquire(contents.len());
        buffer.data.copy_from_slice(contents);
        buffer
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.shared.free.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_id_chaining() {
        let first = FrameId::new(0, 48);
        let second = first.next(28927);
        assert_eq!(second, FrameId::new(49, 28975));
        assert!(first.precedes(second));
        assert!(!second.precedes(first));
    }

    #[test]
    fn test_frame_id_display() {
        assert_eq!(FrameId::new(3, 9).to_string(), "(3, 9)");
    }

    #[test]
    fn test_pixel_format_geometry() {
        assert_eq!(PixelFormat::Bgr24.bytes_per_pixel(), Some(3));
        assert_eq!(PixelFormat::Rgb0.bytes_per_pixel(), Some(4));
        assert_eq!(PixelFormat::Yuv420p.bytes_per_pixel(), None);
        assert_eq!(PixelFormat::Yuv420p.plane_count(), 3);
        assert_eq!(PixelFormat::Bgr24.plane_count(), 1);
    }

    #[test]
    fn test_pool_recycles_buffers() {
        let pool = FramePool::new();
        let buffer = pool.acquire(64);
        assert_eq!(buffer.len(), 64);
        assert_eq!(pool.idle(), 0);

        drop(buffer);
        assert_eq!(pool.idle(), 1);

        // The recycled storage backs the next acquisition.
        let again = pool.acquire(32);
        assert_eq!(pool.idle(), 0);
        assert_eq!(again.len(), 32);
    }

    #[test]
    fn test_detached_buffer_skips_pool() {
        let pool = FramePool::new();
        let buffer = PoolBuffer::detached(vec![1, 2, 3]);
        drop(buffer);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_pool_shared_across_clones() {
        let pool = FramePool::new();
        let clone = pool.clone();
        drop(clone.acquire(16));
        assert_eq!(pool.idle(), 1);
    }
}
