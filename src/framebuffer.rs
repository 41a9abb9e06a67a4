//! Shared pixel buffer fed by the RFB client and read by a renderer.
//!
//! Dimensions and pixels live behind one lock, so a reader never sees a
//! half-applied resize. Pixels are stored as RGBA, 4 bytes per pixel, rows
//! top to bottom.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub const BYTES_PER_PIXEL: usize = 4;

const OPAQUE_BLACK: [u8; 4] = [0, 0, 0, 0xFF];

struct Inner {
    width: u16,
    height: u16,
    pixels: Vec<u8>,
}

/// Thread-safe framebuffer handle. Clones share the same pixels.
#[derive(Clone)]
pub struct Framebuffer {
    inner: Arc<Mutex<Inner>>,
    generation: Arc<AtomicU64>,
}

impl Default for Framebuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (width, height) = self.size();
        f.debug_struct("Framebuffer")
            .field("width", &width)
            .field("height", &height)
            .field("generation", &self.generation())
            .finish()
    }
}

impl Framebuffer {
    /// Create an empty 0x0 framebuffer.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                width: 0,
                height: 0,
                pixels: Vec::new(),
            })),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current `(width, height)`.
    pub fn size(&self) -> (u16, u16) {
        let inner = self.inner.lock();
        (inner.width, inner.height)
    }

    /// Bumped on every resize and blit. Pollers compare it to skip redundant redraws.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Replace the buffer with one of the new size.
    ///
    /// The overlapping region of the old content is copied to the origin of the
    /// new buffer; everything else starts opaque black.
    pub fn resize(&self, width: u16, height: u16) {
        let (w, h) = (width as usize, height as usize);
        let mut pixels = OPAQUE_BLACK.repeat(w * h);

        let mut inner = self.inner.lock();
        let copy_w = w.min(inner.width as usize);
        let copy_h = h.min(inner.height as usize);
        let old_stride = inner.width as usize * BYTES_PER_PIXEL;
        let new_stride = w * BYTES_PER_PIXEL;
        for row in 0..copy_h {
            let src = row * old_stride;
            let dst = row * new_stride;
            let len = copy_w * BYTES_PER_PIXEL;
            pixels[dst..dst + len].copy_from_slice(&inner.pixels[src..src + len]);
        }

        inner.width = width;
        inner.height = height;
        inner.pixels = pixels;
        drop(inner);

        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Copy a rectangle of raw client-format pixels into the buffer.
    ///
    /// `data` holds `width * height` pixels, 4 bytes each, little-endian with
    /// red in the low byte (the format the client declares to the server).
    /// Parts of the rectangle outside the framebuffer are dropped.
    pub fn blit_raw(&self, x: u16, y: u16, width: u16, height: u16, data: &[u8]) {
        let (x, y, w, h) = (x as usize, y as usize, width as usize, height as usize);
        let src_stride = w * BYTES_PER_PIXEL;
        if data.len() < src_stride * h {
            tracing::warn!(
                expected = src_stride * h,
                actual = data.len(),
                "short rectangle data, ignoring"
            );
            return;
        }

        let mut inner = self.inner.lock();
        let fb_w = inner.width as usize;
        let fb_h = inner.height as usize;
        if x >= fb_w || y >= fb_h {
            return;
        }
        let copy_w = w.min(fb_w - x);
        let copy_h = h.min(fb_h - y);
        let dst_stride = fb_w * BYTES_PER_PIXEL;

        for row in 0..copy_h {
            let src_row = &data[row * src_stride..row * src_stride + copy_w * BYTES_PER_PIXEL];
            let dst_start = (y + row) * dst_stride + x * BYTES_PER_PIXEL;
            let dst_row = &mut inner.pixels[dst_start..dst_start + copy_w * BYTES_PER_PIXEL];
            for (dst, src) in dst_row
                .chunks_exact_mut(BYTES_PER_PIXEL)
                .zip(src_row.chunks_exact(BYTES_PER_PIXEL))
            {
                dst[0] = src[0];
                dst[1] = src[1];
                dst[2] = src[2];
                dst[3] = 0xFF;
            }
        }
        drop(inner);

        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Run `f` against the live pixels while holding the lock.
    ///
    /// Keeps the RFB client from mutating the buffer mid-render without copying it.
    pub fn with_pixels<R>(&self, f: impl FnOnce(u16, u16, &[u8]) -> R) -> R {
        let inner = self.inner.lock();
        f(inner.width, inner.height, &inner.pixels)
    }

    /// Copy out a consistent frame.
    pub fn snapshot(&self) -> Frame {
        self.with_pixels(|width, height, pixels| Frame {
            width,
            height,
            pixels: pixels.to_vec(),
        })
    }
}

/// An owned copy of the framebuffer at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u16,
    pub height: u16,
    /// RGBA, row-major.
    pub pixels: Vec<u8>,
}

impl Frame {
    /// RGBA value at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u16, y: u16) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        let p = &self.pixels[i..i + BYTES_PER_PIXEL];
        Some([p[0], p[1], p[2], p[3]])
    }

    /// Encode as a binary PPM (P6) image, dropping alpha.
    pub fn to_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.reserve(self.width as usize * self.height as usize * 3);
        for px in self.pixels.chunks_exact(BYTES_PER_PIXEL) {
            out.extend_from_slice(&px[..3]);
        }
        out
    }

    pub fn write_ppm(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(&self.to_ppm())?;
        file.flush()
    }
}
