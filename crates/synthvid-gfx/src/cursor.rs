//! Hardware cursor state: the last shape packet and the last position sent to the host.

use synthvid_protocol::{
    encode_cursor_shape_in_place, CursorPosition, CursorShapeHeader, CURSOR_ARGB_PIXEL_SIZE,
    CURSOR_MAX_HEIGHT, CURSOR_MAX_SIZE, CURSOR_MAX_WIDTH, CURSOR_PART_COMPLETE,
    CURSOR_SHAPE_DATA_OFFSET, MAX_CURSOR_SHAPE_PACKET_LEN,
};

use crate::error::{GfxError, Result};

/// Pixel bytes of the 1x1 shape sent to hide the cursor.
pub const NO_CURSOR_PIXEL: [u8; 4] = [0, 1, 1, 1];

/// A 32-bit ARGB cursor image with top-down rows and no row padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorImage {
    pub width: u32,
    pub height: u32,
    pub hot_x: u32,
    pub hot_y: u32,
    pub pixels: Vec<u8>,
}

impl CursorImage {
    pub fn new(width: u32, height: u32, hot_x: u32, hot_y: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            hot_x,
            hot_y,
            pixels,
        }
    }

    fn byte_len(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(CURSOR_ARGB_PIXEL_SIZE)
    }

    fn validate(&self) -> Result<usize> {
        if self.width > CURSOR_MAX_WIDTH || self.height > CURSOR_MAX_HEIGHT {
            return Err(GfxError::Unsupported(format!(
                "cursor {}x{} exceeds {CURSOR_MAX_WIDTH}x{CURSOR_MAX_HEIGHT}",
                self.width, self.height
            )));
        }
        if self.hot_x > self.width || self.hot_y > self.height {
            return Err(GfxError::Unsupported(format!(
                "cursor hotspot ({}, {}) outside {}x{}",
                self.hot_x, self.hot_y, self.width, self.height
            )));
        }
        let len = self.byte_len();
        if len > CURSOR_MAX_SIZE as u64 {
            return Err(GfxError::Unsupported(format!(
                "cursor data of {len} bytes exceeds {CURSOR_MAX_SIZE}"
            )));
        }
        // Bounded by CURSOR_MAX_SIZE above.
        let len = len as usize;
        if self.pixels.len() < len {
            return Err(GfxError::BadArgument(format!(
                "cursor pixel buffer holds {} bytes, need {len}",
                self.pixels.len()
            )));
        }
        Ok(len)
    }
}

#[derive(Debug, Clone)]
pub struct CursorState {
    /// Outgoing shape packet. Sized for the largest cursor once and never reallocated.
    shape_packet: Vec<u8>,
    /// Length of the last shape written into `shape_packet`; zero if none yet.
    shape_len: usize,
    position: CursorPosition,
}

impl Default for CursorState {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorState {
    pub fn new() -> Self {
        Self {
            shape_packet: vec![0; MAX_CURSOR_SHAPE_PACKET_LEN],
            shape_len: 0,
            position: CursorPosition {
                is_visible: true,
                video_output: 0,
                x: 0,
                y: 0,
            },
        }
    }

    /// Writes a shape packet for `image` (or the hidden cursor if `None`) and returns it.
    ///
    /// Rows are stored bottom-up in the packet.
    pub fn prepare_shape(&mut self, image: Option<&CursorImage>) -> Result<&[u8]> {
        let Some(image) = image else {
            self.write_hidden_shape()?;
            return Ok(self.last_packet());
        };

        let data_len = image.validate()?;
        let header = CursorShapeHeader {
            part_index: CURSOR_PART_COMPLETE,
            is_argb: true,
            width: image.width,
            height: image.height,
            hot_x: image.hot_x,
            hot_y: image.hot_y,
        };
        let total = encode_cursor_shape_in_place(&mut self.shape_packet, &header, data_len)?;

        let stride = (image.width * CURSOR_ARGB_PIXEL_SIZE) as usize;
        if stride > 0 {
            let data = &mut self.shape_packet[CURSOR_SHAPE_DATA_OFFSET..total];
            let rows = image.pixels[..data_len].chunks_exact(stride);
            for (dst, src) in data.chunks_exact_mut(stride).rev().zip(rows) {
                dst.copy_from_slice(src);
            }
        }

        self.shape_len = total;
        Ok(self.last_packet())
    }

    /// The packet to send for a resend request.
    ///
    /// If nothing was sent yet the hidden cursor is prepared instead.
    pub fn resend_shape(&mut self) -> Result<&[u8]> {
        if self.shape_len == 0 {
            self.write_hidden_shape()?;
        }
        Ok(self.last_packet())
    }

    pub fn has_shape(&self) -> bool {
        self.shape_len != 0
    }

    pub fn record_position(&mut self, x: i32, y: i32, visible: bool) {
        self.position.x = x;
        self.position.y = y;
        self.position.is_visible = visible;
    }

    pub fn position(&self) -> CursorPosition {
        self.position
    }

    fn last_packet(&self) -> &[u8] {
        &self.shape_packet[..self.shape_len]
    }

    fn write_hidden_shape(&mut self) -> Result<()> {
        let header = CursorShapeHeader {
            part_index: CURSOR_PART_COMPLETE,
            is_argb: true,
            width: 1,
            height: 1,
            hot_x: 0,
            hot_y: 0,
        };
        let total =
            encode_cursor_shape_in_place(&mut self.shape_packet, &header, NO_CURSOR_PIXEL.len())?;
        self.shape_packet[CURSOR_SHAPE_DATA_OFFSET..total].copy_from_slice(&NO_CURSOR_PIXEL);
        self.shape_len = total;
        Ok(())
    }
}
