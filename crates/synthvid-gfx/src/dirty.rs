//! Tile-granular dirty tracking for the framebuffer.
//!
//! The screen is split into 64x64 tiles, one bit each. Image updates are built by walking the
//! tile rows top to bottom and merging horizontal runs of dirty tiles; runs are never merged
//! across rows, so every rectangle is at most one tile tall.

use synthvid_protocol::Rect;

pub const TILE_SIZE: u32 = 64;

#[derive(Debug, Clone)]
pub struct DirtyTracker {
    width: u32,
    height: u32,
    tiles_x: u32,
    tiles_y: u32,
    /// `None` if the bitmap could not be allocated. The tracker then reports the whole screen as
    /// dirty forever instead of losing updates.
    bitmap: Option<Vec<u8>>,
    full_screen: bool,
}

impl DirtyTracker {
    /// Creates a tracker for a `width` x `height` screen with everything marked dirty.
    pub fn new(width: u32, height: u32) -> Self {
        let tiles_x = width.div_ceil(TILE_SIZE);
        let tiles_y = height.div_ceil(TILE_SIZE);
        let tile_count = u64::from(tiles_x) * u64::from(tiles_y);

        let bitmap = usize::try_from(tile_count.div_ceil(8)).ok().and_then(|len| {
            let mut bitmap = Vec::new();
            bitmap.try_reserve_exact(len).ok()?;
            bitmap.resize(len, 0);
            Some(bitmap)
        });
        if bitmap.is_none() {
            tracing::warn!(
                width,
                height,
                "failed to allocate dirty tile bitmap; every refresh will send the full screen"
            );
        }

        let mut tracker = Self {
            width,
            height,
            tiles_x,
            tiles_y,
            bitmap,
            full_screen: false,
        };
        tracker.mark_full_screen();
        tracker
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn tiles(&self) -> (u32, u32) {
        (self.tiles_x, self.tiles_y)
    }

    /// Marks every tile touched by the pixel rectangle. Parts outside the screen are ignored.
    pub fn mark_region(&mut self, x: u32, y: u32, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let Some(bitmap) = self.bitmap.as_mut() else {
            self.full_screen = true;
            return;
        };

        if x >= self.width || y >= self.height {
            return;
        }
        let first_x = x / TILE_SIZE;
        let first_y = y / TILE_SIZE;
        let last_x = (x.saturating_add(width - 1) / TILE_SIZE).min(self.tiles_x - 1);
        let last_y = (y.saturating_add(height - 1) / TILE_SIZE).min(self.tiles_y - 1);

        for ty in first_y..=last_y {
            for tx in first_x..=last_x {
                let bit = tile_index(self.tiles_x, tx, ty);
                bitmap[bit / 8] |= 1 << (bit % 8);
            }
        }
    }

    pub fn mark_full_screen(&mut self) {
        self.full_screen = true;
        if let Some(bitmap) = self.bitmap.as_mut() {
            bitmap.fill(0xFF);
        }
    }

    pub fn is_dirty(&self) -> bool {
        match &self.bitmap {
            _ if self.full_screen => true,
            None => true,
            Some(bitmap) => bitmap.iter().any(|&b| b != 0),
        }
    }

    pub fn is_full_screen(&self) -> bool {
        self.full_screen || self.bitmap.is_none()
    }

    pub fn clear(&mut self) {
        self.full_screen = false;
        if let Some(bitmap) = self.bitmap.as_mut() {
            bitmap.fill(0);
        }
    }

    pub fn full_screen_rect(&self) -> Rect {
        Rect {
            x1: 0,
            y1: 0,
            x2: clamp_i32(self.width),
            y2: clamp_i32(self.height),
        }
    }

    /// Returns at most `max` rectangles covering the dirty tiles, clipped to the screen.
    ///
    /// Does not clear anything; the caller does that once the update was delivered.
    pub fn build_rectangles(&self, max: usize) -> Vec<Rect> {
        if max == 0 {
            return Vec::new();
        }
        let bitmap = match &self.bitmap {
            Some(bitmap) if !self.full_screen => bitmap,
            _ => return vec![self.full_screen_rect()],
        };

        let is_set = |tx: u32, ty: u32| {
            let bit = tile_index(self.tiles_x, tx, ty);
            bitmap[bit / 8] & (1 << (bit % 8)) != 0
        };

        let mut rects = Vec::new();
        'rows: for ty in 0..self.tiles_y {
            let mut tx = 0;
            while tx < self.tiles_x {
                if !is_set(tx, ty) {
                    tx += 1;
                    continue;
                }
                let start = tx;
                while tx < self.tiles_x && is_set(tx, ty) {
                    tx += 1;
                }

                rects.push(self.tile_run_rect(start, tx, ty));
                if rects.len() == max {
                    break 'rows;
                }
            }
        }

        if rects.is_empty() {
            rects.push(self.full_screen_rect());
        }
        rects
    }

    /// Pixel rectangle for tiles `[start, end)` in tile row `ty`.
    fn tile_run_rect(&self, start: u32, end: u32, ty: u32) -> Rect {
        let x1 = u64::from(start) * u64::from(TILE_SIZE);
        let x2 = (u64::from(end) * u64::from(TILE_SIZE)).min(u64::from(self.width));
        let y1 = u64::from(ty) * u64::from(TILE_SIZE);
        let y2 = (u64::from(ty + 1) * u64::from(TILE_SIZE)).min(u64::from(self.height));
        Rect {
            x1: clamp_i32_u64(x1),
            y1: clamp_i32_u64(y1),
            x2: clamp_i32_u64(x2),
            y2: clamp_i32_u64(y2),
        }
    }
}

fn tile_index(tiles_x: u32, tx: u32, ty: u32) -> usize {
    (ty as usize) * (tiles_x as usize) + tx as usize
}

fn clamp_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

fn clamp_i32_u64(v: u64) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}
