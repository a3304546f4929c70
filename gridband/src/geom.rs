use std::cmp;

/// The tiling of a 2-D raster into fixed-size blocks.
///
/// Block dimensions are clamped to the raster dimensions at construction so
/// a "chunk larger than the raster" reported by the backend cannot produce
/// out-of-range hyperslabs.
#[derive(Clone, Copy, Debug)]
pub struct BlockLayout {
    pub raster_width: usize,
    pub raster_height: usize,
    pub block_width: usize,
    pub block_height: usize,
}

impl BlockLayout {
    pub fn new(
        raster_width: usize,
        raster_height: usize,
        block_width: usize,
        block_height: usize,
    ) -> Self {
        let block_width = cmp::max(1, cmp::min(block_width, raster_width));
        let block_height = cmp::max(1, cmp::min(block_height, raster_height));
        Self {
            raster_width,
            raster_height,
            block_width,
            block_height,
        }
    }

    pub fn blocks_across(&self) -> usize {
        (self.raster_width + self.block_width - 1) / self.block_width
    }

    pub fn blocks_down(&self) -> usize {
        (self.raster_height + self.block_height - 1) / self.block_height
    }

    /// Number of valid columns in the block at `col`; smaller than
    /// `block_width` only for the rightmost partial block.
    pub fn actual_width(&self, col: usize) -> usize {
        cmp::min(self.block_width, self.raster_width - col * self.block_width)
    }

    /// Number of valid rows in the block at `row`.
    pub fn actual_height(&self, row: usize) -> usize {
        cmp::min(
            self.block_height,
            self.raster_height - row * self.block_height,
        )
    }

    /// Nominal element count of one full block buffer.
    pub fn block_elements(&self) -> usize {
        self.block_width * self.block_height
    }

    pub fn contains_block(&self, col: usize, row: usize) -> bool {
        col < self.blocks_across() && row < self.blocks_down()
    }
}

/// A rectangular sub-array request: per-dimension start and count vectors,
/// in the variable's native storage order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hyperslab {
    pub start: Vec<usize>,
    pub count: Vec<usize>,
}

impl Hyperslab {
    /// A slab selecting one element along every dimension. Spatial and band
    /// positions are then patched in with `select`.
    pub fn point(rank: usize) -> Self {
        Self {
            start: vec![0; rank],
            count: vec![1; rank],
        }
    }

    pub fn select(&mut self, pos: usize, start: usize, count: usize) {
        self.start[pos] = start;
        self.count[pos] = count;
    }

    /// Total number of elements selected.
    pub fn elements(&self) -> usize {
        self.count.iter().product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_counts_partial_blocks() {
        let layout = BlockLayout::new(20, 10, 8, 4);
        assert_eq!(layout.blocks_across(), 3);
        assert_eq!(layout.blocks_down(), 3);
        assert_eq!(layout.actual_width(0), 8);
        assert_eq!(layout.actual_width(2), 4);
        assert_eq!(layout.actual_height(2), 2);
        assert!(layout.contains_block(2, 2));
        assert!(!layout.contains_block(3, 0));
    }

    #[test]
    fn layout_clamps_block_to_raster() {
        let layout = BlockLayout::new(20, 10, 64, 64);
        assert_eq!(layout.block_width, 20);
        assert_eq!(layout.block_height, 10);
        assert_eq!(layout.blocks_across(), 1);
        assert_eq!(layout.blocks_down(), 1);
    }

    #[test]
    fn hyperslab_selection() {
        let mut slab = Hyperslab::point(4);
        slab.select(3, 16, 4);
        slab.select(2, 90, 10);
        slab.select(0, 1, 1);
        assert_eq!(slab.start, vec![1, 0, 90, 16]);
        assert_eq!(slab.count, vec![1, 1, 10, 4]);
        assert_eq!(slab.elements(), 40);
    }
}
