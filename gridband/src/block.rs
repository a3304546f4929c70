use std::cmp;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytemuck::{cast_slice, cast_slice_mut};
use paste::paste;

use crate::{
    backend::{StorageBackend, VarId},
    cache::{Cache, ChunkBuf, ChunkKey},
    errors::{Error, Result},
    geom::{BlockLayout, Hyperslab},
    pixel::{Element, NoData, PixelType, ValidRange},
};

/// A caller-supplied block buffer green-lighted for exactly one pixel type.
pub enum BlockBuffer<'a> {
    I8(&'a mut [i8]),
    U8(&'a mut [u8]),
    I16(&'a mut [i16]),
    U16(&'a mut [u16]),
    I32(&'a mut [i32]),
    U32(&'a mut [u32]),
    I64(&'a mut [i64]),
    U64(&'a mut [u64]),
    F32(&'a mut [f32]),
    F64(&'a mut [f64]),
    CI16(&'a mut [[i16; 2]]),
    CI32(&'a mut [[i32; 2]]),
    CF32(&'a mut [[f32; 2]]),
    CF64(&'a mut [[f64; 2]]),
}

macro_rules! buffer_variants {
    ($(($variant:ident, $t:ty)),* $(,)?) => {
        paste! {
            impl<'a> BlockBuffer<'a> {
                $(
                    pub fn [<new_ $variant:lower>](data: &'a mut [$t]) -> Self {
                        Self::$variant(data)
                    }
                )*

                pub fn pixel_type(&self) -> PixelType {
                    match self {
                        $(Self::$variant(_) => PixelType::$variant,)*
                    }
                }

                pub fn len(&self) -> usize {
                    match self {
                        $(Self::$variant(data) => data.len(),)*
                    }
                }

                pub fn is_empty(&self) -> bool {
                    self.len() == 0
                }
            }
        }
    };
}

buffer_variants!(
    (I8, i8),
    (U8, u8),
    (I16, i16),
    (U16, u16),
    (I32, i32),
    (U32, u32),
    (I64, i64),
    (U64, u64),
    (F32, f32),
    (F64, f64),
    (CI16, [i16; 2]),
    (CI32, [i32; 2]),
    (CF32, [f32; 2]),
    (CF64, [f64; 2]),
);

/// Dispatch a `BlockBuffer` to a generic body with the typed slice bound to
/// `$data`.
macro_rules! with_element {
    ($buffer:expr, |$data:ident| $body:expr) => {
        match $buffer {
            $crate::block::BlockBuffer::I8($data) => $body,
            $crate::block::BlockBuffer::U8($data) => $body,
            $crate::block::BlockBuffer::I16($data) => $body,
            $crate::block::BlockBuffer::U16($data) => $body,
            $crate::block::BlockBuffer::I32($data) => $body,
            $crate::block::BlockBuffer::U32($data) => $body,
            $crate::block::BlockBuffer::I64($data) => $body,
            $crate::block::BlockBuffer::U64($data) => $body,
            $crate::block::BlockBuffer::F32($data) => $body,
            $crate::block::BlockBuffer::F64($data) => $body,
            $crate::block::BlockBuffer::CI16($data) => $body,
            $crate::block::BlockBuffer::CI32($data) => $body,
            $crate::block::BlockBuffer::CF32($data) => $body,
            $crate::block::BlockBuffer::CF64($data) => $body,
        }
    };
}
pub(crate) use with_element;

/// Re-expand densely packed rows into a fixed-stride destination.
///
/// The backend returns a partial block's elements packed contiguously per
/// row at the partial width; block buffers are strided at the nominal
/// width. Rows are independent and processed in source order.
pub(crate) fn scatter_rows(
    src: &[u8],
    dst: &mut [u8],
    src_row_bytes: usize,
    rows: usize,
    dst_row_bytes: usize,
) {
    for row in 0..rows {
        let src_start = row * src_row_bytes;
        let dst_start = row * dst_row_bytes;
        dst[dst_start..dst_start + src_row_bytes]
            .copy_from_slice(&src[src_start..src_start + src_row_bytes]);
    }
}

/// The inverse transform: collapse strided rows into a dense buffer for a
/// partial-extent write.
pub(crate) fn gather_rows(
    src: &[u8],
    dst: &mut [u8],
    dst_row_bytes: usize,
    rows: usize,
    src_row_bytes: usize,
) {
    for row in 0..rows {
        let src_start = row * src_row_bytes;
        let dst_start = row * dst_row_bytes;
        dst[dst_start..dst_start + dst_row_bytes]
            .copy_from_slice(&src[src_start..src_start + dst_row_bytes]);
    }
}

/// Per-request value sanitization, applied only over the actual extent.
///
/// Elements equal to the no-data sentinel are never altered by any rule.
pub(crate) struct Sanitizer<N> {
    no_data: Option<N>,
    no_data_is_nan: bool,
    check_nan: bool,
    lower: Option<f64>,
    upper: Option<f64>,
}

impl<N: Element> Sanitizer<N> {
    pub fn new(no_data: NoData, valid_range: Option<ValidRange>, check_nan: bool) -> Self {
        let sentinel = N::from_no_data(no_data);
        let sentinel_f64 = no_data.as_f64();
        let no_data_is_nan = sentinel_f64.map_or(false, f64::is_nan);

        // A range bound equal to the no-data value means unbounded on that
        // side.
        let lower = valid_range
            .map(|r| r.min)
            .filter(|min| Some(*min) != sentinel_f64);
        let upper = valid_range
            .map(|r| r.max)
            .filter(|max| Some(*max) != sentinel_f64);

        Self {
            no_data: sentinel,
            no_data_is_nan,
            check_nan: check_nan && sentinel.is_some(),
            lower,
            upper,
        }
    }

    fn is_no_data(&self, element: N) -> bool {
        match self.no_data {
            Some(sentinel) => {
                element == sentinel || (self.no_data_is_nan && element.is_nan_value())
            }
            None => false,
        }
    }

    /// NaN normalization and valid-range clamping over the actual extent.
    pub fn apply(&self, data: &mut [N], xsize: usize, ysize: usize, stride: usize) {
        let sentinel = match self.no_data {
            Some(sentinel) => sentinel,
            None => return,
        };
        if !self.check_nan && self.lower.is_none() && self.upper.is_none() {
            return;
        }

        for row in 0..ysize {
            for col in 0..xsize {
                let index = row * stride + col;
                let element = data[index];
                if self.is_no_data(element) {
                    continue;
                }
                if self.check_nan && element.is_nan_value() {
                    data[index] = sentinel;
                    continue;
                }
                if let Some(value) = element.to_f64() {
                    let below = self.lower.map_or(false, |min| value < min);
                    let above = self.upper.map_or(false, |max| value > max);
                    if below || above {
                        data[index] = sentinel;
                    }
                }
            }
        }
    }

    /// Longitude unwrap, run at most once per band.
    ///
    /// Inspects the endpoints of the first row; longitude is assumed
    /// monotonic along a row. If either endpoint is no-data the flag is
    /// left set for a later block; otherwise the flag is cleared and, when
    /// both endpoints sit past 180 degrees, the whole block is shifted by
    /// -360.
    pub fn unwrap_longitude(&self, data: &mut [N], xsize: usize, ysize: usize, stride: usize, flag: &AtomicBool) {
        if !flag.load(Ordering::Relaxed) {
            return;
        }
        let first = data[0];
        let last = data[xsize - 1];
        if self.is_no_data(first) || self.is_no_data(last) {
            return;
        }

        flag.store(false, Ordering::Relaxed);

        let shift = match (first.to_f64(), last.to_f64()) {
            (Some(a), Some(b)) => a.min(b) > 180.0,
            _ => false,
        };
        if !shift {
            return;
        }

        for row in 0..ysize {
            for col in 0..xsize {
                let index = row * stride + col;
                if !self.is_no_data(data[index]) {
                    data[index] = data[index].unwrap_lon();
                }
            }
        }
    }
}

/// Services one rectangular block request for one band.
///
/// Borrowed together from the band and dataset for the duration of a single
/// request, with the storage lock already held by the caller.
pub(crate) struct BlockEngine<'a> {
    pub var: VarId,
    pub rank: usize,
    pub x_pos: usize,
    pub y_pos: Option<usize>,

    /// Fixed (dimension position, offset) pairs selecting this band's 2-D
    /// slice.
    pub band_offsets: &'a [(usize, usize)],

    pub layout: BlockLayout,
    pub bottom_up: bool,

    /// 1-based band index, for chunk cache keys.
    pub band: usize,
}

impl BlockEngine<'_> {
    /// The storage hyperslab for one block, in native dimension order.
    fn hyperslab(&self, col: usize, row: usize, xsize: usize, ysize: usize) -> Hyperslab {
        let mut slab = Hyperslab::point(self.rank);
        for &(pos, offset) in self.band_offsets {
            slab.select(pos, offset, 1);
        }
        slab.select(self.x_pos, col * self.layout.block_width, xsize);
        if let Some(y_pos) = self.y_pos {
            if self.bottom_up {
                // Only reachable with block height 1: a single logical row
                // maps to one reflected storage row.
                slab.select(y_pos, self.layout.raster_height - 1 - row, 1);
            } else {
                slab.select(y_pos, row * self.layout.block_height, ysize);
            }
        }
        slab
    }

    pub fn read<N: Element>(
        &self,
        backend: &dyn StorageBackend,
        cache: Option<&Cache<ChunkKey, ChunkBuf>>,
        sanitizer: &Sanitizer<N>,
        lon_wrap: Option<&AtomicBool>,
        col: usize,
        row: usize,
        dst: &mut [N],
    ) -> Result<()> {
        let xsize = self.layout.actual_width(col);
        let ysize = self.layout.actual_height(row);
        let row_bytes = xsize * mem::size_of::<N>();
        let stride_bytes = self.layout.block_width * mem::size_of::<N>();

        if self.bottom_up && self.y_pos.is_some() && self.layout.block_height > 1 {
            self.read_bottom_up::<N>(backend, cache, col, row, dst, xsize, ysize)?;
        } else {
            let slab = self.hyperslab(col, row, xsize, ysize);
            let mut dense = vec![0u8; slab.elements() * mem::size_of::<N>()];
            backend.read_hyperslab(self.var, &slab.start, &slab.count, &mut dense)?;
            scatter_rows(&dense, cast_slice_mut(dst), row_bytes, ysize, stride_bytes);
        }

        sanitizer.apply(dst, xsize, ysize, self.layout.block_width);
        if let Some(flag) = lon_wrap {
            sanitizer.unwrap_longitude(dst, xsize, ysize, self.layout.block_width, flag);
        }

        Ok(())
    }

    /// Multi-row blocks of a bottom-up raster: assemble logical rows from
    /// the one or two storage chunks the reflected range touches.
    fn read_bottom_up<N: Element>(
        &self,
        backend: &dyn StorageBackend,
        cache: Option<&Cache<ChunkKey, ChunkBuf>>,
        col: usize,
        row: usize,
        dst: &mut [N],
        xsize: usize,
        ysize: usize,
    ) -> Result<()> {
        let height = self.layout.raster_height;
        let block_height = self.layout.block_height;
        let element_size = mem::size_of::<N>();

        let y_first = row * block_height;
        let y_last = y_first + ysize; // exclusive
        let chunk_lo = (height - y_last) / block_height;
        let chunk_hi = (height - 1 - y_first) / block_height;

        // Highest chunk first: that is the order the logical rows consume
        // them in, and it keeps a straddled chunk warm for the next block
        // when the cache is at its minimum capacity.
        let mut chunks: Vec<(usize, Arc<ChunkBuf>)> = Vec::with_capacity(2);
        for chunk_row in (chunk_lo..=chunk_hi).rev() {
            let buf = match cache {
                Some(cache) => {
                    let key = ChunkKey {
                        block_col: col,
                        chunk_row,
                        band: self.band,
                    };
                    cache.get(&key, || self.fetch_chunk::<N>(backend, col, chunk_row))?
                }
                None => Arc::new(self.fetch_chunk::<N>(backend, col, chunk_row)?),
            };
            chunks.push((chunk_row, buf));
        }

        let row_bytes = xsize * element_size;
        let stride_bytes = self.layout.block_width * element_size;
        let dst_bytes: &mut [u8] = cast_slice_mut(dst);
        for y in y_first..y_last {
            let storage_y = height - 1 - y;
            let chunk_row = storage_y / block_height;
            let row_in_chunk = storage_y - chunk_row * block_height;
            let chunk = &chunks
                .iter()
                .find(|(c, _)| *c == chunk_row)
                .expect("chunk fetched above")
                .1;

            let src_start = row_in_chunk * stride_bytes;
            let dst_start = (y - y_first) * stride_bytes;
            dst_bytes[dst_start..dst_start + row_bytes]
                .copy_from_slice(&chunk.0[src_start..src_start + row_bytes]);
        }

        Ok(())
    }

    /// Direct (uncached) fetch of one whole storage chunk, repaired to the
    /// nominal block stride.
    fn fetch_chunk<N: Element>(
        &self,
        backend: &dyn StorageBackend,
        col: usize,
        chunk_row: usize,
    ) -> Result<ChunkBuf> {
        let block_width = self.layout.block_width;
        let block_height = self.layout.block_height;
        let element_size = mem::size_of::<N>();
        let xsize = self.layout.actual_width(col);
        let storage_y = chunk_row * block_height;
        let rows = cmp::min(block_height, self.layout.raster_height - storage_y);

        let mut slab = Hyperslab::point(self.rank);
        for &(pos, offset) in self.band_offsets {
            slab.select(pos, offset, 1);
        }
        slab.select(self.x_pos, col * block_width, xsize);
        slab.select(self.y_pos.expect("bottom-up requires a Y dimension"), storage_y, rows);

        let mut dense = vec![0u8; xsize * rows * element_size];
        backend.read_hyperslab(self.var, &slab.start, &slab.count, &mut dense)?;

        let mut chunk = vec![0u8; block_width * block_height * element_size];
        scatter_rows(
            &dense,
            &mut chunk,
            xsize * element_size,
            rows,
            block_width * element_size,
        );

        Ok(ChunkBuf(chunk))
    }

    pub fn write<N: Element>(
        &self,
        backend: &mut dyn StorageBackend,
        col: usize,
        row: usize,
        src: &[N],
    ) -> Result<()> {
        if self.bottom_up && self.y_pos.is_some() && self.layout.block_height > 1 {
            return Err(Error::Unsupported(
                "writing multi-row blocks to a bottom-up raster is ambiguous".into(),
            ));
        }

        let xsize = self.layout.actual_width(col);
        let ysize = self.layout.actual_height(row);
        let element_size = mem::size_of::<N>();
        let slab = self.hyperslab(col, row, xsize, ysize);

        let src_bytes: &[u8] = cast_slice(src);
        if xsize == self.layout.block_width {
            // Strided and dense layouts coincide; write the prefix directly.
            let len = xsize * ysize * element_size;
            backend.write_hyperslab(self.var, &slab.start, &slab.count, &src_bytes[..len])
        } else {
            let mut dense = vec![0u8; xsize * ysize * element_size];
            gather_rows(
                src_bytes,
                &mut dense,
                xsize * element_size,
                ysize,
                self.layout.block_width * element_size,
            );
            backend.write_hyperslab(self.var, &slab.start, &slab.count, &dense)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scatter_positions_partial_rows_at_stride() {
        // 3 rows of 2 valid columns into a stride of 4
        let src = [1u8, 2, 3, 4, 5, 6];
        let mut dst = [0u8; 12];
        scatter_rows(&src, &mut dst, 2, 3, 4);
        assert_eq!(dst, [1, 2, 0, 0, 3, 4, 0, 0, 5, 6, 0, 0]);
    }

    #[test]
    fn gather_is_the_inverse_of_scatter() {
        let dense = [1u8, 2, 3, 4, 5, 6];
        let mut strided = [0u8; 12];
        scatter_rows(&dense, &mut strided, 2, 3, 4);
        let mut back = [0u8; 6];
        gather_rows(&strided, &mut back, 2, 3, 4);
        assert_eq!(back, dense);
    }

    #[test]
    fn no_data_is_never_modified() {
        let sanitizer: Sanitizer<f32> = Sanitizer::new(
            NoData::F64(-999.0),
            Some(ValidRange { min: 0.0, max: 1.0 }),
            true,
        );
        let mut data = [-999.0f32, 0.5, 7.0, f32::NAN];
        sanitizer.apply(&mut data, 4, 1, 4);
        assert_eq!(data, [-999.0, 0.5, -999.0, -999.0]);
    }

    #[test]
    fn range_bound_equal_to_no_data_is_unbounded() {
        let sanitizer: Sanitizer<f32> = Sanitizer::new(
            NoData::F64(0.0),
            Some(ValidRange { min: 0.0, max: 10.0 }),
            true,
        );
        // Lower bound equals the sentinel, so only the upper bound clamps.
        let mut data = [-5.0f32, 5.0, 15.0];
        sanitizer.apply(&mut data, 3, 1, 3);
        assert_eq!(data, [-5.0, 5.0, 0.0]);
    }

    #[test]
    fn nan_sentinel_matches_nan_elements() {
        let sanitizer: Sanitizer<f64> = Sanitizer::new(
            NoData::F64(f64::NAN),
            Some(ValidRange {
                min: 0.0,
                max: 100.0,
            }),
            true,
        );
        let mut data = [f64::NAN, 50.0, 200.0];
        sanitizer.apply(&mut data, 3, 1, 3);
        assert!(data[0].is_nan());
        assert_eq!(data[1], 50.0);
        assert!(data[2].is_nan());
    }

    #[test]
    fn without_no_data_nothing_is_rewritten() {
        let sanitizer: Sanitizer<f32> =
            Sanitizer::new(NoData::None, Some(ValidRange { min: 0.0, max: 1.0 }), true);
        let mut data = [7.0f32, f32::NAN];
        sanitizer.apply(&mut data, 2, 1, 2);
        assert_eq!(data[0], 7.0);
        assert!(data[1].is_nan());
    }

    #[test]
    fn unwrap_shifts_once_and_clears_the_flag() {
        let sanitizer: Sanitizer<f64> = Sanitizer::new(NoData::F64(-999.0), None, true);
        let flag = AtomicBool::new(true);

        let mut data = [200.0f64, -999.0, 210.0, 220.0];
        sanitizer.unwrap_longitude(&mut data, 4, 1, 4, &flag);
        assert_eq!(data, [-160.0, -999.0, -150.0, -140.0]);
        assert!(!flag.load(Ordering::Relaxed));

        // The flag is spent; a qualifying block is no longer shifted.
        let mut data = [200.0f64, 210.0, 220.0, 230.0];
        sanitizer.unwrap_longitude(&mut data, 4, 1, 4, &flag);
        assert_eq!(data, [200.0, 210.0, 220.0, 230.0]);
    }

    #[test]
    fn unwrap_defers_while_endpoints_are_no_data() {
        let sanitizer: Sanitizer<f64> = Sanitizer::new(NoData::F64(-999.0), None, true);
        let flag = AtomicBool::new(true);

        // Endpoint is no-data: neither shift nor clear.
        let mut data = [200.0f64, 210.0, -999.0];
        sanitizer.unwrap_longitude(&mut data, 3, 1, 3, &flag);
        assert_eq!(data, [200.0, 210.0, -999.0]);
        assert!(flag.load(Ordering::Relaxed));

        // In-range endpoints clear the flag without shifting.
        let mut data = [10.0f64, 20.0, 30.0];
        sanitizer.unwrap_longitude(&mut data, 3, 1, 3, &flag);
        assert_eq!(data, [10.0, 20.0, 30.0]);
        assert!(!flag.load(Ordering::Relaxed));
    }

    #[test]
    fn integer_unwrap_uses_integer_shift() {
        let sanitizer: Sanitizer<i16> = Sanitizer::new(NoData::F64(-1.0), None, false);
        let flag = AtomicBool::new(true);
        let mut data = [200i16, 340, -1];
        sanitizer.unwrap_longitude(&mut data, 3, 1, 3, &flag);
        // -1 is the sentinel and passes through untouched... except it was
        // an endpoint, so the check defers.
        assert_eq!(data, [200, 340, -1]);
        assert!(flag.load(Ordering::Relaxed));

        let mut data = [200i16, 250, 340];
        sanitizer.unwrap_longitude(&mut data, 3, 1, 3, &flag);
        assert_eq!(data, [-160, -110, -20]);
    }
}
