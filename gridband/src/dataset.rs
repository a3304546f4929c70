use std::sync::atomic::AtomicBool;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::{
    backend::{StorageBackend, VarId, VariableInfo},
    block::{with_element, BlockBuffer, BlockEngine, Sanitizer},
    cache::{chunk_cache_capacity, Cache, ChunkBuf, ChunkKey},
    errors::{Error, Result},
    geom::BlockLayout,
    mapper::{cf_name_role, DimRole, DimensionMap},
    pixel::{NoData, PixelType, ValidRange},
    resolver::{self, Provenance},
};

/// How to open a variable as a raster.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    /// The logical raster is row-reversed relative to storage: logical row
    /// 0 is the highest-index storage row along Y.
    pub bottom_up: bool,

    pub read_only: bool,

    /// Provenance for the 8-bit signedness default; detected from the
    /// container's history when not supplied.
    pub provenance: Option<Provenance>,

    /// Keep a declared valid range even when it looks like a scale/offset
    /// artifact on an integer variable.
    pub honor_valid_range: bool,

    /// Arm the one-shot longitude unwrap check on signed bands.
    pub longitude_wrap: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            bottom_up: false,
            read_only: true,
            provenance: None,
            honor_valid_range: false,
            longitude_wrap: false,
        }
    }
}

/// Mutable per-band metadata; everything else about a band is frozen at
/// open time.
struct BandMeta {
    no_data: NoData,
    no_data_secondary: bool,
    scale: Option<f64>,
    offset: Option<f64>,
    units: Option<String>,
}

/// One 2-D slice of the opened variable.
pub struct Band {
    index: usize,
    pixel_type: PixelType,
    valid_range: Option<ValidRange>,

    /// Fixed (dimension position, offset) pairs selecting this band's
    /// slice, one per non-spatial dimension.
    offsets: Vec<(usize, usize)>,

    /// Armed until the first block with valid first-row endpoints has been
    /// inspected.
    lon_wrap: AtomicBool,

    meta: RwLock<BandMeta>,
}

impl Band {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn valid_range(&self) -> Option<ValidRange> {
        self.valid_range
    }

    pub fn no_data(&self) -> NoData {
        self.meta.read().no_data
    }

    /// True when the no-data value came from a per-type default or a
    /// `missing_value` fallback rather than a declared `_FillValue`.
    pub fn no_data_is_secondary(&self) -> bool {
        self.meta.read().no_data_secondary
    }

    pub fn scale(&self) -> Option<f64> {
        self.meta.read().scale
    }

    pub fn offset(&self) -> Option<f64> {
        self.meta.read().offset
    }

    pub fn units(&self) -> Option<String> {
        self.meta.read().units.clone()
    }

    /// The fixed per-dimension offsets of this band, for labeling it with
    /// its non-spatial coordinate values.
    pub fn level_offsets(&self) -> &[(usize, usize)] {
        &self.offsets
    }
}

/// An N-dimensional variable opened as a set of addressable, cached,
/// type-correct 2-D blocks.
///
/// The backend is owned behind one coarse lock; every block request holds
/// it for its full duration. Block requests against different bands are
/// serialized by design.
pub struct Dataset {
    backend: Mutex<Box<dyn StorageBackend>>,
    var: VarId,
    info: VariableInfo,
    dims: DimensionMap,
    layout: BlockLayout,
    bands: Vec<Band>,
    bottom_up: bool,
    read_only: bool,
    cache: Option<Cache<ChunkKey, ChunkBuf>>,
}

impl Dataset {
    /// Open `var` with the default CF dimension-name classifier.
    pub fn open(backend: Box<dyn StorageBackend>, var: VarId, options: OpenOptions) -> Result<Self> {
        Self::open_with_classifier(backend, var, options, &cf_name_role)
    }

    /// Open `var`, classifying dimensions with a caller-supplied function.
    pub fn open_with_classifier(
        backend: Box<dyn StorageBackend>,
        var: VarId,
        options: OpenOptions,
        classify: &dyn Fn(usize, &str) -> DimRole,
    ) -> Result<Self> {
        let info = backend.variable_info(var)?;
        let dims = DimensionMap::resolve(&info, classify)?;

        let width = info.dim_sizes[dims.x_pos];
        let height = dims.y_pos.map_or(1, |y| info.dim_sizes[y]);
        let layout = Self::block_layout(backend.as_ref(), var, &info, &dims, width, height)?;

        let bottom_up = options.bottom_up && dims.y_pos.is_some();
        let provenance = options
            .provenance
            .unwrap_or_else(|| Provenance::detect(backend.as_ref()));

        let mut bands = Vec::with_capacity(dims.band_count());
        for level in 0..dims.band_count() {
            let resolution = resolver::resolve(
                backend.as_ref(),
                var,
                &info.storage_type,
                provenance,
                options.honor_valid_range,
            );
            let offsets = dims
                .extra
                .iter()
                .zip(dims.level_offsets(level))
                .map(|(dim, offset)| (dim.pos, offset))
                .collect();

            bands.push(Band {
                index: level + 1,
                pixel_type: resolution.pixel_type,
                valid_range: resolution.valid_range,
                offsets,
                lon_wrap: AtomicBool::new(
                    options.longitude_wrap && resolution.pixel_type.is_signed(),
                ),
                meta: RwLock::new(BandMeta {
                    no_data: resolution.no_data,
                    no_data_secondary: resolution.no_data_secondary,
                    scale: resolution.scale,
                    offset: resolution.offset,
                    units: resolution.units,
                }),
            });
        }

        let cache = if bottom_up && layout.block_height > 1 && options.read_only {
            let chunk_bytes = layout.block_elements() * bands[0].pixel_type.element_size();
            let capacity = chunk_cache_capacity(width, layout.block_width, chunk_bytes);
            if capacity == 0 {
                debug!("storage chunks too large to cache, using direct reads");
                None
            } else {
                Some(Cache::new(capacity * chunk_bytes as u64))
            }
        } else {
            None
        };

        Ok(Self {
            backend: Mutex::new(backend),
            var,
            info,
            dims,
            layout,
            bands,
            bottom_up,
            read_only: options.read_only,
            cache,
        })
    }

    /// Seed block geometry from the variable's native chunking; contiguous
    /// variables get full-width single-row blocks.
    fn block_layout(
        backend: &dyn StorageBackend,
        var: VarId,
        info: &VariableInfo,
        dims: &DimensionMap,
        width: usize,
        height: usize,
    ) -> Result<BlockLayout> {
        let (block_width, block_height) = match backend.inquire_chunking(var)? {
            Some(chunk_dims) if chunk_dims.len() == info.rank() => {
                let block_width = chunk_dims[dims.x_pos];
                // With X outermost the backend packs a multi-row hyperslab
                // column by column, which the row-oriented layout repair
                // cannot consume. Single-row blocks stay correct in either
                // orientation.
                let block_height = if dims.switched_xy {
                    debug!("X-major dimension order, serving single-row blocks");
                    1
                } else {
                    dims.y_pos.map_or(1, |y| chunk_dims[y])
                };
                (block_width, block_height)
            }
            Some(_) => {
                debug!("chunk geometry does not match variable rank, ignoring");
                (width, 1)
            }
            None => (width, 1),
        };
        Ok(BlockLayout::new(width, height, block_width, block_height))
    }

    pub fn variable_info(&self) -> &VariableInfo {
        &self.info
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// 1-based band lookup.
    pub fn band(&self, index: usize) -> Result<&Band> {
        if index == 0 || index > self.bands.len() {
            return Err(Error::BadBandIndex(index));
        }
        Ok(&self.bands[index - 1])
    }

    pub fn bottom_up(&self) -> bool {
        self.bottom_up
    }

    /// The detected trailing-dimension orientation, for the georeferencing
    /// collaborator. Independent of anything the caller declared.
    pub fn switched_xy(&self) -> bool {
        self.dims.switched_xy
    }

    pub fn x_pos(&self) -> usize {
        self.dims.x_pos
    }

    pub fn y_pos(&self) -> Option<usize> {
        self.dims.y_pos
    }

    pub fn dimension_advisories(&self) -> &[String] {
        &self.dims.advisories
    }

    /// Read one block of one band into `buffer`.
    ///
    /// The buffer must match the band's pixel type and hold at least one
    /// nominal block. Partial edge blocks are repaired to the nominal
    /// stride; values are sanitized over the actual extent.
    pub fn read_block(
        &self,
        band: usize,
        col: usize,
        row: usize,
        buffer: BlockBuffer<'_>,
    ) -> Result<()> {
        let band = self.band(band)?;
        self.check_request(band, col, row, &buffer)?;

        let engine = self.engine(band);
        let no_data = band.no_data();
        let check_nan = band.pixel_type.is_float();

        let backend = self.backend.lock();
        with_element!(buffer, |data| {
            let sanitizer = Sanitizer::new(no_data, band.valid_range, check_nan);
            engine.read(
                &**backend,
                self.cache.as_ref(),
                &sanitizer,
                Some(&band.lon_wrap),
                col,
                row,
                data,
            )
        })
    }

    /// Write one block of one band from `buffer`.
    ///
    /// Only the actual extent is written for partial edge blocks. Writing
    /// multi-row blocks to a bottom-up raster is a hard error.
    pub fn write_block(
        &self,
        band: usize,
        col: usize,
        row: usize,
        buffer: BlockBuffer<'_>,
    ) -> Result<()> {
        if self.read_only {
            return Err(Error::Unsupported("dataset is open read-only".into()));
        }
        let band = self.band(band)?;
        self.check_request(band, col, row, &buffer)?;

        let engine = self.engine(band);
        let mut backend = self.backend.lock();
        with_element!(buffer, |data| engine.write(&mut **backend, col, row, data))
    }

    pub fn set_no_data(&self, band: usize, no_data: NoData) -> Result<()> {
        let mut meta = self.writable_meta(band)?;
        meta.no_data = no_data;
        meta.no_data_secondary = false;
        Ok(())
    }

    pub fn set_scale(&self, band: usize, scale: Option<f64>) -> Result<()> {
        self.writable_meta(band)?.scale = scale;
        Ok(())
    }

    pub fn set_offset(&self, band: usize, offset: Option<f64>) -> Result<()> {
        self.writable_meta(band)?.offset = offset;
        Ok(())
    }

    pub fn set_units(&self, band: usize, units: Option<String>) -> Result<()> {
        self.writable_meta(band)?.units = units;
        Ok(())
    }

    fn writable_meta(&self, band: usize) -> Result<parking_lot::RwLockWriteGuard<'_, BandMeta>> {
        if self.read_only {
            return Err(Error::Unsupported("dataset is open read-only".into()));
        }
        Ok(self.band(band)?.meta.write())
    }

    fn check_request(&self, band: &Band, col: usize, row: usize, buffer: &BlockBuffer<'_>) -> Result<()> {
        if buffer.pixel_type() != band.pixel_type {
            return Err(Error::BadType(format!(
                "band {} holds {}, buffer holds {}",
                band.index,
                band.pixel_type,
                buffer.pixel_type()
            )));
        }
        if !self.layout.contains_block(col, row) {
            return Err(Error::Precondition(format!(
                "block ({col}, {row}) is out of range"
            )));
        }
        if buffer.len() < self.layout.block_elements() {
            return Err(Error::Precondition(format!(
                "block buffer holds {} elements, need {}",
                buffer.len(),
                self.layout.block_elements()
            )));
        }
        Ok(())
    }

    fn engine<'a>(&'a self, band: &'a Band) -> BlockEngine<'a> {
        BlockEngine {
            var: self.var,
            rank: self.info.rank(),
            x_pos: self.dims.x_pos,
            y_pos: self.dims.y_pos,
            band_offsets: &band.offsets,
            layout: self.layout,
            bottom_up: self.bottom_up,
            band: band.index,
        }
    }
}
