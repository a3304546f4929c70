use crate::{errors::Result, pixel::StorageType};

/// Identifier for one variable within a storage container. Only meaningful
/// to the backend that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VarId(pub usize);

/// Everything this subsystem needs to know about an opened variable.
/// Immutable once the dataset is open.
#[derive(Clone, Debug)]
pub struct VariableInfo {
    pub name: String,
    pub storage_type: StorageType,

    /// Dimension sizes in native storage order, outermost first.
    pub dim_sizes: Vec<usize>,

    /// Dimension names, parallel to `dim_sizes`. Used only for
    /// classification hints.
    pub dim_names: Vec<String>,
}

impl VariableInfo {
    pub fn rank(&self) -> usize {
        self.dim_sizes.len()
    }
}

/// One attribute value, carrying its own declared storage width.
///
/// The resolver reads fill values and ranges with the width the file
/// declared for them, not the width of the variable, so the distinction
/// between these variants is load-bearing.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Text(String),
}

impl AttrValue {
    pub fn len(&self) -> usize {
        match self {
            Self::I8(v) => v.len(),
            Self::U8(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::U16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::U32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::U64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::Text(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index` widened to f64, for numeric attributes.
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        match self {
            Self::I8(v) => v.get(index).map(|&x| x as f64),
            Self::U8(v) => v.get(index).map(|&x| x as f64),
            Self::I16(v) => v.get(index).map(|&x| x as f64),
            Self::U16(v) => v.get(index).map(|&x| x as f64),
            Self::I32(v) => v.get(index).map(|&x| x as f64),
            Self::U32(v) => v.get(index).map(|&x| x as f64),
            Self::I64(v) => v.get(index).map(|&x| x as f64),
            Self::U64(v) => v.get(index).map(|&x| x as f64),
            Self::F32(v) => v.get(index).map(|&x| x as f64),
            Self::F64(v) => v.get(index).copied(),
            Self::Text(_) => None,
        }
    }

    pub fn first_f64(&self) -> Option<f64> {
        self.get_f64(0)
    }

    /// First element as an exact i64, when the declared width can carry it
    /// without loss. Floating-point attributes qualify only when integral
    /// and within the exactly-representable range.
    pub fn first_i64(&self) -> Option<i64> {
        match self {
            Self::I8(v) => v.first().map(|&x| x as i64),
            Self::U8(v) => v.first().map(|&x| x as i64),
            Self::I16(v) => v.first().map(|&x| x as i64),
            Self::U16(v) => v.first().map(|&x| x as i64),
            Self::I32(v) => v.first().map(|&x| x as i64),
            Self::U32(v) => v.first().map(|&x| x as i64),
            Self::I64(v) => v.first().copied(),
            Self::U64(v) => v.first().and_then(|&x| i64::try_from(x).ok()),
            Self::F32(v) => v.first().and_then(|&x| exact_i64(x as f64)),
            Self::F64(v) => v.first().and_then(|&x| exact_i64(x)),
            Self::Text(_) => None,
        }
    }

    /// First element as an exact u64, under the same lossless rule.
    pub fn first_u64(&self) -> Option<u64> {
        match self {
            Self::U64(v) => v.first().copied(),
            Self::F32(v) => v.first().and_then(|&x| exact_u64(x as f64)),
            Self::F64(v) => v.first().and_then(|&x| exact_u64(x)),
            _ => self.first_i64().and_then(|x| u64::try_from(x).ok()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// True when the declared width held the value as a signed integer and
    /// the stored bits were negative. Needed for the unsigned fill-value
    /// correction on 8- and 16-bit storage.
    pub fn first_is_negative_integer(&self) -> bool {
        match self {
            Self::I8(v) => v.first().map_or(false, |&x| x < 0),
            Self::I16(v) => v.first().map_or(false, |&x| x < 0),
            Self::I32(v) => v.first().map_or(false, |&x| x < 0),
            Self::I64(v) => v.first().map_or(false, |&x| x < 0),
            _ => false,
        }
    }
}

fn exact_i64(v: f64) -> Option<i64> {
    if v.is_finite() && v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

fn exact_u64(v: f64) -> Option<u64> {
    if v.is_finite() && v.fract() == 0.0 && v >= 0.0 && v <= u64::MAX as f64 {
        Some(v as u64)
    } else {
        None
    }
}

/// One named attribute attached to a variable or to the container itself.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttrValue,
}

impl Attribute {
    pub fn new<S: Into<String>>(name: S, value: AttrValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// The storage backend collaborator.
///
/// Everything this subsystem knows about the file format is reached through
/// this trait: rectangular hyperslab reads and writes over a fixed native
/// element type, attribute queries, and native chunk geometry. The trait is
/// synchronous by contract; callers serialize access through one coarse
/// lock for the duration of a block request.
pub trait StorageBackend: Send {
    fn variable_info(&self, var: VarId) -> Result<VariableInfo>;

    /// Read the hyperslab described by per-dimension `start`/`count` into
    /// `dst`. Elements are packed densely in storage order per the `count`
    /// extents; `dst` must be exactly the product of the counts times the
    /// element size.
    fn read_hyperslab(
        &self,
        var: VarId,
        start: &[usize],
        count: &[usize],
        dst: &mut [u8],
    ) -> Result<()>;

    /// Write the hyperslab described by `start`/`count` from the densely
    /// packed `src`.
    fn write_hyperslab(
        &mut self,
        var: VarId,
        start: &[usize],
        count: &[usize],
        src: &[u8],
    ) -> Result<()>;

    /// Attribute lookup never hard-fails; a backend that cannot read an
    /// attribute reports it as absent.
    fn get_attribute(&self, var: VarId, name: &str) -> Option<Attribute>;

    fn get_global_attribute(&self, name: &str) -> Option<Attribute>;

    /// Native chunk geometry for the variable, one size per dimension, or
    /// `None` when the variable is contiguous.
    fn inquire_chunking(&self, var: VarId) -> Result<Option<Vec<usize>>>;
}
