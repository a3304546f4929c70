use std::fmt;

use bytemuck::Pod;
use num_traits::cast;

/// Default fill values from the netCDF classic model. There is deliberately
/// no default for the 8-bit types; too many producers use the full byte
/// range for real data.
pub const FILL_SHORT: i16 = -32767;
pub const FILL_USHORT: u16 = 65535;
pub const FILL_INT: i32 = -2147483647;
pub const FILL_UINT: u32 = 4294967295;
pub const FILL_INT64: i64 = -9223372036854775806;
pub const FILL_UINT64: u64 = 18446744073709551614;
pub const FILL_FLOAT: f32 = 9.969209968386869e36;
pub const FILL_DOUBLE: f64 = 9.969209968386869e36;

/// The native element type of a stored variable, as reported by the storage
/// backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,

    /// A compound record. Only two-field records of identical numeric
    /// sub-fields are representable as pixels (they map to a complex type).
    Compound {
        field: Box<StorageType>,
        count: usize,
    },

    /// Anything the backend reports that we have no mapping for.
    Unknown(String),
}

impl StorageType {
    /// Size in bytes of one stored element, where known.
    pub fn element_size(&self) -> Option<usize> {
        match self {
            Self::I8 | Self::U8 => Some(1),
            Self::I16 | Self::U16 => Some(2),
            Self::I32 | Self::U32 | Self::F32 => Some(4),
            Self::I64 | Self::U64 | Self::F64 => Some(8),
            Self::Compound { field, count } => Some(field.element_size()? * count),
            Self::Unknown(_) => None,
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compound { field, count } => write!(f, "compound({field}x{count})"),
            Self::Unknown(name) => write!(f, "unknown({name})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// The logical type of one pixel as exposed through the raster abstraction.
///
/// This may differ from the storage element type: signedness of narrow
/// integers is resolved from attributes and provenance, and two-field
/// compound storage maps to a complex pixel type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    CI16,
    CI32,
    CF32,
    CF64,
}

impl PixelType {
    pub fn element_size(&self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 | Self::CI16 => 4,
            Self::I64 | Self::U64 | Self::F64 | Self::CI32 | Self::CF32 => 8,
            Self::CF64 => 16,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::F32 | Self::F64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::I8
                | Self::U8
                | Self::I16
                | Self::U16
                | Self::I32
                | Self::U32
                | Self::I64
                | Self::U64
        )
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, Self::CI16 | Self::CI32 | Self::CF32 | Self::CF64)
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The resolved no-data sentinel for one band.
///
/// At most one representation is active. The 64-bit integer tags exist so
/// that fill values beyond the exactly-representable range of an f64 keep
/// their full precision.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NoData {
    None,
    F64(f64),
    I64(i64),
    U64(u64),
}

impl NoData {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Lossy view of the sentinel, for diagnostics and range comparisons.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::None => None,
            Self::F64(v) => Some(v),
            Self::I64(v) => Some(v as f64),
            Self::U64(v) => Some(v as f64),
        }
    }
}

/// An inclusive valid range in the pixel's numeric domain. Produced by the
/// resolver only when the declared bounds are finite and ordered.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ValidRange {
    pub min: f64,
    pub max: f64,
}

mod private {
    pub trait Sealed {}
}

/// One logical pixel element the block engine can operate on.
///
/// A small closed set: the ten scalar numeric types plus two-wide complex
/// pairs. Sealed; the engine's dispatch enumerates exactly these
/// implementations. All sanitization and layout repair is written once,
/// generically, against this trait.
pub trait Element: private::Sealed + Pod + Copy + PartialEq + Send + Sync + 'static {
    const PIXEL: PixelType;

    /// Convert the band's resolved no-data sentinel into this element's
    /// domain. `None` when the sentinel is absent or not representable.
    fn from_no_data(no_data: NoData) -> Option<Self>;

    fn to_f64(self) -> Option<f64>;

    fn is_nan_value(self) -> bool {
        false
    }

    /// Shift one longitude element by -360 degrees. Identity for types that
    /// cannot represent a longitude beyond 180.
    fn unwrap_lon(self) -> Self;
}

macro_rules! int_element {
    ($($t:ty => $pixel:ident),* $(,)?) => {$(
        impl private::Sealed for $t {}

        impl Element for $t {
            const PIXEL: PixelType = PixelType::$pixel;

            fn from_no_data(no_data: NoData) -> Option<Self> {
                match no_data {
                    NoData::None => None,
                    NoData::F64(v) => cast(v),
                    NoData::I64(v) => cast(v),
                    NoData::U64(v) => cast(v),
                }
            }

            fn to_f64(self) -> Option<f64> {
                cast(self)
            }

            fn unwrap_lon(self) -> Self {
                match cast::<i64, Self>(360) {
                    Some(shift) => self.wrapping_sub(shift),
                    None => self,
                }
            }
        }
    )*};
}

int_element!(
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
);

macro_rules! float_element {
    ($($t:ty => $pixel:ident),* $(,)?) => {$(
        impl private::Sealed for $t {}

        impl Element for $t {
            const PIXEL: PixelType = PixelType::$pixel;

            fn from_no_data(no_data: NoData) -> Option<Self> {
                match no_data {
                    NoData::None => None,
                    NoData::F64(v) => Some(v as $t),
                    NoData::I64(v) => Some(v as $t),
                    NoData::U64(v) => Some(v as $t),
                }
            }

            fn to_f64(self) -> Option<f64> {
                Some(self as f64)
            }

            fn is_nan_value(self) -> bool {
                self.is_nan()
            }

            fn unwrap_lon(self) -> Self {
                self - 360.0
            }
        }
    )*};
}

float_element!(
    f32 => F32,
    f64 => F64,
);

macro_rules! complex_element {
    ($($t:ty => $pixel:ident),* $(,)?) => {$(
        impl private::Sealed for $t {}

        impl Element for $t {
            const PIXEL: PixelType = PixelType::$pixel;

            // Complex pixels have no no-data sentinel and are never
            // sanitized; they pass through the engine verbatim.
            fn from_no_data(_: NoData) -> Option<Self> {
                None
            }

            fn to_f64(self) -> Option<f64> {
                None
            }

            fn unwrap_lon(self) -> Self {
                self
            }
        }
    )*};
}

complex_element!(
    [i16; 2] => CI16,
    [i32; 2] => CI32,
    [f32; 2] => CF32,
    [f64; 2] => CF64,
);
