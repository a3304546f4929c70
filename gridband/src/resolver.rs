use tracing::warn;

use crate::{
    backend::{AttrValue, StorageBackend, VarId},
    pixel::{
        NoData, PixelType, StorageType, ValidRange, FILL_DOUBLE, FILL_FLOAT, FILL_INT, FILL_INT64,
        FILL_SHORT, FILL_UINT, FILL_UINT64, FILL_USHORT,
    },
};

/// Where the file came from, for the 8-bit signedness default: files this
/// system wrote store bytes as unsigned; foreign files are assumed to mean
/// signed bytes unless they say otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    Native,
    Foreign,
}

impl Provenance {
    /// Guess provenance from the container's history attribute.
    pub fn detect(backend: &dyn StorageBackend) -> Self {
        let written_by_us = backend
            .get_global_attribute("history")
            .and_then(|attr| attr.value.as_text().map(|s| s.contains("gridband")))
            .unwrap_or(false);
        if written_by_us {
            Self::Native
        } else {
            Self::Foreign
        }
    }
}

/// Everything the resolver decides for one band, fixed at construction
/// except where the dataset is open for update.
#[derive(Clone, Debug)]
pub struct TypeResolution {
    pub pixel_type: PixelType,
    pub no_data: NoData,

    /// True when the no-data value was synthesized from a per-type default
    /// or a `missing_value` fallback rather than a declared `_FillValue`.
    pub no_data_secondary: bool,

    pub valid_range: Option<ValidRange>,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
    pub units: Option<String>,
}

/// Resolve the logical pixel type, no-data representation, and valid range
/// for one variable.
///
/// Attribute read failures are non-fatal by construction: the backend
/// reports unreadable attributes as absent and every rule here has a
/// default. Inconsistent metadata degrades with a warning, never an error.
pub fn resolve(
    backend: &dyn StorageBackend,
    var: VarId,
    storage: &StorageType,
    provenance: Provenance,
    honor_valid_range: bool,
) -> TypeResolution {
    let mut pixel_type = base_pixel_type(storage);

    let fill_attr = backend.get_attribute(var, "_FillValue");
    let missing_attr = backend.get_attribute(var, "missing_value");
    let unsigned_hint = backend
        .get_attribute(var, "_Unsigned")
        .and_then(|attr| parse_unsigned_hint(&attr.value));

    let mut valid_range = read_valid_range(backend, var);

    // Signedness of 8-bit storage: provenance default, then the explicit
    // hint, then the two range idioms that imply a signedness and are
    // consumed by it.
    if *storage == StorageType::I8 {
        let mut unsigned = provenance == Provenance::Native;
        if let Some(hint) = unsigned_hint {
            unsigned = hint;
        } else if let Some(range) = valid_range {
            if range.min == 0.0 && range.max == 255.0 {
                unsigned = true;
                valid_range = None;
            } else if range.min == -128.0 && range.max == 127.0 {
                unsigned = false;
                valid_range = None;
            }
        }
        pixel_type = if unsigned { PixelType::U8 } else { PixelType::I8 };
    }

    // 16-bit storage only honors the explicit hint.
    if *storage == StorageType::I16 && unsigned_hint == Some(true) {
        pixel_type = PixelType::U16;
    }

    let (mut no_data, no_data_secondary) = resolve_no_data(
        pixel_type,
        storage,
        fill_attr.as_ref().map(|a| &a.value),
        missing_attr.as_ref().map(|a| &a.value),
    );

    // A fill value stored through a signed width but interpreted as
    // unsigned needs the two's-complement correction.
    if let NoData::F64(value) = no_data {
        if value < 0.0 {
            match pixel_type {
                PixelType::U8 => no_data = NoData::F64(value + 256.0),
                PixelType::U16 => no_data = NoData::F64(value + 65536.0),
                _ => {}
            }
        }
    }

    let valid_range = vet_valid_range(valid_range, pixel_type, honor_valid_range);

    let scale = backend
        .get_attribute(var, "scale_factor")
        .and_then(|attr| attr.value.first_f64());
    let offset = backend
        .get_attribute(var, "add_offset")
        .and_then(|attr| attr.value.first_f64());
    let units = backend
        .get_attribute(var, "units")
        .and_then(|attr| attr.value.as_text().map(str::to_owned));

    TypeResolution {
        pixel_type,
        no_data,
        no_data_secondary,
        valid_range,
        scale,
        offset,
        units,
    }
}

/// Direct correspondence from storage element type to pixel type. Narrow
/// signedness is refined afterwards; anything unrecognized falls back to
/// 32-bit float.
fn base_pixel_type(storage: &StorageType) -> PixelType {
    match storage {
        StorageType::I8 => PixelType::I8,
        StorageType::U8 => PixelType::U8,
        StorageType::I16 => PixelType::I16,
        StorageType::U16 => PixelType::U16,
        StorageType::I32 => PixelType::I32,
        StorageType::U32 => PixelType::U32,
        StorageType::I64 => PixelType::I64,
        StorageType::U64 => PixelType::U64,
        StorageType::F32 => PixelType::F32,
        StorageType::F64 => PixelType::F64,
        StorageType::Compound { field, count } if *count == 2 => match **field {
            StorageType::I16 => PixelType::CI16,
            StorageType::I32 => PixelType::CI32,
            StorageType::F32 => PixelType::CF32,
            StorageType::F64 => PixelType::CF64,
            _ => {
                warn!("unsupported compound storage type {storage}, treating as Float32");
                PixelType::F32
            }
        },
        other => {
            warn!("unrecognized storage type {other}, treating as Float32");
            PixelType::F32
        }
    }
}

/// The declared fill value, read with its own width, or a synthesized
/// per-type default. Returns the descriptor and whether it is secondary.
fn resolve_no_data(
    pixel_type: PixelType,
    storage: &StorageType,
    fill: Option<&AttrValue>,
    missing: Option<&AttrValue>,
) -> (NoData, bool) {
    if let Some(value) = fill {
        return (tag_no_data(pixel_type, value), false);
    }
    if let Some(value) = missing {
        return (tag_no_data(pixel_type, value), true);
    }

    // No declared fill: synthesize the library default, except for 8-bit
    // types, which have none.
    let default = match storage {
        StorageType::I16 => NoData::F64(FILL_SHORT as f64),
        StorageType::U16 => NoData::F64(FILL_USHORT as f64),
        StorageType::I32 => NoData::F64(FILL_INT as f64),
        StorageType::U32 => NoData::F64(FILL_UINT as f64),
        StorageType::I64 => NoData::I64(FILL_INT64),
        StorageType::U64 => NoData::U64(FILL_UINT64),
        StorageType::F32 => NoData::F64(FILL_FLOAT as f64),
        StorageType::F64 => NoData::F64(FILL_DOUBLE),
        _ => NoData::None,
    };

    (default, true)
}

/// Pick the descriptor tag for a declared fill value. 64-bit integer pixel
/// types keep the matching integer tag when the value is exactly
/// representable; everything else degrades to the floating-point tag.
fn tag_no_data(pixel_type: PixelType, value: &AttrValue) -> NoData {
    match pixel_type {
        PixelType::I64 => {
            if let Some(v) = value.first_i64() {
                return NoData::I64(v);
            }
            degrade_to_f64(value, pixel_type)
        }
        PixelType::U64 => {
            if let Some(v) = value.first_u64() {
                return NoData::U64(v);
            }
            degrade_to_f64(value, pixel_type)
        }
        _ => match value.first_f64() {
            Some(v) => NoData::F64(v),
            None => {
                warn!("non-numeric fill value attribute ignored");
                NoData::None
            }
        },
    }
}

fn degrade_to_f64(value: &AttrValue, pixel_type: PixelType) -> NoData {
    match value.first_f64() {
        Some(v) => {
            warn!("fill value {v} is not exactly representable as {pixel_type}");
            NoData::F64(v)
        }
        None => NoData::None,
    }
}

/// Read `valid_range`, falling back to `valid_min`/`valid_max`. Bounds are
/// vetted later, once signedness resolution has had its chance to consume
/// the range.
fn read_valid_range(backend: &dyn StorageBackend, var: VarId) -> Option<ValidRange> {
    if let Some(attr) = backend.get_attribute(var, "valid_range") {
        if attr.value.len() >= 2 {
            let min = attr.value.get_f64(0)?;
            let max = attr.value.get_f64(1)?;
            return Some(ValidRange { min, max });
        }
        warn!("valid_range attribute does not hold two values, ignoring");
        return None;
    }

    let min = backend
        .get_attribute(var, "valid_min")
        .and_then(|attr| attr.value.first_f64());
    let max = backend
        .get_attribute(var, "valid_max")
        .and_then(|attr| attr.value.first_f64());
    match (min, max) {
        (Some(min), Some(max)) => Some(ValidRange { min, max }),
        _ => None,
    }
}

/// Reject inverted, non-finite, or implausible ranges.
fn vet_valid_range(
    range: Option<ValidRange>,
    pixel_type: PixelType,
    honor_valid_range: bool,
) -> Option<ValidRange> {
    let range = range?;

    if !range.min.is_finite() || !range.max.is_finite() {
        warn!("valid range has non-finite bounds, ignoring");
        return None;
    }
    if range.min > range.max {
        warn!(
            "valid range [{}, {}] is inverted, ignoring",
            range.min, range.max
        );
        return None;
    }

    if pixel_type.is_integer() && !honor_valid_range {
        // A fractional range on an integer variable is almost always
        // expressed in scaled units rather than raw storage values.
        if range.min.fract() != 0.0 || range.max.fract() != 0.0 {
            warn!(
                "valid range [{}, {}] looks like a scale/offset artifact, ignoring",
                range.min, range.max
            );
            return None;
        }
    }

    if matches!(pixel_type, PixelType::I64 | PixelType::U64) {
        const EXACT: f64 = 9007199254740992.0; // 2^53
        if range.min.abs() > EXACT || range.max.abs() > EXACT {
            warn!("valid range bounds exceed exact double precision, ignoring");
            return None;
        }
    }

    Some(range)
}

fn parse_unsigned_hint(value: &AttrValue) -> Option<bool> {
    if let Some(text) = value.as_text() {
        return match text.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        };
    }
    value.first_f64().map(|v| v != 0.0)
}
