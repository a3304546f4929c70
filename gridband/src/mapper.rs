use tracing::warn;

use crate::{
    backend::VariableInfo,
    errors::{Error, Result},
};

/// The semantic role of one dimension, as decided by a classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DimRole {
    X,
    Y,
    Vertical,
    Time,
    Other,
}

/// Classify a dimension by its CF-conventional name. Callers with richer
/// metadata (axis attributes, coordinate variables) can substitute their
/// own classifier.
pub fn cf_name_role(_pos: usize, name: &str) -> DimRole {
    match name.to_ascii_lowercase().as_str() {
        "x" | "lon" | "longitude" | "west_east" | "xc" => DimRole::X,
        "y" | "lat" | "latitude" | "south_north" | "yc" => DimRole::Y,
        "z" | "lev" | "level" | "depth" | "height" | "pres" | "pressure" | "altitude" => {
            DimRole::Vertical
        }
        "time" | "t" => DimRole::Time,
        _ => DimRole::Other,
    }
}

/// One non-spatial dimension of a variable: its position in the storage
/// order and its size (the level count it contributes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtraDim {
    pub pos: usize,
    pub size: usize,
}

/// The resolved mapping from a variable's dimension list onto the raster
/// abstraction's fixed X/Y/band model.
///
/// Built once per variable at open time. `switched_xy` records the
/// *detected* orientation; it is never silently reconciled with anything a
/// caller may have declared.
#[derive(Clone, Debug)]
pub struct DimensionMap {
    pub x_pos: usize,
    pub y_pos: Option<usize>,

    /// Non-spatial dimensions, outermost first.
    pub extra: Vec<ExtraDim>,

    /// The trailing spatial dimensions classified as X,Y instead of the
    /// conventional Y,X.
    pub switched_xy: bool,

    /// Non-fatal dimension-order violations, also emitted as warnings.
    pub advisories: Vec<String>,
}

impl DimensionMap {
    /// Identify the spatial dimensions and decompose the rest into band
    /// levels.
    ///
    /// Classification failures degrade to positional defaults (trailing
    /// dimension is X, the one before it is Y) with an advisory; only a
    /// dimensionless variable is a hard error.
    pub fn resolve(
        info: &VariableInfo,
        classify: &dyn Fn(usize, &str) -> DimRole,
    ) -> Result<Self> {
        let rank = info.rank();
        if rank == 0 {
            return Err(Error::Unsupported(format!(
                "variable {} has no dimensions",
                info.name
            )));
        }

        let roles: Vec<DimRole> = (0..rank)
            .map(|pos| classify(pos, &info.dim_names[pos]))
            .collect();

        let mut advisories = Vec::new();

        // Take the innermost dimension tagged with each spatial role;
        // duplicates are suspicious but non-fatal.
        let x_tagged = roles.iter().rposition(|&r| r == DimRole::X);
        let y_tagged = roles.iter().rposition(|&r| r == DimRole::Y);
        if roles.iter().filter(|&&r| r == DimRole::X).count() > 1 {
            advisories.push(format!("variable {}: multiple X-like dimensions", info.name));
        }
        if roles.iter().filter(|&&r| r == DimRole::Y).count() > 1 {
            advisories.push(format!("variable {}: multiple Y-like dimensions", info.name));
        }

        let x_pos = match x_tagged {
            Some(pos) => pos,
            None => {
                advisories.push(format!(
                    "variable {}: no X-like dimension, assuming innermost",
                    info.name
                ));
                rank - 1
            }
        };

        let y_pos = if rank < 2 {
            None
        } else {
            match y_tagged {
                Some(pos) if pos != x_pos => Some(pos),
                _ => {
                    // Default to the innermost dimension that is not X.
                    let fallback = (0..rank).rev().find(|&pos| pos != x_pos);
                    if y_tagged.is_none() {
                        advisories.push(format!(
                            "variable {}: no Y-like dimension, assuming position {}",
                            info.name,
                            fallback.unwrap_or(0)
                        ));
                    }
                    fallback
                }
            }
        };

        let switched_xy = match y_pos {
            Some(y) => x_pos < y,
            None => false,
        };

        // Advisory validation of the conventional ordering: the trailing
        // dimensions should be (time, vertical, y, x).
        if rank >= 2 {
            let last_two = (roles[rank - 2], roles[rank - 1]);
            let conventional = last_two == (DimRole::Y, DimRole::X);
            let switched = last_two == (DimRole::X, DimRole::Y);
            if !conventional && !switched {
                advisories.push(format!(
                    "variable {}: trailing dimensions are not Y,X",
                    info.name
                ));
            }
        }
        if rank >= 3 {
            let role = roles[rank - 3];
            if role != DimRole::Vertical && role != DimRole::Time {
                advisories.push(format!(
                    "variable {}: dimension {} is neither vertical nor time",
                    info.name,
                    rank - 3
                ));
            }
        }
        if rank >= 4 && roles[rank - 4] != DimRole::Time {
            advisories.push(format!(
                "variable {}: dimension {} is not a time dimension",
                info.name,
                rank - 4
            ));
        }

        for advisory in &advisories {
            warn!("{advisory}");
        }

        let extra = (0..rank)
            .filter(|&pos| pos != x_pos && Some(pos) != y_pos)
            .map(|pos| ExtraDim {
                pos,
                size: info.dim_sizes[pos],
            })
            .collect();

        Ok(Self {
            x_pos,
            y_pos,
            extra,
            switched_xy,
            advisories,
        })
    }

    /// Number of bands the variable decomposes into.
    pub fn band_count(&self) -> usize {
        self.extra.iter().map(|dim| dim.size.max(1)).product()
    }

    /// Mixed-radix decomposition of a 0-based band level into one offset
    /// per non-spatial dimension, outermost first.
    ///
    /// Reproduces row-major enumeration: the outermost dimension varies
    /// slowest. Decomposition stops early if a partial product would leave
    /// the signed 32-bit range, which only happens with malformed metadata.
    pub fn level_offsets(&self, level: usize) -> Vec<usize> {
        let k = self.extra.len();
        let mut offsets = vec![0usize; k];
        if k == 0 {
            return offsets;
        }

        // remaining[i] = product of the sizes of all dimensions more nested
        // than i.
        let mut remaining = vec![1i64; k];
        for i in (0..k - 1).rev() {
            remaining[i] = remaining[i + 1] * self.extra[i + 1].size.max(1) as i64;
        }

        let level = level as i64;
        let mut taken = 0i64;
        for i in 0..k {
            let offset = if i < k - 1 {
                (level - taken) / remaining[i]
            } else {
                (level - taken) % self.extra[i].size.max(1) as i64
            };
            if offset
                .checked_mul(remaining[i])
                .map_or(true, |product| product > i32::MAX as i64)
            {
                warn!("band level {level} overflows dimension metadata, truncating");
                break;
            }
            offsets[i] = offset as usize;
            taken += offset * remaining[i];
        }

        offsets
    }
}
