//! An in-memory storage backend for tests, with a hyperslab fetch counter
//! so cache behavior can be asserted.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bytemuck::cast_slice;
use ndarray::Array2;
use parking_lot::Mutex;

use crate::{
    backend::{Attribute, StorageBackend, VarId, VariableInfo},
    errors::{Error, Result},
    pixel::StorageType,
};

struct MockVar {
    info: VariableInfo,
    attrs: Vec<Attribute>,
    chunking: Option<Vec<usize>>,
    data: Vec<u8>,
}

struct Inner {
    vars: Mutex<Vec<MockVar>>,
    globals: Mutex<Vec<Attribute>>,
    fetches: AtomicUsize,
}

/// Clones share one store, so a test can keep a handle to a backend it has
/// boxed into a dataset.
#[derive(Clone)]
pub(crate) struct MockBackend {
    inner: Arc<Inner>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                vars: Mutex::new(Vec::new()),
                globals: Mutex::new(Vec::new()),
                fetches: AtomicUsize::new(0),
            }),
        }
    }

    pub fn add_variable(
        &self,
        name: &str,
        storage_type: StorageType,
        dim_names: &[&str],
        dim_sizes: &[usize],
        data: Vec<u8>,
    ) -> VarId {
        let mut vars = self.inner.vars.lock();
        let id = VarId(vars.len());
        vars.push(MockVar {
            info: VariableInfo {
                name: name.to_string(),
                storage_type,
                dim_sizes: dim_sizes.to_vec(),
                dim_names: dim_names.iter().map(|s| s.to_string()).collect(),
            },
            attrs: Vec::new(),
            chunking: None,
            data,
        });
        id
    }

    pub fn add_f32_variable(
        &self,
        name: &str,
        dim_names: &[&str],
        dim_sizes: &[usize],
        data: &[f32],
    ) -> VarId {
        self.add_variable(
            name,
            StorageType::F32,
            dim_names,
            dim_sizes,
            cast_slice(data).to_vec(),
        )
    }

    /// 2-D f32 variable from an ndarray grid (rows are Y, columns are X).
    pub fn add_grid_f32(&self, name: &str, dim_names: &[&str], grid: &Array2<f32>) -> VarId {
        let (rows, cols) = grid.dim();
        let data: Vec<f32> = grid.iter().copied().collect();
        self.add_f32_variable(name, dim_names, &[rows, cols], &data)
    }

    pub fn set_attr(&self, var: VarId, attr: Attribute) {
        let mut vars = self.inner.vars.lock();
        let attrs = &mut vars[var.0].attrs;
        attrs.retain(|a| a.name != attr.name);
        attrs.push(attr);
    }

    pub fn set_global(&self, attr: Attribute) {
        let mut globals = self.inner.globals.lock();
        globals.retain(|a| a.name != attr.name);
        globals.push(attr);
    }

    pub fn set_chunking(&self, var: VarId, chunk_dims: Vec<usize>) {
        self.inner.vars.lock()[var.0].chunking = Some(chunk_dims);
    }

    /// Number of hyperslab reads issued so far.
    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    fn check_request(var: &MockVar, start: &[usize], count: &[usize]) -> Result<usize> {
        let rank = var.info.rank();
        if start.len() != rank || count.len() != rank {
            return Err(Error::Backend("hyperslab rank mismatch".into()));
        }
        for d in 0..rank {
            if start[d] + count[d] > var.info.dim_sizes[d] {
                return Err(Error::Backend(format!(
                    "hyperslab exceeds dimension {d} ({} + {} > {})",
                    start[d], count[d], var.info.dim_sizes[d]
                )));
            }
        }
        var.info
            .storage_type
            .element_size()
            .ok_or_else(|| Error::Backend("unsized storage type".into()))
    }
}

/// Walk the contiguous runs of a hyperslab: one run per combination of the
/// outer dimension indexes, each `count[rank-1]` elements long.
fn visit_runs(
    dim_sizes: &[usize],
    start: &[usize],
    count: &[usize],
    element_size: usize,
    mut visit: impl FnMut(usize, usize, usize),
) {
    let rank = dim_sizes.len();
    let mut stride = vec![element_size; rank];
    for d in (0..rank - 1).rev() {
        stride[d] = stride[d + 1] * dim_sizes[d + 1];
    }

    let outer = rank - 1;
    let run = count[outer] * element_size;
    let mut index = vec![0usize; outer];
    let mut flat = 0usize;
    'runs: loop {
        let mut offset = start[outer] * element_size;
        for d in 0..outer {
            offset += (start[d] + index[d]) * stride[d];
        }
        visit(offset, flat, run);
        flat += run;

        let mut d = outer;
        while d > 0 {
            d -= 1;
            index[d] += 1;
            if index[d] < count[d] {
                continue 'runs;
            }
            index[d] = 0;
        }
        break;
    }
}

impl StorageBackend for MockBackend {
    fn variable_info(&self, var: VarId) -> Result<VariableInfo> {
        let vars = self.inner.vars.lock();
        vars.get(var.0)
            .map(|v| v.info.clone())
            .ok_or_else(|| Error::Backend(format!("no variable {:?}", var)))
    }

    fn read_hyperslab(
        &self,
        var: VarId,
        start: &[usize],
        count: &[usize],
        dst: &mut [u8],
    ) -> Result<()> {
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);
        let vars = self.inner.vars.lock();
        let var = &vars[var.0];
        let element_size = Self::check_request(var, start, count)?;

        let total: usize = count.iter().product::<usize>() * element_size;
        if dst.len() != total {
            return Err(Error::Backend(format!(
                "destination holds {} bytes, hyperslab selects {}",
                dst.len(),
                total
            )));
        }

        visit_runs(&var.info.dim_sizes, start, count, element_size, |src, flat, run| {
            dst[flat..flat + run].copy_from_slice(&var.data[src..src + run]);
        });
        Ok(())
    }

    fn write_hyperslab(
        &mut self,
        var: VarId,
        start: &[usize],
        count: &[usize],
        src: &[u8],
    ) -> Result<()> {
        let mut vars = self.inner.vars.lock();
        let var = &mut vars[var.0];
        let element_size = Self::check_request(var, start, count)?;

        let total: usize = count.iter().product::<usize>() * element_size;
        if src.len() != total {
            return Err(Error::Backend(format!(
                "source holds {} bytes, hyperslab selects {}",
                src.len(),
                total
            )));
        }

        let data = &mut var.data;
        visit_runs(&var.info.dim_sizes, start, count, element_size, |dst, flat, run| {
            data[dst..dst + run].copy_from_slice(&src[flat..flat + run]);
        });
        Ok(())
    }

    fn get_attribute(&self, var: VarId, name: &str) -> Option<Attribute> {
        let vars = self.inner.vars.lock();
        vars.get(var.0)?.attrs.iter().find(|a| a.name == name).cloned()
    }

    fn get_global_attribute(&self, name: &str) -> Option<Attribute> {
        self.inner
            .globals
            .lock()
            .iter()
            .find(|a| a.name == name)
            .cloned()
    }

    fn inquire_chunking(&self, var: VarId) -> Result<Option<Vec<usize>>> {
        let vars = self.inner.vars.lock();
        Ok(vars
            .get(var.0)
            .ok_or_else(|| Error::Backend(format!("no variable {:?}", var)))?
            .chunking
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AttrValue;
    use crate::resolver::Provenance;

    #[test]
    fn hyperslab_read_selects_a_sub_cube() {
        let mock = MockBackend::new();
        let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let var = mock.add_f32_variable("v", &["time", "lat", "lon"], &[2, 3, 4], &data);

        // time 1, rows 1..3, cols 2..4
        let mut out = vec![0u8; 2 * 2 * 4];
        mock.read_hyperslab(var, &[1, 1, 2], &[1, 2, 2], &mut out)
            .unwrap();
        let out: &[f32] = cast_slice(&out);
        assert_eq!(out, &[18.0, 19.0, 22.0, 23.0]);
    }

    #[test]
    fn hyperslab_write_round_trips() {
        let mock = MockBackend::new();
        let var = mock.add_f32_variable("v", &["lat", "lon"], &[3, 4], &[0.0; 12]);

        let values = [1.5f32, 2.5, 3.5, 4.5];
        let mut backend = mock.clone();
        backend
            .write_hyperslab(var, &[1, 1], &[2, 2], cast_slice(&values))
            .unwrap();

        let mut out = vec![0u8; 4 * 4];
        mock.read_hyperslab(var, &[1, 1], &[2, 2], &mut out).unwrap();
        assert_eq!(cast_slice::<u8, f32>(&out), &values);
    }

    #[test]
    fn out_of_range_hyperslab_is_a_backend_error() {
        let mock = MockBackend::new();
        let var = mock.add_f32_variable("v", &["lat", "lon"], &[3, 4], &[0.0; 12]);

        let mut out = vec![0u8; 4 * 4];
        let result = mock.read_hyperslab(var, &[2, 0], &[2, 2], &mut out);
        assert!(matches!(result, Err(Error::Backend(_))));
    }

    #[test]
    fn grid_helper_stores_row_major() {
        let mock = MockBackend::new();
        let grid = Array2::from_shape_fn((2, 3), |(r, c)| (r * 3 + c) as f32);
        let var = mock.add_grid_f32("v", &["lat", "lon"], &grid);

        let mut out = vec![0u8; 3 * 4];
        mock.read_hyperslab(var, &[1, 0], &[1, 3], &mut out).unwrap();
        assert_eq!(cast_slice::<u8, f32>(&out), &[3.0, 4.0, 5.0]);
    }

    #[test]
    fn provenance_detection_reads_history() {
        let mock = MockBackend::new();
        assert_eq!(Provenance::detect(&mock), Provenance::Foreign);

        mock.set_global(Attribute::new(
            "history",
            AttrValue::Text("created by gridband 0.1".into()),
        ));
        assert_eq!(Provenance::detect(&mock), Provenance::Native);
    }
}
