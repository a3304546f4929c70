mod backend;
mod block;
mod cache;
mod dataset;
mod errors;
mod geom;
mod mapper;
mod pixel;
mod resolver;

#[cfg(test)]
mod testing;

pub use backend::AttrValue;
pub use backend::Attribute;
pub use backend::StorageBackend;
pub use backend::VarId;
pub use backend::VariableInfo;

pub use block::BlockBuffer;

pub use dataset::Band;
pub use dataset::Dataset;
pub use dataset::OpenOptions;

pub use errors::Error;
pub use errors::Result;

pub use geom::BlockLayout;
pub use geom::Hyperslab;

pub use mapper::cf_name_role;
pub use mapper::DimRole;
pub use mapper::DimensionMap;
pub use mapper::ExtraDim;

pub use pixel::Element;
pub use pixel::NoData;
pub use pixel::PixelType;
pub use pixel::StorageType;
pub use pixel::ValidRange;
pub use pixel::FILL_DOUBLE;
pub use pixel::FILL_FLOAT;
pub use pixel::FILL_INT;
pub use pixel::FILL_INT64;
pub use pixel::FILL_SHORT;
pub use pixel::FILL_UINT;
pub use pixel::FILL_UINT64;
pub use pixel::FILL_USHORT;

pub use resolver::Provenance;
pub use resolver::TypeResolution;
