//! Engine for the Marmalade-era `.dz` resource archive format: parsing,
//! in-memory modeling, codec dispatch, and the parallel pack/unpack
//! pipelines.

pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod io;
pub mod model;
pub mod path;
pub mod pipeline;
pub mod volume;

pub use error::{DzipError, Result};
