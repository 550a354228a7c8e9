//! landclass: A Fast, Modular Land-Cover Classification Engine
//!
//! This library applies trained classifiers to large satellite rasters in a
//! memory-bounded, block-tiled fashion, with optional probabilistic label
//! relaxation and morphological clean-up of the resulting land-cover maps.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    ClassError, ClassResult, FeatureMatrix, GeoTransform, LabelImage, LabelVector, ProbCube,
    RasterInfo, RunRecord, StorageType,
};

pub use io::{GdalSink, GdalSource, MemorySink, MemorySource, RasterSink, RasterSource, RunLedger};

pub use crate::core::{
    classify_raster, BlockPlanner, FeatureAssembler, FeatureScaler, Model, ModelFamily,
    MorphologyParams, PredictionBackend, Predictor, PredictorParams, RelaxationParams, RunSummary,
    Tile, TileOutput,
};
