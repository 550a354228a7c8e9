//! Core classification pipeline modules

pub mod backend;
pub mod block;
pub mod features;
pub mod morphology;
pub mod predict;
pub mod relaxation;
pub mod writer;

// Re-export main types
pub use backend::{
    labels_from_probabilities, BackendDescriptor, CommandRuntime, Model, ModelFamily,
    PredictionBackend, RuleCommitteeModel, RuleRuntime,
};
pub use block::{BlockPlanner, Tile};
pub use features::{AssembledFeatures, FeatureAssembler, FeatureExpander, FeatureScaler, TemporalStats};
pub use morphology::{clean_labels, closing_by_reconstruction, median_filter, MorphologyParams};
pub use predict::{
    apply_background_mask, classify_raster, recode_background, Predictor, PredictorParams,
    RunSummary,
};
pub use relaxation::{mask_null_pixels, relax_probabilities, RelaxationParams};
pub use writer::{block_path, BlockWriter, PerBlockWriter, TileOutput};
