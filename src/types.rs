use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};

/// 2D feature table (pixels x features), always f64 before any
/// classifier-specific cast
pub type FeatureMatrix = Array2<f64>;

/// Per-pixel class codes (or regression values) for one tile
pub type LabelImage = Array2<f32>;

/// Flat prediction vector as returned by a model (pixel order = row-major)
pub type LabelVector = Array1<f32>;

/// Per-class probability planes for one tile (class x rows x cols)
pub type ProbCube = Array3<f32>;

/// Storage data type of a raster band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    U8,
    I16,
    U16,
    I32,
    F32,
    F64,
}

impl StorageType {
    /// True for the integer-valued storage types
    pub fn is_integer(&self) -> bool {
        !matches!(self, StorageType::F32 | StorageType::F64)
    }

    /// Promote an integer storage type to floating point, leaving float
    /// types untouched
    pub fn as_float(&self) -> StorageType {
        if self.is_integer() {
            StorageType::F32
        } else {
            *self
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::U8 => write!(f, "uint8"),
            StorageType::I16 => write!(f, "int16"),
            StorageType::U16 => write!(f, "uint16"),
            StorageType::I32 => write!(f, "int32"),
            StorageType::F32 => write!(f, "float32"),
            StorageType::F64 => write!(f, "float64"),
        }
    }
}

/// Geospatial transformation parameters (GDAL-style affine)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Geotransform for a window whose top-left pixel sits at
    /// (row_offset, col_offset) of this raster; used for per-block outputs
    pub fn for_window(&self, row_offset: usize, col_offset: usize) -> Self {
        Self {
            top_left_x: self.top_left_x + col_offset as f64 * self.pixel_width,
            top_left_y: self.top_left_y + row_offset as f64 * self.pixel_height,
            ..self.clone()
        }
    }

    /// Map coordinates of a pixel center
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let x = self.top_left_x + (col as f64 + 0.5) * self.pixel_width;
        let y = self.top_left_y + (row as f64 + 0.5) * self.pixel_height;
        (x, y)
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self {
            top_left_x: 0.0,
            pixel_width: 1.0,
            rotation_x: 0.0,
            top_left_y: 0.0,
            rotation_y: 0.0,
            pixel_height: -1.0,
        }
    }
}

/// Read-only snapshot of a raster's geometry and storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterInfo {
    pub rows: usize,
    pub cols: usize,
    pub bands: usize,
    pub geo_transform: GeoTransform,
    pub storage_type: StorageType,
    pub no_data: Option<f64>,
    pub epsg: Option<u32>,
}

impl RasterInfo {
    /// Cell size in map units (width, height); height is reported positive
    pub fn cell_size(&self) -> (f64, f64) {
        (
            self.geo_transform.pixel_width,
            self.geo_transform.pixel_height.abs(),
        )
    }

    /// Descriptor for an output raster derived from this input: same
    /// geometry, caller-chosen band count and storage type
    pub fn output_descriptor(&self, bands: usize, storage_type: StorageType) -> RasterInfo {
        RasterInfo {
            bands,
            storage_type,
            no_data: Some(0.0),
            ..self.clone()
        }
    }

    /// Descriptor for a sub-window output starting at (row_offset, col_offset)
    /// with the given shape
    pub fn window_descriptor(
        &self,
        row_offset: usize,
        col_offset: usize,
        rows: usize,
        cols: usize,
        bands: usize,
        storage_type: StorageType,
    ) -> RasterInfo {
        RasterInfo {
            rows,
            cols,
            bands,
            storage_type,
            geo_transform: self.geo_transform.for_window(row_offset, col_offset),
            no_data: Some(0.0),
            epsg: self.epsg,
        }
    }
}

/// Sidecar record of a (possibly partial) classification run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub created: DateTime<Utc>,
    pub completed: Vec<u64>,
}

/// Error types for classification processing
#[derive(Debug, thiserror::Error)]
pub enum ClassError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for classification operations
pub type ClassResult<T> = Result<T, ClassError>;
