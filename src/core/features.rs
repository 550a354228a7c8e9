use crate::core::block::Tile;
use crate::io::raster::RasterSource;
use crate::types::{ClassError, ClassResult, FeatureMatrix};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Pluggable expansion step that derives extra feature columns from the
/// band features of a tile (e.g. temporal statistics over a band stack)
pub trait FeatureExpander: Send + Sync {
    /// Number of columns the expansion appends for a given input width
    fn n_outputs(&self, n_inputs: usize) -> usize;

    /// Derived columns, shaped (pixels x n_outputs)
    fn expand(&self, features: &FeatureMatrix) -> ClassResult<FeatureMatrix>;
}

/// Per-pixel temporal statistics (mean, min, max, std) over the band stack
#[derive(Debug, Clone, Copy, Default)]
pub struct TemporalStats;

impl FeatureExpander for TemporalStats {
    fn n_outputs(&self, _n_inputs: usize) -> usize {
        4
    }

    fn expand(&self, features: &FeatureMatrix) -> ClassResult<FeatureMatrix> {
        let (pixels, n) = features.dim();
        if n == 0 {
            return Err(ClassError::ShapeMismatch(
                "Temporal statistics require at least one input band".to_string(),
            ));
        }
        let mut out = Array2::zeros((pixels, 4));
        for (i, row) in features.axis_iter(Axis(0)).enumerate() {
            let mut sum = 0.0;
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            for &v in row.iter() {
                sum += v;
                min = min.min(v);
                max = max.max(v);
            }
            let mean = sum / n as f64;
            let var = row.iter().map(|&v| (v - mean).powi(2)).sum::<f64>() / n as f64;
            out[[i, 0]] = mean;
            out[[i, 1]] = min;
            out[[i, 2]] = max;
            out[[i, 3]] = var.sqrt();
        }
        Ok(out)
    }
}

/// Standardizing transform fit at training time and replayed at predict
/// time (transform only, never re-fit here)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl FeatureScaler {
    pub fn transform(&self, features: &mut FeatureMatrix) -> ClassResult<()> {
        let n = features.ncols();
        if self.mean.len() != n || self.scale.len() != n {
            return Err(ClassError::ShapeMismatch(format!(
                "Scaler was fit on {} features but tile has {}",
                self.mean.len(),
                n
            )));
        }
        for (j, mut col) in features.axis_iter_mut(Axis(1)).enumerate() {
            let scale = if self.scale[j] == 0.0 { 1.0 } else { self.scale[j] };
            col.mapv_inplace(|v| (v - self.mean[j]) / scale);
        }
        Ok(())
    }
}

/// Feature table for one tile's padded window, plus the indices of null
/// pixels (entirely-zero band vectors)
#[derive(Debug)]
pub struct AssembledFeatures {
    pub matrix: FeatureMatrix,
    pub null_pixels: Vec<usize>,
}

/// Builds the per-tile feature table the model sees.
///
/// The predictor band list is the resolved column index list persisted with
/// the model artifact, so training-time column exclusions and predict-time
/// band selection cannot drift apart.
pub struct FeatureAssembler<'a> {
    source: &'a dyn RasterSource,
    bands: Vec<usize>,
    use_coordinates: bool,
    side_layers: Vec<&'a dyn RasterSource>,
    expander: Option<&'a dyn FeatureExpander>,
    scaler: Option<&'a FeatureScaler>,
}

impl<'a> FeatureAssembler<'a> {
    pub fn new(source: &'a dyn RasterSource, bands: Vec<usize>) -> ClassResult<Self> {
        if bands.is_empty() {
            return Err(ClassError::Configuration(
                "Predictor band list is empty".to_string(),
            ));
        }
        Ok(Self {
            source,
            bands,
            use_coordinates: false,
            side_layers: Vec::new(),
            expander: None,
            scaler: None,
        })
    }

    /// Append pixel-center x/y coordinate features (for models trained
    /// with coordinates)
    pub fn with_coordinates(mut self) -> Self {
        self.use_coordinates = true;
        self
    }

    /// Append all bands of an additional co-registered layer
    pub fn with_side_layer(mut self, layer: &'a dyn RasterSource) -> Self {
        self.side_layers.push(layer);
        self
    }

    pub fn with_expander(mut self, expander: &'a dyn FeatureExpander) -> Self {
        self.expander = Some(expander);
        self
    }

    pub fn with_scaler(mut self, scaler: &'a FeatureScaler) -> Self {
        self.scaler = Some(scaler);
        self
    }

    /// Total feature column count this assembler will produce
    pub fn feature_count(&self) -> usize {
        let mut n = self.bands.len();
        if self.use_coordinates {
            n += 2;
        }
        for layer in &self.side_layers {
            n += layer.info().bands;
        }
        if let Some(expander) = self.expander {
            n += expander.n_outputs(self.bands.len());
        }
        n
    }

    /// Assemble the sanitized feature table for a tile's padded window.
    ///
    /// `expected_features` is the model's declared feature count; a
    /// mismatch aborts before anything is predicted or written.
    pub fn assemble(
        &self,
        tile: &Tile,
        expected_features: Option<usize>,
    ) -> ClassResult<AssembledFeatures> {
        let pixels = tile.padded_pixels();
        log::debug!(
            "Assembling features for block {}: {} pixels, {} bands",
            tile.sequence,
            pixels,
            self.bands.len()
        );

        let window = self.source.read_window(
            &self.bands,
            tile.padded_row_start,
            tile.padded_col_start,
            tile.padded_rows,
            tile.padded_cols,
        )?;

        // Band columns, pixel-major
        let mut band_matrix = Array2::zeros((pixels, self.bands.len()));
        for (b, plane) in window.axis_iter(Axis(0)).enumerate() {
            for (p, &v) in plane.iter().enumerate() {
                band_matrix[[p, b]] = if v.is_finite() { v } else { 0.0 };
            }
        }

        // Null pixels are judged on the raw band vector only; coordinate
        // and derived columns are never zero for a real pixel
        let null_pixels: Vec<usize> = band_matrix
            .axis_iter(Axis(0))
            .enumerate()
            .filter(|(_, row)| row.iter().all(|&v| v == 0.0))
            .map(|(p, _)| p)
            .collect();

        let mut columns: Vec<Array1<f64>> = band_matrix
            .axis_iter(Axis(1))
            .map(|c| c.to_owned())
            .collect();

        if self.use_coordinates {
            let (xs, ys) = self.coordinate_columns(tile);
            columns.push(xs);
            columns.push(ys);
        }

        for layer in &self.side_layers {
            let layer_bands: Vec<usize> = (1..=layer.info().bands).collect();
            let side = layer.read_window(
                &layer_bands,
                tile.padded_row_start,
                tile.padded_col_start,
                tile.padded_rows,
                tile.padded_cols,
            )?;
            for plane in side.axis_iter(Axis(0)) {
                let col: Array1<f64> = plane
                    .iter()
                    .map(|&v| if v.is_finite() { v } else { 0.0 })
                    .collect();
                columns.push(col);
            }
        }

        if let Some(expander) = self.expander {
            let derived = expander.expand(&band_matrix)?;
            for c in derived.axis_iter(Axis(1)) {
                columns.push(c.mapv(|v| if v.is_finite() { v } else { 0.0 }));
            }
        }

        let mut matrix = Array2::zeros((pixels, columns.len()));
        for (j, col) in columns.into_iter().enumerate() {
            matrix.column_mut(j).assign(&col);
        }

        if let Some(scaler) = self.scaler {
            scaler.transform(&mut matrix)?;
        }

        if let Some(expected) = expected_features {
            if matrix.ncols() != expected {
                return Err(ClassError::ShapeMismatch(format!(
                    "Model expects {} features but tile produced {}",
                    expected,
                    matrix.ncols()
                )));
            }
        }

        Ok(AssembledFeatures {
            matrix,
            null_pixels,
        })
    }

    fn coordinate_columns(&self, tile: &Tile) -> (Array1<f64>, Array1<f64>) {
        let gt = &self.source.info().geo_transform;
        let pixels = tile.padded_pixels();
        let mut xs = Array1::zeros(pixels);
        let mut ys = Array1::zeros(pixels);
        let mut p = 0;
        for r in 0..tile.padded_rows {
            for c in 0..tile.padded_cols {
                let (x, y) =
                    gt.pixel_center(tile.padded_row_start + r, tile.padded_col_start + c);
                xs[p] = x;
                ys[p] = y;
                p += 1;
            }
        }
        (xs, ys)
    }
}
