use crate::core::backend::{labels_from_probabilities, PredictionBackend};
use crate::core::block::{BlockPlanner, Tile};
use crate::core::features::FeatureAssembler;
use crate::core::morphology::{clean_labels, median_filter, MorphologyParams};
use crate::core::relaxation::{mask_null_pixels, relax_probabilities, RelaxationParams};
use crate::core::writer::{BlockWriter, PerBlockWriter, TileOutput};
use crate::io::ledger::RunLedger;
use crate::io::raster::{GdalSink, GdalSource, RasterSink, RasterSource};
use crate::types::{ClassError, ClassResult, LabelImage, ProbCube, RasterInfo, StorageType};
use ndarray::{s, Array2};
use std::path::Path;

/// Orchestration parameters for a block-tiled classification run
#[derive(Debug, Clone)]
pub struct PredictorParams {
    pub block_rows: usize,
    pub block_cols: usize,
    /// Write per-class probability planes instead of hard labels
    pub probability_output: bool,
    pub relaxation: Option<RelaxationParams>,
    pub morphology: Option<MorphologyParams>,
    /// Optional windowed median clean-up of the finished labels
    pub median_window: Option<usize>,
    /// Process only tiles with 1-based sequence numbers in this range
    pub block_range: Option<(u64, u64)>,
    pub row_start: usize,
    pub col_start: usize,
    /// Extent limits from the start offset; None means "to the edge"
    pub n_rows: Option<usize>,
    pub n_cols: Option<usize>,
    /// Skip tiles already recorded complete in the run ledger
    pub resume: bool,
    /// 1-based band whose all-zero tiles are skipped without writing
    pub qa_band: Option<usize>,
    /// Requested output storage type, before the forcing rules
    pub storage_type: StorageType,
}

impl Default for PredictorParams {
    fn default() -> Self {
        Self {
            block_rows: 1024,
            block_cols: 1024,
            probability_output: false,
            relaxation: None,
            morphology: None,
            median_window: None,
            block_range: None,
            row_start: 0,
            col_start: 0,
            n_rows: None,
            n_cols: None,
            resume: false,
            qa_band: None,
            storage_type: StorageType::U8,
        }
    }
}

impl PredictorParams {
    /// Context pixels each tile must carry for the windowed
    /// post-processing that was requested
    pub fn required_pad(&self) -> usize {
        let mut pad = 0;
        if let Some(relaxation) = &self.relaxation {
            pad = pad.max(relaxation.required_pad());
        }
        if let Some(morphology) = &self.morphology {
            pad = pad.max(morphology.required_pad());
        }
        if let Some(window) = self.median_window {
            pad = pad.max(window / 2);
        }
        pad
    }

    /// Whether the tile pipeline needs class probabilities at all
    fn needs_probabilities(&self) -> bool {
        self.probability_output
            || self
                .relaxation
                .as_ref()
                .map(|r| !r.is_identity())
                .unwrap_or(false)
    }
}

/// Counters reported after a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total_tiles: usize,
    pub processed: usize,
    pub skipped: usize,
}

/// Drives the block-tiled prediction pipeline: plan tiles, assemble
/// features, predict, post-process, write, record.
pub struct Predictor<'a> {
    backend: &'a PredictionBackend,
    params: PredictorParams,
}

impl<'a> Predictor<'a> {
    pub fn new(backend: &'a PredictionBackend, params: PredictorParams) -> ClassResult<Self> {
        if params.needs_probabilities() {
            backend.ensure_probability_support()?;
        }
        if params.probability_output && params.morphology.is_some() {
            log::warn!(
                "Morphological clean-up applies to label output only; ignoring it for probability output"
            );
        }
        Ok(Self { backend, params })
    }

    pub fn params(&self) -> &PredictorParams {
        &self.params
    }

    /// Storage type actually written, after the forcing rules: morphology
    /// needs 8-bit class codes, regression and probability output need
    /// floating point
    pub fn output_storage_type(&self) -> StorageType {
        if self.params.probability_output {
            StorageType::F32
        } else if self.params.morphology.is_some() {
            StorageType::U8
        } else if self.backend.is_regressor() {
            self.params.storage_type.as_float()
        } else {
            self.params.storage_type
        }
    }

    fn output_bands(&self) -> usize {
        if self.params.probability_output {
            self.backend.classes().len()
        } else {
            1
        }
    }

    /// Tile plan for an input raster
    pub fn plan(&self, info: &RasterInfo) -> ClassResult<BlockPlanner> {
        let mut planner = BlockPlanner::new(
            info.rows,
            info.cols,
            self.params.block_rows,
            self.params.block_cols,
        )?
        .with_pad(self.params.required_pad());
        if self.params.row_start > 0 || self.params.col_start > 0 {
            planner = planner.with_start(self.params.row_start, self.params.col_start)?;
        }
        if self.params.n_rows.is_some() || self.params.n_cols.is_some() {
            let (max_rows, max_cols) = planner.target_shape();
            planner = planner.with_extent(
                self.params.n_rows.unwrap_or(max_rows),
                self.params.n_cols.unwrap_or(max_cols),
            );
        }
        if let Some((lo, hi)) = self.params.block_range {
            planner = planner.with_block_range(lo, hi)?;
        }
        Ok(planner)
    }

    /// Descriptor for the combined output raster of this run
    pub fn output_info(&self, input: &RasterInfo) -> ClassResult<RasterInfo> {
        let planner = self.plan(input)?;
        let (rows, cols) = planner.target_shape();
        Ok(input.window_descriptor(
            self.params.row_start,
            self.params.col_start,
            rows,
            cols,
            self.output_bands(),
            self.output_storage_type(),
        ))
    }

    /// Classify into one combined output raster
    pub fn classify(
        &self,
        source: &dyn RasterSource,
        assembler: &FeatureAssembler,
        sink: &mut dyn RasterSink,
        mut ledger: Option<&mut RunLedger>,
    ) -> ClassResult<RunSummary> {
        let planner = self.plan(source.info())?;
        let expected_bands = self.output_bands();
        if sink.info().bands != expected_bands {
            return Err(ClassError::Configuration(format!(
                "Output raster has {} bands but the run needs {}",
                sink.info().bands,
                expected_bands
            )));
        }

        let total = planner.tile_count();
        log::info!(
            "Classifying {} tiles of {}x{} (pad {})",
            total,
            self.params.block_rows,
            self.params.block_cols,
            self.params.required_pad()
        );

        let (row_origin, col_origin) = planner.start_offset();
        let mut writer = BlockWriter::new(sink, row_origin, col_origin);
        let mut summary = RunSummary {
            total_tiles: total,
            ..RunSummary::default()
        };

        for tile in planner.tiles() {
            if self.params.resume {
                if let Some(ledger) = ledger.as_deref() {
                    if ledger.contains(tile.sequence) {
                        log::debug!("Block {} already complete, skipping", tile.sequence);
                        summary.skipped += 1;
                        continue;
                    }
                }
            }

            let output = match self.process_tile(source, assembler, &tile)? {
                Some(output) => output,
                None => {
                    summary.skipped += 1;
                    continue;
                }
            };
            writer.write(&tile, &output)?;
            if let Some(ledger) = ledger.as_deref_mut() {
                ledger.mark_complete(tile.sequence)?;
            }

            summary.processed += 1;
            if total >= 10 && summary.processed % (total / 10).max(1) == 0 {
                log::info!(
                    "Classification progress: {:.0}%",
                    100.0 * (summary.processed + summary.skipped) as f64 / total as f64
                );
            }
        }

        writer.close()?;
        log::info!(
            "Classification finished: {} blocks written, {} skipped",
            summary.processed,
            summary.skipped
        );
        Ok(summary)
    }

    /// Classify into one raster file per block; resumability comes from
    /// the file-exists check instead of the ledger
    pub fn classify_per_block(
        &self,
        source: &dyn RasterSource,
        assembler: &FeatureAssembler,
        writer: &mut PerBlockWriter,
    ) -> ClassResult<RunSummary> {
        let planner = self.plan(source.info())?;
        let total = planner.tile_count();
        log::info!("Classifying {} tiles into per-block rasters", total);

        let mut summary = RunSummary {
            total_tiles: total,
            ..RunSummary::default()
        };
        for tile in planner.tiles() {
            // Existing block files are skipped before any features are
            // assembled or pixels predicted
            if writer.is_written(tile.sequence) {
                log::debug!("Block {} output already exists, skipping", tile.sequence);
                summary.skipped += 1;
                continue;
            }
            let output = match self.process_tile(source, assembler, &tile)? {
                Some(output) => output,
                None => {
                    summary.skipped += 1;
                    continue;
                }
            };
            if writer.write(&tile, &output)? {
                summary.processed += 1;
            } else {
                summary.skipped += 1;
            }
        }
        log::info!(
            "Per-block classification finished: {} blocks written, {} skipped",
            summary.processed,
            summary.skipped
        );
        Ok(summary)
    }

    /// One tile through features -> prediction -> post-processing,
    /// cropped to the core region. None means a normal skip (all-zero QA
    /// band).
    fn process_tile(
        &self,
        source: &dyn RasterSource,
        assembler: &FeatureAssembler,
        tile: &Tile,
    ) -> ClassResult<Option<TileOutput>> {
        let assembled = assembler.assemble(tile, self.backend.n_features())?;

        if let Some(qa_band) = self.params.qa_band {
            let qa = source.read_window(
                &[qa_band],
                tile.row_start,
                tile.col_start,
                tile.core_rows,
                tile.core_cols,
            )?;
            if qa.iter().all(|&v| v == 0.0) {
                log::debug!("Block {}: QA band is all zero, skipping", tile.sequence);
                return Ok(None);
            }
        }

        let padded_shape = (tile.padded_rows, tile.padded_cols);
        let mut null_mask = Array2::from_elem(padded_shape, false);
        for &p in &assembled.null_pixels {
            null_mask[[p / tile.padded_cols, p % tile.padded_cols]] = true;
        }

        let labels = if self.params.needs_probabilities() {
            let probabilities = self.backend.predict_proba(assembled.matrix.view())?;
            let n_classes = self.backend.classes().len();
            let mut cube = ProbCube::zeros((n_classes, tile.padded_rows, tile.padded_cols));
            for k in 0..n_classes {
                for p in 0..tile.padded_pixels() {
                    cube[[k, p / tile.padded_cols, p % tile.padded_cols]] =
                        probabilities[[p, k]];
                }
            }
            mask_null_pixels(&mut cube, &null_mask);
            if let Some(relaxation) = &self.params.relaxation {
                relax_probabilities(&mut cube, relaxation)?;
            }

            if self.params.probability_output {
                let core = cube
                    .slice(s![
                        ..,
                        tile.core_row_offset..tile.core_row_offset + tile.core_rows,
                        tile.core_col_offset..tile.core_col_offset + tile.core_cols
                    ])
                    .to_owned();
                return Ok(Some(TileOutput::Probabilities(core)));
            }

            // Hard labels from the (relaxed) probability planes
            let flat = Array2::from_shape_fn(
                (tile.padded_pixels(), n_classes),
                |(p, k)| cube[[k, p / tile.padded_cols, p % tile.padded_cols]],
            );
            let label_vector = labels_from_probabilities(flat.view(), self.backend.classes())?;
            Array2::from_shape_vec(padded_shape, label_vector.to_vec()).map_err(|e| {
                ClassError::Processing(format!("Failed to reshape block labels: {}", e))
            })?
        } else {
            let label_vector = self.backend.predict(assembled.matrix.view())?;
            let mut labels =
                Array2::from_shape_vec(padded_shape, label_vector.to_vec()).map_err(|e| {
                    ClassError::Processing(format!("Failed to reshape block labels: {}", e))
                })?;
            // Null pixels never receive a class
            ndarray::Zip::from(&mut labels)
                .and(&null_mask)
                .for_each(|label, &null| {
                    if null {
                        *label = 0.0;
                    }
                });
            labels
        };

        let labels = self.post_process_labels(labels)?;
        let core = labels
            .slice(s![
                tile.core_row_offset..tile.core_row_offset + tile.core_rows,
                tile.core_col_offset..tile.core_col_offset + tile.core_cols
            ])
            .to_owned();
        Ok(Some(TileOutput::Labels(core)))
    }

    fn post_process_labels(&self, labels: LabelImage) -> ClassResult<LabelImage> {
        let mut labels = labels;
        if let Some(morphology) = &self.params.morphology {
            // Morphology works on 8-bit class codes; the output storage
            // type is forced to U8 whenever it runs, so the squeeze is
            // lossless for the raster actually written
            let codes = labels.mapv(|v| v.clamp(0.0, 255.0) as u8);
            labels = clean_labels(&codes, morphology)?.mapv(|v| v as f32);
        }
        if let Some(window) = self.params.median_window {
            // The median runs on the f32 labels directly, so class codes
            // above 255 pass through wide-typed outputs unchanged
            labels = median_filter(&labels, window);
        }
        Ok(labels)
    }
}

/// Recode background / low-observation pixels to the null class in a
/// block-tiled pass over an already-classified raster. Pixels whose mask
/// value is at or below `threshold` are set to 0 in every band.
pub fn recode_background(
    classified: &dyn RasterSource,
    mask: &dyn RasterSource,
    sink: &mut dyn RasterSink,
    threshold: f64,
    block_size: (usize, usize),
) -> ClassResult<()> {
    let info = classified.info().clone();
    if mask.info().rows != info.rows || mask.info().cols != info.cols {
        return Err(ClassError::ShapeMismatch(format!(
            "Mask is {}x{} but classified raster is {}x{}",
            mask.info().rows,
            mask.info().cols,
            info.rows,
            info.cols
        )));
    }

    log::info!(
        "Recoding background pixels (mask threshold {}) over {} bands",
        threshold,
        info.bands
    );
    let planner = BlockPlanner::new(info.rows, info.cols, block_size.0, block_size.1)?;
    let bands: Vec<usize> = (1..=info.bands).collect();
    for tile in planner.tiles() {
        let mut window = classified.read_window(
            &bands,
            tile.row_start,
            tile.col_start,
            tile.core_rows,
            tile.core_cols,
        )?;
        let mask_window = mask.read_window(
            &[1],
            tile.row_start,
            tile.col_start,
            tile.core_rows,
            tile.core_cols,
        )?;
        for (b, _) in bands.iter().enumerate() {
            for r in 0..tile.core_rows {
                for c in 0..tile.core_cols {
                    if mask_window[[0, r, c]] <= threshold {
                        window[[b, r, c]] = 0.0;
                    }
                }
            }
        }
        for (b, &band) in bands.iter().enumerate() {
            sink.write_window(
                window.index_axis(ndarray::Axis(0), b),
                tile.row_start,
                tile.col_start,
                band,
            )?;
        }
    }
    sink.close()
}

/// File-level entry point: open the input, create the output raster,
/// classify every tile, then (optionally) recode background pixels from a
/// mask raster, replacing the unmasked output.
pub fn classify_raster(
    input: &Path,
    bands: Vec<usize>,
    output: &Path,
    backend: &PredictionBackend,
    params: PredictorParams,
    background_mask: Option<(&Path, f64)>,
) -> ClassResult<RunSummary> {
    let source = GdalSource::open(input)?;
    let assembler = FeatureAssembler::new(&source, bands)?;
    let predictor = Predictor::new(backend, params)?;
    let block_size = (
        predictor.params().block_rows,
        predictor.params().block_cols,
    );

    let info = predictor.output_info(source.info())?;
    // A resumed run must append into the existing output, not recreate it
    let mut sink = if predictor.params().resume && output.exists() {
        GdalSink::open_update(output)?
    } else {
        GdalSink::create(output, &info)?
    };
    let mut ledger = if predictor.params().resume {
        Some(RunLedger::load_or_create(RunLedger::sidecar_path(output))?)
    } else {
        None
    };
    let summary = predictor.classify(&source, &assembler, &mut sink, ledger.as_mut())?;
    drop(sink);

    if let Some((mask_path, threshold)) = background_mask {
        apply_background_mask(output, mask_path, threshold, block_size)?;
    }
    Ok(summary)
}

/// Full-raster background pass: recode masked / low-observation pixels to
/// the null class and replace the unmasked output with the cleaned copy
pub fn apply_background_mask(
    classified: &Path,
    mask: &Path,
    threshold: f64,
    block_size: (usize, usize),
) -> ClassResult<()> {
    let source = GdalSource::open(classified)?;
    let mask_source = GdalSource::open(mask)?;
    let staging = classified.with_extension("masked.tif");
    {
        let mut sink = GdalSink::create(&staging, source.info())?;
        recode_background(&source, &mask_source, &mut sink, threshold, block_size)?;
    }
    drop(source);
    std::fs::rename(&staging, classified)?;
    log::info!("Background mask applied to {}", classified.display());
    Ok(())
}
