use landclass::core::{classify_raster, Model, ModelFamily, PerBlockWriter};
use landclass::{
    ClassResult, FeatureAssembler, GdalSink, GdalSource, PredictionBackend, Predictor,
    PredictorParams, RasterSink, RasterSource, StorageType,
};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Classes [3, 8]: class 8 above the value threshold, class 3 below
struct ThresholdModel;

impl Model for ThresholdModel {
    fn predict(&self, features: ArrayView2<f64>) -> ClassResult<landclass::LabelVector> {
        Ok(features
            .axis_iter(Axis(0))
            .map(|row| if row[0] > 10.0 { 8.0 } else { 3.0 })
            .collect::<Array1<f32>>())
    }

    fn classes(&self) -> &[i32] {
        &[3, 8]
    }

    fn n_features(&self) -> Option<usize> {
        Some(1)
    }
}

/// Write a 10x10 single-band float GTiff: value 5 in the left half,
/// value 20 in the right half
fn write_input(path: &Path) {
    let info = landclass::RasterInfo {
        rows: 10,
        cols: 10,
        bands: 1,
        geo_transform: landclass::GeoTransform::default(),
        storage_type: StorageType::F32,
        no_data: None,
        epsg: None,
    };
    let mut sink = GdalSink::create(path, &info).expect("Failed to create input raster");
    let plane = Array2::from_shape_fn((10, 10), |(_, c)| if c < 5 { 5.0 } else { 20.0 });
    sink.write_window(plane.view(), 0, 0, 1).expect("Failed to write input");
    sink.close().expect("Failed to flush input");
}

#[test]
fn test_classify_raster_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().expect("Failed to create temp directory");
    let input = dir.path().join("scene.tif");
    let output = dir.path().join("classified.tif");
    write_input(&input);

    let backend = PredictionBackend::new(ModelFamily::TreeEnsemble, Box::new(ThresholdModel));
    let params = PredictorParams {
        block_rows: 6,
        block_cols: 6,
        ..PredictorParams::default()
    };
    let summary = classify_raster(&input, vec![1], &output, &backend, params, None)
        .expect("Classification failed");
    assert_eq!(summary.processed, 4);

    let result = GdalSource::open(&output).expect("Failed to open output");
    assert_eq!(result.info().bands, 1);
    assert_eq!(result.info().storage_type, StorageType::U8);
    let map = result.read_window(&[1], 0, 0, 10, 10).expect("Failed to read output");
    assert_eq!(map[[0, 0, 0]], 3.0);
    assert_eq!(map[[0, 9, 9]], 8.0);
}

#[test]
fn test_resume_skips_completed_blocks_and_keeps_output() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let input = dir.path().join("scene.tif");
    let output = dir.path().join("classified.tif");
    write_input(&input);

    let backend = PredictionBackend::new(ModelFamily::TreeEnsemble, Box::new(ThresholdModel));
    let params = PredictorParams {
        block_rows: 6,
        block_cols: 6,
        resume: true,
        ..PredictorParams::default()
    };
    let first = classify_raster(&input, vec![1], &output, &backend, params.clone(), None)
        .expect("First run failed");
    assert_eq!(first.processed, 4);
    let first_bytes = std::fs::read(&output).expect("Failed to read output");

    let second = classify_raster(&input, vec![1], &output, &backend, params, None)
        .expect("Second run failed");
    assert_eq!(second.processed, 0);
    assert_eq!(second.skipped, 4);
    // Re-running over the same ledger rewrites nothing, so the map is
    // byte-identical
    let second_bytes = std::fs::read(&output).expect("Failed to re-read output");
    assert_eq!(first_bytes, second_bytes);
}

#[test]
fn test_per_block_mode_with_block_range() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let input = dir.path().join("scene.tif");
    write_input(&input);

    let source = GdalSource::open(&input).expect("Failed to open input");
    let assembler = FeatureAssembler::new(&source, vec![1]).expect("Failed to build assembler");
    let backend = PredictionBackend::new(ModelFamily::TreeEnsemble, Box::new(ThresholdModel));
    let params = PredictorParams {
        block_rows: 6,
        block_cols: 6,
        block_range: Some((2, 3)),
        ..PredictorParams::default()
    };
    let predictor = Predictor::new(&backend, params).expect("Failed to build predictor");

    let base = dir.path().join("blocks.tif");
    let mut writer = PerBlockWriter::new(
        base.clone(),
        source.info().clone(),
        predictor.output_storage_type(),
    );
    let summary = predictor
        .classify_per_block(&source, &assembler, &mut writer)
        .expect("Per-block run failed");

    assert_eq!(summary.processed, 2);
    assert!(!dir.path().join("blocks_00001.tif").exists());
    assert!(dir.path().join("blocks_00002.tif").exists());
    assert!(dir.path().join("blocks_00003.tif").exists());
    assert!(!dir.path().join("blocks_00004.tif").exists());

    // Block 2 is the top-right tile: 6 rows, 4 cols, all above threshold
    let block = GdalSource::open(dir.path().join("blocks_00002.tif"))
        .expect("Failed to open block raster");
    assert_eq!(block.info().rows, 6);
    assert_eq!(block.info().cols, 4);
    let map = block.read_window(&[1], 0, 0, 6, 4).expect("Failed to read block");
    assert!(map.iter().all(|&v| v == 8.0));

    // A re-run skips the existing block files
    let rerun = predictor
        .classify_per_block(&source, &assembler, &mut writer)
        .expect("Per-block re-run failed");
    assert_eq!(rerun.processed, 0);
    assert_eq!(rerun.skipped, 2);
}

/// ThresholdModel wrapper that counts how many times predict runs
struct CountingModel {
    calls: Arc<AtomicUsize>,
}

impl Model for CountingModel {
    fn predict(&self, features: ArrayView2<f64>) -> ClassResult<landclass::LabelVector> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ThresholdModel.predict(features)
    }

    fn classes(&self) -> &[i32] {
        &[3, 8]
    }

    fn n_features(&self) -> Option<usize> {
        Some(1)
    }
}

#[test]
fn test_per_block_rerun_does_not_repredict_existing_blocks() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let input = dir.path().join("scene.tif");
    write_input(&input);

    let source = GdalSource::open(&input).expect("Failed to open input");
    let assembler = FeatureAssembler::new(&source, vec![1]).expect("Failed to build assembler");
    let calls = Arc::new(AtomicUsize::new(0));
    let backend = PredictionBackend::new(
        ModelFamily::TreeEnsemble,
        Box::new(CountingModel { calls: calls.clone() }),
    );
    let params = PredictorParams {
        block_rows: 6,
        block_cols: 6,
        ..PredictorParams::default()
    };
    let predictor = Predictor::new(&backend, params).expect("Failed to build predictor");

    let base = dir.path().join("blocks.tif");
    let mut writer = PerBlockWriter::new(
        base.clone(),
        source.info().clone(),
        predictor.output_storage_type(),
    );
    let first = predictor
        .classify_per_block(&source, &assembler, &mut writer)
        .expect("Per-block run failed");
    assert_eq!(first.processed, 4);
    let predictions_after_first = calls.load(Ordering::SeqCst);
    assert!(predictions_after_first >= 4);

    // Completed blocks are skipped before feature assembly and
    // prediction, so a resumed run predicts nothing
    let rerun = predictor
        .classify_per_block(&source, &assembler, &mut writer)
        .expect("Per-block re-run failed");
    assert_eq!(rerun.processed, 0);
    assert_eq!(rerun.skipped, 4);
    assert_eq!(calls.load(Ordering::SeqCst), predictions_after_first);
}

#[test]
fn test_background_mask_pass() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let input = dir.path().join("scene.tif");
    let output = dir.path().join("classified.tif");
    let mask = dir.path().join("observations.tif");
    write_input(&input);

    // Observation-count mask: zero in the top row
    let info = landclass::RasterInfo {
        rows: 10,
        cols: 10,
        bands: 1,
        geo_transform: landclass::GeoTransform::default(),
        storage_type: StorageType::I32,
        no_data: None,
        epsg: None,
    };
    let mut sink = GdalSink::create(&mask, &info).expect("Failed to create mask");
    let counts = Array2::from_shape_fn((10, 10), |(r, _)| if r == 0 { 0.0 } else { 12.0 });
    sink.write_window(counts.view(), 0, 0, 1).expect("Failed to write mask");
    sink.close().expect("Failed to flush mask");

    let backend = PredictionBackend::new(ModelFamily::TreeEnsemble, Box::new(ThresholdModel));
    let params = PredictorParams {
        block_rows: 6,
        block_cols: 6,
        ..PredictorParams::default()
    };
    classify_raster(&input, vec![1], &output, &backend, params, Some((mask.as_path(), 0.0)))
        .expect("Masked classification failed");

    let result = GdalSource::open(&output).expect("Failed to open output");
    let map = result.read_window(&[1], 0, 0, 10, 10).expect("Failed to read output");
    assert!(map.index_axis(Axis(0), 0).row(0).iter().all(|&v| v == 0.0));
    assert_eq!(map[[0, 5, 0]], 3.0);
    assert_eq!(map[[0, 5, 9]], 8.0);
}
