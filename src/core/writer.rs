use crate::core::block::Tile;
use crate::io::raster::{GdalSink, RasterSink};
use crate::types::{ClassError, ClassResult, LabelImage, ProbCube, RasterInfo, StorageType};
use std::path::{Path, PathBuf};

/// Finished result for one tile, already cropped to the core region
#[derive(Debug, Clone)]
pub enum TileOutput {
    /// Hard class codes (band 1 of the output)
    Labels(LabelImage),
    /// Per-class probability planes (one band per class, in class-index
    /// order)
    Probabilities(ProbCube),
}

impl TileOutput {
    pub fn bands(&self) -> usize {
        match self {
            TileOutput::Labels(_) => 1,
            TileOutput::Probabilities(cube) => cube.dim().0,
        }
    }

    fn core_shape(&self) -> (usize, usize) {
        match self {
            TileOutput::Labels(labels) => labels.dim(),
            TileOutput::Probabilities(cube) => (cube.dim().1, cube.dim().2),
        }
    }
}

fn check_core_shape(tile: &Tile, output: &TileOutput) -> ClassResult<()> {
    let (rows, cols) = output.core_shape();
    if rows != tile.core_rows || cols != tile.core_cols {
        return Err(ClassError::ShapeMismatch(format!(
            "Block {} output is {}x{} but core region is {}x{}",
            tile.sequence, rows, cols, tile.core_rows, tile.core_cols
        )));
    }
    Ok(())
}

fn write_into(
    sink: &mut dyn RasterSink,
    output: &TileOutput,
    row_offset: usize,
    col_offset: usize,
) -> ClassResult<()> {
    match output {
        TileOutput::Labels(labels) => {
            let plane = labels.mapv(|v| v as f64);
            sink.write_window(plane.view(), row_offset, col_offset, 1)?;
        }
        TileOutput::Probabilities(cube) => {
            for (class_index, plane) in cube.axis_iter(ndarray::Axis(0)).enumerate() {
                let plane = plane.mapv(|v| v as f64);
                sink.write_window(plane.view(), row_offset, col_offset, class_index + 1)?;
            }
        }
    }
    Ok(())
}

/// Commits finished tiles into one shared output raster
pub struct BlockWriter<'a> {
    sink: &'a mut dyn RasterSink,
    /// Global start offset of the planned sub-extent; core offsets are
    /// shifted by this before writing
    row_origin: usize,
    col_origin: usize,
}

impl<'a> BlockWriter<'a> {
    pub fn new(sink: &'a mut dyn RasterSink, row_origin: usize, col_origin: usize) -> Self {
        Self {
            sink,
            row_origin,
            col_origin,
        }
    }

    pub fn write(&mut self, tile: &Tile, output: &TileOutput) -> ClassResult<()> {
        check_core_shape(tile, output)?;
        write_into(
            self.sink,
            output,
            tile.row_start - self.row_origin,
            tile.col_start - self.col_origin,
        )
    }

    pub fn close(&mut self) -> ClassResult<()> {
        self.sink.close()
    }
}

/// Output path for one block: `{base}_{00001..N}{ext}`, sequence numbers
/// 1-based in tile order
pub fn block_path(base: &Path, sequence: u64) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = base
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let name = format!("{}_{:05}{}", stem, sequence, ext);
    match base.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Writes each tile to its own raster file, for workflows that merge or
/// post-process blocks externally. Resumability comes for free from the
/// file-exists check.
pub struct PerBlockWriter {
    base: PathBuf,
    image_info: RasterInfo,
    storage_type: StorageType,
    overwrite: bool,
}

impl PerBlockWriter {
    pub fn new(base: PathBuf, image_info: RasterInfo, storage_type: StorageType) -> Self {
        Self {
            base,
            image_info,
            storage_type,
            overwrite: false,
        }
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// True when this block's file already exists and would be kept
    /// (non-overwrite skip). Checked by the orchestrator before any tile
    /// work starts.
    pub fn is_written(&self, sequence: u64) -> bool {
        !self.overwrite && block_path(&self.base, sequence).exists()
    }

    /// Write one tile to its own file. Returns false when an existing
    /// file was kept (non-overwrite skip).
    pub fn write(&mut self, tile: &Tile, output: &TileOutput) -> ClassResult<bool> {
        check_core_shape(tile, output)?;
        let path = block_path(&self.base, tile.sequence);
        if self.is_written(tile.sequence) {
            log::info!(
                "Block {} output {} already exists, skipping",
                tile.sequence,
                path.display()
            );
            return Ok(false);
        }

        let info = self.image_info.window_descriptor(
            tile.row_start,
            tile.col_start,
            tile.core_rows,
            tile.core_cols,
            output.bands(),
            self.storage_type,
        );
        let mut sink = GdalSink::create(&path, &info)?;
        write_into(&mut sink, output, 0, 0)?;
        sink.close()?;
        Ok(true)
    }
}
