use crate::types::{ClassError, ClassResult, GeoTransform, RasterInfo, StorageType};
use gdal::raster::{Buffer, GdalDataType, GdalType};
use gdal::{Dataset, DriverManager};
use ndarray::{Array2, Array3, ArrayView2};
use num_traits::NumCast;
use std::path::{Path, PathBuf};

/// Windowed read access to a multi-band raster.
///
/// Band indices are 1-based, following the GDAL convention. The prediction
/// pipeline is written against this trait so unit tests can run on in-memory
/// rasters while production runs go through GDAL.
pub trait RasterSource {
    fn info(&self) -> &RasterInfo;

    /// Read a window of the given bands as (band x rows x cols), cast to f64
    fn read_window(
        &self,
        bands: &[usize],
        row_offset: usize,
        col_offset: usize,
        rows: usize,
        cols: usize,
    ) -> ClassResult<Array3<f64>>;
}

/// Windowed write access to an output raster
pub trait RasterSink {
    fn info(&self) -> &RasterInfo;

    /// Write one band's window at (row_offset, col_offset); band is 1-based
    fn write_window(
        &mut self,
        data: ArrayView2<f64>,
        row_offset: usize,
        col_offset: usize,
        band: usize,
    ) -> ClassResult<()>;

    /// Flush pending writes; called once after the last block
    fn close(&mut self) -> ClassResult<()> {
        Ok(())
    }
}

/// GDAL-backed raster reader
pub struct GdalSource {
    dataset: Dataset,
    info: RasterInfo,
}

impl GdalSource {
    pub fn open<P: AsRef<Path>>(path: P) -> ClassResult<Self> {
        log::debug!("Opening raster: {}", path.as_ref().display());
        let dataset = Dataset::open(path.as_ref())?;
        let (cols, rows) = dataset.raster_size();
        let bands = dataset.raster_count() as usize;
        let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?);

        let first_band = dataset.rasterband(1)?;
        let storage_type = match first_band.band_type() {
            GdalDataType::UInt8 => StorageType::U8,
            GdalDataType::Int16 => StorageType::I16,
            GdalDataType::UInt16 => StorageType::U16,
            GdalDataType::Int32 => StorageType::I32,
            GdalDataType::Float32 => StorageType::F32,
            _ => StorageType::F64,
        };
        let no_data = first_band.no_data_value();
        let epsg = dataset
            .spatial_ref()
            .ok()
            .and_then(|sr| sr.auth_code().ok())
            .map(|code| code as u32);

        Ok(Self {
            dataset,
            info: RasterInfo {
                rows,
                cols,
                bands,
                geo_transform,
                storage_type,
                no_data,
                epsg,
            },
        })
    }
}

impl RasterSource for GdalSource {
    fn info(&self) -> &RasterInfo {
        &self.info
    }

    fn read_window(
        &self,
        bands: &[usize],
        row_offset: usize,
        col_offset: usize,
        rows: usize,
        cols: usize,
    ) -> ClassResult<Array3<f64>> {
        let mut window = Array3::zeros((bands.len(), rows, cols));
        for (i, &band) in bands.iter().enumerate() {
            if band == 0 || band > self.info.bands {
                return Err(ClassError::Configuration(format!(
                    "Band {} out of range (raster has {} bands)",
                    band, self.info.bands
                )));
            }
            let rasterband = self.dataset.rasterband(band as isize)?;
            let buffer = rasterband.read_as::<f64>(
                (col_offset as isize, row_offset as isize),
                (cols, rows),
                (cols, rows),
                None,
            )?;
            let plane = Array2::from_shape_vec((rows, cols), buffer.data).map_err(|e| {
                ClassError::Processing(format!("Failed to reshape band {} window: {}", band, e))
            })?;
            window.index_axis_mut(ndarray::Axis(0), i).assign(&plane);
        }
        Ok(window)
    }
}

/// GDAL-backed raster writer (GTiff)
pub struct GdalSink {
    dataset: Dataset,
    info: RasterInfo,
    path: PathBuf,
}

impl GdalSink {
    /// Create a new GTiff output raster from a descriptor
    pub fn create<P: AsRef<Path>>(path: P, info: &RasterInfo) -> ClassResult<Self> {
        log::info!(
            "Creating output raster: {} ({}x{}x{}, {})",
            path.as_ref().display(),
            info.rows,
            info.cols,
            info.bands,
            info.storage_type
        );

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let dataset = match info.storage_type {
            StorageType::U8 => Self::create_typed::<u8, _>(&driver, path.as_ref(), info)?,
            StorageType::I16 => Self::create_typed::<i16, _>(&driver, path.as_ref(), info)?,
            StorageType::U16 => Self::create_typed::<u16, _>(&driver, path.as_ref(), info)?,
            StorageType::I32 => Self::create_typed::<i32, _>(&driver, path.as_ref(), info)?,
            StorageType::F32 => Self::create_typed::<f32, _>(&driver, path.as_ref(), info)?,
            StorageType::F64 => Self::create_typed::<f64, _>(&driver, path.as_ref(), info)?,
        };

        Ok(Self {
            dataset,
            info: info.clone(),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Reopen an existing output raster for update (resumed runs must not
    /// truncate blocks written by a previous run)
    pub fn open_update<P: AsRef<Path>>(path: P) -> ClassResult<Self> {
        log::info!("Reopening output raster for update: {}", path.as_ref().display());
        let dataset = Dataset::open_ex(
            path.as_ref(),
            gdal::DatasetOptions {
                open_flags: gdal::GdalOpenFlags::GDAL_OF_UPDATE,
                ..Default::default()
            },
        )?;
        let (cols, rows) = dataset.raster_size();
        let bands = dataset.raster_count() as usize;
        let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let first_band = dataset.rasterband(1)?;
        let storage_type = match first_band.band_type() {
            GdalDataType::UInt8 => StorageType::U8,
            GdalDataType::Int16 => StorageType::I16,
            GdalDataType::UInt16 => StorageType::U16,
            GdalDataType::Int32 => StorageType::I32,
            GdalDataType::Float32 => StorageType::F32,
            _ => StorageType::F64,
        };
        let no_data = first_band.no_data_value();
        let info = RasterInfo {
            rows,
            cols,
            bands,
            geo_transform,
            storage_type,
            no_data,
            epsg: None,
        };
        Ok(Self {
            dataset,
            info,
            path: path.as_ref().to_path_buf(),
        })
    }

    fn create_typed<T: GdalType, P: AsRef<Path>>(
        driver: &gdal::Driver,
        path: P,
        info: &RasterInfo,
    ) -> ClassResult<Dataset> {
        let mut dataset = driver.create_with_band_type::<T, _>(
            path.as_ref(),
            info.cols as isize,
            info.rows as isize,
            info.bands as isize,
        )?;
        dataset.set_geo_transform(&info.geo_transform.to_gdal())?;
        if let Some(epsg) = info.epsg {
            dataset.set_spatial_ref(&gdal::spatial_ref::SpatialRef::from_epsg(epsg)?)?;
        }
        if let Some(no_data) = info.no_data {
            for band in 1..=info.bands {
                let mut rasterband = dataset.rasterband(band as isize)?;
                rasterband.set_no_data_value(Some(no_data))?;
            }
        }
        Ok(dataset)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_typed<T: GdalType + Copy + NumCast + Default>(
        &mut self,
        data: ArrayView2<f64>,
        row_offset: usize,
        col_offset: usize,
        band: usize,
    ) -> ClassResult<()> {
        let (rows, cols) = data.dim();
        let flat: Vec<T> = data
            .iter()
            .map(|&v| NumCast::from(v).unwrap_or_default())
            .collect();
        let buffer = Buffer::new((cols, rows), flat);
        let mut rasterband = self.dataset.rasterband(band as isize)?;
        rasterband.write((col_offset as isize, row_offset as isize), (cols, rows), &buffer)?;
        Ok(())
    }
}

impl RasterSink for GdalSink {
    fn info(&self) -> &RasterInfo {
        &self.info
    }

    fn write_window(
        &mut self,
        data: ArrayView2<f64>,
        row_offset: usize,
        col_offset: usize,
        band: usize,
    ) -> ClassResult<()> {
        match self.info.storage_type {
            StorageType::U8 => self.write_typed::<u8>(data, row_offset, col_offset, band),
            StorageType::I16 => self.write_typed::<i16>(data, row_offset, col_offset, band),
            StorageType::U16 => self.write_typed::<u16>(data, row_offset, col_offset, band),
            StorageType::I32 => self.write_typed::<i32>(data, row_offset, col_offset, band),
            StorageType::F32 => self.write_typed::<f32>(data, row_offset, col_offset, band),
            StorageType::F64 => self.write_typed::<f64>(data, row_offset, col_offset, band),
        }
    }

    fn close(&mut self) -> ClassResult<()> {
        self.dataset.flush_cache();
        Ok(())
    }
}

/// In-memory raster reader used by tests and small workflows
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Array3<f64>,
    info: RasterInfo,
}

impl MemorySource {
    /// Wrap a (bands x rows x cols) array with a default geotransform
    pub fn new(data: Array3<f64>) -> Self {
        let (bands, rows, cols) = data.dim();
        let info = RasterInfo {
            rows,
            cols,
            bands,
            geo_transform: GeoTransform::default(),
            storage_type: StorageType::F64,
            no_data: None,
            epsg: None,
        };
        Self { data, info }
    }

    pub fn with_geo_transform(mut self, geo_transform: GeoTransform) -> Self {
        self.info.geo_transform = geo_transform;
        self
    }
}

impl RasterSource for MemorySource {
    fn info(&self) -> &RasterInfo {
        &self.info
    }

    fn read_window(
        &self,
        bands: &[usize],
        row_offset: usize,
        col_offset: usize,
        rows: usize,
        cols: usize,
    ) -> ClassResult<Array3<f64>> {
        if row_offset + rows > self.info.rows || col_offset + cols > self.info.cols {
            return Err(ClassError::Configuration(format!(
                "Window {}x{} at ({}, {}) exceeds raster {}x{}",
                rows, cols, row_offset, col_offset, self.info.rows, self.info.cols
            )));
        }
        let mut window = Array3::zeros((bands.len(), rows, cols));
        for (i, &band) in bands.iter().enumerate() {
            if band == 0 || band > self.info.bands {
                return Err(ClassError::Configuration(format!(
                    "Band {} out of range (raster has {} bands)",
                    band, self.info.bands
                )));
            }
            let plane = self.data.slice(ndarray::s![
                band - 1,
                row_offset..row_offset + rows,
                col_offset..col_offset + cols
            ]);
            window.index_axis_mut(ndarray::Axis(0), i).assign(&plane);
        }
        Ok(window)
    }
}

/// In-memory raster writer used by tests
#[derive(Debug, Clone)]
pub struct MemorySink {
    data: Array3<f64>,
    info: RasterInfo,
}

impl MemorySink {
    pub fn create(info: &RasterInfo) -> Self {
        Self {
            data: Array3::zeros((info.bands, info.rows, info.cols)),
            info: info.clone(),
        }
    }

    /// Finished plane for one 1-based band
    pub fn band(&self, band: usize) -> ArrayView2<'_, f64> {
        self.data.index_axis(ndarray::Axis(0), band - 1)
    }
}

impl RasterSink for MemorySink {
    fn info(&self) -> &RasterInfo {
        &self.info
    }

    fn write_window(
        &mut self,
        data: ArrayView2<f64>,
        row_offset: usize,
        col_offset: usize,
        band: usize,
    ) -> ClassResult<()> {
        let (rows, cols) = data.dim();
        if row_offset + rows > self.info.rows || col_offset + cols > self.info.cols {
            return Err(ClassError::Configuration(format!(
                "Write window {}x{} at ({}, {}) exceeds raster {}x{}",
                rows, cols, row_offset, col_offset, self.info.rows, self.info.cols
            )));
        }
        self.data
            .slice_mut(ndarray::s![
                band - 1,
                row_offset..row_offset + rows,
                col_offset..col_offset + cols
            ])
            .assign(&data);
        Ok(())
    }
}
