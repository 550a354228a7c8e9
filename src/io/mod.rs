//! Raster access and run-state persistence

pub mod ledger;
pub mod raster;

pub use ledger::RunLedger;
pub use raster::{GdalSink, GdalSource, MemorySink, MemorySource, RasterSink, RasterSource};
