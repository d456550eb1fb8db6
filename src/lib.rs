//! snowpix: A Modular OLCI Snow/Ice Pixel Classification Pipeline
//!
//! Chains Sentinel-3 OLCI processing stages (radiance to reflectance, O2
//! corrected transmission, pixel classification, cloud buffer) in a validated
//! dependency graph and assembles one classified product, including virtual
//! bands computed per pixel from band-algebra formulas.

pub mod types;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    Band, BandSource, GeoCoding, GeoTransform, Mask, MetadataElement, MetadataValue, PixelType,
    Product, RasterData, SnowError, SnowResult, TiePointGrid,
};

pub use crate::core::{
    Expression, FlagRegistry, PipelineGraph, PipelineRun, ProductMerger, SelectionPolicy,
    SnowAlgorithms, SnowPipeline, SnowPipelineConfig, StageRegistry,
};
