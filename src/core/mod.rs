//! Core pipeline modules

pub mod expression;
pub mod flags;
pub mod stage;
pub mod graph;
pub mod merge;
pub mod cloud_buffer;
pub mod config;
pub mod snow_pipeline;

// Re-export main types
pub use expression::{BoundExpression, Expression, Namespace};
pub use flags::{FlagCoding, FlagDefinition, FlagRegistry, CLASSIF_BAND_NAME};
pub use stage::{
    BoundInputs, DelegatedStage, ExternalAlgorithm, ParamSet, ParamSpec, ParamValue, Stage,
    StageDescriptor, StageRegistry,
};
pub use graph::{
    InputBinding, PipelineGraph, PipelineRun, PipelineState, SourceProducts, StageOutputs,
    StageSpec, StageState,
};
pub use merge::{BandSelection, ProductMerger, SelectionPolicy};
pub use cloud_buffer::{CloudBuffer, CloudBufferParams, CloudBufferStage};
pub use config::{SnowPipelineConfig, VirtualBandSpec};
pub use snow_pipeline::{NamespacePlan, SnowAlgorithms, SnowPipeline};
