//! OLCI snow/ice pixel classification pipeline.
//!
//! Chains radiance-to-reflectance conversion, optional O2 correction,
//! pixel classification and cloud-buffer post-processing, then assembles one
//! `<source>_IDEPIX` product with the derived `surface_pressure` and
//! `cloud_over_snow` virtual bands.
//!
//! Every static contract is checked in [`SnowPipeline::build`]: the
//! configuration, the source products, the stage graph and a namespace plan
//! of the final product against which every formula is bound before any
//! stage runs.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::core::cloud_buffer::{CloudBufferStage, POSTPROCESS_STAGE_ID};
use crate::core::config::{
    radiance_band_names, reflectance_band_names, SnowPipelineConfig, VirtualBandSpec,
    ALTITUDE_BAND_NAME, NN_VALUE_BAND_NAME, PRESS_13_BAND_NAME, SURFACE_13_BAND_NAME,
    TRANS_13_BAND_NAME,
};
use crate::core::expression::{Expression, Namespace};
use crate::core::flags::{
    classification_flag_coding, classification_masks, setup_classification_bitmask, FlagCoding,
    FlagRegistry, CLASSIF_BAND_NAME,
};
use crate::core::graph::{PipelineGraph, PipelineRun, SourceProducts, StageOutputs, StageSpec};
use crate::core::merge::{ProductMerger, SelectionPolicy};
use crate::core::stage::{
    ExternalAlgorithm, ParamKind, ParamSpec, Stage, StageDescriptor, StageRegistry,
};
use crate::types::{Band, Product, SnowError, SnowResult};

pub const RAD2REFL_STAGE_ID: &str = "rad2refl";
pub const O2CORR_STAGE_ID: &str = "o2corr";
pub const CLASSIFICATION_STAGE_ID: &str = "classification";

/// Source slot of the L1b product
pub const L1B_SOURCE: &str = "l1b";
/// Source slot of the optional DEM product
pub const DEM_SOURCE: &str = "dem";

pub const SURFACE_PRESSURE_BAND_NAME: &str = "surface_pressure";
pub const CLOUD_OVER_SNOW_BAND_NAME: &str = "cloud_over_snow";

const TARGET_SUFFIX: &str = "_IDEPIX";
const AUTO_GROUPING: &str = "Oa*_radiance:Oa*_reflectance";

/// External algorithms the pipeline delegates to
#[derive(Clone)]
pub struct SnowAlgorithms {
    pub reflectance: Arc<dyn ExternalAlgorithm>,
    pub o2_correction: Arc<dyn ExternalAlgorithm>,
    pub classification: Arc<dyn ExternalAlgorithm>,
}

pub fn rad2refl_descriptor() -> StageDescriptor {
    let mut descriptor = StageDescriptor::new(
        RAD2REFL_STAGE_ID,
        "Conversion of TOA radiances to TOA reflectances",
    )
    .required_slot("source", "L1b product with OaNN_radiance bands")
    .param(ParamSpec::with_default("sensor", "OLCI", "Sensor of the source product"));
    for name in reflectance_band_names() {
        descriptor = descriptor.output_band(name);
    }
    descriptor
}

pub fn o2corr_descriptor() -> StageDescriptor {
    StageDescriptor::new(O2CORR_STAGE_ID, "O2 corrected transmission at band 13")
        .required_slot("l1b", "L1b product")
        .optional_slot("dem", "DEM product")
        .param(ParamSpec::optional(
            "dem_altitude_band_name",
            ParamKind::Text,
            "Altitude band of the DEM product",
        ))
        .output_band(TRANS_13_BAND_NAME)
        .output_band(PRESS_13_BAND_NAME)
        .output_band(SURFACE_13_BAND_NAME)
}

pub fn classification_descriptor() -> StageDescriptor {
    StageDescriptor::new(CLASSIFICATION_STAGE_ID, "OLCI snow/ice pixel classification")
        .required_slot("l1b", "L1b product")
        .required_slot("rhotoa", "TOA reflectance product")
        .param(ParamSpec::with_default("copy_all_tie_points", true, "Copy all tie point grids"))
        .param(ParamSpec::with_default(
            "output_nn_value",
            false,
            "Write the neural network value band",
        ))
        .output_band(CLASSIF_BAND_NAME)
        .output_band_when(NN_VALUE_BAND_NAME, "output_nn_value")
}

/// Registry of the four stage kinds used by the snow pipeline
pub fn stage_registry(algorithms: &SnowAlgorithms) -> StageRegistry {
    let mut registry = StageRegistry::new();
    registry.register_delegated(rad2refl_descriptor(), Arc::clone(&algorithms.reflectance));
    registry.register_delegated(o2corr_descriptor(), Arc::clone(&algorithms.o2_correction));
    registry.register_delegated(
        classification_descriptor(),
        Arc::clone(&algorithms.classification),
    );
    registry.register(POSTPROCESS_STAGE_ID, || {
        Box::new(CloudBufferStage::new()) as Box<dyn Stage>
    });
    registry
}

/// Estimated surface pressure from altitude
pub fn surface_pressure_spec() -> VirtualBandSpec {
    VirtualBandSpec::new(SURFACE_PRESSURE_BAND_NAME, "(1013.25 * exp(-altitude/8400))")
        .with_unit("hPa")
        .with_description("estimated sea level pressure (p0=1013.25hPa, hScale=8.4km)")
        .with_no_data(0.0)
}

/// Likely cloud over a snow/ice surface
pub fn cloud_over_snow_spec() -> VirtualBandSpec {
    VirtualBandSpec::new(
        CLOUD_OVER_SNOW_BAND_NAME,
        "pixel_classif_flags.IDEPIX_LAND && Oa21_reflectance > 0.5 && surface_13 - trans_13 < 0.01",
    )
    .with_unit("dl")
    .with_description("Pixel identified as likely cloud over a snow/ice surface")
    .with_no_data(0.0)
}

/// Band and flag names the assembled product will expose
#[derive(Debug, Clone, Default)]
pub struct NamespacePlan {
    bands: Vec<String>,
    flags: FlagRegistry,
}

impl NamespacePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_band(&mut self, name: impl Into<String>) -> SnowResult<()> {
        let name = name.into();
        if self.bands.contains(&name) {
            return Err(SnowError::Definition(format!(
                "band '{}' would be defined twice in the target product",
                name
            )));
        }
        self.bands.push(name);
        Ok(())
    }

    pub fn add_flag_band(&mut self, name: impl Into<String>, coding: &FlagCoding) -> SnowResult<()> {
        let name = name.into();
        self.flags.compose_coding(&name, coding)?;
        self.add_band(name)
    }

    pub fn bands(&self) -> &[String] {
        &self.bands
    }

    /// Check a virtual band's formula and reserve its name
    pub fn plan_virtual_band(&mut self, spec: &VirtualBandSpec) -> SnowResult<()> {
        let expression = parse_for_band(spec)?;
        expression
            .check_names(self)
            .map_err(|e| with_band_context(&spec.name, e))?;
        self.add_band(spec.name.clone())
    }
}

impl Namespace for NamespacePlan {
    fn contains_band(&self, name: &str) -> bool {
        self.bands.iter().any(|b| b == name)
    }

    fn contains_flag(&self, band: &str, flag: &str) -> bool {
        self.flags.flag_mask(band, flag).is_some()
    }

    fn is_flag_band(&self, band: &str) -> bool {
        self.flags.contains_band(band)
    }
}

fn parse_for_band(spec: &VirtualBandSpec) -> SnowResult<Expression> {
    Expression::parse(&spec.expression).map_err(|e| with_band_context(&spec.name, e))
}

fn with_band_context(band: &str, err: SnowError) -> SnowError {
    match err {
        SnowError::Definition(msg) => {
            SnowError::Definition(format!("virtual band '{}': {}", band, msg))
        }
        other => other,
    }
}

/// Add a virtual band, binding its formula against the product's bands
pub fn add_virtual_band(product: &mut Product, spec: &VirtualBandSpec) -> SnowResult<()> {
    let bound = parse_for_band(spec)?
        .bind(product)
        .map_err(|e| with_band_context(&spec.name, e))?;
    let mut band = Band::virtual_band(spec.name.clone(), spec.pixel_type, bound);
    band.unit = spec.unit.clone();
    band.description = spec.description.clone();
    if let Some(no_data) = spec.no_data_value {
        band = band.with_no_data(no_data);
    }
    log::debug!("Adding virtual band '{}' = {}", spec.name, spec.expression);
    product.add_band(band)
}

/// Validated snow pipeline, ready to run
pub struct SnowPipeline {
    config: SnowPipelineConfig,
    graph: PipelineGraph,
    sources: SourceProducts,
    virtual_bands: Vec<VirtualBandSpec>,
    plan: NamespacePlan,
}

impl SnowPipeline {
    /// Check every static contract and prepare the stage graph.
    ///
    /// Nothing is computed here; all failures surface before any stage runs.
    pub fn build(
        config: SnowPipelineConfig,
        algorithms: &SnowAlgorithms,
        source: Product,
        dem: Option<Product>,
    ) -> SnowResult<Self> {
        config.validate()?;
        validate_source(&config, &source)?;

        let dem = match dem {
            Some(dem) if config.apply_o2_corrected_transmission => {
                validate_dem(&config, &source, &dem)?;
                Some(dem)
            }
            Some(dem) => {
                log::warn!(
                    "DEM product '{}' ignored: O2 corrected transmission is disabled",
                    dem.name
                );
                None
            }
            None => None,
        };

        log::info!(
            "Building snow pipeline for '{}' ({}x{})",
            source.name,
            source.width(),
            source.height()
        );

        let mut sources = SourceProducts::new();
        let has_dem = dem.is_some();
        sources.insert(L1B_SOURCE.to_string(), source);
        if let Some(dem) = dem {
            sources.insert(DEM_SOURCE.to_string(), dem);
        }

        let mut graph = build_graph(&config, algorithms, has_dem)?;
        graph.validate(&sources)?;

        let mut virtual_bands = Vec::new();
        if config.apply_o2_corrected_transmission {
            virtual_bands.push(surface_pressure_spec());
            virtual_bands.push(cloud_over_snow_spec());
        }
        virtual_bands.extend(config.extra_virtual_bands.iter().cloned());

        let plan = plan_namespace(&config, &graph, &sources, &virtual_bands)?;
        log::debug!("Planned target bands: {}", plan.bands().join(", "));

        Ok(Self {
            config,
            graph,
            sources,
            virtual_bands,
            plan,
        })
    }

    pub fn config(&self) -> &SnowPipelineConfig {
        &self.config
    }

    /// Band names of the final product, in order
    pub fn planned_bands(&self) -> &[String] {
        self.plan.bands()
    }

    /// Stage ids in the order they will run
    pub fn execution_order(&self) -> Vec<&str> {
        self.graph.execution_order()
    }

    /// Run all stages and assemble the final product
    pub fn run(self) -> SnowResult<PipelineRun> {
        let SnowPipeline {
            config,
            graph,
            sources,
            virtual_bands,
            ..
        } = self;
        graph.run(&sources, |outputs| {
            assemble(&config, &sources, &virtual_bands, outputs)
        })
    }
}

fn validate_source(config: &SnowPipelineConfig, source: &Product) -> SnowResult<()> {
    let missing: Vec<String> = radiance_band_names()
        .into_iter()
        .filter(|name| !source.contains_band(name))
        .collect();
    if !missing.is_empty() {
        return Err(SnowError::InputValidation(format!(
            "source product '{}' is not a valid OLCI L1b product, missing: {}",
            source.name,
            missing.join(", ")
        )));
    }
    if config.apply_o2_corrected_transmission && !source.contains_band(ALTITUDE_BAND_NAME) {
        return Err(SnowError::InputValidation(format!(
            "source product '{}' has no '{}' band required for O2 correction",
            source.name, ALTITUDE_BAND_NAME
        )));
    }
    Ok(())
}

fn validate_dem(config: &SnowPipelineConfig, source: &Product, dem: &Product) -> SnowResult<()> {
    if dem.raster_size() != source.raster_size() {
        return Err(SnowError::InputValidation(format!(
            "DEM product '{}' is {}x{} but source '{}' is {}x{}",
            dem.name,
            dem.width(),
            dem.height(),
            source.name,
            source.width(),
            source.height()
        )));
    }
    if !dem.contains_band(&config.dem_band_name) {
        return Err(SnowError::InputValidation(format!(
            "DEM product '{}' has no band '{}'",
            dem.name, config.dem_band_name
        )));
    }
    Ok(())
}

fn build_graph(
    config: &SnowPipelineConfig,
    algorithms: &SnowAlgorithms,
    has_dem: bool,
) -> SnowResult<PipelineGraph> {
    let mut graph = PipelineGraph::new(stage_registry(algorithms));
    graph.declare_source(L1B_SOURCE, true)?;
    graph.declare_source(DEM_SOURCE, false)?;

    graph.add_stage(
        StageSpec::new(RAD2REFL_STAGE_ID, RAD2REFL_STAGE_ID)
            .bind_source("source", L1B_SOURCE)
            .param("sensor", "OLCI"),
    )?;

    let mut o2corr = StageSpec::new(O2CORR_STAGE_ID, O2CORR_STAGE_ID)
        .bind_source("l1b", L1B_SOURCE)
        .bind_source("dem", DEM_SOURCE)
        .optional(config.apply_o2_corrected_transmission);
    if has_dem {
        o2corr = o2corr.param("dem_altitude_band_name", config.dem_band_name.clone());
    }
    graph.add_stage(o2corr)?;

    graph.add_stage(
        StageSpec::new(CLASSIFICATION_STAGE_ID, CLASSIFICATION_STAGE_ID)
            .bind_source("l1b", L1B_SOURCE)
            .bind_stage("rhotoa", RAD2REFL_STAGE_ID)
            .param("copy_all_tie_points", true)
            .param("output_nn_value", config.output_nn_value),
    )?;

    graph.add_stage(
        StageSpec::new(POSTPROCESS_STAGE_ID, POSTPROCESS_STAGE_ID)
            .bind_source("l1b", L1B_SOURCE)
            .bind_stage("classification", CLASSIFICATION_STAGE_ID)
            .param("compute_cloud_buffer", config.compute_cloud_buffer)
            .param("cloud_buffer_width", config.cloud_buffer_width)
            .optional(config.compute_cloud_buffer),
    )?;

    Ok(graph)
}

fn planned_stage_bands(graph: &PipelineGraph, stage: &str) -> SnowResult<Vec<String>> {
    graph.planned_outputs(stage).ok_or_else(|| {
        SnowError::GraphValidation(format!("stage '{}' is not part of the pipeline", stage))
    })
}

fn plan_namespace(
    config: &SnowPipelineConfig,
    graph: &PipelineGraph,
    sources: &SourceProducts,
    virtual_bands: &[VirtualBandSpec],
) -> SnowResult<NamespacePlan> {
    let source = source_product(sources)?;
    let mut plan = NamespacePlan::new();

    let classification = planned_stage_bands(graph, CLASSIFICATION_STAGE_ID)?;
    plan.add_flag_band(CLASSIF_BAND_NAME, &classification_flag_coding())?;

    for band in source.flag_bands() {
        if let Some(coding) = source.flag_codings.coding(&band.name) {
            plan.add_flag_band(band.name.clone(), coding)?;
        }
    }

    for name in &config.radiance_bands_to_copy {
        plan.add_band(name.clone())?;
    }

    let reflectances: BTreeSet<String> = planned_stage_bands(graph, RAD2REFL_STAGE_ID)?
        .into_iter()
        .collect();
    for name in &config.reflectance_bands_to_copy {
        if !reflectances.contains(name) {
            return Err(SnowError::Definition(format!(
                "reflectance band '{}' is not produced by stage '{}'",
                name, RAD2REFL_STAGE_ID
            )));
        }
        plan.add_band(name.clone())?;
    }

    if classification.iter().any(|b| b == NN_VALUE_BAND_NAME) {
        plan.add_band(NN_VALUE_BAND_NAME)?;
    }

    if config.apply_o2_corrected_transmission {
        for name in planned_stage_bands(graph, O2CORR_STAGE_ID)? {
            plan.add_band(name)?;
        }
        plan.add_band(ALTITUDE_BAND_NAME)?;
    }

    for mask in classification_masks() {
        Expression::parse(&mask.expression)?.check_names(&plan)?;
    }

    for spec in virtual_bands {
        plan.plan_virtual_band(spec)?;
    }

    Ok(plan)
}

fn source_product(sources: &SourceProducts) -> SnowResult<&Product> {
    sources.get(L1B_SOURCE).ok_or_else(|| {
        SnowError::InputValidation(format!("source product '{}' not supplied", L1B_SOURCE))
    })
}

fn stage_output<'a>(outputs: &'a StageOutputs, stage: &str) -> SnowResult<&'a Product> {
    outputs.get(stage).ok_or_else(|| SnowError::StageExecution {
        stage: stage.to_string(),
        message: "no output product".to_string(),
    })
}

fn assemble(
    config: &SnowPipelineConfig,
    sources: &SourceProducts,
    virtual_bands: &[VirtualBandSpec],
    outputs: &StageOutputs,
) -> SnowResult<Product> {
    let source = source_product(sources)?;
    let classification = stage_output(outputs, CLASSIFICATION_STAGE_ID)?;
    let rad2refl = stage_output(outputs, RAD2REFL_STAGE_ID)?;

    let mut merger = ProductMerger::new(
        format!("{}{}", source.name, TARGET_SUFFIX),
        classification.product_type.clone(),
        classification.width(),
        classification.height(),
    );

    merger.add(
        classification,
        &SelectionPolicy::everything_but_bands().with_bands([CLASSIF_BAND_NAME]),
    )?;
    merger.add(source, &SelectionPolicy::new().with_flag_bands())?;

    if !config.radiance_bands_to_copy.is_empty() {
        merger.add(
            source,
            &SelectionPolicy::new().with_bands(config.radiance_bands_to_copy.iter().cloned()),
        )?;
    }
    if !config.reflectance_bands_to_copy.is_empty() {
        merger.add(
            rad2refl,
            &SelectionPolicy::new().with_bands(config.reflectance_bands_to_copy.iter().cloned()),
        )?;
    }
    if config.output_nn_value {
        merger.add(classification, &SelectionPolicy::new().with_bands([NN_VALUE_BAND_NAME]))?;
    }

    if let Some(postprocessed) = outputs.get(POSTPROCESS_STAGE_ID) {
        merger.add(
            postprocessed,
            &SelectionPolicy::new()
                .with_flag_codings()
                .with_override(CLASSIF_BAND_NAME),
        )?;
    }

    if config.apply_o2_corrected_transmission {
        let o2corr = stage_output(outputs, O2CORR_STAGE_ID)?;
        merger.add(
            o2corr,
            &SelectionPolicy::new().with_bands([
                TRANS_13_BAND_NAME,
                PRESS_13_BAND_NAME,
                SURFACE_13_BAND_NAME,
            ]),
        )?;
        merger.add(source, &SelectionPolicy::new().with_bands([ALTITUDE_BAND_NAME]))?;
    }

    let mut product = merger.finish();
    product.auto_grouping = Some(AUTO_GROUPING.to_string());

    setup_classification_bitmask(&mut product)?;
    for mask in product.masks() {
        Expression::parse(&mask.expression)?.bind(&product)?;
    }

    for spec in virtual_bands {
        add_virtual_band(&mut product, spec)?;
    }

    Ok(product)
}
