//! Cloud buffer post-processing of the classification flag band.
//!
//! Every pixel that is neither cloud nor invalid gets `IDEPIX_CLOUD_BUFFER`
//! when a cloud pixel lies within a square window of `width` pixels around
//! it. Other declared flags are passed through unchanged and bits outside the
//! flag coding are dropped.

use std::collections::BTreeMap;

use ndarray::{Array2, Zip};

use crate::core::flags::{
    classification_flag_coding, FlagDefinition, FlagRegistry, CLASSIF_BAND_NAME, IDEPIX_CLOUD,
    IDEPIX_CLOUD_BUFFER, IDEPIX_INVALID,
};
use crate::core::stage::{BoundInputs, ParamSet, ParamSpec, Stage, StageDescriptor};
use crate::types::{Band, Product, SnowError, SnowResult};

/// Registry id of the builtin post-processing stage
pub const POSTPROCESS_STAGE_ID: &str = "postprocess";

/// Cloud buffer parameters
#[derive(Debug, Clone)]
pub struct CloudBufferParams {
    pub compute_cloud_buffer: bool,
    /// Half size of the square search window in pixels
    pub width: usize,
}

impl Default for CloudBufferParams {
    fn default() -> Self {
        Self {
            compute_cloud_buffer: true,
            width: 2,
        }
    }
}

/// Per-pixel flag predicates the buffer works with
struct BufferInputs<'a> {
    cloud: &'a Array2<bool>,
    invalid: &'a Array2<bool>,
    buffer: &'a Array2<bool>,
}

fn predicate<'a>(
    predicates: &'a BTreeMap<String, Array2<bool>>,
    flag: &str,
) -> SnowResult<&'a Array2<bool>> {
    predicates.get(flag).ok_or_else(|| {
        SnowError::Definition(format!("undefined flag '{}.{}'", CLASSIF_BAND_NAME, flag))
    })
}

/// Cloud buffer processor
pub struct CloudBuffer {
    params: CloudBufferParams,
}

impl CloudBuffer {
    pub fn new() -> Self {
        Self {
            params: CloudBufferParams::default(),
        }
    }

    pub fn with_params(params: CloudBufferParams) -> Self {
        Self { params }
    }

    /// New `IDEPIX_CLOUD_BUFFER` predicate
    fn apply(&self, inputs: &BufferInputs<'_>) -> Array2<bool> {
        if !self.params.compute_cloud_buffer || self.params.width == 0 {
            log::debug!("Cloud buffer disabled, flags passed through");
            return inputs.buffer.clone();
        }
        log::debug!("Applying cloud buffer of width {}", self.params.width);
        self.buffer_pixels(inputs)
    }

    fn buffer_value(&self, inputs: &BufferInputs<'_>, y: usize, x: usize) -> bool {
        if inputs.buffer[[y, x]] {
            return true;
        }
        if inputs.cloud[[y, x]] || inputs.invalid[[y, x]] {
            return false;
        }

        let (height, width) = inputs.cloud.dim();
        let w = self.params.width;
        let y0 = y.saturating_sub(w);
        let y1 = (y + w).min(height - 1);
        let x0 = x.saturating_sub(w);
        let x1 = (x + w).min(width - 1);

        for yy in y0..=y1 {
            for xx in x0..=x1 {
                if inputs.cloud[[yy, xx]] {
                    return true;
                }
            }
        }
        false
    }

    #[cfg(feature = "parallel")]
    fn buffer_pixels(&self, inputs: &BufferInputs<'_>) -> Array2<bool> {
        let mut out = Array2::from_elem(inputs.cloud.dim(), false);
        Zip::indexed(&mut out).par_for_each(|(y, x), v| {
            *v = self.buffer_value(inputs, y, x);
        });
        out
    }

    #[cfg(not(feature = "parallel"))]
    fn buffer_pixels(&self, inputs: &BufferInputs<'_>) -> Array2<bool> {
        let mut out = Array2::from_elem(inputs.cloud.dim(), false);
        Zip::indexed(&mut out).for_each(|(y, x), v| {
            *v = self.buffer_value(inputs, y, x);
        });
        out
    }

    /// Post-process the flag band of a classification product.
    ///
    /// The band is decoded into one predicate per declared flag, the buffer
    /// predicate is recomputed and the band is rendered again from the
    /// composed coding. Bits outside the coding are dropped. Returns a
    /// product carrying only the new flag band and its coding.
    pub fn process(&self, classification: &Product) -> SnowResult<Product> {
        let band = classification.band(CLASSIF_BAND_NAME).ok_or_else(|| {
            SnowError::Definition(format!(
                "'{}' has no '{}' band",
                classification.name, CLASSIF_BAND_NAME
            ))
        })?;

        let mut codings = FlagRegistry::new();
        codings.compose_coding(CLASSIF_BAND_NAME, &classification_flag_coding())?;
        if let Some(coding) = classification.flag_codings.coding(CLASSIF_BAND_NAME) {
            codings.compose_coding(CLASSIF_BAND_NAME, coding)?;
        }

        let mut predicates = decode_flags(&codings, band)?;
        let buffered = {
            let inputs = BufferInputs {
                cloud: predicate(&predicates, IDEPIX_CLOUD)?,
                invalid: predicate(&predicates, IDEPIX_INVALID)?,
                buffer: predicate(&predicates, IDEPIX_CLOUD_BUFFER)?,
            };
            self.apply(&inputs)
        };
        predicates.insert(IDEPIX_CLOUD_BUFFER.to_string(), buffered);

        let mut new_band = codings.render(
            CLASSIF_BAND_NAME,
            classification.width(),
            classification.height(),
            &predicates,
        )?;
        new_band.unit = band.unit.clone();
        new_band.description = band.description.clone();

        let mut out = Product::new(
            format!("{}_postprocessed", classification.name),
            classification.product_type.clone(),
            classification.width(),
            classification.height(),
        );
        out.geocoding = classification.geocoding.clone();
        out.start_time = classification.start_time;
        out.end_time = classification.end_time;
        out.flag_codings = codings;
        out.add_band(new_band)?;
        Ok(out)
    }
}

impl Default for CloudBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Builtin post-processing stage wrapping [`CloudBuffer`]
pub struct CloudBufferStage {
    descriptor: StageDescriptor,
}

impl CloudBufferStage {
    pub fn new() -> Self {
        let defaults = CloudBufferParams::default();
        Self {
            descriptor: StageDescriptor::new(
                POSTPROCESS_STAGE_ID,
                "Cloud buffer post-processing of the classification flags",
            )
            .required_slot("l1b", "L1b source product")
            .required_slot("classification", "classification output")
            .param(ParamSpec::with_default(
                "compute_cloud_buffer",
                defaults.compute_cloud_buffer,
                "Compute a cloud buffer",
            ))
            .param(ParamSpec::with_default(
                "cloud_buffer_width",
                defaults.width as i64,
                "Width of the cloud buffer in pixels",
            ))
            .output_band(CLASSIF_BAND_NAME),
        }
    }
}

impl Default for CloudBufferStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for CloudBufferStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    fn execute(&self, inputs: &BoundInputs<'_>, params: &ParamSet) -> SnowResult<Product> {
        let l1b = inputs.required("l1b")?;
        let classification = inputs.required("classification")?;
        if l1b.raster_size() != classification.raster_size() {
            return Err(SnowError::StageExecution {
                stage: inputs.stage().to_string(),
                message: format!(
                    "classification size {:?} differs from l1b size {:?}",
                    classification.raster_size(),
                    l1b.raster_size()
                ),
            });
        }

        let width = params.int("cloud_buffer_width")?;
        let width = usize::try_from(width).map_err(|_| SnowError::StageExecution {
            stage: inputs.stage().to_string(),
            message: format!("negative cloud buffer width {}", width),
        })?;
        let processor = CloudBuffer::with_params(CloudBufferParams {
            compute_cloud_buffer: params.bool("compute_cloud_buffer")?,
            width,
        });
        processor.process(classification)
    }
}

/// Per-flag predicates of a flag raster, keyed by flag name
pub fn decode_flags(
    registry: &FlagRegistry,
    band: &Band,
) -> SnowResult<BTreeMap<String, Array2<bool>>> {
    let coding = registry.coding(&band.name).ok_or_else(|| {
        SnowError::Definition(format!("no flag coding registered for band '{}'", band.name))
    })?;
    let data = band.materialize();
    Ok(flag_predicates(coding.flags(), &data))
}

fn flag_predicate(data: &Array2<f64>, mask: u32) -> Array2<bool> {
    data.mapv(|v| v.is_finite() && (v as u32) & mask == mask)
}

#[cfg(feature = "parallel")]
fn flag_predicates(flags: &[FlagDefinition], data: &Array2<f64>) -> BTreeMap<String, Array2<bool>> {
    use rayon::prelude::*;

    flags
        .par_iter()
        .map(|flag| (flag.name.clone(), flag_predicate(data, flag.mask)))
        .collect::<Vec<_>>()
        .into_iter()
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn flag_predicates(flags: &[FlagDefinition], data: &Array2<f64>) -> BTreeMap<String, Array2<bool>> {
    flags
        .iter()
        .map(|flag| (flag.name.clone(), flag_predicate(data, flag.mask)))
        .collect()
}
