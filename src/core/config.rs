//! Pipeline configuration and the OLCI band vocabulary.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{PixelType, SnowError, SnowResult};

/// Number of OLCI spectral bands
pub const OLCI_NUM_BANDS: usize = 21;

pub const ALTITUDE_BAND_NAME: &str = "altitude";
pub const NN_VALUE_BAND_NAME: &str = "nn_value";
pub const TRANS_13_BAND_NAME: &str = "trans_13";
pub const PRESS_13_BAND_NAME: &str = "press_13";
pub const SURFACE_13_BAND_NAME: &str = "surface_13";

/// Largest accepted cloud buffer width in pixels
pub const MAX_CLOUD_BUFFER_WIDTH: i64 = 100;

/// `Oa01_radiance` .. `Oa21_radiance`
pub fn radiance_band_names() -> Vec<String> {
    (1..=OLCI_NUM_BANDS).map(|i| format!("Oa{:02}_radiance", i)).collect()
}

/// `Oa01_reflectance` .. `Oa21_reflectance`
pub fn reflectance_band_names() -> Vec<String> {
    (1..=OLCI_NUM_BANDS).map(|i| format!("Oa{:02}_reflectance", i)).collect()
}

/// User-declared virtual band added after the built-in ones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualBandSpec {
    pub name: String,
    pub expression: String,
    #[serde(default = "default_virtual_pixel_type")]
    pub pixel_type: PixelType,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// No-data value; absent means no-data is not used
    #[serde(default)]
    pub no_data_value: Option<f64>,
}

fn default_virtual_pixel_type() -> PixelType {
    PixelType::Float32
}

impl VirtualBandSpec {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
            pixel_type: default_virtual_pixel_type(),
            unit: None,
            description: None,
            no_data_value: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_no_data(mut self, value: f64) -> Self {
        self.no_data_value = Some(value);
        self
    }
}

/// Switches of the snow pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnowPipelineConfig {
    /// Run the O2 correction stage and add its derived bands
    pub apply_o2_corrected_transmission: bool,
    pub compute_cloud_buffer: bool,
    pub cloud_buffer_width: i64,
    /// Altitude band of the optional DEM product
    pub dem_band_name: String,
    pub radiance_bands_to_copy: Vec<String>,
    pub reflectance_bands_to_copy: Vec<String>,
    /// Copy the classification network output band
    pub output_nn_value: bool,
    pub extra_virtual_bands: Vec<VirtualBandSpec>,
}

impl Default for SnowPipelineConfig {
    fn default() -> Self {
        Self {
            apply_o2_corrected_transmission: true,
            compute_cloud_buffer: true,
            cloud_buffer_width: 2,
            dem_band_name: "band_1".to_string(),
            radiance_bands_to_copy: Vec::new(),
            reflectance_bands_to_copy: vec!["Oa21_reflectance".to_string()],
            output_nn_value: false,
            extra_virtual_bands: Vec::new(),
        }
    }
}

impl SnowPipelineConfig {
    pub fn from_json_str(json: &str) -> SnowResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> SnowResult<Self> {
        let path = path.as_ref();
        log::debug!("Loading pipeline configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> SnowResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check every value before a pipeline is built
    pub fn validate(&self) -> SnowResult<()> {
        check_band_list("radiance_bands_to_copy", &self.radiance_bands_to_copy, &radiance_band_names())?;
        check_band_list(
            "reflectance_bands_to_copy",
            &self.reflectance_bands_to_copy,
            &reflectance_band_names(),
        )?;

        if self.dem_band_name.trim().is_empty() {
            return Err(SnowError::Config("dem_band_name must not be empty".to_string()));
        }

        if !(0..=MAX_CLOUD_BUFFER_WIDTH).contains(&self.cloud_buffer_width) {
            return Err(SnowError::Config(format!(
                "cloud_buffer_width {} outside 0..={}",
                self.cloud_buffer_width, MAX_CLOUD_BUFFER_WIDTH
            )));
        }

        let mut names = BTreeSet::new();
        for band in &self.extra_virtual_bands {
            if !is_valid_band_name(&band.name) {
                return Err(SnowError::Config(format!(
                    "invalid virtual band name '{}'",
                    band.name
                )));
            }
            if !names.insert(band.name.as_str()) {
                return Err(SnowError::Config(format!(
                    "virtual band '{}' declared twice",
                    band.name
                )));
            }
            if band.expression.trim().is_empty() {
                return Err(SnowError::Config(format!(
                    "virtual band '{}' has an empty expression",
                    band.name
                )));
            }
        }

        Ok(())
    }
}

fn check_band_list(field: &str, selected: &[String], allowed: &[String]) -> SnowResult<()> {
    let mut seen = BTreeSet::new();
    for name in selected {
        if !allowed.contains(name) {
            return Err(SnowError::Config(format!(
                "{}: '{}' is not a valid band name",
                field, name
            )));
        }
        if !seen.insert(name) {
            return Err(SnowError::Config(format!("{}: '{}' listed twice", field, name)));
        }
    }
    Ok(())
}

/// Letters, digits and underscores, not starting with a digit
fn is_valid_band_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
