use crate::core::expression::BoundExpression;
use crate::core::flags::FlagRegistry;
use chrono::{DateTime, Utc};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

/// 2D raster samples (rows = scene lines, cols = scene pixels)
pub type RasterData = Array2<f64>;

/// Declared pixel data type of a band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl PixelType {
    pub fn is_integer(self) -> bool {
        !matches!(self, PixelType::Float32 | PixelType::Float64)
    }

    /// Convert a computed value into the value this pixel type can hold.
    ///
    /// Integer types truncate toward zero and saturate at their range.
    pub fn coerce(self, value: f64) -> f64 {
        match self {
            PixelType::Int8 => value as i8 as f64,
            PixelType::UInt8 => value as u8 as f64,
            PixelType::Int16 => value as i16 as f64,
            PixelType::UInt16 => value as u16 as f64,
            PixelType::Int32 => value as i32 as f64,
            PixelType::UInt32 => value as u32 as f64,
            PixelType::Float32 => value as f32 as f64,
            PixelType::Float64 => value,
        }
    }
}

impl std::fmt::Display for PixelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelType::Int8 => write!(f, "int8"),
            PixelType::UInt8 => write!(f, "uint8"),
            PixelType::Int16 => write!(f, "int16"),
            PixelType::UInt16 => write!(f, "uint16"),
            PixelType::Int32 => write!(f, "int32"),
            PixelType::UInt32 => write!(f, "uint32"),
            PixelType::Float32 => write!(f, "float32"),
            PixelType::Float64 => write!(f, "float64"),
        }
    }
}

/// Geospatial transformation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

/// Geocoding shared by all bands of a product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoCoding {
    /// Coordinate reference system, e.g. "EPSG:4326"
    pub crs: String,
    pub geo_transform: GeoTransform,
}

/// Value of a metadata attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataAttribute {
    pub name: String,
    pub value: MetadataValue,
}

/// Node of the free-form metadata tree attached to a product
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataElement {
    pub name: String,
    pub attributes: Vec<MetadataAttribute>,
    pub elements: Vec<MetadataElement>,
}

impl MetadataElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            elements: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: MetadataValue) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn with_element(mut self, element: MetadataElement) -> Self {
        self.elements.push(element);
        self
    }

    /// Set an attribute, replacing any existing attribute of the same name
    pub fn set_attribute(&mut self, name: impl Into<String>, value: MetadataValue) {
        let name = name.into();
        match self.attributes.iter_mut().find(|a| a.name == name) {
            Some(existing) => existing.value = value,
            None => self.attributes.push(MetadataAttribute { name, value }),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&MetadataValue> {
        self.attributes.iter().find(|a| a.name == name).map(|a| &a.value)
    }

    pub fn element(&self, name: &str) -> Option<&MetadataElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// Merge another tree into this one.
    ///
    /// Attributes and child elements already present by name are kept;
    /// missing ones are appended. Child elements of equal name are merged
    /// recursively.
    pub fn union_with(&mut self, other: &MetadataElement) {
        for attribute in &other.attributes {
            if self.attribute(&attribute.name).is_none() {
                self.attributes.push(attribute.clone());
            }
        }
        for child in &other.elements {
            match self.elements.iter_mut().find(|e| e.name == child.name) {
                Some(existing) => existing.union_with(child),
                None => self.elements.push(child.clone()),
            }
        }
    }
}

/// Named boolean mask over a product, defined by an expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mask {
    pub name: String,
    pub expression: String,
    pub description: String,
    /// RGB display colour
    pub color: [u8; 3],
    pub transparency: f64,
}

/// Coarse grid of values sampled every `sub_sampling` pixels.
///
/// Grid point (i, j) sits at scene pixel coordinate
/// `(offset_x + i * sub_sampling_x, offset_y + j * sub_sampling_y)`, with
/// pixel centres at half-integer coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct TiePointGrid {
    pub name: String,
    pub offset_x: f64,
    pub offset_y: f64,
    pub sub_sampling_x: f64,
    pub sub_sampling_y: f64,
    pub unit: Option<String>,
    pub description: Option<String>,
    data: Array2<f64>,
}

impl TiePointGrid {
    /// Grid from tie-point values laid out as (rows, columns)
    pub fn new(
        name: impl Into<String>,
        offset: (f64, f64),
        sub_sampling: (f64, f64),
        data: Array2<f64>,
    ) -> SnowResult<Self> {
        let name = name.into();
        let (rows, cols) = data.dim();
        if rows < 2 || cols < 2 {
            return Err(SnowError::Definition(format!(
                "tie-point grid '{}' needs at least 2x2 points, got {}x{}",
                name, cols, rows
            )));
        }
        if !(sub_sampling.0 > 0.0 && sub_sampling.1 > 0.0) {
            return Err(SnowError::Definition(format!(
                "tie-point grid '{}' has non-positive sub-sampling {:?}",
                name, sub_sampling
            )));
        }
        Ok(Self {
            name,
            offset_x: offset.0,
            offset_y: offset.1,
            sub_sampling_x: sub_sampling.0,
            sub_sampling_y: sub_sampling.1,
            unit: None,
            description: None,
            data,
        })
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Grid size as (columns, rows)
    pub fn grid_size(&self) -> (usize, usize) {
        let (rows, cols) = self.data.dim();
        (cols, rows)
    }

    /// Bilinear value at the centre of scene pixel (x, y).
    ///
    /// Positions outside the grid are clamped to its border.
    pub fn pixel_value(&self, x: usize, y: usize) -> f64 {
        let (cols, rows) = self.grid_size();
        let gx = (x as f64 + 0.5 - self.offset_x) / self.sub_sampling_x;
        let gy = (y as f64 + 0.5 - self.offset_y) / self.sub_sampling_y;
        let gx = gx.clamp(0.0, (cols - 1) as f64);
        let gy = gy.clamp(0.0, (rows - 1) as f64);
        let i = (gx.floor() as usize).min(cols - 2);
        let j = (gy.floor() as usize).min(rows - 2);
        let wx = gx - i as f64;
        let wy = gy - j as f64;

        let top = self.data[[j, i]] * (1.0 - wx) + self.data[[j, i + 1]] * wx;
        let bottom = self.data[[j + 1, i]] * (1.0 - wx) + self.data[[j + 1, i + 1]] * wx;
        top * (1.0 - wy) + bottom * wy
    }
}

/// Formula-derived samples, computed on demand
#[derive(Clone)]
pub struct VirtualSource {
    expression: Arc<BoundExpression>,
    cache: Arc<OnceLock<Arc<RasterData>>>,
}

impl VirtualSource {
    pub fn expression(&self) -> &BoundExpression {
        &self.expression
    }

    pub fn is_materialized(&self) -> bool {
        self.cache.get().is_some()
    }
}

/// Where the samples of a band come from
#[derive(Clone)]
pub enum BandSource {
    Stored(Arc<RasterData>),
    Virtual(VirtualSource),
}

impl std::fmt::Debug for BandSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BandSource::Stored(data) => write!(f, "Stored({:?})", data.dim()),
            BandSource::Virtual(source) => write!(f, "Virtual({:?})", source.expression.text()),
        }
    }
}

/// One 2D raster layer of a product, either stored or virtual
#[derive(Debug, Clone)]
pub struct Band {
    pub name: String,
    pub pixel_type: PixelType,
    pub no_data_value: f64,
    pub no_data_used: bool,
    pub unit: Option<String>,
    pub description: Option<String>,
    width: usize,
    height: usize,
    source: BandSource,
}

impl Band {
    /// Create a band backed by concrete samples.
    ///
    /// Samples are coerced to `pixel_type` once at construction.
    pub fn stored(name: impl Into<String>, pixel_type: PixelType, data: RasterData) -> Self {
        let (height, width) = data.dim();
        let data = if pixel_type == PixelType::Float64 {
            data
        } else {
            data.mapv(|v| pixel_type.coerce(v))
        };
        Self {
            name: name.into(),
            pixel_type,
            no_data_value: 0.0,
            no_data_used: false,
            unit: None,
            description: None,
            width,
            height,
            source: BandSource::Stored(Arc::new(data)),
        }
    }

    /// Create a band whose samples are computed from a bound expression
    pub fn virtual_band(
        name: impl Into<String>,
        pixel_type: PixelType,
        expression: BoundExpression,
    ) -> Self {
        let (width, height) = expression.raster_size();
        Self {
            name: name.into(),
            pixel_type,
            no_data_value: 0.0,
            no_data_used: false,
            unit: None,
            description: None,
            width,
            height,
            source: BandSource::Virtual(VirtualSource {
                expression: Arc::new(expression),
                cache: Arc::new(OnceLock::new()),
            }),
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
        self.no_data_value = value;
        self.no_data_used = true;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn source(&self) -> &BandSource {
        &self.source
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.source, BandSource::Virtual(_))
    }

    /// Formula text of a virtual band
    pub fn expression_text(&self) -> Option<&str> {
        match &self.source {
            BandSource::Virtual(v) => Some(v.expression.text()),
            BandSource::Stored(_) => None,
        }
    }

    pub fn is_no_data(&self, value: f64) -> bool {
        value.is_nan() || (self.no_data_used && value == self.no_data_value)
    }

    /// Raw sample at (x, y), including no-data values
    pub fn raw_sample(&self, x: usize, y: usize) -> f64 {
        match &self.source {
            BandSource::Stored(data) => data[[y, x]],
            BandSource::Virtual(v) => match v.cache.get() {
                Some(data) => data[[y, x]],
                None => self.evaluate_pixel(&v.expression, x, y),
            },
        }
    }

    /// Valid sample at (x, y); `None` where the band holds no-data
    pub fn sample(&self, x: usize, y: usize) -> Option<f64> {
        let value = self.raw_sample(x, y);
        if self.is_no_data(value) {
            None
        } else {
            Some(value)
        }
    }

    /// All samples of the band.
    ///
    /// Virtual bands are computed once and cached; later calls and
    /// per-pixel reads reuse the cached raster.
    pub fn materialize(&self) -> Arc<RasterData> {
        match &self.source {
            BandSource::Stored(data) => Arc::clone(data),
            BandSource::Virtual(v) => Arc::clone(v.cache.get_or_init(|| {
                log::debug!("Materialising virtual band '{}'", self.name);
                Arc::new(self.compute_virtual(&v.expression))
            })),
        }
    }

    fn evaluate_pixel(&self, expression: &BoundExpression, x: usize, y: usize) -> f64 {
        match expression.evaluate(x, y) {
            Some(value) => self.pixel_type.coerce(value),
            None if self.no_data_used => self.no_data_value,
            None => f64::NAN,
        }
    }

    #[cfg(feature = "parallel")]
    fn compute_virtual(&self, expression: &BoundExpression) -> RasterData {
        let mut data = RasterData::zeros((self.height, self.width));
        Zip::indexed(&mut data).par_for_each(|(y, x), value| {
            *value = self.evaluate_pixel(expression, x, y);
        });
        data
    }

    #[cfg(not(feature = "parallel"))]
    fn compute_virtual(&self, expression: &BoundExpression) -> RasterData {
        let mut data = RasterData::zeros((self.height, self.width));
        Zip::indexed(&mut data).for_each(|(y, x), value| {
            *value = self.evaluate_pixel(expression, x, y);
        });
        data
    }
}

/// Named multi-band raster with shared geometry and metadata
#[derive(Debug, Clone)]
pub struct Product {
    pub name: String,
    pub product_type: String,
    pub geocoding: Option<GeoCoding>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub flag_codings: FlagRegistry,
    pub metadata: MetadataElement,
    /// Band grouping pattern, e.g. "Oa*_radiance:Oa*_reflectance"
    pub auto_grouping: Option<String>,
    width: usize,
    height: usize,
    bands: Vec<Band>,
    masks: Vec<Mask>,
    tie_point_grids: Vec<TiePointGrid>,
}

impl Product {
    pub fn new(
        name: impl Into<String>,
        product_type: impl Into<String>,
        width: usize,
        height: usize,
    ) -> Self {
        Self {
            name: name.into(),
            product_type: product_type.into(),
            geocoding: None,
            start_time: None,
            end_time: None,
            flag_codings: FlagRegistry::new(),
            metadata: MetadataElement::new("metadata"),
            auto_grouping: None,
            width,
            height,
            bands: Vec::new(),
            masks: Vec::new(),
            tie_point_grids: Vec::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Scene raster size as (width, height)
    pub fn raster_size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Add a band; its name must be new and its size must match the scene
    pub fn add_band(&mut self, band: Band) -> SnowResult<()> {
        self.check_geometry(&band)?;
        if self.contains_band(&band.name) || self.tie_point_grid(&band.name).is_some() {
            return Err(SnowError::Definition(format!(
                "band '{}' already exists in product '{}'",
                band.name, self.name
            )));
        }
        self.bands.push(band);
        Ok(())
    }

    /// Replace an existing band in place, returning the previous one
    pub fn replace_band(&mut self, band: Band) -> SnowResult<Band> {
        self.check_geometry(&band)?;
        match self.bands.iter_mut().find(|b| b.name == band.name) {
            Some(slot) => Ok(std::mem::replace(slot, band)),
            None => Err(SnowError::Definition(format!(
                "cannot replace band '{}': not present in product '{}'",
                band.name, self.name
            ))),
        }
    }

    pub fn remove_band(&mut self, name: &str) -> Option<Band> {
        let index = self.bands.iter().position(|b| b.name == name)?;
        Some(self.bands.remove(index))
    }

    pub fn band(&self, name: &str) -> Option<&Band> {
        self.bands.iter().find(|b| b.name == name)
    }

    pub fn contains_band(&self, name: &str) -> bool {
        self.band(name).is_some()
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn band_names(&self) -> Vec<&str> {
        self.bands.iter().map(|b| b.name.as_str()).collect()
    }

    /// Bands carrying a flag coding
    pub fn flag_bands(&self) -> impl Iterator<Item = &Band> {
        self.bands
            .iter()
            .filter(move |b| self.flag_codings.contains_band(&b.name))
    }

    /// Add a mask; a mask of the same name must carry the same expression
    pub fn add_mask(&mut self, mask: Mask) -> SnowResult<()> {
        if let Some(existing) = self.mask(&mask.name) {
            if existing.expression == mask.expression {
                return Ok(());
            }
            return Err(SnowError::Definition(format!(
                "mask '{}' defined twice with different expressions ('{}' vs '{}')",
                mask.name, existing.expression, mask.expression
            )));
        }
        self.masks.push(mask);
        Ok(())
    }

    pub fn mask(&self, name: &str) -> Option<&Mask> {
        self.masks.iter().find(|m| m.name == name)
    }

    pub fn masks(&self) -> &[Mask] {
        &self.masks
    }

    /// Add a tie-point grid; its name must not be used by a band or another grid
    pub fn add_tie_point_grid(&mut self, grid: TiePointGrid) -> SnowResult<()> {
        if self.contains_band(&grid.name) || self.tie_point_grid(&grid.name).is_some() {
            return Err(SnowError::Definition(format!(
                "raster '{}' already exists in product '{}'",
                grid.name, self.name
            )));
        }
        self.tie_point_grids.push(grid);
        Ok(())
    }

    pub fn tie_point_grid(&self, name: &str) -> Option<&TiePointGrid> {
        self.tie_point_grids.iter().find(|g| g.name == name)
    }

    pub fn tie_point_grids(&self) -> &[TiePointGrid] {
        &self.tie_point_grids
    }

    fn check_geometry(&self, band: &Band) -> SnowResult<()> {
        if band.width() != self.width || band.height() != self.height {
            return Err(SnowError::Definition(format!(
                "band '{}' is {}x{} but product '{}' is {}x{}",
                band.name,
                band.width(),
                band.height(),
                self.name,
                self.width,
                self.height
            )));
        }
        Ok(())
    }
}

/// Error types for pipeline construction and execution
#[derive(Debug, thiserror::Error)]
pub enum SnowError {
    #[error("Input validation error: {0}")]
    InputValidation(String),

    #[error("Missing input: stage '{stage}' requires slot '{slot}'")]
    MissingInput { stage: String, slot: String },

    #[error("Graph validation error: {0}")]
    GraphValidation(String),

    #[error("Definition error: {0}")]
    Definition(String),

    #[error("Stage '{stage}' failed: {message}")]
    StageExecution { stage: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SnowError {
    fn from(e: serde_json::Error) -> Self {
        SnowError::Config(e.to_string())
    }
}

/// Result type for pipeline operations
pub type SnowResult<T> = Result<T, SnowError>;
