//! Processing stages: typed descriptors, parameter sets and the stage registry.
//!
//! A stage declares its input slots, parameters and output bands up front in a
//! [`StageDescriptor`]. The pipeline graph checks bindings and parameters
//! against the descriptor before anything runs; at run time a stage receives
//! read-only inputs and returns exactly one new product.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{Product, SnowError, SnowResult};

/// Typed parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    TextList(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Text,
    TextList,
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Bool(_) => ParamKind::Bool,
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Float(_) => ParamKind::Float,
            ParamValue::Text(_) => ParamKind::Text,
            ParamValue::TextList(_) => ParamKind::TextList,
        }
    }

    /// Convert to `kind`; integers are promoted to floats
    fn coerce_to(self, kind: ParamKind) -> Option<ParamValue> {
        match (self, kind) {
            (ParamValue::Int(i), ParamKind::Float) => Some(ParamValue::Float(i as f64)),
            (value, kind) if value.kind() == kind => Some(value),
            _ => None,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(v: Vec<String>) -> Self {
        ParamValue::TextList(v)
    }
}

/// Declared parameter of a stage
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<ParamValue>,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    /// Optional parameter; absent values take `default`
    pub fn with_default(
        name: impl Into<String>,
        default: impl Into<ParamValue>,
        description: impl Into<String>,
    ) -> Self {
        let default = default.into();
        Self {
            name: name.into(),
            kind: default.kind(),
            default: Some(default),
            required: false,
            description: description.into(),
        }
    }

    /// Optional parameter without a default; absent values stay unset
    pub fn optional(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            required: false,
            description: description.into(),
        }
    }

    pub fn required(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            required: true,
            description: description.into(),
        }
    }
}

/// Resolved parameters of one stage instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSet {
    values: BTreeMap<String, ParamValue>,
}

impl ParamSet {
    /// Check supplied values against a descriptor and fill in defaults
    pub fn resolve(
        descriptor: &StageDescriptor,
        supplied: BTreeMap<String, ParamValue>,
    ) -> SnowResult<Self> {
        let mut values = BTreeMap::new();

        for (name, value) in supplied {
            let spec = descriptor.param_spec(&name).ok_or_else(|| {
                SnowError::GraphValidation(format!(
                    "stage '{}' has no parameter '{}'",
                    descriptor.id, name
                ))
            })?;
            let found = value.kind();
            let value = value.coerce_to(spec.kind).ok_or_else(|| {
                SnowError::GraphValidation(format!(
                    "parameter '{}' of stage '{}' expects {:?}, got {:?}",
                    name, descriptor.id, spec.kind, found
                ))
            })?;
            values.insert(name, value);
        }

        for spec in &descriptor.params {
            if values.contains_key(&spec.name) {
                continue;
            }
            match (&spec.default, spec.required) {
                (Some(default), _) => {
                    values.insert(spec.name.clone(), default.clone());
                }
                (None, true) => {
                    return Err(SnowError::GraphValidation(format!(
                        "stage '{}' requires parameter '{}'",
                        descriptor.id, spec.name
                    )));
                }
                (None, false) => {}
            }
        }

        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn bool(&self, name: &str) -> SnowResult<bool> {
        match self.values.get(name) {
            Some(ParamValue::Bool(v)) => Ok(*v),
            other => Err(Self::type_error(name, "bool", other)),
        }
    }

    pub fn int(&self, name: &str) -> SnowResult<i64> {
        match self.values.get(name) {
            Some(ParamValue::Int(v)) => Ok(*v),
            other => Err(Self::type_error(name, "int", other)),
        }
    }

    pub fn float(&self, name: &str) -> SnowResult<f64> {
        match self.values.get(name) {
            Some(ParamValue::Float(v)) => Ok(*v),
            Some(ParamValue::Int(v)) => Ok(*v as f64),
            other => Err(Self::type_error(name, "float", other)),
        }
    }

    pub fn text(&self, name: &str) -> SnowResult<&str> {
        match self.values.get(name) {
            Some(ParamValue::Text(v)) => Ok(v),
            other => Err(Self::type_error(name, "text", other)),
        }
    }

    pub fn text_list(&self, name: &str) -> SnowResult<&[String]> {
        match self.values.get(name) {
            Some(ParamValue::TextList(v)) => Ok(v),
            other => Err(Self::type_error(name, "text list", other)),
        }
    }

    fn type_error(name: &str, expected: &str, found: Option<&ParamValue>) -> SnowError {
        match found {
            Some(value) => SnowError::GraphValidation(format!(
                "parameter '{}' is {:?}, expected {}",
                name,
                value.kind(),
                expected
            )),
            None => SnowError::GraphValidation(format!("parameter '{}' is not set", name)),
        }
    }
}

/// Named input slot of a stage
#[derive(Debug, Clone)]
pub struct SlotSpec {
    pub name: String,
    pub required: bool,
    pub description: String,
}

/// Output band a stage promises, optionally only when a bool parameter is set
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub band: String,
    pub when_param: Option<String>,
}

/// Static contract of a stage
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub id: String,
    pub description: String,
    pub slots: Vec<SlotSpec>,
    pub params: Vec<ParamSpec>,
    pub outputs: Vec<OutputSpec>,
}

impl StageDescriptor {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            slots: Vec::new(),
            params: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn required_slot(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.slots.push(SlotSpec {
            name: name.into(),
            required: true,
            description: description.into(),
        });
        self
    }

    pub fn optional_slot(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.slots.push(SlotSpec {
            name: name.into(),
            required: false,
            description: description.into(),
        });
        self
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn output_band(mut self, band: impl Into<String>) -> Self {
        self.outputs.push(OutputSpec {
            band: band.into(),
            when_param: None,
        });
        self
    }

    /// Output band produced only when the bool parameter `param` is true
    pub fn output_band_when(mut self, band: impl Into<String>, param: impl Into<String>) -> Self {
        self.outputs.push(OutputSpec {
            band: band.into(),
            when_param: Some(param.into()),
        });
        self
    }

    pub fn slot(&self, name: &str) -> Option<&SlotSpec> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn param_spec(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// First required slot; its product defines the expected output size
    pub fn primary_slot(&self) -> Option<&SlotSpec> {
        self.slots.iter().find(|s| s.required)
    }

    /// Output bands promised for a given parameter set
    pub fn expected_outputs(&self, params: &ParamSet) -> Vec<&str> {
        self.outputs
            .iter()
            .filter(|o| match &o.when_param {
                Some(param) => params.bool(param).unwrap_or(false),
                None => true,
            })
            .map(|o| o.band.as_str())
            .collect()
    }
}

/// Read-only products bound to the slots of one stage
#[derive(Debug, Clone)]
pub struct BoundInputs<'a> {
    stage: &'a str,
    products: BTreeMap<&'a str, &'a Product>,
}

impl<'a> BoundInputs<'a> {
    pub fn new(stage: &'a str) -> Self {
        Self {
            stage,
            products: BTreeMap::new(),
        }
    }

    pub fn bind(&mut self, slot: &'a str, product: &'a Product) {
        self.products.insert(slot, product);
    }

    pub fn with(mut self, slot: &'a str, product: &'a Product) -> Self {
        self.bind(slot, product);
        self
    }

    pub fn stage(&self) -> &str {
        self.stage
    }

    pub fn get(&self, slot: &str) -> Option<&'a Product> {
        self.products.get(slot).copied()
    }

    /// Product bound to a required slot
    pub fn required(&self, slot: &str) -> SnowResult<&'a Product> {
        self.get(slot).ok_or_else(|| SnowError::MissingInput {
            stage: self.stage.to_string(),
            slot: slot.to_string(),
        })
    }

    pub fn slots(&self) -> impl Iterator<Item = &str> {
        self.products.keys().copied()
    }
}

/// A processing unit of the pipeline graph
pub trait Stage: Send + Sync {
    fn descriptor(&self) -> &StageDescriptor;

    /// Produce one new product; inputs are never modified
    fn execute(&self, inputs: &BoundInputs<'_>, params: &ParamSet) -> SnowResult<Product>;
}

/// Opaque algorithm wrapped by a [`DelegatedStage`]
pub trait ExternalAlgorithm: Send + Sync {
    fn compute(&self, inputs: &BoundInputs<'_>, params: &ParamSet) -> anyhow::Result<Product>;
}

impl<F> ExternalAlgorithm for F
where
    F: Fn(&BoundInputs<'_>, &ParamSet) -> anyhow::Result<Product> + Send + Sync,
{
    fn compute(&self, inputs: &BoundInputs<'_>, params: &ParamSet) -> anyhow::Result<Product> {
        self(inputs, params)
    }
}

/// Stage that marshals inputs into an external algorithm and checks the
/// shape of what comes back
pub struct DelegatedStage {
    descriptor: StageDescriptor,
    algorithm: Arc<dyn ExternalAlgorithm>,
}

impl DelegatedStage {
    pub fn new(descriptor: StageDescriptor, algorithm: Arc<dyn ExternalAlgorithm>) -> Self {
        Self {
            descriptor,
            algorithm,
        }
    }

    fn failure(inputs: &BoundInputs<'_>, message: impl Into<String>) -> SnowError {
        SnowError::StageExecution {
            stage: inputs.stage().to_string(),
            message: message.into(),
        }
    }
}

impl Stage for DelegatedStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    fn execute(&self, inputs: &BoundInputs<'_>, params: &ParamSet) -> SnowResult<Product> {
        let output = self
            .algorithm
            .compute(inputs, params)
            .map_err(|e| Self::failure(inputs, format!("{:#}", e)))?;

        let missing: Vec<&str> = self
            .descriptor
            .expected_outputs(params)
            .into_iter()
            .filter(|band| !output.contains_band(band))
            .collect();
        if !missing.is_empty() {
            return Err(Self::failure(inputs, format!(
                "output '{}' lacks contracted band(s) {}",
                output.name,
                missing.join(", ")
            )));
        }

        if let Some(slot) = self.descriptor.primary_slot() {
            let primary = inputs.required(&slot.name)?;
            if output.raster_size() != primary.raster_size() {
                return Err(Self::failure(inputs, format!(
                    "output size {:?} differs from input '{}' size {:?}",
                    output.raster_size(),
                    slot.name,
                    primary.raster_size()
                )));
            }
        }

        Ok(output)
    }
}

/// Creates a fresh stage instance for one pipeline run
pub type StageFactory = Arc<dyn Fn() -> Box<dyn Stage> + Send + Sync>;

/// Maps stage identifiers to factories, resolved when the graph is built
#[derive(Clone, Default)]
pub struct StageRegistry {
    factories: BTreeMap<String, StageFactory>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Stage> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    /// Register a delegated stage under its descriptor id
    pub fn register_delegated(
        &mut self,
        descriptor: StageDescriptor,
        algorithm: Arc<dyn ExternalAlgorithm>,
    ) {
        let id = descriptor.id.clone();
        self.register(id, move || {
            Box::new(DelegatedStage::new(descriptor.clone(), Arc::clone(&algorithm))) as Box<dyn Stage>
        });
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(&self, id: &str) -> SnowResult<Box<dyn Stage>> {
        let factory = self.factories.get(id).ok_or_else(|| {
            SnowError::GraphValidation(format!("no stage registered under '{}'", id))
        })?;
        Ok(factory())
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("ids", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
