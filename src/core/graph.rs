//! Pipeline graph: declared stages, input bindings and execution order.
//!
//! The graph moves through `Building -> Validated -> Executing -> Assembled`.
//! Any error moves it to `Failed`, after which every further operation is
//! rejected. Stage factories and parameters are resolved when a stage is
//! added; bindings, optional-stage skipping and cycle detection are resolved
//! by [`PipelineGraph::validate`] before any stage runs.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::stage::{BoundInputs, ParamSet, ParamValue, Stage, StageRegistry};
use crate::types::{Product, SnowError, SnowResult};

/// Named source products handed to a pipeline run
pub type SourceProducts = BTreeMap<String, Product>;

/// Output product of every executed stage, keyed by stage id
pub type StageOutputs = BTreeMap<String, Product>;

/// Where a stage slot takes its product from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputBinding {
    Source(String),
    Stage(String),
}

impl std::fmt::Display for InputBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputBinding::Source(name) => write!(f, "source '{}'", name),
            InputBinding::Stage(id) => write!(f, "stage '{}'", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Running,
    Done,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Building,
    Validated,
    Executing,
    Assembled,
    Failed,
}

/// Declaration of one stage instance
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub id: String,
    /// Registry id of the stage implementation
    pub kind: String,
    pub bindings: Vec<(String, InputBinding)>,
    pub params: BTreeMap<String, ParamValue>,
    pub optional: bool,
    pub enabled: bool,
}

impl StageSpec {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            bindings: Vec::new(),
            params: BTreeMap::new(),
            optional: false,
            enabled: true,
        }
    }

    pub fn bind_source(mut self, slot: impl Into<String>, source: impl Into<String>) -> Self {
        self.bindings.push((slot.into(), InputBinding::Source(source.into())));
        self
    }

    pub fn bind_stage(mut self, slot: impl Into<String>, stage: impl Into<String>) -> Self {
        self.bindings.push((slot.into(), InputBinding::Stage(stage.into())));
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Mark the stage optional, included only when `enabled`
    pub fn optional(mut self, enabled: bool) -> Self {
        self.optional = true;
        self.enabled = enabled;
        self
    }
}

struct StageNode {
    id: String,
    stage: Box<dyn Stage>,
    declared: BTreeMap<String, InputBinding>,
    /// Bindings left after dropping unavailable optional inputs
    effective: BTreeMap<String, InputBinding>,
    params: ParamSet,
    enabled: bool,
    state: StageState,
}

/// Outcome of a successful pipeline run
#[derive(Debug)]
pub struct PipelineRun {
    pub product: Product,
    /// Stage ids in execution order
    pub order: Vec<String>,
    /// Final state of every declared stage, in declaration order
    pub stage_states: Vec<(String, StageState)>,
}

impl PipelineRun {
    pub fn stage_state(&self, id: &str) -> Option<StageState> {
        self.stage_states
            .iter()
            .find(|(stage, _)| stage == id)
            .map(|(_, state)| *state)
    }
}

pub struct PipelineGraph {
    registry: StageRegistry,
    sources: Vec<(String, bool)>,
    nodes: Vec<StageNode>,
    order: Vec<usize>,
    state: PipelineState,
}

impl PipelineGraph {
    pub fn new(registry: StageRegistry) -> Self {
        Self {
            registry,
            sources: Vec::new(),
            nodes: Vec::new(),
            order: Vec::new(),
            state: PipelineState::Building,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Declare a named source product slot
    pub fn declare_source(&mut self, name: impl Into<String>, required: bool) -> SnowResult<()> {
        self.expect_state(PipelineState::Building)?;
        let name = name.into();
        if self.sources.iter().any(|(s, _)| *s == name) {
            return Err(self.fail(SnowError::GraphValidation(format!(
                "source '{}' declared twice",
                name
            ))));
        }
        self.sources.push((name, required));
        Ok(())
    }

    /// Add a stage, resolving its implementation and parameters now
    pub fn add_stage(&mut self, spec: StageSpec) -> SnowResult<()> {
        self.expect_state(PipelineState::Building)?;
        match self.build_node(spec) {
            Ok(node) => {
                self.nodes.push(node);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn build_node(&self, spec: StageSpec) -> SnowResult<StageNode> {
        if self.nodes.iter().any(|n| n.id == spec.id) {
            return Err(SnowError::GraphValidation(format!(
                "stage '{}' declared twice",
                spec.id
            )));
        }

        let stage = self.registry.create(&spec.kind)?;
        let descriptor = stage.descriptor();

        let mut declared = BTreeMap::new();
        for (slot, binding) in spec.bindings {
            if descriptor.slot(&slot).is_none() {
                return Err(SnowError::GraphValidation(format!(
                    "stage '{}' ({}) has no input slot '{}'",
                    spec.id, spec.kind, slot
                )));
            }
            if declared.insert(slot.clone(), binding).is_some() {
                return Err(SnowError::GraphValidation(format!(
                    "slot '{}' of stage '{}' bound twice",
                    slot, spec.id
                )));
            }
        }

        let params = ParamSet::resolve(descriptor, spec.params).map_err(|e| match e {
            SnowError::GraphValidation(msg) => {
                SnowError::GraphValidation(format!("{} (stage '{}')", msg, spec.id))
            }
            other => other,
        })?;

        log::debug!(
            "Declared stage '{}' ({}), {}",
            spec.id,
            spec.kind,
            if spec.enabled { "enabled" } else { "disabled" }
        );

        Ok(StageNode {
            id: spec.id,
            stage,
            declared,
            effective: BTreeMap::new(),
            params,
            enabled: spec.enabled,
            state: StageState::Pending,
        })
    }

    /// Resolve bindings and execution order against the given sources
    pub fn validate(&mut self, sources: &SourceProducts) -> SnowResult<()> {
        self.expect_state(PipelineState::Building)?;
        match self.resolve(sources) {
            Ok(order) => {
                for node in &mut self.nodes {
                    if !node.enabled {
                        node.state = StageState::Skipped;
                    }
                }
                log::info!(
                    "Pipeline validated: {} stage(s) to run, {} skipped",
                    order.len(),
                    self.nodes.len() - order.len()
                );
                self.order = order;
                self.state = PipelineState::Validated;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn resolve(&mut self, sources: &SourceProducts) -> SnowResult<Vec<usize>> {
        for (name, required) in &self.sources {
            if *required && !sources.contains_key(name) {
                return Err(SnowError::InputValidation(format!(
                    "required source product '{}' not supplied",
                    name
                )));
            }
        }

        let index: BTreeMap<String, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let enabled: Vec<bool> = self.nodes.iter().map(|n| n.enabled).collect();

        // references and declared slots are checked for disabled stages too
        for node in &self.nodes {
            for (slot, binding) in &node.declared {
                let known = match binding {
                    InputBinding::Source(name) => self.sources.iter().any(|(s, _)| s == name),
                    InputBinding::Stage(id) => index.contains_key(id),
                };
                if !known {
                    let kind = match binding {
                        InputBinding::Source(_) => "undeclared",
                        InputBinding::Stage(_) => "unknown",
                    };
                    return Err(SnowError::GraphValidation(format!(
                        "stage '{}' slot '{}' references {} {}",
                        node.id, slot, kind, binding
                    )));
                }
            }
            for slot in &node.stage.descriptor().slots {
                if slot.required && !node.declared.contains_key(&slot.name) {
                    return Err(SnowError::MissingInput {
                        stage: node.id.clone(),
                        slot: slot.name.clone(),
                    });
                }
            }
        }

        let mut effective_all = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut effective = BTreeMap::new();
            if node.enabled {
                for (slot, binding) in &node.declared {
                    let available = match binding {
                        InputBinding::Source(name) => sources.contains_key(name),
                        InputBinding::Stage(id) => index.get(id).map_or(false, |&i| enabled[i]),
                    };
                    if available {
                        effective.insert(slot.clone(), binding.clone());
                    } else {
                        log::debug!(
                            "Stage '{}' slot '{}': {} unavailable, left unbound",
                            node.id,
                            slot,
                            binding
                        );
                    }
                }

                for slot in &node.stage.descriptor().slots {
                    if slot.required && !effective.contains_key(&slot.name) {
                        return Err(SnowError::MissingInput {
                            stage: node.id.clone(),
                            slot: slot.name.clone(),
                        });
                    }
                }
            }
            effective_all.push(effective);
        }

        // Kahn's algorithm; ties broken by declaration order
        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, effective) in effective_all.iter().enumerate() {
            let upstream: BTreeSet<usize> = effective
                .values()
                .filter_map(|b| match b {
                    InputBinding::Stage(id) => index.get(id).copied(),
                    InputBinding::Source(_) => None,
                })
                .collect();
            in_degree[i] = upstream.len();
            for u in upstream {
                dependents[u].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.nodes.len())
            .filter(|&i| enabled[i] && in_degree[i] == 0)
            .collect();
        let mut order = Vec::new();
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        let expected = enabled.iter().filter(|&&e| e).count();
        if order.len() < expected {
            let stuck: Vec<&str> = (0..self.nodes.len())
                .filter(|&i| enabled[i] && in_degree[i] > 0)
                .map(|i| self.nodes[i].id.as_str())
                .collect();
            return Err(SnowError::GraphValidation(format!(
                "cycle detected among stages: {}",
                stuck.join(", ")
            )));
        }

        for (node, effective) in self.nodes.iter_mut().zip(effective_all) {
            node.effective = effective;
        }
        Ok(order)
    }

    /// Run every enabled stage once, in resolved order
    pub fn execute(&mut self, sources: &SourceProducts) -> SnowResult<StageOutputs> {
        self.expect_state(PipelineState::Validated)?;
        self.state = PipelineState::Executing;

        let mut outputs = StageOutputs::new();
        for position in 0..self.order.len() {
            let i = self.order[position];
            self.nodes[i].state = StageState::Running;
            log::info!("Running stage '{}'", self.nodes[i].id);

            let result = {
                let node = &self.nodes[i];
                let mut inputs = BoundInputs::new(&node.id);
                for (slot, binding) in &node.effective {
                    let product = match binding {
                        InputBinding::Source(name) => sources.get(name),
                        InputBinding::Stage(id) => outputs.get(id),
                    };
                    if let Some(product) = product {
                        inputs.bind(slot, product);
                    }
                }
                node.stage.execute(&inputs, &node.params)
            };

            match result {
                Ok(product) => {
                    let node = &mut self.nodes[i];
                    log::info!(
                        "Stage '{}' done: '{}' with {} band(s)",
                        node.id,
                        product.name,
                        product.bands().len()
                    );
                    node.state = StageState::Done;
                    outputs.insert(node.id.clone(), product);
                }
                Err(e) => {
                    let stage = self.nodes[i].id.clone();
                    // definition and input errors keep their category
                    let err = match e {
                        SnowError::StageExecution { .. }
                        | SnowError::Definition(_)
                        | SnowError::MissingInput { .. } => e,
                        other => SnowError::StageExecution {
                            stage,
                            message: other.to_string(),
                        },
                    };
                    return Err(self.fail(err));
                }
            }
        }

        Ok(outputs)
    }

    /// Combine stage outputs into the final product
    pub fn assemble<F>(&mut self, outputs: &StageOutputs, assembler: F) -> SnowResult<Product>
    where
        F: FnOnce(&StageOutputs) -> SnowResult<Product>,
    {
        self.expect_state(PipelineState::Executing)?;
        match assembler(outputs) {
            Ok(product) => {
                self.state = PipelineState::Assembled;
                log::info!(
                    "Assembled '{}' with {} band(s)",
                    product.name,
                    product.bands().len()
                );
                Ok(product)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Validate (when still building), execute and assemble in one go
    pub fn run<F>(mut self, sources: &SourceProducts, assembler: F) -> SnowResult<PipelineRun>
    where
        F: FnOnce(&StageOutputs) -> SnowResult<Product>,
    {
        if self.state == PipelineState::Building {
            self.validate(sources)?;
        }
        let outputs = self.execute(sources)?;
        let product = self.assemble(&outputs, assembler)?;
        Ok(PipelineRun {
            product,
            order: self.execution_order().into_iter().map(String::from).collect(),
            stage_states: self
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.state))
                .collect(),
        })
    }

    /// Stage ids in resolved execution order (empty before validation)
    pub fn execution_order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.nodes[i].id.as_str()).collect()
    }

    pub fn stage_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    pub fn stage_state(&self, id: &str) -> Option<StageState> {
        self.node(id).map(|n| n.state)
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.node(id).map_or(false, |n| n.enabled)
    }

    pub fn params(&self, id: &str) -> Option<&ParamSet> {
        self.node(id).map(|n| &n.params)
    }

    /// Bands a stage promises with its resolved parameters; `None` when the
    /// stage is unknown or disabled
    pub fn planned_outputs(&self, id: &str) -> Option<Vec<String>> {
        let node = self.node(id).filter(|n| n.enabled)?;
        Some(
            node.stage
                .descriptor()
                .expected_outputs(&node.params)
                .into_iter()
                .map(String::from)
                .collect(),
        )
    }

    /// Bindings in effect after validation
    pub fn bindings(&self, id: &str) -> Option<&BTreeMap<String, InputBinding>> {
        self.node(id).map(|n| &n.effective)
    }

    fn node(&self, id: &str) -> Option<&StageNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn expect_state(&mut self, expected: PipelineState) -> SnowResult<()> {
        if self.state == expected {
            return Ok(());
        }
        let err = SnowError::GraphValidation(format!(
            "pipeline is {:?}, expected {:?}",
            self.state, expected
        ));
        Err(self.fail(err))
    }

    fn fail(&mut self, err: SnowError) -> SnowError {
        log::debug!("Pipeline failed: {}", err);
        self.state = PipelineState::Failed;
        err
    }
}
