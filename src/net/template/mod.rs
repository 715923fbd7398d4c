//! Template builder: derives an output descriptor for every layer the
//! subnetwork needs, without evaluating anything.
//!
//! Construction resolves `output`, then `end`, then every layer that carries
//! a loss or is flagged as an output. Resolving a layer resolves its inputs
//! first. A layer whose inputs are not all known yet (a forward reference,
//! or a `prev:` reference to a layer still under construction) is
//! initialized provisionally and reconstructed by the refinement loop until
//! a pass changes nothing.
//!
//! Each construction attempt goes through three tiers (see [`Tier`]):
//! strict, lenient, and full. Transient failures are recorded once per site
//! and retried; any other failure aborts construction.

mod context;
#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};

use burn::prelude::Backend;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::Map;
use tracing::{debug, warn};

use crate::config::{
    InitialOutput, LayerSpec, NetDict, RecOptions, SourceRef, END_LAYER, OUTPUT_LAYER, SOURCE_KEY,
    STEP_INDEX,
};
use crate::error::BuildError;
use crate::layers::choice::ChoiceConfig;
use crate::layers::{CellUnit, DescribeCtx, LayerClass, LayerKind, LayerRegistry, LossKind};
use crate::net::descriptor::{OutputDesc, SearchBeam};
use crate::net::node::{EdgeKind, InputRef, NodeArena, NodeId, SearchChoicesInfo};

use self::context::{BuilderContext, Tier};

// ─── Environment and results ───────────────────────────────────────

/// Descriptors of everything outside the subnetwork it may read.
#[derive(Clone, Debug, Default)]
pub struct TemplateEnv {
    /// Extern data (`data:<key>`), one frame per step.
    pub data: BTreeMap<String, OutputDesc>,
    /// Outer-scope layers (`base:<name>`), constant over the loop.
    pub base: BTreeMap<String, OutputDesc>,
}

impl TemplateEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(mut self, key: &str, desc: OutputDesc) -> Self {
        self.data.insert(key.to_string(), desc);
        self
    }

    pub fn with_base(mut self, name: &str, desc: OutputDesc) -> Self {
        self.base.insert(name.to_string(), desc);
        self
    }
}

/// How the step loop decides how many steps to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LengthMode {
    Fixed(usize),
    /// The length of the target sequence.
    Target(String),
    /// Until every hypothesis signals `end`, at most `cap` steps.
    Dynamic { cap: usize },
    /// The length of `data:source`.
    Source,
}

/// What construction recovered from along the way.
#[derive(Clone, Debug, Default)]
pub struct TemplateReport {
    /// Transient errors, one per (layer, kind).
    pub recovered: Vec<BuildError>,
    pub refinement_passes: usize,
    /// Layers whose provisional descriptor was accepted as final.
    pub best_effort: Vec<String>,
}

/// Everything the driver needs to know about one template node.
#[derive(Clone, Debug)]
pub struct LayerInfo {
    pub id: NodeId,
    pub name: String,
    /// The layer definition; for sub-layers, the definition of the root.
    pub spec: LayerSpec,
    pub kind: LayerKind,
    pub desc: OutputDesc,
    pub input_descs: Vec<OutputDesc>,
    /// Reference strings of the inputs, used to name parameters.
    pub input_names: Vec<String>,
    pub unit: Option<CellUnit>,
    /// Extern data key of the layer's target.
    pub target: Option<String>,
    pub loss: Option<LossKind>,
}

impl LayerInfo {
    pub fn is_sub_layer(&self) -> bool {
        self.name != self.spec.name
    }
}

/// A fully constructed subnetwork template.
#[derive(Clone, Debug)]
pub struct Template {
    arena: NodeArena,
    layers: BTreeMap<NodeId, LayerInfo>,
    /// Template nodes in current-step dependency order.
    order: Vec<NodeId>,
    needed: Vec<NodeId>,
    length: LengthMode,
    options: RecOptions,
    env: TemplateEnv,
    report: TemplateReport,
}

impl Template {
    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn id(&self, name: &str) -> Option<NodeId> {
        self.arena.id(name).filter(|id| self.layers.contains_key(id))
    }

    pub fn layer(&self, id: NodeId) -> Option<&LayerInfo> {
        self.layers.get(&id)
    }

    pub fn layer_by_name(&self, name: &str) -> Option<&LayerInfo> {
        self.id(name).and_then(|id| self.layers.get(&id))
    }

    /// All layers in execution order.
    pub fn layers(&self) -> impl Iterator<Item = &LayerInfo> {
        self.order.iter().filter_map(|id| self.layers.get(id))
    }

    pub fn descriptor(&self, name: &str) -> Option<&OutputDesc> {
        self.layer_by_name(name).map(|l| &l.desc)
    }

    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// `output`, `end`, and every loss-bearing or output-flagged layer.
    pub fn needed(&self) -> &[NodeId] {
        &self.needed
    }

    pub fn length_mode(&self) -> &LengthMode {
        &self.length
    }

    pub fn options(&self) -> &RecOptions {
        &self.options
    }

    pub fn env(&self) -> &TemplateEnv {
        &self.env
    }

    pub fn report(&self) -> &TemplateReport {
        &self.report
    }

    /// A choice layer that runs beam search.
    pub fn is_search_choice(&self, id: NodeId) -> bool {
        self.options.search && self.arena.node(id).search_choices.is_some()
    }

    /// Template nodes some layer reads one step back.
    pub fn prev_read(&self) -> BTreeSet<NodeId> {
        self.order
            .iter()
            .flat_map(|&id| self.arena.prev_deps(id).collect::<Vec<_>>())
            .collect()
    }
}

// ─── TemplateBuilder ───────────────────────────────────────────────

pub struct TemplateBuilder<'a, B: Backend> {
    net: &'a NetDict,
    registry: &'a LayerRegistry<B>,
    env: &'a TemplateEnv,
    options: RecOptions,
    arena: NodeArena,
    /// Implicit layers such as the step counter.
    implicit: BTreeMap<String, LayerSpec>,
    /// Last input descriptors seen per node, for sub-output derivation.
    input_descs: BTreeMap<NodeId, Vec<Option<OutputDesc>>>,
    /// Search choice → the choice whose beam its inputs live in.
    choice_parents: BTreeMap<String, Option<String>>,
}

impl<'a, B: Backend> TemplateBuilder<'a, B> {
    pub fn new(net: &'a NetDict, registry: &'a LayerRegistry<B>, env: &'a TemplateEnv) -> Self {
        Self {
            net,
            registry,
            env,
            options: RecOptions::default(),
            arena: NodeArena::new(),
            implicit: BTreeMap::new(),
            input_descs: BTreeMap::new(),
            choice_parents: BTreeMap::new(),
        }
    }

    pub fn with_options(mut self, options: RecOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(mut self) -> Result<Template, BuildError> {
        if !self.net.contains(OUTPUT_LAYER) {
            return Err(BuildError::MissingOutput);
        }
        if self.options.fixed_length == Some(0) {
            return Err(BuildError::InvalidOption {
                layer: "".to_string(),
                key: "fixed_length".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let mut ctx = BuilderContext::default();
        let roots = self.roots();
        for name in &roots {
            let id = self.node_for(name)?;
            match self.build_node(id, &mut ctx) {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => {
                    ctx.partially_finished.insert(id);
                }
                Err(e) => return Err(e),
            }
        }
        let passes = self.refine(&mut ctx)?;
        self.finish(ctx, &roots, passes)
    }

    fn roots(&self) -> Vec<String> {
        let mut roots = vec![OUTPUT_LAYER.to_string()];
        if self.net.contains(END_LAYER) {
            roots.push(END_LAYER.to_string());
        }
        for spec in self.net.layers() {
            if (spec.loss.is_some() || spec.is_output_layer) && !roots.contains(&spec.name) {
                roots.push(spec.name.clone());
            }
        }
        roots
    }

    // ── Refinement ────────────────────────────────────────────────

    /// Reconstruct partially finished nodes until a pass makes no progress.
    /// The number of passes is bounded by the initial number of such nodes.
    fn refine(&mut self, ctx: &mut BuilderContext) -> Result<usize, BuildError> {
        let budget = ctx.partially_finished.len().max(1);
        let mut passes = 0;
        while !ctx.partially_finished.is_empty() && passes < budget {
            passes += 1;
            ctx.initialized = false;
            ctx.changed = false;
            let pending: Vec<NodeId> = ctx.partially_finished.iter().copied().collect();
            // Later nodes are usually dependencies of earlier ones.
            for &id in pending.iter().rev() {
                match self.run_tiers(id, ctx) {
                    Ok(()) => {}
                    Err(e) if e.is_recoverable() => {}
                    Err(e) => return Err(e),
                }
            }
            let shrank = ctx.partially_finished.len() < pending.len();
            debug!(
                pass = passes,
                pending = pending.len(),
                remaining = ctx.partially_finished.len(),
                changed = ctx.changed,
                "template refinement pass"
            );
            if !shrank && !ctx.initialized && !ctx.changed {
                break;
            }
        }
        Ok(passes)
    }

    fn finish(
        mut self,
        mut ctx: BuilderContext,
        roots: &[String],
        passes: usize,
    ) -> Result<Template, BuildError> {
        let unfinished: Vec<String> = self
            .arena
            .templates()
            .filter(|&id| !self.arena.is_initialized(id))
            .map(|id| self.arena.name(id).to_string())
            .collect();
        if !unfinished.is_empty() {
            return Err(BuildError::TemplateIncomplete {
                unfinished,
                stack: ctx.last_stack_names(&self.arena),
                errors: ctx.messages(),
            });
        }

        let mut best_effort = Vec::new();
        let leftover: Vec<NodeId> = ctx.partially_finished.iter().copied().collect();
        for id in leftover {
            self.arena.finalize(id);
            best_effort.push(self.arena.name(id).to_string());
        }
        ctx.partially_finished.clear();
        let mirrored: Vec<NodeId> = self
            .arena
            .templates()
            .filter(|&id| self.arena.prev_of(id).is_some())
            .collect();
        for id in mirrored {
            self.arena.copy_as_prev(id);
        }

        let order = self.current_step_order()?;
        let mut layers = BTreeMap::new();
        for &id in &order {
            let info = self.layer_info(id)?;
            layers.insert(id, info);
        }
        self.check_initial_outputs(&layers)?;
        let length = self.length_mode(&layers)?;

        for err in ctx.errors() {
            warn!(
                layer = err.layer().unwrap_or(""),
                kind = err.kind(),
                "recovered during template construction: {}",
                err
            );
        }
        let needed = roots.iter().filter_map(|n| self.arena.id(n)).collect();
        Ok(Template {
            arena: self.arena,
            layers,
            order,
            needed,
            length,
            options: self.options,
            env: self.env.clone(),
            report: TemplateReport {
                recovered: ctx.errors().to_vec(),
                refinement_passes: passes,
                best_effort,
            },
        })
    }

    // ── Retry policy ──────────────────────────────────────────────

    fn build_node(&mut self, id: NodeId, ctx: &mut BuilderContext) -> Result<(), BuildError> {
        if self.arena.is_initialized(id) {
            return Ok(());
        }
        self.run_tiers(id, ctx)
    }

    /// Strict, then lenient, then full construction. A construction loop in
    /// the full tier is tolerated when the node already has a provisional
    /// descriptor.
    fn run_tiers(&mut self, id: NodeId, ctx: &mut BuilderContext) -> Result<(), BuildError> {
        for tier in [Tier::Strict, Tier::Lenient] {
            match self.construct(id, ctx, tier) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() => {
                    debug!(layer = self.arena.name(id), ?tier, error = %e, "construction retry");
                    ctx.record(e);
                }
                Err(e) => return Err(e),
            }
        }
        match self.construct(id, ctx, Tier::Full) {
            Ok(()) => Ok(()),
            Err(e) if e.is_recoverable() => {
                let tolerated = matches!(e, BuildError::ConstructionLoop { .. })
                    && self.arena.is_initialized(id);
                ctx.record(e.clone());
                ctx.partially_finished.insert(id);
                if tolerated {
                    Ok(())
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    // ── Construction ──────────────────────────────────────────────

    fn construct(
        &mut self,
        id: NodeId,
        ctx: &mut BuilderContext,
        tier: Tier,
    ) -> Result<(), BuildError> {
        let name = self.arena.name(id).to_string();
        ctx.push(id);
        let result = match sub_layer(&name) {
            Some((root, key)) if !self.net.contains(&name) => {
                self.construct_sub(id, &name, root, key, ctx, tier)
            }
            _ => self.construct_layer(id, &name, ctx, tier),
        };
        ctx.pop();
        result
    }

    fn construct_layer(
        &mut self,
        id: NodeId,
        name: &str,
        ctx: &mut BuilderContext,
        tier: Tier,
    ) -> Result<(), BuildError> {
        let spec = self.spec(name)?;
        let class = self.class_of(&spec)?;
        let unit = self.registry.unit_of(&spec)?;
        let refs = input_refs(&spec, &class);

        let mut inputs = Vec::with_capacity(refs.len());
        let mut descs = Vec::with_capacity(refs.len());
        let mut provisional = false;
        for r in &refs {
            let (input, desc, unsure) = self.resolve_input(id, name, r, ctx, tier)?;
            provisional |= unsure || desc.is_none();
            inputs.push(input);
            descs.push(desc);
        }

        let dctx = DescribeCtx {
            spec: &spec,
            inputs: descs.clone(),
            target: self.target_desc(&spec),
            unit,
            search: self.options.search,
        };
        let desc = (class.describe)(&dctx)?;

        let search_choices = self.search_choices(&spec, &class, refs.len())?;
        let (input_beam, unsure) = self.common_beam(name, &descs, false)?;
        provisional |= unsure;
        let beam = match &search_choices {
            Some(info) => {
                self.choice_parents.insert(
                    name.to_string(),
                    input_beam.as_ref().map(|b| b.choice.clone()),
                );
                let size = if info.keep_beams {
                    input_beam.as_ref().map_or(1, |b| b.size)
                } else {
                    info.beam_size
                };
                Some(SearchBeam {
                    choice: name.to_string(),
                    size,
                })
            }
            None => input_beam,
        };

        let node = self.arena.node_mut(id);
        node.inputs = inputs;
        node.search_choices = search_choices;
        self.input_descs.insert(id, descs);
        self.store(id, desc.with_beam(beam), &spec.class, provisional, ctx)
    }

    /// `root/key`: a sub-output of layer `root`.
    fn construct_sub(
        &mut self,
        id: NodeId,
        name: &str,
        root_name: &str,
        key: &str,
        ctx: &mut BuilderContext,
        tier: Tier,
    ) -> Result<(), BuildError> {
        let root = self.node_for(root_name)?;
        self.arena.add_dependency(id, root, EdgeKind::Current);
        let (root_desc, unsure) = match self.resolve_current(name, root, ctx, tier)? {
            (Some(desc), unsure) => (desc, unsure),
            (None, _) => {
                return Err(BuildError::MissingDescriptor {
                    layer: name.to_string(),
                    input: root_name.to_string(),
                })
            }
        };
        let spec = self.spec(root_name)?;
        let class = self.class_of(&spec)?;
        let dctx = DescribeCtx {
            spec: &spec,
            inputs: self.input_descs.get(&root).cloned().unwrap_or_default(),
            target: self.target_desc(&spec),
            unit: self.registry.unit_of(&spec)?,
            search: self.options.search,
        };
        let desc = class
            .sub_output
            .and_then(|sub| sub(&dctx, &root_desc, key))
            .ok_or_else(|| BuildError::UnknownLayer {
                layer: name.to_string(),
            })?;

        let node = self.arena.node_mut(id);
        node.inputs = vec![InputRef::Current(root)];
        node.sub_of = Some((root, key.to_string()));
        self.store(id, desc.with_beam(root_desc.beam.clone()), &spec.class, unsure, ctx)
    }

    fn store(
        &mut self,
        id: NodeId,
        desc: OutputDesc,
        class: &str,
        provisional: bool,
        ctx: &mut BuilderContext,
    ) -> Result<(), BuildError> {
        if self.arena.is_initialized(id) {
            if self.arena.refine(id, desc, provisional)? {
                ctx.changed = true;
            }
        } else {
            self.arena.init(id, desc, class, provisional)?;
            ctx.initialized = true;
        }
        if provisional {
            ctx.partially_finished.insert(id);
        } else {
            ctx.partially_finished.remove(&id);
        }
        Ok(())
    }

    // ── Input resolution ──────────────────────────────────────────

    /// Wire one input reference. Returns the wiring, the input descriptor
    /// if known, and whether that descriptor may still change.
    fn resolve_input(
        &mut self,
        id: NodeId,
        layer: &str,
        reference: &SourceRef,
        ctx: &mut BuilderContext,
        tier: Tier,
    ) -> Result<(InputRef, Option<OutputDesc>, bool), BuildError> {
        match reference {
            SourceRef::Current(_) | SourceRef::StepIndex => {
                let dep_name = match reference {
                    SourceRef::Current(n) => n.as_str(),
                    _ => STEP_INDEX,
                };
                let dep = self.node_for(dep_name)?;
                self.arena.add_dependency(id, dep, EdgeKind::Current);
                let (desc, unsure) = self.resolve_current(layer, dep, ctx, tier)?;
                Ok((InputRef::Current(dep), desc, unsure))
            }
            SourceRef::Prev(dep_name) => {
                let dep = self.node_for(dep_name)?;
                let (prev, unsure) = self.resolve_prev(dep, ctx)?;
                self.arena.add_dependency(id, prev, EdgeKind::Prev);
                let desc = self.arena.descriptor(prev).ok().cloned();
                Ok((InputRef::Prev(dep), desc, unsure))
            }
            SourceRef::Data(key) => match self.env.data.get(key) {
                Some(desc) => Ok((InputRef::Data(key.clone()), Some(desc.clone()), false)),
                None => Err(BuildError::UnknownData {
                    layer: layer.to_string(),
                    key: key.clone(),
                }),
            },
            SourceRef::Base(base) => match self.env.base.get(base) {
                Some(desc) => Ok((InputRef::Base(base.clone()), Some(desc.clone()), false)),
                None => Err(BuildError::UnknownBase {
                    layer: layer.to_string(),
                    name: base.clone(),
                }),
            },
        }
    }

    fn resolve_current(
        &mut self,
        layer: &str,
        dep: NodeId,
        ctx: &mut BuilderContext,
        tier: Tier,
    ) -> Result<(Option<OutputDesc>, bool), BuildError> {
        if self.arena.is_initialized(dep) {
            if tier == Tier::Full && self.arena.node(dep).is_provisional() && !ctx.on_stack(dep) {
                if let Err(e) = self.construct(dep, ctx, Tier::Full) {
                    if !e.is_recoverable() {
                        return Err(e);
                    }
                    ctx.record(e);
                }
            }
            let node = self.arena.node(dep);
            let unsure = node.is_provisional() && !ctx.on_stack(dep);
            return Ok((node.output_descriptor().ok().cloned(), unsure));
        }
        if ctx.on_stack(dep) {
            return match tier {
                Tier::Lenient => Ok((None, true)),
                Tier::Strict | Tier::Full => Err(self.loop_error(dep, ctx)),
            };
        }
        if ctx.partially_finished.contains(&dep) && tier != Tier::Full {
            // Failed earlier in this pass; the refinement loop retries it.
            return match tier {
                Tier::Strict => Err(BuildError::MissingDescriptor {
                    layer: layer.to_string(),
                    input: self.arena.name(dep).to_string(),
                }),
                _ => Ok((None, true)),
            };
        }
        match self.run_tiers(dep, ctx) {
            Ok(()) => {
                let node = self.arena.node(dep);
                Ok((node.output_descriptor().ok().cloned(), node.is_provisional()))
            }
            Err(e) if e.is_recoverable() && tier == Tier::Lenient => Ok((None, true)),
            Err(e) => Err(e),
        }
    }

    /// The previous-step view of `dep`. A `prev:` reference never recurses
    /// into a node under construction; it sees the placeholder instead.
    fn resolve_prev(
        &mut self,
        dep: NodeId,
        ctx: &mut BuilderContext,
    ) -> Result<(NodeId, bool), BuildError> {
        if !self.arena.is_initialized(dep)
            && !ctx.on_stack(dep)
            && !ctx.partially_finished.contains(&dep)
        {
            if let Err(e) = self.run_tiers(dep, ctx) {
                if !e.is_recoverable() {
                    return Err(e);
                }
            }
        }
        // A provisional descriptor is good enough one step back; only a
        // missing one forces another pass.
        let unsure = !self.arena.is_initialized(dep);
        Ok((self.arena.copy_as_prev(dep), unsure))
    }

    fn loop_error(&self, dep: NodeId, ctx: &BuilderContext) -> BuildError {
        let mut stack = ctx.stack_names(&self.arena);
        stack.push(self.arena.name(dep).to_string());
        BuildError::ConstructionLoop {
            layer: self.arena.name(dep).to_string(),
            stack,
        }
    }

    // ── Search beams ──────────────────────────────────────────────

    fn search_choices(
        &self,
        spec: &LayerSpec,
        class: &LayerClass<B>,
        sources: usize,
    ) -> Result<Option<SearchChoicesInfo>, BuildError> {
        if class.kind != LayerKind::Choice || !self.options.search {
            return Ok(None);
        }
        let cfg = ChoiceConfig::from_spec(spec, sources)?;
        Ok(Some(SearchChoicesInfo {
            beam_size: cfg.beam_size,
            keep_beams: cfg.keep_beams,
        }))
    }

    /// The newest beam among the inputs. Every other input beam must be an
    /// ancestor of it. While a choice involved is still provisional the
    /// answer is only a guess and the layer stays provisional; with `settled`
    /// every choice is treated as final.
    fn common_beam(
        &self,
        layer: &str,
        descs: &[Option<OutputDesc>],
        settled: bool,
    ) -> Result<(Option<SearchBeam>, bool), BuildError> {
        let mut common: Option<SearchBeam> = None;
        let mut unsure = false;
        for beam in descs.iter().flatten().filter_map(|d| d.beam.as_ref()) {
            self.check_beam_size(layer, beam)?;
            let current = match common.take() {
                None => {
                    common = Some(beam.clone());
                    continue;
                }
                Some(c) => c,
            };
            if current.choice == beam.choice {
                if current.size != beam.size {
                    return Err(BuildError::InconsistentBeam {
                        layer: layer.to_string(),
                        choice: beam.choice.clone(),
                        expected: current.size,
                        found: beam.size,
                    });
                }
                common = Some(current);
            } else if self.is_ancestor(&current.choice, &beam.choice) {
                common = Some(beam.clone());
            } else if self.is_ancestor(&beam.choice, &current.choice) {
                common = Some(current);
            } else if settled || (self.is_settled(&current.choice) && self.is_settled(&beam.choice))
            {
                return Err(BuildError::IncompatibleSearch {
                    layer: layer.to_string(),
                    first: current.choice,
                    second: beam.choice.clone(),
                });
            } else {
                unsure = true;
                common = Some(current);
            }
        }
        Ok((common, unsure))
    }

    fn check_beam_size(&self, layer: &str, beam: &SearchBeam) -> Result<(), BuildError> {
        let Some(id) = self.arena.id(&beam.choice) else {
            return Ok(());
        };
        match &self.arena.node(id).search_choices {
            Some(info) if !info.keep_beams && info.beam_size != beam.size => {
                Err(BuildError::InconsistentBeam {
                    layer: layer.to_string(),
                    choice: beam.choice.clone(),
                    expected: info.beam_size,
                    found: beam.size,
                })
            }
            _ => Ok(()),
        }
    }

    /// Whether choice `a`'s beam is `b`'s beam or one `b` extends.
    fn is_ancestor(&self, a: &str, b: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut current = Some(b.to_string());
        while let Some(choice) = current {
            if choice == a {
                return true;
            }
            if !seen.insert(choice.clone()) {
                return false;
            }
            current = self.choice_parents.get(&choice).cloned().flatten();
        }
        false
    }

    fn is_settled(&self, choice: &str) -> bool {
        self.choice_parents.contains_key(choice)
            && self
                .arena
                .id(choice)
                .is_some_and(|id| self.arena.is_initialized(id) && !self.arena.node(id).is_provisional())
    }

    // ── Lookups ───────────────────────────────────────────────────

    /// The node for a referenced name, created on first reference.
    fn node_for(&mut self, name: &str) -> Result<NodeId, BuildError> {
        if name == STEP_INDEX {
            self.implicit
                .entry(STEP_INDEX.to_string())
                .or_insert_with(step_index_spec);
        } else if !self.net.contains(name) {
            match sub_layer(name) {
                Some((root, _)) if self.net.contains(root) => {}
                _ => {
                    return Err(BuildError::UnknownLayer {
                        layer: name.to_string(),
                    })
                }
            }
        }
        Ok(self.arena.get_or_create(name))
    }

    fn spec(&self, name: &str) -> Result<LayerSpec, BuildError> {
        self.net
            .get(name)
            .or_else(|| self.implicit.get(name))
            .cloned()
            .ok_or_else(|| BuildError::UnknownLayer {
                layer: name.to_string(),
            })
    }

    fn class_of(&self, spec: &LayerSpec) -> Result<LayerClass<B>, BuildError> {
        self.registry
            .class(&spec.class)
            .copied()
            .ok_or_else(|| BuildError::UnknownClass {
                layer: spec.name.clone(),
                class: spec.class.clone(),
            })
    }

    fn target_key(&self, spec: &LayerSpec) -> Option<String> {
        spec.target.clone().or_else(|| self.options.target.clone())
    }

    fn target_desc(&self, spec: &LayerSpec) -> Option<OutputDesc> {
        self.target_key(spec)
            .and_then(|key| self.env.data.get(&key).cloned())
    }

    // ── Validation ────────────────────────────────────────────────

    /// Order template nodes by current-step edges. A cycle among them is a
    /// configuration error; `prev:` edges never count.
    fn current_step_order(&self) -> Result<Vec<NodeId>, BuildError> {
        let mut graph = DiGraph::<NodeId, ()>::new();
        let mut index = BTreeMap::new();
        for id in self.arena.templates() {
            index.insert(id, graph.add_node(id));
        }
        for (&id, &ix) in &index {
            for dep in self.arena.current_deps(id) {
                if let Some(&dx) = index.get(&dep) {
                    graph.add_edge(dx, ix, ());
                }
            }
        }
        match toposort(&graph, None) {
            Ok(_) => Ok(stable_order(&graph)),
            Err(_) => {
                let cycle = tarjan_scc(&graph)
                    .into_iter()
                    .find(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
                    .map(|scc| {
                        let mut names: Vec<String> = scc
                            .iter()
                            .map(|&ix| self.arena.name(graph[ix]).to_string())
                            .collect();
                        names.sort();
                        names
                    })
                    .unwrap_or_default();
                Err(BuildError::CyclicDependency { cycle })
            }
        }
    }

    fn layer_info(&self, id: NodeId) -> Result<LayerInfo, BuildError> {
        let node = self.arena.node(id);
        let desc = node.output_descriptor()?.clone();
        let spec = match &node.sub_of {
            Some((root, _)) => self.spec(self.arena.name(*root))?,
            None => self.spec(&node.name)?,
        };
        let class = self.class_of(&spec)?;

        let mut input_descs = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            let desc = match input {
                InputRef::Current(dep) | InputRef::Prev(dep) => self.arena.descriptor(*dep)?.clone(),
                InputRef::Data(key) => self.env.data.get(key).cloned().ok_or_else(|| {
                    BuildError::UnknownData {
                        layer: node.name.clone(),
                        key: key.clone(),
                    }
                })?,
                InputRef::Base(base) => self.env.base.get(base).cloned().ok_or_else(|| {
                    BuildError::UnknownBase {
                        layer: node.name.clone(),
                        name: base.clone(),
                    }
                })?,
            };
            input_descs.push(desc);
        }
        let input_names = match &node.sub_of {
            Some((root, _)) => vec![self.arena.name(*root).to_string()],
            None => input_refs(&spec, &class)
                .iter()
                .map(|r| r.to_string())
                .collect(),
        };
        if node.sub_of.is_none() {
            let known: Vec<Option<OutputDesc>> = input_descs.iter().cloned().map(Some).collect();
            self.common_beam(&node.name, &known, true)?;
        }
        let loss = if node.sub_of.is_none() {
            LossKind::parse(&spec)?
        } else {
            None
        };
        let target = match (&spec.target, class.kind, loss) {
            (Some(t), _, _) => Some(t.clone()),
            (None, LayerKind::Choice, _) | (None, _, Some(_)) => self.options.target.clone(),
            _ => None,
        };
        Ok(LayerInfo {
            id,
            name: node.name.clone(),
            kind: class.kind,
            desc,
            input_descs,
            input_names,
            unit: self.registry.unit_of(&spec)?,
            target,
            loss,
            spec,
        })
    }

    /// Initial values of `prev:` references must fit the layer they stand in for.
    fn check_initial_outputs(&self, layers: &BTreeMap<NodeId, LayerInfo>) -> Result<(), BuildError> {
        for (&id, info) in layers {
            if self.arena.prev_of(id).is_none() || info.is_sub_layer() {
                continue;
            }
            match &info.spec.initial_output {
                InitialOutput::Vector(v) if info.desc.sparse || v.len() != info.desc.width() => {
                    return Err(BuildError::InvalidOption {
                        layer: info.name.clone(),
                        key: "initial_output".to_string(),
                        reason: format!(
                            "a vector of {} values does not fit output {}",
                            v.len(),
                            info.desc
                        ),
                    });
                }
                InitialOutput::Base(base) if !self.env.base.contains_key(base) => {
                    return Err(BuildError::UnknownBase {
                        layer: info.name.clone(),
                        name: base.clone(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Length source, by priority: fixed length, target sequence (without
    /// search), the `end` layer, the source sequence.
    fn length_mode(&self, layers: &BTreeMap<NodeId, LayerInfo>) -> Result<LengthMode, BuildError> {
        if let Some(n) = self.options.fixed_length {
            return Ok(LengthMode::Fixed(n));
        }
        if !self.options.search {
            if let Some(target) = &self.options.target {
                if self.env.data.contains_key(target) {
                    return Ok(LengthMode::Target(target.clone()));
                }
            }
        }
        if let Some(end) = self.arena.id(END_LAYER).and_then(|id| layers.get(&id)) {
            if !end.desc.sparse || end.desc.width() != 1 {
                return Err(BuildError::InvalidOption {
                    layer: END_LAYER.to_string(),
                    key: "class".to_string(),
                    reason: format!("must produce one flag per hypothesis, got {}", end.desc),
                });
            }
            return Ok(LengthMode::Dynamic {
                cap: self.options.step_cap(),
            });
        }
        if self.env.data.contains_key(SOURCE_KEY) {
            return Ok(LengthMode::Source);
        }
        Err(BuildError::NoLengthSource)
    }
}

/// Topological order that always picks the earliest created node first.
fn stable_order(graph: &DiGraph<NodeId, ()>) -> Vec<NodeId> {
    let mut indegree: BTreeMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|ix| (ix, graph.neighbors_directed(ix, Direction::Incoming).count()))
        .collect();
    let mut ready: BTreeSet<(NodeId, NodeIndex)> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&ix, _)| (graph[ix], ix))
        .collect();
    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(first) = ready.iter().next().copied() {
        ready.remove(&first);
        order.push(first.0);
        for next in graph.neighbors_directed(first.1, Direction::Outgoing) {
            if let Some(d) = indegree.get_mut(&next) {
                *d -= 1;
                if *d == 0 {
                    ready.insert((graph[next], next));
                }
            }
        }
    }
    order
}

fn sub_layer(name: &str) -> Option<(&str, &str)> {
    name.split_once('/')
        .filter(|(root, key)| !root.is_empty() && !key.is_empty())
}

fn input_refs<B: Backend>(spec: &LayerSpec, class: &LayerClass<B>) -> Vec<SourceRef> {
    match &spec.from {
        Some(refs) => refs.clone(),
        None if class.default_source => vec![SourceRef::Data(SOURCE_KEY.to_string())],
        None => Vec::new(),
    }
}

fn step_index_spec() -> LayerSpec {
    LayerSpec {
        name: STEP_INDEX.to_string(),
        class: STEP_INDEX.to_string(),
        from: Some(Vec::new()),
        is_output_layer: false,
        loss: None,
        target: None,
        initial_output: InitialOutput::Zeros,
        options: Map::new(),
    }
}
