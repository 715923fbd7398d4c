//! Step-loop driver.
//!
//! Runs a built plan: pre-loop layers once over all frames, in-loop layers
//! once per step, then beam resolution and the post-loop layers over the
//! stacked results.
//!
//! The loop itself is INIT → RUNNING → TERMINATED. INIT fills the values a
//! `prev:` reference sees on step 0 and the cells' auxiliary state.
//! RUNNING evaluates one step at a time. The loop terminates at the step
//! bound or, with an `end` layer, once every hypothesis has ended.

use std::collections::BTreeMap;

use burn::prelude::*;
use tracing::{debug, trace};

use crate::config::{InitialOutput, END_LAYER, OUTPUT_LAYER, SOURCE_KEY};
use crate::error::ExecError;
use crate::exec::accum::Accumulator;
use crate::exec::search::{search_step, SearchInput, SearchRecord};
use crate::exec::value::{
    dense_tensor, index_tensor, labels_tensor, tensor_to_f32, BeamRef, Stacked, StepValue, Value,
};
use crate::layers::basic::Activation;
use crate::layers::choice::ChoiceConfig;
use crate::layers::loss::reduce_frames;
use crate::layers::{ForwardCtx, LayerClass, LayerRegistry, ParamStore, Produced};
use crate::net::hoist::{Partition, Placement};
use crate::net::node::{InputRef, NodeId};
use crate::net::template::{LayerInfo, LengthMode, Template};
use crate::rec::{RecInputs, RecOutput};

#[cfg(test)]
mod tests;

/// Result of a pre-loop layer.
#[derive(Clone, Debug)]
enum Hoisted<B: Backend> {
    /// Identical at every step, one row per batch entry.
    Invariant(Value<B>),
    /// One frame per step.
    PerStep(Stacked<B>),
}

impl<B: Backend> Hoisted<B> {
    /// The value a loop step sees, `None` past the last frame.
    fn frame(&self, step: usize) -> Option<Value<B>> {
        match self {
            Hoisted::Invariant(v) => Some(v.clone()),
            Hoisted::PerStep(s) if step < s.steps() => Some(s.step(step)),
            Hoisted::PerStep(_) => None,
        }
    }

    /// `frames` steps flattened time-major.
    fn flat(&self, frames: usize, layer: &str) -> Result<Value<B>, ExecError> {
        match self {
            Hoisted::Invariant(v) => Value::cat_rows(vec![v.clone(); frames], layer),
            Hoisted::PerStep(s) => Ok(s.truncate(frames).flatten()),
        }
    }
}

/// Auxiliary state of one cell, with the beam its rows belong to.
#[derive(Clone, Debug)]
struct AuxState<B: Backend> {
    parts: Vec<Tensor<B, 2>>,
    beam: Option<BeamRef>,
}

/// Ended flags and step counts of the live hypotheses.
#[derive(Clone, Debug)]
struct HypState {
    ended: Vec<bool>,
    lengths: Vec<usize>,
    beam: Option<BeamRef>,
}

impl HypState {
    fn new(batch: usize) -> Self {
        Self {
            ended: vec![false; batch],
            lengths: vec![0; batch],
            beam: None,
        }
    }

    /// Flags and lengths seen from the rows of `to`.
    fn view(
        &self,
        record: &SearchRecord,
        to: Option<BeamRef>,
        batch: usize,
    ) -> Option<(Vec<bool>, Vec<usize>)> {
        let rows = record.rows_between(self.beam, to, batch)?;
        Some((
            rows.iter().map(|&r| self.ended[r]).collect(),
            rows.iter().map(|&r| self.lengths[r]).collect(),
        ))
    }

    /// One more step for every live hypothesis, without end flags.
    fn tick(&mut self) {
        for (len, ended) in self.lengths.iter_mut().zip(&self.ended) {
            if !ended {
                *len += 1;
            }
        }
    }

    /// Follow the `end` layer's flags of one step.
    fn advance<B: Backend>(
        &self,
        record: &SearchRecord,
        flags: &StepValue<B>,
        batch: usize,
        step: usize,
    ) -> Result<HypState, ExecError> {
        let (ended, lengths) =
            self.view(record, flags.beam, batch)
                .ok_or_else(|| ExecError::NotAncestor {
                    layer: END_LAYER.to_string(),
                    step,
                })?;
        let mut next = HypState {
            ended,
            lengths,
            beam: flags.beam,
        };
        next.tick();
        for (ended, flag) in next.ended.iter_mut().zip(flags.value.to_labels(END_LAYER)?) {
            *ended |= flag != 0;
        }
        Ok(next)
    }

    fn all_ended(&self) -> bool {
        self.ended.iter().all(|&e| e)
    }

    fn ended_count(&self) -> usize {
        self.ended.iter().filter(|&&e| e).count()
    }
}

/// Values produced during one step.
struct StepFrame<B: Backend> {
    current: BTreeMap<NodeId, StepValue<B>>,
    extras: BTreeMap<NodeId, Vec<(String, Value<B>)>>,
    aux: BTreeMap<NodeId, AuxState<B>>,
}

impl<B: Backend> StepFrame<B> {
    fn new() -> Self {
        Self {
            current: BTreeMap::new(),
            extras: BTreeMap::new(),
            aux: BTreeMap::new(),
        }
    }
}

struct LoopResult<B: Backend> {
    accums: BTreeMap<NodeId, Accumulator<B>>,
    steps: usize,
    record: SearchRecord,
    last: BTreeMap<NodeId, StepValue<B>>,
    aux: BTreeMap<NodeId, AuxState<B>>,
}

// ─── Driver ────────────────────────────────────────────────────────

pub struct Driver<'a, B: Backend> {
    template: &'a Template,
    registry: &'a LayerRegistry<B>,
    inputs: &'a RecInputs<B>,
    params: &'a mut ParamStore<B>,
    placement: BTreeMap<NodeId, Placement>,
    batch: usize,
    device: B::Device,
    /// Per loss-bearing layer: `losses[t][row]`.
    losses: BTreeMap<NodeId, Vec<Vec<f32>>>,
}

impl<'a, B: Backend> Driver<'a, B> {
    pub fn new(
        template: &'a Template,
        partition: &Partition,
        registry: &'a LayerRegistry<B>,
        inputs: &'a RecInputs<B>,
        params: &'a mut ParamStore<B>,
    ) -> Self {
        let mut placement = BTreeMap::new();
        for (names, place) in [
            (&partition.pre_loop, Placement::PreLoop),
            (&partition.in_loop, Placement::InLoop),
            (&partition.post_loop, Placement::PostLoop),
        ] {
            for name in names {
                if let Some(id) = template.id(name) {
                    placement.insert(id, place);
                }
            }
        }
        let device = params.device().clone();
        Self {
            template,
            registry,
            inputs,
            params,
            placement,
            batch: inputs.batch(),
            device,
            losses: BTreeMap::new(),
        }
    }

    pub fn run(mut self) -> Result<RecOutput<B>, ExecError> {
        self.check_inputs()?;
        let max_steps = self.max_steps()?;
        debug!(max_steps, batch = self.batch, "step loop starts");
        let hoisted = self.run_pre_loop()?;
        let looped = self.run_loop(max_steps, &hoisted)?;
        debug!(steps = looped.steps, "step loop terminated");
        self.resolve(looped, &hoisted)
    }

    // ─── Setup ─────────────────────────────────────────────────────

    fn check_inputs(&self) -> Result<(), ExecError> {
        let template = self.template;
        for &id in self.placement.keys() {
            for input in &template.arena().node(id).inputs {
                match input {
                    InputRef::Data(key) => {
                        self.data(key)?;
                    }
                    InputRef::Base(name) => {
                        self.base(name)?;
                    }
                    InputRef::Current(_) | InputRef::Prev(_) => {}
                }
            }
        }
        Ok(())
    }

    fn max_steps(&self) -> Result<usize, ExecError> {
        let steps = match self.template.length_mode() {
            LengthMode::Fixed(n) => *n,
            LengthMode::Target(key) => self.data(key)?.steps(),
            LengthMode::Source => self.data(SOURCE_KEY)?.steps(),
            LengthMode::Dynamic { cap } => *cap,
        };
        if steps == 0 {
            return Err(ExecError::Unsupported {
                layer: OUTPUT_LAYER.to_string(),
                reason: "the step loop has no frames to run".to_string(),
            });
        }
        Ok(steps)
    }

    fn placed(&self, place: Placement) -> Vec<NodeId> {
        self.template
            .order()
            .iter()
            .copied()
            .filter(|id| self.placement.get(id) == Some(&place))
            .collect()
    }

    fn layer(&self, id: NodeId) -> Result<&'a LayerInfo, ExecError> {
        let template = self.template;
        template.layer(id).ok_or_else(|| ExecError::Unsupported {
            layer: template.arena().name(id).to_string(),
            reason: "not a layer of the template".to_string(),
        })
    }

    fn class_of(&self, info: &LayerInfo) -> Result<LayerClass<B>, ExecError> {
        self.registry
            .class(&info.spec.class)
            .copied()
            .ok_or_else(|| unsupported(info, &format!("class '{}' is not registered", info.spec.class)))
    }

    fn data(&self, key: &str) -> Result<&'a Stacked<B>, ExecError> {
        let inputs = self.inputs;
        let stacked = inputs.data(key).ok_or_else(|| ExecError::MissingData {
            key: key.to_string(),
        })?;
        if stacked.rows() != self.batch {
            return Err(ExecError::ShapeMismatch {
                layer: format!("data:{}", key),
                reason: format!("{} rows, batch is {}", stacked.rows(), self.batch),
            });
        }
        Ok(stacked)
    }

    fn data_frame(&self, key: &str, step: usize) -> Result<Value<B>, ExecError> {
        let stacked = self.data(key)?;
        if step >= stacked.steps() {
            return Err(ExecError::LengthMismatch {
                first: format!("data:{}", key),
                second: format!("step {}", step),
            });
        }
        Ok(stacked.step(step))
    }

    fn base(&self, name: &str) -> Result<&'a Value<B>, ExecError> {
        let inputs = self.inputs;
        let value = inputs.base(name).ok_or_else(|| ExecError::MissingBase {
            name: name.to_string(),
        })?;
        if value.rows() != self.batch {
            return Err(ExecError::ShapeMismatch {
                layer: format!("base:{}", name),
                reason: format!("{} rows, batch is {}", value.rows(), self.batch),
            });
        }
        Ok(value)
    }

    /// The layer's target sequence, if it names one and it was supplied.
    fn target_data(&self, info: &LayerInfo) -> Option<&'a Stacked<B>> {
        let inputs = self.inputs;
        info.target.as_deref().and_then(|key| inputs.data(key))
    }

    fn not_ready(&self, info: &LayerInfo, dep: NodeId) -> ExecError {
        unsupported(
            info,
            &format!("input '{}' is not available here", self.template.arena().name(dep)),
        )
    }

    fn forward(
        &mut self,
        info: &LayerInfo,
        inputs: Vec<Value<B>>,
        rows: usize,
        step: Option<usize>,
        aux: Option<Vec<Tensor<B, 2>>>,
        target: Option<Value<B>>,
    ) -> Result<Produced<B>, ExecError> {
        let class = self.class_of(info)?;
        let mut ctx = ForwardCtx {
            spec: &info.spec,
            desc: &info.desc,
            inputs,
            input_descs: info.input_descs.clone(),
            input_names: info.input_names.clone(),
            params: &mut *self.params,
            rows,
            step,
            aux,
            unit: info.unit,
            target,
        };
        let produced = (class.forward)(&mut ctx)?;
        if produced.value.rows() != rows {
            return Err(ExecError::ShapeMismatch {
                layer: info.name.clone(),
                reason: format!("produced {} rows, expected {}", produced.value.rows(), rows),
            });
        }
        Ok(produced)
    }

    /// Keep per-frame losses of a loss-bearing layer. Losses are only
    /// collected without search.
    fn record_loss(
        &mut self,
        info: &LayerInfo,
        output: &Value<B>,
        target: Option<&Value<B>>,
        frames: usize,
    ) -> Result<(), ExecError> {
        let Some(kind) = info.loss else {
            return Ok(());
        };
        if self.template.options().search {
            return Ok(());
        }
        let target = target.ok_or_else(|| ExecError::MissingTarget {
            layer: info.name.clone(),
            target: info.target.clone().unwrap_or_default(),
        })?;
        let log_space = matches!(Activation::of(&info.spec), Ok(Activation::LogSoftmax));
        let per_row = tensor_to_f32(kind.frame_loss(&info.name, output, target, log_space)?)?;
        let rows = (per_row.len() / frames.max(1)).max(1);
        let steps = self.losses.entry(info.id).or_default();
        steps.extend(per_row.chunks(rows).map(<[f32]>::to_vec));
        Ok(())
    }

    // ─── Pre-loop ──────────────────────────────────────────────────

    fn run_pre_loop(&mut self) -> Result<BTreeMap<NodeId, Hoisted<B>>, ExecError> {
        let template = self.template;
        let mut hoisted: BTreeMap<NodeId, Hoisted<B>> = BTreeMap::new();
        for id in self.placed(Placement::PreLoop) {
            let info = self.layer(id)?;
            if info.is_sub_layer() {
                continue;
            }
            let mut parts = Vec::new();
            for input in &template.arena().node(id).inputs {
                parts.push(match input {
                    InputRef::Current(dep) => hoisted
                        .get(dep)
                        .cloned()
                        .ok_or_else(|| self.not_ready(info, *dep))?,
                    InputRef::Data(key) => Hoisted::PerStep(self.data(key)?.clone()),
                    InputRef::Base(name) => Hoisted::Invariant(self.base(name)?.clone()),
                    InputRef::Prev(_) => {
                        return Err(unsupported(info, "reads a previous step outside the loop"))
                    }
                });
            }
            let target = self.target_data(info);
            let frames = common_frames(info, &parts, target)?;
            trace!(layer = %info.name, ?frames, "pre-loop");

            let (value, extras) = match frames {
                None => {
                    let values = parts.iter().filter_map(|p| p.frame(0)).collect();
                    let produced = self.forward(info, values, self.batch, None, None, None)?;
                    let extras: Vec<(String, Hoisted<B>)> = produced
                        .extras
                        .into_iter()
                        .map(|(k, v)| (k, Hoisted::Invariant(v)))
                        .collect();
                    (Hoisted::Invariant(produced.value), extras)
                }
                Some(frames) => {
                    let values = parts
                        .iter()
                        .map(|p| p.flat(frames, &info.name))
                        .collect::<Result<Vec<_>, _>>()?;
                    let target = target.map(|t| t.truncate(frames).flatten());
                    let rows = frames * self.batch;
                    let produced = self.forward(info, values, rows, None, None, target.clone())?;
                    self.record_loss(info, &produced.value, target.as_ref(), frames)?;
                    let extras: Vec<(String, Hoisted<B>)> = produced
                        .extras
                        .into_iter()
                        .map(|(k, v)| (k, Hoisted::PerStep(Stacked::unflatten(v, frames))))
                        .collect();
                    (Hoisted::PerStep(Stacked::unflatten(produced.value, frames)), extras)
                }
            };
            for (key, extra) in extras {
                if let Some(sub) = template.id(&format!("{}/{}", info.name, key)) {
                    hoisted.insert(sub, extra);
                }
            }
            hoisted.insert(id, value);
        }
        Ok(hoisted)
    }

    // ─── Step loop ─────────────────────────────────────────────────

    fn initial_prev(&self, id: NodeId) -> Result<StepValue<B>, ExecError> {
        let info = self.layer(id)?;
        let rows = self.batch;
        let init = if info.is_sub_layer() {
            &InitialOutput::Zeros
        } else {
            &info.spec.initial_output
        };
        let value = if info.desc.sparse {
            let fill = match init {
                InitialOutput::Zeros => 0,
                InitialOutput::Ones => 1,
                InitialOutput::Scalar(x) => *x as i64,
                InitialOutput::Base(name) => {
                    let value = self.base(name)?;
                    if !value.is_sparse() {
                        return Err(unsupported(info, "initial output must be sparse labels"));
                    }
                    return Ok(StepValue::beamless(value.clone()));
                }
                InitialOutput::Vector(_) => {
                    return Err(unsupported(info, "a vector initial output needs a dense layer"))
                }
            };
            Value::Sparse(Tensor::<B, 1, Int>::full([rows], fill, &self.device))
        } else {
            let width = info.desc.width();
            match init {
                InitialOutput::Zeros => Value::Dense(Tensor::zeros([rows, width], &self.device)),
                InitialOutput::Ones => Value::Dense(Tensor::ones([rows, width], &self.device)),
                InitialOutput::Scalar(x) => {
                    Value::Dense(Tensor::full([rows, width], *x, &self.device))
                }
                InitialOutput::Vector(v) => {
                    if v.len() != width {
                        return Err(ExecError::ShapeMismatch {
                            layer: info.name.clone(),
                            reason: format!("initial output has {} entries, width is {}", v.len(), width),
                        });
                    }
                    Value::Dense(dense_tensor(v.repeat(rows), rows, width, &self.device))
                }
                InitialOutput::Base(name) => {
                    let value = self.base(name)?;
                    if value.is_sparse() || value.width() != width {
                        return Err(ExecError::ShapeMismatch {
                            layer: info.name.clone(),
                            reason: format!(
                                "initial output 'base:{}' has shape {:?}, expected [{}, {}]",
                                name,
                                value.shape(),
                                rows,
                                width
                            ),
                        });
                    }
                    value.clone()
                }
            }
        };
        Ok(StepValue::beamless(value))
    }

    fn initial_aux(&self, info: &LayerInfo) -> Result<Option<AuxState<B>>, ExecError> {
        let class = self.class_of(info)?;
        Ok(class.aux_state.map(|init| AuxState {
            parts: init(&info.spec, &info.desc, info.unit, self.batch, &self.device),
            beam: None,
        }))
    }

    fn run_loop(
        &mut self,
        max_steps: usize,
        hoisted: &BTreeMap<NodeId, Hoisted<B>>,
    ) -> Result<LoopResult<B>, ExecError> {
        let template = self.template;
        let in_loop = self.placed(Placement::InLoop);
        let prev_read: Vec<NodeId> = template
            .prev_read()
            .into_iter()
            .filter(|id| self.placement.get(id) == Some(&Placement::InLoop))
            .collect();
        let end = match template.length_mode() {
            LengthMode::Dynamic { .. } => template.id(END_LAYER),
            _ => None,
        };

        // INIT
        let mut prev = BTreeMap::new();
        for &id in &prev_read {
            prev.insert(id, self.initial_prev(id)?);
        }
        let mut aux = BTreeMap::new();
        for &id in &in_loop {
            let info = self.layer(id)?;
            if info.is_sub_layer() {
                continue;
            }
            if let Some(state) = self.initial_aux(info)? {
                aux.insert(id, state);
            }
        }
        let mut accums: BTreeMap<NodeId, Accumulator<B>> = in_loop
            .iter()
            .map(|&id| (id, Accumulator::with_capacity(template.arena().name(id), max_steps)))
            .collect();
        let mut record = SearchRecord::new();
        let mut hyps = HypState::new(self.batch);
        let mut last = BTreeMap::new();
        let mut steps = 0;

        // RUNNING
        while steps < max_steps {
            let step = steps;
            trace!(step, ended = hyps.ended_count(), "step");
            let mut frame = StepFrame::new();
            for &id in &in_loop {
                let info = self.layer(id)?;
                let value = self
                    .eval_layer(step, info, hoisted, &prev, &aux, &hyps, &mut record, &mut frame)
                    .map_err(|e| e.at(step, &info.name))?;
                frame.current.insert(id, value);
            }
            for (id, value) in &frame.current {
                if let Some(acc) = accums.get_mut(id) {
                    acc.write(step, value.clone())?;
                }
            }
            steps += 1;

            for &id in &prev_read {
                if let Some(value) = frame.current.get(&id) {
                    prev.insert(id, value.clone());
                }
            }
            aux.extend(frame.aux);
            let done = match end {
                Some(end) => {
                    let flags = frame.current.get(&end).ok_or_else(|| ExecError::Unsupported {
                        layer: END_LAYER.to_string(),
                        reason: "was not evaluated in the loop".to_string(),
                    })?;
                    hyps = hyps.advance(&record, flags, self.batch, step)?;
                    hyps.all_ended()
                }
                None => {
                    hyps.tick();
                    false
                }
            };
            last = frame.current;
            if done {
                debug!(step, "every hypothesis ended");
                break;
            }
        }

        // TERMINATED
        Ok(LoopResult {
            accums,
            steps,
            record,
            last,
            aux,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn eval_layer(
        &mut self,
        step: usize,
        info: &'a LayerInfo,
        hoisted: &BTreeMap<NodeId, Hoisted<B>>,
        prev: &BTreeMap<NodeId, StepValue<B>>,
        aux: &BTreeMap<NodeId, AuxState<B>>,
        hyps: &HypState,
        record: &mut SearchRecord,
        frame: &mut StepFrame<B>,
    ) -> Result<StepValue<B>, ExecError> {
        let template = self.template;
        let node = template.arena().node(info.id);
        if let Some((root, key)) = &node.sub_of {
            let beam = frame.current.get(root).and_then(|v| v.beam);
            let value = frame
                .extras
                .get(root)
                .and_then(|extras| extras.iter().find(|(k, _)| k == key))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| {
                    unsupported(info, &format!("'{}' produced no sub-output '{}'", template.arena().name(*root), key))
                })?;
            return Ok(StepValue::new(value, beam));
        }

        let mut gathered = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            gathered.push(self.step_input(step, info, input, hoisted, prev, frame)?);
        }
        let state = aux.get(&info.id);
        let target_raw = match self.target_data(info) {
            Some(t) if step < t.steps() && t.rows() == self.batch => Some(t.step(step)),
            _ => None,
        };

        let beams = gathered.iter().map(|v| v.beam).chain(state.map(|s| s.beam));
        let common = record
            .common_beam(beams)
            .map_err(|_| ExecError::NotAncestor {
                layer: info.name.clone(),
                step,
            })?;
        self.check_beam(info, record, common)?;

        let batch = self.batch;
        let inputs = gathered
            .into_iter()
            .map(|v| translate(record, v, common, batch, &info.name, step))
            .collect::<Result<Vec<_>, _>>()?;
        let target = match &target_raw {
            Some(t) => Some(translate(
                record,
                StepValue::beamless(t.clone()),
                common,
                batch,
                &info.name,
                step,
            )?),
            None => None,
        };

        if template.is_search_choice(info.id) {
            let (value, extras) =
                self.search(step, info, &inputs, common, hyps, record, target_raw.as_ref())?;
            frame.extras.insert(info.id, extras);
            return Ok(value);
        }

        let rows = batch * record.size(common);
        let aux_in = match state {
            Some(state) => {
                let rows = record
                    .rows_between(state.beam, common, batch)
                    .ok_or_else(|| ExecError::NotAncestor {
                        layer: info.name.clone(),
                        step,
                    })?;
                let idx = index_tensor::<B>(&rows, &self.device);
                Some(
                    state
                        .parts
                        .iter()
                        .map(|p| p.clone().select(0, idx.clone()))
                        .collect::<Vec<_>>(),
                )
            }
            None => None,
        };
        let expected: Option<Vec<usize>> = aux_in
            .as_ref()
            .map(|parts| parts.iter().flat_map(|p| p.dims()).collect());

        let produced = self.forward(info, inputs, rows, Some(step), aux_in, target.clone())?;
        self.record_loss(info, &produced.value, target.as_ref(), 1)?;
        if let Some(parts) = produced.aux {
            let found: Vec<usize> = parts.iter().flat_map(|p| p.dims()).collect();
            if let Some(expected) = expected {
                if expected != found {
                    return Err(ExecError::AuxStateMismatch {
                        layer: info.name.clone(),
                        expected,
                        found,
                    });
                }
            }
            frame.aux.insert(info.id, AuxState { parts, beam: common });
        }
        frame.extras.insert(info.id, produced.extras);
        Ok(StepValue::new(produced.value, common))
    }

    fn step_input(
        &self,
        step: usize,
        info: &LayerInfo,
        input: &InputRef,
        hoisted: &BTreeMap<NodeId, Hoisted<B>>,
        prev: &BTreeMap<NodeId, StepValue<B>>,
        frame: &StepFrame<B>,
    ) -> Result<StepValue<B>, ExecError> {
        match input {
            InputRef::Current(dep) => match self.placement.get(dep) {
                Some(Placement::InLoop) => frame
                    .current
                    .get(dep)
                    .cloned()
                    .ok_or_else(|| self.not_ready(info, *dep)),
                Some(Placement::PreLoop) => {
                    let hoisted = hoisted.get(dep).ok_or_else(|| self.not_ready(info, *dep))?;
                    hoisted
                        .frame(step)
                        .map(StepValue::beamless)
                        .ok_or_else(|| ExecError::LengthMismatch {
                            first: self.template.arena().name(*dep).to_string(),
                            second: format!("step {}", step),
                        })
                }
                _ => Err(self.not_ready(info, *dep)),
            },
            InputRef::Prev(dep) => prev.get(dep).cloned().ok_or_else(|| self.not_ready(info, *dep)),
            InputRef::Data(key) => self.data_frame(key, step).map(StepValue::beamless),
            InputRef::Base(name) => self.base(name).map(|v| StepValue::beamless(v.clone())),
        }
    }

    /// The runtime beam may be narrower than the template's, never wider.
    fn check_beam(
        &self,
        info: &LayerInfo,
        record: &SearchRecord,
        common: Option<BeamRef>,
    ) -> Result<(), ExecError> {
        let found = record.size(common);
        let expected = if self.template.is_search_choice(info.id) {
            info.input_descs
                .iter()
                .filter_map(|d| d.beam.as_ref())
                .map(|b| b.size)
                .max()
        } else {
            info.desc.beam.as_ref().map(|b| b.size)
        };
        match (common, expected) {
            (None, _) => Ok(()),
            (Some(_), Some(size)) if found <= size => Ok(()),
            _ => Err(ExecError::SearchInconsistency {
                layer: info.name.clone(),
                expected,
                found,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn search(
        &mut self,
        step: usize,
        info: &LayerInfo,
        inputs: &[Value<B>],
        incoming: Option<BeamRef>,
        hyps: &HypState,
        record: &mut SearchRecord,
        gold: Option<&Value<B>>,
    ) -> Result<(StepValue<B>, Vec<(String, Value<B>)>), ExecError> {
        let config = ChoiceConfig::from_spec(&info.spec, inputs.len())
            .map_err(|e| unsupported(info, &e.to_string()))?;
        let mut sources = Vec::with_capacity(inputs.len());
        let mut widths = Vec::with_capacity(inputs.len());
        for value in inputs {
            let scores = value.dense(&info.name)?;
            widths.push(scores.dims()[1]);
            sources.push(tensor_to_f32(scores)?);
        }
        let prev_scores = record.scores(incoming, self.batch);
        let (ended, lengths) =
            hyps.view(record, incoming, self.batch)
                .ok_or_else(|| ExecError::NotAncestor {
                    layer: info.name.clone(),
                    step,
                })?;
        let gold: Option<Vec<usize>> = match gold {
            Some(v) => Some(
                v.to_labels(&info.name)?
                    .into_iter()
                    .map(|l| l.max(0) as usize)
                    .collect(),
            ),
            None => None,
        };

        let result = search_step(&SearchInput {
            layer: &info.name,
            config: &config,
            batch: self.batch,
            incoming: record.size(incoming),
            prev_scores: &prev_scores,
            ended: &ended,
            lengths: &lengths,
            sources: &sources,
            widths: &widths,
            gold: gold.as_deref(),
        })?;
        trace!(layer = %info.name, step, considered = ?result.considered, "search step");

        let mut values: Vec<Value<B>> = result
            .labels
            .iter()
            .map(|labels| {
                let labels: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
                Value::Sparse(labels_tensor::<B>(&labels, &self.device))
            })
            .collect();
        if values.is_empty() {
            return Err(unsupported(info, "a choice needs at least one scored source"));
        }
        let value = values.remove(0);
        let extras = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| (format!("out_{}", i + 1), v))
            .collect();
        let beam = BeamRef {
            choice: info.id,
            step,
        };
        record.insert(beam, &info.name, incoming, result);
        Ok((StepValue::new(value, Some(beam)), extras))
    }

    // ─── Resolution and post-loop ──────────────────────────────────

    fn resolve(
        &mut self,
        looped: LoopResult<B>,
        hoisted: &BTreeMap<NodeId, Hoisted<B>>,
    ) -> Result<RecOutput<B>, ExecError> {
        let template = self.template;
        let LoopResult {
            accums,
            steps,
            record,
            last,
            aux,
        } = looped;
        let last_step = steps.saturating_sub(1);

        let final_beam = record
            .common_beam(last.values().map(|v| v.beam))
            .map_err(|_| ExecError::NotAncestor {
                layer: OUTPUT_LAYER.to_string(),
                step: last_step,
            })?;
        let beam_size = record.size(final_beam);
        let rows = self.batch * beam_size;
        let chain = record.chain_rows(final_beam, self.batch);
        let batch_rows: Vec<usize> = (0..rows).map(|r| r / beam_size).collect();

        let mut stacked: BTreeMap<NodeId, Stacked<B>> = BTreeMap::new();
        for (id, acc) in &accums {
            let mut frames = Vec::with_capacity(acc.len());
            for (t, value) in acc.steps().iter().enumerate() {
                let map = chain.get(&value.beam).ok_or_else(|| ExecError::NotAncestor {
                    layer: acc.layer().to_string(),
                    step: t,
                })?;
                frames.push(if value.beam == final_beam {
                    value.value.clone()
                } else {
                    value.value.select_rows(map)
                });
            }
            if !frames.is_empty() {
                stacked.insert(*id, Stacked::from_steps(frames, acc.layer())?);
            }
        }

        let seq_lens = self.seq_lens(steps, &accums, &chain, beam_size)?;
        let out_steps = seq_lens.iter().copied().max().unwrap_or(0).max(1).min(steps);
        for s in stacked.values_mut() {
            *s = s.truncate(out_steps);
        }
        debug!(?seq_lens, out_steps, beam_size, "resolved");

        let mut final_states = BTreeMap::new();
        for (id, state) in &aux {
            let map = record
                .rows_between(state.beam, final_beam, self.batch)
                .ok_or_else(|| ExecError::NotAncestor {
                    layer: template.arena().name(*id).to_string(),
                    step: last_step,
                })?;
            let idx = index_tensor::<B>(&map, &self.device);
            let parts: Vec<Tensor<B, 2>> = state
                .parts
                .iter()
                .map(|p| p.clone().select(0, idx.clone()))
                .collect();
            final_states.insert(template.arena().name(*id).to_string(), parts);
        }

        for id in self.placed(Placement::PreLoop) {
            let name = template.arena().name(id);
            match hoisted.get(&id) {
                Some(Hoisted::PerStep(s)) => {
                    stacked.insert(id, fit_frames(s, out_steps, name)?.select_rows(&batch_rows));
                }
                Some(Hoisted::Invariant(v)) => {
                    stacked.insert(id, Stacked::repeat(&v.select_rows(&batch_rows), out_steps, name)?);
                }
                None => {}
            }
        }

        for id in self.placed(Placement::PostLoop) {
            let info = self.layer(id)?;
            if info.is_sub_layer() {
                continue;
            }
            let mut parts = Vec::new();
            for input in &template.arena().node(id).inputs {
                let part = match input {
                    InputRef::Current(dep) => {
                        let s = stacked.get(dep).ok_or_else(|| self.not_ready(info, *dep))?;
                        fit_frames(s, out_steps, template.arena().name(*dep))?
                    }
                    InputRef::Data(key) => fit_frames(
                        &self.data(key)?.select_rows(&batch_rows),
                        out_steps,
                        &format!("data:{}", key),
                    )?,
                    InputRef::Base(name) => {
                        Stacked::repeat(&self.base(name)?.select_rows(&batch_rows), out_steps, &info.name)?
                    }
                    InputRef::Prev(_) => {
                        return Err(unsupported(info, "reads a previous step outside the loop"))
                    }
                };
                parts.push(part.flatten());
            }
            let target = match self.target_data(info) {
                Some(t) if t.steps() >= out_steps && t.rows() == self.batch => {
                    Some(t.truncate(out_steps).select_rows(&batch_rows).flatten())
                }
                _ => None,
            };
            let produced = self.forward(info, parts, out_steps * rows, None, None, target.clone())?;
            self.record_loss(info, &produced.value, target.as_ref(), out_steps)?;
            for (key, value) in produced.extras {
                if let Some(sub) = template.id(&format!("{}/{}", info.name, key)) {
                    stacked.insert(sub, Stacked::unflatten(value, out_steps));
                }
            }
            stacked.insert(id, Stacked::unflatten(produced.value, out_steps));
        }

        let losses = std::mem::take(&mut self.losses)
            .into_iter()
            .filter_map(|(id, frames)| {
                let info = template.layer(id)?;
                Some((info.name.clone(), reduce_frames(info.loss?, &frames, &seq_lens)))
            })
            .collect();
        let outputs = stacked
            .into_iter()
            .map(|(id, s)| (template.arena().name(id).to_string(), s))
            .collect();

        Ok(RecOutput {
            outputs,
            scores: record.scores(final_beam, self.batch),
            seq_lens,
            batch: self.batch,
            beam_size,
            losses,
            steps,
            final_states,
            search: record,
        })
    }

    fn seq_lens(
        &self,
        steps: usize,
        accums: &BTreeMap<NodeId, Accumulator<B>>,
        chain: &BTreeMap<Option<BeamRef>, Vec<usize>>,
        beam_size: usize,
    ) -> Result<Vec<usize>, ExecError> {
        let rows = self.batch * beam_size;
        let from_data = |key: &str| -> Vec<usize> {
            let lens = self.inputs.lengths(key);
            (0..rows)
                .map(|r| {
                    lens.and_then(|l| l.get(r / beam_size))
                        .copied()
                        .unwrap_or(steps)
                        .min(steps)
                })
                .collect()
        };
        Ok(match self.template.length_mode() {
            LengthMode::Fixed(_) => vec![steps; rows],
            LengthMode::Target(key) => from_data(key),
            LengthMode::Source => from_data(SOURCE_KEY),
            LengthMode::Dynamic { .. } => {
                let include_eos = self.template.options().include_eos;
                let mut lens = vec![steps; rows];
                let mut done = vec![false; rows];
                let end = self.template.id(END_LAYER).and_then(|id| accums.get(&id));
                for (t, value) in end.map(|acc| acc.steps()).unwrap_or(&[]).iter().enumerate() {
                    let map = chain.get(&value.beam).ok_or_else(|| ExecError::NotAncestor {
                        layer: END_LAYER.to_string(),
                        step: t,
                    })?;
                    let flags = value.value.to_labels(END_LAYER)?;
                    for r in 0..rows {
                        if !done[r] && flags.get(map[r]).is_some_and(|&f| f != 0) {
                            lens[r] = if include_eos { t + 1 } else { t };
                            done[r] = true;
                        }
                    }
                }
                lens
            }
        })
    }
}

// ─── Helpers ───────────────────────────────────────────────────────

fn unsupported(info: &LayerInfo, reason: &str) -> ExecError {
    ExecError::Unsupported {
        layer: info.name.clone(),
        reason: reason.to_string(),
    }
}

/// Move a value into the rows of beam `to`.
fn translate<B: Backend>(
    record: &SearchRecord,
    value: StepValue<B>,
    to: Option<BeamRef>,
    batch: usize,
    layer: &str,
    step: usize,
) -> Result<Value<B>, ExecError> {
    if value.beam == to {
        return Ok(value.value);
    }
    let rows = record
        .rows_between(value.beam, to, batch)
        .ok_or_else(|| ExecError::NotAncestor {
            layer: layer.to_string(),
            step,
        })?;
    Ok(value.value.select_rows(&rows))
}

/// Frame count of a pre-loop evaluation, `None` if every input is
/// step-invariant and there is no target.
fn common_frames<B: Backend>(
    info: &LayerInfo,
    parts: &[Hoisted<B>],
    target: Option<&Stacked<B>>,
) -> Result<Option<usize>, ExecError> {
    let mut found: Option<(usize, String)> = None;
    let per_step = parts
        .iter()
        .zip(info.input_names.iter())
        .filter_map(|(part, name)| match part {
            Hoisted::PerStep(s) => Some((s.steps(), name.clone())),
            Hoisted::Invariant(_) => None,
        })
        .chain(target.map(|t| (t.steps(), format!("data:{}", info.target.as_deref().unwrap_or("")))));
    for (steps, name) in per_step {
        match &found {
            None => found = Some((steps, name)),
            Some((first, first_name)) if *first != steps => {
                return Err(ExecError::LengthMismatch {
                    first: first_name.clone(),
                    second: name,
                })
            }
            Some(_) => {}
        }
    }
    Ok(found.map(|(steps, _)| steps))
}

fn fit_frames<B: Backend>(s: &Stacked<B>, steps: usize, what: &str) -> Result<Stacked<B>, ExecError> {
    if s.steps() < steps {
        return Err(ExecError::LengthMismatch {
            first: what.to_string(),
            second: format!("{} resolved steps", steps),
        });
    }
    Ok(s.truncate(steps))
}
