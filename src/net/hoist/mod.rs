//! Loop-hoisting optimizer.
//!
//! Splits the template into layers evaluated once before the loop, inside
//! the loop, and once after the loop. Starts with everything the outputs
//! need inside the loop and moves layers out until no more moves apply.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use burn::prelude::Backend;
use serde::Serialize;
use tracing::debug;

use crate::config::END_LAYER;
use crate::layers::{LayerKind, LayerRegistry};
use crate::net::node::NodeId;
use crate::net::template::Template;

#[cfg(test)]
mod tests;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Placement {
    PreLoop,
    InLoop,
    PostLoop,
}

/// Where each layer runs. Names are listed in execution order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub pre_loop: Vec<String>,
    pub in_loop: Vec<String>,
    pub post_loop: Vec<String>,
    /// Constructed but not needed by any output.
    pub unreachable: Vec<String>,
}

impl Partition {
    /// Placement of a layer, `None` if unreachable or unknown.
    pub fn placement(&self, name: &str) -> Option<Placement> {
        let has = |set: &[String]| set.iter().any(|n| n == name);
        if has(&self.pre_loop) {
            Some(Placement::PreLoop)
        } else if has(&self.in_loop) {
            Some(Placement::InLoop)
        } else if has(&self.post_loop) {
            Some(Placement::PostLoop)
        } else {
            None
        }
    }

    /// Plain-text listing of the three sets.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for (label, set) in [
            ("pre_loop", &self.pre_loop),
            ("in_loop", &self.in_loop),
            ("post_loop", &self.post_loop),
            ("unreachable", &self.unreachable),
        ] {
            let names = if set.is_empty() {
                "-".to_string()
            } else {
                set.join(", ")
            };
            let _ = writeln!(out, "{:<12} {}", format!("{}:", label), names);
        }
        out
    }
}

/// Compute the partition of a template.
pub fn partition<B: Backend>(template: &Template, registry: &LayerRegistry<B>) -> Partition {
    let mut state = HoistState::new(template, registry);
    if template.options().optimize_move_layers_out {
        loop {
            let moved = state.move_out_consumers() + state.move_out_producers();
            if moved == 0 {
                break;
            }
        }
    }
    let partition = state.finish();
    debug!(pre_loop = ?partition.pre_loop, "hoisting");
    debug!(in_loop = ?partition.in_loop, "hoisting");
    debug!(post_loop = ?partition.post_loop, "hoisting");
    partition
}

// ─── Internal state ────────────────────────────────────────────────

struct HoistState<'t> {
    template: &'t Template,
    placement: BTreeMap<NodeId, Placement>,
    /// Root layer → the root plus its sub-layers. Groups move as a whole.
    groups: BTreeMap<NodeId, Vec<NodeId>>,
    /// Roots whose group must stay in the loop.
    pinned: BTreeSet<NodeId>,
    /// Roots whose group may go after the loop but not before it.
    beamed: BTreeSet<NodeId>,
}

impl<'t> HoistState<'t> {
    fn new<B: Backend>(template: &'t Template, registry: &LayerRegistry<B>) -> Self {
        let arena = template.arena();
        let reachable = needed_closure(template);
        let prev_read = template.prev_read();

        let mut groups: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        let mut placement = BTreeMap::new();
        for info in template.layers() {
            if !reachable.contains(&info.id) {
                continue;
            }
            placement.insert(info.id, Placement::InLoop);
            let root = root_of(template, info.id);
            groups.entry(root).or_default().push(info.id);
        }

        let mut pinned = BTreeSet::new();
        let mut beamed = BTreeSet::new();
        for (&root, members) in &groups {
            for &id in members {
                let Some(info) = template.layer(id) else {
                    continue;
                };
                let stays = match registry.class(&info.spec.class) {
                    Some(class) => {
                        class.has_aux_state()
                            || !class.row_wise
                            || class.kind == LayerKind::StepIndex
                    }
                    None => true,
                };
                if stays
                    || info.name == END_LAYER
                    || template.is_search_choice(id)
                    || prev_read.contains(&id)
                    || arena.prev_deps(id).next().is_some()
                {
                    pinned.insert(root);
                }
                if info.desc.beam.is_some() {
                    beamed.insert(root);
                }
            }
        }
        Self {
            template,
            placement,
            groups,
            pinned,
            beamed,
        }
    }

    fn place(&self, id: NodeId) -> Option<Placement> {
        self.placement.get(&id).copied()
    }

    /// Move in-loop groups no in-loop layer reads to after the loop.
    /// Consumers first, so a whole tail moves in one pass.
    fn move_out_consumers(&mut self) -> usize {
        let mut moved = 0;
        let roots: Vec<NodeId> = self.roots_in_order().into_iter().rev().collect();
        for root in roots {
            if self.pinned.contains(&root) || self.place(root) != Some(Placement::InLoop) {
                continue;
            }
            let members = &self.groups[&root];
            let read_in_loop = self.placement.iter().any(|(&other, &p)| {
                p == Placement::InLoop
                    && !members.contains(&other)
                    && self
                        .template
                        .arena()
                        .current_deps(other)
                        .any(|dep| members.contains(&dep))
            });
            if !read_in_loop {
                moved += self.set_group(root, Placement::PostLoop);
            }
        }
        moved
    }

    /// Move in-loop groups that only read pre-loop layers to before the loop.
    fn move_out_producers(&mut self) -> usize {
        let mut moved = 0;
        for root in self.roots_in_order() {
            if self.pinned.contains(&root)
                || self.beamed.contains(&root)
                || self.place(root) != Some(Placement::InLoop)
            {
                continue;
            }
            let members = &self.groups[&root];
            let only_pre = members.iter().all(|&id| {
                self.template
                    .arena()
                    .current_deps(id)
                    .filter(|dep| !members.contains(dep))
                    .all(|dep| self.place(dep) == Some(Placement::PreLoop))
            });
            if only_pre {
                moved += self.set_group(root, Placement::PreLoop);
            }
        }
        moved
    }

    fn set_group(&mut self, root: NodeId, to: Placement) -> usize {
        for id in &self.groups[&root] {
            self.placement.insert(*id, to);
        }
        1
    }

    fn roots_in_order(&self) -> Vec<NodeId> {
        self.template
            .order()
            .iter()
            .copied()
            .filter(|id| self.groups.contains_key(id))
            .collect()
    }

    fn finish(self) -> Partition {
        let mut partition = Partition::default();
        for info in self.template.layers() {
            let name = info.name.clone();
            match self.placement.get(&info.id) {
                Some(Placement::PreLoop) => partition.pre_loop.push(name),
                Some(Placement::InLoop) => partition.in_loop.push(name),
                Some(Placement::PostLoop) => partition.post_loop.push(name),
                None => partition.unreachable.push(name),
            }
        }
        partition
    }
}

/// The root layer of a sub-layer, or the layer itself.
fn root_of(template: &Template, id: NodeId) -> NodeId {
    match &template.arena().node(id).sub_of {
        Some((root, _)) => *root,
        None => id,
    }
}

/// Everything the needed layers read, at this step or one step back.
fn needed_closure(template: &Template) -> BTreeSet<NodeId> {
    let arena = template.arena();
    let mut seen = BTreeSet::new();
    let mut work: Vec<NodeId> = template.needed().to_vec();
    while let Some(id) = work.pop() {
        if !seen.insert(id) {
            continue;
        }
        work.extend(arena.current_deps(id));
        work.extend(arena.prev_deps(id));
        if let Some((root, _)) = &arena.node(id).sub_of {
            work.push(*root);
        }
    }
    seen
}
