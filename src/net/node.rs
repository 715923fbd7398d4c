//! Dependency nodes, stored in an arena and addressed by stable index.
//!
//! A node is created the first time anything references its name and starts
//! uninitialized. It is initialized once its descriptor can be derived. A
//! provisional descriptor (derived while some input was still unknown) may
//! be refined later; a final one never changes. `prev:` views live in their
//! own slots so refining a template never aliases its previous-step view.

use std::collections::BTreeMap;

use crate::error::BuildError;
use crate::net::descriptor::OutputDesc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Whether an edge reads the current step or crosses a step boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Current,
    Prev,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dependency {
    pub node: NodeId,
    pub edge: EdgeKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Normal current-step definition.
    Template,
    /// The value of a template node one step back.
    Prev,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeState {
    Uninitialized,
    Initialized {
        desc: OutputDesc,
        class: String,
        provisional: bool,
    },
}

/// Search-choice metadata of a hypothesis-selection node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchChoicesInfo {
    pub beam_size: usize,
    pub keep_beams: bool,
}

/// How one declared input of a layer is wired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputRef {
    Current(NodeId),
    /// Previous-step value of the given template node.
    Prev(NodeId),
    Data(String),
    Base(String),
}

#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub state: NodeState,
    pub dependencies: Vec<Dependency>,
    /// Wiring of the declared inputs, in declaration order.
    pub inputs: Vec<InputRef>,
    pub search_choices: Option<SearchChoicesInfo>,
    /// For `Prev` nodes: the template node they mirror.
    pub base: Option<NodeId>,
    /// For sub-layers (`a/b`): the root layer and the sub-output key.
    pub sub_of: Option<(NodeId, String)>,
}

impl Node {
    fn new(name: &str, kind: NodeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            state: NodeState::Uninitialized,
            dependencies: Vec::new(),
            inputs: Vec::new(),
            search_choices: None,
            base: None,
            sub_of: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, NodeState::Initialized { .. })
    }

    pub fn is_provisional(&self) -> bool {
        matches!(
            self.state,
            NodeState::Initialized {
                provisional: true,
                ..
            }
        )
    }

    /// The output descriptor; reading it before initialization is an error.
    pub fn output_descriptor(&self) -> Result<&OutputDesc, BuildError> {
        match &self.state {
            NodeState::Initialized { desc, .. } => Ok(desc),
            NodeState::Uninitialized => Err(BuildError::NotInitialized {
                layer: self.name.clone(),
            }),
        }
    }

    pub fn class(&self) -> Option<&str> {
        match &self.state {
            NodeState::Initialized { class, .. } => Some(class),
            NodeState::Uninitialized => None,
        }
    }

    /// Root layer name of a hierarchical name (`a/b` → `a`).
    pub fn root_name(&self) -> &str {
        root_name(&self.name)
    }
}

pub fn root_name(name: &str) -> &str {
    name.split('/').next().unwrap_or(name)
}

/// Arena of all nodes of one subnetwork template.
#[derive(Clone, Debug, Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
    by_name: BTreeMap<String, NodeId>,
    prev_of: BTreeMap<NodeId, NodeId>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Template node for `name`, created uninitialized on first reference.
    pub fn get_or_create(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(name, NodeKind::Template));
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn id(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All template nodes, in creation order.
    pub fn templates(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind == NodeKind::Template)
            .map(|(i, _)| NodeId(i))
    }

    pub fn is_initialized(&self, id: NodeId) -> bool {
        self.nodes[id.0].is_initialized()
    }

    pub fn descriptor(&self, id: NodeId) -> Result<&OutputDesc, BuildError> {
        self.nodes[id.0].output_descriptor()
    }

    /// Initialize a node. Fails if it was initialized before.
    pub fn init(
        &mut self,
        id: NodeId,
        desc: OutputDesc,
        class: &str,
        provisional: bool,
    ) -> Result<(), BuildError> {
        let node = &mut self.nodes[id.0];
        if node.is_initialized() {
            return Err(BuildError::AlreadyInitialized {
                layer: node.name.clone(),
            });
        }
        node.state = NodeState::Initialized {
            desc,
            class: class.to_string(),
            provisional,
        };
        Ok(())
    }

    /// Replace the descriptor of a provisionally initialized node.
    /// Returns whether the descriptor changed.
    pub fn refine(
        &mut self,
        id: NodeId,
        new_desc: OutputDesc,
        still_provisional: bool,
    ) -> Result<bool, BuildError> {
        let node = &mut self.nodes[id.0];
        match &mut node.state {
            NodeState::Initialized {
                desc, provisional, ..
            } if *provisional => {
                let changed = *desc != new_desc;
                *desc = new_desc;
                *provisional = still_provisional;
                Ok(changed)
            }
            NodeState::Initialized { .. } => Err(BuildError::AlreadyInitialized {
                layer: node.name.clone(),
            }),
            NodeState::Uninitialized => Err(BuildError::NotInitialized {
                layer: node.name.clone(),
            }),
        }
    }

    /// Accept a provisional descriptor as final.
    pub fn finalize(&mut self, id: NodeId) {
        if let NodeState::Initialized { provisional, .. } = &mut self.nodes[id.0].state {
            *provisional = false;
        }
    }

    /// Record that `id` reads `dep`. Adding the same edge twice is a no-op.
    pub fn add_dependency(&mut self, id: NodeId, dep: NodeId, edge: EdgeKind) {
        let deps = &mut self.nodes[id.0].dependencies;
        let d = Dependency { node: dep, edge };
        if !deps.contains(&d) {
            deps.push(d);
        }
    }

    /// The previous-step view of a template node. Created on first use and
    /// re-synchronized with the template's descriptor on every call.
    pub fn copy_as_prev(&mut self, id: NodeId) -> NodeId {
        let base = &self.nodes[id.0];
        let mut fresh = Node::new(&format!("prev:{}", base.name), NodeKind::Prev);
        fresh.state = base.state.clone();
        fresh.dependencies = base.dependencies.clone();
        fresh.search_choices = base.search_choices.clone();
        fresh.base = Some(id);
        match self.prev_of.get(&id) {
            Some(&prev) => {
                self.nodes[prev.0] = fresh;
                prev
            }
            None => {
                let prev = NodeId(self.nodes.len());
                self.nodes.push(fresh);
                self.prev_of.insert(id, prev);
                prev
            }
        }
    }

    /// The previous-step view of `id`, if one was ever requested.
    pub fn prev_of(&self, id: NodeId) -> Option<NodeId> {
        self.prev_of.get(&id).copied()
    }

    /// Template nodes `id` reads at the current step.
    pub fn current_deps(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[id.0]
            .dependencies
            .iter()
            .filter(|d| d.edge == EdgeKind::Current)
            .map(|d| d.node)
    }

    /// Template nodes `id` reads one step back.
    pub fn prev_deps(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[id.0]
            .dependencies
            .iter()
            .filter(|d| d.edge == EdgeKind::Prev)
            .map(move |d| self.nodes[d.node.0].base.unwrap_or(d.node))
    }
}
