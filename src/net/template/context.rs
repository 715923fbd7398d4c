use std::collections::BTreeSet;

use crate::error::BuildError;
use crate::net::node::{NodeArena, NodeId};

/// How a construction attempt treats dependencies that are still being
/// constructed further up the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Tier {
    /// An unfinished dependency on the stack is a construction loop.
    Strict,
    /// An unfinished dependency stands in as an unknown descriptor.
    Lenient,
    /// Rebuild provisional dependencies before reading them.
    Full,
}

/// Mutable state threaded through one template construction.
#[derive(Debug, Default)]
pub(crate) struct BuilderContext {
    stack: Vec<NodeId>,
    /// Nodes whose descriptor is missing or was derived from unknown inputs.
    pub partially_finished: BTreeSet<NodeId>,
    /// Recovered errors, one per site.
    errors: Vec<BuildError>,
    sites: BTreeSet<(String, &'static str)>,
    /// Construction stack at the most recent recovered error.
    last_stack: Vec<NodeId>,
    /// A node was initialized for the first time.
    pub initialized: bool,
    /// A provisional descriptor changed on refinement.
    pub changed: bool,
}

impl BuilderContext {
    pub fn push(&mut self, id: NodeId) {
        self.stack.push(id);
    }

    pub fn pop(&mut self) {
        self.stack.pop();
    }

    pub fn on_stack(&self, id: NodeId) -> bool {
        self.stack.contains(&id)
    }

    pub fn stack_names(&self, arena: &NodeArena) -> Vec<String> {
        self.stack.iter().map(|&id| arena.name(id).to_string()).collect()
    }

    pub fn last_stack_names(&self, arena: &NodeArena) -> Vec<String> {
        self.last_stack
            .iter()
            .map(|&id| arena.name(id).to_string())
            .collect()
    }

    /// Keep a recovered error, once per (layer, kind).
    pub fn record(&mut self, err: BuildError) {
        self.last_stack = self.stack.clone();
        if self.sites.insert(err.site()) {
            self.errors.push(err);
        }
    }

    pub fn errors(&self) -> &[BuildError] {
        &self.errors
    }

    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_deduplicated_by_site() {
        let mut ctx = BuilderContext::default();
        let missing = |input: &str| BuildError::MissingDescriptor {
            layer: "a".into(),
            input: input.into(),
        };
        ctx.record(missing("x"));
        ctx.record(missing("y"));
        ctx.record(BuildError::MissingDescriptor {
            layer: "b".into(),
            input: "x".into(),
        });
        assert_eq!(ctx.errors().len(), 2);
    }
}
