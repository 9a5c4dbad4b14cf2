//! Resolvers and the per-node resolution loop.

use std::collections::{BTreeSet, HashSet};

use tracing::{trace, warn};

use crate::error::{PropError, PropResult};
use crate::property::{Access, PropType, PropValue, Property};

/// Handle to a property registered on a specific node.
///
/// Carries the owning node's tag, so a handle from another node is rejected
/// instead of silently aliasing a local property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropId {
    pub(crate) owner: u32,
    pub(crate) index: usize,
}

pub type ResolverFn = Box<dyn FnMut(&mut ResolverCtx<'_>) -> PropResult<()> + Send>;

pub(crate) struct ResolverEntry {
    pub(crate) inputs: Vec<PropId>,
    pub(crate) outputs: Vec<PropId>,
    pub(crate) func: ResolverFn,
}

/// View of a node's properties handed to a running resolver.
///
/// Any property may be read; only the resolver's declared outputs may be
/// written.
pub struct ResolverCtx<'a> {
    owner: u32,
    props: &'a mut [Property],
    touched: Vec<usize>,
}

impl<'a> ResolverCtx<'a> {
    pub(crate) fn new(owner: u32, props: &'a mut [Property]) -> Self {
        Self {
            owner,
            props,
            touched: Vec::new(),
        }
    }

    fn index(&self, id: PropId) -> PropResult<usize> {
        if id.owner != self.owner || id.index >= self.props.len() {
            return Err(PropError::Unregistered {
                id: format!("#{}", id.index),
                role: "referenced",
            });
        }
        Ok(id.index)
    }

    pub fn prop(&self, id: PropId) -> PropResult<&Property> {
        let idx = self.index(id)?;
        Ok(&self.props[idx])
    }

    pub fn get<T: PropType>(&self, id: PropId) -> PropResult<T> {
        self.prop(id)?.get()
    }

    pub fn is_dirty(&self, id: PropId) -> PropResult<bool> {
        Ok(self.prop(id)?.is_dirty())
    }

    pub fn set<T: PropType>(&mut self, id: PropId, value: T) -> PropResult<()> {
        self.set_value(id, value.into_value())
    }

    pub fn set_value(&mut self, id: PropId, value: PropValue) -> PropResult<()> {
        let idx = self.index(id)?;
        if self.props[idx].write(value)? {
            self.touched.push(idx);
        }
        Ok(())
    }

    /// Mark an output dirty without changing its value.
    pub fn force_dirty(&mut self, id: PropId) -> PropResult<()> {
        let idx = self.index(id)?;
        let prop = &mut self.props[idx];
        if !matches!(prop.access(), Access::Rw | Access::RwLocked) {
            return Err(PropError::AccessDenied {
                id: prop.id().to_string(),
                src: prop.src().to_string(),
            });
        }
        prop.force_dirty();
        self.touched.push(idx);
        Ok(())
    }

    /// Copy the value of `from` into `to`.
    pub fn forward(&mut self, from: PropId, to: PropId) -> PropResult<()> {
        let value = {
            let src = self.prop(from)?;
            src.value().cloned().ok_or_else(|| PropError::Invalid {
                id: src.id().to_string(),
                src: src.src().to_string(),
            })?
        };
        self.set_value(to, value)
    }

    pub(crate) fn into_touched(self) -> Vec<usize> {
        self.touched
    }
}

/// Run resolvers in rounds until no property changes.
///
/// Round 1 starts from every dirty property (including the always-dirty
/// sentinel). Each round runs every resolver with at least one input in the
/// current frontier, in registration order; the properties those resolvers
/// change form the next frontier. Outputs written earlier in the same
/// resolution are locked to their value.
pub(crate) fn run_resolution(
    node_id: &str,
    owner: u32,
    props: &mut [Property],
    resolvers: &mut [ResolverEntry],
    max_rounds: usize,
) -> PropResult<()> {
    let mut frontier: BTreeSet<usize> = props
        .iter()
        .enumerate()
        .filter(|(_, p)| p.is_dirty())
        .map(|(i, _)| i)
        .collect();
    let mut written: HashSet<usize> = HashSet::new();
    let mut rounds = 0;

    trace!(
        node = node_id,
        dirty = frontier.len(),
        "locally resolving dirty properties plus dependencies"
    );

    while !frontier.is_empty() {
        if rounds == max_rounds {
            let dirty = frontier.iter().map(|&i| props[i].describe()).collect();
            return Err(PropError::NodeIterationCap {
                node: node_id.to_string(),
                rounds,
                dirty,
            });
        }
        rounds += 1;

        let mut next = BTreeSet::new();
        for resolver in resolvers.iter_mut() {
            if !resolver.inputs.iter().any(|p| frontier.contains(&p.index)) {
                continue;
            }
            for out in &resolver.outputs {
                let access = if written.contains(&out.index) {
                    Access::RwLocked
                } else {
                    Access::Rw
                };
                props[out.index].set_access(access);
            }

            let mut ctx = ResolverCtx::new(owner, props);
            let result = (resolver.func)(&mut ctx);
            let touched = ctx.into_touched();

            for out in &resolver.outputs {
                props[out.index].set_access(Access::Ro);
            }
            if let Err(err) = result {
                warn!(node = node_id, error = %err, "resolver failed");
                return Err(err);
            }
            written.extend(resolver.outputs.iter().map(|p| p.index));
            next.extend(touched);
        }
        frontier = next;
    }
    Ok(())
}
