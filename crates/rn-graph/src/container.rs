//! The set of live block controllers on a session.

use std::collections::BTreeMap;

use rn_core::{BlockId, RnError};
use rn_props::Node;
use tracing::{debug, info};

use crate::error::{GraphError, GraphResult};
use crate::graph::NodeArena;
use crate::registry::{BlockRegistry, MakeArgs};

/// Blocks keyed by block ID. Iteration order is the block ID order, so
/// queries are stable for a fixed topology.
#[derive(Default)]
pub struct BlockContainer {
    blocks: BTreeMap<BlockId, Box<dyn Node>>,
}

impl BlockContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block controller. Its unique ID must be the canonical form of
    /// `id`.
    pub fn register_block(&mut self, id: BlockId, block: Box<dyn Node>) -> GraphResult<()> {
        let canonical = id.to_string();
        if block.unique_id() != canonical {
            return Err(RnError::value(format!(
                "block reports unique ID `{}' but is registered as {canonical}",
                block.unique_id()
            ))
            .into());
        }
        if self.blocks.contains_key(&id) {
            return Err(GraphError::DuplicateBlock { id: canonical });
        }
        info!(block = %id, "registered block");
        self.blocks.insert(id, block);
        Ok(())
    }

    /// Build a block through the factory registered for its NOC ID and
    /// register it.
    pub fn make_block(
        &mut self,
        registry: &BlockRegistry,
        device_type: u16,
        args: MakeArgs,
    ) -> GraphResult<BlockId> {
        let id = args.block_id.clone();
        if self.blocks.contains_key(&id) {
            return Err(GraphError::DuplicateBlock { id: id.to_string() });
        }
        let factory = registry.lookup(args.noc_id, device_type)?;
        debug!(block = %id, noc_id = format_args!("0x{:08X}", args.noc_id), "instantiating block");
        let block = factory(args)?;
        self.register_block(id.clone(), block)?;
        Ok(id)
    }

    /// IDs matching `hint`, sorted.
    pub fn find_blocks(&self, hint: &str) -> Vec<BlockId> {
        self.blocks
            .keys()
            .filter(|id| id.match_hint(hint))
            .cloned()
            .collect()
    }

    pub fn has_block(&self, id: &BlockId) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn get_block(&self, id: &BlockId) -> GraphResult<&(dyn Node + 'static)> {
        self.blocks
            .get(id)
            .map(|b| &**b)
            .ok_or_else(|| GraphError::NoSuchBlock { id: id.to_string() })
    }

    pub fn get_block_mut(&mut self, id: &BlockId) -> GraphResult<&mut (dyn Node + 'static)> {
        self.blocks
            .get_mut(id)
            .map(|b| &mut **b)
            .ok_or_else(|| GraphError::NoSuchBlock { id: id.to_string() })
    }

    /// The block as its concrete controller type.
    pub fn get_block_as<T: Node>(&self, id: &BlockId) -> GraphResult<&T> {
        self.get_block(id)?.downcast_ref::<T>().ok_or_else(|| {
            RnError::lookup(format!("block {id} is not of the requested type")).into()
        })
    }

    pub fn get_block_as_mut<T: Node>(&mut self, id: &BlockId) -> GraphResult<&mut T> {
        self.get_block_mut(id)?.downcast_mut::<T>().ok_or_else(|| {
            RnError::lookup(format!("block {id} is not of the requested type")).into()
        })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Initialize every block's properties once.
    pub fn init_props(&mut self, max_node_rounds: usize) {
        for (id, block) in self.blocks.iter_mut() {
            debug!(block = %id, "initializing properties");
            let core = block.core_mut();
            core.set_max_rounds(max_node_rounds);
            core.init_props();
        }
    }

    /// Shut down every block once.
    pub fn shutdown(&mut self) {
        for (id, block) in self.blocks.iter_mut() {
            debug!(block = %id, "shutting down");
            block.shutdown();
        }
    }
}

impl NodeArena for BlockContainer {
    fn node(&self, id: &str) -> Option<&(dyn Node + 'static)> {
        let id: BlockId = id.parse().ok()?;
        self.blocks.get(&id).map(|b| &**b)
    }

    fn node_mut(&mut self, id: &str) -> Option<&mut (dyn Node + 'static)> {
        let id: BlockId = id.parse().ok()?;
        self.blocks.get_mut(&id).map(|b| &mut **b)
    }
}
