//! Block factories keyed by NOC ID and device type.
//!
//! One registry is built at session start and handed to whatever creates
//! blocks; there is no process-wide registration.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use rn_core::{BlockId, ClockIface, RnResult};
use rn_props::Node;
use rn_xport::CtrlportEndpoint;
use tracing::{debug, trace};

use crate::error::{GraphError, GraphResult};

/// Device type matching any device; used as a per-NOC-ID fallback.
pub const ANY_DEVICE: u16 = 0xFFFF;

/// MTU assumed when the caller does not know better.
pub const DEFAULT_MTU: usize = 8192;

pub type BlockFactory = Arc<dyn Fn(MakeArgs) -> RnResult<Box<dyn Node>> + Send + Sync>;

/// Everything a factory gets to build a block controller.
#[derive(Clone)]
pub struct MakeArgs {
    pub noc_id: u32,
    pub block_id: BlockId,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub mtu: usize,
    /// Register interface; `None` for blocks without hardware behind them.
    pub regs: Option<Arc<CtrlportEndpoint>>,
    pub ctrl_clk: Arc<ClockIface>,
    pub tb_clk: Arc<ClockIface>,
    /// Free-form device arguments.
    pub args: BTreeMap<String, String>,
}

impl MakeArgs {
    pub fn new(noc_id: u32, block_id: BlockId, num_inputs: usize, num_outputs: usize) -> Self {
        Self {
            noc_id,
            block_id,
            num_inputs,
            num_outputs,
            mtu: DEFAULT_MTU,
            regs: None,
            ctrl_clk: Arc::new(ClockIface::new("ctrl")),
            tb_clk: Arc::new(ClockIface::new("timebase")),
            args: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

struct Entry {
    block_name: String,
    factory: BlockFactory,
}

#[derive(Default)]
pub struct BlockRegistry {
    entries: Mutex<HashMap<(u32, u16), Entry>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(u32, u16), Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `factory` for `(noc_id, device_type)`. Pass [`ANY_DEVICE`]
    /// to register the fallback for a NOC ID.
    pub fn register<F>(
        &self,
        noc_id: u32,
        device_type: u16,
        block_name: impl Into<String>,
        factory: F,
    ) -> GraphResult<()>
    where
        F: Fn(MakeArgs) -> RnResult<Box<dyn Node>> + Send + Sync + 'static,
    {
        let mut entries = self.lock();
        if entries.contains_key(&(noc_id, device_type)) {
            return Err(GraphError::DuplicateFactory { noc_id, device_type });
        }
        let block_name = block_name.into();
        debug!(noc_id = format_args!("0x{noc_id:08X}"), device_type, %block_name, "registered block factory");
        entries.insert(
            (noc_id, device_type),
            Entry {
                block_name,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    /// Factory for `noc_id` on `device_type`, falling back to the
    /// [`ANY_DEVICE`] entry.
    pub fn lookup(&self, noc_id: u32, device_type: u16) -> GraphResult<BlockFactory> {
        let entries = self.lock();
        let entry = entries
            .get(&(noc_id, device_type))
            .or_else(|| {
                trace!(noc_id = format_args!("0x{noc_id:08X}"), device_type, "no exact factory, trying fallback");
                entries.get(&(noc_id, ANY_DEVICE))
            })
            .ok_or(GraphError::NoFactory { noc_id })?;
        Ok(Arc::clone(&entry.factory))
    }

    pub fn block_name(&self, noc_id: u32, device_type: u16) -> Option<String> {
        let entries = self.lock();
        entries
            .get(&(noc_id, device_type))
            .or_else(|| entries.get(&(noc_id, ANY_DEVICE)))
            .map(|e| e.block_name.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
