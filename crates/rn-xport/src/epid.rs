//! Endpoint ID allocation.
//!
//! IDs are handed out from a counter and never reused: `deallocate_epid` is
//! a no-op, so a live address can never be remapped under an in-flight
//! packet. A session that exhausts the 16-bit space gets a runtime error.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use rn_core::{RnError, RnResult, SepAddr, SepId};
use tracing::{debug, info};

use crate::mgmt::MgmtPortal;
use crate::transport::Transport;

#[derive(Debug)]
struct EpidMaps {
    next_epid: u32,
    by_addr: BTreeMap<SepAddr, SepId>,
    by_epid: HashMap<SepId, SepAddr>,
}

impl EpidMaps {
    fn insert_new(&mut self, addr: SepAddr) -> RnResult<SepId> {
        let raw = u16::try_from(self.next_epid).map_err(|_| {
            RnError::runtime(format!("endpoint ID space exhausted allocating {addr}"))
        })?;
        let epid = SepId::new(raw);
        self.next_epid += 1;
        self.by_addr.insert(addr, epid);
        self.by_epid.insert(epid, addr);
        Ok(epid)
    }

    fn remove(&mut self, addr: SepAddr, epid: SepId) {
        self.by_addr.remove(&addr);
        self.by_epid.remove(&epid);
    }
}

/// Maps stream endpoint addresses to endpoint IDs and back.
#[derive(Debug)]
pub struct EpidAllocator {
    maps: Mutex<EpidMaps>,
}

impl Default for EpidAllocator {
    fn default() -> Self {
        Self::new(SepId::new(1))
    }
}

impl EpidAllocator {
    pub fn new(start_epid: SepId) -> Self {
        Self {
            maps: Mutex::new(EpidMaps {
                next_epid: u32::from(start_epid.get()),
                by_addr: BTreeMap::new(),
                by_epid: HashMap::new(),
            }),
        }
    }

    pub fn from_config(cfg: &rn_config::EpidSettings) -> Self {
        Self::new(SepId::new(cfg.start_epid))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EpidMaps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// ID for `addr`, allocating one on first use.
    pub fn allocate_epid(&self, addr: SepAddr) -> RnResult<SepId> {
        let mut maps = self.lock();
        if let Some(&epid) = maps.by_addr.get(&addr) {
            return Ok(epid);
        }
        let epid = maps.insert_new(addr)?;
        debug!(%addr, %epid, "allocated endpoint ID");
        Ok(epid)
    }

    /// Like [`allocate_epid`](Self::allocate_epid), but also brings the
    /// endpoint up in hardware.
    ///
    /// The first allocation initializes the endpoint through `mgmt` over
    /// `xport`; later calls only re-register it. If initialization fails the
    /// allocation is rolled back, so retrying is safe.
    pub fn allocate_epid_with(
        &self,
        addr: SepAddr,
        mgmt: &dyn MgmtPortal,
        xport: &dyn Transport,
    ) -> RnResult<SepId> {
        // Held across the handshake so concurrent callers for the same
        // address see a fully initialized endpoint.
        let mut maps = self.lock();
        if let Some(&epid) = maps.by_addr.get(&addr) {
            mgmt.register_endpoint(addr, epid)?;
            debug!(%addr, %epid, "re-registered endpoint");
            return Ok(epid);
        }
        let epid = maps.insert_new(addr)?;
        if let Err(err) = mgmt.initialize_endpoint(xport, addr, epid) {
            maps.remove(addr, epid);
            return Err(err);
        }
        info!(%addr, %epid, "initialized endpoint");
        Ok(epid)
    }

    pub fn get_epid(&self, addr: SepAddr) -> RnResult<SepId> {
        self.lock()
            .by_addr
            .get(&addr)
            .copied()
            .ok_or_else(|| RnError::lookup(format!("no endpoint ID allocated for address {addr}")))
    }

    pub fn lookup_addr(&self, epid: SepId) -> RnResult<SepAddr> {
        self.lock()
            .by_epid
            .get(&epid)
            .copied()
            .ok_or_else(|| RnError::lookup(format!("endpoint ID {epid} is not allocated")))
    }

    /// IDs are not reclaimed; the mapping stays valid.
    pub fn deallocate_epid(&self, epid: SepId) {
        debug!(%epid, "endpoint ID deallocation requested; IDs are not reclaimed");
    }

    pub fn allocated_count(&self) -> usize {
        self.lock().by_addr.len()
    }

    /// Every allocation, ordered by address.
    pub fn allocations(&self) -> Vec<(SepAddr, SepId)> {
        self.lock()
            .by_addr
            .iter()
            .map(|(addr, epid)| (*addr, *epid))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::transport::LoopbackTransport;

    #[derive(Default)]
    struct CountingPortal {
        inits: AtomicUsize,
        registers: AtomicUsize,
        fail_next_init: AtomicBool,
    }

    impl MgmtPortal for CountingPortal {
        fn initialize_endpoint(&self, _: &dyn Transport, _: SepAddr, _: SepId) -> RnResult<()> {
            if self.fail_next_init.swap(false, Ordering::SeqCst) {
                return Err(RnError::timeout("mgmt handshake", Duration::from_millis(10)));
            }
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn register_endpoint(&self, _: SepAddr, _: SepId) -> RnResult<()> {
            self.registers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn setup_remote_route(&self, _: &dyn Transport, _: SepId, _: SepId) -> RnResult<()> {
            Ok(())
        }
    }

    #[test]
    fn ids_start_at_configured_value() {
        let alloc = EpidAllocator::new(SepId::new(5));
        assert_eq!(alloc.allocate_epid(SepAddr::new(0, 0)).unwrap(), SepId::new(5));
        assert_eq!(alloc.allocate_epid(SepAddr::new(0, 1)).unwrap(), SepId::new(6));
        assert_eq!(alloc.allocate_epid(SepAddr::new(0, 0)).unwrap(), SepId::new(5));
        assert_eq!(alloc.allocated_count(), 2);
    }

    #[test]
    fn unknown_lookups_fail() {
        let alloc = EpidAllocator::default();
        let err = alloc.get_epid(SepAddr::new(1, 1)).unwrap_err();
        assert!(matches!(err, RnError::Lookup { .. }));
        let err = alloc.lookup_addr(SepId::new(1)).unwrap_err();
        assert!(matches!(err, RnError::Lookup { .. }));
    }

    #[test]
    fn handshake_once_then_register() {
        let alloc = EpidAllocator::default();
        let portal = CountingPortal::default();
        let (xport, _far) = LoopbackTransport::pair("mgmt", 8);
        let addr = SepAddr::new(0, 1);
        let first = alloc.allocate_epid_with(addr, &portal, &xport).unwrap();
        let again = alloc.allocate_epid_with(addr, &portal, &xport).unwrap();
        assert_eq!(first, again);
        assert_eq!(portal.inits.load(Ordering::SeqCst), 1);
        assert_eq!(portal.registers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_handshake_rolls_back() {
        let alloc = EpidAllocator::default();
        let portal = CountingPortal::default();
        portal.fail_next_init.store(true, Ordering::SeqCst);
        let (xport, _far) = LoopbackTransport::pair("mgmt", 8);
        let addr = SepAddr::new(2, 0);
        assert!(alloc.allocate_epid_with(addr, &portal, &xport).unwrap_err().is_timeout());
        assert!(alloc.get_epid(addr).is_err());
        let epid = alloc.allocate_epid_with(addr, &portal, &xport).unwrap();
        assert_eq!(alloc.lookup_addr(epid).unwrap(), addr);
        assert_eq!(portal.inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deallocate_keeps_mapping() {
        let alloc = EpidAllocator::default();
        let addr = SepAddr::new(0, 2);
        let epid = alloc.allocate_epid(addr).unwrap();
        alloc.deallocate_epid(epid);
        assert_eq!(alloc.lookup_addr(epid).unwrap(), addr);
        assert_eq!(alloc.allocate_epid(addr).unwrap(), epid);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let alloc = EpidAllocator::new(SepId::new(u16::MAX));
        alloc.allocate_epid(SepAddr::new(0, 0)).unwrap();
        let err = alloc.allocate_epid(SepAddr::new(0, 1)).unwrap_err();
        assert!(matches!(err, RnError::Runtime { .. }));
        // Existing entries stay usable.
        assert_eq!(alloc.get_epid(SepAddr::new(0, 0)).unwrap(), SepId::new(u16::MAX));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn allocation_is_idempotent_and_reversible(
                addrs in proptest::collection::vec((0u16..4, 0u16..8), 1..40)
            ) {
                let alloc = EpidAllocator::default();
                let mut seen = HashMap::new();
                for (d, i) in addrs {
                    let addr = SepAddr::new(d, i);
                    let epid = alloc.allocate_epid(addr).unwrap();
                    if let Some(prev) = seen.insert(addr, epid) {
                        prop_assert_eq!(prev, epid);
                    }
                    prop_assert_eq!(alloc.lookup_addr(epid).unwrap(), addr);
                    prop_assert_eq!(alloc.get_epid(addr).unwrap(), epid);
                }
                prop_assert_eq!(alloc.allocated_count(), seen.len());
            }

            #[test]
            fn never_allocated_addresses_fail(d in 0u16..64, i in 0u16..64) {
                let alloc = EpidAllocator::default();
                alloc.allocate_epid(SepAddr::new(d + 64, i)).unwrap();
                prop_assert!(alloc.get_epid(SepAddr::new(d, i)).is_err());
                prop_assert!(alloc.lookup_addr(SepId::new(2)).is_err());
            }
        }
    }
}
