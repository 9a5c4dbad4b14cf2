//! Management portal: configures stream endpoints and routes inside the
//! fabric.

use rn_core::{RnResult, SepAddr, SepId};

use crate::transport::Transport;

pub trait MgmtPortal: Send + Sync {
    /// Initialize the endpoint at `addr` in hardware and assign it `epid`.
    fn initialize_endpoint(
        &self,
        xport: &dyn Transport,
        addr: SepAddr,
        epid: SepId,
    ) -> RnResult<()>;

    /// Make an endpoint initialized elsewhere known to this portal.
    fn register_endpoint(&self, addr: SepAddr, epid: SepId) -> RnResult<()>;

    /// Program the fabric so packets from `src` reach `dst`.
    ///
    /// Fails with a routing error when no path exists.
    fn setup_remote_route(&self, xport: &dyn Transport, src: SepId, dst: SepId) -> RnResult<()>;
}
