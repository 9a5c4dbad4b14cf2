//! rn-core: shared foundation for the RFNoC control plane.
//!
//! Contains:
//! - error (shared error taxonomy)
//! - ids (stream endpoint addresses, endpoint IDs, block IDs)
//! - units (uom SI types + constructors)
//! - clock (clock domains driving timed commands)

pub mod clock;
pub mod error;
pub mod ids;
pub mod units;

// Re-exports: nice ergonomics for downstream crates
pub use clock::ClockIface;
pub use error::{RnError, RnResult};
pub use ids::*;
pub use units::*;
