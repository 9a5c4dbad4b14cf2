//! rn-props: property and action machinery shared by every graph node.
//!
//! Provides:
//! - Typed properties attached to a resource location (user, edge, framework)
//! - Resolvers with explicit input/output sets and a bounded resolution loop
//! - Actions (one-shot messages) with per-node handlers and forwarding policies
//! - `NodeCore`, the per-node state every block and streamer embeds
//!
//! # Example
//!
//! ```
//! use rn_props::{NodeCore, ResSourceInfo};
//!
//! let mut node = NodeCore::new("0/Gain#0", 1, 1);
//! let gain = node.register_property("gain", ResSourceInfo::user(0), 1.0_f64).unwrap();
//! node.add_property_resolver(&[gain], &[gain], move |ctx| {
//!     let g: f64 = ctx.get(gain)?;
//!     ctx.set(gain, g.clamp(0.0, 10.0))
//! })
//! .unwrap();
//! node.init_props();
//!
//! node.set_property("gain", 42.0_f64, 0).unwrap();
//! assert_eq!(node.get_property::<f64>("gain", 0).unwrap(), 10.0);
//! ```

pub mod action;
pub mod error;
pub mod forwarding;
pub mod node;
pub mod property;
pub mod resolver;

pub use action::*;
pub use error::{PropError, PropResult};
pub use forwarding::{ForwardingMap, ForwardingPolicy, split_stream_map};
pub use node::{Capability, DEFAULT_MAX_ROUNDS, Node, NodeCore, PROP_KEY_MTU, PROP_KEY_TICK_RATE};
pub use property::*;
pub use resolver::{PropId, ResolverCtx};
