//! Edge-property and action forwarding policies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{PropError, PropResult};
use crate::property::{ResSourceInfo, SourceKind};

/// How a property or action arriving on one edge travels through a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ForwardingPolicy {
    /// Input port N to output port N and vice versa.
    #[default]
    OneToOne,
    /// To every port on the opposite side.
    OneToFan,
    /// To every other port on either side.
    OneToAll,
    /// To every other input port.
    OneToAllIn,
    /// To every other output port.
    OneToAllOut,
    Drop,
    /// Destinations looked up in a user-supplied map.
    UseMap,
}

/// Source edge to destination edges.
pub type ForwardingMap = BTreeMap<ResSourceInfo, Vec<ResSourceInfo>>;

fn ports(kind: SourceKind, count: usize) -> impl Iterator<Item = ResSourceInfo> {
    (0..count).map(move |i| ResSourceInfo::new(kind, i))
}

fn port_count(kind: SourceKind, n_in: usize, n_out: usize) -> usize {
    match kind {
        SourceKind::InputEdge => n_in,
        SourceKind::OutputEdge => n_out,
        _ => 0,
    }
}

/// Destinations for something arriving on `src` under `policy`.
///
/// `src` must be an edge; non-edge sources have no destinations.
pub fn destinations(
    policy: ForwardingPolicy,
    src: ResSourceInfo,
    n_in: usize,
    n_out: usize,
    map: &ForwardingMap,
    what: &'static str,
) -> PropResult<Vec<ResSourceInfo>> {
    if !src.kind.is_edge() {
        return Ok(Vec::new());
    }
    let opposite = src.kind.invert_edge();
    let dests = match policy {
        ForwardingPolicy::OneToOne => {
            if src.instance < port_count(opposite, n_in, n_out) {
                vec![src.inverted()]
            } else {
                Vec::new()
            }
        }
        ForwardingPolicy::OneToFan => ports(opposite, port_count(opposite, n_in, n_out)).collect(),
        ForwardingPolicy::OneToAllIn => ports(SourceKind::InputEdge, n_in)
            .filter(|p| *p != src)
            .collect(),
        ForwardingPolicy::OneToAllOut => ports(SourceKind::OutputEdge, n_out)
            .filter(|p| *p != src)
            .collect(),
        ForwardingPolicy::OneToAll => ports(SourceKind::InputEdge, n_in)
            .chain(ports(SourceKind::OutputEdge, n_out))
            .filter(|p| *p != src)
            .collect(),
        ForwardingPolicy::Drop => Vec::new(),
        ForwardingPolicy::UseMap => match map.get(&src) {
            Some(dests) => {
                for dst in dests {
                    if !dst.kind.is_edge() || dst.instance >= port_count(dst.kind, n_in, n_out) {
                        return Err(PropError::MissingPort {
                            port: dst.to_string(),
                            what,
                        });
                    }
                }
                dests.clone()
            }
            None => {
                trace!(src = %src, what, "no map entry, dropping");
                Vec::new()
            }
        },
    };
    Ok(dests)
}

/// Map for a block that splits each of `channels` input streams into
/// `branches` copies: input `i` feeds outputs `i + k * channels`.
pub fn split_stream_map(branches: usize, channels: usize) -> ForwardingMap {
    let mut map = ForwardingMap::new();
    for input in 0..channels {
        map.insert(
            ResSourceInfo::input_edge(input),
            (0..branches)
                .map(|k| ResSourceInfo::output_edge(input + k * channels))
                .collect(),
        );
    }
    for output in 0..branches * channels {
        map.insert(
            ResSourceInfo::output_edge(output),
            vec![ResSourceInfo::input_edge(output % channels)],
        );
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dests(policy: ForwardingPolicy, src: ResSourceInfo, n_in: usize, n_out: usize) -> Vec<ResSourceInfo> {
        destinations(policy, src, n_in, n_out, &ForwardingMap::new(), "property").unwrap()
    }

    #[test]
    fn one_to_one_requires_matching_port() {
        assert_eq!(
            dests(ForwardingPolicy::OneToOne, ResSourceInfo::input_edge(1), 2, 2),
            vec![ResSourceInfo::output_edge(1)]
        );
        assert!(dests(ForwardingPolicy::OneToOne, ResSourceInfo::input_edge(1), 2, 1).is_empty());
    }

    #[test]
    fn fan_and_all() {
        assert_eq!(
            dests(ForwardingPolicy::OneToFan, ResSourceInfo::output_edge(0), 2, 1),
            vec![ResSourceInfo::input_edge(0), ResSourceInfo::input_edge(1)]
        );
        assert_eq!(
            dests(ForwardingPolicy::OneToAll, ResSourceInfo::input_edge(0), 2, 1),
            vec![ResSourceInfo::input_edge(1), ResSourceInfo::output_edge(0)]
        );
        assert_eq!(
            dests(ForwardingPolicy::OneToAllOut, ResSourceInfo::output_edge(1), 1, 3),
            vec![ResSourceInfo::output_edge(0), ResSourceInfo::output_edge(2)]
        );
        assert!(dests(ForwardingPolicy::Drop, ResSourceInfo::input_edge(0), 1, 1).is_empty());
        assert!(dests(ForwardingPolicy::OneToAll, ResSourceInfo::user(0), 1, 1).is_empty());
    }

    #[test]
    fn map_with_missing_port_is_an_error() {
        let mut map = ForwardingMap::new();
        map.insert(
            ResSourceInfo::input_edge(0),
            vec![ResSourceInfo::output_edge(5)],
        );
        let err = destinations(
            ForwardingPolicy::UseMap,
            ResSourceInfo::input_edge(0),
            1,
            1,
            &map,
            "property",
        )
        .unwrap_err();
        assert!(matches!(err, PropError::MissingPort { .. }));
        // Unmapped sources are dropped.
        assert!(destinations(
            ForwardingPolicy::UseMap,
            ResSourceInfo::output_edge(0),
            1,
            1,
            &map,
            "property",
        )
        .unwrap()
        .is_empty());
    }

    #[test]
    fn split_stream_layout() {
        let map = split_stream_map(2, 2);
        assert_eq!(
            map[&ResSourceInfo::input_edge(1)],
            vec![ResSourceInfo::output_edge(1), ResSourceInfo::output_edge(3)]
        );
        assert_eq!(
            map[&ResSourceInfo::output_edge(2)],
            vec![ResSourceInfo::input_edge(0)]
        );
        assert_eq!(map.len(), 6);
    }
}
