//! Property/action error types.

use rn_core::RnError;

pub type PropResult<T> = Result<T, PropError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PropError {
    #[error("Attempting to double-register property: {id}[{src}]")]
    DoubleRegistration { id: String, src: String },

    #[error("Cannot add property resolver, {role} property {id} is not registered")]
    Unregistered { id: String, role: &'static str },

    #[error("No such property: {id}[{src}] on {node}")]
    NotFound {
        node: String,
        id: String,
        src: String,
    },

    #[error("Type mismatch on property {id}: expected {expected}, got {got}")]
    TypeMismatch {
        id: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("Property {id}[{src}] is not valid (no value yet)")]
    Invalid { id: String, src: String },

    #[error("Attempting to write property {id}[{src}] without access")]
    AccessDenied { id: String, src: String },

    #[error(
        "Attempting to overwrite property `{id}@{src}' with a new value after it was locked \
         (current {current}, requested {requested})"
    )]
    LockedOverwrite {
        id: String,
        src: String,
        current: String,
        requested: String,
    },

    #[error("Node {node}: properties still dirty after {rounds} resolver rounds: {}", .dirty.join(", "))]
    NodeIterationCap {
        node: String,
        rounds: usize,
        dirty: Vec<String>,
    },

    #[error("Destination port {port} in {what} map does not exist")]
    MissingPort { port: String, what: &'static str },

    #[error("Malformed property assignment: {what}")]
    Malformed { what: String },

    #[error("{what}")]
    Policy { what: String },

    /// A resolver refused the current values.
    #[error("Resolver rejected values: {what}")]
    Rejected { what: String },
}

impl From<PropError> for RnError {
    fn from(err: PropError) -> Self {
        let what = err.to_string();
        match err {
            PropError::NotFound { .. } | PropError::Unregistered { .. } => RnError::lookup(what),
            PropError::TypeMismatch { .. } | PropError::Malformed { .. } => RnError::value(what),
            PropError::AccessDenied { .. } => RnError::access(what),
            PropError::LockedOverwrite { .. }
            | PropError::NodeIterationCap { .. }
            | PropError::Invalid { .. }
            | PropError::Rejected { .. } => RnError::resolve(what),
            PropError::DoubleRegistration { .. }
            | PropError::MissingPort { .. }
            | PropError::Policy { .. } => RnError::runtime(what),
        }
    }
}
