use std::time::Duration;

use thiserror::Error;

pub type RnResult<T> = Result<T, RnError>;

/// Error taxonomy shared by every control-plane component.
///
/// Protocol anomalies (unmatched responses, regressing feedback counts) are
/// deliberately absent: they are logged and discarded where they occur.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RnError {
    /// Unknown block ID, endpoint address, endpoint ID or property.
    #[error("Lookup error: {what}")]
    Lookup { what: String },

    /// Value or type outside of what the receiver can accept.
    #[error("Value error: {what}")]
    Value { what: String },

    /// Write to a property without the required access.
    #[error("Access error: {what}")]
    Access { what: String },

    /// Operation did not complete within its deadline.
    #[error("Timeout after {:.3}s: {what}", timeout.as_secs_f64())]
    Timeout { what: String, timeout: Duration },

    /// Property resolution failed (conflict, locked overwrite, iteration cap).
    #[error("Resolve error: {what}")]
    Resolve { what: String },

    /// No route exists between two ports.
    #[error("Routing error: {what}")]
    Routing { what: String },

    /// The device rejected a command.
    #[error("Op error: {what}")]
    Op { what: String },

    /// The transport failed to send or receive.
    #[error("Transport error: {what}")]
    Transport { what: String },

    /// Internal state does not permit the operation.
    #[error("Runtime error: {what}")]
    Runtime { what: String },
}

impl RnError {
    pub fn lookup(what: impl Into<String>) -> Self {
        Self::Lookup { what: what.into() }
    }

    pub fn value(what: impl Into<String>) -> Self {
        Self::Value { what: what.into() }
    }

    pub fn access(what: impl Into<String>) -> Self {
        Self::Access { what: what.into() }
    }

    pub fn timeout(what: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            timeout,
        }
    }

    pub fn resolve(what: impl Into<String>) -> Self {
        Self::Resolve { what: what.into() }
    }

    pub fn routing(what: impl Into<String>) -> Self {
        Self::Routing { what: what.into() }
    }

    pub fn op(what: impl Into<String>) -> Self {
        Self::Op { what: what.into() }
    }

    pub fn transport(what: impl Into<String>) -> Self {
        Self::Transport { what: what.into() }
    }

    pub fn runtime(what: impl Into<String>) -> Self {
        Self::Runtime { what: what.into() }
    }

    /// True for errors after which retrying the same request is safe.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_distinct_from_protocol_errors() {
        let t = RnError::timeout("peek32 0x100", Duration::from_millis(1500));
        assert!(t.is_timeout());
        assert!(t.to_string().contains("1.500s"));
        assert!(!RnError::op("cmd error").is_timeout());
    }
}
