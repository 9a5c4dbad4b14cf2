//! Configuration validation logic.

use crate::schema::SessionConfig;

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("Invalid value: {field} = {value} ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

pub fn validate_config(config: &SessionConfig) -> Result<(), ValidationError> {
    let graph = &config.graph;
    if graph.max_graph_sweeps == 0 {
        return Err(invalid("graph.max_graph_sweeps", 0, "must be at least 1"));
    }
    if graph.max_node_rounds == 0 {
        return Err(invalid("graph.max_node_rounds", 0, "must be at least 1"));
    }
    if graph.max_action_iterations == 0 {
        return Err(invalid("graph.max_action_iterations", 0, "must be at least 1"));
    }
    if graph.default_pkt_size == 0 {
        return Err(invalid("graph.default_pkt_size", 0, "must be non-zero"));
    }

    let ctrl = &config.ctrl;
    for (field, value) in [
        ("ctrl.timeout_s", ctrl.timeout_s),
        ("ctrl.massive_timeout_s", ctrl.massive_timeout_s),
    ] {
        if !value.is_finite() || value <= 0.0 {
            return Err(invalid(field, value, "must be a positive number of seconds"));
        }
    }
    if ctrl.buff_capacity_words == 0 {
        return Err(invalid("ctrl.buff_capacity_words", 0, "must be non-zero"));
    }
    // Async message headroom must leave room for at least one minimal request
    let reserved = 6 * ctrl.max_outstanding_async_msgs;
    if reserved + 2 > ctrl.buff_capacity_words {
        return Err(invalid(
            "ctrl.buff_capacity_words",
            ctrl.buff_capacity_words,
            "too small for the reserved async message space",
        ));
    }

    if config.epid.start_epid == 0 {
        return Err(invalid("epid.start_epid", 0, "0 is reserved"));
    }

    if config.stream.fc_resp_freq_bytes == 0 && config.stream.fc_resp_freq_packets == 0 {
        return Err(invalid(
            "stream.fc_resp_freq_bytes",
            0,
            "at least one flow-control response frequency must be set",
        ));
    }

    Ok(())
}
