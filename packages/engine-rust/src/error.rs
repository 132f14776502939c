//! Engine error types.

use switchyard_core::UriError;
use thiserror::Error;

/// A route definition that cannot be turned into a processor graph.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("route '{route_id}': no processor registered as '{name}'")]
    UnknownProcessor { route_id: String, name: String },

    #[error("route '{route_id}': no step list registered as '{name}'")]
    UnknownStepList { route_id: String, name: String },

    #[error("route '{route_id}': step lists include each other: {}", cycle.join(" -> "))]
    CyclicInclude { route_id: String, cycle: Vec<String> },

    #[error("route '{route_id}': no data format registered as '{name}'")]
    UnknownDataFormat { route_id: String, name: String },

    #[error("route '{route_id}': no component for scheme '{scheme}'")]
    UnknownComponent { route_id: String, scheme: String },

    #[error("route '{route_id}': invalid endpoint uri '{uri}': {source}")]
    InvalidUri {
        route_id: String,
        uri: String,
        #[source]
        source: UriError,
    },

    #[error("route '{route_id}': endpoint '{uri}' could not be created: {source}")]
    Endpoint {
        route_id: String,
        uri: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Route lifecycle and context-level failures.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("route '{0}' already exists")]
    DuplicateRoute(String),

    #[error("route '{0}' not found")]
    NotFound(String),

    #[error("route '{route_id}' cannot {action} while {state}")]
    InvalidState {
        route_id: String,
        action: &'static str,
        state: String,
    },

    #[error("route '{0}' never handed the exchange back")]
    Lost(String),

    #[error("route '{route_id}': consumer failed: {source}")]
    Consumer {
        route_id: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_the_path() {
        let err = ResolveError::CyclicInclude {
            route_id: "r".into(),
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(
            err.to_string(),
            "route 'r': step lists include each other: a -> b -> a"
        );
    }

    #[test]
    fn resolve_errors_convert_into_route_errors() {
        let err: RouteError = ResolveError::UnknownProcessor {
            route_id: "r".into(),
            name: "missing".into(),
        }
        .into();
        assert!(matches!(err, RouteError::Resolve(_)));
        assert!(err.to_string().contains("missing"));
    }
}
