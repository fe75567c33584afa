//! Runtime Error Types
//!
//! Every failure the runtime can surface, whether raised locally or carried
//! back over the mesh inside a `resp` message.
//!
//! ## Local vs wire form
//!
//! [`KiteError`] is the rich local error. It carries `anyhow` sources and is
//! not `Clone`. Before an error crosses a channel it is flattened into a
//! [`RemoteError`] (category + message). The caller rebuilds a
//! [`KiteError::Remote`] from it, so the category survives any number of hops.

use kite_config::PlanError;
use kite_types::AddressError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main runtime error type
#[derive(Error, Debug)]
pub enum KiteError {
    /// Target, method, reference or registered behavior not found
    #[error("Lookup error: {message}")]
    Lookup { message: String },

    /// Route parameters could not be turned into a target or shard
    #[error("Routing error: {message}")]
    Routing { message: String },

    /// A live kite already answers to the requested target
    #[error("Duplicate target: {target}")]
    Duplicate { target: String },

    /// Error raised on another worker and carried back in a response
    #[error("Remote error ({category}): {message}")]
    Remote { category: String, message: String },

    /// Message that makes no sense in the context it arrived in
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Behavior code failed (constructor, hook or method)
    #[error("Behavior error in {method}: {source:#}")]
    Behavior {
        method: String,
        #[source]
        source: anyhow::Error,
    },

    /// Transport listener or driver failure
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Boot plan could not be executed
    #[error("Boot error: {message}")]
    Boot { message: String },

    /// The channel to a peer is gone
    #[error("Channel closed: {peer}")]
    ChannelClosed { peer: String },

    /// The worker holding a pending session went away
    #[error("Worker shut down before replying")]
    Shutdown,
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, KiteError>;

impl KiteError {
    /// Create a lookup error
    pub fn lookup(message: impl Into<String>) -> Self {
        Self::Lookup {
            message: message.into(),
        }
    }

    /// Create a routing error
    pub fn routing(message: impl Into<String>) -> Self {
        Self::Routing {
            message: message.into(),
        }
    }

    /// Create a duplicate-target error
    pub fn duplicate(target: impl std::fmt::Display) -> Self {
        Self::Duplicate {
            target: target.to_string(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Wrap a failure raised by behavior code
    pub fn behavior(method: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Behavior {
            method: method.into(),
            source,
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a boot error
    pub fn boot(message: impl Into<String>) -> Self {
        Self::Boot {
            message: message.into(),
        }
    }

    /// Create a channel-closed error
    pub fn channel_closed(peer: impl std::fmt::Display) -> Self {
        Self::ChannelClosed {
            peer: peer.to_string(),
        }
    }

    /// Short category name, stable across the wire
    pub fn category(&self) -> &str {
        match self {
            Self::Lookup { .. } => "lookup",
            Self::Routing { .. } => "routing",
            Self::Duplicate { .. } => "duplicate",
            Self::Remote { category, .. } => category,
            Self::Protocol { .. } => "protocol",
            Self::Behavior { source, .. } => match source.downcast_ref::<KiteError>() {
                Some(inner) => inner.category(),
                None => "behavior",
            },
            Self::Transport { .. } => "transport",
            Self::Boot { .. } => "boot",
            Self::ChannelClosed { .. } => "channel",
            Self::Shutdown => "shutdown",
        }
    }

    /// True when the failure is a missing target or method
    pub fn is_lookup(&self) -> bool {
        self.category() == "lookup"
    }
}

impl From<AddressError> for KiteError {
    fn from(err: AddressError) -> Self {
        Self::routing(err.to_string())
    }
}

impl From<PlanError> for KiteError {
    fn from(err: PlanError) -> Self {
        Self::boot(err.to_string())
    }
}

/// Error as carried inside a `resp` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub category: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
        }
    }
}

impl From<&KiteError> for RemoteError {
    fn from(err: &KiteError) -> Self {
        match err {
            KiteError::Remote { category, message } => Self::new(category.clone(), message.clone()),
            KiteError::Lookup { message }
            | KiteError::Routing { message }
            | KiteError::Protocol { message }
            | KiteError::Boot { message } => Self::new(err.category(), message.clone()),
            KiteError::Behavior { source, .. } => match source.downcast_ref::<KiteError>() {
                Some(inner) => Self::from(inner),
                None => Self::new("behavior", format!("{source:#}")),
            },
            other => Self::new(other.category(), other.to_string()),
        }
    }
}

impl From<RemoteError> for KiteError {
    fn from(err: RemoteError) -> Self {
        Self::Remote {
            category: err.category,
            message: err.message,
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_survives_the_wire() {
        let err = KiteError::lookup("can't find global target:zone");
        let wire = RemoteError::from(&err);
        assert_eq!(wire.category, "lookup");
        assert_eq!(wire.message, "can't find global target:zone");

        let back = KiteError::from(wire);
        assert!(back.is_lookup());
    }

    #[test]
    fn test_behavior_error_keeps_inner_category() {
        let inner = anyhow::Error::new(KiteError::routing("bad route"));
        let err = KiteError::behavior("move", inner);
        assert_eq!(err.category(), "routing");
        assert_eq!(RemoteError::from(&err), RemoteError::new("routing", "bad route"));
    }

    #[test]
    fn test_plain_behavior_failure() {
        let err = KiteError::behavior("move", anyhow::anyhow!("blocked"));
        let wire = RemoteError::from(&err);
        assert_eq!(wire.category, "behavior");
        assert_eq!(wire.message, "blocked");
    }

    #[test]
    fn test_nested_remote_is_passed_through() {
        let err = KiteError::Remote {
            category: "lookup".into(),
            message: "no such npc(3)".into(),
        };
        assert_eq!(RemoteError::from(&err), RemoteError::new("lookup", "no such npc(3)"));
    }
}
