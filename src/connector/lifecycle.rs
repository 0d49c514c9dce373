//! Connector lifecycle states.

use futures::future::{BoxFuture, Shared};
use serde::Serialize;

use crate::error::Result;

/// The single bootstrap future every concurrent `initialize` call awaits.
pub(crate) type InitFuture = Shared<BoxFuture<'static, Result<()>>>;

/// Public view of the connector lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    Uninitialized,
    Initializing,
    Ready,
}

impl ConnectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
        }
    }
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) enum Lifecycle {
    Uninitialized,
    /// `generation` identifies the bootstrap attempt; a finished attempt
    /// only updates the state if it is still the current one.
    Initializing {
        generation: u64,
        pending: InitFuture,
    },
    Ready,
}

impl Lifecycle {
    pub(crate) fn state(&self) -> ConnectorState {
        match self {
            Self::Uninitialized => ConnectorState::Uninitialized,
            Self::Initializing { .. } => ConnectorState::Initializing,
            Self::Ready => ConnectorState::Ready,
        }
    }

    pub(crate) fn is_attempt(&self, generation: u64) -> bool {
        matches!(self, Self::Initializing { generation: g, .. } if *g == generation)
    }
}
