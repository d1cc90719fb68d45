//! Request Events
//!
//! Typed notifications fired once per dispatched blob operation, after
//! authorization and regardless of the operation's outcome.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A blob operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "get")]
    Get,
    #[serde(rename = "getMetadata")]
    GetMetadata,
    #[serde(rename = "list")]
    List,
    #[serde(rename = "set")]
    Set,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Delete => "delete",
            Operation::Get => "get",
            Operation::GetMetadata => "getMetadata",
            Operation::List => "list",
            Operation::Set => "set",
        }
    }

    /// Whether the operation addresses a single blob
    pub fn requires_key(&self) -> bool {
        !matches!(self, Operation::List)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event passed to a [`RequestObserver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEvent {
    pub kind: Operation,
    /// Request path plus query string
    pub url: String,
}

/// Receives one event per dispatched request
pub trait RequestObserver: Send + Sync {
    fn on_request(&self, event: &RequestEvent);
}

impl<F> RequestObserver for F
where
    F: Fn(&RequestEvent) + Send + Sync,
{
    fn on_request(&self, event: &RequestEvent) {
        self(event)
    }
}

/// Log sink used for the server's debug output
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Default sink: forward to tracing
pub fn tracing_sink() -> LogSink {
    Arc::new(|message: &str| tracing::info!(target: "localblobs", "{}", message))
}
