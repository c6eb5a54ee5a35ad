use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// A registered worker node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: i64,

    /// Base URL of the node; the supervisor appends `/health` to probe it.
    pub address: String,

    pub metadata: HashMap<String, String>,

    /// Time-to-live hint, stored as whole nanoseconds.
    pub ttl: Duration,

    /// Flipped to false by the supervisor after repeated probe failures.
    pub active: bool,

    pub created_at: DateTime<Utc>,
}

/// Fields accepted when registering a node; everything else is stamped by
/// the service.
#[derive(Debug, Clone, Default)]
pub struct NodeDraft {
    pub address: String,
    pub metadata: Option<HashMap<String, String>>,
}
