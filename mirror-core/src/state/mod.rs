//! Per-client state tree with dirty tracking and delta computation.
//!
//! Each connected client owns one [`StateTree`]: an arena of [`StateNode`]s
//! instantiated from the compiled [`Schema`](crate::schema::Schema). All
//! reads and writes go through the tree so dirty flags propagate correctly,
//! and after every event cycle the tree renders a [`Delta`]: the minimal
//! flat map of `dotted node path -> changed fields` pushed to the client.

mod node;
mod tree;

pub use node::{NodeId, StateNode};
pub use tree::StateTree;

use indexmap::IndexMap;

/// Reserved pseudo-field name for the per-request router context. Writing it
/// overwrites the context on every descendant node.
pub const ROUTER_DATA: &str = "router_data";

/// Keys used inside the router context map.
pub mod route {
    pub const CLIENT_TOKEN: &str = "token";
    pub const SESSION_ID: &str = "sid";
    pub const HEADERS: &str = "headers";
    pub const CLIENT_IP: &str = "ip";
    pub const PATH: &str = "pathname";
    pub const ORIGIN: &str = "asPath";
    pub const QUERY: &str = "query";
}

/// A state delta: one flat map from fully-qualified dotted node path to that
/// node's changed client-visible fields.
pub type Delta = IndexMap<String, IndexMap<String, serde_json::Value>>;
