//! Mirror Core
//!
//! This crate provides the state-synchronization runtime for the Mirror
//! reactive UI framework. It implements:
//!
//! - A typed dynamic value model with dirty-tracking container proxies
//! - Compiled state-tree schemas with computed-field dependency tables
//! - Per-client state trees with delta computation
//! - Event dispatch with single-shot, multi-step, and async handlers
//! - Client serialization with pluggable custom-type serializers
//! - A state manager with per-client leases and pluggable persistence
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `value`: Dynamic values and the mutation proxy
//! - `schema`: Schema declaration, compilation, and validation
//! - `state`: The per-client state tree, dirty propagation, and deltas
//! - `event`: Events, handler outcomes, and the processing cycle
//! - `serialize`: Client-facing JSON rendering of values
//! - `manager`: State ownership, leases, and snapshot persistence
//!
//! # Example
//!
//! ```rust,ignore
//! use mirror_core::{Schema, StateManager, Event, HandlerOutcome};
//!
//! // Declare the state tree once at startup.
//! let schema = Schema::builder("app")
//!     .stored("count", 0)
//!     .computed("doubled", &["count"], |tree, node| {
//!         let count = tree.get(node, "count")?.as_int().unwrap_or(0);
//!         Ok(count.wrapping_mul(2).into())
//!     })
//!     .handler("increment", |tree, node, _payload| {
//!         let count = tree.get(node, "count")?.as_int().unwrap_or(0);
//!         tree.set(node, "count", count + 1)?;
//!         Ok(HandlerOutcome::done())
//!     })
//!     .compile()?;
//!
//! // Each client event streams delta frames back to that client.
//! let manager = StateManager::in_memory(schema, serializers);
//! manager.process_event(&Event::new(token, "app.increment"), &tx).await?;
//! ```

pub mod error;
pub mod event;
pub mod manager;
pub mod schema;
pub mod serialize;
pub mod state;
pub mod value;

pub use error::{DefinitionError, Error, Result, StoreError, ValidationError};
pub use event::{
    AsyncStepper, EmittedEvent, Event, HandlerOutcome, Payload, StateUpdate, StepFn,
};
pub use manager::{KvStore, ManagerConfig, MemoryKvStore, Snapshot, StateManager};
pub use schema::{FieldKind, NodeBuilder, NodeSchema, Schema};
pub use serialize::SerializerRegistry;
pub use state::{Delta, NodeId, StateNode, StateTree, ROUTER_DATA};
pub use value::{PathSeg, Value, ValueProxy};
