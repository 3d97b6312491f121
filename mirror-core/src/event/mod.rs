//! Events, handler outcomes, and the event-processing cycle.
//!
//! A client sends an [`Event`] naming a handler by dotted path. Processing it
//! runs the handler against the client's [`StateTree`] and streams
//! [`StateUpdate`] frames back over a channel: one frame per synchronous
//! handler, one frame per step for multi-step and async handlers. Every frame
//! carries the delta accrued since the previous frame, any client events the
//! handler emitted, and whether the cycle is over.

use std::panic::AssertUnwindSafe;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::state::{Delta, NodeId, StateTree};
use crate::value::Value;

/// Arguments carried by an event, keyed by parameter name.
pub type Payload = IndexMap<String, Value>;

/// Message shown to the client when a handler fails. The real failure goes to
/// the server log only.
const GENERIC_ERROR_ALERT: &str = "An error occurred. See logs for details.";

// ----------------------------------------------------------------------------
// Incoming events
// ----------------------------------------------------------------------------

/// An event received from a client.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct Event {
    /// The client token this event belongs to.
    pub token: String,
    /// Dotted handler path, e.g. `"app.cart.add_item"`. Every segment but
    /// the last names a node; the last names the handler.
    pub name: String,
    /// Handler arguments.
    #[serde(default)]
    pub payload: Payload,
    /// Fresh request metadata, applied to the whole tree before the handler
    /// runs.
    #[serde(default)]
    pub router_data: Option<IndexMap<String, Value>>,
}

impl Event {
    pub fn new(token: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            name: name.into(),
            payload: Payload::new(),
            router_data: None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_router_data(mut self, router_data: IndexMap<String, Value>) -> Self {
        self.router_data = Some(router_data);
        self
    }

    /// Split the dotted name into (node path, handler name).
    fn split_name(&self) -> Result<(&str, &str)> {
        if self.name.is_empty() {
            return Err(Error::HandlerContract {
                handler: String::new(),
                message: "event name is empty".to_string(),
            });
        }
        Ok(match self.name.rsplit_once('.') {
            Some((path, handler)) => (path, handler),
            None => ("", self.name.as_str()),
        })
    }
}

// ----------------------------------------------------------------------------
// Outgoing events
// ----------------------------------------------------------------------------

/// An instruction for the client, delivered alongside a delta. Built-in
/// names start with `_`; any other name must resolve to a handler in the
/// schema, and the client fires it as a follow-up event.
#[derive(Clone, Debug, PartialEq, Serialize, serde::Deserialize)]
pub struct EmittedEvent {
    pub name: String,
    #[serde(default)]
    pub payload: IndexMap<String, serde_json::Value>,
    /// Filled in by the processor so a follow-up event routes back to the
    /// same client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl EmittedEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: IndexMap::new(),
            token: None,
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Show a browser alert dialog.
    pub fn window_alert(message: impl Into<String>) -> Self {
        Self::new("_alert").with_arg("message", message.into())
    }

    /// Navigate the client to another route.
    pub fn redirect(path: impl Into<String>) -> Self {
        Self::new("_redirect").with_arg("path", path.into())
    }

    /// Print to the browser console.
    pub fn console_log(message: impl Into<String>) -> Self {
        Self::new("_console").with_arg("message", message.into())
    }
}

/// One frame of the response stream for an event.
#[derive(Clone, Debug, Serialize, serde::Deserialize)]
pub struct StateUpdate {
    pub delta: Delta,
    pub events: Vec<EmittedEvent>,
    /// Whether this is the last frame for the triggering event.
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl StateUpdate {
    fn frame(delta: Delta, events: Vec<EmittedEvent>, is_final: bool) -> Self {
        Self {
            delta,
            events,
            is_final,
        }
    }
}

// ----------------------------------------------------------------------------
// Handler outcomes
// ----------------------------------------------------------------------------

/// A deferred mutation step. Runs against the tree and returns the client
/// events to deliver with that step's frame.
pub type StepFn = Box<dyn FnOnce(&mut StateTree, NodeId) -> Result<Vec<EmittedEvent>> + Send>;

/// An async sequence of mutation steps. Each call mutates the tree and
/// returns the events for one frame; `None` ends the sequence.
pub trait AsyncStepper: Send {
    fn next_step<'a>(
        &'a mut self,
        tree: &'a mut StateTree,
        node: NodeId,
    ) -> BoxFuture<'a, Result<Option<Vec<EmittedEvent>>>>;
}

/// What a handler produced.
pub enum HandlerOutcome {
    /// The handler mutated state synchronously; one frame goes out.
    Done(Vec<EmittedEvent>),
    /// Mutations split across steps; one frame per step plus a terminating
    /// frame.
    Steps(Vec<StepFn>),
    /// Async steps; one frame per step plus a terminating frame.
    Stream(Box<dyn AsyncStepper>),
}

impl HandlerOutcome {
    /// Finished with no client events.
    pub fn done() -> Self {
        HandlerOutcome::Done(Vec::new())
    }

    /// Finished, delivering client events with the frame.
    pub fn emit(events: Vec<EmittedEvent>) -> Self {
        HandlerOutcome::Done(events)
    }
}

// ----------------------------------------------------------------------------
// Processing
// ----------------------------------------------------------------------------

impl StateTree {
    /// Look up the handler an event names and the node it is bound to.
    fn resolve_handler(&self, name: &str, path: &str) -> Result<NodeId> {
        let node = self.resolve_path(path)?;
        if self.node(node).schema().handler(name).is_none() {
            return Err(Error::UnknownHandler(format!(
                "{path}.{name}",
                path = self.node(node).full_name()
            )));
        }
        Ok(node)
    }

    fn run_handler(
        &mut self,
        node: NodeId,
        name: &str,
        payload: &Payload,
    ) -> Result<HandlerOutcome> {
        let handler = self
            .node(node)
            .schema()
            .handler(name)
            .cloned()
            .ok_or_else(|| Error::UnknownHandler(name.to_string()))?;
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(self, node, payload))) {
            Ok(outcome) => outcome,
            Err(panic) => Err(Error::HandlerFailed {
                handler: name.to_string(),
                message: panic_message(&panic),
            }),
        }
    }

    /// Invoke another handler from inside a handler, synchronously. Step
    /// outcomes run to completion inline; async outcomes are not allowed in
    /// a nested call.
    pub fn call_handler(
        &mut self,
        node: NodeId,
        name: &str,
        payload: &Payload,
    ) -> Result<Vec<EmittedEvent>> {
        match self.run_handler(node, name, payload)? {
            HandlerOutcome::Done(events) => Ok(events),
            HandlerOutcome::Steps(steps) => {
                let mut events = Vec::new();
                for step in steps {
                    events.extend(step(self, node)?);
                }
                Ok(events)
            }
            HandlerOutcome::Stream(_) => Err(Error::NestedAsyncSteps {
                handler: name.to_string(),
            }),
        }
    }

    /// Compute the pending delta, send it as a frame, and reset dirty state
    /// for the next frame. Every emitted event picks up the client token.
    async fn flush_frame(
        &mut self,
        out: &mpsc::Sender<StateUpdate>,
        mut events: Vec<EmittedEvent>,
        token: &str,
        is_final: bool,
    ) -> Result<()> {
        for event in &mut events {
            event.token.get_or_insert_with(|| token.to_string());
        }
        let delta = self.delta()?;
        self.clean();
        if out
            .send(StateUpdate::frame(delta, events, is_final))
            .await
            .is_err()
        {
            // State still advances and commits; only delivery is lost.
            debug!(token, is_final, "client channel closed, dropping frame");
        }
        Ok(())
    }

    /// Check that every non-builtin emitted event names a real handler.
    fn validate_emitted(&self, origin: &str, events: &[EmittedEvent]) -> Result<()> {
        for event in events {
            if event.name.starts_with('_') {
                continue;
            }
            let (path, handler) = match event.name.rsplit_once('.') {
                Some(split) => split,
                None => ("", event.name.as_str()),
            };
            if self
                .resolve_path(path)
                .ok()
                .is_some_and(|node| self.node(node).schema().handler(handler).is_some())
            {
                continue;
            }
            return Err(Error::HandlerContract {
                handler: origin.to_string(),
                message: format!("emitted event names unknown handler `{}`", event.name),
            });
        }
        Ok(())
    }

    /// Run one full event cycle, streaming frames into `out`.
    ///
    /// Application-level failures (a handler returning an error or
    /// panicking) do not propagate: they are logged and the client gets a
    /// generic alert in a final frame. Malformed events (unknown path or
    /// handler, empty name) are the caller's bug and return `Err`.
    pub async fn process(
        &mut self,
        event: &Event,
        out: &mpsc::Sender<StateUpdate>,
    ) -> Result<()> {
        let (path, handler) = event.split_name()?;
        let node = self.resolve_handler(handler, path)?;

        // Leftover dirt from outside the cycle must not ride this event's
        // delta. Router data is applied after, so its dirt is kept.
        self.clean();

        if let Some(router_data) = &event.router_data {
            let root = self.root();
            self.set_router_context(root, router_data.clone());
        }

        debug!(handler = %event.name, token = %event.token, "processing event");

        let token = event.token.as_str();
        let outcome = match self.run_handler(node, handler, &event.payload) {
            Ok(outcome) => outcome,
            Err(err) => {
                return self.fail_cycle(&event.name, err, token, out).await;
            }
        };

        match outcome {
            HandlerOutcome::Done(events) => {
                if let Err(err) = self.validate_emitted(&event.name, &events) {
                    return self.fail_cycle(&event.name, err, token, out).await;
                }
                self.flush_frame(out, events, token, true).await
            }
            HandlerOutcome::Steps(steps) => {
                for step in steps {
                    let events = match run_step(self, node, step)
                        .and_then(|events| {
                            self.validate_emitted(&event.name, &events)?;
                            Ok(events)
                        }) {
                        Ok(events) => events,
                        Err(err) => return self.fail_cycle(&event.name, err, token, out).await,
                    };
                    self.flush_frame(out, events, token, false).await?;
                }
                self.flush_frame(out, Vec::new(), token, true).await
            }
            HandlerOutcome::Stream(mut stepper) => {
                loop {
                    let step = AssertUnwindSafe(stepper.next_step(self, node))
                        .catch_unwind()
                        .await;
                    match step {
                        Ok(Ok(Some(events))) => {
                            if let Err(err) = self.validate_emitted(&event.name, &events) {
                                return self.fail_cycle(&event.name, err, token, out).await;
                            }
                            self.flush_frame(out, events, token, false).await?;
                        }
                        Ok(Ok(None)) => break,
                        Ok(Err(err)) => {
                            return self.fail_cycle(&event.name, err, token, out).await;
                        }
                        Err(panic) => {
                            let err = Error::HandlerFailed {
                                handler: event.name.clone(),
                                message: panic_message(&panic),
                            };
                            return self.fail_cycle(&event.name, err, token, out).await;
                        }
                    }
                }
                self.flush_frame(out, Vec::new(), token, true).await
            }
        }
    }

    /// Log the failure and close the cycle with a generic alert.
    async fn fail_cycle(
        &mut self,
        handler: &str,
        err: Error,
        token: &str,
        out: &mpsc::Sender<StateUpdate>,
    ) -> Result<()> {
        error!(handler, error = %err, "event handler failed");
        // Even a failed handler may have mutated state before erroring; send
        // what accrued so the client is not left stale.
        self.flush_frame(
            out,
            vec![EmittedEvent::window_alert(GENERIC_ERROR_ALERT)],
            token,
            true,
        )
        .await
    }
}

fn run_step(tree: &mut StateTree, node: NodeId, step: StepFn) -> Result<Vec<EmittedEvent>> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| step(tree, node))) {
        Ok(result) => result,
        Err(panic) => Err(Error::HandlerFailed {
            handler: "step".to_string(),
            message: panic_message(&panic),
        }),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
