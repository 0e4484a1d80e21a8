//! Event handler tables and lifecycle hooks.
//!
//! DESIGN
//! ======
//! Application events are string-keyed: `Events` maps an event name to a
//! [`Handler`]. Lifecycle notifications are a closed [`Lifecycle`] enum kept
//! in a separate table and checked before generic dispatch, so a peer can
//! never trigger a lifecycle hook by sending a data frame with a reserved
//! name.
//!
//! `Namespaces` declares which namespaces a peer serves and the `Events`
//! template each new `NSConn` starts from.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use frames::Frame;

use crate::error::HandlerError;
use crate::nsconn::NSConn;

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Namespace lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// The namespace was joined.
    NamespaceConnected,
    /// A local join attempt was rejected by the peer.
    NamespaceConnectedFailed,
    /// The namespace was left by either side.
    NamespaceDisconnect,
    /// The connection closed while the namespace was joined. Body is the reason.
    NamespaceDisconnectReason,
}

impl Lifecycle {
    pub const ALL: [Lifecycle; 4] = [
        Self::NamespaceConnected,
        Self::NamespaceConnectedFailed,
        Self::NamespaceDisconnect,
        Self::NamespaceDisconnectReason,
    ];

    /// Reserved event name. Used as `event` on the frames handed to hooks.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NamespaceConnected => "_OnNamespaceConnected",
            Self::NamespaceConnectedFailed => "_OnNamespaceConnectedFailed",
            Self::NamespaceDisconnect => "_OnNamespaceDisconnect",
            Self::NamespaceDisconnectReason => "_OnNamespaceDisconnectReason",
        }
    }

    #[must_use]
    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|hook| hook.as_str() == name)
    }

    /// Whether `name` is reserved and never dispatched as an application event.
    #[must_use]
    pub fn is_reserved(name: &str) -> bool {
        Self::from_event_name(name).is_some()
    }

    /// Synthesized frame handed to the hook.
    pub(crate) fn frame(self, namespace: &str, body: impl Into<Vec<u8>>) -> Frame {
        Frame::data(namespace, self.as_str(), body)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// HANDLER
// =============================================================================

/// Callback invoked by the dispatch loop.
///
/// Handlers run on the connection's dispatch task, one frame at a time.
/// Long-running work should be spawned.
pub trait Handler: Send + Sync + 'static {
    /// # Errors
    ///
    /// An error on an application event is sent back to the peer as an error
    /// frame. Errors from lifecycle hooks are logged.
    fn handle(&self, ns: &NSConn, msg: &Frame) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&NSConn, &Frame) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, ns: &NSConn, msg: &Frame) -> Result<(), HandlerError> {
        self(ns, msg)
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Handler table for one namespace.
#[derive(Clone, Default)]
pub struct Events {
    handlers: HashMap<String, Arc<dyn Handler>>,
    hooks: HashMap<Lifecycle, Arc<dyn Handler>>,
    any: Option<Arc<dyn Handler>>,
}

impl Events {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Events::insert`].
    #[must_use]
    pub fn on<F>(mut self, event: &str, handler: F) -> Self
    where
        F: Fn(&NSConn, &Frame) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.insert(event, handler);
        self
    }

    /// Register a [`Handler`] implementor for `event`.
    #[must_use]
    pub fn on_handler(mut self, event: &str, handler: impl Handler) -> Self {
        self.insert_arc(event, Arc::new(handler));
        self
    }

    #[must_use]
    pub fn on_lifecycle<F>(mut self, hook: Lifecycle, handler: F) -> Self
    where
        F: Fn(&NSConn, &Frame) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.hooks.insert(hook, Arc::new(handler));
        self
    }

    /// Handler for events with no registered handler.
    #[must_use]
    pub fn on_any<F>(mut self, handler: F) -> Self
    where
        F: Fn(&NSConn, &Frame) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.any = Some(Arc::new(handler));
        self
    }

    /// Register `handler` for `event`, replacing any previous one.
    ///
    /// Reserved lifecycle names register the matching hook.
    pub fn insert<F>(&mut self, event: &str, handler: F)
    where
        F: Fn(&NSConn, &Frame) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.insert_arc(event, Arc::new(handler));
    }

    pub(crate) fn insert_arc(&mut self, event: &str, handler: Arc<dyn Handler>) {
        match Lifecycle::from_event_name(event) {
            Some(hook) => {
                self.hooks.insert(hook, handler);
            }
            None => {
                self.handlers.insert(event.to_owned(), handler);
            }
        }
    }

    /// Handler for an application event, falling back to `on_any`.
    #[must_use]
    pub fn handler_for(&self, event: &str) -> Option<Arc<dyn Handler>> {
        if Lifecycle::is_reserved(event) {
            return None;
        }
        self.handlers.get(event).or(self.any.as_ref()).cloned()
    }

    #[must_use]
    pub fn hook(&self, hook: Lifecycle) -> Option<Arc<dyn Handler>> {
        self.hooks.get(&hook).cloned()
    }

    /// Registered application event names, sorted.
    #[must_use]
    pub fn event_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut hooks: Vec<&str> = self.hooks.keys().map(|h| h.as_str()).collect();
        hooks.sort_unstable();
        f.debug_struct("Events")
            .field("events", &self.event_names())
            .field("hooks", &hooks)
            .field("any", &self.any.is_some())
            .finish()
    }
}

// =============================================================================
// NAMESPACES
// =============================================================================

/// Namespaces a peer serves, each with its handler template.
#[derive(Clone, Debug, Default)]
pub struct Namespaces {
    declared: HashMap<String, Events>,
}

impl Namespaces {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn namespace(mut self, name: &str, events: Events) -> Self {
        self.declared.insert(name.to_owned(), events);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Events> {
        self.declared.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.declared.contains_key(name)
    }

    /// Declared namespace names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.declared.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;
