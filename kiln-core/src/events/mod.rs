//! Event bus for build events.
//!
//! Provides a publish/subscribe mechanism for the lifecycle of a build:
//! the build itself, each per-platform build, each operation, cache
//! maintenance and export.
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new();
//!
//! // Subscribe to operation events
//! let mut rx = bus.subscribe(vec!["operation.*".to_string()]);
//!
//! bus.publish(
//!     Event::new(EventType::OperationCached, "3", "exec: RUN make")
//!         .with_metadata("platform", "linux/amd64"),
//! );
//!
//! while let Some(event) = rx.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! ```

use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum number of events buffered in the broadcast channel.
const EVENT_BUFFER_SIZE: usize = 1024;

/// Event types for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // Build events
    BuildStarted,
    BuildCompleted,
    BuildFailed,

    // Per-platform build events
    PlatformStarted,
    PlatformCompleted,
    PlatformFailed,

    // Operation events
    OperationStarted,
    OperationCompleted,
    OperationCached,
    OperationFailed,

    // Cache events
    CacheInvalidated,
    CachePruned,

    // Export events
    ExportCompleted,
    ExportFailed,
}

impl EventType {
    pub const ALL: [EventType; 14] = [
        EventType::BuildStarted,
        EventType::BuildCompleted,
        EventType::BuildFailed,
        EventType::PlatformStarted,
        EventType::PlatformCompleted,
        EventType::PlatformFailed,
        EventType::OperationStarted,
        EventType::OperationCompleted,
        EventType::OperationCached,
        EventType::OperationFailed,
        EventType::CacheInvalidated,
        EventType::CachePruned,
        EventType::ExportCompleted,
        EventType::ExportFailed,
    ];

    /// Parse an event type string (e.g., "platform.failed").
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Get the event type string (e.g., "operation.cached").
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BuildStarted => "build.started",
            EventType::BuildCompleted => "build.completed",
            EventType::BuildFailed => "build.failed",
            EventType::PlatformStarted => "platform.started",
            EventType::PlatformCompleted => "platform.completed",
            EventType::PlatformFailed => "platform.failed",
            EventType::OperationStarted => "operation.started",
            EventType::OperationCompleted => "operation.completed",
            EventType::OperationCached => "operation.cached",
            EventType::OperationFailed => "operation.failed",
            EventType::CacheInvalidated => "cache.invalidated",
            EventType::CachePruned => "cache.pruned",
            EventType::ExportCompleted => "export.completed",
            EventType::ExportFailed => "export.failed",
        }
    }

    /// Get the resource type (e.g., "operation").
    pub fn resource_type(&self) -> &'static str {
        self.as_str().split('.').next().unwrap_or_default()
    }

    /// Get the action (e.g., "started", "cached").
    pub fn action(&self) -> &'static str {
        self.as_str().split('.').nth(1).unwrap_or_default()
    }
}

/// A build event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Event type string (e.g., "operation.started")
    pub event_type: String,
    /// Resource type (e.g., "build", "platform")
    pub resource_type: String,
    /// Build id, platform name or node id
    pub resource_id: String,
    /// Action (e.g., "started", "failed")
    pub action: String,
    /// Human-readable message
    pub message: String,
    /// Additional metadata
    pub metadata: BTreeMap<String, String>,
}

impl Event {
    /// Create a new event.
    pub fn new(event_type: EventType, resource_id: &str, message: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            event_type: event_type.as_str().to_string(),
            resource_type: event_type.resource_type().to_string(),
            resource_id: resource_id.to_string(),
            action: event_type.action().to_string(),
            message: message.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add metadata to the event.
    pub fn with_metadata(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Metadata value for `key`, if present.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn is(&self, event_type: EventType) -> bool {
        self.event_type == event_type.as_str()
    }
}

/// Event bus for publishing and subscribing to build events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: Event) {
        debug!(event_type = %event.event_type, resource_id = %event.resource_id, "Publishing event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events, optionally filtered by event type patterns.
    ///
    /// # Filter patterns
    ///
    /// - `"operation.*"` - All operation events
    /// - `"platform.failed"` - Only per-platform failures
    /// - Empty list - All events
    pub fn subscribe(&self, filters: Vec<String>) -> EventSubscriber {
        EventSubscriber { receiver: self.sender.subscribe(), filters }
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event subscriber with optional filtering.
pub struct EventSubscriber {
    receiver: broadcast::Receiver<Event>,
    filters: Vec<String>,
}

impl EventSubscriber {
    /// Receive the next matching event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Event subscriber lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return None;
                }
            }
        }
    }

    /// Drain already-buffered matching events without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.matches(&event) => events.push(event),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
        events
    }

    fn matches(&self, event: &Event) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        self.filters.iter().any(|filter| {
            filter == &event.event_type
                || filter
                    .strip_suffix(".*")
                    .is_some_and(|prefix| event.resource_type == prefix)
        })
    }
}
