//! Event routing table: regex patterns to handlers, first match wins.

use std::fmt;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::handler::EventHandler;

/// Whether an actor waits for a handler before popping its next message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingMode {
    #[default]
    Ordered,
    Unordered,
}

impl OrderingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ordered => "ordered",
            Self::Unordered => "unordered",
        }
    }
}

/// One handler registration, before its pattern is compiled.
pub struct Registration {
    pattern: String,
    handler: Arc<dyn EventHandler>,
    priority: Option<u32>,
    ordering: OrderingMode,
    return_event: Option<String>,
    case_insensitive: bool,
    parse_json: bool,
}

impl Registration {
    pub fn new(pattern: impl Into<String>, handler: impl EventHandler) -> Self {
        Self {
            pattern: pattern.into(),
            handler: Arc::new(handler),
            priority: None,
            ordering: OrderingMode::Ordered,
            return_event: None,
            case_insensitive: false,
            parse_json: false,
        }
    }

    /// Lower runs first. Defaults to registration order.
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn ordering(mut self, ordering: OrderingMode) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn unordered(self) -> Self {
        self.ordering(OrderingMode::Unordered)
    }

    /// Event name for replies that don't set one.
    pub fn return_event(mut self, event: impl Into<String>) -> Self {
        self.return_event = Some(event.into());
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// Decode string payloads as JSON before calling the handler.
    pub fn parse_json(mut self) -> Self {
        self.parse_json = true;
        self
    }
}

/// A compiled registration.
#[derive(Clone)]
pub struct HandlerEntry {
    pattern: Regex,
    source: String,
    handler: Arc<dyn EventHandler>,
    priority: u32,
    seq: u32,
    ordering: OrderingMode,
    return_event: Option<String>,
    parse_json: bool,
}

impl HandlerEntry {
    pub fn matches(&self, event: &str) -> bool {
        self.pattern.is_match(event)
    }

    /// The pattern as registered.
    pub fn pattern(&self) -> &str {
        &self.source
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn ordering(&self) -> OrderingMode {
        self.ordering
    }

    pub fn return_event(&self) -> Option<&str> {
        self.return_event.as_deref()
    }

    pub fn parse_json(&self) -> bool {
        self.parse_json
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("pattern", &self.source)
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .field("ordering", &self.ordering)
            .field("return_event", &self.return_event)
            .field("parse_json", &self.parse_json)
            .finish()
    }
}

/// Collects registrations; `build` compiles and orders them.
#[derive(Default)]
pub struct EventRegistryBuilder {
    registrations: Vec<(u32, Registration)>,
    counter: u32,
}

impl EventRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, registration: Registration) -> Self {
        self.counter += 1;
        self.registrations.push((self.counter, registration));
        self
    }

    /// Register an ordered handler with default options.
    pub fn on(self, pattern: impl Into<String>, handler: impl EventHandler) -> Self {
        self.register(Registration::new(pattern, handler))
    }

    pub fn build(self) -> Result<EventRegistry, EngineError> {
        let mut entries = Vec::with_capacity(self.registrations.len());
        for (seq, reg) in self.registrations {
            // Patterns match from the start of the event name only.
            let pattern = RegexBuilder::new(&format!("^(?:{})", reg.pattern))
                .case_insensitive(reg.case_insensitive)
                .build()
                .map_err(|e| EngineError::InvalidPattern {
                    pattern: reg.pattern.clone(),
                    reason: e.to_string(),
                })?;
            entries.push(HandlerEntry {
                pattern,
                source: reg.pattern,
                handler: reg.handler,
                priority: reg.priority.unwrap_or(seq),
                seq,
                ordering: reg.ordering,
                return_event: reg.return_event,
                parse_json: reg.parse_json,
            });
        }
        entries.sort_by_key(|e| (e.priority, e.seq));
        Ok(EventRegistry { entries })
    }
}

/// Immutable after build; shared by every actor of an instance.
#[derive(Debug, Default)]
pub struct EventRegistry {
    entries: Vec<HandlerEntry>,
}

impl EventRegistry {
    pub fn builder() -> EventRegistryBuilder {
        EventRegistryBuilder::new()
    }

    /// The first entry, in priority order, whose pattern matches `event`.
    pub fn route(&self, event: &str) -> Option<&HandlerEntry> {
        self.entries.iter().find(|e| e.matches(event))
    }

    pub fn entries(&self) -> &[HandlerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
