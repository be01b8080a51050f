use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A controller event id.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EventId(pub u32);

impl EventId {
    /// No event.
    pub const INVALID: Self = Self(0);

    /// Precondition: arms the next alarm of a chain without notifying
    /// handlers.
    pub const PRECOND: Self = Self(1);

    /// Region start.
    pub const START: Self = Self(2);

    /// Region stop.
    pub const STOP: Self = Self(3);

    /// Thread id marker.
    pub const THREADID: Self = Self(4);

    /// Warmup region start.
    pub const WARMUP_START: Self = Self(5);

    /// Warmup region stop.
    pub const WARMUP_STOP: Self = Self(6);
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry of event names.
///
/// Tools may add their own events next to the predefined ones. Ids are
/// handed out in registration order.
#[derive(Debug, Clone)]
pub struct ControllerEvents {
    events: IndexMap<String, EventId>,
}

impl Default for ControllerEvents {
    fn default() -> Self {
        let mut events = IndexMap::new();
        for (name, id) in [
            ("precond", EventId::PRECOND),
            ("start", EventId::START),
            ("stop", EventId::STOP),
            ("threadid", EventId::THREADID),
            ("warmup-start", EventId::WARMUP_START),
            ("warmup-stop", EventId::WARMUP_STOP),
        ] {
            events.insert(name.to_owned(), id);
        }

        Self { events }
    }
}

impl ControllerEvents {
    /// Registers `name`, returning its id. Registering a known name
    /// returns the existing id.
    pub fn add(&mut self, name: &str) -> EventId {
        if let Some(id) = self.events.get(name) {
            return *id;
        }

        let id = EventId(self.events.len() as u32 + 1);
        self.events.insert(name.to_owned(), id);
        id
    }

    /// Returns the id of `name`.
    pub fn id(&self, name: &str) -> Option<EventId> {
        self.events.get(name).copied()
    }

    /// Returns the name of `id`.
    pub fn name(&self, id: EventId) -> Option<&str> {
        self.events
            .iter()
            .find(|(_, event)| **event == id)
            .map(|(name, _)| name.as_str())
    }
}
