use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Synthetic events dispatched alongside a raw property change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyntheticEvent {
    Input,
    Change,
    KeyDown { key: String },
}

/// Side effects the DOM backend applies to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DomAction {
    Click { target: String },
    SetValue { selector: String, value: String },
    Dispatch { target: String, event: SyntheticEvent },
    SubmitForm { form: String },
    ScrollBy { dy: i64 },
    ScrollTo { top: i64 },
    ScrollIntoView { selector: String },
}

impl DomAction {
    pub fn description(&self) -> String {
        match self {
            DomAction::Click { target } => format!("click {}", target),
            DomAction::SetValue { selector, value } => {
                format!("set value of {} ({} chars)", selector, value.chars().count())
            }
            DomAction::Dispatch { target, event } => match event {
                SyntheticEvent::Input => format!("dispatch input on {}", target),
                SyntheticEvent::Change => format!("dispatch change on {}", target),
                SyntheticEvent::KeyDown { key } => format!("dispatch keydown {} on {}", key, target),
            },
            DomAction::SubmitForm { form } => format!("submit {}", form),
            DomAction::ScrollBy { dy } => format!("scroll by dy={}", dy),
            DomAction::ScrollTo { top } => format!("scroll to top={}", top),
            DomAction::ScrollIntoView { selector } => format!("scroll {} into view", selector),
        }
    }
}

/// Event emitted when an action is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomEvent {
    pub sequence: u64,
    pub action: DomAction,
    pub timestamp_ms: u64,
}

impl DomEvent {
    pub fn new(sequence: u64, action: DomAction, timestamp_ms: u64) -> Self {
        Self {
            sequence,
            action,
            timestamp_ms,
        }
    }
}

/// In-memory instrumentation layer that records DOM events for the host to replay.
#[derive(Debug, Default)]
pub struct DomInstrumentation {
    events: Vec<DomEvent>,
    next_sequence: u64,
}

impl DomInstrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, action: DomAction) -> DomEvent {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.saturating_add(1);
        let event = DomEvent::new(sequence, action, current_timestamp_ms());
        self.events.push(event.clone());
        event
    }

    pub fn events(&self) -> &[DomEvent] {
        &self.events
    }

    /// Hands recorded events to the caller. Sequence numbers keep increasing.
    pub fn drain(&mut self) -> Vec<DomEvent> {
        std::mem::take(&mut self.events)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// A page as seen from the host process. `markup` is `None` when the
/// document belongs to another origin and its content cannot be read.
#[derive(Debug, Default)]
pub struct Document {
    pub url: String,
    pub markup: Option<String>,
    pub viewport: Viewport,
    pub scroll_y: i64,
    pub scroll_height: i64,
    instrumentation: DomInstrumentation,
}

/// Shared handle to a [`Document`]; the host may refresh markup while tools run.
#[derive(Debug, Clone, Default)]
pub struct DocumentHandle {
    inner: Arc<RwLock<Document>>,
}

impl DocumentHandle {
    pub fn same_origin(url: impl Into<String>, markup: impl Into<String>) -> Self {
        Self::from_document(Document {
            url: url.into(),
            markup: Some(markup.into()),
            ..Document::default()
        })
    }

    pub fn cross_origin(url: impl Into<String>) -> Self {
        Self::from_document(Document {
            url: url.into(),
            ..Document::default()
        })
    }

    pub fn from_document(document: Document) -> Self {
        Self {
            inner: Arc::new(RwLock::new(document)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Document> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Document> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn url(&self) -> String {
        self.read().url.clone()
    }

    pub fn set_url(&self, url: impl Into<String>) {
        self.write().url = url.into();
    }

    /// Current markup, or `None` for a cross-origin document.
    pub fn markup(&self) -> Option<String> {
        self.read().markup.clone()
    }

    pub fn is_cross_origin(&self) -> bool {
        self.read().markup.is_none()
    }

    pub fn set_markup(&self, markup: impl Into<String>) {
        self.write().markup = Some(markup.into());
    }

    pub fn viewport(&self) -> Viewport {
        self.read().viewport
    }

    pub fn set_viewport(&self, viewport: Viewport) {
        self.write().viewport = viewport;
    }

    pub fn scroll_y(&self) -> i64 {
        self.read().scroll_y
    }

    pub fn set_scroll_height(&self, scroll_height: i64) {
        self.write().scroll_height = scroll_height.max(0);
    }

    pub fn scroll_height(&self) -> i64 {
        self.read().scroll_height
    }

    pub fn scroll_by(&self, dy: i64) -> DomEvent {
        let mut document = self.write();
        let limit = max_scroll(&document);
        document.scroll_y = document.scroll_y.saturating_add(dy).clamp(0, limit);
        document.instrumentation.record(DomAction::ScrollBy { dy })
    }

    pub fn scroll_to(&self, top: i64) -> DomEvent {
        let mut document = self.write();
        let limit = max_scroll(&document);
        document.scroll_y = top.clamp(0, limit);
        document.instrumentation.record(DomAction::ScrollTo { top })
    }

    pub fn record(&self, action: DomAction) -> DomEvent {
        self.write().instrumentation.record(action)
    }

    pub fn events(&self) -> Vec<DomEvent> {
        self.read().instrumentation.events().to_vec()
    }

    pub fn drain_events(&self) -> Vec<DomEvent> {
        self.write().instrumentation.drain()
    }
}

// Unknown scroll height leaves the upper bound open.
fn max_scroll(document: &Document) -> i64 {
    if document.scroll_height <= 0 {
        return i64::MAX;
    }
    (document.scroll_height - i64::from(document.viewport.height)).max(0)
}

fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_events_in_sequence() {
        let handle = DocumentHandle::same_origin("https://example.com", "<p>hi</p>");
        handle.record(DomAction::Click {
            target: "#signin".into(),
        });
        handle.scroll_by(600);

        let events = handle.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].action, DomAction::Click { .. }));
        assert!(events[0].sequence < events[1].sequence);
        assert_eq!(handle.scroll_y(), 600);
    }

    #[test]
    fn scrolling_is_clamped_to_document() {
        let handle = DocumentHandle::same_origin("https://example.com", "<p>hi</p>");
        handle.set_scroll_height(1000);
        handle.scroll_by(-50);
        assert_eq!(handle.scroll_y(), 0);
        handle.scroll_to(5000);
        assert_eq!(handle.scroll_y(), 280);
    }

    #[test]
    fn drain_keeps_sequence_monotonic() {
        let handle = DocumentHandle::cross_origin("https://other.example");
        assert!(handle.is_cross_origin());
        handle.scroll_to(0);
        assert_eq!(handle.drain_events().len(), 1);
        assert!(handle.events().is_empty());
        assert_eq!(handle.scroll_to(0).sequence, 1);
    }

    #[test]
    fn action_descriptions_are_readable() {
        let action = DomAction::Dispatch {
            target: "input#q".into(),
            event: SyntheticEvent::KeyDown {
                key: "Enter".into(),
            },
        };
        assert_eq!(action.description(), "dispatch keydown Enter on input#q");
    }
}
