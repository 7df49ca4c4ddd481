//! Kernel telemetry stream.
//!
//! Every tracing event and every structured kernel event (tool_start,
//! tool_end, route, …) is normalized into one [`TelemetryEvent`] shape
//! and broadcast as a JSON line.  Consumers (the acceptance harness, an
//! embedding host) subscribe without touching stdout.
//!
//! The shape follows the kernel's own logging conventions: the `kind`
//! field that boundary code attaches (`kind = e.kind.as_str()`) is
//! promoted to `error_kind` — but only when it names a real
//! [`ErrorKind`](crate::errors::ErrorKind) identifier — and the `skill`
//! / `tool` fields the kernel and agent loop log are first-class.

use std::fmt;
use std::sync::OnceLock;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::errors::ErrorKind;

// ---------------------------------------------------------------------------
// Event shape
// ---------------------------------------------------------------------------

/// One normalized telemetry line.
///
/// `event` is `"log"` for tracing events, or a kernel event type
/// (`tool_start`, `tool_end`, …) for structured events published via
/// [`publish_event_json`].
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Stable taxonomy identifier when the event carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub ts: String,
}

impl TelemetryEvent {
    fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            severity: None,
            target: None,
            message: String::new(),
            error_kind: None,
            skill: None,
            tool: None,
            fields: serde_json::Map::new(),
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }

    fn send(self, tx: &broadcast::Sender<String>) {
        if let Ok(line) = serde_json::to_string(&self) {
            // Best-effort; drop if no receivers.
            let _ = tx.send(line);
        }
    }
}

/// A `kind` value is promoted to `error_kind` only when it names one of
/// the stable §4.14 identifiers; anything else stays an ordinary field.
pub(crate) fn taxonomy_kind(value: &str) -> Option<String> {
    serde_json::from_value::<ErrorKind>(serde_json::Value::String(value.to_string()))
        .ok()
        .map(|kind| kind.as_str().to_string())
}

// ---------------------------------------------------------------------------
// Global broadcast channel
// ---------------------------------------------------------------------------

static LOGS_TX: OnceLock<broadcast::Sender<String>> = OnceLock::new();

/// Initialise the global telemetry channel and return the sender.
///
/// Subsequent calls return a clone of the original sender.
pub fn init_broadcast() -> broadcast::Sender<String> {
    LOGS_TX
        .get_or_init(|| {
            let (tx, _) = broadcast::channel::<String>(512);
            tx
        })
        .clone()
}

/// Obtain a receiver for the telemetry stream.
///
/// Returns `None` if [`init_broadcast`] has not been called yet.
pub fn subscribe() -> Option<broadcast::Receiver<String>> {
    LOGS_TX.get().map(|tx| tx.subscribe())
}

// ---------------------------------------------------------------------------
// Structured kernel events
// ---------------------------------------------------------------------------

/// Normalize a raw kernel event (`{"type": "tool_start", "tool": …}`)
/// into the shared [`TelemetryEvent`] shape.
fn shape_kernel_event(raw: &serde_json::Value) -> TelemetryEvent {
    let event_type = raw
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("event");
    let mut event = TelemetryEvent::new(event_type);
    if let Some(object) = raw.as_object() {
        for (key, value) in object {
            match (key.as_str(), value.as_str()) {
                ("type", _) => {}
                ("tool", Some(tool)) => event.tool = Some(tool.to_string()),
                ("skill", Some(skill)) => event.skill = Some(skill.to_string()),
                ("kind", Some(kind)) if taxonomy_kind(kind).is_some() => {
                    event.error_kind = taxonomy_kind(kind);
                }
                ("message", Some(message)) => event.message = message.to_string(),
                _ => {
                    event.fields.insert(key.clone(), value.clone());
                }
            }
        }
    }
    event
}

/// Publish a structured kernel event (tool_start, tool_end, route,
/// memory_write, …) to the telemetry stream.
///
/// Best-effort: silently dropped when the channel was never initialised
/// or has no subscribers.  Callers must never block on telemetry.
pub fn publish_event_json(raw: &serde_json::Value) {
    if let Some(tx) = LOGS_TX.get() {
        shape_kernel_event(raw).send(tx);
    }
}

// ---------------------------------------------------------------------------
// Tracing layer
// ---------------------------------------------------------------------------

/// A [`tracing_subscriber::Layer`] that funnels tracing events into the
/// telemetry stream as `event = "log"` lines.
pub struct BroadcastLayer {
    tx: broadcast::Sender<String>,
}

impl BroadcastLayer {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }
}

impl<S: Subscriber> Layer<S> for BroadcastLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();

        let mut visitor = KernelFieldVisitor::default();
        event.record(&mut visitor);

        let mut line = TelemetryEvent::new("log");
        line.severity = Some(severity(meta.level()));
        line.target = Some(meta.target().to_string());
        line.message = visitor.message.unwrap_or_default();
        line.error_kind = visitor.error_kind;
        line.skill = visitor.skill;
        line.tool = visitor.tool;
        line.fields = visitor.fields;
        line.send(&self.tx);
    }
}

fn severity(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

// ---------------------------------------------------------------------------
// Field visitor
// ---------------------------------------------------------------------------

/// Collects tracing fields, routing the kernel's conventional ones
/// (`kind`, `skill`, `tool`, `message`) into their dedicated slots.
#[derive(Default)]
struct KernelFieldVisitor {
    message: Option<String>,
    error_kind: Option<String>,
    skill: Option<String>,
    tool: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl KernelFieldVisitor {
    fn record_text(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "skill" => self.skill = Some(value),
            "tool" => self.tool = Some(value),
            "kind" => match taxonomy_kind(&value) {
                Some(kind) => self.error_kind = Some(kind),
                None => {
                    self.fields
                        .insert("kind".to_string(), serde_json::Value::String(value));
                }
            },
            name => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for KernelFieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_text(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_text(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_kind_accepts_only_stable_identifiers() {
        assert_eq!(
            taxonomy_kind("TOOL_EXEC_FAILED").as_deref(),
            Some("TOOL_EXEC_FAILED")
        );
        assert_eq!(
            taxonomy_kind("MANIFEST_INVALID").as_deref(),
            Some("MANIFEST_INVALID")
        );
        assert!(taxonomy_kind("totally_made_up").is_none());
        assert!(taxonomy_kind("").is_none());
    }

    #[test]
    fn kernel_event_promotes_conventional_fields() {
        let raw = serde_json::json!({
            "type": "tool_end",
            "tool": "git.status",
            "skill": "git",
            "kind": "TOOL_EXEC_FAILED",
            "duration_ms": 12,
        });
        let event = shape_kernel_event(&raw);
        assert_eq!(event.event, "tool_end");
        assert_eq!(event.tool.as_deref(), Some("git.status"));
        assert_eq!(event.skill.as_deref(), Some("git"));
        assert_eq!(event.error_kind.as_deref(), Some("TOOL_EXEC_FAILED"));
        assert_eq!(event.fields["duration_ms"], 12);
        assert!(!event.ts.is_empty());
    }

    #[test]
    fn unknown_kind_stays_in_fields() {
        let raw = serde_json::json!({"type": "route", "kind": "not_a_kind"});
        let event = shape_kernel_event(&raw);
        assert!(event.error_kind.is_none());
        assert_eq!(event.fields["kind"], "not_a_kind");
    }

    #[test]
    fn serialized_event_omits_empty_slots() {
        let event = TelemetryEvent::new("tool_start");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "tool_start");
        assert!(json.get("severity").is_none());
        assert!(json.get("error_kind").is_none());
        assert!(json.get("message").is_none());
        assert!(json.get("fields").is_none());
        assert!(json.get("ts").is_some());
    }

    #[test]
    fn severity_labels_are_lowercase() {
        assert_eq!(severity(&Level::ERROR), "error");
        assert_eq!(severity(&Level::TRACE), "trace");
    }
}
