//! Inbound notification envelope.
//!
//! The broker delivers JSON bodies shaped as `{ "payload": { "source": ..., ... } }`.
//! Only `source` is structurally significant; every other field is carried
//! through untouched for handlers to interpret.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DispatchError;

/// Reserved `source` value that also triggers the locale-update handlers.
pub const LOCALE_SOURCE: &str = "locale";

/// A single notification as delivered to handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Routing key, e.g. `"tasks"` or `"locale"`
    pub source: String,
    /// Every other field of the payload object
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl NotificationPayload {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            fields: Map::new(),
        }
    }

    /// Add a field, builder style
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// True when this payload belongs to the locale side-channel
    pub fn is_locale_update(&self) -> bool {
        self.source == LOCALE_SOURCE
    }

    /// Parse a raw message body into its payload
    pub fn from_envelope(raw: &str) -> Result<Self, DispatchError> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        Ok(envelope.payload)
    }

    /// Render the payload wrapped in its envelope
    pub fn to_envelope(&self) -> String {
        let mut inner = self.fields.clone();
        inner.insert("source".to_string(), Value::String(self.source.clone()));
        let mut outer = Map::new();
        outer.insert("payload".to_string(), Value::Object(inner));
        Value::Object(outer).to_string()
    }
}

#[derive(Deserialize)]
struct Envelope {
    payload: NotificationPayload,
}
