//! Rendering of received notifications for the terminal.

use notify_channel::NotificationPayload;

/// How notifications are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// `[source] key=value ...`
    Text,
    /// The payload object as one line of JSON
    Json,
}

/// Render one notification
pub fn render(payload: &NotificationPayload, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string(payload).unwrap_or_else(|_| format!("[{}]", payload.source))
        }
        OutputFormat::Text => {
            let fields: Vec<String> = payload
                .fields
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            if fields.is_empty() {
                format!("[{}]", payload.source)
            } else {
                format!("[{}] {}", payload.source, fields.join(" "))
            }
        }
    }
}

/// Render a locale update
pub fn render_locale(payload: &NotificationPayload) -> String {
    match payload.field("locale").and_then(|v| v.as_str()) {
        Some(locale) => format!("locale changed to {locale}"),
        None => "locale changed".to_string(),
    }
}
