//! Global notification models

use serde::{Deserialize, Serialize};

/// How the UI is expected to present a notification. Carried, never enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryHint {
    #[serde(default)]
    pub auto_close: bool,
    /// Milliseconds before the notification should self-clear.
    #[serde(default)]
    pub auto_close_delay: Option<u64>,
}

/// Room-independent event such as "application_accepted".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub hint: DeliveryHint,
}

impl NotificationEvent {
    /// Build a notification from a named socket event.
    ///
    /// The payload's `type` wins over the event name. Non-object payloads are
    /// not notifications.
    pub fn from_event(name: &str, payload: &serde_json::Value) -> Option<Self> {
        let obj = payload.as_object()?;
        let kind = obj
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or(name)
            .to_string();
        let text = |key: &str| {
            obj.get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let hint: DeliveryHint = serde_json::from_value(payload.clone()).unwrap_or_default();

        Some(Self {
            title: text("title").unwrap_or_else(|| kind.replace('_', " ")),
            message: text("message").unwrap_or_default(),
            kind,
            hint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_named_event() {
        let payload = json!({
            "title": "Application accepted",
            "message": "Your application for 'Logo design' was accepted",
            "autoClose": true,
            "autoCloseDelay": 5000
        });
        let n = NotificationEvent::from_event("application_accepted", &payload).unwrap();
        assert_eq!(n.kind, "application_accepted");
        assert_eq!(n.title, "Application accepted");
        assert!(n.hint.auto_close);
        assert_eq!(n.hint.auto_close_delay, Some(5000));
    }

    #[test]
    fn test_payload_type_overrides_event_name() {
        let payload = json!({"type": "bid_rejected", "message": "no"});
        let n = NotificationEvent::from_event("notification", &payload).unwrap();
        assert_eq!(n.kind, "bid_rejected");
        assert_eq!(n.title, "bid rejected");
        assert_eq!(n.hint, DeliveryHint::default());
    }

    #[test]
    fn test_non_object_payload_rejected() {
        assert!(NotificationEvent::from_event("ping", &json!("x")).is_none());
    }
}
