//! JSON notification documents carried by [`Opcode::Notification`] frames.
//!
//! [`Opcode::Notification`]: crate::protocol::Opcode::Notification

use serde::{Deserialize, Serialize};

/// A phone-style notification to mirror on the glasses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Source application identifier (also used as display name).
    pub app: String,
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub message: String,
}

impl Notification {
    /// Creates a notification.
    #[must_use]
    pub fn new(app: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            title: title.into(),
            message: message.into(),
        }
    }

    /// Encodes the wire document for `msg_id`, stamped with `time_s`.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn to_json(&self, msg_id: u8, time_s: u64) -> serde_json::Result<Vec<u8>> {
        let envelope = Envelope {
            ncs_notification: Body {
                msg_id,
                app_identifier: &self.app,
                title: &self.title,
                message: &self.message,
                time_s,
                display_name: &self.app,
            },
        };
        serde_json::to_vec(&envelope)
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    ncs_notification: Body<'a>,
}

// Field order is part of the wire format.
#[derive(Serialize)]
struct Body<'a> {
    msg_id: u8,
    app_identifier: &'a str,
    title: &'a str,
    message: &'a str,
    time_s: u64,
    display_name: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_document() {
        let n = Notification::new("com.chat", "Ana", "lunch?");
        let json = n.to_json(3, 1_700_000_000).unwrap();
        assert_eq!(
            String::from_utf8(json).unwrap(),
            r#"{"ncs_notification":{"msg_id":3,"app_identifier":"com.chat","title":"Ana","message":"lunch?","time_s":1700000000,"display_name":"com.chat"}}"#
        );
    }

    #[test]
    fn test_notification_escapes_text() {
        let n = Notification::new("app", "say \"hi\"", "line\nbreak");
        let json = n.to_json(0, 0).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["ncs_notification"]["title"], "say \"hi\"");
        assert_eq!(value["ncs_notification"]["message"], "line\nbreak");
    }
}
