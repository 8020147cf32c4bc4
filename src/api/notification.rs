use serde::{Deserialize, Serialize};

use crate::{db::Outcome, payment};

/// Notification posted by the payment provider. Only a pointer to the
/// payment, its outcome is always fetched from the provider.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Notification {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: Option<NotificationData>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NotificationData {
    #[serde(default, deserialize_with = "payment::deserialize_reference")]
    pub id: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Acknowledgement {
    pub success: bool,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&Outcome> for Acknowledgement {
    fn from(outcome: &Outcome) -> Self {
        let (outcome, reason) = match outcome {
            Outcome::Recorded { .. } => ("recorded", None),
            Outcome::Unchanged(_) => ("unchanged", None),
            Outcome::Ignored(reason) => ("ignored", Some(reason.to_string())),
        };
        Self {
            success: true,
            outcome: outcome.to_string(),
            reason,
        }
    }
}
