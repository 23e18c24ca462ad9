use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub message: Option<String>,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub is_read: bool,
    pub link: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn default_kind() -> String {
    "info".to_string()
}

/// Number of unread notifications in `notifications`.
pub fn unread_count(notifications: &[Notification]) -> usize {
    notifications.iter().filter(|n| !n.is_read).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_notification_and_count_unread() {
        let json = r#"[
            {"id": "n-1", "user_id": "u-1", "title": "Registration confirmed", "message": null,
             "type": "registration", "is_read": false, "link": "/missions/m-1",
             "created_at": "2026-06-01T08:00:00Z"},
            {"id": "n-2", "user_id": "u-1", "title": "New badge", "message": "You earned a badge",
             "link": null, "created_at": "2026-06-02T08:00:00Z", "is_read": true}
        ]"#;
        let notifications: Vec<Notification> = serde_json::from_str(json).expect("json");
        assert_eq!(notifications[0].kind, "registration");
        assert_eq!(notifications[1].kind, "info");
        assert_eq!(unread_count(&notifications), 1);
    }
}
