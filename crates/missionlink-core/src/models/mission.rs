use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::{format_date, format_distance, format_duration, truncate_string};

/// Title width in `Mission::summary_line`.
const SUMMARY_TITLE_WIDTH: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Draft,
    Published,
    Completed,
    Cancelled,
}

impl std::fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MissionStatus::Draft => write!(f, "Draft"),
            MissionStatus::Published => write!(f, "Published"),
            MissionStatus::Completed => write!(f, "Completed"),
            MissionStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Association summary embedded in mission rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Association {
    pub id: String,
    pub name: String,
    pub logo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Mission {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub association_id: String,
    #[serde(default)]
    pub association: Option<Association>,
    pub category: Option<String>,
    pub city: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub capacity: i32,
    #[serde(default)]
    pub registered_count: i32,
    pub status: MissionStatus,
    pub image_url: Option<String>,
}

impl Mission {
    pub fn spots_left(&self) -> i32 {
        (self.capacity - self.registered_count).max(0)
    }

    pub fn is_full(&self) -> bool {
        self.spots_left() == 0
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end_date - self.start_date).num_minutes()
    }

    pub fn association_name(&self) -> &str {
        self.association
            .as_ref()
            .map(|a| a.name.as_str())
            .unwrap_or("Unknown association")
    }

    /// One-line summary, e.g. `Food bank sorting - Jul 04, 2026 (2h) - 3 spots left`
    pub fn summary_line(&self) -> String {
        let spots = match self.spots_left() {
            0 => "full".to_string(),
            1 => "1 spot left".to_string(),
            n => format!("{} spots left", n),
        };
        format!(
            "{} - {} ({}) - {}",
            truncate_string(&self.title, SUMMARY_TITLE_WIDTH),
            format_date(&self.start_date),
            format_duration(self.duration_minutes()),
            spots
        )
    }
}

/// Result row of the nearby-missions search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct NearbyMission {
    #[serde(flatten)]
    pub mission: Mission,
    pub distance_km: f64,
}

impl NearbyMission {
    pub fn distance_display(&self) -> String {
        format_distance(self.distance_km)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Registered,
    Cancelled,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Registration {
    pub id: String,
    pub user_id: String,
    pub mission_id: String,
    pub status: RegistrationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub mission: Option<Mission>,
}

impl Registration {
    pub fn is_active(&self) -> bool {
        self.status == RegistrationStatus::Registered
    }
}
