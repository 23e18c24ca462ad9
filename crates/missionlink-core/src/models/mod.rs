//! Data models mirrored from the backend schema.
//!
//! Rows are validated when decoded: a missing required field or an unknown
//! enum value fails with a typed error instead of leaking partial data.
//!
//! - `Mission`, `NearbyMission`, `Association`: the mission catalog
//! - `Registration`: a user's sign-up for a mission
//! - `Profile`, `GeoPoint`: user profile and location
//! - `ImpactStats`, `Badge`, `UserBadge`: impact tracking
//! - `Notification`: in-app notifications

pub mod mission;
pub mod notification;
pub mod profile;

pub use mission::{
    Association, Mission, MissionStatus, NearbyMission, Registration, RegistrationStatus,
};
pub use notification::{unread_count, Notification};
pub use profile::{Badge, GeoPoint, ImpactStats, Profile, UserBadge};
