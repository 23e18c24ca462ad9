//! Application resources built on `Query`.
//!
//! Each resource owns one query and knows which table or remote procedure
//! backs it. Mutations go to the server first; on success the resource
//! either refetches or patches its data locally.

mod impact;
mod missions;
mod notifications;
mod profile;
mod recommendations;
mod registrations;

use crate::api::{ApiError, DataApiClient};
use crate::query::QueryClient;

pub use impact::{BadgesResource, ImpactStatsResource};
pub use missions::{MissionDetailResource, MissionFilters, MissionsResource};
pub use notifications::NotificationsResource;
pub use profile::ProfileResource;
pub use recommendations::{NearbyParams, RecommendationsResource};
pub use registrations::RegistrationsResource;

/// Clients shared by every resource.
#[derive(Clone)]
pub struct ResourceContext {
    pub api: DataApiClient,
    pub queries: QueryClient,
}

impl ResourceContext {
    pub fn new(api: DataApiClient, queries: QueryClient) -> Self {
        Self { api, queries }
    }
}

/// The signed-in user id a mutation acts for.
fn require_user(user_id: Option<String>) -> Result<String, ApiError> {
    user_id.ok_or_else(|| ApiError::Precondition("Not signed in".to_string()))
}
