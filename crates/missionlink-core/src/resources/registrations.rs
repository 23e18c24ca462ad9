use serde_json::json;
use tokio::sync::watch;
use tracing::info;

use crate::api::{ApiError, DataApiClient, Filter};
use crate::models::Registration;
use crate::query::{MutationEffect, Query, QueryState};

use super::{require_user, ResourceContext};

const REGISTRATIONS_TABLE: &str = "mission_registrations";

/// Queries whose rows carry registration counts.
const DERIVED_QUERIES: &[&str] = &["missions", "mission"];

const REGISTRATION_COLUMNS: &str =
    "*,mission:missions(*,association:associations(id,name,logo_url))";

async fn fetch_registrations(
    api: DataApiClient,
    user_id: String,
) -> Result<Vec<Registration>, ApiError> {
    let filter = Filter::table(REGISTRATIONS_TABLE)
        .select(REGISTRATION_COLUMNS)
        .eq("user_id", &user_id)
        .neq("status", "cancelled")
        .order("created_at", false);
    api.select(&filter).await
}

/// Missions the signed-in user registered for.
pub struct RegistrationsResource {
    api: DataApiClient,
    query: Query<String, Vec<Registration>>,
}

impl RegistrationsResource {
    pub fn new(ctx: &ResourceContext) -> Self {
        let api = ctx.api.clone();
        Self {
            api: ctx.api.clone(),
            query: Query::new(ctx.queries.clone(), "registrations", move |user_id| {
                fetch_registrations(api.clone(), user_id)
            }),
        }
    }

    pub async fn set_user(&self, user_id: Option<String>) {
        self.query.set_key(user_id).await;
    }

    pub fn state(&self) -> QueryState<Vec<Registration>> {
        self.query.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState<Vec<Registration>>> {
        self.query.subscribe()
    }

    /// Whether the loaded registrations include an active one for `mission_id`.
    pub fn is_registered(&self, mission_id: &str) -> bool {
        self.query.state().data.map_or(false, |rows| {
            rows.iter()
                .any(|r| r.mission_id == mission_id && r.is_active())
        })
    }

    /// Register for a mission, then reload the list and the missions.
    pub async fn register(&self, mission_id: &str) -> Result<Registration, ApiError> {
        let user_id = require_user(self.query.key())?;
        let row = json!({
            "user_id": user_id,
            "mission_id": mission_id,
            "status": "registered",
        });
        let op = async {
            let rows: Vec<Registration> = self.api.insert(REGISTRATIONS_TABLE, &row).await?;
            rows.into_iter().next().ok_or_else(|| {
                ApiError::InvalidResponse("Insert returned no registration".to_string())
            })
        };
        let registration = self
            .query
            .mutate(op, MutationEffect::refetch_with(DERIVED_QUERIES))
            .await?;
        info!(mission_id = mission_id, "Registered for mission");
        Ok(registration)
    }

    /// Cancel the registration for a mission, then reload the list and the
    /// missions.
    pub async fn cancel(&self, mission_id: &str) -> Result<(), ApiError> {
        let user_id = require_user(self.query.key())?;
        let filter = Filter::table(REGISTRATIONS_TABLE)
            .eq("user_id", &user_id)
            .eq("mission_id", mission_id);
        self.query
            .mutate(
                self.api.update(&filter, &json!({"status": "cancelled"})),
                MutationEffect::refetch_with(DERIVED_QUERIES),
            )
            .await?;
        info!(mission_id = mission_id, "Cancelled mission registration");
        Ok(())
    }
}
