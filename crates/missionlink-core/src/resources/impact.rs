use serde_json::{json, Value};
use tokio::sync::watch;

use crate::api::{ApiError, DataApiClient, Filter};
use crate::models::{ImpactStats, UserBadge};
use crate::query::{Query, QueryState};

use super::ResourceContext;

const IMPACT_STATS_RPC: &str = "get_user_impact_stats";
const USER_BADGES_TABLE: &str = "user_badges";

/// The RPC answers with one row, a single-row set, or nothing for new users.
fn decode_stats(value: Value) -> Result<ImpactStats, ApiError> {
    let row = match value {
        Value::Null => return Ok(ImpactStats::default()),
        Value::Array(rows) => match rows.into_iter().next() {
            Some(row) => row,
            None => return Ok(ImpactStats::default()),
        },
        row => row,
    };
    serde_json::from_value(row)
        .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", IMPACT_STATS_RPC, e)))
}

async fn fetch_impact(api: DataApiClient, user_id: String) -> Result<ImpactStats, ApiError> {
    let value: Value = api
        .rpc(IMPACT_STATS_RPC, &json!({ "p_user_id": user_id }))
        .await?;
    decode_stats(value)
}

async fn fetch_badges(api: DataApiClient, user_id: String) -> Result<Vec<UserBadge>, ApiError> {
    let filter = Filter::table(USER_BADGES_TABLE)
        .select("earned_at,badge:badges(*)")
        .eq("user_id", &user_id)
        .order("earned_at", false);
    api.select(&filter).await
}

/// Hours, missions, associations and level computed by the backend.
pub struct ImpactStatsResource {
    query: Query<String, ImpactStats>,
}

impl ImpactStatsResource {
    pub fn new(ctx: &ResourceContext) -> Self {
        let api = ctx.api.clone();
        Self {
            query: Query::new(ctx.queries.clone(), "impact", move |user_id| {
                fetch_impact(api.clone(), user_id)
            }),
        }
    }

    pub async fn set_user(&self, user_id: Option<String>) {
        self.query.set_key(user_id).await;
    }

    pub fn state(&self) -> QueryState<ImpactStats> {
        self.query.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState<ImpactStats>> {
        self.query.subscribe()
    }
}

pub struct BadgesResource {
    query: Query<String, Vec<UserBadge>>,
}

impl BadgesResource {
    pub fn new(ctx: &ResourceContext) -> Self {
        let api = ctx.api.clone();
        Self {
            query: Query::new(ctx.queries.clone(), "badges", move |user_id| {
                fetch_badges(api.clone(), user_id)
            }),
        }
    }

    pub async fn set_user(&self, user_id: Option<String>) {
        self.query.set_key(user_id).await;
    }

    pub fn state(&self) -> QueryState<Vec<UserBadge>> {
        self.query.state()
    }
}
