use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::api::{ApiError, DataApiClient, Filter};
use crate::models::Mission;
use crate::query::{Query, QueryState};

use super::ResourceContext;

const MISSIONS_TABLE: &str = "missions";

/// Mission columns plus the embedded association summary.
const MISSION_COLUMNS: &str = "*,association:associations(id,name,logo_url)";

/// Default page size of the catalog.
const DEFAULT_LIMIT: usize = 50;

/// Catalog filters; also the query key of `MissionsResource`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionFilters {
    pub category: Option<String>,
    /// Case-insensitive city match
    pub city: Option<String>,
    /// Only missions starting on or after this day
    pub from_date: Option<NaiveDate>,
    pub limit: Option<usize>,
}

impl MissionFilters {
    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.city.is_none()
            && self.from_date.is_none()
            && self.limit.is_none()
    }

    fn to_filter(&self) -> Filter {
        let mut filter = Filter::table(MISSIONS_TABLE)
            .select(MISSION_COLUMNS)
            .eq("status", "published");
        if let Some(category) = &self.category {
            filter = filter.eq("category", category);
        }
        if let Some(city) = &self.city {
            filter = filter.ilike("city", &format!("*{}*", city));
        }
        if let Some(from) = self.from_date {
            filter = filter.gte("start_date", from.format("%Y-%m-%d"));
        }
        filter
            .order("start_date", true)
            .limit(self.limit.unwrap_or(DEFAULT_LIMIT))
    }
}

async fn fetch_missions(
    api: DataApiClient,
    filters: MissionFilters,
) -> Result<Vec<Mission>, ApiError> {
    api.select(&filters.to_filter()).await
}

async fn fetch_mission(api: DataApiClient, id: String) -> Result<Mission, ApiError> {
    let filter = Filter::table(MISSIONS_TABLE)
        .select(MISSION_COLUMNS)
        .eq("id", &id);
    api.select_one(&filter)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Mission {}", id)))
}

/// Published missions, soonest first.
pub struct MissionsResource {
    query: Query<MissionFilters, Vec<Mission>>,
}

impl MissionsResource {
    pub fn new(ctx: &ResourceContext) -> Self {
        let api = ctx.api.clone();
        Self {
            query: Query::new(ctx.queries.clone(), "missions", move |filters| {
                fetch_missions(api.clone(), filters)
            }),
        }
    }

    pub async fn load(&self, filters: MissionFilters) {
        self.query.set_key(Some(filters)).await;
    }

    pub async fn refetch(&self) {
        self.query.refetch().await;
    }

    pub fn state(&self) -> QueryState<Vec<Mission>> {
        self.query.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState<Vec<Mission>>> {
        self.query.subscribe()
    }
}

/// One mission by id.
pub struct MissionDetailResource {
    query: Query<String, Mission>,
}

impl MissionDetailResource {
    pub fn new(ctx: &ResourceContext) -> Self {
        let api = ctx.api.clone();
        Self {
            query: Query::new(ctx.queries.clone(), "mission", move |id| {
                fetch_mission(api.clone(), id)
            }),
        }
    }

    pub async fn set_mission(&self, id: Option<String>) {
        self.query.set_key(id).await;
    }

    pub fn state(&self) -> QueryState<Mission> {
        self.query.state()
    }
}
