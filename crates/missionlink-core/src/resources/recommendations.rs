use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::api::{ApiError, DataApiClient};
use crate::models::{NearbyMission, Profile};
use crate::query::{Query, QueryPhase, QueryState};

use super::ResourceContext;

const NEARBY_MISSIONS_RPC: &str = "get_nearby_missions";

const DEFAULT_RADIUS_KM: f64 = 25.0;
const DEFAULT_MAX_RESULTS: usize = 10;

/// Search center and bounds of the nearby-missions RPC.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyParams {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_km: f64,
    pub max_results: usize,
}

async fn fetch_nearby(api: DataApiClient, params: NearbyParams) -> Result<Vec<NearbyMission>, ApiError> {
    let args = json!({
        "user_lat": params.latitude,
        "user_lng": params.longitude,
        "radius_km": params.radius_km,
        "max_results": params.max_results,
    });
    let rows: Option<Vec<NearbyMission>> = api.rpc(NEARBY_MISSIONS_RPC, &args).await?;
    Ok(rows.unwrap_or_default())
}

/// Missions near the user's profile location.
///
/// Driven by the profile query's state instead of a key of its own: while the
/// profile loads this resource reports loading, and a profile that failed,
/// is missing or has no location ends it in an error without any request.
pub struct RecommendationsResource {
    query: Query<NearbyParams, Vec<NearbyMission>>,
    radius_km: f64,
    max_results: usize,
}

impl RecommendationsResource {
    pub fn new(ctx: &ResourceContext) -> Self {
        let api = ctx.api.clone();
        Self {
            query: Query::new(ctx.queries.clone(), "recommendations", move |params| {
                fetch_nearby(api.clone(), params)
            }),
            radius_km: DEFAULT_RADIUS_KM,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    pub fn with_radius(mut self, radius_km: f64, max_results: usize) -> Self {
        self.radius_km = radius_km;
        self.max_results = max_results;
        self
    }

    pub fn state(&self) -> QueryState<Vec<NearbyMission>> {
        self.query.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState<Vec<NearbyMission>>> {
        self.query.subscribe()
    }

    /// Derive this resource from a profile snapshot.
    pub async fn sync(&self, profile: &QueryState<Profile>) {
        if profile.loading {
            self.query.set_pending();
            return;
        }
        if let Some(error) = &profile.error {
            self.query.set_error(format!("Profile unavailable: {}", error));
            return;
        }
        let Some(profile) = &profile.data else {
            if profile.phase == QueryPhase::Idle {
                self.query.set_key(None).await;
            } else {
                self.query.set_error("No profile to recommend missions for");
            }
            return;
        };
        let Some(location) = profile.location() else {
            self.query.set_error("Profile has no location");
            return;
        };

        debug!(latitude = location.latitude, longitude = location.longitude, "Loading nearby missions");
        self.query
            .set_key(Some(NearbyParams {
                latitude: location.latitude,
                longitude: location.longitude,
                radius_km: self.radius_km,
                max_results: self.max_results,
            }))
            .await;
    }

    /// Keep following profile snapshots until the profile query goes away.
    pub fn follow(self: std::sync::Arc<Self>, mut profile: watch::Receiver<QueryState<Profile>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let snapshot = profile.borrow_and_update().clone();
                self.sync(&snapshot).await;
                if profile.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::test_support::{context, mission_json, profile_json};
    use crate::resources::ProfileResource;
    use std::sync::Arc;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn profile_state(located: bool) -> QueryState<Profile> {
        let profile: Profile = serde_json::from_value(profile_json("u1", located)).unwrap();
        let mut state = QueryState::idle();
        state.start();
        state.succeed(profile);
        state
    }

    #[tokio::test]
    async fn test_upstream_loading_is_loading() {
        let server = MockServer::start().await;
        let recommendations = RecommendationsResource::new(&context(&server));
        let mut upstream = QueryState::idle();
        upstream.start();

        recommendations.sync(&upstream).await;
        assert!(recommendations.state().loading);
    }

    #[tokio::test]
    async fn test_missing_location_fails_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let recommendations = RecommendationsResource::new(&context(&server));
        recommendations.sync(&profile_state(false)).await;
        let state = recommendations.state();
        assert!(!state.loading);
        assert_eq!(state.error.as_deref(), Some("Profile has no location"));
    }

    #[tokio::test]
    async fn test_upstream_error_is_terminal() {
        let server = MockServer::start().await;
        let recommendations = RecommendationsResource::new(&context(&server));
        let mut upstream: QueryState<Profile> = QueryState::idle();
        upstream.start();
        upstream.fail("Unauthorized - token may be expired".to_string());

        recommendations.sync(&upstream).await;
        let state = recommendations.state();
        assert!(state.is_error());
        assert!(state.error.unwrap().starts_with("Profile unavailable"));
    }

    #[tokio::test]
    async fn test_located_profile_fetches_nearby() {
        let server = MockServer::start().await;
        let mut row = mission_json("m7", "Park cleanup");
        row["distance_km"] = serde_json::json!(1.2);
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/get_nearby_missions"))
            .and(body_json(serde_json::json!({
                "user_lat": 45.76,
                "user_lng": 4.83,
                "radius_km": 25.0,
                "max_results": 10
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([row])))
            .mount(&server)
            .await;

        let recommendations = RecommendationsResource::new(&context(&server));
        recommendations.sync(&profile_state(true)).await;
        let data = recommendations.state().data.unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].distance_display(), "1.2 km");
    }

    #[tokio::test]
    async fn test_follow_tracks_profile_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/profiles"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([profile_json("u1", false)])),
            )
            .mount(&server)
            .await;

        let ctx = context(&server);
        let profile = ProfileResource::new(&ctx);
        let recommendations = Arc::new(RecommendationsResource::new(&ctx));
        let mut rx = recommendations.subscribe();
        let task = Arc::clone(&recommendations).follow(profile.subscribe());

        profile.set_user(Some("u1".to_string())).await;
        while recommendations.state().error.is_none() {
            rx.changed().await.unwrap();
        }
        assert_eq!(recommendations.state().error.as_deref(), Some("Profile has no location"));
        task.abort();
    }
}
