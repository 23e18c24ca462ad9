use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::info;

use crate::api::{ApiError, DataApiClient, Filter};
use crate::models::Profile;
use crate::query::{MutationEffect, Query, QueryState};

use super::{require_user, ResourceContext};

const PROFILES_TABLE: &str = "profiles";
const UPDATE_LANGUAGES_RPC: &str = "update_profile_languages";

async fn fetch_profile(api: DataApiClient, user_id: String) -> Result<Profile, ApiError> {
    let filter = Filter::table(PROFILES_TABLE).eq("id", &user_id);
    api.select_one(&filter)
        .await?
        .ok_or_else(|| ApiError::Precondition(format!("No profile for user {}", user_id)))
}

/// Profile of the signed-in user.
pub struct ProfileResource {
    api: DataApiClient,
    query: Query<String, Profile>,
}

impl ProfileResource {
    pub fn new(ctx: &ResourceContext) -> Self {
        let api = ctx.api.clone();
        Self {
            api: ctx.api.clone(),
            query: Query::new(ctx.queries.clone(), "profile", move |user_id| {
                fetch_profile(api.clone(), user_id)
            }),
        }
    }

    pub async fn set_user(&self, user_id: Option<String>) {
        self.query.set_key(user_id).await;
    }

    pub async fn refetch(&self) {
        self.query.refetch().await;
    }

    pub fn state(&self) -> QueryState<Profile> {
        self.query.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState<Profile>> {
        self.query.subscribe()
    }

    /// Replace the spoken languages, then reload the profile.
    pub async fn update_languages(&self, languages: Vec<String>) -> Result<(), ApiError> {
        let user_id = require_user(self.query.key())?;
        let args = json!({
            "p_user_id": user_id,
            "p_languages": languages,
        });
        let op = async {
            let _: Value = self.api.rpc(UPDATE_LANGUAGES_RPC, &args).await?;
            Ok(())
        };
        self.query.mutate(op, MutationEffect::Refetch).await?;
        info!(count = languages.len(), "Updated profile languages");
        Ok(())
    }
}
