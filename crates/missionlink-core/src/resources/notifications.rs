use serde_json::json;
use tokio::sync::watch;
use tracing::debug;

use crate::api::{ApiError, DataApiClient, Filter};
use crate::models::{unread_count, Notification};
use crate::query::{MutationEffect, Query, QueryState};

use super::{require_user, ResourceContext};

const NOTIFICATIONS_TABLE: &str = "notifications";

/// Number of notifications loaded.
const NOTIFICATION_LIMIT: usize = 50;

async fn fetch_notifications(
    api: DataApiClient,
    user_id: String,
) -> Result<Vec<Notification>, ApiError> {
    let filter = Filter::table(NOTIFICATIONS_TABLE)
        .eq("user_id", &user_id)
        .order("created_at", false)
        .limit(NOTIFICATION_LIMIT);
    api.select(&filter).await
}

/// Latest notifications of the signed-in user.
///
/// Read flags are patched locally once the server confirms the update.
pub struct NotificationsResource {
    api: DataApiClient,
    query: Query<String, Vec<Notification>>,
}

impl NotificationsResource {
    pub fn new(ctx: &ResourceContext) -> Self {
        let api = ctx.api.clone();
        Self {
            api: ctx.api.clone(),
            query: Query::new(ctx.queries.clone(), "notifications", move |user_id| {
                fetch_notifications(api.clone(), user_id)
            }),
        }
    }

    pub async fn set_user(&self, user_id: Option<String>) {
        self.query.set_key(user_id).await;
    }

    pub async fn refetch(&self) {
        self.query.refetch().await;
    }

    pub fn state(&self) -> QueryState<Vec<Notification>> {
        self.query.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState<Vec<Notification>>> {
        self.query.subscribe()
    }

    pub fn unread_count(&self) -> usize {
        self.query
            .state()
            .data
            .map_or(0, |notifications| unread_count(&notifications))
    }

    pub async fn mark_read(&self, notification_id: &str) -> Result<(), ApiError> {
        let filter = Filter::table(NOTIFICATIONS_TABLE).eq("id", notification_id);
        let id = notification_id.to_string();
        self.query
            .mutate(
                self.api.update(&filter, &json!({"is_read": true})),
                MutationEffect::patch(move |notifications: &mut Vec<Notification>| {
                    for n in notifications.iter_mut().filter(|n| n.id == id) {
                        n.is_read = true;
                    }
                }),
            )
            .await?;
        debug!(notification_id = notification_id, "Notification marked read");
        Ok(())
    }

    /// Delete a notification, then drop it from the loaded list.
    pub async fn dismiss(&self, notification_id: &str) -> Result<(), ApiError> {
        let filter = Filter::table(NOTIFICATIONS_TABLE).eq("id", notification_id);
        let id = notification_id.to_string();
        self.query
            .mutate(
                self.api.delete(&filter),
                MutationEffect::patch(move |notifications: &mut Vec<Notification>| {
                    notifications.retain(|n| n.id != id);
                }),
            )
            .await?;
        debug!(notification_id = notification_id, "Notification dismissed");
        Ok(())
    }

    pub async fn mark_all_read(&self) -> Result<(), ApiError> {
        let user_id = require_user(self.query.key())?;
        let filter = Filter::table(NOTIFICATIONS_TABLE)
            .eq("user_id", &user_id)
            .eq("is_read", false);
        self.query
            .mutate(
                self.api.update(&filter, &json!({"is_read": true})),
                MutationEffect::patch(|notifications: &mut Vec<Notification>| {
                    for n in notifications.iter_mut() {
                        n.is_read = true;
                    }
                }),
            )
            .await?;
        debug!("All notifications marked read");
        Ok(())
    }
}
