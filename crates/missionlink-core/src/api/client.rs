//! Client for the remote data API.
//!
//! This module provides the `DataApiClient` struct for table-style filtered
//! reads, row writes and named remote procedure calls against the backend.

use std::time::Duration;

use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{ApiError, Filter};

// ============================================================================
// Constants
// ============================================================================

/// Path prefix of the REST endpoints on the backend.
const REST_PATH: &str = "rest/v1";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Ask the backend to echo written rows back.
const PREFER_REPRESENTATION: &str = "return=representation";

/// Ask the backend for an empty body on writes.
const PREFER_MINIMAL: &str = "return=minimal";

/// Data API client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct DataApiClient {
    client: Client,
    base_url: String,
    api_key: String,
    token: Option<String>,
}

impl DataApiClient {
    /// Create a new client for the backend at `base_url`
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            token: None,
        })
    }

    /// Set the bearer token of the signed-in user
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Create a new client with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            token: Some(token),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}/{}", self.base_url, REST_PATH, table)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/{}/rpc/{}", self.base_url, REST_PATH, function)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let invalid = |e: header::InvalidHeaderValue| {
            ApiError::Precondition(format!("Invalid API credentials: {}", e))
        };

        let mut headers = header::HeaderMap::new();
        headers.insert(
            "apikey",
            header::HeaderValue::from_str(&self.api_key).map_err(invalid)?,
        );
        // Anonymous reads authenticate with the API key itself
        let bearer = self.token.as_deref().unwrap_or(&self.api_key);
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", bearer)).map_err(invalid)?,
        );
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    fn encode<B: Serialize>(body: &B) -> Result<Value, ApiError> {
        serde_json::to_value(body).map_err(|e| ApiError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(context: &str, body: &str) -> Result<T, ApiError> {
        let body = if body.trim().is_empty() { "null" } else { body };
        serde_json::from_str(body)
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", context, e)))
    }

    /// Rows are validated here; a missing collection decodes as empty.
    fn decode_rows<T: DeserializeOwned>(context: &str, body: &str) -> Result<Vec<T>, ApiError> {
        Self::decode::<Option<Vec<T>>>(context, body).map(Option::unwrap_or_default)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        prefer: Option<&str>,
    ) -> Result<String, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .headers(self.auth_headers()?)
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }
            if let Some(prefer) = prefer {
                request = request.header("Prefer", prefer);
            }

            let response = request.send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response.text().await?),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    /// Read the rows matching `filter`.
    pub async fn select<T: DeserializeOwned>(&self, filter: &Filter) -> Result<Vec<T>, ApiError> {
        let table = filter.table_name();
        let body = self
            .send(Method::GET, &self.table_url(table), &filter.read_params(), None, None)
            .await?;
        debug!(table = table, bytes = body.len(), "Select completed");
        Self::decode_rows(table, &body)
    }

    /// Read the first row matching `filter`, if any.
    pub async fn select_one<T: DeserializeOwned>(
        &self,
        filter: &Filter,
    ) -> Result<Option<T>, ApiError> {
        let rows = self.select(&filter.clone().limit(1)).await?;
        Ok(rows.into_iter().next())
    }

    /// Insert a row and return the stored representation.
    pub async fn insert<T: DeserializeOwned, B: Serialize>(
        &self,
        table: &str,
        row: &B,
    ) -> Result<Vec<T>, ApiError> {
        let payload = Self::encode(row)?;
        let body = self
            .send(
                Method::POST,
                &self.table_url(table),
                &[],
                Some(&payload),
                Some(PREFER_REPRESENTATION),
            )
            .await?;
        debug!(table = table, "Insert completed");
        Self::decode_rows(table, &body)
    }

    /// Apply `changes` to the rows matching `filter`.
    pub async fn update<B: Serialize>(&self, filter: &Filter, changes: &B) -> Result<(), ApiError> {
        let params = Self::targeted(filter, "update")?;
        let payload = Self::encode(changes)?;
        self.send(
            Method::PATCH,
            &self.table_url(filter.table_name()),
            &params,
            Some(&payload),
            Some(PREFER_MINIMAL),
        )
        .await?;
        debug!(table = filter.table_name(), "Update completed");
        Ok(())
    }

    /// Delete the rows matching `filter`.
    pub async fn delete(&self, filter: &Filter) -> Result<(), ApiError> {
        let params = Self::targeted(filter, "delete")?;
        self.send(
            Method::DELETE,
            &self.table_url(filter.table_name()),
            &params,
            None,
            Some(PREFER_MINIMAL),
        )
        .await?;
        debug!(table = filter.table_name(), "Delete completed");
        Ok(())
    }

    /// Writes must name their target rows.
    fn targeted(filter: &Filter, verb: &str) -> Result<Vec<(String, String)>, ApiError> {
        let params = filter.write_params();
        if params.is_empty() {
            return Err(ApiError::Precondition(format!(
                "Refusing to {} every row of {}",
                verb,
                filter.table_name()
            )));
        }
        Ok(params)
    }

    /// Call a named remote procedure.
    pub async fn rpc<T: DeserializeOwned, B: Serialize>(
        &self,
        function: &str,
        args: &B,
    ) -> Result<T, ApiError> {
        let payload = Self::encode(args)?;
        let body = self
            .send(Method::POST, &self.rpc_url(function), &[], Some(&payload), None)
            .await?;
        debug!(function = function, bytes = body.len(), "RPC completed");
        Self::decode(function, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Row {
        id: i64,
        name: String,
    }

    fn client(server: &MockServer) -> DataApiClient {
        DataApiClient::new(&server.uri(), "anon-key")
            .expect("client")
            .with_token("user-token".to_string())
    }

    #[tokio::test]
    async fn test_select_sends_filter_and_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/missions"))
            .and(query_param("select", "*"))
            .and(query_param("status", "eq.published"))
            .and(query_param("order", "start_date.asc"))
            .and(query_param("limit", "2"))
            .and(header("apikey", "anon-key"))
            .and(header("authorization", "Bearer user-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "name": "Food bank"},
                {"id": 2, "name": "Beach cleanup"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let filter = Filter::table("missions")
            .eq("status", "published")
            .order("start_date", true)
            .limit(2);
        let rows: Vec<Row> = client(&server).select(&filter).await.expect("select");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].name, "Beach cleanup");
    }

    #[tokio::test]
    async fn test_select_empty_body_is_empty_vec() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/badges"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .mount(&server)
            .await;

        let rows: Vec<Row> = client(&server)
            .select(&Filter::table("badges"))
            .await
            .expect("select");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_select_rejects_malformed_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/missions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
            .mount(&server)
            .await;

        let err = client(&server)
            .select::<Row>(&Filter::table("missions"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_server_rejection_is_structured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/mission_registrations"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "message": "Mission is full",
                "code": "P0001",
                "details": null,
                "hint": null
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .insert::<Row, _>("mission_registrations", &json!({"mission_id": "m-1"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("P0001"));
        assert_eq!(err.to_string(), "Mission is full");
    }

    #[tokio::test]
    async fn test_rpc_posts_arguments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/get_nearby_missions"))
            .and(body_json(json!({"lat": 45.76, "lng": 4.84, "radius_km": 10.0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 7, "name": "Tutoring"}])))
            .mount(&server)
            .await;

        let rows: Vec<Row> = client(&server)
            .rpc(
                "get_nearby_missions",
                &json!({"lat": 45.76, "lng": 4.84, "radius_km": 10.0}),
            )
            .await
            .expect("rpc");
        assert_eq!(rows, vec![Row { id: 7, name: "Tutoring".into() }]);
    }

    #[tokio::test]
    async fn test_update_targets_rows_with_minimal_return() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/notifications"))
            .and(query_param("id", "eq.n-1"))
            .and(header("prefer", "return=minimal"))
            .and(body_json(json!({"is_read": true})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .update(
                &Filter::table("notifications").eq("id", "n-1"),
                &json!({"is_read": true}),
            )
            .await
            .expect("update");
    }

    #[tokio::test]
    async fn test_unfiltered_write_is_refused() {
        let server = MockServer::start().await;
        let err = client(&server)
            .delete(&Filter::table("mission_registrations"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Precondition(_)));
    }

    #[test]
    fn test_base_url_trims_trailing_slash() {
        let api = DataApiClient::new("https://abc.backend.example/", "k").expect("client");
        assert_eq!(api.base_url(), "https://abc.backend.example");
    }
}
