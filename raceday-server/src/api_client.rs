//! # api_client
//!
//! Typed calls to the championship REST backend.
//!
//! `StageBackend` is the seam the race-day session persists through; `ApiClient`
//! is the reqwest implementation. Every request carries the bearer token; a
//! `401` triggers one `POST /auth/refresh` and a single retry.

use std::future::Future;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use kart_types::{
    BatteryIndex, KartDrawPayload, LapTimesPayload, NewPenalty, Penalty, PenaltyStatus, ResultTree,
    ScheduleItem,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("could not encode request body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("backend answered {status}: {message}")]
    Status { status: u16, message: String },
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Status { status: 401, .. })
    }
}

/// Persistence calls the race-day session makes.
pub trait StageBackend: Send + Sync + 'static {
    fn save_kart_draw(
        &self,
        stage_id: &str,
        payload: &KartDrawPayload,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn save_stage_results(
        &self,
        stage_id: &str,
        results: &ResultTree,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn save_schedule(
        &self,
        stage_id: &str,
        items: &[ScheduleItem],
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn list_penalties(&self, stage_id: &str) -> impl Future<Output = Result<Vec<Penalty>, ApiError>> + Send;

    fn create_penalty(&self, penalty: &NewPenalty) -> impl Future<Output = Result<Penalty, ApiError>> + Send;

    fn delete_penalty(&self, penalty_id: &str) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn update_penalty_status(
        &self,
        penalty_id: &str,
        status: PenaltyStatus,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn save_lap_times(&self, payload: &LapTimesPayload) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn delete_lap_times(
        &self,
        stage_id: &str,
        category_id: &str,
        battery: BatteryIndex,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

#[derive(Debug, Default)]
struct Tokens {
    access: Option<String>,
    refresh: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: RwLock<Tokens>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, access_token: Option<String>, refresh_token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            tokens: RwLock::new(Tokens {
                access: access_token,
                refresh: refresh_token,
            }),
        }
    }

    async fn request_once(&self, method: &Method, path: &str, body: Option<&Value>) -> Result<reqwest::Response, ApiError> {
        let mut request = self.http.request(method.clone(), format!("{}{path}", self.base_url));
        if let Some(token) = self.tokens.read().await.access.as_deref() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<reqwest::Response, ApiError> {
        let response = self.request_once(&method, path, body.as_ref()).await?;
        if response.status() == StatusCode::UNAUTHORIZED && self.refresh().await? {
            debug!("{method} {path}: retrying with refreshed token");
            let retried = self.request_once(&method, path, body.as_ref()).await?;
            return Self::check(retried).await;
        }
        Self::check(response).await
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            message,
        })
    }

    /// Exchange the refresh token for a new access token.
    /// `Ok(false)` when there is no refresh token or the backend refused it.
    async fn refresh(&self) -> Result<bool, ApiError> {
        let Some(refresh_token) = self.tokens.read().await.refresh.clone() else {
            return Ok(false);
        };

        let response = self
            .http
            .post(format!("{}/auth/refresh", self.base_url))
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await?;
        if !response.status().is_success() {
            warn!("Token refresh refused ({})", response.status());
            return Ok(false);
        }

        let refreshed: RefreshResponse = response.json().await?;
        let mut tokens = self.tokens.write().await;
        tokens.access = Some(refreshed.access_token);
        if let Some(refresh) = refreshed.refresh_token {
            tokens.refresh = Some(refresh);
        }
        info!("Access token refreshed");
        Ok(true)
    }

    async fn send_json<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<Value>) -> Result<T, ApiError> {
        Ok(self.send(method, path, body).await?.json().await?)
    }

    fn lap_times_path(stage_id: &str, category_id: &str, battery: BatteryIndex) -> String {
        format!("/lap-times/stage/{stage_id}/category/{category_id}/battery/{battery}")
    }
}

impl StageBackend for ApiClient {
    async fn save_kart_draw(&self, stage_id: &str, payload: &KartDrawPayload) -> Result<(), ApiError> {
        let body = serde_json::to_value(payload)?;
        self.send(Method::PATCH, &format!("/stages/{stage_id}/kart-draw"), Some(body))
            .await?;
        Ok(())
    }

    async fn save_stage_results(&self, stage_id: &str, results: &ResultTree) -> Result<(), ApiError> {
        let body = json!({ "stageResults": results });
        self.send(Method::PATCH, &format!("/stages/{stage_id}/stage-results"), Some(body))
            .await?;
        Ok(())
    }

    async fn save_schedule(&self, stage_id: &str, items: &[ScheduleItem]) -> Result<(), ApiError> {
        let body = json!({ "schedule": items });
        self.send(Method::PUT, &format!("/stages/{stage_id}/schedule"), Some(body))
            .await?;
        Ok(())
    }

    async fn list_penalties(&self, stage_id: &str) -> Result<Vec<Penalty>, ApiError> {
        self.send_json(Method::GET, &format!("/penalties?stageId={stage_id}"), None)
            .await
    }

    async fn create_penalty(&self, penalty: &NewPenalty) -> Result<Penalty, ApiError> {
        let body = serde_json::to_value(penalty)?;
        self.send_json(Method::POST, "/penalties", Some(body)).await
    }

    async fn delete_penalty(&self, penalty_id: &str) -> Result<(), ApiError> {
        self.send(Method::DELETE, &format!("/penalties/{penalty_id}"), None)
            .await?;
        Ok(())
    }

    async fn update_penalty_status(&self, penalty_id: &str, status: PenaltyStatus) -> Result<(), ApiError> {
        let body = json!({ "status": status });
        self.send(Method::PATCH, &format!("/penalties/{penalty_id}"), Some(body))
            .await?;
        Ok(())
    }

    async fn save_lap_times(&self, payload: &LapTimesPayload) -> Result<(), ApiError> {
        let body = serde_json::to_value(payload)?;
        self.send(Method::POST, "/lap-times", Some(body)).await?;
        Ok(())
    }

    async fn delete_lap_times(&self, stage_id: &str, category_id: &str, battery: BatteryIndex) -> Result<(), ApiError> {
        self.send(Method::DELETE, &Self::lap_times_path(stage_id, category_id, battery), None)
            .await?;
        Ok(())
    }
}
