//! Projection management over the server's HTTP API.

use evstore_core::http::HttpClient;
use evstore_core::{EndPoint, UserCredentials};
use http::StatusCode;
use tracing::info;

use crate::error::AdminResult;
use crate::models::{ProjectionDetails, ProjectionList, ProjectionStatistics};
use crate::request::{AdminHttp, encode_query_value};

/// Query language handed to the projection engine on create.
const QUERY_TYPE: &str = "JS";

/// Creates, inspects and controls projections on one node.
#[derive(Debug, Clone)]
pub struct ProjectionsManager {
    http: AdminHttp,
}

impl ProjectionsManager {
    pub fn new(endpoint: EndPoint, client: HttpClient) -> Self {
        Self {
            http: AdminHttp::new(endpoint, client),
        }
    }

    /// Credentials used when a call passes `None`.
    pub fn with_default_credentials(mut self, credentials: UserCredentials) -> Self {
        self.http.set_default_credentials(credentials);
        self
    }

    pub fn endpoint(&self) -> &EndPoint {
        self.http.endpoint()
    }

    // ── Commands ─────────────────────────────────────────────────────

    pub async fn enable(&self, name: &str, credentials: Option<&UserCredentials>) -> AdminResult<()> {
        self.command(name, "enable", credentials).await
    }

    pub async fn disable(&self, name: &str, credentials: Option<&UserCredentials>) -> AdminResult<()> {
        self.command(name, "disable", credentials).await
    }

    pub async fn abort(&self, name: &str, credentials: Option<&UserCredentials>) -> AdminResult<()> {
        self.command(name, "abort", credentials).await
    }

    pub async fn reset(&self, name: &str, credentials: Option<&UserCredentials>) -> AdminResult<()> {
        self.command(name, "reset", credentials).await
    }

    async fn command(&self, name: &str, command: &str, credentials: Option<&UserCredentials>) -> AdminResult<()> {
        let path = format!("/projection/{name}/command/{command}");
        self.http.post(&path, "", credentials, StatusCode::OK).await?;
        info!(projection = %name, %command, "projection command accepted");
        Ok(())
    }

    // ── Creation ─────────────────────────────────────────────────────

    pub async fn create_one_time(&self, query: &str, credentials: Option<&UserCredentials>) -> AdminResult<()> {
        let path = format!("/projections/onetime?type={QUERY_TYPE}");
        self.http.post(&path, query, credentials, StatusCode::CREATED).await
    }

    pub async fn create_transient(
        &self,
        name: &str,
        query: &str,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<()> {
        let path = format!(
            "/projections/transient?name={}&type={QUERY_TYPE}",
            encode_query_value(name)
        );
        self.http.post(&path, query, credentials, StatusCode::CREATED).await
    }

    /// Create a continuous projection. Emitting is always enabled;
    /// `track_emitted_streams` lets a later delete remove what it wrote.
    pub async fn create_continuous(
        &self,
        name: &str,
        query: &str,
        track_emitted_streams: bool,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<()> {
        let path = format!(
            "/projections/continuous?name={}&type={QUERY_TYPE}&emit=1&trackemittedstreams={}",
            encode_query_value(name),
            u8::from(track_emitted_streams)
        );
        self.http.post(&path, query, credentials, StatusCode::CREATED).await?;
        info!(projection = %name, "continuous projection created");
        Ok(())
    }

    // ── Listing ──────────────────────────────────────────────────────

    pub async fn list_all(&self, credentials: Option<&UserCredentials>) -> AdminResult<Vec<ProjectionDetails>> {
        self.list("/projections/any", credentials).await
    }

    pub async fn list_one_time(&self, credentials: Option<&UserCredentials>) -> AdminResult<Vec<ProjectionDetails>> {
        self.list("/projections/onetime", credentials).await
    }

    pub async fn list_continuous(
        &self,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<Vec<ProjectionDetails>> {
        self.list("/projections/continuous", credentials).await
    }

    async fn list(&self, path: &str, credentials: Option<&UserCredentials>) -> AdminResult<Vec<ProjectionDetails>> {
        let body = self.http.get(path, credentials).await?;
        let list: ProjectionList = serde_json::from_str(&body)?;
        Ok(list.projections.unwrap_or_default())
    }

    // ── Inspection ───────────────────────────────────────────────────

    pub async fn get_status(
        &self,
        name: &str,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<ProjectionDetails> {
        let body = self.http.get(&format!("/projection/{name}"), credentials).await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn get_state(
        &self,
        name: &str,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<serde_json::Value> {
        self.get_json(&format!("/projection/{name}/state"), credentials).await
    }

    pub async fn get_partition_state(
        &self,
        name: &str,
        partition: &str,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<serde_json::Value> {
        let path = format!("/projection/{name}/state?partition={}", encode_query_value(partition));
        self.get_json(&path, credentials).await
    }

    pub async fn get_result(
        &self,
        name: &str,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<serde_json::Value> {
        self.get_json(&format!("/projection/{name}/result"), credentials).await
    }

    pub async fn get_partition_result(
        &self,
        name: &str,
        partition: &str,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<serde_json::Value> {
        let path = format!("/projection/{name}/result?partition={}", encode_query_value(partition));
        self.get_json(&path, credentials).await
    }

    pub async fn get_statistics(
        &self,
        name: &str,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<ProjectionStatistics> {
        let body = self.http.get(&format!("/projection/{name}/statistics"), credentials).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// The projection's source text, returned verbatim.
    pub async fn get_query(&self, name: &str, credentials: Option<&UserCredentials>) -> AdminResult<String> {
        self.http.get(&format!("/projection/{name}/query"), credentials).await
    }

    async fn get_json(&self, path: &str, credentials: Option<&UserCredentials>) -> AdminResult<serde_json::Value> {
        let body = self.http.get(path, credentials).await?;
        Ok(serde_json::from_str(&body)?)
    }

    // ── Modification ─────────────────────────────────────────────────

    /// Replace the query. `emit_enabled` is left unchanged when `None`.
    pub async fn update_query(
        &self,
        name: &str,
        query: &str,
        emit_enabled: Option<bool>,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<()> {
        let mut path = format!("/projection/{name}/query");
        if let Some(emit) = emit_enabled {
            path.push_str(&format!("?emit={}", u8::from(emit)));
        }
        self.http.put(&path, query, credentials).await
    }

    pub async fn delete(
        &self,
        name: &str,
        delete_emitted_streams: bool,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<()> {
        let path = format!(
            "/projection/{name}?deleteEmittedStreams={}",
            u8::from(delete_emitted_streams)
        );
        self.http.delete(&path, credentials).await?;
        info!(projection = %name, delete_emitted_streams, "projection deleted");
        Ok(())
    }
}
