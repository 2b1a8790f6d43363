use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, trace};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::{ConfigError, RestConfig};
use crate::entity::Entity;
use crate::query::{Projection, Query};

const PAGE_SIZE: usize = 500;
const USER_AGENT: &str = concat!("bulk-loader/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Connection to the remote system failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status} - {message}")]
    Status { status: u16, message: String },
    #[error("Unexpected response from {endpoint}: {reason}")]
    Malformed { endpoint: String, reason: String },
}

/// The remote record system. Every call blocks the calling worker.
pub trait RestApi: Send + Sync {
    fn search(&self, entity: &str, query: &Query, projection: &Projection) -> Result<Vec<Entity>, RemoteError>;
    fn insert(&self, entity: &str, record: &Entity) -> Result<i64, RemoteError>;
    fn update(&self, entity: &str, id: i64, record: &Entity) -> Result<i64, RemoteError>;
    fn delete(&self, entity: &str, id: i64) -> Result<(), RemoteError>;
    fn associate(&self, entity: &str, id: i64, association: &str, ids: &[i64]) -> Result<(), RemoteError>;
}

#[derive(Deserialize, Debug, Default)]
struct ListResponse {
    #[serde(default)]
    total: Option<usize>,
    #[serde(default)]
    data: Vec<Entity>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ChangeResponse {
    changed_entity_id: Option<i64>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error_message: Option<String>,
}

pub struct HttpRestApi {
    client: Client,
    base_url: String,
    rest_token: Option<String>,
}

impl HttpRestApi {
    pub fn new(config: &RestConfig) -> Result<Self> {
        let base_url = config.base_url.as_deref().filter(|u| !u.trim().is_empty()).ok_or(ConfigError::MissingBaseUrl)?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string(), rest_token: config.rest_token.clone() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.rest_token {
            Some(token) => request.query(&[("BhRestToken", token.as_str())]),
            None => request,
        }
    }

    fn send(&self, request: RequestBuilder, endpoint: &str) -> Result<String, RemoteError> {
        let response = self.authed(request).send()?;
        let status = response.status();
        let body = response.text()?;
        trace!("{} -> {} ({} bytes)", endpoint, status, body.len());
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        Ok(body)
    }

    fn changed_id(&self, request: RequestBuilder, endpoint: &str) -> Result<i64, RemoteError> {
        let body = self.send(request, endpoint)?;
        changed_entity_id(&body, endpoint)
    }
}

impl RestApi for HttpRestApi {
    fn search(&self, entity: &str, query: &Query, projection: &Projection) -> Result<Vec<Entity>, RemoteError> {
        let (path, param) = match query {
            Query::Search(_) => (format!("search/{}", entity), "query"),
            Query::Where(_) => (format!("query/{}", entity), "where"),
        };
        let endpoint = self.url(&path);
        let fields = projection.to_string();
        let count = PAGE_SIZE.to_string();
        let mut results = Vec::new();

        loop {
            let start = results.len().to_string();
            let request = self.client.get(&endpoint).query(&[
                (param, query.text()),
                ("fields", fields.as_str()),
                ("count", count.as_str()),
                ("start", start.as_str()),
            ]);
            let body = self.send(request, &endpoint)?;
            let page = parse_page(&body, &endpoint)?;
            let received = page.data.len();
            results.extend(page.data);
            debug!("{} {} returned {} record(s), {} so far", path, query, received, results.len());
            if !has_more(page.total, received, results.len()) {
                break;
            }
        }
        Ok(results)
    }

    fn insert(&self, entity: &str, record: &Entity) -> Result<i64, RemoteError> {
        let endpoint = self.url(&format!("entity/{}", entity));
        self.changed_id(self.client.put(&endpoint).json(record), &endpoint)
    }

    fn update(&self, entity: &str, id: i64, record: &Entity) -> Result<i64, RemoteError> {
        let endpoint = self.url(&format!("entity/{}/{}", entity, id));
        self.changed_id(self.client.post(&endpoint).json(record), &endpoint)
    }

    fn delete(&self, entity: &str, id: i64) -> Result<(), RemoteError> {
        let endpoint = self.url(&format!("entity/{}/{}", entity, id));
        self.send(self.client.delete(&endpoint), &endpoint).map(|_| ())
    }

    fn associate(&self, entity: &str, id: i64, association: &str, ids: &[i64]) -> Result<(), RemoteError> {
        if ids.is_empty() {
            return Ok(());
        }
        let joined: Vec<String> = ids.iter().map(i64::to_string).collect();
        let endpoint = self.url(&format!("entity/{}/{}/{}/{}", entity, id, association, joined.join(",")));
        self.send(self.client.put(&endpoint).json(&json!({})), &endpoint).map(|_| ())
    }
}

fn parse_page(body: &str, endpoint: &str) -> Result<ListResponse, RemoteError> {
    serde_json::from_str(body).map_err(|e| RemoteError::Malformed { endpoint: endpoint.to_string(), reason: e.to_string() })
}

/// Search responses report `total`; where-clause responses only stop returning full pages.
fn has_more(total: Option<usize>, received: usize, so_far: usize) -> bool {
    match total {
        Some(total) => received > 0 && so_far < total,
        None => received == PAGE_SIZE,
    }
}

fn changed_entity_id(body: &str, endpoint: &str) -> Result<i64, RemoteError> {
    let malformed = |reason: String| RemoteError::Malformed { endpoint: endpoint.to_string(), reason };
    let response: ChangeResponse = serde_json::from_str(body).map_err(|e| malformed(e.to_string()))?;
    response.changed_entity_id.ok_or_else(|| malformed("missing changedEntityId".to_string()))
}

fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|e| e.error_message)
        .or_else(|| serde_json::from_str::<Value>(body).ok().and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string)))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown error").to_string());
    RemoteError::Status { status: status.as_u16(), message }
}
