use log::*;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::error::{ReplicaError, ReplicaResult};
use crate::retry::{default_sleeper, RetryPolicy, SleeperRef};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// All requests go to `url_base/resource`.
    pub url_base: String,
    pub accept: String,
    /// Extra request headers, e.g. `["Cookie", "..."]` for cookie-based auth.
    pub headers: Vec<(String, String)>,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            url_base: String::new(),
            accept: "application/json".to_string(),
            headers: Vec::new(),
            timeout_secs: 300,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct RestService {
    config: RestConfig,
    client: Client,
    sleeper: SleeperRef,
}

impl RestService {
    pub fn new(config: RestConfig) -> ReplicaResult<Self> {
        Self::new_with_sleeper(config, default_sleeper())
    }

    pub fn new_with_sleeper(config: RestConfig, sleeper: SleeperRef) -> ReplicaResult<Self> {
        if config.url_base.is_empty() {
            return Err(ReplicaError::InvalidParam("rest service url_base is empty".to_string()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ReplicaError::Internal(format!("Failed to create client: {}", e)))?;
        Ok(Self {
            config,
            client,
            sleeper,
        })
    }

    pub fn url_base(&self) -> &str {
        self.config.url_base.as_str()
    }

    pub fn build_url(&self, resource: &str, options: &[(&str, String)]) -> ReplicaResult<Url> {
        let mut url_str = self.config.url_base.clone();
        if !resource.is_empty() {
            url_str.push('/');
            url_str.push_str(resource);
        }
        let url = if options.is_empty() {
            Url::parse(&url_str)
        } else {
            Url::parse_with_params(&url_str, options.iter().map(|(k, v)| (*k, v.as_str())))
        };
        url.map_err(|e| ReplicaError::InvalidParam(format!("invalid url {}: {}", url_str, e)))
    }

    /// GET `url_base/resource?options` and decode the body as JSON.
    pub async fn make_request(&self, resource: &str, options: &[(&str, String)]) -> ReplicaResult<Value> {
        let url = self.build_url(resource, options)?;
        debug!("{}", url);
        let op_name = format!("GET {}", url);
        self.config
            .retry
            .run(&op_name, self.sleeper.as_ref(), || self.get_once(url.clone()))
            .await
    }

    async fn get_once(&self, url: Url) -> ReplicaResult<Value> {
        let mut request = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, self.config.accept.as_str());
        for (name, value) in self.config.headers.iter() {
            request = request.header(name.as_str(), value.as_str());
        }

        let resp = request.send().await.map_err(|e| map_send_error(&url, e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ReplicaError::from_http_status(
                status,
                format!("{} body: {}", url, body),
            ));
        }

        let content = resp
            .bytes()
            .await
            .map_err(|e| ReplicaError::RemoteError(format!("read body of {} failed: {}", url, e)))?;
        serde_json::from_slice(&content)
            .map_err(|e| ReplicaError::DecodeError(format!("{}: {}", url, e)))
    }

    /// Single GET returning only the response status; used for marker resources.
    pub async fn get_status(&self, url: &str) -> ReplicaResult<StatusCode> {
        let url = Url::parse(url)
            .map_err(|e| ReplicaError::InvalidParam(format!("invalid url {}: {}", url, e)))?;
        let mut request = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "application/json");
        for (name, value) in self.config.headers.iter() {
            request = request.header(name.as_str(), value.as_str());
        }
        let resp = request.send().await.map_err(|e| map_send_error(&url, e))?;
        Ok(resp.status())
    }
}

fn map_send_error(url: &Url, e: reqwest::Error) -> ReplicaError {
    if e.is_timeout() {
        ReplicaError::Timeout(format!("request {} timed out: {}", url, e))
    } else {
        ReplicaError::RemoteError(format!("request {} failed: {}", url, e))
    }
}
