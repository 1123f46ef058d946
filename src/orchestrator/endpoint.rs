//! Endpoints: the orchestrator's handle on one node

use crate::common::messages::{
    AcceptRejectResponse, CommitMessage, DiscoverResponse, PrepareMessage, RollbackMessage,
    TakeoverMessage,
};
use crate::node::ProtocolServer;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One node the orchestrator talks to.
///
/// Methods use RPITIT (`-> impl Future + Send`) so implementations can be
/// driven from spawned tasks without boxing.
pub trait NodeEndpoint: Send + Sync + 'static {
    /// Address the node is reported under.
    fn address(&self) -> &str;

    fn discover(&self) -> impl Future<Output = Result<DiscoverResponse>> + Send;

    fn prepare(
        &self,
        msg: PrepareMessage,
    ) -> impl Future<Output = Result<AcceptRejectResponse>> + Send;

    fn commit(&self, msg: CommitMessage)
        -> impl Future<Output = Result<AcceptRejectResponse>> + Send;

    fn rollback(
        &self,
        msg: RollbackMessage,
    ) -> impl Future<Output = Result<AcceptRejectResponse>> + Send;

    fn takeover(
        &self,
        msg: TakeoverMessage,
    ) -> impl Future<Output = Result<AcceptRejectResponse>> + Send;
}

/// Endpoint reached over the node's HTTP API.
#[derive(Clone)]
pub struct HttpEndpoint {
    address: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpEndpoint {
    pub fn new(address: impl Into<String>) -> Result<Self> {
        Self::with_connect_timeout(address, Duration::from_secs(5))
    }

    pub fn with_connect_timeout(address: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let address = address.into();
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            address,
            base_url,
            client,
        })
    }

    /// Parse a comma separated list of addresses.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        let endpoints: Vec<Self> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::new)
            .collect::<Result<_>>()?;
        if endpoints.is_empty() {
            return Err(Error::InvalidConfig("no endpoints given".into()));
        }
        Ok(endpoints)
    }

    async fn decode<T: DeserializeOwned>(&self, path: &str, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            let message = serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
            return Err(Error::Http(format!(
                "{} {} returned {}: {}",
                self.address, path, status, message
            )));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        self.decode(path, response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(body)?)
            .send()
            .await?;
        self.decode(path, response).await
    }
}

impl NodeEndpoint for HttpEndpoint {
    fn address(&self) -> &str {
        &self.address
    }

    async fn discover(&self) -> Result<DiscoverResponse> {
        self.get("/protocol/discover").await
    }

    async fn prepare(&self, msg: PrepareMessage) -> Result<AcceptRejectResponse> {
        self.post("/protocol/prepare", &msg).await
    }

    async fn commit(&self, msg: CommitMessage) -> Result<AcceptRejectResponse> {
        self.post("/protocol/commit", &msg).await
    }

    async fn rollback(&self, msg: RollbackMessage) -> Result<AcceptRejectResponse> {
        self.post("/protocol/rollback", &msg).await
    }

    async fn takeover(&self, msg: TakeoverMessage) -> Result<AcceptRejectResponse> {
        self.post("/protocol/takeover", &msg).await
    }
}

/// Endpoint calling a protocol server in the same process.
#[derive(Clone)]
pub struct LocalEndpoint {
    address: String,
    server: Arc<ProtocolServer>,
}

impl LocalEndpoint {
    pub fn new(address: impl Into<String>, server: Arc<ProtocolServer>) -> Self {
        Self {
            address: address.into(),
            server,
        }
    }

    pub fn server(&self) -> &Arc<ProtocolServer> {
        &self.server
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ProtocolServer) -> Result<T> + Send + 'static,
    {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || f(&server))
            .await
            .map_err(|e| Error::Internal(format!("protocol task failed: {}", e)))?
    }
}

impl NodeEndpoint for LocalEndpoint {
    fn address(&self) -> &str {
        &self.address
    }

    async fn discover(&self) -> Result<DiscoverResponse> {
        self.call(|s| s.discover()).await
    }

    async fn prepare(&self, msg: PrepareMessage) -> Result<AcceptRejectResponse> {
        self.call(move |s| s.prepare(&msg)).await
    }

    async fn commit(&self, msg: CommitMessage) -> Result<AcceptRejectResponse> {
        self.call(move |s| s.commit(&msg)).await
    }

    async fn rollback(&self, msg: RollbackMessage) -> Result<AcceptRejectResponse> {
        self.call(move |s| s.rollback(&msg)).await
    }

    async fn takeover(&self, msg: TakeoverMessage) -> Result<AcceptRejectResponse> {
        self.call(move |s| s.takeover(&msg)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let endpoints = HttpEndpoint::parse_list("10.0.0.1:9410, http://10.0.0.2:9410/,").unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].address(), "10.0.0.1:9410");
        assert_eq!(endpoints[0].base_url, "http://10.0.0.1:9410");
        assert_eq!(endpoints[1].base_url, "http://10.0.0.2:9410");
        assert!(HttpEndpoint::parse_list(" , ").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable() {
        // port 9 (discard) is closed on test machines
        let endpoint = HttpEndpoint::new("127.0.0.1:9").unwrap();
        let err = endpoint.discover().await.unwrap_err();
        assert!(err.is_retryable(), "{:?}", err);
    }
}
