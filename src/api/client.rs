use crate::api::error::ApiError;
use crate::api::models::{Message, OutgoingMessage, User};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// The four chat endpoints the session store consumes.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn users(&self) -> Result<Vec<User>, ApiError>;
    async fn messages(&self, user_id: &str) -> Result<Vec<Message>, ApiError>;
    async fn send(&self, user_id: &str, payload: &OutgoingMessage) -> Result<Message, ApiError>;
    async fn mark_read(&self, user_id: &str) -> Result<(), ApiError>;
}

pub struct ApiClient {
    http: HttpClient,
    base_api: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ApiError> {
        let http = HttpClient::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self::with_http(http, base_url, token))
    }

    pub fn with_http(http: HttpClient, base_url: &str, token: Option<String>) -> Self {
        Self {
            http,
            base_api: Self::base_api(base_url),
            token,
        }
    }

    fn base_api(base_url: &str) -> String {
        let trimmed = base_url.trim_end_matches('/');
        if trimmed.ends_with("/api") { trimmed.to_string() } else { format!("{}/api", trimmed) }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_api, path.trim_start_matches('/'))
    }

    fn with_auth(&self, mut req: RequestBuilder) -> RequestBuilder {
        if let Some(t) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", t));
        }
        req
    }

    async fn checked(resp: Response) -> Result<Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::from_body(status, &body))
    }

    async fn body(req: RequestBuilder) -> Result<Vec<u8>, ApiError> {
        let resp = Self::checked(req.send().await?).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, ApiError> {
        let bytes = Self::body(req).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Keeps the entries of a JSON array that decode as `T`. Anything other than
    /// an array yields an empty list.
    fn lenient_list<T: DeserializeOwned>(json: Value, what: &str) -> Vec<T> {
        let Value::Array(items) = json else {
            log::warn!("{what} response is not a list, treating it as empty");
            return Vec::new();
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value(item) {
                Ok(v) => out.push(v),
                Err(e) => log::warn!("skipping malformed {what} entry: {e}"),
            }
        }
        out
    }
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn users(&self) -> Result<Vec<User>, ApiError> {
        let req = self.with_auth(self.http.get(self.endpoint("messages/users")));
        let bytes = Self::body(req).await?;
        // A successful body that is not JSON at all is treated like any other non-list.
        let json = serde_json::from_slice::<Value>(&bytes).unwrap_or(Value::Null);
        log::debug!("users response: {json}");
        Ok(Self::lenient_list(json, "user"))
    }

    async fn messages(&self, user_id: &str) -> Result<Vec<Message>, ApiError> {
        let req = self.with_auth(self.http.get(self.endpoint(&format!("messages/{}", user_id))));
        Self::json(req).await
    }

    async fn send(&self, user_id: &str, payload: &OutgoingMessage) -> Result<Message, ApiError> {
        let req = self
            .with_auth(self.http.post(self.endpoint(&format!("messages/send/{}", user_id))))
            .json(payload);
        Self::json(req).await
    }

    async fn mark_read(&self, user_id: &str) -> Result<(), ApiError> {
        let req = self.with_auth(self.http.patch(self.endpoint(&format!("messages/mark-read/{}", user_id))));
        Self::checked(req.send().await?).await?;
        Ok(())
    }
}
