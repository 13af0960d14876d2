use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};

use super::error::StoreError;
use super::{ObjectEntry, RemoteStore, validate_path};

/// Object store reached over HTTP.
///
/// Objects live at `{base_url}/{namespace}/{path}`; `PUT`, `GET` and `DELETE`
/// map one to one, and `GET {base_url}/{namespace}?prefix=...` returns a JSON
/// array of [`ObjectEntry`].
pub struct HttpStore {
    client: Client,
    base_url: String,
    namespace: String,
    token: Option<String>,
}

impl HttpStore {
    pub fn new(base_url: &str, namespace: &str, token: Option<String>) -> Result<Self, StoreError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace: namespace.trim_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.namespace, path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn fail(response: reqwest::Response) -> StoreError {
        let status = response.status();
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            StoreError::Unavailable(format!("status {}: {message}", status.as_u16()))
        } else {
            StoreError::Status {
                status: status.as_u16(),
                message,
            }
        }
    }
}

impl RemoteStore for HttpStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        validate_path(path)?;
        let response = self
            .authorize(self.client.put(self.object_url(path)))
            .header("content-type", "application/json")
            .body(bytes)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_path(path)?;
        let response = self
            .authorize(self.client.get(self.object_url(path)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        let url = format!("{}/{}", self.base_url, self.namespace);
        let response = self
            .authorize(self.client.get(url))
            .query(&[("prefix", prefix)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        let entries = response.json::<Vec<ObjectEntry>>().await?;
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<bool, StoreError> {
        validate_path(path)?;
        let response = self
            .authorize(self.client.delete(self.object_url(path)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        Ok(true)
    }
}
