//! Google Cloud Storage backend.
//!
//! Objects are written and read through the XML API (`/{bucket}/{object}`),
//! which accepts streamed bodies and `x-goog-*` headers; listing goes through
//! the paginated JSON API. Credentials are a bearer token supplied by the
//! environment.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::{Client, Response};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use super::{ByteStream, ObjectMetadata, ObjectStore, RejectKind, StoreError};

/// Longest object name GCS accepts, in UTF-8 bytes.
const MAX_OBJECT_NAME_LEN: usize = 1024;

#[derive(Clone)]
pub struct GcsObjectStore {
    http: Client,
    endpoint: Url,
    bucket: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
}

impl GcsObjectStore {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        token: Option<String>,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let endpoint = Url::parse(endpoint).map_err(|e| malformed(format!("endpoint: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(malformed(format!("endpoint `{endpoint}` cannot be a base URL")));
        }
        let http = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| malformed(format!("http client: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            bucket: bucket.to_string(),
            token,
        })
    }

    fn url_with_segments<'a>(
        &self,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> Result<Url, StoreError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| malformed(format!("endpoint `{}` cannot be a base URL", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, path: &str) -> Result<Url, StoreError> {
        if path.is_empty() {
            return Err(malformed("empty object path".to_string()));
        }
        if path.len() > MAX_OBJECT_NAME_LEN || path.contains(['\r', '\n']) {
            return Err(StoreError::InvalidKey(path.to_string()));
        }
        self.url_with_segments(std::iter::once(self.bucket.as_str()).chain(path.split('/')))
    }

    fn list_url(&self) -> Result<Url, StoreError> {
        self.url_with_segments(["storage", "v1", "b", self.bucket.as_str(), "o"])
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn malformed(message: String) -> StoreError {
    StoreError::Rejected {
        kind: RejectKind::Malformed,
        message,
    }
}

fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_builder() {
        malformed(err.to_string())
    } else {
        StoreError::Transient(err.to_string())
    }
}

/// A 404 on a write means the bucket itself is missing or misnamed.
fn missing_bucket(err: StoreError) -> StoreError {
    match err {
        StoreError::NotFound(message) => malformed(format!("bucket not found: {message}")),
        other => other,
    }
}

async fn check_status(response: Response, path: &str) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        path.to_string()
    } else {
        format!("{path}: {}", body.trim())
    };
    Err(StoreError::from_status(status.as_u16(), message))
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn put(
        &self,
        path: &str,
        body: ByteStream,
        metadata: &ObjectMetadata,
    ) -> Result<(), StoreError> {
        let url = self.object_url(path)?;
        let mut request = self.authorize(self.http.put(url)).header(
            "content-type",
            metadata
                .content_type
                .as_deref()
                .unwrap_or("application/octet-stream"),
        );
        if let Some(len) = metadata.content_length {
            request = request.header("content-length", len);
        }
        if let Some(class) = &metadata.storage_class {
            request = request.header("x-goog-storage-class", class);
        }
        if let Some(checksum) = &metadata.checksum {
            request = request.header("x-goog-meta-checksum", checksum);
        }

        let response = request
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, path).await.map_err(missing_bucket)?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<ByteStream, StoreError> {
        let url = self.object_url(path)?;
        let response = self
            .authorize(self.http.get(url))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, path).await?;
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::pin(stream))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.list_url()?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                query.append_pair("fields", "items(name),nextPageToken");
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let response = self
                .authorize(self.http.get(url))
                .send()
                .await
                .map_err(transport_error)?;
            let page: ListResponse = check_status(response, prefix)
                .await?
                .json()
                .await
                .map_err(|e| StoreError::Transient(format!("invalid list response: {e}")))?;

            names.extend(page.items.into_iter().map(|item| item.name));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        names.sort();
        Ok(names)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let url = self.object_url(path)?;
        let response = self
            .authorize(self.http.delete(url))
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, path).await.map_err(missing_bucket)?;
        Ok(())
    }
}
