use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::dto::{Envelope, SyncDataRequest, SyncDataResult};
use super::{RemoteError, RemoteStore};
use crate::models::{Evaluation, EvaluationFilter};

/// `RemoteStore` backed by the evaluation API over HTTP.
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
}

impl HttpRemoteStore {
    /// `base_url` points at the API root, e.g. `http://127.0.0.1:3000/api`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unavailable(format!("Failed to build http client: {}", e)))?;
        let base_url = base_url.trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .map_err(|e| RemoteError::Unavailable(format!("invalid base url {base_url}: {e}")))?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| RemoteError::Unavailable(format!("invalid base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::Unavailable("base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Envelope<T>, RemoteError> {
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;

        if !status.is_success() {
            return Err(status_error(status, body));
        }

        let envelope: Envelope<T> = serde_json::from_str(&body)
            .map_err(|e| RemoteError::Unavailable(format!("unparsable reply: {e}")))?;
        if !envelope.success {
            return Err(RemoteError::Rejected {
                status: status.as_u16(),
                message: envelope.message.unwrap_or_default(),
            });
        }
        Ok(envelope)
    }

    async fn send_data<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RemoteError> {
        self.send(request)
            .await?
            .data
            .ok_or_else(|| RemoteError::Unavailable("reply carried no data".to_string()))
    }
}

fn status_error(status: StatusCode, body: String) -> RemoteError {
    let message = serde_json::from_str::<Envelope<serde_json::Value>>(&body)
        .ok()
        .and_then(|e| e.message)
        .unwrap_or(body);

    match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        StatusCode::CONFLICT => RemoteError::Conflict(message),
        s if s.is_client_error() => RemoteError::Rejected {
            status: s.as_u16(),
            message,
        },
        s => RemoteError::Unavailable(format!("server returned {}: {}", s, message)),
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn health(&self) -> Result<(), RemoteError> {
        let url = self.url(&["health"])?;
        self.send::<serde_json::Value>(self.client.get(url)).await?;
        Ok(())
    }

    async fn list(&self, filter: &EvaluationFilter) -> Result<Vec<Evaluation>, RemoteError> {
        let mut url = self.url(&["evaluations"])?;
        if filter.teacher_name.is_some() || filter.coordinator_name.is_some() {
            let mut pairs = url.query_pairs_mut();
            if let Some(teacher) = &filter.teacher_name {
                pairs.append_pair("teacherName", teacher);
            }
            if let Some(coordinator) = &filter.coordinator_name {
                pairs.append_pair("coordinatorName", coordinator);
            }
        }

        debug!(url = %url, "listing remote evaluations");
        let evaluations: Vec<Evaluation> = self.send_data(self.client.get(url)).await?;
        info!(count = evaluations.len(), "fetched remote evaluations");
        Ok(evaluations)
    }

    async fn get(&self, id: &str) -> Result<Evaluation, RemoteError> {
        let url = self.url(&["evaluations", id])?;
        self.send_data(self.client.get(url)).await
    }

    async fn create(&self, evaluation: &Evaluation) -> Result<Evaluation, RemoteError> {
        let url = self.url(&["evaluations"])?;
        self.send_data(self.client.post(url).json(evaluation)).await
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        let url = self.url(&["evaluations", id])?;
        self.send::<serde_json::Value>(self.client.delete(url)).await?;
        Ok(())
    }

    async fn bulk_upsert(&self, evaluations: &[Evaluation]) -> Result<usize, RemoteError> {
        let url = self.url(&["sync-data"])?;
        let body = SyncDataRequest {
            evaluations: evaluations.to_vec(),
        };
        info!(count = evaluations.len(), "pushing full sync batch");
        let result: SyncDataResult = self.send_data(self.client.post(url).json(&body)).await?;
        Ok(result.upserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(base: &str) -> HttpRemoteStore {
        HttpRemoteStore::new(base, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn trims_trailing_slash() {
        assert_eq!(store("http://localhost:3000/api/").base_url(), "http://localhost:3000/api");
    }

    #[test]
    fn urls_keep_the_api_prefix_and_escape_ids() {
        let s = store("http://localhost:3000/api");
        assert_eq!(
            s.url(&["evaluations", "a b"]).unwrap().as_str(),
            "http://localhost:3000/api/evaluations/a%20b"
        );
        let root = store("http://localhost:3000");
        assert_eq!(root.url(&["health"]).unwrap().as_str(), "http://localhost:3000/health");
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(HttpRemoteStore::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        let body = r#"{"success":false,"message":"Evaluation not found"}"#.to_string();
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, body),
            RemoteError::NotFound("Evaluation not found".to_string())
        );
        assert!(matches!(
            status_error(StatusCode::CONFLICT, String::new()),
            RemoteError::Conflict(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "bad".to_string()),
            RemoteError::Rejected { status: 400, .. }
        ));
        assert!(status_error(StatusCode::BAD_GATEWAY, String::new()).is_transient());
    }
}
