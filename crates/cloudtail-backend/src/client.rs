use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{BackendError, BackendQuery, LogBackend};

/// Public Cloud Logging API root
pub const DEFAULT_ENDPOINT: &str = "https://logging.googleapis.com";

/// The API refuses page sizes above this
const MAX_PAGE_SIZE: usize = 1000;

/// Cloud Logging REST client
#[derive(Clone, Debug)]
pub struct CloudLoggingClient {
    http: reqwest::Client,
    endpoint: String,
    project_id: String,
    access_token: Option<String>,
    page_size: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListRequest<'a> {
    resource_names: Vec<String>,
    filter: &'a str,
    order_by: &'static str,
    page_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    entries: Vec<serde_json::Value>,
    next_page_token: Option<String>,
}

impl CloudLoggingClient {
    /// Create a client for a project
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            project_id: project_id.into(),
            access_token: None,
            page_size: MAX_PAGE_SIZE,
        }
    }

    /// Point the client at a different API root (emulators, proxies)
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Bearer token sent with every request
    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token;
        self
    }

    /// Entries requested per page, clamped to the API's accepted range
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn list_url(&self) -> String {
        format!("{}/v2/entries:list", self.endpoint)
    }

    fn list_request<'a>(
        &self,
        query: &'a BackendQuery,
        collected: usize,
        page_token: Option<String>,
    ) -> ListRequest<'a> {
        let page_size = match query.max_entries {
            Some(max) => self.page_size.min(max.saturating_sub(collected)).max(1),
            None => self.page_size,
        };

        ListRequest {
            resource_names: vec![format!("projects/{}", self.project_id)],
            filter: &query.filter,
            order_by: "timestamp asc",
            page_size,
            page_token,
        }
    }

    async fn list_page(&self, body: &ListRequest<'_>) -> Result<ListResponse, BackendError> {
        let mut request = self.http.post(self.list_url()).json(body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }

        response
            .json::<ListResponse>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

impl LogBackend for CloudLoggingClient {
    async fn fetch(
        &self,
        query: &BackendQuery,
    ) -> Result<Vec<serde_json::Value>, BackendError> {
        let mut entries = Vec::new();
        let mut page_token = None;

        loop {
            let body = self.list_request(query, entries.len(), page_token.take());
            let page = self.list_page(&body).await?;
            debug!(
                project = %self.project_id,
                returned = page.entries.len(),
                "fetched entries page"
            );
            entries.extend(page.entries);

            if let Some(max) = query.max_entries {
                if entries.len() >= max {
                    entries.truncate(max);
                    break;
                }
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(entries)
    }
}

/// Map a non-success HTTP status to a backend error
fn classify_failure(status: StatusCode, body: &str) -> BackendError {
    let message = error_message(body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    });

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        BackendError::Unavailable(format!("{}: {}", status.as_u16(), message))
    } else {
        BackendError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

/// Extract `error.message` from a Google API error body
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_string)
}
