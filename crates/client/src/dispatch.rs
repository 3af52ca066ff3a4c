use std::sync::Arc;

use leadbridge_core::{CrmError, CrmResult};
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{Client, Method, StatusCode};
use secrecy::ExposeSecret;
use serde_json::Value;
use tracing::{debug, warn};

use crate::token::{AccessToken, TokenManager};

/// One REST call relative to the instance root.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), query: Vec::new(), body: None }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `None` for an empty body, which is distinct from an empty JSON value.
    pub fn json(&self) -> CrmResult<Option<Value>> {
        if self.body.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&self.body).map(Some).map_err(|_| CrmError::UnexpectedPayload {
            context: "response body",
            body: self.body.clone(),
        })
    }

    pub fn into_remote_error(self) -> CrmError {
        CrmError::Remote { status: self.status, body: self.body }
    }
}

/// Authenticated REST call wrapper with the single re-authentication retry.
pub struct RequestDispatcher {
    http: Client,
    instance_url: String,
    api_version: String,
    tokens: Arc<TokenManager>,
}

impl RequestDispatcher {
    pub fn new(
        http: Client,
        instance_url: impl Into<String>,
        api_version: impl Into<String>,
        tokens: Arc<TokenManager>,
    ) -> Self {
        let instance_url = instance_url.into().trim_end_matches('/').to_string();
        Self { http, instance_url, api_version: api_version.into(), tokens }
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    /// `/services/data/{version}/{suffix}`
    pub fn data_path(&self, suffix: &str) -> String {
        format!("/services/data/{}/{}", self.api_version, suffix.trim_start_matches('/'))
    }

    /// Sends the request and returns the raw response after the
    /// authentication retry. Non-success statuses other than 401 are left
    /// for the caller to classify.
    pub async fn send(&self, request: &ApiRequest) -> CrmResult<ApiResponse> {
        let token = self.tokens.ensure_valid_token().await?;
        let response = self.execute(request, &token).await?;
        if response.status != StatusCode::UNAUTHORIZED.as_u16() {
            return Ok(response);
        }

        let refreshed = self.tokens.refresh_after_rejection(&token).await?;
        let retried = self.execute(request, &refreshed).await?;
        if retried.status == StatusCode::UNAUTHORIZED.as_u16() {
            warn!(
                event_name = "dispatch.auth.rejected_twice",
                method = %request.method,
                path = %request.path,
                "request rejected again after token refresh"
            );
            return Err(CrmError::Auth(format!(
                "request rejected after token refresh: {}",
                retried.body
            )));
        }
        Ok(retried)
    }

    /// Sends the request and parses a successful body. Any non-success
    /// status becomes a remote error carrying the raw payload.
    pub async fn dispatch(&self, request: &ApiRequest) -> CrmResult<Option<Value>> {
        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(response.into_remote_error());
        }
        response.json()
    }

    async fn execute(&self, request: &ApiRequest, token: &AccessToken) -> CrmResult<ApiResponse> {
        let url = format!("{}{}", self.instance_url, request.path);
        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .bearer_auth(token.secret().expose_secret())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }

        debug!(method = %request.method, path = %request.path, "sending CRM request");
        let response = builder.send().await.map_err(|error| {
            let kind = if error.is_timeout() { "timed out" } else { "failed" };
            CrmError::Transport(format!("{} {} {kind}: {error}", request.method, request.path))
        })?;

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|error| {
            CrmError::Transport(format!("{} {} body: {error}", request.method, request.path))
        })?;
        debug!(method = %request.method, path = %request.path, status, "received CRM response");

        Ok(ApiResponse { status, location, body })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ApiRequest, ApiResponse};
    use leadbridge_core::CrmError;

    fn response(status: u16, body: &str) -> ApiResponse {
        ApiResponse { status, location: None, body: body.to_string() }
    }

    #[test]
    fn empty_body_is_absent_but_empty_json_is_present() {
        assert_eq!(response(204, "").json(), Ok(None));
        assert_eq!(response(200, "  \n").json(), Ok(None));
        assert_eq!(response(200, "{}").json(), Ok(Some(json!({}))));
        assert_eq!(response(200, "[]").json(), Ok(Some(json!([]))));
    }

    #[test]
    fn malformed_body_is_unexpected_payload() {
        assert!(matches!(
            response(200, "<html>").json(),
            Err(CrmError::UnexpectedPayload { context: "response body", .. })
        ));
    }

    #[test]
    fn remote_error_keeps_status_and_raw_body() {
        let error = response(400, r#"[{"errorCode":"MALFORMED_QUERY"}]"#).into_remote_error();
        assert_eq!(
            error,
            CrmError::Remote { status: 400, body: r#"[{"errorCode":"MALFORMED_QUERY"}]"#.into() }
        );
    }

    #[test]
    fn builder_keeps_query_pairs_structured() {
        let request =
            ApiRequest::get("/services/data/v59.0/query").with_query("q", "SELECT Id FROM Lead");
        assert_eq!(request.query, vec![("q".to_string(), "SELECT Id FROM Lead".to_string())]);
        assert!(request.body.is_none());
    }
}
