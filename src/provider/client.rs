use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde_json::Value;

use super::JobProvider;
use super::error::ProviderError;
use super::types::{JobHandle, ProviderRequest, ProviderStatus, StatusLexicon, StatusReport};
use crate::decoder::{DecodeError, parse_json_body};

const DEFAULT_BASE_URL: &str = "https://queue.fal.run";

// Longest error body kept in a ProviderError message.
const MAX_ERROR_BODY: usize = 300;

/// Bearer-authenticated JSON client for a queue-style generation API.
///
/// Submissions go to `POST {base}/{endpoint}`, status checks to
/// `GET {base}/{endpoint}/requests/{job_id}/status`. When a finished status
/// points at its output through `response_url`, that body becomes the result.
pub struct HttpProvider {
    api_key: String,
    client: Client,
    base_url: String,
    lexicon: StatusLexicon,
}

impl HttpProvider {
    pub fn new(api_key: String, request_timeout: Duration) -> Result<Self, ProviderError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string(), request_timeout)
    }

    /// Create a client pointing at a custom base URL (a backend proxy, or a mock server in tests).
    pub fn with_base_url(
        api_key: String,
        base_url: String,
        request_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            api_key,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            lexicon: StatusLexicon::default(),
        })
    }

    /// Status words that mean "finished" for result fetching.
    pub fn with_lexicon(mut self, lexicon: StatusLexicon) -> Self {
        self.lexicon = lexicon;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn fetch_result(&self, url: &str) -> Result<Value, ProviderError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn read_json(response: Response) -> Result<Value, ProviderError> {
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        if !status.is_success() {
            let message = truncate(&String::from_utf8_lossy(&body));
            let code = status.as_u16();
            return Err(if is_permanent(status) {
                ProviderError::Rejected {
                    status: code,
                    message,
                }
            } else {
                ProviderError::Unavailable {
                    status: code,
                    message,
                }
            });
        }

        parse_json_body(content_type.as_deref(), &body).map_err(|e| match e {
            DecodeError::NotJson { content_type } => ProviderError::NonJson { content_type },
            other => ProviderError::Malformed(other.to_string()),
        })
    }
}

// 4xx is final, except timeouts and rate limits which may clear up.
fn is_permanent(status: StatusCode) -> bool {
    status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_ERROR_BODY {
        return text.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

impl JobProvider for HttpProvider {
    async fn submit(&self, request: &ProviderRequest) -> Result<JobHandle, ProviderError> {
        let response = self
            .client
            .post(self.url(&request.endpoint))
            .bearer_auth(&self.api_key)
            .json(&request.params)
            .send()
            .await?;

        let body = Self::read_json(response).await?;
        JobHandle::from_submit_response(&request.endpoint, &body)
    }

    async fn status(&self, handle: &JobHandle) -> Result<StatusReport, ProviderError> {
        let path = format!(
            "{}/requests/{}/status",
            handle.endpoint.trim_end_matches('/'),
            handle.job_id
        );
        let response = self
            .client
            .get(self.url(&path))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let body = Self::read_json(response).await?;
        let mut report = StatusReport::from_value(&body)?;

        if self.lexicon.classify(&report.status) == ProviderStatus::Succeeded
            && let Some(result_url) = body.get("response_url").and_then(Value::as_str)
        {
            // The API key is only ever sent back to our own base URL.
            if result_url.starts_with(&format!("{}/", self.base_url)) {
                report.result = Some(self.fetch_result(result_url).await?);
            } else {
                tracing::warn!(
                    job_id = %handle.job_id,
                    url = result_url,
                    "Ignoring response_url outside the provider base URL"
                );
            }
        }
        Ok(report)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::Capability;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::with_base_url("test-key".into(), server.uri(), Duration::from_secs(5))
            .unwrap()
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            capability: Capability::Video,
            endpoint: "fal-ai/veo3".into(),
            params: json!({"prompt": "a red fox", "duration": "8s"}),
        }
    }

    #[tokio::test]
    async fn submit_returns_job_handle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fal-ai/veo3"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"request_id": "req-123"})))
            .expect(1)
            .mount(&server)
            .await;

        let handle = provider(&server).submit(&request()).await.unwrap();
        assert_eq!(handle.job_id, "req-123");
        assert_eq!(handle.endpoint, "fal-ai/veo3");
    }

    #[tokio::test]
    async fn submit_4xx_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid prompt"))
            .mount(&server)
            .await;

        let err = provider(&server).submit(&request()).await.unwrap_err();
        match err {
            ProviderError::Rejected { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "invalid prompt");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_5xx_and_429_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fal-ai/veo3"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = provider(&server).submit(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { status: 503, .. }));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        let err = provider(&server).submit(&request()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn html_error_page_is_non_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fal-ai/veo3/requests/req-1/status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html><body>Cloudflare</body></html>"),
            )
            .mount(&server)
            .await;

        let handle = JobHandle {
            endpoint: "fal-ai/veo3".into(),
            job_id: "req-1".into(),
        };
        let err = provider(&server).status(&handle).await.unwrap_err();
        assert!(matches!(err, ProviderError::NonJson { .. }));
    }

    #[tokio::test]
    async fn status_is_normalized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fal-ai/veo3/requests/req-1/status"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "COMPLETED",
                "video": {"url": "https://cdn.example/out.mp4"}
            })))
            .mount(&server)
            .await;

        let handle = JobHandle {
            endpoint: "fal-ai/veo3".into(),
            job_id: "req-1".into(),
        };
        let report = provider(&server).status(&handle).await.unwrap();
        assert_eq!(report.status, "COMPLETED");
        assert_eq!(
            report.result.unwrap()["video"]["url"],
            "https://cdn.example/out.mp4"
        );
    }

    #[tokio::test]
    async fn finished_status_fetches_result_from_response_url() {
        let server = MockServer::start().await;
        let result_url = format!("{}/fal-ai/veo3/requests/req-1", server.uri());
        Mock::given(method("GET"))
            .and(path("/fal-ai/veo3/requests/req-1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "COMPLETED",
                "request_id": "req-1",
                "response_url": result_url,
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fal-ai/veo3/requests/req-1"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "video": {"url": "https://cdn.example/out.mp4"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let handle = JobHandle {
            endpoint: "fal-ai/veo3".into(),
            job_id: "req-1".into(),
        };
        let report = provider(&server).status(&handle).await.unwrap();
        assert_eq!(
            report.result,
            Some(json!({"video": {"url": "https://cdn.example/out.mp4"}}))
        );
    }

    #[tokio::test]
    async fn running_status_does_not_fetch_result() {
        let server = MockServer::start().await;
        let result_url = format!("{}/fal-ai/veo3/requests/req-1", server.uri());
        Mock::given(method("GET"))
            .and(path("/fal-ai/veo3/requests/req-1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "IN_PROGRESS",
                "response_url": result_url,
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fal-ai/veo3/requests/req-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(0)
            .mount(&server)
            .await;

        let handle = JobHandle {
            endpoint: "fal-ai/veo3".into(),
            job_id: "req-1".into(),
        };
        let report = provider(&server).status(&handle).await.unwrap();
        assert_eq!(report.status, "IN_PROGRESS");
    }

    #[tokio::test]
    async fn foreign_response_url_is_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fal-ai/veo3/requests/req-1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "COMPLETED",
                "response_url": "https://elsewhere.example/steal",
            })))
            .mount(&server)
            .await;

        let handle = JobHandle {
            endpoint: "fal-ai/veo3".into(),
            job_id: "req-1".into(),
        };
        let report = provider(&server).status(&handle).await.unwrap();
        assert_eq!(
            report.result,
            Some(json!({"response_url": "https://elsewhere.example/steal"}))
        );
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "IN_PROGRESS"}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let provider =
            HttpProvider::with_base_url("k".into(), server.uri(), Duration::from_millis(50)).unwrap();
        let handle = JobHandle {
            endpoint: "m".into(),
            job_id: "1".into(),
        };
        let err = provider.status(&handle).await.unwrap_err();
        assert!(matches!(err, ProviderError::Network(_)));
    }

    #[test]
    fn truncate_long_bodies() {
        let long = "x".repeat(1000);
        assert_eq!(truncate(&long).chars().count(), MAX_ERROR_BODY + 1);
        assert_eq!(truncate("short"), "short");
    }
}
