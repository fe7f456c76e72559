use std::error::Error as StdError;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{Method, Url};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::models::{Report, ReportRequest, ReportStatus};

pub const BASE_API_URL: &str = "https://api.percipio.com";

const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Fixed polling budget. Bounds the worst-case latency of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_attempts: 30,
        }
    }
}

/// Generate-then-poll access to the learning activity report.
#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Asks upstream to start building a report covering `[now - lookback, now]`.
    async fn request_generation(
        &self,
        lookback: chrono::Duration,
    ) -> Result<ReportStatus, SyncError>;

    /// Polls the job until it yields rows, fails, or the attempt budget runs out.
    async fn await_completion(&self, job: &ReportStatus) -> Result<Report, SyncError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
    pub remaining: Option<u64>,
    pub reset_at: Option<i64>,
}

impl RateLimit {
    fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            remaining: header_value(headers, RATE_LIMIT_REMAINING_HEADER),
            reset_at: header_value(headers, RATE_LIMIT_RESET_HEADER),
        }
    }
}

fn header_value<T: FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// What a single poll of the report endpoint told us.
#[derive(Debug)]
enum PollOutcome {
    Pending(ReportStatus),
    Failed(ReportStatus),
    Ready(Report),
    Transient(String),
}

/// The endpoint answers with either a status object or the row array.
/// Objects are statuses, arrays are rows; anything else is transient.
///
/// Dispatching on the JSON shape keeps `[]` from decoding as a status with
/// every field defaulted.
fn classify_body(body: &[u8]) -> PollOutcome {
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => return PollOutcome::Transient(format!("body is not valid JSON: {e}")),
    };

    match value {
        Value::Object(_) => match serde_json::from_value::<ReportStatus>(value) {
            Ok(status) if status.is_failed() => PollOutcome::Failed(status),
            Ok(status) => PollOutcome::Pending(status),
            Err(e) => PollOutcome::Transient(format!("body is not a report status: {e}")),
        },
        Value::Array(_) => match serde_json::from_value::<Report>(value) {
            Ok(rows) => PollOutcome::Ready(rows),
            Err(e) => PollOutcome::Transient(format!("body is not report rows: {e}")),
        },
        other => PollOutcome::Transient(format!("unexpected JSON body: {other}")),
    }
}

/// Percipio closes connections early on some successful responses.
fn is_premature_eof(err: &(dyn StdError + 'static)) -> bool {
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        if io.kind() == std::io::ErrorKind::UnexpectedEof {
            return true;
        }
        // io::Error::source skips the wrapped error itself.
        if let Some(inner) = io.get_ref() {
            if is_premature_eof(inner) {
                return true;
            }
        }
    }

    let message = err.to_string().to_ascii_lowercase();
    if message.contains("unexpected eof")
        || message.contains("connection closed before message completed")
    {
        return true;
    }

    match err.source() {
        Some(source) => is_premature_eof(source),
        None => false,
    }
}

pub struct PercipioClient {
    http: reqwest::Client,
    base_url: Url,
    organization_id: String,
    token: String,
    poll: PollSettings,
}

impl PercipioClient {
    pub fn new(
        base_url: &str,
        organization_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, SyncError> {
        let parsed = Url::parse(base_url).map_err(|e| {
            SyncError::Configuration(format!("invalid base url {base_url:?}: {e}"))
        })?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: parsed,
            organization_id: organization_id.into(),
            token: token.into(),
            poll: PollSettings::default(),
        })
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/reporting/v1/organizations/{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            self.organization_id,
            path
        )
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        payload: Option<&ReportRequest>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let started = Instant::now();
        debug!(
            method = %method,
            endpoint = url,
            has_payload = payload.is_some(),
            "making API request"
        );

        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/json");
        if let Some(body) = payload {
            request = request.json(body);
        }

        match request.send().await {
            Ok(response) => {
                let rate_limit = RateLimit::from_headers(response.headers());
                debug!(
                    method = %method,
                    endpoint = url,
                    status_code = response.status().as_u16(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    rate_limit_remaining = ?rate_limit.remaining,
                    rate_limit_reset_at = ?rate_limit.reset_at,
                    "API request completed"
                );
                Ok(response)
            }
            Err(e) => {
                error!(
                    method = %method,
                    endpoint = url,
                    error = %e,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "API request failed"
                );
                Err(e)
            }
        }
    }

    async fn poll_once(&self, job: &ReportStatus) -> Result<PollOutcome, SyncError> {
        let url = self.endpoint(&format!("report-requests/{}", job.id));

        let response = match self.send(Method::GET, &url, None).await {
            Ok(response) => response,
            Err(e) if is_premature_eof(&e) => {
                return Ok(PollOutcome::Transient(format!("connection closed early: {e}")))
            }
            Err(e) => return Err(SyncError::Transport(format!("GET {url}: {e}"))),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::Transport(format!(
                "GET {url} returned {status}: {text}"
            )));
        }

        match response.bytes().await {
            Ok(body) => Ok(classify_body(&body)),
            Err(e) if is_premature_eof(&e) => Ok(PollOutcome::Transient(format!(
                "connection closed while reading body: {e}"
            ))),
            Err(e) => Err(SyncError::Transport(format!(
                "error reading response body from {url}: {e}"
            ))),
        }
    }
}

#[async_trait]
impl ReportSource for PercipioClient {
    async fn request_generation(
        &self,
        lookback: chrono::Duration,
    ) -> Result<ReportStatus, SyncError> {
        let url = self.endpoint("report-requests/learning-activity");
        let body = ReportRequest::for_window(Utc::now(), lookback);

        let response = self
            .send(Method::POST, &url, Some(&body))
            .await
            .map_err(|e| SyncError::Generation(format!("POST {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::Generation(format!(
                "POST {url} returned {status}: {text}"
            )));
        }

        let job: ReportStatus = response
            .json()
            .await
            .map_err(|e| SyncError::Generation(format!("invalid report status body: {e}")))?;
        if job.id.is_empty() {
            return Err(SyncError::Generation(format!(
                "POST {url} returned a report status without an id (status {:?})",
                job.status
            )));
        }

        info!(
            report_id = %job.id,
            status = %job.status,
            start = %body.start,
            end = %body.end,
            "learning activity report requested"
        );
        Ok(job)
    }

    async fn await_completion(&self, job: &ReportStatus) -> Result<Report, SyncError> {
        let max_attempts = self.poll.max_attempts;

        for attempt in 1..=max_attempts {
            match self.poll_once(job).await? {
                PollOutcome::Ready(rows) => {
                    info!(
                        report_id = %job.id,
                        attempt = attempt,
                        report_entries = rows.len(),
                        "report ready"
                    );
                    return Ok(rows);
                }
                PollOutcome::Failed(status) => {
                    let detail = status
                        .error
                        .clone()
                        .unwrap_or_else(|| "no error detail".to_string());
                    error!(report_id = %job.id, error = %detail, "report generation failed upstream");
                    return Err(SyncError::ReportGenerationFailed {
                        id: job.id.clone(),
                        detail,
                    });
                }
                PollOutcome::Pending(status) => {
                    debug!(
                        report_id = %job.id,
                        status = %status.status,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        retry_after_ms = self.poll.interval.as_millis() as u64,
                        "report still processing"
                    );
                }
                PollOutcome::Transient(reason) => {
                    warn!(
                        report_id = %job.id,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        reason = %reason,
                        "transient poll response, retrying"
                    );
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.poll.interval).await;
            }
        }

        Err(SyncError::PollingTimeout {
            id: job.id.clone(),
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GENERATE_PATH: &str =
        "/reporting/v1/organizations/test-org/report-requests/learning-activity";
    const REPORT_PATH: &str = "/reporting/v1/organizations/test-org/report-requests/report-123";

    fn fast_poll(max_attempts: u32) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(5),
            max_attempts,
        }
    }

    fn test_client(server: &MockServer, max_attempts: u32) -> PercipioClient {
        PercipioClient::new(&server.uri(), "test-org", "test-token")
            .unwrap()
            .with_poll_settings(fast_poll(max_attempts))
    }

    fn pending_job() -> ReportStatus {
        ReportStatus {
            id: "report-123".to_string(),
            status: "PENDING".to_string(),
            error: None,
        }
    }

    fn report_rows() -> serde_json::Value {
        json!([
            {
                "userId": "user1",
                "firstName": "John",
                "lastName": "Doe",
                "emailAddress": "john@example.com",
                "contentId": "course1",
                "contentTitle": "Test Course",
                "status": "Completed"
            }
        ])
    }

    #[test]
    fn rejects_invalid_base_url() {
        let result = PercipioClient::new("://invalid-url", "test-org", "test-token");
        assert!(matches!(result, Err(SyncError::Configuration(_))));
    }

    #[test]
    fn default_poll_settings_are_fixed() {
        let settings = PollSettings::default();
        assert_eq!(settings.interval, Duration::from_secs(10));
        assert_eq!(settings.max_attempts, 30);
    }

    #[test]
    fn status_body_is_pending_or_failed() {
        match classify_body(br#"{"id":"report-123","status":"IN_PROGRESS"}"#) {
            PollOutcome::Pending(status) => assert_eq!(status.status, "IN_PROGRESS"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        match classify_body(br#"{"id":"report-123","status":"FAILED","error":"boom"}"#) {
            PollOutcome::Failed(status) => assert_eq!(status.error.as_deref(), Some("boom")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn array_body_is_ready() {
        match classify_body(br#"[{"userId":"u1","contentId":"c1","status":"Read"}]"#) {
            PollOutcome::Ready(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].status, "Read");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(classify_body(b"[]"), PollOutcome::Ready(rows) if rows.is_empty()));
    }

    #[test]
    fn garbage_body_is_transient() {
        assert!(matches!(
            classify_body(b"{\"id\": \"report-1"),
            PollOutcome::Transient(_)
        ));
        assert!(matches!(
            classify_body(b"<html>bad gateway</html>"),
            PollOutcome::Transient(_)
        ));
        assert!(matches!(
            classify_body(br#""try later""#),
            PollOutcome::Transient(_)
        ));
        assert!(matches!(
            classify_body(br#"[{"userId": 42}]"#),
            PollOutcome::Transient(_)
        ));
    }

    #[test]
    fn status_object_with_missing_fields_is_still_a_status() {
        match classify_body(br#"{"status":"FAILED","error":"x"}"#) {
            PollOutcome::Failed(status) => {
                assert_eq!(status.id, "");
                assert_eq!(status.error.as_deref(), Some("x"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(
            classify_body(br#"{"message":"try later"}"#),
            PollOutcome::Pending(status) if status.status.is_empty()
        ));
    }

    #[test]
    fn detects_unexpected_eof_in_error_chain() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "early close");
        assert!(is_premature_eof(&eof));

        let wrapped = std::io::Error::new(std::io::ErrorKind::Other, eof);
        assert!(is_premature_eof(&wrapped));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(!is_premature_eof(&refused));
    }

    #[test]
    fn parses_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(RATE_LIMIT_REMAINING_HEADER, "42".parse().unwrap());
        headers.insert(RATE_LIMIT_RESET_HEADER, "1700000000".parse().unwrap());
        let rate_limit = RateLimit::from_headers(&headers);
        assert_eq!(rate_limit.remaining, Some(42));
        assert_eq!(rate_limit.reset_at, Some(1_700_000_000));
        assert_eq!(RateLimit::from_headers(&HeaderMap::new()), RateLimit::default());
    }

    #[tokio::test]
    async fn request_generation_posts_window_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(header("authorization", "Bearer test-token"))
            .and(body_partial_json(json!({"contentType": "Course,Assessment"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "report-123", "status": "PENDING"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, 3);
        let job = client
            .request_generation(chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(job, pending_job());
    }

    #[tokio::test]
    async fn request_generation_fails_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(ResponseTemplate::new(401).set_body_string(r#"{"error":"unauthorized"}"#))
            .mount(&server)
            .await;

        let client = test_client(&server, 3);
        let err = client
            .request_generation(chrono::Duration::days(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Generation(ref msg) if msg.contains("401")));
    }

    #[tokio::test]
    async fn returns_rows_when_ready_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(REPORT_PATH))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(report_rows()))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, 3);
        let rows = client.await_completion(&pending_job()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].email_address, "john@example.com");
    }

    #[tokio::test]
    async fn keeps_polling_through_pending_and_garbage() {
        let server = MockServer::start().await;
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = call_count.clone();

        Mock::given(method("GET"))
            .and(path(REPORT_PATH))
            .respond_with(move |_: &wiremock::Request| {
                let count = call_count_clone.fetch_add(1, Ordering::SeqCst) + 1;
                match count {
                    1 => ResponseTemplate::new(200)
                        .set_body_json(json!({"id": "report-123", "status": "PENDING"})),
                    2 => ResponseTemplate::new(200).set_body_string("{\"id\": \"rep"),
                    _ => ResponseTemplate::new(200).set_body_json(report_rows()),
                }
            })
            .mount(&server)
            .await;

        let client = test_client(&server, 5);
        let rows = client.await_completion(&pending_job()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_status_aborts_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(REPORT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "report-123",
                "status": "FAILED",
                "error": "report too large"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, 5);
        let err = client.await_completion(&pending_job()).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::ReportGenerationFailed {
                id: "report-123".to_string(),
                detail: "report too large".to_string(),
            }
        );
        assert!(err.to_string().contains("report generation failed"));
    }

    #[tokio::test]
    async fn exhausting_attempts_is_polling_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(REPORT_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "report-123", "status": "PENDING"})),
            )
            .expect(3)
            .mount(&server)
            .await;

        let client = test_client(&server, 3);
        let err = client.await_completion(&pending_job()).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::PollingTimeout {
                id: "report-123".to_string(),
                attempts: 3,
            }
        );
    }

    #[tokio::test]
    async fn server_error_while_polling_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(REPORT_PATH))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, 5);
        let err = client.await_completion(&pending_job()).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(ref msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn failed_status_without_id_aborts_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(REPORT_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "FAILED", "error": "x"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, 5);
        let err = client.await_completion(&pending_job()).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::ReportGenerationFailed {
                id: "report-123".to_string(),
                detail: "x".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn request_generation_rejects_status_without_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "PENDING"})))
            .mount(&server)
            .await;

        let client = test_client(&server, 3);
        let err = client
            .request_generation(chrono::Duration::days(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Generation(ref msg) if msg.contains("without an id")));
    }

    /// Serves one canned HTTP response per connection, then closes it.
    /// Returns the base url and a handle yielding the number served.
    fn serve_raw(responses: Vec<Vec<u8>>) -> (String, std::thread::JoinHandle<usize>) {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let handle = std::thread::spawn(move || {
            let mut served = 0;
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = stream.read(&mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                stream.write_all(&response).unwrap();
                stream.flush().unwrap();
                let _ = stream.shutdown(std::net::Shutdown::Both);
                served += 1;
            }
            served
        });

        (base_url, handle)
    }

    #[tokio::test]
    async fn truncated_bodies_keep_polling() {
        let truncated_length = b"HTTP/1.1 200 OK\r\n\
            Content-Type: application/json\r\n\
            Content-Length: 500\r\n\
            Connection: close\r\n\r\n\
            [{\"userId\":\"u1\""
            .to_vec();
        let truncated_chunked = b"HTTP/1.1 200 OK\r\n\
            Content-Type: application/json\r\n\
            Transfer-Encoding: chunked\r\n\
            Connection: close\r\n\r\n\
            a\r\n[{\"userId\"\r\n\
            40\r\n:\"u1\""
            .to_vec();
        let body = r#"[{"userId":"u1","contentId":"c1","status":"Read"}]"#;
        let complete = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes();

        let (base_url, server) = serve_raw(vec![truncated_length, truncated_chunked, complete]);
        let client = PercipioClient::new(&base_url, "test-org", "test-token")
            .unwrap()
            .with_poll_settings(fast_poll(5));

        let rows = client.await_completion(&pending_job()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, "u1");
        assert_eq!(rows[0].status, "Read");
        assert_eq!(server.join().unwrap(), 3);
    }

    #[tokio::test]
    async fn connection_refused_is_fatal() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let client = PercipioClient::new(&base_url, "test-org", "test-token")
            .unwrap()
            .with_poll_settings(fast_poll(5));
        let err = client.await_completion(&pending_job()).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(ref msg) if msg.starts_with("GET ")));
    }
}
