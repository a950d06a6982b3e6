use crate::{
    config::TuyaConfig,
    error::{AuthError, CallError, DataError},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const SIGN_METHOD: &str = "HMAC-SHA256";
const TOKEN_PATH: &str = "/v1.0/token?grant_type=1";

#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
    // Stored as issued; no refresh flow uses it.
    #[allow(dead_code)]
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub path: String,
    pub body: String,
}

impl RawResponse {
    pub fn parse(&self) -> Result<ApiResponse, DataError> {
        serde_json::from_str(&self.body).map_err(|source| DataError::InvalidJson {
            path: self.path.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub t: Option<i64>,
}

impl ApiResponse {
    pub fn reports_failure(&self) -> bool {
        self.success == Some(false)
    }

    pub fn failure_message(&self) -> String {
        self.msg
            .clone()
            .unwrap_or_else(|| "unknown provider error".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResult {
    access_token: String,
    refresh_token: String,
    expire_time: i64,
}

/// Signed HTTP client for the Tuya OpenAPI. Owns its [`Session`]; build one per
/// unit of work with [`TuyaClient::connect`].
pub struct TuyaClient {
    http: Client,
    base_url: String,
    client_id: String,
    secret: String,
    session: Option<Session>,
}

impl TuyaClient {
    pub fn new(config: &TuyaConfig) -> Result<Self, AuthError> {
        let http = Client::builder()
            .user_agent("meter-poller/0.1")
            .timeout(config.request_timeout())
            .build()
            .map_err(AuthError::ClientSetup)?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.access_key.clone(),
            secret: config.secret_key.clone(),
            session: None,
        })
    }

    pub async fn connect(config: &TuyaConfig) -> Result<Self, AuthError> {
        let mut client = Self::new(config)?;
        client.authenticate().await?;
        Ok(client)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub async fn authenticate(&mut self) -> Result<&Session, AuthError> {
        let raw = self.call(Method::GET, TOKEN_PATH, None).await?;
        let response = raw
            .parse()
            .map_err(|err| AuthError::Malformed(err.to_string()))?;

        if response.success != Some(true) {
            return Err(AuthError::Rejected(response.failure_message()));
        }

        let token: TokenResult = serde_json::from_value(response.result)
            .map_err(|err| AuthError::Malformed(err.to_string()))?;

        let expires_at = Utc::now() + ChronoDuration::seconds(token.expire_time);
        tracing::debug!(expires_at = %expires_at, "obtained provider access token");

        Ok(self.session.insert(Session {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at,
        }))
    }

    pub async fn get(&self, path: &str) -> Result<RawResponse, CallError> {
        self.call(Method::GET, path, None).await
    }

    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<RawResponse, CallError> {
        let timestamp_ms = Utc::now().timestamp_millis();
        if let Some(session) = &self.session {
            if session.is_expired(Utc::now()) {
                tracing::warn!(expires_at = %session.expires_at, path, "using an expired access token");
            }
        }

        let request = self.build_request(method.clone(), path, body, timestamp_ms);
        tracing::debug!(method = %method, path, "calling provider");

        let response = request.send().await.map_err(|source| CallError::Transport {
            path: path.to_string(),
            source,
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|source| CallError::Transport {
            path: path.to_string(),
            source,
        })?;

        if status != StatusCode::OK {
            return Err(CallError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(RawResponse {
            path: path.to_string(),
            body: text,
        })
    }

    fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
        timestamp_ms: i64,
    ) -> RequestBuilder {
        let token = self
            .session
            .as_ref()
            .map(|session| session.access_token.as_str())
            .unwrap_or("");
        let payload = body.unwrap_or_default();
        let to_sign = string_to_sign(&method, payload, path);
        let signature = sign(&self.secret, &self.client_id, token, timestamp_ms, &to_sign);

        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("sign_method", SIGN_METHOD)
            .header("client_id", &self.client_id)
            .header("t", timestamp_ms.to_string())
            .header("mode", "cors")
            .header("Content-Type", "application/json")
            .header("sign", signature)
            .header("access_token", token);

        if let Some(body) = body {
            builder = builder.body(body.to_vec());
        }
        builder
    }
}

pub fn string_to_sign(method: &Method, body: &[u8], path: &str) -> String {
    let body_hash = format!("{:x}", Sha256::digest(body));
    [method.as_str().to_ascii_uppercase(), body_hash, String::new(), path.to_string()].join("\n")
}

/// Upper-case hex HMAC-SHA256 of `client_id + token + t + string_to_sign`, keyed by the secret.
pub fn sign(
    secret: &str,
    client_id: &str,
    token: &str,
    timestamp_ms: i64,
    string_to_sign: &str,
) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(client_id.as_bytes());
    mac.update(token.as_bytes());
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(string_to_sign.as_bytes());
    format!("{:X}", mac.finalize().into_bytes())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mockito::{Matcher, Mock, ServerGuard};
    use serde_json::json;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    pub(crate) fn test_config(base_url: &str) -> TuyaConfig {
        TuyaConfig {
            access_key: "test-client".to_string(),
            secret_key: "test-secret".to_string(),
            base_url: base_url.to_string(),
            device_id: "meter-1".to_string(),
            request_timeout_secs: 5,
        }
    }

    pub(crate) async fn mock_token(server: &mut ServerGuard) -> Mock {
        server
            .mock("GET", Matcher::Regex(r"^/v1\.0/token".to_string()))
            .match_header("client_id", "test-client")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "success": true,
                    "result": {
                        "access_token": "tok-123",
                        "refresh_token": "ref-456",
                        "expire_time": 7200,
                        "uid": "u1"
                    },
                    "t": 1704067200000i64
                })
                .to_string(),
            )
            .create_async()
            .await
    }

    #[test]
    fn string_to_sign_hashes_empty_body_for_get() {
        let value = string_to_sign(&Method::GET, b"", "/v1.0/token?grant_type=1");
        assert_eq!(
            value,
            format!("GET\n{EMPTY_SHA256}\n\n/v1.0/token?grant_type=1")
        );
    }

    #[test]
    fn signature_is_deterministic_uppercase_hex() {
        let to_sign = string_to_sign(&Method::GET, b"", "/v2.0/cloud/thing/abc/shadow/properties");
        let first = sign("secret", "client", "token", 1_704_067_200_000, &to_sign);
        let second = sign("secret", "client", "token", 1_704_067_200_000, &to_sign);

        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn signature_covers_parts_in_order() {
        let signature = sign("secret", "client", "token", 1000, "GET\nabc\n\n/path");
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(b"clienttoken1000GET\nabc\n\n/path");
        assert_eq!(signature, format!("{:X}", mac.finalize().into_bytes()));
    }

    #[test]
    fn changing_any_input_changes_signature() {
        let base = |method: &Method, body: &[u8], path: &str, token: &str, ts: i64, secret: &str| {
            sign(secret, "client", token, ts, &string_to_sign(method, body, path))
        };
        let reference = base(&Method::POST, b"{}", "/a", "tok", 1000, "secret");

        assert_ne!(reference, base(&Method::GET, b"{}", "/a", "tok", 1000, "secret"));
        assert_ne!(reference, base(&Method::POST, b"{ }", "/a", "tok", 1000, "secret"));
        assert_ne!(reference, base(&Method::POST, b"{}", "/b", "tok", 1000, "secret"));
        assert_ne!(reference, base(&Method::POST, b"{}", "/a", "tok2", 1000, "secret"));
        assert_ne!(reference, base(&Method::POST, b"{}", "/a", "tok", 1001, "secret"));
        assert_ne!(reference, base(&Method::POST, b"{}", "/a", "tok", 1000, "secret2"));
    }

    #[test]
    fn failure_flag_must_be_explicit() {
        let missing: ApiResponse = serde_json::from_str(r#"{"result": []}"#).unwrap();
        assert!(!missing.reports_failure());

        let failed: ApiResponse =
            serde_json::from_str(r#"{"success": false, "msg": "uri path invalid"}"#).unwrap();
        assert!(failed.reports_failure());
        assert_eq!(failed.failure_message(), "uri path invalid");
    }

    #[tokio::test]
    async fn authenticate_stores_session_and_signs_later_calls() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = mock_token(&mut server).await;
        let props_mock = server
            .mock("GET", "/v2.0/cloud/thing/meter-1/shadow/properties")
            .match_header("access_token", "tok-123")
            .match_header("sign_method", "HMAC-SHA256")
            .match_header("sign", Matcher::Regex("^[0-9A-F]{64}$".to_string()))
            .match_header("t", Matcher::Regex("^[0-9]{13}$".to_string()))
            .with_status(200)
            .with_body(json!({"success": true, "result": {"properties": []}}).to_string())
            .create_async()
            .await;

        let client = TuyaClient::connect(&test_config(&server.url())).await.unwrap();
        let session = client.session().unwrap();
        assert_eq!(session.access_token, "tok-123");
        assert_eq!(session.refresh_token, "ref-456");
        assert!(!session.is_expired(Utc::now()));

        let raw = client
            .get("/v2.0/cloud/thing/meter-1/shadow/properties")
            .await
            .unwrap();
        assert!(raw.parse().unwrap().success.unwrap());

        token_mock.assert_async().await;
        props_mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_credentials_are_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Regex(r"^/v1\.0/token".to_string()))
            .with_status(200)
            .with_body(json!({"success": false, "code": 1004, "msg": "sign invalid"}).to_string())
            .create_async()
            .await;

        let err = TuyaClient::connect(&test_config(&server.url()))
            .await
            .err()
            .unwrap();
        match err {
            AuthError::Rejected(msg) => assert_eq!(msg, "sign invalid"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn malformed_token_payload_is_an_auth_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Regex(r"^/v1\.0/token".to_string()))
            .with_status(200)
            .with_body(json!({"success": true, "result": {"uid": "u1"}}).to_string())
            .create_async()
            .await;

        let err = TuyaClient::connect(&test_config(&server.url()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AuthError::Malformed(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = TuyaClient::new(&test_config(&format!("http://{addr}"))).unwrap();
        let err = client
            .get("/v2.0/cloud/thing/meter-1/shadow/properties")
            .await
            .unwrap_err();
        match err {
            CallError::Transport { path, .. } => {
                assert_eq!(path, "/v2.0/cloud/thing/meter-1/shadow/properties");
            }
            other => panic!("unexpected error: {other}"),
        }

        let auth = TuyaClient::connect(&test_config(&format!("http://{addr}")))
            .await
            .err()
            .unwrap();
        assert!(matches!(auth, AuthError::Transport(CallError::Transport { .. })));
    }

    #[tokio::test]
    async fn non_200_status_is_a_call_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v2.0/cloud/thing/batch")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let client = TuyaClient::new(&test_config(&server.url())).unwrap();
        let err = client
            .get("/v2.0/cloud/thing/batch?device_ids=meter-1")
            .await
            .unwrap_err();
        match err {
            CallError::Status { status, body, .. } => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
