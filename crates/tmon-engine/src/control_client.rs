use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tmon_core::args::ArgValues;
use tmon_core::config::ControlConfig;
use tmon_core::control::{
    decode_response, encode_frame, ActionCatalog, ConfigView, ControlFailure, Endpoint,
    JobHandle, JobSnapshot, Method, ProtocolError, Request, DEFAULT_MAX_REQUEST_BYTES,
    DEFAULT_MAX_RESPONSE_BYTES,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// One-shot NDJSON client: every call opens a connection, writes one request line and
/// reads one reply line, all under a single deadline.
#[derive(Debug, Clone)]
pub struct ControlClient {
    endpoint: String,
    app_id: String,
    timeout: Duration,
    max_request_bytes: usize,
    max_response_bytes: usize,
}

impl ControlClient {
    pub fn new(endpoint: impl Into<String>, app_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            app_id: app_id.into(),
            timeout,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }

    pub fn from_config(control: &ControlConfig) -> Self {
        Self::new(&control.endpoint, &control.app_id, control.timeout)
    }

    pub fn with_frame_limits(mut self, max_request_bytes: usize, max_response_bytes: usize) -> Self {
        self.max_request_bytes = max_request_bytes;
        self.max_response_bytes = max_response_bytes;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Sends `method` with `params` plus `appId`. Every failure is folded into a
    /// [`ControlFailure`].
    pub async fn request(
        &self,
        method: Method,
        mut params: Map<String, Value>,
    ) -> Result<Value, ControlFailure> {
        params.insert("appId".to_string(), Value::String(self.app_id.clone()));
        let result = self.exchange(method, Value::Object(params)).await;
        if let Err(err) = &result {
            debug!(
                event = "control_request_failed",
                endpoint = %self.endpoint,
                method = %method,
                code = %err.code(),
                error = %err
            );
        }
        result.map_err(ControlFailure::from)
    }

    async fn request_as<T: DeserializeOwned>(
        &self,
        method: Method,
        params: Map<String, Value>,
    ) -> Result<T, ControlFailure> {
        let value = self.request(method, params).await?;
        serde_json::from_value(value)
            .map_err(|err| ProtocolError::Malformed(format!("{method}: {err}")).into())
    }

    pub async fn status_get(&self) -> Result<Value, ControlFailure> {
        let payload = self.request(Method::StatusGet, Map::new()).await?;
        if payload.is_object() {
            Ok(payload)
        } else {
            Err(ProtocolError::Malformed("status.get response is not an object".into()).into())
        }
    }

    pub async fn action_list(&self) -> Result<ActionCatalog, ControlFailure> {
        self.request_as(Method::ActionList, Map::new()).await
    }

    pub async fn action_invoke(
        &self,
        action_name: &str,
        args: &ArgValues,
    ) -> Result<JobHandle, ControlFailure> {
        let mut params = Map::new();
        params.insert("actionName".into(), json!(action_name));
        params.insert("args".into(), json!(args));
        self.request_as(Method::ActionInvoke, params).await
    }

    pub async fn job_get(&self, job_id: &str) -> Result<JobSnapshot, ControlFailure> {
        let mut params = Map::new();
        params.insert("jobId".into(), json!(job_id));
        self.request_as(Method::ActionJobGet, params).await
    }

    pub async fn config_get(&self) -> Result<ConfigView, ControlFailure> {
        let payload = self.request(Method::ConfigGet, Map::new()).await?;
        Ok(ConfigView::from_payload(&payload))
    }

    pub async fn config_set(&self, key: &str, value: Value) -> Result<Value, ControlFailure> {
        let mut params = Map::new();
        params.insert("key".into(), json!(key));
        params.insert("value".into(), value);
        self.request(Method::ConfigSet, params).await
    }

    async fn exchange(&self, method: Method, params: Value) -> Result<Value, ProtocolError> {
        let endpoint: Endpoint = self.endpoint.parse()?;
        let frame = encode_frame(&Request::new(method, params), self.max_request_bytes)?;
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);

        let round_trip = async {
            let stream = TcpStream::connect(endpoint.address())
                .await
                .map_err(|err| ProtocolError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: err.to_string(),
                })?;
            let (reader, mut writer) = stream.into_split();
            writer
                .write_all(&frame)
                .await
                .map_err(|err| ProtocolError::Io(err.to_string()))?;
            writer
                .flush()
                .await
                .map_err(|err| ProtocolError::Io(err.to_string()))?;

            let limit = self.max_response_bytes as u64 + 1;
            let mut reader = BufReader::new(reader.take(limit));
            let mut line = Vec::new();
            reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|err| ProtocolError::Io(err.to_string()))?;
            Ok::<Vec<u8>, ProtocolError>(line)
        };

        let line = tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| ProtocolError::Timeout {
                method: method.to_string(),
                timeout_ms,
            })??;
        decode_response(&line, self.max_response_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn serve_once(reply: &'static [u8]) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut line = Vec::new();
            reader.read_until(b'\n', &mut line).await.expect("read");
            writer.write_all(reply).await.expect("write");
            writer.flush().await.expect("flush");
            line
        });
        (addr.to_string(), handle)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sends_one_line_with_app_id() {
        let (endpoint, server) = serve_once(b"{\"ok\":true,\"response\":{\"pid\":7}}\n").await;
        let client = ControlClient::new(endpoint, "demo", Duration::from_secs(2));
        let payload = client.status_get().await.expect("status");
        assert_eq!(payload, json!({"pid": 7}));

        let sent = server.await.expect("join");
        let request: Value = serde_json::from_slice(&sent).expect("request json");
        assert_eq!(request, json!({"method": "status.get", "params": {"appId": "demo"}}));
        assert_eq!(sent.last(), Some(&b'\n'));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_error_keeps_its_code() {
        let (endpoint, _server) =
            serve_once(b"{\"ok\":false,\"error\":{\"code\":\"unknown_app\",\"message\":\"no such app\"}}\n")
                .await;
        let client = ControlClient::new(endpoint, "demo", Duration::from_secs(2));
        let failure = client.action_list().await.expect_err("remote error");
        assert_eq!(failure.code, "unknown_app");
        assert_eq!(failure.message, "no such app");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_and_malformed_replies_fail() {
        let (endpoint, _server) = serve_once(b"\n").await;
        let client = ControlClient::new(endpoint, "demo", Duration::from_secs(2));
        assert_eq!(client.status_get().await.expect_err("empty").code, "empty_response");

        let (endpoint, _server) = serve_once(b"not json\n").await;
        let client = ControlClient::new(endpoint, "demo", Duration::from_secs(2));
        assert_eq!(
            client.status_get().await.expect_err("malformed").code,
            "malformed_response"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_endpoint_is_connect_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = listener.local_addr().expect("addr").to_string();
        drop(listener);
        let client = ControlClient::new(endpoint, "demo", Duration::from_secs(2));
        assert_eq!(client.status_get().await.expect_err("refused").code, "connect_failed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = listener.local_addr().expect("addr").to_string();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });
        let client = ControlClient::new(endpoint, "demo", Duration::from_millis(200));
        assert_eq!(client.status_get().await.expect_err("timeout").code, "timeout");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_reply_is_rejected() {
        let (endpoint, _server) = serve_once(b"{\"ok\":true,\"response\":{\"blob\":\"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx\"}}\n").await;
        let client = ControlClient::new(endpoint, "demo", Duration::from_secs(2))
            .with_frame_limits(DEFAULT_MAX_REQUEST_BYTES, 32);
        assert_eq!(client.status_get().await.expect_err("too big").code, "frame_too_large");
    }

    #[tokio::test]
    async fn invalid_endpoint_fails_before_connecting() {
        let client = ControlClient::new("localhost:99999", "demo", Duration::from_secs(1));
        assert_eq!(client.status_get().await.expect_err("bad").code, "invalid_endpoint");
    }
}
