// Bitrix24 REST client
// Issues single calls through the rate limiter and the injected transport:
// - Version strategy (v2 `.json` endpoints, v3 `/rest/api/`)
// - Paging sentinel handling
// - API errors returned inside the envelope, transport errors as `Err`

use crate::config::ClientConfig;
use crate::limiter::RateLimiter;
use async_trait::async_trait;
use b24_core::{
    ApiError, ApiErrorKind, ApiVersion, B24Error, CallMethod, CallOrigin, Command, Paging,
    ResultEnvelope, TransportError,
};
use b24_transport::{HttpRequest, HttpResponse, HttpTransport, HttpTransportConfig, ReqwestTransport};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Per-call options for [`B24Client::call_with`]
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub paging: Paging,
    /// Overrides the configured default version
    pub version: Option<ApiVersion>,
    /// Bounds the wait for a rate permit and the HTTP exchange together
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn paging(paging: Paging) -> Self {
        Self {
            paging,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Main client for one portal.
///
/// All state is per instance; clones of the inner `Arc`s are shared only by
/// calls issued through this client.
pub struct B24Client {
    config: ClientConfig,
    http: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
}

impl std::fmt::Debug for B24Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("B24Client")
            .field("config", &self.config)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl B24Client {
    /// Create a client backed by reqwest
    pub fn new(config: ClientConfig) -> Result<Self, B24Error> {
        let http = ReqwestTransport::new(HttpTransportConfig {
            timeout_ms: config.request_timeout_ms,
            user_agent: config.user_agent.clone(),
            ..Default::default()
        })?;
        Self::with_transport(config, Arc::new(http))
    }

    /// Create a client over any transport
    pub fn with_transport(
        config: ClientConfig,
        http: Arc<dyn HttpTransport>,
    ) -> Result<Self, B24Error> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(config.policy.clone())?);
        Ok(Self {
            config,
            http,
            limiter,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Call `method` with the configured default version
    pub async fn call_method(
        &self,
        method: &str,
        params: Value,
        paging: Paging,
    ) -> Result<ResultEnvelope, B24Error> {
        self.call_with(method, params, CallOptions::paging(paging))
            .await
    }

    pub async fn call_v2(
        &self,
        method: &str,
        params: Value,
        paging: Paging,
    ) -> Result<ResultEnvelope, B24Error> {
        self.call_versioned(method, params, ApiVersion::V2, paging)
            .await
    }

    pub async fn call_v3(
        &self,
        method: &str,
        params: Value,
        paging: Paging,
    ) -> Result<ResultEnvelope, B24Error> {
        self.call_versioned(method, params, ApiVersion::V3, paging)
            .await
    }

    /// Call with an explicit deadline, cancellation token or version
    pub async fn call_with(
        &self,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<ResultEnvelope, B24Error> {
        let params = match params {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let command = Command::new(method, params);
        command.validate()?;

        let version = options.version.unwrap_or(self.config.version);
        let body = self.request_body(&command.params, options.paging);
        let url = version.endpoint(self.config.credentials.base_url(), &command.method);

        let response = self
            .send(HttpRequest::post_json(url, &body)?, &options)
            .await?;
        let envelope = self.envelope_from(response)?;

        Ok(envelope.with_origin(CallOrigin {
            method: command.method,
            params: command.params,
            version,
        }))
    }

    /// Parameters as sent: paging sentinel and application auth added
    fn request_body(&self, params: &Value, paging: Paging) -> Value {
        let mut body = params.clone();
        if let Value::Object(map) = &mut body {
            if let Some(start) = paging.start_value() {
                map.insert("start".to_string(), start);
            }
            if let Some(token) = self.config.credentials.access_token() {
                map.insert("auth".to_string(), Value::from(token));
            }
        }
        body
    }

    /// Rate-limited send shared by single calls and batch chunks
    pub(crate) async fn send(
        &self,
        request: HttpRequest,
        options: &CallOptions,
    ) -> Result<HttpResponse, B24Error> {
        let started = Instant::now();
        let _permit = self
            .limiter
            .acquire(options.timeout, options.cancel.as_ref())
            .await?;

        let remaining = match options.timeout {
            Some(timeout) => {
                let remaining = timeout.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return Err(B24Error::RateLimitTimeout {
                        waited: started.elapsed(),
                    });
                }
                Some(remaining)
            }
            None => None,
        };
        let request = match remaining {
            Some(remaining) => request.with_timeout(remaining),
            None => request,
        };
        debug!(url = %redact(&request.url), "Sending REST request");
        if let Some(body) = &request.body {
            trace!(body = %String::from_utf8_lossy(body), "Request body");
        }

        let exchange = async {
            match remaining {
                // also bounds transports that ignore `HttpRequest::timeout`
                Some(remaining) => tokio::time::timeout(remaining, self.http.send(request))
                    .await
                    .unwrap_or(Err(TransportError::Timeout)),
                None => self.http.send(request).await,
            }
        };
        let response = match &options.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(B24Error::Cancelled),
                response = exchange => response?,
            },
            None => exchange.await?,
        };

        trace!(status = response.status, body = %String::from_utf8_lossy(&response.body), "Response");
        Ok(response)
    }

    /// Decode a response body into an envelope, penalizing the limiter when
    /// the portal reports overload
    pub(crate) fn envelope_from(&self, response: HttpResponse) -> Result<ResultEnvelope, B24Error> {
        let payload = decode_payload(&response)?;
        let envelope = ResultEnvelope::from_payload(response.status, payload);

        self.observe_errors(response.status, envelope.errors());
        if !envelope.is_success() {
            debug!(status = response.status, errors = ?envelope.error_messages(), "API error");
        }
        Ok(envelope)
    }

    /// Cool the limiter down when the portal reports overload
    pub(crate) fn observe_errors<'a>(
        &self,
        status: u16,
        errors: impl IntoIterator<Item = &'a ApiError>,
    ) {
        let overloaded = status == 503
            || errors
                .into_iter()
                .any(|e| e.kind == ApiErrorKind::QueryLimitExceeded);
        if overloaded {
            self.limiter.penalize();
        }
    }
}

/// Parse a body that must be a JSON response envelope
pub(crate) fn decode_payload(response: &HttpResponse) -> Result<Value, B24Error> {
    let payload: Value = serde_json::from_slice(&response.body).map_err(|e| {
        TransportError::InvalidResponse {
            status: response.status,
            reason: format!("body is not JSON: {}", e),
        }
    })?;

    let is_envelope = payload
        .as_object()
        .is_some_and(|obj| obj.contains_key("result") || obj.contains_key("error"));
    if !is_envelope {
        return Err(TransportError::InvalidResponse {
            status: response.status,
            reason: "body has neither 'result' nor 'error'".to_string(),
        }
        .into());
    }
    Ok(payload)
}

/// Strip the webhook secret from a URL before logging it
fn redact(url: &str) -> String {
    match url.find("/rest/") {
        Some(pos) => {
            let tail = &url[pos + "/rest/".len()..];
            let method = tail.rsplit('/').next().unwrap_or_default();
            format!("{}/rest/.../{}", &url[..pos], method)
        }
        None => url.to_string(),
    }
}

#[async_trait]
impl CallMethod for B24Client {
    async fn call_versioned(
        &self,
        method: &str,
        params: Value,
        version: ApiVersion,
        paging: Paging,
    ) -> Result<ResultEnvelope, B24Error> {
        let options = CallOptions {
            paging,
            version: Some(version),
            ..Default::default()
        };
        self.call_with(method, params, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, Credentials};
    use b24_transport::HttpMethod;
    use serde_json::json;
    use std::sync::Mutex;

    struct FixedHttp {
        status: u16,
        body: &'static str,
        seen: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl HttpTransport for FixedHttp {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            Ok(HttpResponse::new(self.status, self.body))
        }
    }

    fn client(config: ClientConfig, status: u16, body: &'static str) -> (B24Client, Arc<FixedHttp>) {
        let http = Arc::new(FixedHttp {
            status,
            body,
            seen: Mutex::new(Vec::new()),
        });
        (B24Client::with_transport(config, http.clone()).unwrap(), http)
    }

    fn webhook() -> ClientConfig {
        ClientConfig::webhook("https://portal.bitrix24.com/rest/1/secret/").unwrap()
    }

    #[tokio::test]
    async fn test_v2_request_shape() {
        let (client, http) = client(webhook(), 200, r#"{"result":[]}"#);
        client
            .call_method("crm.deal.list", json!({"select": ["ID"]}), Paging::WithoutCount)
            .await
            .unwrap();

        let seen = http.seen.lock().unwrap();
        assert_eq!(seen[0].method, HttpMethod::Post);
        assert_eq!(
            seen[0].url,
            "https://portal.bitrix24.com/rest/1/secret/crm.deal.list.json"
        );
        let body: Value = serde_json::from_slice(seen[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(body, json!({"select": ["ID"], "start": -1}));
    }

    #[tokio::test]
    async fn test_v3_endpoint() {
        let (client, http) = client(webhook(), 200, r#"{"result":{}}"#);
        client
            .call_v3("tasks.task.get", json!({"id": 1}), Paging::Default)
            .await
            .unwrap();
        assert_eq!(
            http.seen.lock().unwrap()[0].url,
            "https://portal.bitrix24.com/rest/api/1/secret/tasks.task.get"
        );
    }

    #[tokio::test]
    async fn test_application_auth_param() {
        let config = ClientConfig::new(
            Credentials::application("https://portal.bitrix24.com/rest/", "token-1").unwrap(),
        );
        let (client, http) = client(config, 200, r#"{"result":true}"#);
        let env = client
            .call_method("user.current", Value::Null, Paging::Default)
            .await
            .unwrap();
        assert!(env.is_success());

        let seen = http.seen.lock().unwrap();
        let body: Value = serde_json::from_slice(seen[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(body, json!({"auth": "token-1"}));
        // origin keeps the caller's params, not the auth token
        assert_eq!(env.origin().unwrap().params, json!({}));
    }

    #[tokio::test]
    async fn test_non_json_body_is_transport_error() {
        let (client, _) = client(webhook(), 502, "<html>Bad gateway</html>");
        let err = client
            .call_method("user.current", json!({}), Paging::Default)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            B24Error::Transport(TransportError::InvalidResponse { status: 502, .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_method_is_configuration_error() {
        let (client, http) = client(webhook(), 200, r#"{"result":1}"#);
        let err = client
            .call_method("", json!({}), Paging::Default)
            .await
            .unwrap_err();
        assert!(matches!(err, B24Error::Configuration(_)));
        assert!(http.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_redact() {
        assert_eq!(
            redact("https://p.bitrix24.com/rest/1/secret/crm.deal.list.json"),
            "https://p.bitrix24.com/rest/.../crm.deal.list.json"
        );
    }
}
