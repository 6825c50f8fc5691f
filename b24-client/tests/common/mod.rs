// In-memory portal used by the client integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use b24_client::{B24Client, ClientConfig, RestrictionPolicy};
use b24_transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use serde_json::Value;
use std::sync::{Arc, Mutex};

type Handler = dyn Fn(&str, &Value) -> (u16, Value) + Send + Sync;

/// Answers every request through `handler` and records what was sent
pub struct FakePortal {
    handler: Box<Handler>,
    pub requests: Mutex<Vec<(String, Value)>>,
}

impl FakePortal {
    pub fn new(handler: impl Fn(&str, &Value) -> (u16, Value) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl HttpTransport for FakePortal {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let body: Value = request
            .body
            .as_ref()
            .map(|b| serde_json::from_slice(b).unwrap())
            .unwrap_or(Value::Null);
        let (status, reply) = (self.handler)(&request.url, &body);
        self.requests.lock().unwrap().push((request.url, body));
        Ok(HttpResponse::new(status, serde_json::to_vec(&reply).unwrap()))
    }
}

/// Policy that never delays the tests
pub fn fast_policy() -> RestrictionPolicy {
    RestrictionPolicy {
        max_requests_per_second: 1000.0,
        burst: 100,
        max_concurrent_batch_commands: 8,
        sleep_interval_ms: 10,
    }
}

pub fn config() -> ClientConfig {
    let mut config = ClientConfig::webhook("https://portal.bitrix24.com/rest/1/secret/").unwrap();
    config.policy = fast_policy();
    config
}

pub fn client(portal: Arc<FakePortal>, config: ClientConfig) -> B24Client {
    b24_client::logging::init_test_logging();
    B24Client::with_transport(config, portal).unwrap()
}
