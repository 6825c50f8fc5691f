// Batch engine against an in-memory portal: chunking, cross-chunk
// references, halt-on-error and positional flattening.

mod common;

use b24_client::{ApiErrorKind, B24Error, BatchCommands, BatchData, BatchOptions, Command};
use common::{client, config, FakePortal};
use indexmap::IndexMap;
use serde_json::{json, Map, Value};

fn batch_reply(results: Value, errors: Value) -> Value {
    json!({
        "result": {
            "result": results,
            "result_error": errors,
            "result_total": [],
            "result_next": [],
            "result_time": []
        },
        "time": {"start": 1.0, "finish": 1.1, "duration": 0.1}
    })
}

fn six_commands() -> IndexMap<String, Command> {
    let mut cmds = IndexMap::new();
    cmds.insert("K1".to_string(), Command::new("crm.deal.add", json!({"fields": {"TITLE": "one"}})));
    cmds.insert("K2".to_string(), Command::bare("user.current"));
    cmds.insert("K3".to_string(), Command::new("crm.deal.get", json!({"id": "$result[K1]"})));
    cmds.insert(
        "K4".to_string(),
        Command::new("user.get", json!({"ID": "$result[K3][ASSIGNED_BY_ID]"})),
    );
    cmds.insert("K5".to_string(), Command::bare("app.info"));
    cmds.insert(
        "K6".to_string(),
        Command::new(
            "crm.deal.update",
            json!({"id": "$result[K1]", "fields": {"COMMENTS": "by $result[K2][NAME]"}}),
        ),
    );
    cmds
}

/// Names of the commands in a batch body, in wire order
fn names(body: &Value) -> Vec<String> {
    body["cmd"]
        .as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

fn answer(name: &str) -> Value {
    match name {
        "K1" => json!(1001),
        "K2" => json!({"ID": "7", "NAME": "Anna"}),
        "K3" => json!({"ID": "1001", "ASSIGNED_BY_ID": "7"}),
        _ => json!(true),
    }
}

#[tokio::test]
async fn test_cross_chunk_reference_uses_prior_result() {
    let portal = FakePortal::new(|url, body| {
        assert!(url.ends_with("/batch.json"));
        let mut results = Map::new();
        for name in names(body) {
            results.insert(name.clone(), answer(&name));
        }
        (200, batch_reply(Value::Object(results), json!([])))
    });
    let mut cfg = config();
    cfg.max_batch_size = 2;
    let client = client(portal.clone(), cfg);

    let env = client
        .call_batch(six_commands(), BatchOptions::default())
        .await
        .unwrap();

    assert!(env.is_success());
    let data = env.data().unwrap();
    assert_eq!(data.len(), 6);
    assert_eq!(data.get("K1"), Some(&json!(1001)));

    let bodies = portal.bodies();
    assert_eq!(bodies.len(), 3);
    assert_eq!(bodies[0]["halt"], json!(0));
    // K3 -> K1 crosses a chunk boundary and is substituted
    assert_eq!(bodies[1]["cmd"]["K3"], json!("crm.deal.get?id=1001"));
    // K4 -> K3 stays inside the chunk and is left for the server
    assert_eq!(
        bodies[1]["cmd"]["K4"],
        json!("user.get?ID=%24result%5BK3%5D%5BASSIGNED_BY_ID%5D")
    );
    assert_eq!(
        bodies[2]["cmd"]["K6"],
        json!("crm.deal.update?id=1001&fields[COMMENTS]=by+Anna")
    );
}

#[tokio::test]
async fn test_halt_on_error_stops_after_failing_chunk() {
    let portal = FakePortal::new(|_, body| {
        let mut results = Map::new();
        let mut errors = Map::new();
        for name in names(body) {
            if name == "K3" {
                errors.insert(
                    name,
                    json!({"error": "NOT_FOUND", "error_description": "Deal not found"}),
                );
                // the server stops the chunk at the failing command
                break;
            }
            results.insert(name.clone(), answer(&name));
        }
        (200, batch_reply(Value::Object(results), Value::Object(errors)))
    });
    let mut cfg = config();
    cfg.max_batch_size = 2;
    let client = client(portal.clone(), cfg);

    let env = client
        .call_batch(six_commands(), BatchOptions::halt_on_error().envelopes())
        .await
        .unwrap();

    assert_eq!(portal.count(), 2, "no chunk after the failing one");
    assert!(portal.bodies().iter().all(|b| b["halt"] == json!(1)));
    assert!(!env.is_success());
    assert_eq!(env.errors().len(), 1);
    assert_eq!(env.errors()[0].kind, ApiErrorKind::NotFound);
    assert_eq!(env.errors()[0].command.as_deref(), Some("K3"));

    let Some(BatchData::Envelopes(results)) = env.data() else {
        panic!("expected envelopes");
    };
    assert!(results["K1"].is_success());
    assert!(results["K2"].is_success());
    assert!(!results["K3"].is_success());
    assert!(!results.contains_key("K4"));
    assert!(!results.contains_key("K5"));
}

#[tokio::test]
async fn test_failed_reference_target_blocks_dependent_commands() {
    let portal = FakePortal::new(|_, body| {
        let mut results = Map::new();
        let mut errors = Map::new();
        for name in names(body) {
            if name == "K1" {
                errors.insert(name, json!({"error": "ACCESS_DENIED", "error_description": "no"}));
            } else {
                results.insert(name.clone(), answer(&name));
            }
        }
        (200, batch_reply(Value::Object(results), Value::Object(errors)))
    });
    let mut cfg = config();
    cfg.max_batch_size = 2;
    let client = client(portal.clone(), cfg);

    let env = client
        .call_batch(six_commands(), BatchOptions::default())
        .await
        .unwrap();

    // chunk two only holds K3 and K4, both blocked, so it is never sent
    let bodies = portal.bodies();
    assert_eq!(bodies.len(), 2);
    assert_eq!(names(&bodies[1]), vec!["K5".to_string()]);

    let failed: Vec<_> = env
        .errors()
        .iter()
        .map(|e| (e.command.clone().unwrap_or_default(), e.kind))
        .collect();
    assert!(failed.contains(&("K1".to_string(), ApiErrorKind::AccessDenied)));
    assert!(failed.contains(&("K3".to_string(), ApiErrorKind::UnresolvedReference)));
    assert!(failed.contains(&("K4".to_string(), ApiErrorKind::UnresolvedReference)));
    assert!(failed.contains(&("K6".to_string(), ApiErrorKind::UnresolvedReference)));

    // raw mode keeps successful results only
    let data = env.data().unwrap();
    assert_eq!(data.get("K2"), Some(&json!({"ID": "7", "NAME": "Anna"})));
    assert!(data.get("K1").is_none());
}

#[tokio::test]
async fn test_forward_reference_fails_before_sending() {
    let portal = FakePortal::new(|_, _| (200, batch_reply(json!({}), json!([]))));
    let client = client(portal.clone(), config());

    let mut cmds = IndexMap::new();
    cmds.insert("a".to_string(), Command::new("crm.deal.get", json!({"id": "$result[b]"})));
    cmds.insert("b".to_string(), Command::bare("crm.deal.add"));

    let err = client
        .call_batch(cmds, BatchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, B24Error::Configuration(_)));
    assert_eq!(portal.count(), 0);
}

#[tokio::test]
async fn test_positional_batch_flattens_in_order() {
    let portal = FakePortal::new(|_, body| {
        let cmds = body["cmd"].as_array().unwrap();
        let results: Vec<Value> = cmds
            .iter()
            .map(|line| {
                let line = line.as_str().unwrap();
                let n: i64 = line.trim_start_matches('m').split('?').next().unwrap().parse().unwrap();
                if n % 2 == 0 {
                    json!([n * 10, n * 10 + 1])
                } else {
                    json!({"n": n})
                }
            })
            .collect();
        (200, batch_reply(Value::Array(results), json!([])))
    });
    let mut cfg = config();
    cfg.max_batch_size = 2;
    let client = client(portal.clone(), cfg);

    let commands: Vec<Command> = (0..5)
        .map(|i| {
            if i == 3 {
                Command::new("m3", json!({"prev": "$result[2]"}))
            } else {
                Command::bare(format!("m{}", i))
            }
        })
        .collect();
    let env = client.call_batch_by_chunk(commands, true).await.unwrap();

    assert!(env.is_success());
    assert_eq!(
        env.data().unwrap(),
        &vec![
            json!(0),
            json!(1),
            json!({"n": 1}),
            json!(20),
            json!(21),
            json!({"n": 3}),
            json!(40),
            json!(41),
        ]
    );

    // command 2 is index 0 inside the second chunk
    let bodies = portal.bodies();
    assert_eq!(bodies.len(), 3);
    assert_eq!(bodies[1]["cmd"][1], json!("m3?prev=%24result%5B0%5D"));
}

#[tokio::test]
async fn test_top_level_error_fails_every_command() {
    let portal = FakePortal::new(|_, _| {
        (
            401,
            json!({"error": "expired_token", "error_description": "The access token provided has expired."}),
        )
    });
    let client = client(portal, config());

    let env = client
        .call_batch(
            BatchCommands::Positional(vec![Command::bare("a"), Command::bare("b")]),
            BatchOptions::default().envelopes(),
        )
        .await
        .unwrap();
    assert!(!env.is_success());
    assert_eq!(env.errors().len(), 2);
    assert!(env.errors().iter().all(|e| e.kind == ApiErrorKind::ExpiredToken));
    assert_eq!(env.errors()[0].status, Some(401));
}

/// Accepts requests and never answers
struct Silent;

#[async_trait::async_trait]
impl b24_transport::HttpTransport for Silent {
    async fn send(
        &self,
        _request: b24_transport::HttpRequest,
    ) -> Result<b24_transport::HttpResponse, b24_transport::TransportError> {
        std::future::pending().await
    }
}

fn one_command() -> BatchCommands {
    BatchCommands::Positional(vec![Command::bare("user.current")])
}

#[tokio::test]
async fn test_batch_can_be_cancelled() {
    let client = b24_client::B24Client::with_transport(config(), std::sync::Arc::new(Silent)).unwrap();
    let token = tokio_util::sync::CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = client
        .call_batch(one_command(), BatchOptions::default().with_cancel(token))
        .await
        .unwrap_err();
    assert!(matches!(err, B24Error::Cancelled));
    assert_eq!(client.limiter().in_flight(), 0);
}

#[tokio::test]
async fn test_batch_times_out_waiting_for_a_permit() {
    let mut cfg = config();
    cfg.policy.max_concurrent_batch_commands = 1;
    let client = std::sync::Arc::new(
        b24_client::B24Client::with_transport(cfg, std::sync::Arc::new(Silent)).unwrap(),
    );

    let busy = client.clone();
    let hog = tokio::spawn(async move {
        let _ = busy.call_batch(one_command(), BatchOptions::default()).await;
    });
    while client.limiter().in_flight() == 0 {
        tokio::task::yield_now().await;
    }

    let err = client
        .call_batch(
            one_command(),
            BatchOptions::halt_on_error().with_timeout(std::time::Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, B24Error::RateLimitTimeout { .. }));
    hog.abort();
}
