// List iteration: id-cursor paging, offset paging, early abandon, stalled
// cursors and error handling.

mod common;

use b24_client::{ApiErrorKind, B24Error, CallOptions, ListPager};
use common::{client, config, FakePortal};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashSet;

const PAGE: usize = 50;

/// crm.item.list over ids 1..=total honoring `filter[>id]`
fn item_list(total: i64) -> impl Fn(&str, &Value) -> (u16, Value) + Send + Sync {
    move |url, body| {
        assert!(url.ends_with("crm.item.list.json"));
        assert_eq!(body["start"], json!(-1));
        assert_eq!(body["order"], json!({"id": "ASC"}));
        let after = body["filter"][">id"].as_i64().unwrap_or(0);
        let items: Vec<Value> = (after + 1..=total)
            .take(PAGE)
            .map(|id| json!({"id": id, "title": format!("Deal #{}", id)}))
            .collect();
        (200, json!({"result": {"items": items}, "time": {"duration": 0.01}}))
    }
}

#[tokio::test]
async fn test_fetch_list_yields_five_pages_for_250_items() {
    let portal = FakePortal::new(item_list(250));
    let client = client(portal.clone(), config());

    let pages: Vec<Vec<Value>> = client
        .fetch_list_method(
            "crm.item.list",
            json!({"entityTypeId": 4, "select": ["id", "title"]}),
            "id",
            Some("items"),
        )
        .map(|page| page.unwrap())
        .collect()
        .await;

    assert_eq!(pages.len(), 5);
    assert!(pages.iter().all(|p| p.len() == PAGE));
    // five full pages plus the empty one that ends iteration
    assert_eq!(portal.count(), 6);

    let ids: Vec<i64> = pages
        .iter()
        .flatten()
        .map(|item| item["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, (1..=250).collect::<Vec<_>>());

    // caller params survive every rewrite
    for body in portal.bodies() {
        assert_eq!(body["entityTypeId"], json!(4));
        assert_eq!(body["select"], json!(["id", "title"]));
    }
}

#[tokio::test]
async fn test_abandoned_stream_stops_fetching() {
    let portal = FakePortal::new(item_list(250));
    let client = client(portal.clone(), config());

    let mut stream = Box::pin(client.fetch_list_method(
        "crm.item.list",
        json!({"entityTypeId": 4}),
        "id",
        Some("items"),
    ));
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.len(), PAGE);
    drop(stream);

    assert_eq!(portal.count(), 1);
}

#[tokio::test]
async fn test_fast_list_with_string_ids() {
    // crm.deal.list style: bare array result, upper-case string ids
    let portal = FakePortal::new(|_, body| {
        let after: i64 = body["filter"][">ID"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let rows: Vec<Value> = (after + 1..=120)
            .take(PAGE)
            .map(|id| json!({"ID": id.to_string()}))
            .collect();
        (200, json!({"result": rows}))
    });
    let client = client(portal.clone(), config());

    let env = client
        .call_fast_list_method("crm.deal.list", json!({"select": ["ID"]}), "ID", None)
        .await
        .unwrap();

    assert!(env.is_success());
    let items = env.data().unwrap();
    assert_eq!(items.len(), 120);
    let unique: HashSet<&str> = items.iter().filter_map(|i| i["ID"].as_str()).collect();
    assert_eq!(unique.len(), 120);
    assert_eq!(portal.count(), 4);
}

#[tokio::test]
async fn test_stalled_cursor_is_an_error() {
    // ignores the filter and keeps returning the same page
    let portal = FakePortal::new(|_, _| (200, json!({"result": [{"ID": "1"}, {"ID": "2"}]})));
    let client = client(portal.clone(), config());

    let err = client
        .call_fast_list_method("crm.deal.list", json!({}), "ID", None)
        .await
        .unwrap_err();
    assert!(matches!(err, B24Error::CursorStalled { ref method, .. } if method == "crm.deal.list"));
    assert_eq!(portal.count(), 2);
}

#[tokio::test]
async fn test_api_error_mid_iteration() {
    let portal = FakePortal::new(|_, body| {
        if body["filter"][">ID"].is_null() {
            (200, json!({"result": [{"ID": "1"}, {"ID": "2"}]}))
        } else {
            (
                400,
                json!({"error": "QUERY_LIMIT_EXCEEDED", "error_description": "Too many requests"}),
            )
        }
    });
    let client = client(portal.clone(), config());

    // eager: failed envelope with the items read so far
    let env = client
        .call_fast_list_method("crm.deal.list", json!({}), "ID", None)
        .await
        .unwrap();
    assert!(!env.is_success());
    assert_eq!(env.data().map(Vec::len), Some(2));
    assert_eq!(env.errors()[0].kind, ApiErrorKind::QueryLimitExceeded);

    // lazy: one page, then the error, then the end
    let results: Vec<_> = client
        .fetch_list_method("crm.deal.list", json!({}), "ID", None)
        .collect()
        .await;
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(B24Error::Api(_))));
}

#[tokio::test]
async fn test_offset_list_follows_next() {
    let portal = FakePortal::new(|_, body| {
        let start = body["start"].as_u64().unwrap_or(0);
        let rows: Vec<Value> = (start..120)
            .take(PAGE)
            .map(|i| json!({"ID": (i + 1).to_string()}))
            .collect();
        let mut reply = json!({"result": rows, "total": 120});
        if start + (PAGE as u64) < 120 {
            reply["next"] = json!(start + PAGE as u64);
        }
        (200, reply)
    });
    let client = client(portal.clone(), config());

    let env = client
        .call_list_method("crm.contact.list", json!({"select": ["ID"]}), None)
        .await
        .unwrap();
    assert!(env.is_success());
    assert_eq!(env.data().map(Vec::len), Some(120));

    let starts: Vec<Value> = portal.bodies().iter().map(|b| b["start"].clone()).collect();
    assert_eq!(starts, vec![Value::Null, json!(50), json!(100)]);

    let pages: Vec<_> = client
        .fetch_offset_list_method("crm.contact.list", json!({}), None)
        .collect()
        .await;
    assert_eq!(pages.len(), 3);
    assert_eq!(pages[2].as_ref().map(Vec::len).unwrap(), 20);
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

#[tokio::test]
async fn test_eager_list_can_be_cancelled() {
    let client = b24_client::B24Client::with_transport(config(), std::sync::Arc::new(Silent)).unwrap();
    let token = tokio_util::sync::CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = ListPager::by_id(&client, "crm.item.list", json!({"entityTypeId": 4}), "id", Some("items"))
        .with_options(CallOptions::default().with_cancel(token))
        .collect_all()
        .await
        .unwrap_err();
    assert!(matches!(err, B24Error::Cancelled));
    assert_eq!(client.limiter().in_flight(), 0);
}

#[tokio::test]
async fn test_eager_list_times_out_waiting_for_a_permit() {
    let mut cfg = config();
    cfg.policy.max_concurrent_batch_commands = 1;
    let client = std::sync::Arc::new(
        b24_client::B24Client::with_transport(cfg, std::sync::Arc::new(Silent)).unwrap(),
    );

    let busy = client.clone();
    let hog = tokio::spawn(async move {
        let _ = busy
            .call_list_method("crm.lead.list", json!({}), None)
            .await;
    });
    while client.limiter().in_flight() == 0 {
        tokio::task::yield_now().await;
    }

    let err = ListPager::by_offset(&client, "crm.lead.list", json!({}), None)
        .with_options(CallOptions::default().with_timeout(std::time::Duration::from_millis(50)))
        .collect_all()
        .await
        .unwrap_err();
    assert!(matches!(err, B24Error::RateLimitTimeout { .. }));
    hog.abort();
}

#[tokio::test]
async fn test_pager_options_keep_cursor_paging() {
    let portal = FakePortal::new(item_list(60));
    let client = client(portal.clone(), config());

    let env = ListPager::by_id(&client, "crm.item.list", json!({}), "id", Some("items"))
        .with_options(CallOptions::default().with_timeout(std::time::Duration::from_secs(5)))
        .collect_all()
        .await
        .unwrap();
    assert_eq!(env.data().map(Vec::len), Some(60));
    assert!(portal.bodies().iter().all(|b| b["start"] == json!(-1)));
}
