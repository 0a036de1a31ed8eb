//! Traffic Monitor (C6) exercised end-to-end against a real HTTP backend:
//! provision a key, report it over its tariff's limit, confirm the
//! over-limit notification fires exactly once across repeated polls
//! (spec.md §8: "traffic over limit, notify once").

mod support;

use support::{Harness, V2RAY_CREATE_RESPONSE};
use veectl::notify::Notification;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn over_limit_traffic_notifies_exactly_once() {
    let h = Harness::new().await;
    let capped_tariff = h.store.create_tariff("Capped", 2_592_000, 0, 1).await.unwrap(); // 1 MiB limit
    let server = h.add_v2ray_server("cap1", "DE").await;

    Mock::given(method("POST"))
        .and(path_regex(r"^/keys$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(V2RAY_CREATE_RESPONSE.clone()))
        .mount(&h.backend)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/keys/.+/link$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "vless_link": "vless://uuid@host:443?sni=example.com&sid=abcd"
        })))
        .mount(&h.backend)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/traffic$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "remote-key-1": { "total": 5_000_000 }
        })))
        .mount(&h.backend)
        .await;

    let outcome = h
        .subscriptions
        .create_or_extend(h.user_id, capped_tariff.id, 2_592_000)
        .await
        .unwrap();
    assert_eq!(outcome.created_keys, 1);

    h.traffic.run_once().await.unwrap();
    h.traffic.run_once().await.unwrap();

    let sub = h.store.get_subscription(outcome.subscription.id).await.unwrap().unwrap();
    assert_eq!(sub.traffic_usage_bytes, 5_000_000);
    assert!(sub.traffic_over_limit_at.is_some());
    assert!(sub.traffic_over_limit_notified);

    let over_limit_events = h
        .notify
        .snapshot()
        .into_iter()
        .filter(|n| matches!(n, Notification::TrafficOverLimit { .. }))
        .count();
    assert_eq!(over_limit_events, 1, "must notify exactly once per over-limit episode");
}

#[tokio::test]
async fn traffic_reset_on_extension_clears_over_limit_bookkeeping() {
    let h = Harness::new().await;
    let capped_tariff = h.store.create_tariff("Capped", 2_592_000, 0, 1).await.unwrap();
    h.add_v2ray_server("cap2", "DE").await;

    Mock::given(method("POST"))
        .and(path_regex(r"^/keys$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(V2RAY_CREATE_RESPONSE.clone()))
        .mount(&h.backend)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/keys/.+/link$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "vless_link": "vless://uuid@host:443?sni=example.com&sid=abcd"
        })))
        .mount(&h.backend)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/keys/.+/traffic/reset$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&h.backend)
        .await;

    let outcome = h
        .subscriptions
        .create_or_extend(h.user_id, capped_tariff.id, 1_000)
        .await
        .unwrap();
    h.store
        .update_subscription_traffic(outcome.subscription.id, 2_000_000)
        .await
        .unwrap();
    h.store.mark_traffic_over_limit(outcome.subscription.id).await.unwrap();
    h.store
        .mark_traffic_over_limit_notified(outcome.subscription.id)
        .await
        .unwrap();

    h.subscriptions.extend(outcome.subscription.id, 500).await.unwrap();

    let sub = h.store.get_subscription(outcome.subscription.id).await.unwrap().unwrap();
    assert_eq!(sub.traffic_usage_bytes, 0);
    assert!(sub.traffic_over_limit_at.is_none());
    assert!(!sub.traffic_over_limit_notified);
}
