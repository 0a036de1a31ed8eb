//! Expiry Scheduler (C9) exercised with a real subscription and a real
//! (wiremock-backed) remote key, confirming the grace-period teardown
//! actually reaches the backend (spec.md §8: "subscription expires, keys
//! torn down").

mod support;

use support::{Harness, V2RAY_CREATE_RESPONSE};
use veectl::scheduler::ExpiryScheduler;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn expired_subscription_deletes_remote_keys_after_grace_period() {
    let mut h = Harness::new().await;
    h.config.grace_period_secs = 0;
    h.add_v2ray_server("exp1", "DE").await;

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
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/keys/.+$"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&h.backend)
        .await;

    let outcome = h
        .subscriptions
        .create_or_extend(h.user_id, h.tariff_id, 1)
        .await
        .unwrap();
    assert_eq!(outcome.created_keys, 1);

    let notify: std::sync::Arc<dyn veectl::notify::NotificationSink> = std::sync::Arc::new(h.notify.clone());
    let scheduler = ExpiryScheduler::new(
        h.store.clone(),
        h.cache.clone(),
        notify,
        h.subscriptions.clone(),
        std::sync::Arc::new(h.config.clone()),
    );

    tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
    scheduler.run_once().await.unwrap();

    assert!(h.store.get_subscription(outcome.subscription.id).await.unwrap().is_none());
}
