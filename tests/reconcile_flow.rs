//! Reconciler (C8) exercised against a real HTTP backend client rather
//! than a fake, covering the wire-level shapes V2Ray's `get_all_keys` and
//! `delete_user` actually speak (spec.md §8: "fleet drift").

mod support;

use support::Harness;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn orphan_remote_key_is_deleted_in_apply_mode() {
    let h = Harness::new().await;
    let server = h.add_v2ray_server("ams1", "NL").await;

    h.store
        .create_v2ray_key(server.id, h.user_id, None, "kept@ams1", None, "local-1", 0, None)
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "keys": [
                { "id": "local-1" },
                { "id": "orphan-1" },
            ]
        })))
        .mount(&h.backend)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/keys/orphan-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&h.backend)
        .await;

    let report = h.reconciler.reconcile_server(server.id, true).await.unwrap();
    assert_eq!(report.deleted_remote_keys, 1);
    assert!(report
        .drift
        .iter()
        .any(|d| matches!(d, veectl::reconcile::Drift::MissingInLocal { remote_id, .. } if remote_id == "orphan-1")));
}

#[tokio::test]
async fn dry_run_reports_drift_without_calling_delete() {
    let h = Harness::new().await;
    let server = h.add_v2ray_server("ams2", "NL").await;

    Mock::given(method("GET"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "keys": [{ "id": "orphan-1" }]
        })))
        .mount(&h.backend)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.backend)
        .await;

    let report = h.reconciler.reconcile_server(server.id, false).await.unwrap();
    assert_eq!(report.deleted_remote_keys, 0);
    assert_eq!(report.drift.len(), 1);
}

#[tokio::test]
async fn orphan_subscription_row_with_no_keys_is_swept_in_apply_mode() {
    let h = Harness::new().await;
    let server = h.add_v2ray_server("ams4", "NL").await;

    let empty_sub = h
        .store
        .create_subscription(h.user_id, h.tariff_id, 2_592_000, None)
        .await
        .unwrap();
    h.store.deactivate_subscription(empty_sub.id).await.unwrap();

    Mock::given(method("GET"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "keys": [] })))
        .mount(&h.backend)
        .await;

    let report = h.reconciler.reconcile_server(server.id, true).await.unwrap();
    assert_eq!(report.deleted_orphan_subscriptions, 1);
    assert!(h.store.get_subscription(empty_sub.id).await.unwrap().is_none());
}

#[tokio::test]
async fn local_key_missing_on_server_is_reported() {
    let h = Harness::new().await;
    let server = h.add_v2ray_server("ams3", "NL").await;
    h.store
        .create_v2ray_key(server.id, h.user_id, None, "gone@ams3", None, "vanished-1", 0, None)
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "keys": [] })))
        .mount(&h.backend)
        .await;

    let report = h.reconciler.reconcile_server(server.id, false).await.unwrap();
    assert_eq!(report.drift.len(), 1);
    assert!(matches!(
        report.drift[0],
        veectl::reconcile::Drift::MissingOnServer { .. }
    ));
}
