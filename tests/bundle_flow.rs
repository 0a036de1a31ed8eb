//! End-to-end coverage for the create -> provision -> serve-bundle path
//! (spec.md §8: "create then fetch bundle"), driven through a real axum
//! server rather than calling handlers directly.

mod support;

use base64::{engine::general_purpose::STANDARD, Engine};
use support::{Harness, V2RAY_CREATE_RESPONSE};
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn create_then_fetch_bundle_returns_keys() {
    let h = Harness::new().await;

    Mock::given(method("POST"))
        .and(path_regex(r"^/keys$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(V2RAY_CREATE_RESPONSE.clone()))
        .mount(&h.backend)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/keys/.+/link$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "vless_link": "vless://uuid@host:443?sni=example.com&sid=abcd#old"
        })))
        .mount(&h.backend)
        .await;

    let server = h.add_v2ray_server("fra1", "DE").await;
    let outcome = h
        .subscriptions
        .create_or_extend(h.user_id, h.tariff_id, 2_592_000)
        .await
        .unwrap();
    assert_eq!(outcome.created_keys, 1);
    assert!(outcome.failed_servers.is_empty());

    let addr = h.serve_bundle().await;
    let url = format!("http://{addr}/api/subscription/{}", outcome.subscription.token);
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let user_info = resp
        .headers()
        .get("Subscription-Userinfo")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(user_info.contains("download=0"));

    let body = resp.text().await.unwrap();
    let decoded = String::from_utf8(STANDARD.decode(body).unwrap()).unwrap();
    assert!(decoded.contains("vless://"));
    assert!(decoded.contains(&format!("#{}", server.name)));
    assert!(!decoded.contains("#old"));
}

#[tokio::test]
async fn fetch_bundle_for_unknown_token_is_not_found() {
    let h = Harness::new().await;
    let addr = h.serve_bundle().await;
    let url = format!("http://{addr}/api/subscription/{}", "0".repeat(36));
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn fetch_bundle_with_malformed_token_is_bad_request() {
    let h = Harness::new().await;
    let addr = h.serve_bundle().await;
    let resp = reqwest::get(format!("http://{addr}/api/subscription/short")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn bundle_rate_limit_enforced_per_token() {
    let mut h = Harness::new().await;
    h.config.bundle_rate_limit_per_min = 2;
    let token = "11111111-1111-1111-1111-111111111111";
    // No subscription exists for this token; every call within the limit
    // still resolves to 404, only the 3rd+ call should flip to 429.
    let addr = h.serve_bundle().await;
    let url = format!("http://{addr}/api/subscription/{token}");
    let first = reqwest::get(&url).await.unwrap();
    let second = reqwest::get(&url).await.unwrap();
    let third = reqwest::get(&url).await.unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(second.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(third.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
}
