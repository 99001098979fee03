//! End-to-end header propagation through a running proxy.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

mod common;

type SeenHeaders = BTreeMap<String, Vec<String>>;

async fn seen_by_upstream(request: reqwest::RequestBuilder) -> SeenHeaders {
    let res = request.send().await.expect("proxy unreachable");
    assert_eq!(res.status(), 200);
    res.json().await.unwrap()
}

fn single<'a>(headers: &'a SeenHeaders, name: &str) -> Option<&'a str> {
    let values = headers.get(name)?;
    assert_eq!(values.len(), 1, "{name} sent more than once: {values:?}");
    Some(values[0].as_str())
}

#[tokio::test]
async fn identity_and_xsrf_token_reach_upstream() {
    let upstream = common::start_echo_upstream().await;
    let proxy = common::start_proxy(common::config_for(upstream)).await;

    let seen = seen_by_upstream(
        common::client()
            .get(proxy.url("/notebook/kubeflow-user/nb/api/contents"))
            .header("cookie", "theme=dark; _xsrf=2|abc123|def; lang=en"),
    )
    .await;

    assert_eq!(single(&seen, "kubeflow-userid"), Some("user@example.com"));
    assert_eq!(single(&seen, "x-xsrftoken"), Some("2|abc123|def"));
    assert_eq!(
        single(&seen, "cookie"),
        Some("theme=dark; _xsrf=2|abc123|def; lang=en")
    );
}

#[tokio::test]
async fn client_identity_is_overwritten() {
    let upstream = common::start_echo_upstream().await;
    let proxy = common::start_proxy(common::config_for(upstream)).await;

    let seen = seen_by_upstream(
        common::client()
            .post(proxy.url("/api/sessions"))
            .header("kubeflow-userid", "attacker@example.com")
            .body("{}"),
    )
    .await;

    assert_eq!(single(&seen, "kubeflow-userid"), Some("user@example.com"));
}

#[tokio::test]
async fn existing_token_kept_without_cookie() {
    let upstream = common::start_echo_upstream().await;
    let proxy = common::start_proxy(common::config_for(upstream)).await;

    let seen = seen_by_upstream(
        common::client()
            .get(proxy.url("/"))
            .header("cookie", "xsrf=nope; other_xsrf=nope")
            .header("x-xsrftoken", "from-client"),
    )
    .await;

    assert_eq!(single(&seen, "x-xsrftoken"), Some("from-client"));
    assert_eq!(single(&seen, "kubeflow-userid"), Some("user@example.com"));
}

#[tokio::test]
async fn no_token_without_cookie_header() {
    let upstream = common::start_echo_upstream().await;
    let proxy = common::start_proxy(common::config_for(upstream)).await;

    let seen = seen_by_upstream(common::client().get(proxy.url("/lab"))).await;

    assert!(!seen.contains_key("x-xsrftoken"));
    assert_eq!(single(&seen, "kubeflow-userid"), Some("user@example.com"));
}

#[tokio::test]
async fn csrf_propagation_can_be_disabled() {
    let upstream = common::start_echo_upstream().await;
    let mut config = common::config_for(upstream);
    config.filter.csrf_enabled = false;
    config.filter.user_id_prefix = "accounts.google.com:".into();
    let proxy = common::start_proxy(config).await;

    let seen = seen_by_upstream(
        common::client()
            .get(proxy.url("/"))
            .header("cookie", "_xsrf=abc"),
    )
    .await;

    assert!(!seen.contains_key("x-xsrftoken"));
    assert_eq!(
        single(&seen, "kubeflow-userid"),
        Some("accounts.google.com:user@example.com")
    );
}

#[tokio::test]
async fn forwarding_headers_and_request_id() {
    let upstream = common::start_echo_upstream().await;
    let proxy = common::start_proxy(common::config_for(upstream)).await;

    let res = common::client().get(proxy.url("/")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    let request_id = res
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .expect("response carries a request id");
    let seen: SeenHeaders = res.json().await.unwrap();

    assert_eq!(single(&seen, "x-request-id"), Some(request_id.as_str()));
    assert_eq!(single(&seen, "x-forwarded-for"), Some("127.0.0.1"));
    assert_eq!(single(&seen, "x-forwarded-proto"), Some("http"));
    assert_eq!(single(&seen, "host"), Some(proxy.addr.to_string().as_str()));
}

#[tokio::test]
async fn reload_swaps_filter_settings() {
    let upstream = common::start_echo_upstream().await;
    let config = common::config_for(upstream);
    let proxy = common::start_proxy(config.clone()).await;

    let mut updated = config;
    updated.filter.user_id = "second@example.com".into();
    updated.filter.csrf_header = "X-Custom-XSRF".into();
    proxy.config_tx.send(updated).unwrap();

    let mut last = SeenHeaders::new();
    for _ in 0..50 {
        last = seen_by_upstream(
            common::client()
                .get(proxy.url("/"))
                .header("cookie", "_xsrf=tok"),
        )
        .await;
        if single(&last, "kubeflow-userid") == Some("second@example.com") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(single(&last, "kubeflow-userid"), Some("second@example.com"));
    assert_eq!(single(&last, "x-custom-xsrf"), Some("tok"));
    assert!(!last.contains_key("x-xsrftoken"));
}

#[tokio::test]
async fn invalid_reload_keeps_current_settings() {
    let upstream = common::start_echo_upstream().await;
    let config = common::config_for(upstream);
    let proxy = common::start_proxy(config.clone()).await;

    let mut broken = config;
    broken.filter.user_id_header = "not a header".into();
    proxy.config_tx.send(broken).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = seen_by_upstream(common::client().get(proxy.url("/"))).await;
    assert_eq!(single(&seen, "kubeflow-userid"), Some("user@example.com"));
}

#[tokio::test]
async fn websocket_handshake_carries_headers() {
    let upstream = common::start_echo_upstream().await;
    let proxy = common::start_proxy(common::config_for(upstream)).await;

    let mut request = format!("ws://{}/api/kernels/k1/channels", proxy.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("cookie", "_xsrf=ws-token".parse().unwrap());
    request
        .headers_mut()
        .insert("kubeflow-userid", "attacker@example.com".parse().unwrap());

    let (mut socket, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(response.status(), 101);

    let handshake = match socket.next().await.unwrap().unwrap() {
        Message::Text(text) => serde_json::from_str::<SeenHeaders>(text.as_str()).unwrap(),
        other => panic!("unexpected first message: {other:?}"),
    };
    assert_eq!(single(&handshake, "kubeflow-userid"), Some("user@example.com"));
    assert_eq!(single(&handshake, "x-xsrftoken"), Some("ws-token"));

    socket
        .send(Message::Text("execute_request".to_owned().into()))
        .await
        .unwrap();
    match socket.next().await.unwrap().unwrap() {
        Message::Text(text) => assert_eq!(text.as_str(), "execute_request"),
        other => panic!("unexpected echo: {other:?}"),
    }

    let _ = socket.close(None).await;
}
