//! End-to-end tests: a real upstream server, a real proxy instance, real
//! sockets on loopback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as ServerWsMessage, WebSocketUpgrade};
use axum::response::{Html, IntoResponse, Redirect};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use periscope::{
    LogKind, ProxyConfig, ProxyError, ProxyInstance, ProxyManager, ProxyState, METRICS_PATH,
    SESSION_COOKIE,
};

async fn upstream_ws_echo(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        while let Some(Ok(message)) = socket.recv().await {
            if matches!(message, ServerWsMessage::Close(_)) {
                break;
            }
            if socket.send(message).await.is_err() {
                break;
            }
        }
    })
}

/// Spawns a small origin server on a free loopback port.
async fn spawn_upstream() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/hello", get(|| async { "hi" }))
        .route("/page", get(|| async {
            Html("<html><head><title>X</title></head><body>Y</body></html>")
        }))
        .route("/data", get(|| async {
            (
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                r#"{"ok":true}"#,
            )
        }))
        .route("/redirect", get(move || async move {
            Redirect::temporary(&format!("http://{addr}/hello"))
        }))
        .route("/echo", get(upstream_ws_echo));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn start_proxy(manager: &ProxyManager, id: &str, upstream: SocketAddr) -> Arc<ProxyInstance> {
    manager
        .create(ProxyConfig::new(id, format!("http://{upstream}")))
        .await
        .expect("create proxy")
}

/// Opens the reserved telemetry WebSocket, optionally presenting a session
/// cookie on the handshake.
async fn connect_metrics(
    addr: SocketAddr,
    sid: Option<&str>,
) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
    let mut request = format!("ws://{addr}{METRICS_PATH}")
        .into_client_request()
        .unwrap();
    if let Some(sid) = sid {
        request.headers_mut().insert(
            "Cookie",
            format!("{SESSION_COOKIE}={sid}").parse().unwrap(),
        );
    }
    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("metrics websocket connect");
    socket
}

fn telemetry_frame(kind: &str, data: serde_json::Value, sid: &str) -> Message {
    Message::text(
        json!({
            "type": kind,
            "data": data,
            "url": "http://example.test/",
            "session_id": sid,
        })
        .to_string(),
    )
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[test_timeout::timeout]
async fn forwards_and_mints_session_cookie() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let proxy = start_proxy(&manager, "fwd", upstream).await;
    let addr = proxy.listen_addr().unwrap();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let cookie = response
        .headers()
        .get("set-cookie")
        .expect("session cookie minted")
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("__devtool_sid=sess-"));
    assert!(cookie.contains("Path=/"));
    assert!(cookie.contains("SameSite=Lax"));
    assert_eq!(response.text().await.unwrap(), "hi");

    // Presenting the cookie suppresses further minting.
    let pair = cookie.split(';').next().unwrap().to_string();
    let response = client
        .get(format!("http://{addr}/hello"))
        .header("Cookie", pair)
        .send()
        .await
        .unwrap();
    assert!(response.headers().get("set-cookie").is_none());

    let stats = proxy.stats();
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.sessions, 1);
    assert!(stats.listen_addr.is_some());

    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn injects_instrumentation_into_html() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let proxy = start_proxy(&manager, "inj", upstream).await;
    let addr = proxy.listen_addr().unwrap();

    let response = reqwest::get(format!("http://{addr}/page")).await.unwrap();
    assert_eq!(response.status(), 200);
    // The rewritten body has unknown length; Content-Length must be gone.
    assert!(response.headers().get("content-length").is_none());

    let body = response.text().await.unwrap();
    assert_eq!(body.matches("html2canvas-pro").count(), 1);
    assert_eq!(body.matches("__devtool_metrics").count(), 1);
    assert!(body.contains("<body>Y</body>"));
    // Inserted immediately before </head>.
    let bundle_at = body.find("<script src=").unwrap();
    let head_close = body.find("</head>").unwrap();
    assert!(bundle_at < head_close);
    assert!(body[..bundle_at].contains("<title>X</title>"));

    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn non_html_bodies_pass_through_untouched() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let proxy = start_proxy(&manager, "raw", upstream).await;
    let addr = proxy.listen_addr().unwrap();

    let response = reqwest::get(format!("http://{addr}/data")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), r#"{"ok":true}"#);

    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn duplicate_proxy_id_is_rejected() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    start_proxy(&manager, "dup", upstream).await;

    let err = manager
        .create(ProxyConfig::new("dup", format!("http://{upstream}")))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::ProxyExists(id) if id == "dup"));
    assert_eq!(manager.active_count(), 1);

    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn port_conflict_falls_back_to_a_fresh_port() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let a = start_proxy(&manager, "port-a", upstream).await;
    let a_addr = a.listen_addr().unwrap();

    // Ask for exactly the port the first proxy holds.
    let mut config = ProxyConfig::new("port-b", format!("http://{upstream}"));
    config.listen_port = a_addr.port();
    let b = manager.create(config).await.expect("fallback bind");
    let b_addr = b.listen_addr().unwrap();
    assert_ne!(a_addr.port(), b_addr.port());
    assert!(a.is_running() && b.is_running());

    // Both answer over HTTP.
    for addr in [a_addr, b_addr] {
        let body = reqwest::get(format!("http://{addr}/hello"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "hi");
    }

    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn telemetry_frames_land_in_the_session_buffer() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let mut config = ProxyConfig::new("tel", format!("http://{upstream}"));
    config.buffer_capacity = 100;
    let proxy = manager.create(config).await.unwrap();
    let addr = proxy.listen_addr().unwrap();

    let sid = "sess-itest-buffer";
    let mut socket = connect_metrics(addr, Some(sid)).await;
    for n in 1..=150 {
        socket
            .send(telemetry_frame("custom_log", json!({ "n": n }), sid))
            .await
            .unwrap();
    }

    let registry = proxy.registry();
    wait_until("all frames to be ingested", || {
        registry
            .get(sid)
            .map(|session| {
                let snapshot = session.buffer().snapshot();
                snapshot.len() == 100
                    && snapshot.last().map(|entry| entry.payload["n"] == json!(150)) == Some(true)
            })
            .unwrap_or(false)
    })
    .await;

    let session = registry.get(sid).unwrap();
    let snapshot = session.buffer().snapshot();
    // Capacity 100, 150 appends: the survivors are 51..=150 in order.
    assert_eq!(snapshot.first().unwrap().payload["n"], json!(51));
    assert_eq!(snapshot.last().unwrap().payload["n"], json!(150));
    assert!(snapshot.windows(2).all(|pair| pair[0].seq < pair[1].seq));
    assert_eq!(snapshot.iter().filter(|e| e.kind == LogKind::CustomLog).count(), 100);

    // `since` picks up exactly the tail.
    let mid = snapshot[49].seq;
    assert_eq!(session.buffer().since(mid).len(), 50);

    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn second_socket_displaces_the_first() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let proxy = start_proxy(&manager, "disp", upstream).await;
    let addr = proxy.listen_addr().unwrap();
    let registry = proxy.registry();

    let sid = "sess-itest-displace";
    let mut first = connect_metrics(addr, Some(sid)).await;
    wait_until("first socket to bind", || {
        registry.get(sid).map(|s| s.is_bound()).unwrap_or(false)
    })
    .await;

    let _second = connect_metrics(addr, Some(sid)).await;

    // The displaced socket is closed cleanly within bounded time.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .expect("first socket closed");

    // Exactly the second socket remains current.
    assert!(registry.get(sid).unwrap().is_bound());

    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn execution_round_trips_through_the_browser() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let proxy = start_proxy(&manager, "exec", upstream).await;
    let addr = proxy.listen_addr().unwrap();
    let registry = proxy.registry();

    let sid = "sess-itest-exec";
    let mut socket = connect_metrics(addr, Some(sid)).await;
    wait_until("socket to bind", || {
        registry.get(sid).map(|s| s.is_bound()).unwrap_or(false)
    })
    .await;

    // Fake browser: echo every execute request as a successful reply.
    let peer_sid = sid.to_string();
    let peer = tokio::spawn(async move {
        while let Some(Ok(message)) = socket.next().await {
            if let Message::Text(text) = message {
                let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                if frame["type"] == "execute" {
                    let reply = json!({
                        "type": "execution",
                        "data": {
                            "exec_id": frame["id"],
                            "result": "ok",
                            "error": "",
                            "duration": 3,
                        },
                        "session_id": peer_sid,
                    });
                    socket.send(Message::text(reply.to_string())).await.unwrap();
                }
            }
        }
    });

    let outcome = proxy
        .execute(sid, "1+1", Duration::from_secs(1))
        .await
        .expect("execution reply");
    assert_eq!(outcome.result, json!("ok"));
    assert!(outcome.error.is_none());
    assert_eq!(outcome.duration_ms, 3);

    let session = registry.get(sid).unwrap();
    assert_eq!(session.pending_count(), 0);
    // The reply is also buffered as an execution entry.
    assert!(session
        .buffer()
        .snapshot()
        .iter()
        .any(|entry| entry.kind == LogKind::Execution));

    peer.abort();
    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn execution_times_out_and_drops_the_late_reply() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let proxy = start_proxy(&manager, "slow", upstream).await;
    let addr = proxy.listen_addr().unwrap();
    let registry = proxy.registry();

    let sid = "sess-itest-slow";
    let mut socket = connect_metrics(addr, Some(sid)).await;
    wait_until("socket to bind", || {
        registry.get(sid).map(|s| s.is_bound()).unwrap_or(false)
    })
    .await;

    // Peer stays silent past the deadline.
    let err = proxy
        .execute(sid, "1+1", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::ExecutionTimeout(ref s) if s == sid));
    let session = registry.get(sid).unwrap();
    assert_eq!(session.pending_count(), 0);

    // Now produce the reply late; it must vanish silently.
    let execute_frame = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if frame["type"] == "execute" {
                        break frame;
                    }
                }
                other => panic!("expected execute frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("execute frame delivered");

    let late = json!({
        "type": "execution",
        "data": { "exec_id": execute_frame["id"], "result": "late", "error": "", "duration": 1 },
        "session_id": sid,
    });
    socket.send(Message::text(late.to_string())).await.unwrap();

    // The late reply is still buffered as telemetry, but resolves nothing.
    wait_until("late reply to be buffered", || {
        session
            .buffer()
            .snapshot()
            .iter()
            .any(|entry| entry.kind == LogKind::Execution)
    })
    .await;
    assert_eq!(session.pending_count(), 0);

    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn execute_without_a_socket_fails_fast() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let proxy = start_proxy(&manager, "nosock", upstream).await;

    // Unknown session.
    let err = proxy
        .execute("sess-nobody", "1", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::NoBrowser(_)));

    // Session known from HTTP traffic but with no WebSocket bound.
    let addr = proxy.listen_addr().unwrap();
    let response = reqwest::get(format!("http://{addr}/hello")).await.unwrap();
    let cookie = response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let sid = cookie
        .split(';')
        .next()
        .unwrap()
        .trim_start_matches("__devtool_sid=")
        .to_string();
    let err = proxy
        .execute(&sid, "1", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::NoBrowser(ref s) if *s == sid));

    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn http_traffic_is_logged_to_the_session() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let proxy = start_proxy(&manager, "httplog", upstream).await;
    let addr = proxy.listen_addr().unwrap();

    let sid = "sess-itest-http";
    let response = reqwest::Client::new()
        .get(format!("http://{addr}/hello"))
        .header("Cookie", format!("{SESSION_COOKIE}={sid}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let registry = proxy.registry();
    wait_until("http entry to be logged", || {
        registry
            .get(sid)
            .map(|s| !s.buffer().is_empty())
            .unwrap_or(false)
    })
    .await;
    let entry = registry.get(sid).unwrap().buffer().snapshot().remove(0);
    assert_eq!(entry.kind, LogKind::Http);
    assert_eq!(entry.payload["path"], json!("/hello"));
    assert_eq!(entry.payload["status"], json!(200));

    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn upstream_redirects_stay_behind_the_proxy() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let proxy = start_proxy(&manager, "redir", upstream).await;
    let addr = proxy.listen_addr().unwrap();

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let response = client
        .get(format!("http://{addr}/redirect"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 307);
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(location, format!("http://localhost:{}/hello", addr.port()));

    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn upstream_websockets_are_bridged() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let proxy = start_proxy(&manager, "wsfwd", upstream).await;
    let addr = proxy.listen_addr().unwrap();

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/echo"))
        .await
        .expect("bridged websocket connect");
    socket.send(Message::text("ping")).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(echoed, Message::text("ping"));

    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn unreachable_upstream_yields_502_diagnostics() {
    // A port with nothing listening: bind, read the port, drop the listener.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = probe.local_addr().unwrap();
    drop(probe);

    let manager = ProxyManager::new();
    let proxy = start_proxy(&manager, "dead", dead).await;
    let addr = proxy.listen_addr().unwrap();

    let response = reqwest::get(format!("http://{addr}/hello")).await.unwrap();
    assert_eq!(response.status(), 502);
    let body = response.text().await.unwrap();
    assert!(body.contains("upstream unavailable"));

    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn graceful_stop_releases_the_listener() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let proxy = start_proxy(&manager, "stopme", upstream).await;
    let addr = proxy.listen_addr().unwrap();
    assert!(proxy.is_running());
    assert_eq!(manager.active_count(), 1);

    manager.stop("stopme").await.unwrap();
    assert!(!proxy.is_running());
    assert_eq!(proxy.state(), ProxyState::Stopped);
    assert_eq!(manager.active_count(), 0);
    assert!(matches!(
        manager.get("stopme"),
        Err(ProxyError::ProxyNotFound(_))
    ));
    assert!(TcpStream::connect(addr).await.is_err());

    // Stop is idempotent via the instance handle.
    proxy.stop().await;

    // The ID is free for reuse.
    let again = start_proxy(&manager, "stopme", upstream).await;
    assert!(again.is_running());
    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn shutdown_stops_everything_and_rejects_creates() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let proxies = [
        start_proxy(&manager, "shut-a", upstream).await,
        start_proxy(&manager, "shut-b", upstream).await,
        start_proxy(&manager, "shut-c", upstream).await,
    ];
    assert_eq!(manager.active_count(), 3);

    let mut stopped = manager.shutdown().await;
    stopped.sort();
    assert_eq!(stopped, vec!["shut-a", "shut-b", "shut-c"]);
    assert_eq!(manager.active_count(), 0);
    for proxy in &proxies {
        assert_eq!(proxy.state(), ProxyState::Stopped);
    }

    let err = manager
        .create(ProxyConfig::new("late", format!("http://{upstream}")))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::ShuttingDown));
}

#[test_timeout::timeout]
async fn stop_all_leaves_the_manager_usable() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    start_proxy(&manager, "cycle-a", upstream).await;
    start_proxy(&manager, "cycle-b", upstream).await;

    let stopped = manager.stop_all().await;
    assert_eq!(stopped.len(), 2);
    assert_eq!(manager.active_count(), 0);

    // Unlike shutdown, creates still work.
    let again = start_proxy(&manager, "cycle-a", upstream).await;
    assert!(again.is_running());
    manager.shutdown().await;
}

#[test_timeout::timeout]
async fn broadcasts_reach_connected_tabs() {
    let upstream = spawn_upstream().await;
    let manager = ProxyManager::new();
    let proxy = start_proxy(&manager, "cast", upstream).await;
    let addr = proxy.listen_addr().unwrap();
    let registry = proxy.registry();

    let mut sockets = Vec::new();
    for sid in ["sess-cast-1", "sess-cast-2"] {
        sockets.push((sid, connect_metrics(addr, Some(sid)).await));
    }
    wait_until("both sockets to bind", || {
        ["sess-cast-1", "sess-cast-2"]
            .iter()
            .all(|sid| registry.get(sid).map(|s| s.is_bound()).unwrap_or(false))
    })
    .await;

    assert_eq!(proxy.broadcast_activity(true), 2);
    assert_eq!(proxy.broadcast_toast("info", "Build", "done", Some(1500)), 2);

    for (_, socket) in sockets.iter_mut() {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "activity");
        assert_eq!(value["payload"]["active"], json!(true));

        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "toast");
        assert_eq!(value["payload"]["title"], json!("Build"));
        assert_eq!(value["payload"]["duration"], json!(1500));
    }

    manager.shutdown().await;
}
