//! Integration test: start the gateway on a free port, GET /, assert health JSON, then drive
//! a terminal session over WebSocket. The server task is left running when the test ends.

use futures_util::{SinkExt, StreamExt};
use lib::config::Config;
use lib::gateway;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

fn temp_config_dir() -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join(format!("archdash-gateway-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(dir.join("home")).expect("create working dir");
    let config_path = dir.join("config.json");
    std::fs::File::create(&config_path)
        .and_then(|mut f| f.write_all(b"{}"))
        .expect("write config.json");
    (dir, config_path)
}

/// Spawn the gateway and wait until GET / answers; returns the health JSON.
async fn start_gateway(port: u16) -> serde_json::Value {
    let (temp_dir, config_path) = temp_config_dir();
    let mut config = Config::default();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();
    config.terminal.working_dir = Some(temp_dir.join("home"));

    tokio::spawn(async move {
        let _ = gateway::run_gateway(config, config_path).await;
    });

    let url = format!("http://127.0.0.1:{}/", port);
    let client = reqwest::Client::new();
    let mut last_err = None;
    for _ in 0..100 {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                return resp.json().await.expect("parse JSON");
            }
            Ok(_) => {}
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "GET {} did not return 200 with health JSON within 5s; last error: {:?}",
        url, last_err
    );
}

#[tokio::test]
async fn gateway_health_http_responds_with_running() {
    let port = free_port();
    let json = start_gateway(port).await;
    assert_eq!(json.get("runtime").and_then(|v| v.as_str()), Some("running"));
    assert_eq!(json.get("protocol").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(json.get("port").and_then(|v| v.as_u64()), Some(port as u64));
}

type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn call(ws: &mut Ws, id: &str, method: &str, params: serde_json::Value) -> serde_json::Value {
    let frame = json!({ "type": "req", "id": id, "method": method, "params": params });
    ws.send(Message::Text(frame.to_string())).await.expect("send");
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("response in time")
            .expect("stream open")
            .expect("frame");
        let Message::Text(text) = msg else { continue };
        let value: serde_json::Value = serde_json::from_str(&text).expect("json frame");
        if value["type"] == "res" && value["id"] == id {
            return value;
        }
    }
}

#[tokio::test]
async fn gateway_terminal_round_trip_over_websocket() {
    let port = free_port();
    start_gateway(port).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", port))
        .await
        .expect("ws connect");

    let first = ws.next().await.expect("challenge").expect("frame");
    let Message::Text(text) = first else {
        panic!("expected a text challenge frame");
    };
    let challenge: serde_json::Value = serde_json::from_str(&text).expect("json");
    assert_eq!(challenge["event"], "connect.challenge");

    let early = call(&mut ws, "0", "terminal.open", json!({})).await;
    assert_eq!(early["ok"], false);
    assert_eq!(early["error"], "connect required");

    let hello = call(&mut ws, "1", "connect", json!({ "maxProtocol": 1 })).await;
    assert_eq!(hello["ok"], true);
    assert_eq!(hello["payload"]["type"], "hello-ok");

    let open = call(&mut ws, "2", "terminal.open", json!({})).await;
    let session_id = open["payload"]["sessionId"].as_str().expect("sessionId").to_string();

    let denied = call(
        &mut ws,
        "3",
        "terminal.execute",
        json!({ "command": "pacman -S vim", "sessionId": session_id }),
    )
    .await;
    assert_eq!(denied["ok"], true);
    assert_eq!(denied["payload"]["succeeded"], false);
    assert_eq!(denied["payload"]["outcome"], "denied");

    let unknown = call(&mut ws, "4", "terminal.execute", json!({ "command": "nmap localhost" })).await;
    assert_eq!(unknown["payload"]["outcome"], "unknownCommand");

    let history = call(&mut ws, "5", "terminal.history", json!({ "sessionId": session_id })).await;
    let entries = history["payload"]["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["command"], "pacman -S vim");

    let exit = call(
        &mut ws,
        "6",
        "terminal.execute",
        json!({ "command": "exit", "sessionId": session_id }),
    )
    .await;
    assert_eq!(exit["payload"]["special"], "exit");

    let closed = call(&mut ws, "7", "terminal.close", json!({ "sessionId": session_id })).await;
    assert_eq!(closed["payload"]["closed"], false);

    let unknown_method = call(&mut ws, "8", "agent", json!({})).await;
    assert_eq!(unknown_method["error"], "unknown method: agent");
}

#[cfg(unix)]
#[tokio::test]
async fn gateway_runs_allowed_command_in_configured_dir() {
    let port = free_port();
    start_gateway(port).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", port))
        .await
        .expect("ws connect");
    call(&mut ws, "1", "connect", json!({})).await;
    let res = call(&mut ws, "2", "terminal.execute", json!({ "command": "pwd" })).await;
    assert_eq!(res["payload"]["succeeded"], true);
    let output = res["payload"]["output"].as_str().expect("output");
    assert!(output.ends_with("/home"), "{}", output);
}

#[cfg(unix)]
#[tokio::test]
async fn slow_command_does_not_block_other_requests() {
    let port = free_port();
    start_gateway(port).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", port))
        .await
        .expect("ws connect");
    call(&mut ws, "1", "connect", json!({})).await;

    // Runs until the 5 s policy timeout.
    let slow = json!({
        "type": "req",
        "id": "slow",
        "method": "terminal.execute",
        "params": { "command": "tail -f /dev/null" }
    });
    ws.send(Message::Text(slow.to_string())).await.expect("send");

    let started = std::time::Instant::now();
    let health = call(&mut ws, "fast", "health", json!({})).await;
    assert_eq!(health["ok"], true);
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "health waited {:?} behind the running command",
        started.elapsed()
    );
}
