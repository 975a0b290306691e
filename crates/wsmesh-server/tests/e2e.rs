//! End-to-end scenarios against in-process nodes on ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use wsmesh_client::{BridgeClient, ClientConfig, ClientEvent};
use wsmesh_core::fleet::NodeEntry;
use wsmesh_core::packet::{close, routes};
use wsmesh_core::{Packet, Response};
use wsmesh_server::{MessageServer, ServerConfig};

async fn start_server(
    mutate: impl FnOnce(&mut ServerConfig),
) -> (Arc<MessageServer>, SocketAddr) {
    let mut config = ServerConfig::new(0);
    config.host = "127.0.0.1".into();
    mutate(&mut config);
    let server = MessageServer::new(config).unwrap();
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

async fn connect_client(
    addr: SocketAddr,
    mutate: impl FnOnce(&mut ClientConfig),
) -> BridgeClient {
    let mut config = ClientConfig::new(format!("ws://{addr}"));
    mutate(&mut config);
    let client = BridgeClient::connect(config);
    for _ in 0..200 {
        if client.is_connected() {
            return client;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("client failed to connect to {addr}");
}

type RawClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn raw_client(addr: SocketAddr) -> RawClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("raw connect");
    ws
}

async fn raw_send(ws: &mut RawClient, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("raw send");
}

/// Read frames until a close frame arrives; returns its code.
async fn raw_close_code(ws: &mut RawClient) -> u16 {
    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => panic!("no close frame within deadline"),
            frame = ws.next() => match frame {
                Some(Ok(Message::Close(Some(frame)))) => return frame.code.into(),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => panic!("connection ended without a close frame"),
            }
        }
    }
}

async fn next_matching(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
    mut pred: impl FnMut(&ClientEvent) -> bool,
    secs: u64,
) -> ClientEvent {
    let deadline = tokio::time::sleep(Duration::from_secs(secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => panic!("expected event did not arrive"),
            event = events.recv() => {
                let event = event.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        }
    }
}

async fn register_login(server: &Arc<MessageServer>) {
    server
        .set_router("login", |srv, sess, pkt| async move {
            let uid = pkt
                .message
                .get("uid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            srv.bind_uid(&sess, uid, true).await;
            srv.response(&sess, &pkt, Response::ok(json!("bound")));
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn e1_round_trip_echo() {
    let (server, addr) = start_server(|c| c.password = Some("p".into())).await;
    server
        .set_router("echo", |srv, sess, pkt| async move {
            let upper = pkt
                .message
                .as_str()
                .unwrap_or_default()
                .to_uppercase();
            srv.response(&sess, &pkt, Response::ok(Value::String(upper)));
        })
        .await
        .unwrap();

    let client = connect_client(addr, |c| c.password = Some("p".into())).await;
    let response = client.call("echo", json!("hi")).await.unwrap();
    assert_eq!(response.code, 200);
    assert_eq!(response.data, json!("HI"));

    client.disconnect();
    server.close().await;
}

#[tokio::test]
async fn e2_heartbeat_echo() {
    let (server, addr) = start_server(|_| {}).await;

    let mut ws = raw_client(addr).await;
    raw_send(
        &mut ws,
        json!({"route": routes::HEARTICK, "reqId": 7, "message": 1000}),
    )
    .await;

    let echoed = loop {
        match ws.next().await.expect("stream ended").expect("frame") {
            Message::Text(text) => break text.to_string(),
            _ => continue,
        }
    };
    let packet = Packet::from_value(serde_json::from_str(&echoed).unwrap()).unwrap();
    assert_eq!(packet.route, routes::HEARTICK);
    assert_eq!(packet.req_id, 7);
    assert_eq!(packet.message, json!(1000));

    server.close().await;
}

#[tokio::test]
async fn e3_duplicate_req_id_closes_4003() {
    let (server, addr) = start_server(|_| {}).await;
    server
        .set_router("echo", |srv, sess, pkt| async move {
            srv.response(&sess, &pkt, Response::ok(json!("ok")));
        })
        .await
        .unwrap();

    let mut ws = raw_client(addr).await;
    let packet = json!({"route": "echo", "reqId": 1, "message": "a"});
    raw_send(&mut ws, packet.clone()).await;
    raw_send(&mut ws, packet).await;

    assert_eq!(raw_close_code(&mut ws).await, close::REPEAT);
    server.close().await;
}

#[tokio::test]
async fn unknown_route_closes_4006() {
    let (server, addr) = start_server(|_| {}).await;

    let mut ws = raw_client(addr).await;
    raw_send(&mut ws, json!({"route": "nope", "reqId": 1, "message": 1})).await;
    assert_eq!(raw_close_code(&mut ws).await, close::ROUTE);
    server.close().await;
}

#[tokio::test]
async fn malformed_packet_closes_4002() {
    let (server, addr) = start_server(|_| {}).await;

    let mut ws = raw_client(addr).await;
    raw_send(&mut ws, json!({"route": "echo", "reqId": 1})).await;
    assert_eq!(raw_close_code(&mut ws).await, close::FORMAT);
    server.close().await;
}

#[tokio::test]
async fn e4_uid_displacement() {
    let (server, addr) = start_server(|_| {}).await;
    register_login(&server).await;

    let client_a = connect_client(addr, |_| {}).await;
    let mut a_events = client_a.events();
    let response = client_a.call("login", json!({"uid": "u"})).await.unwrap();
    assert!(response.is_ok());

    let client_b = connect_client(addr, |_| {}).await;
    let mut b_pushes = client_b.on("who");
    let response = client_b.call("login", json!({"uid": "u"})).await.unwrap();
    assert!(response.is_ok());

    // The displaced session is closed with 4009.
    next_matching(
        &mut a_events,
        |e| matches!(e, ClientEvent::Closed { code } if *code == close::NEWBIND),
        5,
    )
    .await;

    // The binding now points at B.
    assert_eq!(server.session_count().await, 1);
    assert!(server.push_session("u", "who", json!("ping")).await);
    let pushed = tokio::time::timeout(Duration::from_secs(5), b_pushes.recv())
        .await
        .expect("push timeout")
        .expect("push channel closed");
    assert_eq!(pushed, json!("ping"));

    client_a.disconnect();
    client_b.disconnect();
    server.close().await;
}

#[tokio::test]
async fn unsent_request_times_out_with_504() {
    // Nothing listens on this address; the request is dropped on the wire
    // but still resolves through the timeout sweep.
    let client = BridgeClient::connect({
        let mut config = ClientConfig::new("ws://127.0.0.1:9");
        config.timeout_ms = 1000;
        config.conntick_secs = 600;
        config
    });
    let response = client.call("echo", json!("hi")).await.unwrap();
    assert_eq!(response.code, 504);
    assert_eq!(response.data, json!("Gateway Timeout"));
    client.disconnect();
}

fn node_entry(addr: SocketAddr) -> NodeEntry {
    NodeEntry {
        host: addr.ip().to_string(),
        inip: addr.ip().to_string(),
        port: addr.port(),
        ssls: false,
    }
}

async fn wait_cluster(server: &Arc<MessageServer>, group: &str) {
    for _ in 0..200 {
        if server.cluster_connected(group).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("cluster group {group} never connected");
}

#[tokio::test]
async fn e6_cluster_p2p_fans_out_and_only_the_host_delivers() {
    let secret = || Some("s".to_string());
    let (n2, n2_addr) = start_server(|c| c.secret = secret()).await;
    let (n3, _n3_addr) = start_server(|c| c.secret = secret()).await;
    register_login(&n2).await;

    // The target uid lives on n2 only.
    let client2 = connect_client(n2_addr, |_| {}).await;
    let mut events = client2.on("evt");
    client2.call("login", json!({"uid": "u"})).await.unwrap();

    let n3_addr = n3.local_addr().unwrap();
    let (n1, _) = start_server(|c| {
        c.secret = secret();
        c.links
            .insert("group".into(), vec![node_entry(n2_addr), node_entry(n3_addr)]);
    })
    .await;
    wait_cluster(&n1, "group").await;

    n1.push_cluster_session("group", "u", "evt", json!({"x": 1}), None)
        .await
        .unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("cluster delivery timeout")
        .expect("listener closed");
    assert_eq!(delivered, json!({"x": 1}));
    // n3 verified the envelope and no-oped; its peer link is still healthy.
    assert!(n1.cluster_connected("group").await);

    client2.disconnect();
    n1.close().await;
    n2.close().await;
    n3.close().await;
}

#[tokio::test]
async fn remote_call_returns_the_handler_response() {
    let (n2, n2_addr) = start_server(|c| c.secret = Some("s".into())).await;
    n2.set_remote("sum", |srv, sess, pkt| async move {
        let total: i64 = pkt
            .message
            .as_array()
            .map(|items| items.iter().filter_map(Value::as_i64).sum())
            .unwrap_or_default();
        srv.response(&sess, &pkt, Response::ok(json!(total)));
    })
    .await
    .unwrap();

    let (n1, _) = start_server(|c| {
        c.secret = Some("s".into());
        c.links.insert("group".into(), vec![node_entry(n2_addr)]);
    })
    .await;
    wait_cluster(&n1, "group").await;

    let response = n1
        .call_remote_for_result("group", "sum", json!([1, 2, 3]), None)
        .await
        .unwrap();
    assert_eq!(response.code, 200);
    assert_eq!(response.data, json!(6));

    n1.close().await;
    n2.close().await;
}

#[tokio::test]
async fn e7_reconnect_retries_until_the_server_returns() {
    let (server, addr) = start_server(|_| {}).await;
    server
        .set_router("echo", |srv, sess, pkt| async move {
            srv.response(&sess, &pkt, Response::ok(json!("ok")));
        })
        .await
        .unwrap();

    let client = connect_client(addr, |c| c.conntick_secs = 1).await;
    let mut events = client.events();

    server.close().await;

    // Retry counts grow while the server is down.
    let mut last_count = 0;
    for _ in 0..2 {
        let event = next_matching(
            &mut events,
            |e| matches!(e, ClientEvent::Retry { .. }),
            10,
        )
        .await;
        if let ClientEvent::Retry { count } = event {
            assert!(count > last_count);
            last_count = count;
        }
    }

    // Restart on the same port; the client opens again on its own.
    let (server, _) = start_server(|c| c.port = addr.port()).await;
    server
        .set_router("echo", |srv, sess, pkt| async move {
            srv.response(&sess, &pkt, Response::ok(json!("ok")));
        })
        .await
        .unwrap();

    next_matching(&mut events, |e| matches!(e, ClientEvent::Open), 15).await;
    let response = client.call("echo", json!("hi")).await.unwrap();
    assert!(response.is_ok());

    client.disconnect();
    server.close().await;
}
