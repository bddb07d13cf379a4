//! Integration tests for assetgate

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use assetgate::config::{Config, GatewayMode};
use assetgate::gateway::Gateway;
use assetgate::server::GatewayServer;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// In-process stand-in for a dev server (or the host application).
///
/// Plain requests answer `<label>:<path>`; WebSocket upgrades echo text as
/// `echo:<text>`, echo binary unchanged and close on the text `bye`.
struct FakeServer {
    addr: SocketAddr,
    tasks: Arc<Mutex<Vec<AbortHandle>>>,
}

impl FakeServer {
    async fn start(label: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tasks: Arc<Mutex<Vec<AbortHandle>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_tasks = Arc::clone(&tasks);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn_tasks = Arc::clone(&accept_tasks);
                let conn = tokio::spawn(async move {
                    let service =
                        service_fn(move |req| fake_handler(req, label, Arc::clone(&conn_tasks)));
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await;
                });
                accept_tasks.lock().push(conn.abort_handle());
            }
        });
        tasks.lock().push(accept.abort_handle());

        Self { addr, tasks }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Drop the listener and every open connection at once
    fn crash(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

async fn fake_handler(
    mut req: Request<Incoming>,
    label: &'static str,
    tasks: Arc<Mutex<Vec<AbortHandle>>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if let Some(key) = req.headers().get("sec-websocket-key").map(|k| k.as_bytes().to_vec()) {
        let protocol = req.headers().get("sec-websocket-protocol").cloned();
        let on_upgrade = hyper::upgrade::on(&mut req);
        let relay = tokio::spawn(async move {
            let Ok(upgraded) = on_upgrade.await else {
                return;
            };
            let mut ws =
                WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) if text.as_str() == "bye" => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    Message::Text(text) => {
                        let _ = ws.send(Message::text(format!("echo:{}", text.as_str()))).await;
                    }
                    Message::Binary(data) => {
                        let _ = ws.send(Message::Binary(data)).await;
                    }
                    _ => {}
                }
            }
        });
        tasks.lock().push(relay.abort_handle());

        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header("upgrade", "websocket")
            .header("connection", "Upgrade")
            .header("sec-websocket-accept", derive_accept_key(&key));
        if let Some(protocol) = protocol {
            response = response.header("sec-websocket-protocol", protocol);
        }
        return Ok(response.body(Full::new(Bytes::new())).unwrap());
    }

    let seen_host = header_or_empty(&req, "host");
    let seen_forwarded_host = header_or_empty(&req, "x-forwarded-host");
    let seen_request_id = header_or_empty(&req, "x-request-id");
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("connection", "keep-alive")
        .header("keep-alive", "timeout=5")
        .header("x-upstream", label)
        .header("x-seen-host", seen_host)
        .header("x-seen-forwarded-host", seen_forwarded_host)
        .header("x-seen-request-id", seen_request_id)
        .body(Full::new(Bytes::from(format!("{}:{}", label, req.uri().path()))))
        .unwrap())
}

fn header_or_empty(req: &Request<Incoming>, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

struct RunningGateway {
    gateway: Arc<Gateway>,
    addr: SocketAddr,
    _shutdown_tx: watch::Sender<bool>,
}

async fn start_gateway(config: Config) -> RunningGateway {
    let gateway = Gateway::new(config).unwrap();
    gateway.start().await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr = "127.0.0.1:0".parse().unwrap();
    let server = GatewayServer::bind(addr, Arc::clone(&gateway), shutdown_rx)
        .await
        .unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run());

    RunningGateway {
        gateway,
        addr,
        _shutdown_tx: shutdown_tx,
    }
}

fn dev_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::for_mode(GatewayMode::DevProxied);
    config.dev_server.start = false;
    config.assets.hotfile = dir.path().join("public").join("hot");
    config.assets.probe_timeout_ms = 200;
    config.proxy.hotfile_refresh_ms = 60_000;
    config.proxy.connect_timeout_ms = 1000;
    config.proxy.request_timeout_secs = 5;
    config
}

/// Send a simple HTTP request and get the raw response
async fn http_get(addr: SocketAddr, path: &str, host: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut response))
        .await
        .expect("response within timeout")
        .unwrap();
    response
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn header_of<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split("\r\n\r\n").next()?;
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

#[tokio::test]
async fn test_proxies_build_tool_paths_to_dev_server() {
    let dir = tempfile::tempdir().unwrap();
    let dev = FakeServer::start("dev").await;
    let app = FakeServer::start("app").await;

    let mut config = dev_config(&dir);
    config.server.app_upstream = Some(app.url());
    let running = start_gateway(config).await;
    running.gateway.hotfile().write(&dev.url()).unwrap();

    let response = http_get(running.addr, "/@vite/client", "app.test:8000").await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert!(response.contains("dev:/@vite/client"));
    assert_eq!(header_of(&response, "x-upstream"), Some("dev"));
    assert_eq!(header_of(&response, "x-seen-forwarded-host"), Some("app.test:8000"));
    assert_eq!(header_of(&response, "x-seen-host"), Some(dev.addr.to_string().as_str()));
    assert!(header_of(&response, "x-seen-request-id").is_some_and(|id| !id.is_empty()));

    // Encoded '@' takes the same route
    let response = http_get(running.addr, "/%40vite/client", "app.test:8000").await;
    assert_eq!(header_of(&response, "x-upstream"), Some("dev"));

    // Everything else goes to the application
    let response = http_get(running.addr, "/dashboard", "app.test:8000").await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains("app:/dashboard"));
}

#[tokio::test]
async fn test_upstream_keep_alive_is_not_relayed() {
    let dir = tempfile::tempdir().unwrap();
    let dev = FakeServer::start("dev").await;
    let running = start_gateway(dev_config(&dir)).await;
    running.gateway.hotfile().write(&dev.url()).unwrap();

    let response = http_get(running.addr, "/src/main.ts", "localhost").await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert!(header_of(&response, "keep-alive").is_none());
    assert_ne!(header_of(&response, "connection"), Some("keep-alive"));
    assert_eq!(header_of(&response, "x-upstream"), Some("dev"));
}

#[tokio::test]
async fn test_pass_through_without_app_upstream_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let running = start_gateway(dev_config(&dir)).await;

    let response = http_get(running.addr, "/dashboard", "localhost").await;
    assert_eq!(status_of(&response), 404);
    assert_eq!(header_of(&response, "x-gateway-error"), Some("NO_UPSTREAM"));
}

#[tokio::test]
async fn test_websocket_tunnel_keeps_frame_types() {
    let dir = tempfile::tempdir().unwrap();
    let dev = FakeServer::start("dev").await;
    let running = start_gateway(dev_config(&dir)).await;
    running.gateway.hotfile().write(&dev.url()).unwrap();

    let mut request = format!("ws://{}/vite-hmr?token=abc", running.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("sec-websocket-protocol", "vite-hmr".parse().unwrap());
    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(response.headers().get("sec-websocket-protocol").unwrap(), "vite-hmr");

    ws.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
    assert_eq!(
        ws.next().await.unwrap().unwrap(),
        Message::text(r#"echo:{"type":"ping"}"#)
    );

    ws.send(Message::binary(vec![1u8, 2, 3, 255])).await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::binary(vec![1u8, 2, 3, 255]));

    // Dev server closes, the tunnel closes the client
    ws.send(Message::text("bye")).await.unwrap();
    let mut closed = false;
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Close(_)) => closed = true,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(closed);
}

#[tokio::test]
async fn test_websocket_upgrade_to_dead_dev_server_is_bad_gateway() {
    let dir = tempfile::tempdir().unwrap();
    let dev = FakeServer::start("dev").await;
    let running = start_gateway(dev_config(&dir)).await;
    running.gateway.hotfile().write(&dev.url()).unwrap();

    // Prime the cache, then kill the dev server
    let response = http_get(running.addr, "/@vite/client", "localhost").await;
    assert_eq!(status_of(&response), 200);
    dev.crash();

    let result = tokio_tungstenite::connect_async(format!("ws://{}/vite-hmr", running.addr)).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }
        other => panic!("expected HTTP error response, got {:?}", other.map(|(_, r)| r.status())),
    }
}

#[tokio::test]
async fn test_dev_server_crash_then_stale_hotfile_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let dev = FakeServer::start("dev").await;
    let running = start_gateway(dev_config(&dir)).await;
    running.gateway.hotfile().write(&dev.url()).unwrap();

    let response = http_get(running.addr, "/@vite/client", "localhost").await;
    assert_eq!(status_of(&response), 200);

    dev.crash();

    let response = http_get(running.addr, "/@vite/client", "localhost").await;
    assert_eq!(status_of(&response), 502, "{}", response);
    assert_eq!(header_of(&response, "x-gateway-error"), Some("UPSTREAM_CONNECT_FAILED"));
    // Clients never see the upstream address
    assert!(!response.contains(&dev.addr.to_string()));

    let response = http_get(running.addr, "/@vite/client", "localhost").await;
    assert_eq!(status_of(&response), 503, "{}", response);
    assert_eq!(header_of(&response, "x-gateway-error"), Some("DEV_SERVER_UNAVAILABLE"));
    assert!(!dir.path().join("public").join("hot").exists());
}

#[tokio::test]
async fn test_production_serves_manifest_files_only() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = dir.path().join("dist");
    std::fs::create_dir_all(bundle.join("assets")).unwrap();
    std::fs::write(bundle.join("assets/main.a1b2.js"), "export const app = 1;").unwrap();
    std::fs::write(bundle.join("assets/main.c3d4.css"), "body{margin:0}").unwrap();
    std::fs::write(bundle.join("secret.txt"), "do not serve").unwrap();
    let manifest = bundle.join("manifest.json");
    std::fs::write(
        &manifest,
        r#"{"src/main.ts": {"file": "assets/main.a1b2.js", "css": ["assets/main.c3d4.css"], "isEntry": true}}"#,
    )
    .unwrap();

    let mut config = Config::for_mode(GatewayMode::Production);
    config.assets.manifest = manifest;
    config.assets.bundle_dir = bundle;
    let running = start_gateway(config).await;

    let urls = running.gateway.asset_urls("src/main.ts").await.unwrap();
    assert_eq!(urls.scripts, vec!["/static/assets/main.a1b2.js"]);
    assert_eq!(urls.styles, vec!["/static/assets/main.c3d4.css"]);
    assert!(urls.preloads.is_empty());

    let response = http_get(running.addr, "/static/assets/main.a1b2.js", "localhost").await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert!(response.contains("export const app = 1;"));
    assert_eq!(
        header_of(&response, "content-type"),
        Some("text/javascript; charset=utf-8")
    );

    let response = http_get(running.addr, "/static/secret.txt", "localhost").await;
    assert_eq!(status_of(&response), 404);
    assert_eq!(header_of(&response, "x-gateway-error"), Some("ASSET_NOT_IN_MANIFEST"));
}

#[tokio::test]
async fn test_discovery_endpoint_in_dev_direct_mode() {
    let dir = tempfile::tempdir().unwrap();
    let dev = FakeServer::start("dev").await;
    let mut config = dev_config(&dir);
    config.mode = GatewayMode::DevDirect;
    let running = start_gateway(config).await;
    running.gateway.hotfile().write(&dev.url()).unwrap();

    let response = http_get(running.addr, "/__assetgate", "localhost").await;
    assert_eq!(status_of(&response), 200);
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let json: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
    assert_eq!(json["mode"], "dev-direct");
    assert_eq!(json["url"], dev.url());
    assert_eq!(json["name"], "assetgate");
}

#[tokio::test]
async fn test_gateway_spawns_dev_server_and_cleans_up_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    // The fake server answers; the child only announces its address
    let dev = FakeServer::start("dev").await;
    let mut config = dev_config(&dir);
    config.dev_server.start = true;
    config.dev_server.command = Some(format!(
        r#"sh -c "echo 'VITE v5.0.0  ready in 300 ms'; echo '  Local:   {}/'; sleep 30""#,
        dev.url()
    ));
    config.dev_server.startup_timeout_secs = 10;
    config.dev_server.startup_grace_ms = 100;
    config.dev_server.shutdown_grace_period_secs = 2;
    let hotfile = config.assets.hotfile.clone();

    let running = start_gateway(config).await;
    assert_eq!(std::fs::read_to_string(&hotfile).unwrap().trim(), dev.url());

    let handle = running.gateway.supervisor().current().unwrap();
    assert!(handle.is_owned());
    assert!(handle.output().iter().any(|l| l.contains("ready in 300 ms")));

    let response = http_get(running.addr, "/@vite/client", "localhost").await;
    assert_eq!(status_of(&response), 200);

    running.gateway.shutdown().await;
    assert_eq!(running.gateway.mode(), GatewayMode::Disabled);
    assert!(!hotfile.exists());
    assert!(!running.gateway.supervisor().is_alive(&handle).await);

    // Disabled gateway passes everything through
    let response = http_get(running.addr, "/@vite/client", "localhost").await;
    assert_eq!(header_of(&response, "x-gateway-error"), Some("NO_UPSTREAM"));
}

#[tokio::test]
async fn test_dev_server_base_path_is_not_doubled() {
    let dir = tempfile::tempdir().unwrap();
    let dev = FakeServer::start("dev").await;
    let mut config = dev_config(&dir);
    config.dev_server.start = true;
    config.dev_server.command = Some(format!(
        r#"sh -c "echo '  Local:   {}/static/'; sleep 30""#,
        dev.url()
    ));
    config.dev_server.startup_timeout_secs = 10;
    config.dev_server.startup_grace_ms = 100;
    config.dev_server.shutdown_grace_period_secs = 2;
    let hotfile = config.assets.hotfile.clone();

    let running = start_gateway(config).await;
    assert_eq!(std::fs::read_to_string(&hotfile).unwrap().trim(), dev.url());

    let response = http_get(running.addr, "/static/@vite/client", "localhost").await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert!(response.contains("dev:/static/@vite/client"), "{}", response);

    running.gateway.shutdown().await;
}

#[tokio::test]
async fn test_stalled_upstream_body_is_cut_at_request_timeout() {
    let dir = tempfile::tempdir().unwrap();

    // Answers every request with a head and one chunk, then stalls
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dev_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n")
                    .await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });

    let mut config = dev_config(&dir);
    config.proxy.request_timeout_secs = 1;
    let running = start_gateway(config).await;
    running.gateway.hotfile().write(&format!("http://{}", dev_addr)).unwrap();

    let mut stream = TcpStream::connect(running.addr).await.unwrap();
    stream
        .write_all(b"GET /@vite/client HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let mut received = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "client connection still open after the request timeout");
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(String::from_utf8_lossy(&received).contains("hello"));

    // The aborted exchange no longer holds up draining
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(running.gateway.in_flight(), 0);
}

#[tokio::test]
async fn test_launch_on_taken_port_spawns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let marker = dir.path().join("spawned");

    let mut config = dev_config(&dir);
    config.dev_server.start = true;
    config.dev_server.command = Some(format!(
        r#"sh -c "touch '{}'; echo 'Local: http://127.0.0.1:1'; sleep 30""#,
        marker.display()
    ));
    let hotfile = config.assets.hotfile.clone();
    let gateway = Gateway::new(config).unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr = taken.local_addr().unwrap();
    let result = GatewayServer::launch(addr, Arc::clone(&gateway), shutdown_rx).await;

    assert!(result.is_err());
    assert_eq!(gateway.mode(), GatewayMode::Disabled);
    assert!(gateway.supervisor().current().is_none());
    assert!(!marker.exists());
    assert!(!hotfile.exists());
}
