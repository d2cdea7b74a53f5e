//! In-process Moonraker websocket server
//!
//! Answers JSON-RPC requests through a handler closure, records every
//! request, and lets tests push notifications or drop connections.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

/// How the server answers one request
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error(i64, String),
    /// Answer after a delay, letting later requests overtake this one
    Delayed(Duration, Value),
    /// Never answer
    Silent,
}

type Handler = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

#[derive(Debug, Clone)]
enum Command {
    Push(Value),
    Close,
}

/// Mock Moonraker server bound to an ephemeral local port
pub struct MockMoonrakerServer {
    pub addr: SocketAddr,
    commands: broadcast::Sender<Command>,
    requests: Arc<Mutex<Vec<Value>>>,
    connections: Arc<Mutex<usize>>,
    task: JoinHandle<()>,
}

impl MockMoonrakerServer {
    /// Start a server that answers through `handler`
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (commands, _) = broadcast::channel(64);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0));
        let handler: Handler = Arc::new(handler);

        let task = tokio::spawn({
            let commands = commands.clone();
            let requests = requests.clone();
            let connections = connections.clone();
            async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    let Ok(ws) = accept_async(tcp).await else {
                        continue;
                    };
                    *connections.lock().unwrap() += 1;
                    tokio::spawn(serve(
                        ws,
                        handler.clone(),
                        commands.subscribe(),
                        requests.clone(),
                    ));
                }
            }
        });

        Self {
            addr,
            commands,
            requests,
            connections,
            task,
        }
    }

    /// Start a server that behaves like a small single-extruder printer
    pub async fn printer(objects: Vec<&'static str>, status: Value) -> Self {
        Self::start(move |method, _| match method {
            "printer.objects.list" => Reply::Result(json!({ "objects": objects })),
            "printer.objects.subscribe" | "printer.objects.query" => {
                Reply::Result(json!({ "eventtime": 1000.0, "status": status }))
            }
            "printer.gcode.script" => Reply::Result(json!("ok")),
            _ => Reply::Error(-32601, format!("Method not found: {method}")),
        })
        .await
    }

    /// Full websocket URL of the server
    pub fn url(&self) -> String {
        format!("ws://{}/websocket", self.addr)
    }

    /// Bare `host:port` form
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// Send a notification to every connected client
    pub fn push(&self, method: &str, params: Value) {
        let _ = self.commands.send(Command::Push(json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        })));
    }

    /// Push a `notify_status_update` carrying `status`
    pub fn push_status(&self, status: Value) {
        self.push("notify_status_update", json!([status, 1001.0]));
    }

    /// Close every open connection from the server side
    pub fn close_connections(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn connection_count(&self) -> usize {
        *self.connections.lock().unwrap()
    }

    /// Every request received so far, in arrival order
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    /// Params of every request for `method`
    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|r| r["method"] == method)
            .map(|r| r["params"].clone())
            .collect()
    }

    /// Wait until a request for `method` has arrived
    pub async fn wait_for_request(&self, method: &str) -> Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(params) = self.requests_for(method).pop() {
                    return params;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {method} request arrived"))
    }
}

impl Drop for MockMoonrakerServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    ws: WebSocketStream<TcpStream>,
    handler: Handler,
    mut commands: broadcast::Receiver<Command>,
    requests: Arc<Mutex<Vec<Value>>>,
) {
    let (mut sink, mut stream) = ws.split();
    let (delayed_tx, mut delayed_rx) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(request) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    requests.lock().unwrap().push(request.clone());

                    let id = request["id"].clone();
                    let method = request["method"].as_str().unwrap_or_default();
                    let response = match handler(method, &request["params"]) {
                        Reply::Result(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                        Reply::Error(code, message) => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": code, "message": message }
                        }),
                        Reply::Delayed(delay, result) => {
                            let delayed = delayed_tx.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let response = json!({ "jsonrpc": "2.0", "id": id, "result": result });
                                let _ = delayed.send(response.to_string());
                            });
                            continue;
                        }
                        Reply::Silent => continue,
                    };
                    if sink.send(Message::Text(response.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            Some(text) = delayed_rx.recv() => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            command = commands.recv() => match command {
                Ok(Command::Push(message)) => {
                    if sink.send(Message::Text(message.to_string())).await.is_err() {
                        break;
                    }
                }
                Ok(Command::Close) | Err(broadcast::error::RecvError::Closed) => {
                    let _ = sink.close().await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}
