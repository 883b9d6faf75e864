// src/test_utils/mock_webhook_server.rs
use axum::{http::StatusCode, routing::post, Json, Router};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Clone)]
struct WebhookState {
    status: StatusCode,
    received: Arc<Mutex<Vec<Value>>>,
}

async fn notify_handler(
    axum::extract::State(state): axum::extract::State<WebhookState>,
    Json(payload): Json<Value>,
) -> StatusCode {
    state.received.lock().unwrap().push(payload);
    state.status
}

/// Accepts JSON posts on `/notify` and answers every one with `status`.
pub struct MockWebhookServer {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    pub received: Arc<Mutex<Vec<Value>>>,
}

impl MockWebhookServer {
    pub async fn start(status: u16) -> Self {
        let state = WebhookState {
            status: StatusCode::from_u16(status).unwrap(),
            received: Arc::new(Mutex::new(Vec::new())),
        };
        let received = state.received.clone();

        let app = Router::new()
            .route("/notify", post(notify_handler))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap_or_else(|e| log::error!("Mock webhook server error: {}", e));
        });

        Self {
            addr,
            shutdown_tx,
            received,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/notify", self.addr)
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}
