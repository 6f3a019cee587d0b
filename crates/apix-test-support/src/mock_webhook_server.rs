use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One received delivery attempt, captured for assertions.
#[derive(Debug, Clone)]
pub struct ReceivedDelivery {
    pub headers: HeaderMap,
    pub body: Bytes,
}

struct Inner {
    /// Status codes returned in order, one per request; the last entry
    /// repeats once exhausted. Lets a test script e.g. `[500, 500, 200]`
    /// to exercise a retry-then-succeed sequence (spec.md §8 scenario 3).
    responses: Vec<StatusCode>,
    received: Mutex<Vec<ReceivedDelivery>>,
    cursor: AtomicUsize,
}

/// A fake webhook receiver standing in for a tenant's HTTP endpoint in
/// Delivery Engine / Retry Manager tests. Started on an ephemeral port,
/// records every delivery it receives, and replays a scripted sequence
/// of status codes.
#[derive(Clone)]
pub struct MockWebhookServer {
    inner: Arc<Inner>,
    pub addr: SocketAddr,
}

impl MockWebhookServer {
    /// Bind on an ephemeral local port and start serving in the
    /// background. `responses` is the scripted status-code sequence.
    pub async fn start(responses: Vec<StatusCode>) -> Self {
        let inner = Arc::new(Inner {
            responses: if responses.is_empty() {
                vec![StatusCode::OK]
            } else {
                responses
            },
            received: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/webhook", post(handle_delivery))
            .with_state(inner.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self { inner, addr }
    }

    pub fn url(&self) -> String {
        format!("http://{}/webhook", self.addr)
    }

    pub async fn received(&self) -> Vec<ReceivedDelivery> {
        self.inner.received.lock().await.clone()
    }

    pub async fn delivery_count(&self) -> usize {
        self.inner.received.lock().await.len()
    }
}

async fn handle_delivery(
    State(inner): State<Arc<Inner>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    inner
        .received
        .lock()
        .await
        .push(ReceivedDelivery { headers, body });
    let idx = inner.cursor.fetch_add(1, Ordering::SeqCst);
    let last = inner.responses.len() - 1;
    inner.responses[idx.min(last)]
}
