//! WebSocket session integration tests

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use awful_rag::api::Generator;
use awful_rag::config::{IngestConfig, SearchConfig, SearchMode, SessionConfig};
use awful_rag::embedding::Embedder;
use awful_rag::error::{RagError, Result, SEARCH_FAILED_MESSAGE};
use awful_rag::ingest::Ingestor;
use awful_rag::pipeline::{NO_RELEVANT_INFORMATION, Pipeline, RESPONSE_SEPARATOR};
use awful_rag::search::{
    DelegatedSearch, InProcessSearch, SearchHit, SearchProvider, SearchResults,
};
use awful_rag::server::{AppState, router};
use awful_rag::vector_store::{EmbeddingSnapshot, StoreStatus};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct FixedSearch {
    hits: Vec<&'static str>,
}

#[async_trait]
impl SearchProvider for FixedSearch {
    async fn search(&self, _query: &str, k: usize) -> Result<SearchResults> {
        Ok(SearchResults {
            hits: self
                .hits
                .iter()
                .take(k)
                .map(|c| SearchHit {
                    chunk: c.to_string(),
                    similarity: Some(0.9),
                })
                .collect(),
            query_vector: None,
        })
    }

    fn default_k(&self) -> usize {
        3
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Streams its pieces with a pause before each one.
struct SlowGenerator {
    pieces: Vec<&'static str>,
    delay: Duration,
}

#[async_trait]
impl Generator for SlowGenerator {
    async fn generate(
        &self,
        _model: &str,
        _prompt: &str,
        on_increment: &mut (dyn for<'p> FnMut(&'p str) + Send),
    ) -> Result<String> {
        let mut answer = String::new();
        for piece in &self.pieces {
            tokio::time::sleep(self.delay).await;
            on_increment(piece);
            answer.push_str(piece);
        }
        Ok(answer)
    }
}

struct UnreachableEmbedder;

#[async_trait]
impl Embedder for UnreachableEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(RagError::Embedding("embedder should not be called".into()))
    }
}

struct TestServer {
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_test_server(
    search: Arc<dyn SearchProvider>,
    generator: Arc<dyn Generator>,
    session: SessionConfig,
) -> TestServer {
    let pipeline = Pipeline::new(search, generator, "test-model");
    let ingestor = Ingestor::new(std::env::temp_dir(), &IngestConfig::default());
    let state = AppState::new(pipeline, session, ingestor, StoreStatus::default());
    let app = router(state, 1 << 20);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server failed");
    });

    TestServer { addr, handle }
}

async fn connect(server: &TestServer) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/api/ws", server.addr))
        .await
        .expect("Failed to connect WebSocket");
    ws
}

async fn send(ws: &mut Client, text: &str) {
    ws.send(Message::Text(text.to_string()))
        .await
        .expect("Failed to send");
}

async fn recv_text(ws: &mut Client) -> String {
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return text.to_string(),
            Ok(Some(Ok(Message::Close(_)))) => panic!("Connection closed"),
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => panic!("Frame error: {e:?}"),
            Ok(None) => panic!("Stream ended"),
            Err(_) => panic!("Timeout waiting for frame"),
        }
    }
}

/// Asserts that no text frame arrives within `window`.
async fn assert_quiet(ws: &mut Client, window: Duration) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(window, ws.next()).await {
        panic!("unexpected frame: {text}");
    }
}

fn fast(pieces: Vec<&'static str>) -> Arc<dyn Generator> {
    Arc::new(SlowGenerator {
        pieces,
        delay: Duration::from_millis(1),
    })
}

#[tokio::test]
async fn test_fragments_then_separator_then_answer() {
    let server = start_test_server(
        Arc::new(FixedSearch {
            hits: vec!["Cats purr when content.", "Dogs bark at strangers."],
        }),
        fast(vec!["Cats ", "purr."]),
        SessionConfig::default(),
    )
    .await;
    let mut ws = connect(&server).await;

    send(&mut ws, r#"{"message":"What do cats do?"}"#).await;

    assert_eq!(recv_text(&mut ws).await, "Cats purr when content.");
    assert_eq!(recv_text(&mut ws).await, "Dogs bark at strangers.");
    assert_eq!(recv_text(&mut ws).await, RESPONSE_SEPARATOR);
    assert_eq!(recv_text(&mut ws).await, "Cats ");
    assert_eq!(recv_text(&mut ws).await, "purr.");
}

#[tokio::test]
async fn test_raw_text_is_a_query() {
    let server = start_test_server(
        Arc::new(FixedSearch { hits: vec!["only"] }),
        fast(vec!["ok"]),
        SessionConfig::default(),
    )
    .await;
    let mut ws = connect(&server).await;

    send(&mut ws, "plain question").await;
    assert_eq!(recv_text(&mut ws).await, "only");
    assert_eq!(recv_text(&mut ws).await, RESPONSE_SEPARATOR);
    assert_eq!(recv_text(&mut ws).await, "ok");
}

#[tokio::test]
async fn test_empty_corpus_reports_no_results() {
    let search = InProcessSearch::new(
        EmbeddingSnapshot::default(),
        Arc::new(UnreachableEmbedder),
        3,
    );
    let server =
        start_test_server(Arc::new(search), fast(vec!["never"]), SessionConfig::default()).await;
    let mut ws = connect(&server).await;

    send(&mut ws, r#"{"message":"anything"}"#).await;
    assert_eq!(recv_text(&mut ws).await, NO_RELEVANT_INFORMATION);
    assert_quiet(&mut ws, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_stop_suppresses_stale_output_and_session_continues() {
    let server = start_test_server(
        Arc::new(FixedSearch { hits: vec!["frag"] }),
        Arc::new(SlowGenerator {
            pieces: vec!["stale ", "stale ", "stale"],
            delay: Duration::from_millis(250),
        }),
        SessionConfig::default(),
    )
    .await;
    let mut ws = connect(&server).await;

    send(&mut ws, r#"{"message":"long question"}"#).await;
    assert_eq!(recv_text(&mut ws).await, "frag");
    assert_eq!(recv_text(&mut ws).await, RESPONSE_SEPARATOR);

    send(&mut ws, r#"{"message":"stop"}"#).await;
    assert_quiet(&mut ws, Duration::from_millis(900)).await;

    send(&mut ws, r#"{"message":"next question"}"#).await;
    assert_eq!(recv_text(&mut ws).await, "frag");
    assert_eq!(recv_text(&mut ws).await, RESPONSE_SEPARATOR);
    assert_eq!(recv_text(&mut ws).await, "stale ");
}

#[tokio::test]
async fn test_delegated_failure_keeps_session_open() {
    let search = DelegatedSearch::new(&SearchConfig {
        mode: SearchMode::Delegated,
        program: "sh".into(),
        args: vec!["-c".into(), "exit 3".into(), "search-tool".into()],
        ..SearchConfig::default()
    });
    let server =
        start_test_server(Arc::new(search), fast(vec!["never"]), SessionConfig::default()).await;
    let mut ws = connect(&server).await;

    send(&mut ws, r#"{"message":"first"}"#).await;
    assert_eq!(recv_text(&mut ws).await, SEARCH_FAILED_MESSAGE);

    send(&mut ws, r#"{"message":"second"}"#).await;
    assert_eq!(recv_text(&mut ws).await, SEARCH_FAILED_MESSAGE);
}

#[tokio::test]
async fn test_malformed_envelope_is_dropped() {
    let server = start_test_server(
        Arc::new(FixedSearch { hits: vec![] }),
        fast(vec![]),
        SessionConfig::default(),
    )
    .await;
    let mut ws = connect(&server).await;

    send(&mut ws, r#"{"message": 42}"#).await;
    send(&mut ws, r#"{"text": "no message field"}"#).await;
    assert_quiet(&mut ws, Duration::from_millis(300)).await;

    send(&mut ws, r#"{"message":"valid"}"#).await;
    assert_eq!(recv_text(&mut ws).await, NO_RELEVANT_INFORMATION);
}

#[tokio::test]
async fn test_sessions_are_isolated_by_default() {
    let server = start_test_server(
        Arc::new(FixedSearch { hits: vec![] }),
        fast(vec![]),
        SessionConfig::default(),
    )
    .await;
    let mut asker = connect(&server).await;
    let mut bystander = connect(&server).await;

    send(&mut asker, "question").await;
    assert_eq!(recv_text(&mut asker).await, NO_RELEVANT_INFORMATION);
    assert_quiet(&mut bystander, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_broadcast_mode_delivers_each_frame_once() {
    let server = start_test_server(
        Arc::new(FixedSearch {
            hits: vec!["a", "b"],
        }),
        fast(vec!["x"]),
        SessionConfig {
            broadcast: true,
            ..SessionConfig::default()
        },
    )
    .await;
    let mut asker = connect(&server).await;
    let mut other = connect(&server).await;

    send(&mut asker, "question").await;

    let mut received = Vec::new();
    for ws in [&mut asker, &mut other] {
        while let Ok(Some(Ok(Message::Text(text)))) =
            timeout(Duration::from_millis(500), ws.next()).await
        {
            received.push(text.to_string());
        }
    }
    received.sort();

    let mut expected = vec![
        "a".to_string(),
        "b".to_string(),
        RESPONSE_SEPARATOR.to_string(),
        "x".to_string(),
    ];
    expected.sort();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_client_close_is_clean() {
    let server = start_test_server(
        Arc::new(FixedSearch { hits: vec![] }),
        fast(vec![]),
        SessionConfig::default(),
    )
    .await;
    let mut ws = connect(&server).await;
    ws.close(None).await.expect("Failed to close");

    // The server answers the close handshake and the stream ends.
    let drained = timeout(Duration::from_secs(5), async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
    assert!(drained.is_ok());

    // A new session on the same server still works.
    let mut again = connect(&server).await;
    send(&mut again, "still serving?").await;
    assert_eq!(recv_text(&mut again).await, NO_RELEVANT_INFORMATION);
}
