//! Integration tests for the push channel client

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use karaevents::{
    ConnectionState, EventStreamClient, KeyOffset, ReconnectPolicy, Status, StreamSettings, keys,
};
use karastate::StateCache;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse_body(events: &[serde_json::Value]) -> String {
    let mut body = String::from(": hello\n\n");
    for event in events {
        body.push_str(&format!("data: {}\n\n", event));
    }
    body
}

fn sse_response(events: &[serde_json::Value]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(sse_body(events))
}

fn song(uuid: &str, status: &str) -> serde_json::Value {
    json!({ "name": format!("Song {uuid} (Official Video)"), "uuid": uuid, "status": status })
}

fn settings_for(base: &str, max_attempts: u32) -> StreamSettings {
    let base = Url::parse(base).unwrap();
    StreamSettings::new(&base, "/sse")
        .unwrap()
        .with_reconnect(ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts: Some(max_attempts),
            stable_after: Duration::from_secs(5),
        })
        .with_idle_timeout(Duration::from_secs(5))
}

fn settings(server: &MockServer, max_attempts: u32) -> StreamSettings {
    settings_for(&server.uri(), max_attempts)
}

/// Serveur SSE minimal : envoie `first` sur la première connexion, puis
/// garde chaque connexion ouverte sans rien envoyer.
async fn stalling_server(first: String) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let first = first.clone();
            tokio::spawn(async move {
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;
                let mut response = String::from(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n",
                );
                if index == 0 {
                    response.push_str(&format!("{:x}\r\n{}\r\n", first.len(), first));
                }
                let _ = socket.write_all(response.as_bytes()).await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });

    (base, connections)
}

#[tokio::test]
async fn test_events_populate_cache_and_survive_disconnect() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sse"))
        .and(header("accept", "text/event-stream"))
        .respond_with(sse_response(&[
            json!({ "type": "QueueUpdated", "queue": [song("B", "Ready"), song("C", "InProgress")] }),
            json!({ "type": "CurrentSongUpdated", "current_song": song("A", "Success") }),
            json!({ "type": "KeyChange", "current_key": -1 }),
            json!({ "type": "SomethingNew", "payload": 1 }),
            json!({ "type": "TogglePlayback" }),
        ]))
        .mount(&mock_server)
        .await;

    let cache = StateCache::new();
    // Zéro tentative de reconnexion : le client abandonne dès la première coupure.
    let client = EventStreamClient::new(cache.clone(), settings(&mock_server, 0)).unwrap();
    let state = client.subscribe_state();

    tokio::time::timeout(Duration::from_secs(5), client.run(CancellationToken::new()))
        .await
        .expect("client should give up");

    let current = cache.value(&keys::CURRENT_SONG).unwrap();
    assert_eq!(current.uuid, "A");
    assert_eq!(current.status, Status::Success);
    assert_eq!(current.formatted_name, "Song A");

    let queue = cache.value(&keys::QUEUE).unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].uuid, "B");

    assert_eq!(cache.value(&keys::KEY_OFFSET), Some(KeyOffset(-1)));
    assert_eq!(cache.value(&keys::PLAYBACK), Some(false));

    assert!(state.borrow().has_given_up());
}

#[tokio::test]
async fn test_unreachable_stream_gives_up_after_bounded_retries() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;

    let cache = StateCache::new();
    let client = EventStreamClient::new(cache.clone(), settings(&mock_server, 2)).unwrap();
    let state = client.subscribe_state();

    tokio::time::timeout(Duration::from_secs(5), client.run(CancellationToken::new()))
        .await
        .expect("client should give up");

    match &*state.borrow() {
        ConnectionState::Error { message, retry_in } => {
            assert!(message.contains("503"));
            assert_eq!(*retry_in, None);
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert!(!cache.contains(&keys::CURRENT_SONG));
}

#[tokio::test]
async fn test_reconnect_overwrites_stale_values() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(sse_response(&[
            json!({ "type": "CurrentSongUpdated", "current_song": song("A", "Success") }),
            json!({ "type": "KeyChange", "current_key": 2 }),
        ]))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(sse_response(&[
            json!({ "type": "CurrentSongUpdated", "current_song": song("B", "InProgress") }),
        ]))
        .with_priority(2)
        .mount(&mock_server)
        .await;

    let cache = StateCache::new();
    let client = EventStreamClient::new(cache.clone(), settings(&mock_server, 3)).unwrap();
    let state = client.subscribe_state();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(client.run(shutdown.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if cache.value(&keys::CURRENT_SONG).is_some_and(|s| s.uuid == "B") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("second session should push song B");

    // La clé poussée lors de la première session est conservée.
    assert_eq!(cache.value(&keys::KEY_OFFSET), Some(KeyOffset(2)));

    shutdown.cancel();
    handle.await.unwrap();
    assert_eq!(*state.borrow(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_null_push_is_distinct_from_unknown() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(sse_response(&[
            json!({ "type": "CurrentSongUpdated", "current_song": null }),
        ]))
        .mount(&mock_server)
        .await;

    let cache = StateCache::new();
    assert!(cache.get(&keys::CURRENT_SONG).is_none());

    let client = EventStreamClient::new(cache.clone(), settings(&mock_server, 0)).unwrap();
    client.run(CancellationToken::new()).await;

    let entry = cache.get(&keys::CURRENT_SONG).expect("entry should exist");
    assert!(entry.is_cleared());
}

#[tokio::test]
async fn test_stream_closed_without_frames_counts_towards_max_attempts() {
    let mock_server = MockServer::start().await;

    // 200 puis fermeture immédiate, à chaque fois
    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(""),
        )
        .expect(3)
        .mount(&mock_server)
        .await;

    let cache = StateCache::new();
    let client = EventStreamClient::new(cache.clone(), settings(&mock_server, 2)).unwrap();
    let state = client.subscribe_state();

    tokio::time::timeout(Duration::from_secs(5), client.run(CancellationToken::new()))
        .await
        .expect("client should give up");

    match &*state.borrow() {
        ConnectionState::Error { message, retry_in } => {
            assert!(message.contains("closed by server"));
            assert_eq!(*retry_in, None);
        }
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn test_idle_stream_reconnects_and_keeps_cached_values() {
    let first = format!("data: {}\n\n", json!({ "type": "KeyChange", "current_key": 3 }));
    let (base, connections) = stalling_server(first).await;

    let cache = StateCache::new();
    let settings = settings_for(&base, 3).with_idle_timeout(Duration::from_millis(200));
    let client = EventStreamClient::new(cache.clone(), settings).unwrap();
    let state = client.subscribe_state();

    tokio::time::timeout(Duration::from_secs(10), client.run(CancellationToken::new()))
        .await
        .expect("client should give up");

    // Première session saine, puis trois sessions muettes
    assert_eq!(connections.load(Ordering::SeqCst), 4);
    assert_eq!(cache.value(&keys::KEY_OFFSET), Some(KeyOffset(3)));
    match &*state.borrow() {
        ConnectionState::Error { message, retry_in } => {
            assert!(message.contains("no data received"), "{message}");
            assert_eq!(*retry_in, None);
        }
        other => panic!("unexpected state {other:?}"),
    }
}
