use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use reqwest::Method;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zai_async::http::{DEFAULT_SOURCE_CHANNEL, HttpCore};
use zai_async::retry::RetryWrapper;
use zai_async::{Client, ClientOptions, RequestOptions, RetryConfig, ZaiError};

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        ..RetryConfig::default()
    }
}

fn wrapper(base: &str, config: RetryConfig) -> RetryWrapper {
    let core = HttpCore::new(base, reqwest::Client::new(), DEFAULT_SOURCE_CHANNEL).unwrap();
    RetryWrapper::new(Arc::new(core), config)
}

fn streaming_body() -> reqwest::Body {
    reqwest::Body::wrap_stream(futures::stream::iter(vec![Ok::<_, std::io::Error>(
        bytes::Bytes::from_static(b"{\"k\":\"v\"}"),
    )]))
}

#[tokio::test]
async fn returns_final_response_unclassified() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/raw"))
        .respond_with(ResponseTemplate::new(504).set_body_string("gateway"))
        .expect(3)
        .mount(&server)
        .await;

    let w = wrapper(&server.uri(), fast_retry(2));
    let url = w.core().url("/raw").unwrap();
    let req = reqwest::Client::new().get(url).build().unwrap();

    let resp = w.execute(req, &CancellationToken::new()).await.unwrap();
    assert_eq!(resp.status().as_u16(), 504);
    assert_eq!(resp.text().await.unwrap(), "gateway");
}

#[tokio::test]
async fn cancellation_during_backoff_returns_promptly() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let w = wrapper(
        &server.uri(),
        RetryConfig {
            initial_backoff: Duration::from_secs(2),
            jitter: false,
            ..RetryConfig::default()
        },
    );
    let req = reqwest::Client::new()
        .get(w.core().url("/slow").unwrap())
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = w.execute(req, &cancel).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_cancelled(), "got {err:?}");
    assert!(elapsed < Duration::from_millis(150 + 200), "{elapsed:?}");
}

#[tokio::test]
async fn cancelled_before_start_sends_nothing() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = Client::new(ClientOptions {
        api_key: Some("id.secret".into()),
        base_url: Some(server.uri()),
        ..ClientOptions::default()
    })
    .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = client
        .get::<serde_json::Value>("/v1/echo", RequestOptions::with_cancel(cancel))
        .await
        .unwrap_err();
    assert!(matches!(err, ZaiError::Cancelled));
}

#[tokio::test]
async fn one_shot_body_cannot_be_replayed() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let w = wrapper(&server.uri(), fast_retry(3));
    let req = reqwest::Client::new()
        .put(w.core().url("/upload").unwrap())
        .body(streaming_body())
        .build()
        .unwrap();

    let err = w.execute(req, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ZaiError::NonRetryableBody), "got {err:?}");
}

#[tokio::test]
async fn body_factory_rebuilds_each_attempt() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let w = wrapper(&server.uri(), fast_retry(3));
    let url = w.core().url("/upload").unwrap();
    let http = reqwest::Client::new();
    let built = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&built);

    let factory = move || {
        counter.fetch_add(1, Ordering::SeqCst);
        http.put(url.clone())
            .body(streaming_body())
            .build()
            .map_err(ZaiError::from)
    };

    let resp = w
        .execute_with(Method::PUT, factory, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    assert_eq!(built.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn connection_errors_are_retried() {
    // reserve a port, then free it so connects are refused
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let mut core = HttpCore::new(
        &format!("http://{addr}"),
        reqwest::Client::new(),
        DEFAULT_SOURCE_CHANNEL,
    )
    .unwrap();
    core.add_request_middleware(move |_: &mut reqwest::Request| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<(), ZaiError>(())
    });
    let w = RetryWrapper::new(Arc::new(core), fast_retry(2));

    // POST: transport failures are retried regardless of method
    let req = reqwest::Client::new()
        .post(w.core().url("/x").unwrap())
        .body("{}")
        .build()
        .unwrap();
    let err = w.execute(req, &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, ZaiError::Connection(_)), "got {err:?}");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn statuses_outside_the_set_are_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(501))
        .expect(1)
        .mount(&server)
        .await;

    let w = wrapper(&server.uri(), fast_retry(3));
    let req = reqwest::Client::new()
        .get(w.core().url("/nope").unwrap())
        .build()
        .unwrap();
    let resp = w.execute(req, &CancellationToken::new()).await.unwrap();
    assert_eq!(resp.status().as_u16(), 501);
}
