use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, stream};
use http::header::{CACHE_CONTROL, HeaderName, LOCATION, RETRY_AFTER};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use url::Url;

use crate::body::Body;
use crate::cache::MemoryCacheStorage;
use crate::client::{Client, handler_fn};
use crate::error::{Error, ErrorCode, TimeoutPhase, TransportErrorKind};
use crate::hooks::{AfterResponse, HookOutcome, Hooks};
use crate::options::Options;
use crate::response::ResponseLike;
use crate::retry::RetryPolicy;
use crate::stream::Event;
use crate::timings::Delays;
use crate::transport::{Transport, TransportError, TransportRequest, TransportResponse};

enum Reply {
    Respond {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
    },
    Echo,
    /// Cacheable response that varies on, and echoes, the `accept` header.
    EchoAccept,
    Fail(TransportErrorKind),
    Hang,
    /// Sends the head and one body chunk, then stalls.
    Stall(&'static str),
}

fn respond(status: u16, body: &'static str) -> Reply {
    Reply::Respond {
        status,
        headers: Vec::new(),
        body,
    }
}

fn respond_with(
    status: u16,
    headers: Vec<(&'static str, &'static str)>,
    body: &'static str,
) -> Reply {
    Reply::Respond {
        status,
        headers,
        body,
    }
}

#[derive(Clone, Debug)]
struct Seen {
    method: Method,
    url: Url,
    headers: HeaderMap,
}

/// Answers attempts from a fixed script, in order.
struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    seen: Mutex<Vec<Seen>>,
}

impl ScriptedTransport {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().expect("seen lock").clone()
    }
}

fn reply(status: u16, headers: HeaderMap, body: Bytes) -> TransportResponse {
    TransportResponse {
        status: StatusCode::from_u16(status).expect("valid status"),
        headers,
        body: stream::iter((!body.is_empty()).then(|| Ok(body))).boxed(),
        remote_addr: None,
    }
}

impl Transport for ScriptedTransport {
    fn dispatch(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        self.seen.lock().expect("seen lock").push(Seen {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
        });
        let next = self
            .replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| respond(500, "script exhausted"));
        Box::pin(async move {
            match next {
                Reply::Respond {
                    status,
                    headers,
                    body,
                } => {
                    let mut map = HeaderMap::new();
                    for (name, value) in headers {
                        map.append(
                            HeaderName::from_static(name),
                            HeaderValue::from_static(value),
                        );
                    }
                    Ok(reply(status, map, Bytes::from_static(body.as_bytes())))
                }
                Reply::Echo => {
                    let mut collected = BytesMut::new();
                    if let Some(mut body) = request.body {
                        while let Some(chunk) = body.next().await {
                            let chunk = chunk.map_err(TransportError::classify)?;
                            collected.extend_from_slice(&chunk);
                        }
                    }
                    Ok(reply(200, HeaderMap::new(), collected.freeze()))
                }
                Reply::EchoAccept => {
                    tokio::task::yield_now().await;
                    let accept = request
                        .headers
                        .get("accept")
                        .map(|value| Bytes::copy_from_slice(value.as_bytes()))
                        .unwrap_or_default();
                    let mut map = HeaderMap::new();
                    map.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
                    map.insert("vary", HeaderValue::from_static("accept"));
                    Ok(reply(200, map, accept))
                }
                Reply::Fail(kind) => Err(TransportError::new(kind, "scripted failure")),
                Reply::Hang => std::future::pending().await,
                Reply::Stall(first) => Ok(TransportResponse {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    body: stream::iter([Ok(Bytes::from_static(first.as_bytes()))])
                        .chain(stream::pending())
                        .boxed(),
                    remote_addr: None,
                }),
            }
        })
    }
}

fn client_with(transport: Arc<ScriptedTransport>) -> Client {
    Client::builder()
        .transport(transport)
        .try_build()
        .expect("client should build")
}

#[tokio::test(start_paused = true)]
async fn server_errors_are_retried_until_the_limit() {
    let transport = ScriptedTransport::new(vec![
        respond(503, "busy"),
        respond(503, "busy"),
        respond(503, "busy"),
    ]);
    let client = client_with(transport.clone());

    let mut promise = client.get("http://api.test/items");
    let mut events = promise.events().expect("events available once");
    let error = promise.await.expect_err("all attempts fail");

    assert_eq!(error.code(), ErrorCode::HttpStatus);
    assert_eq!(error.status(), Some(503));
    let response = error.response().expect("status errors carry the response");
    assert_eq!(response.retry_count(), 2);
    assert_eq!(transport.seen().len(), 3);

    let mut retries = Vec::new();
    while let Some(event) = events.next().await {
        if let Event::Retry { retry_count, .. } = event {
            retries.push(retry_count);
        }
    }
    assert_eq!(retries, [1, 2]);
}

#[tokio::test(start_paused = true)]
async fn a_retry_that_succeeds_reports_its_count() {
    let transport = ScriptedTransport::new(vec![
        Reply::Fail(TransportErrorKind::ConnectionReset),
        respond(200, "ok"),
    ]);
    let client = client_with(transport.clone());

    let response = client.get("http://api.test/").await.expect("second attempt succeeds");
    assert_eq!(response.retry_count(), 1);
    assert_eq!(response.text(), "ok");
}

#[tokio::test]
async fn non_idempotent_methods_are_not_retried() {
    let transport = ScriptedTransport::new(vec![respond(503, "busy"), respond(200, "ok")]);
    let client = client_with(transport.clone());

    let error = client
        .post("http://api.test/items", Options::new().body("payload"))
        .await
        .expect_err("POST is not retried");
    assert_eq!(error.status(), Some(503));
    assert_eq!(transport.seen().len(), 1);
}

#[tokio::test]
async fn retry_after_on_413_is_capped_by_max_retry_after() {
    let transport = ScriptedTransport::new(vec![respond_with(
        413,
        vec![("retry-after", "120")],
        "too large",
    )]);
    let client = Client::builder()
        .transport(transport.clone())
        .retry(
            RetryPolicy::standard()
                .methods([Method::PUT])
                .max_retry_after(Duration::from_secs(1)),
        )
        .try_build()
        .expect("client should build");

    let error = client
        .put("http://api.test/blob", Options::new().body("x"))
        .await
        .expect_err("delay above the cap is not waited for");
    assert_eq!(error.status(), Some(413));
    assert!(error.response().expect("response").headers().contains_key(RETRY_AFTER));
    assert_eq!(transport.seen().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn status_retries_run_with_http_errors_disabled() {
    let transport = ScriptedTransport::new(vec![respond(503, "busy"), respond(200, "ok")]);
    let client = client_with(transport.clone());

    let response = client
        .request(
            "http://api.test/",
            Options::new().throw_http_errors(false).retry(1_u32),
        )
        .await
        .expect("second attempt succeeds");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.retry_count(), 1);
    assert_eq!(transport.seen().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_status_retries_deliver_the_last_response_when_http_errors_are_disabled() {
    let seen_errors = Arc::new(Mutex::new(0_usize));
    let counter = Arc::clone(&seen_errors);
    let transport = ScriptedTransport::new(vec![
        respond(503, "busy"),
        respond(503, "still busy"),
        respond(503, "still busy"),
    ]);
    let hooks = Hooks::new().before_error_fn(move |error| {
        *counter.lock().expect("counter lock") += 1;
        error
    });
    let client = client_with(transport.clone());

    let response = client
        .request(
            "http://api.test/",
            Options::new()
                .throw_http_errors(false)
                .retry(2_u32)
                .hooks(hooks),
        )
        .await
        .expect("status errors are off");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.retry_count(), 2);
    assert_eq!(response.text(), "still busy");
    assert_eq!(transport.seen().len(), 3);
    assert_eq!(*seen_errors.lock().expect("counter lock"), 0);
}

#[tokio::test(start_paused = true)]
async fn retry_after_on_413_is_waited_for_with_http_errors_disabled() {
    let transport = ScriptedTransport::new(vec![
        respond_with(413, vec![("retry-after", "2")], "too large"),
        respond(200, "ok"),
    ]);
    let client = Client::builder()
        .transport(transport.clone())
        .retry(RetryPolicy::standard().methods([Method::PUT]))
        .try_build()
        .expect("client should build");

    let started = tokio::time::Instant::now();
    let response = client
        .put(
            "http://api.test/blob",
            Options::new().body("x").throw_http_errors(false),
        )
        .await
        .expect("retried after the header delay");
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(response.retry_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn zero_retry_after_retries_without_backoff() {
    let transport = ScriptedTransport::new(vec![
        respond_with(429, vec![("retry-after", "0")], "slow down"),
        respond(200, "ok"),
    ]);
    let client = client_with(transport.clone());

    let started = tokio::time::Instant::now();
    let response = client.get("http://api.test/").await.expect("retried");
    assert_eq!(response.retry_count(), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(transport.seen().len(), 2);
}

#[tokio::test]
async fn see_other_switches_to_get_and_drops_the_body() {
    let transport = ScriptedTransport::new(vec![
        respond_with(303, vec![("location", "/done")], ""),
        respond(200, "done"),
    ]);
    let client = client_with(transport.clone());

    let response = client
        .post("http://api.test/submit", Options::new().body("form"))
        .await
        .expect("redirect followed");

    let seen = transport.seen();
    assert_eq!(seen[1].method, Method::GET);
    assert_eq!(seen[1].url.as_str(), "http://api.test/done");
    assert_eq!(response.redirect_urls().len(), 1);
    assert_eq!(response.url().as_str(), "http://api.test/done");
    assert_eq!(response.request_url().as_str(), "http://api.test/submit");
}

#[tokio::test]
async fn redirect_chains_stop_at_max_redirects() {
    let transport = ScriptedTransport::new(vec![
        respond_with(302, vec![("location", "/a")], ""),
        respond_with(302, vec![("location", "/b")], ""),
        respond(200, "unreachable"),
    ]);
    let client = client_with(transport.clone());

    let error = client
        .request("http://api.test/", Options::new().max_redirects(1))
        .await
        .expect_err("second redirect exceeds the limit");
    assert_eq!(error.code(), ErrorCode::MaxRedirects);
    assert_eq!(transport.seen().len(), 2);
}

#[tokio::test]
async fn redirect_responses_are_returned_when_not_followed() {
    let transport =
        ScriptedTransport::new(vec![respond_with(301, vec![("location", "/moved")], "")]);
    let client = client_with(transport);

    let response = client
        .request("http://api.test/", Options::new().follow_redirect(false))
        .await
        .expect("3xx is ok when redirects are off");
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert!(response.headers().contains_key(LOCATION));
}

#[tokio::test]
async fn before_request_short_circuit_skips_the_transport() {
    let transport = ScriptedTransport::new(Vec::new());
    let hooks = Hooks::new().before_request_fn(|_| {
        Ok(HookOutcome::ShortCircuit(
            ResponseLike::new(StatusCode::OK).body("from hook"),
        ))
    });
    let client = client_with(transport.clone());

    let text = client
        .request("http://api.test/", Options::new().hooks(hooks))
        .text()
        .await
        .expect("synthetic response");
    assert_eq!(text, "from hook");
    assert!(transport.seen().is_empty());
}

#[tokio::test]
async fn init_hooks_can_rewrite_options_before_normalization() {
    let transport = ScriptedTransport::new(vec![respond(200, "ok")]);
    let client = Client::builder()
        .transport(transport.clone())
        .hooks(Hooks::new().init_fn(|options| {
            options.headers.push(("x-init".to_owned(), "1".into()));
            Ok(HookOutcome::Continue)
        }))
        .try_build()
        .expect("client should build");

    client.get("http://api.test/").await.expect("request succeeds");
    assert_eq!(transport.seen()[0].headers["x-init"], "1");
}

#[tokio::test]
async fn after_response_hooks_retry_with_merged_options() {
    let transport = ScriptedTransport::new(vec![respond(401, "expired"), respond(200, "ok")]);
    let hooks = Hooks::new().after_response_fn(|response| {
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(AfterResponse::RetryWithMergedOptions(
                Options::new().header("authorization", "Bearer fresh"),
            ));
        }
        Ok(AfterResponse::Response(response))
    });
    let client = client_with(transport.clone());

    let response = client
        .request("http://api.test/", Options::new().hooks(hooks))
        .await
        .expect("second attempt succeeds");
    assert_eq!(response.retry_count(), 1);
    let seen = transport.seen();
    assert!(!seen[0].headers.contains_key("authorization"));
    assert_eq!(seen[1].headers["authorization"], "Bearer fresh");
}

#[tokio::test]
async fn after_response_retries_respect_the_retry_limit() {
    let transport = ScriptedTransport::new(vec![respond(202, "pending")]);
    let hooks = Hooks::new().after_response_fn(|_| {
        Ok(AfterResponse::RetryWithMergedOptions(Options::new()))
    });
    let client = client_with(transport.clone());

    let response = client
        .request("http://api.test/", Options::new().retry(0_u32).hooks(hooks))
        .await
        .expect("response delivered once the budget is spent");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(transport.seen().len(), 1);
}

#[tokio::test]
async fn before_error_hooks_replace_the_surfaced_error() {
    let transport = ScriptedTransport::new(vec![respond(404, "missing")]);
    let hooks = Hooks::new().before_error_fn(|error| {
        Error::validation(format!("wrapped {}", error.code()))
    });
    let client = client_with(transport);

    let error = client
        .request("http://api.test/", Options::new().hooks(hooks))
        .await
        .expect_err("404 fails");
    assert_eq!(error.code(), ErrorCode::Validation);
    assert!(error.to_string().contains("wrapped http_status"));
}

#[tokio::test]
async fn before_error_hooks_see_normalization_failures() {
    let transport = ScriptedTransport::new(Vec::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);
    let client = Client::builder()
        .transport(transport)
        .hooks(Hooks::new().before_error_fn(move |error| {
            recorded.lock().expect("record lock").push(error.code());
            error
        }))
        .try_build()
        .expect("client should build");

    let error = client
        .request("not a url", Options::new())
        .await
        .expect_err("invalid url");
    assert_eq!(error.code(), ErrorCode::Validation);
    assert_eq!(*seen.lock().expect("record lock"), [ErrorCode::Validation]);
}

#[tokio::test]
async fn unsupported_schemes_fail_before_dispatch() {
    let transport = ScriptedTransport::new(Vec::new());
    let client = client_with(transport.clone());

    let error = client
        .get("ftp://files.test/readme")
        .await
        .expect_err("ftp is not supported");
    assert_eq!(error.code(), ErrorCode::UnsupportedProtocol);
    assert!(transport.seen().is_empty());
}

#[tokio::test]
async fn handlers_wrap_the_session_in_order() {
    let transport = ScriptedTransport::new(vec![respond(200, "ok")]);
    let order = Arc::new(Mutex::new(Vec::new()));
    let outer = Arc::clone(&order);
    let inner = Arc::clone(&order);
    let client = Client::builder()
        .transport(transport.clone())
        .handler_fn(move |mut options, next| {
            outer.lock().expect("order lock").push("outer");
            options
                .headers_mut()
                .insert("x-handler", HeaderValue::from_static("outer"));
            next.run(options)
        })
        .handler_fn(move |options, next| {
            inner.lock().expect("order lock").push("inner");
            next.run(options)
        })
        .try_build()
        .expect("client should build");

    client.get("http://api.test/").await.expect("request succeeds");
    assert_eq!(*order.lock().expect("order lock"), ["outer", "inner"]);
    assert_eq!(transport.seen()[0].headers["x-handler"], "outer");
}

#[tokio::test]
async fn merged_clients_do_not_duplicate_shared_handlers() {
    let transport = ScriptedTransport::new(Vec::new());
    let shared = handler_fn(|options, next| next.run(options));
    let base = Client::builder()
        .transport(transport)
        .handler(Arc::clone(&shared))
        .try_build()
        .expect("client should build");
    let child = base
        .extend(Options::new().header("x-child", "1"))
        .expect("extend succeeds");

    let merged = base.merge(&[&child]);
    assert_eq!(merged.handlers().len(), 1);
    assert_eq!(merged.defaults().headers()["x-child"], "1");
    assert!(!base.defaults().headers().contains_key("x-child"));
}

#[tokio::test]
async fn extended_clients_layer_defaults() {
    let transport = ScriptedTransport::new(vec![respond(200, "ok")]);
    let client = client_with(transport.clone())
        .extend(Options::new().prefix_url("http://api.test/v1/"))
        .expect("extend succeeds");

    client.get("users").await.expect("request succeeds");
    assert_eq!(transport.seen()[0].url.as_str(), "http://api.test/v1/users");
}

#[tokio::test]
async fn extend_rejects_url_options() {
    let client = client_with(ScriptedTransport::new(Vec::new()));
    let error = client
        .extend(Options::new().url("http://api.test/"))
        .expect_err("defaults never carry a url");
    assert_eq!(error.code(), ErrorCode::Validation);
}

#[tokio::test]
async fn canceling_a_promise_settles_with_a_cancel_error() {
    let transport = ScriptedTransport::new(vec![Reply::Hang]);
    let client = client_with(transport);

    let promise = client.get("http://api.test/slow");
    let token = promise.cancel_token();
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        token.cancel();
    });
    let error = promise.await.expect_err("canceled");
    assert!(error.is_cancel());
    assert_eq!(error.code(), ErrorCode::Cancel);
}

#[tokio::test(start_paused = true)]
async fn request_timeouts_fail_hung_attempts() {
    let transport = ScriptedTransport::new(vec![Reply::Hang]);
    let client = client_with(transport);

    let started = tokio::time::Instant::now();
    let error = client
        .request(
            "http://api.test/slow",
            Options::new()
                .timeout(Delays::request(Duration::from_millis(50)))
                .retry(0_u32),
        )
        .await
        .expect_err("attempt times out");
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(error.code(), ErrorCode::Timeout);
    assert_eq!(error.timeout_phase(), Some(TimeoutPhase::Request));
    assert_eq!(error.transport_code(), Some(TransportErrorKind::TimedOut));
}

#[tokio::test]
async fn canceling_mid_download_stops_progress_events() {
    let transport = ScriptedTransport::new(vec![Reply::Stall("first chunk")]);
    let client = client_with(transport);

    let mut promise = client.get("http://api.test/large");
    let mut events = promise.events().expect("events available once");
    let token = promise.cancel_token();
    loop {
        match events.next().await {
            Some(Event::DownloadProgress(progress)) if progress.transferred > 0 => break,
            Some(_) => continue,
            None => panic!("session ended before the first chunk"),
        }
    }
    token.cancel();

    let error = promise.await.expect_err("canceled mid-download");
    assert!(error.is_cancel());
    while let Some(event) = events.next().await {
        assert!(
            !matches!(event, Event::DownloadProgress(_)),
            "download progress after cancel: {event:?}"
        );
    }
}

#[tokio::test]
async fn upload_progress_is_monotonic_and_completes() {
    let transport = ScriptedTransport::new(vec![Reply::Echo]);
    let client = client_with(transport);
    let chunks = ["abc", "defg", "hi"]
        .map(|chunk| Ok::<_, std::io::Error>(Bytes::from_static(chunk.as_bytes())));

    let mut promise = client.post(
        "http://api.test/upload",
        Options::new().body(Body::from_stream(stream::iter(chunks))),
    );
    let mut events = promise.events().expect("events available once");
    let response = promise.await.expect("upload succeeds");
    assert_eq!(response.text(), "abcdefghi");

    let mut uploads = Vec::new();
    while let Some(event) = events.next().await {
        if let Event::UploadProgress(progress) = event {
            uploads.push(progress);
        }
    }
    assert!(uploads.len() >= 2);
    for pair in uploads.windows(2) {
        assert!(pair[1].transferred >= pair[0].transferred);
        assert!(pair[1].percent >= pair[0].percent);
    }
    let last = uploads.last().expect("final upload event");
    assert_eq!(last.percent, 1.0);
    assert_eq!(last.transferred, 9);
    assert_eq!(last.total, Some(9));
}

#[tokio::test]
async fn fresh_responses_are_served_from_the_cache() {
    let transport = ScriptedTransport::new(vec![respond_with(
        200,
        vec![("cache-control", "max-age=60")],
        "cached body",
    )]);
    let storage = Arc::new(MemoryCacheStorage::new());
    let client = client_with(transport.clone())
        .extend(Options::new().cache(storage.clone()))
        .expect("extend succeeds");

    let first = client.get("http://api.test/doc").await.expect("first fetch");
    let second = client.get("http://api.test/doc").await.expect("cache hit");

    assert!(!first.is_from_cache());
    assert!(second.is_from_cache());
    assert_eq!(second.text(), "cached body");
    assert_eq!(second.headers()[CACHE_CONTROL], "max-age=60");
    assert_eq!(transport.seen().len(), 1);
    assert_eq!(storage.len(), 1);
}

#[tokio::test]
async fn concurrent_identical_requests_share_one_fetch() {
    let transport = ScriptedTransport::new(vec![respond_with(
        200,
        vec![("cache-control", "max-age=60")],
        "shared",
    )]);
    let storage = Arc::new(MemoryCacheStorage::new());
    let client = client_with(transport.clone())
        .extend(Options::new().cache(storage))
        .expect("extend succeeds");

    let (first, second) = tokio::join!(
        client.get("http://api.test/doc"),
        client.get("http://api.test/doc"),
    );
    let first = first.expect("first response");
    let second = second.expect("second response");

    assert_eq!(first.text(), "shared");
    assert_eq!(second.text(), "shared");
    assert!(first.is_from_cache() != second.is_from_cache());
    assert_eq!(transport.seen().len(), 1);
}

#[tokio::test]
async fn concurrent_requests_with_different_variants_fetch_separately() {
    let transport = ScriptedTransport::new(vec![Reply::EchoAccept, Reply::EchoAccept]);
    let storage = Arc::new(MemoryCacheStorage::new());
    let client = client_with(transport.clone())
        .extend(Options::new().cache(storage))
        .expect("extend succeeds");

    let (html, json) = tokio::join!(
        client.request(
            "http://api.test/doc",
            Options::new().header("accept", "text/html")
        ),
        client.request(
            "http://api.test/doc",
            Options::new().header("accept", "application/json")
        ),
    );
    let html = html.expect("html variant");
    let json = json.expect("json variant");

    assert_eq!(html.text(), "text/html");
    assert_eq!(json.text(), "application/json");
    assert!(!json.is_from_cache());
    assert_eq!(transport.seen().len(), 2);
}

#[tokio::test]
async fn no_cache_requests_do_not_reuse_a_concurrent_fetch() {
    let transport = ScriptedTransport::new(vec![Reply::EchoAccept, Reply::EchoAccept]);
    let storage = Arc::new(MemoryCacheStorage::new());
    let client = client_with(transport.clone())
        .extend(Options::new().cache(storage))
        .expect("extend succeeds");

    let (first, second) = tokio::join!(
        client.get("http://api.test/doc"),
        client.request(
            "http://api.test/doc",
            Options::new().header("cache-control", "no-cache")
        ),
    );
    first.expect("first response");
    let second = second.expect("second response");

    assert!(!second.is_from_cache());
    assert_eq!(transport.seen().len(), 2);
}

#[tokio::test]
async fn stream_sessions_deliver_the_head_then_the_body() {
    let transport = ScriptedTransport::new(vec![respond(200, "streamed body")]);
    let client = client_with(transport);

    let mut stream = client.stream("http://api.test/file", Options::new());
    let head = stream.response().await.expect("head arrives");
    assert_eq!(head.status(), StatusCode::OK);

    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk.expect("chunk"));
    }
    assert_eq!(body, b"streamed body");
}

#[tokio::test]
async fn stream_sessions_surface_http_errors_before_the_head() {
    let transport = ScriptedTransport::new(vec![respond(404, "missing")]);
    let client = client_with(transport);

    let mut stream = client.stream("http://api.test/file", Options::new());
    let error = stream.response().await.expect_err("404 fails the stream");
    assert_eq!(error.status(), Some(404));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn duplex_sessions_send_what_the_writer_writes() {
    let transport = ScriptedTransport::new(vec![Reply::Echo]);
    let client = client_with(transport);

    let (writer, mut stream) = client
        .duplex("http://api.test/echo", Options::new().method("POST"))
        .expect("duplex starts");
    writer.write("hello ").await.expect("first write");
    writer.write("world").await.expect("second write");
    writer.finish();

    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk.expect("chunk"));
    }
    assert_eq!(body, b"hello world");
}

#[tokio::test]
async fn duplex_rejects_a_preset_body() {
    let client = client_with(ScriptedTransport::new(Vec::new()));
    let error = client
        .duplex("http://api.test/echo", Options::new().body("x"))
        .expect_err("body comes from the writer");
    assert_eq!(error.code(), ErrorCode::Validation);
}

#[tokio::test]
async fn events_follow_the_session_lifecycle() {
    let transport = ScriptedTransport::new(vec![
        respond_with(307, vec![("location", "/next")], ""),
        respond(200, "abc"),
    ]);
    let client = client_with(transport);

    let mut promise = client.get("http://api.test/start");
    let events = promise.events().expect("events available once");
    promise.await.expect("request succeeds");

    let names: Vec<&str> = events
        .filter_map(|event| async move {
            match event {
                Event::Request { .. } => Some("request"),
                Event::Response(_) => Some("response"),
                Event::Redirect { .. } => Some("redirect"),
                Event::Retry { .. } => Some("retry"),
                _ => None,
            }
        })
        .collect()
        .await;
    assert_eq!(
        names,
        ["request", "response", "redirect", "request", "response"]
    );
}

#[tokio::test]
async fn metrics_count_outcomes_when_enabled() {
    let transport = ScriptedTransport::new(vec![respond(200, "ok"), respond(404, "missing")]);
    let client = Client::builder()
        .transport(transport)
        .metrics_enabled(true)
        .try_build()
        .expect("client should build");

    client.get("http://api.test/a").await.expect("success");
    client.get("http://api.test/b").await.expect_err("404");

    let snapshot = client.metrics_snapshot();
    assert_eq!(snapshot.requests_started, 2);
    assert_eq!(snapshot.requests_succeeded, 1);
    assert_eq!(snapshot.requests_failed, 1);
    assert_eq!(snapshot.status_counts.get(&200), Some(&1));
    assert_eq!(snapshot.in_flight, 0);
}

#[tokio::test]
async fn json_response_type_parses_eagerly() {
    let transport = ScriptedTransport::new(vec![respond(200, "{not json")]);
    let client = client_with(transport);

    let error = client
        .request(
            "http://api.test/",
            Options::new().response_type(crate::response::ResponseType::Json),
        )
        .await
        .expect_err("invalid json");
    assert_eq!(error.code(), ErrorCode::Parse);
}

#[tokio::test]
async fn canceling_before_dispatch_never_reaches_the_transport() {
    let transport = ScriptedTransport::new(vec![respond(200, "ok")]);
    let client = client_with(transport.clone());

    let promise = client.get("http://api.test/");
    promise.cancel();
    let error = promise.await.expect_err("canceled before the first attempt");
    assert!(error.is_cancel());
    assert!(transport.seen().is_empty());
}

#[tokio::test(start_paused = true)]
async fn retry_after_delays_are_honoured() {
    let transport = ScriptedTransport::new(vec![
        respond_with(413, vec![("retry-after", "2")], "too large"),
        respond(200, "stored"),
    ]);
    let client = client_with(transport.clone());

    let started = tokio::time::Instant::now();
    let response = client
        .put("http://api.test/blob", Options::new().body("x"))
        .await
        .expect("retried after the advertised delay");
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(response.retry_count(), 1);
    assert_eq!(transport.seen().len(), 2);
}
