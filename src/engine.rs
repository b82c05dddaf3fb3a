//! One session from first attempt to final response: hooks, the cache,
//! dispatch under phase timers, redirects and retries.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use http::header::{ACCEPT_ENCODING, AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};
use url::Url;

use crate::body::{Body, BodyStream, ContentDecoder};
use crate::cache::{
    CacheCoordinator, CacheLookup, CacheStorage, CachedResponse, FlightGuard, cache_key,
    is_cacheable_request,
};
use crate::content_encoding::should_decode_content_encoded_body;
use crate::cookies::{attach_cookies, store_cookies};
use crate::error::{BoxError, Error, ErrorCode, ErrorKind, TimeoutPhase};
use crate::hooks::{
    BeforeErrorHook, run_after_response, run_before_error, run_before_redirect,
    run_before_request, run_before_retry,
};
use crate::metrics::ClientMetrics;
use crate::options::NormalizedOptions;
use crate::progress::ProgressTracker;
use crate::redirect;
use crate::response::{Response, ResponseHead, ResponseLike, ResponseType, is_response_ok};
use crate::stream::{Event, EventSink};
use crate::timings::{Delays, PhaseTimers, Timings};
use crate::transport::{
    PhaseReporter, ResponseBodyStream, Signal, Transport, TransportError, TransportRequest,
};
use crate::util::{basic_authorization, ensure_header, redact_url_for_logs};

const ACCEPT_ENCODING_VALUE: &str = "gzip, deflate, br, zstd";

/// Shared machinery every session of a client dispatches through.
#[derive(Clone)]
pub(crate) struct SessionRuntime {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) coordinator: CacheCoordinator,
    pub(crate) metrics: ClientMetrics,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    Promise,
    Stream,
}

pub(crate) type ResponseBody = BoxStream<'static, Result<Bytes, Error>>;

/// Final head of a stream session plus the body still being read.
pub(crate) struct StreamingResponse {
    pub(crate) head: ResponseHead,
    pub(crate) body: ResponseBody,
}

enum Delivered {
    Buffered(Response),
    Streaming(StreamingResponse),
}

enum Step {
    Redirect(NormalizedOptions),
    Retry(NormalizedOptions),
    Done(Delivered),
}

enum Outcome {
    Step(Step),
    Stream {
        head: ResponseHead,
        body: ResponseBodyStream,
        decoder: Option<Box<dyn ContentDecoder>>,
        download: ProgressTracker,
    },
}

enum Source {
    Live(ResponseBodyStream),
    Buffered(Bytes),
}

struct Received {
    status: StatusCode,
    headers: HeaderMap,
    remote_addr: Option<SocketAddr>,
    source: Source,
    from_cache: bool,
    progress_reported: bool,
}

impl Received {
    fn synthetic(response: ResponseLike) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            remote_addr: None,
            source: Source::Buffered(response.body),
            from_cache: false,
            progress_reported: false,
        }
    }

    fn cached(entry: CachedResponse) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers,
            remote_addr: None,
            source: Source::Buffered(entry.body),
            from_cache: true,
            progress_reported: false,
        }
    }
}

struct PendingFlight {
    guard: FlightGuard,
    stale: Option<CachedResponse>,
    storage: Arc<dyn CacheStorage>,
    request_headers: HeaderMap,
}

/// Timers, timing marks and progress of one attempt.
struct AttemptState {
    timers: PhaseTimers,
    timings: Timings,
    reporter: PhaseReporter,
    signals: mpsc::UnboundedReceiver<Signal>,
    upload: ProgressTracker,
    upload_error: Option<BoxError>,
    head_received: bool,
    events: EventSink,
}

impl AttemptState {
    fn new(limits: Delays, events: EventSink) -> Self {
        let (reporter, signals) = PhaseReporter::channel();
        Self {
            timers: PhaseTimers::new(limits),
            timings: Timings::start(),
            reporter,
            signals,
            upload: ProgressTracker::new(None),
            upload_error: None,
            head_received: false,
            events,
        }
    }

    fn on_signal(&mut self, signal: Signal) {
        self.timers.touch();
        match signal {
            Signal::PhaseStarted(phase) => self.timers.arm(phase),
            Signal::PhaseFinished(TimeoutPhase::Send) => self.upload_finished(),
            Signal::PhaseFinished(phase) => {
                self.timers.disarm(phase);
                self.timings.mark(phase);
            }
            Signal::Uploaded(len) => {
                let progress = self.upload.advance(len);
                self.events.emit(Event::UploadProgress(progress));
            }
            Signal::UploadFailed(error) => self.upload_error = Some(error),
        }
    }

    fn drain_signals(&mut self) {
        while let Ok(signal) = self.signals.try_recv() {
            self.on_signal(signal);
        }
    }

    fn upload_finished(&mut self) {
        self.timers.disarm(TimeoutPhase::Send);
        self.timings.mark(TimeoutPhase::Send);
        self.events.emit(Event::UploadProgress(self.upload.finish()));
        if !self.head_received {
            self.timers.arm(TimeoutPhase::Response);
        }
    }

    fn on_head(&mut self) {
        self.head_received = true;
        self.drain_signals();
        for phase in [
            TimeoutPhase::Lookup,
            TimeoutPhase::Connect,
            TimeoutPhase::SecureConnect,
            TimeoutPhase::Send,
            TimeoutPhase::Response,
        ] {
            self.timers.disarm(phase);
        }
        self.timings.mark(TimeoutPhase::Response);
        self.timers.arm(TimeoutPhase::Read);
    }

    fn body_finished(&mut self) {
        for phase in [TimeoutPhase::Read, TimeoutPhase::Socket, TimeoutPhase::Request] {
            self.timers.disarm(phase);
        }
        self.timings.mark(TimeoutPhase::Read);
    }

    /// Polls `future` until it completes, the session is canceled, or the
    /// earliest armed timer fires. Losing the race drops `future`.
    async fn race<F: Future>(
        &mut self,
        cancel: &CancellationToken,
        future: F,
    ) -> Result<F::Output, Error> {
        let mut future = std::pin::pin!(future);
        loop {
            let deadline = self.timers.next_deadline();
            let expiry = async move {
                match deadline {
                    Some((phase, at)) => {
                        tokio::time::sleep_until(at).await;
                        phase
                    }
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::cancel()),
                output = &mut future => return Ok(output),
                Some(signal) = self.signals.recv() => self.on_signal(signal),
                phase = expiry => {
                    self.timings.mark_error();
                    return Err(self.timers.expired(phase));
                }
            }
        }
    }
}

/// Request body wrapper reporting the send phase and upload progress.
struct UploadStream {
    inner: BodyStream,
    reporter: PhaseReporter,
    started: bool,
    finished: bool,
}

impl UploadStream {
    fn new(inner: BodyStream, reporter: PhaseReporter) -> Self {
        Self {
            inner,
            reporter,
            started: false,
            finished: false,
        }
    }
}

impl Stream for UploadStream {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if !this.started {
            this.started = true;
            this.reporter.started(TimeoutPhase::Send);
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.reporter.uploaded(chunk.len());
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                let message = error.to_string();
                this.reporter.upload_failed(error);
                Poll::Ready(Some(Err(message.into())))
            }
            Poll::Ready(None) => {
                if !this.finished {
                    this.finished = true;
                    this.reporter.finished(TimeoutPhase::Send);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn read_error(error: TransportError) -> Error {
    Error::new(ErrorKind::Read {
        kind: Some(error.kind),
        source: Box::new(error),
    })
}

fn decode_error(source: BoxError) -> Error {
    Error::new(ErrorKind::Read { kind: None, source })
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn content_encoding(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("identity"))
}

fn wants_decoding<'a>(
    options: &NormalizedOptions,
    status: StatusCode,
    headers: &'a HeaderMap,
) -> Option<&'a str> {
    if !options.decompress() || !should_decode_content_encoded_body(options.method(), status) {
        return None;
    }
    content_encoding(headers)
}

fn decode_body(
    options: &NormalizedOptions,
    status: StatusCode,
    headers: &HeaderMap,
    raw: Bytes,
) -> Result<Bytes, Error> {
    match wants_decoding(options, status, headers) {
        Some(encoding) => options
            .body_codec()
            .decode(encoding, raw)
            .map_err(decode_error),
        None => Ok(raw),
    }
}

fn http_status_error(response: Response) -> Error {
    let status = response.status();
    Error::new(ErrorKind::HttpStatus {
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("Unknown").to_owned(),
        method: response.options().method().to_string(),
        url: redact_url_for_logs(response.url()),
    })
    .with_response(response)
}

/// Runs `beforeError` hooks; cancellation surfaces untouched.
pub(crate) async fn surface_error(hooks: &[Arc<dyn BeforeErrorHook>], error: Error) -> Error {
    if error.is_cancel() {
        return error;
    }
    run_before_error(hooks, error).await
}

pub(crate) struct Session {
    runtime: SessionRuntime,
    options: NormalizedOptions,
    mode: Mode,
    cancel: CancellationToken,
    events: EventSink,
    preset: Option<ResponseLike>,
    request_url: Url,
    redirect_urls: Vec<Url>,
    retry_count: u32,
}

impl Session {
    pub(crate) fn new(
        runtime: SessionRuntime,
        options: NormalizedOptions,
        mode: Mode,
        cancel: CancellationToken,
        events: EventSink,
    ) -> Self {
        let request_url = options.url().clone();
        Self {
            runtime,
            options,
            mode,
            cancel,
            events,
            preset: None,
            request_url,
            redirect_urls: Vec::new(),
            retry_count: 0,
        }
    }

    /// Serves `response` for the first attempt instead of hitting the network.
    pub(crate) fn with_preset(mut self, response: Option<ResponseLike>) -> Self {
        self.preset = response;
        self
    }

    pub(crate) async fn run_promise(mut self) -> Result<Response, Error> {
        match self.run().await? {
            Delivered::Buffered(response) => Ok(response),
            Delivered::Streaming(_) => Err(Error::validation(
                "stream sessions cannot resolve a response promise",
            )),
        }
    }

    pub(crate) async fn run_stream(mut self) -> Result<StreamingResponse, Error> {
        match self.run().await? {
            Delivered::Streaming(streaming) => Ok(streaming),
            Delivered::Buffered(response) => {
                let body = response.body().clone();
                let head = response.head().clone();
                Ok(StreamingResponse {
                    head,
                    body: stream::iter((!body.is_empty()).then(|| Ok(body))).boxed(),
                })
            }
        }
    }

    async fn run(&mut self) -> Result<Delivered, Error> {
        match self.drive().await {
            Ok(delivered) => Ok(delivered),
            Err(mut error) => {
                error.attach_options(&Arc::new(self.options.clone()));
                Err(surface_error(&self.options.hooks().before_error, error).await)
            }
        }
    }

    async fn drive(&mut self) -> Result<Delivered, Error> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::cancel());
            }
            let span = info_span!(
                "reqwire.request",
                method = %self.options.method(),
                url = %redact_url_for_logs(self.options.url()),
                attempt = self.retry_count + 1,
                redirects = self.redirect_urls.len(),
            );
            let error = match self.attempt().instrument(span).await {
                Ok(Step::Done(delivered)) => return Ok(delivered),
                Ok(Step::Redirect(next) | Step::Retry(next)) => {
                    self.options = next;
                    continue;
                }
                Err(error) => error,
            };
            if error.is_cancel() || self.cancel.is_cancelled() {
                return Err(Error::cancel());
            }

            let Some(delay) = self.retry_delay(&error).await? else {
                return self.settle(error);
            };
            let retry_count = self.retry_count + 1;
            warn!(
                retry_count,
                delay_ms = delay.as_millis() as u64,
                error_code = %error.code(),
                error = %error,
                "retrying request"
            );
            self.events.emit(Event::Retry { retry_count, delay });
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::cancel()),
                _ = tokio::time::sleep(delay) => {}
            }
            run_before_retry(&mut self.options, Some(&error), retry_count, &self.cancel).await?;
            self.retry_count = retry_count;
            self.runtime.metrics.record_retry();
        }
    }

    /// Out of retries: a status failure with `throw_http_errors` off still
    /// delivers its response.
    fn settle(&self, mut error: Error) -> Result<Delivered, Error> {
        if error.code() == ErrorCode::HttpStatus && !self.options.throw_http_errors() {
            if let Some(response) = error.take_response() {
                return Ok(Delivered::Buffered(response));
            }
        }
        Err(error)
    }

    async fn retry_delay(&self, error: &Error) -> Result<Option<Duration>, Error> {
        if self.options.body().is_some_and(|body| !body.is_replayable()) {
            return Ok(None);
        }
        self.options
            .retry()
            .next_delay(
                self.retry_count + 1,
                self.options.method(),
                error,
                self.options.timeout(),
            )
            .await
    }

    async fn attempt(&mut self) -> Result<Step, Error> {
        let preset = match self.preset.take() {
            Some(response) => Some(response),
            None => run_before_request(&mut self.options, &self.cancel).await?,
        };
        let options = Arc::new(self.options.clone());
        let mut state = AttemptState::new(*options.timeout(), self.events.clone());

        match self.exchange(&mut state, &options, preset).await {
            Ok(Outcome::Step(step)) => Ok(step),
            Ok(Outcome::Stream {
                head,
                body,
                decoder,
                download,
            }) => {
                self.events
                    .emit(Event::DownloadProgress(download.snapshot()));
                let reader = BodyReader {
                    state,
                    body,
                    decoder,
                    download,
                    cancel: self.cancel.clone(),
                    options,
                    events: self.events.clone(),
                    done: false,
                };
                Ok(Step::Done(Delivered::Streaming(StreamingResponse {
                    head,
                    body: reader.into_stream(),
                })))
            }
            Err(mut error) => {
                state.timings.mark_error();
                error.attach_options(&options);
                error.attach_timings(state.timings.clone());
                Err(error)
            }
        }
    }

    async fn exchange(
        &mut self,
        state: &mut AttemptState,
        options: &Arc<NormalizedOptions>,
        preset: Option<ResponseLike>,
    ) -> Result<Outcome, Error> {
        let cancel = self.cancel.clone();
        let mut flight = None;
        let mut received = match preset {
            Some(response) => Received::synthetic(response),
            None => self.fetch(state, options, &mut flight).await?,
        };

        if let Some(pending) = flight {
            let raw = self.collect_body(state, &mut received).await?;
            let fetched = CachedResponse {
                status: received.status,
                headers: received.headers.clone(),
                body: raw,
                url: options.url().clone(),
                stored_at: SystemTime::now(),
                vary: Vec::new(),
            };
            let completion = pending.guard.complete(
                pending.storage.as_ref(),
                options.method(),
                &pending.request_headers,
                fetched,
                pending.stale,
            );
            if let Some(entry) = state.race(&cancel, completion).await?? {
                received = Received::cached(entry);
                received.progress_reported = true;
            }
        }

        let mut head = self.response_head(options, &received, &state.timings);
        if let Some(jar) = options.cookie_jar() {
            let storing = store_cookies(
                jar.as_ref(),
                options.url(),
                &head.headers,
                options.ignore_invalid_cookies(),
            );
            state.race(&cancel, storing).await??;
        }
        self.events.emit(Event::Response(head.clone()));

        if let Some(mut next) =
            redirect::resolve(options, head.status, &head.headers, &self.redirect_urls)?
        {
            drop(received);
            debug!(
                status = head.status.as_u16(),
                location = %redact_url_for_logs(next.url()),
                "following redirect"
            );
            self.redirect_urls.push(next.url().clone());
            run_before_redirect(&mut next, &head, &cancel).await?;
            self.events.emit(Event::Redirect {
                response: head,
                next: Box::new(next.clone()),
            });
            self.runtime.metrics.record_redirect();
            return Ok(Outcome::Step(Step::Redirect(next)));
        }

        if self.mode == Mode::Stream {
            if options.throw_http_errors() && !is_response_ok(head.status, options.redirect().follow())
            {
                let response = Response::new(head, Bytes::new(), Bytes::new(), Arc::clone(options));
                return Err(http_status_error(response));
            }
            let decoder = match wants_decoding(options, head.status, &head.headers) {
                Some(encoding) => Some(
                    options
                        .body_codec()
                        .decoder(encoding)
                        .map_err(decode_error)?,
                ),
                None => None,
            };
            let download = ProgressTracker::new(content_length(&head.headers));
            let body = match received.source {
                Source::Live(body) => body,
                Source::Buffered(bytes) => {
                    stream::iter((!bytes.is_empty()).then(|| Ok(bytes))).boxed()
                }
            };
            return Ok(Outcome::Stream {
                head,
                body,
                decoder,
                download,
            });
        }

        let raw = self.collect_body(state, &mut received).await?;
        let body = decode_body(options, head.status, &head.headers, raw.clone())?;
        head.timings = state.timings.clone();
        let response = Response::new(head, raw, body, Arc::clone(options));

        let after_response = options.hooks().after_response.clone();
        let (response, retry) = run_after_response(&after_response, response, &cancel).await?;
        if let Some(overrides) = retry {
            if self.retry_count < options.retry().limit_value() {
                let retry_count = self.retry_count + 1;
                let mut next = options.merge(overrides)?;
                debug!(retry_count, "retrying with merged options");
                run_before_retry(&mut next, None, retry_count, &cancel).await?;
                self.retry_count = retry_count;
                self.runtime.metrics.record_retry();
                self.events.emit(Event::Retry {
                    retry_count,
                    delay: Duration::ZERO,
                });
                return Ok(Outcome::Step(Step::Retry(next)));
            }
        }

        if !response.is_ok() {
            return Err(http_status_error(response));
        }
        if options.response_type() == ResponseType::Json && !response.body().is_empty() {
            if let Err(source) = serde_json::from_slice::<serde_json::Value>(response.body()) {
                return Err(Error::new(ErrorKind::Parse {
                    response_type: ResponseType::Json.as_str(),
                    source: Box::new(source),
                })
                .with_response(response));
            }
        }
        Ok(Outcome::Step(Step::Done(Delivered::Buffered(response))))
    }

    /// Prepares the wire request, consults the cache and dispatches.
    async fn fetch(
        &self,
        state: &mut AttemptState,
        options: &NormalizedOptions,
        flight: &mut Option<PendingFlight>,
    ) -> Result<Received, Error> {
        let cancel = &self.cancel;
        let url = options.url();
        let method = options.method();
        if !self.runtime.transport.supports_scheme(url.scheme()) {
            return Err(Error::new(ErrorKind::UnsupportedProtocol {
                protocol: format!("{}:", url.scheme()),
            }));
        }

        let mut headers = options.headers().clone();
        if let Some(jar) = options.cookie_jar() {
            state
                .race(cancel, attach_cookies(jar.as_ref(), url, &mut headers))
                .await??;
        }
        if !headers.contains_key(AUTHORIZATION)
            && (options.username().is_some() || options.password().is_some())
        {
            let value = basic_authorization(
                options.username().unwrap_or_default(),
                options.password().unwrap_or_default(),
            )?;
            headers.insert(AUTHORIZATION, value);
        }
        if options.decompress() {
            ensure_header(&mut headers, ACCEPT_ENCODING, ACCEPT_ENCODING_VALUE);
        }

        if self.mode == Mode::Promise {
            if let Some(storage) = options.cache() {
                if is_cacheable_request(method, &headers) {
                    let key = cache_key(method, url);
                    let lookup = self.runtime.coordinator.lookup(storage, &key, &mut headers);
                    match state.race(cancel, lookup).await?? {
                        CacheLookup::Hit(entry) => {
                            self.runtime.metrics.record_cache_hit();
                            return Ok(Received::cached(entry));
                        }
                        CacheLookup::Miss { flight: guard, stale } => {
                            *flight = Some(PendingFlight {
                                guard,
                                stale,
                                storage: Arc::clone(storage),
                                request_headers: headers.clone(),
                            });
                        }
                    }
                }
            }
        }

        let body_len = options.body().and_then(Body::len);
        let body = match options.body() {
            Some(body) if body_len != Some(0) => Some(body.open().ok_or_else(|| {
                Error::new(ErrorKind::Upload {
                    source: "request body stream was already consumed".into(),
                })
            })?),
            _ => None,
        };
        state.upload = ProgressTracker::new(body_len);
        self.events.emit(Event::Request {
            method: method.clone(),
            url: url.clone(),
        });
        state.timers.arm(TimeoutPhase::Request);
        state.timers.arm(TimeoutPhase::Socket);
        let body = body.map(|stream| UploadStream::new(stream, state.reporter.clone()).boxed());
        if body.is_none() {
            state.upload_finished();
        }
        debug!(has_body = body.is_some(), body_len = ?body_len, "dispatching attempt");

        let request = TransportRequest {
            method: method.clone(),
            url: url.clone(),
            headers,
            body,
            body_len,
            http2: options.http2(),
            phases: state.reporter.clone(),
        };
        let dispatched = state
            .race(cancel, self.runtime.transport.dispatch(request))
            .await?;
        let response = match dispatched {
            Ok(response) => response,
            Err(error) => {
                state.drain_signals();
                return Err(match state.upload_error.take() {
                    Some(source) => Error::new(ErrorKind::Upload { source }),
                    None => Error::new(ErrorKind::Request {
                        kind: error.kind,
                        method: method.to_string(),
                        url: redact_url_for_logs(url),
                        source: Box::new(error),
                    }),
                });
            }
        };
        state.on_head();

        Ok(Received {
            status: response.status,
            headers: response.headers,
            remote_addr: response.remote_addr,
            source: Source::Live(response.body),
            from_cache: false,
            progress_reported: false,
        })
    }

    /// Reads the whole raw body, reporting download progress.
    async fn collect_body(
        &self,
        state: &mut AttemptState,
        received: &mut Received,
    ) -> Result<Bytes, Error> {
        let source = std::mem::replace(&mut received.source, Source::Buffered(Bytes::new()));
        let raw = match source {
            Source::Buffered(bytes) => {
                if !received.progress_reported {
                    let mut download = ProgressTracker::new(Some(bytes.len() as u64));
                    download.advance(bytes.len());
                    self.events.emit(Event::DownloadProgress(download.finish()));
                }
                bytes
            }
            Source::Live(mut body) => {
                let mut download = ProgressTracker::new(content_length(&received.headers));
                self.events
                    .emit(Event::DownloadProgress(download.snapshot()));
                let mut collected = BytesMut::new();
                while let Some(chunk) = state.race(&self.cancel, body.next()).await? {
                    let chunk = chunk.map_err(read_error)?;
                    state.timers.touch();
                    collected.extend_from_slice(&chunk);
                    self.events
                        .emit(Event::DownloadProgress(download.advance(chunk.len())));
                }
                self.events.emit(Event::DownloadProgress(download.finish()));
                collected.freeze()
            }
        };
        state.body_finished();
        received.source = Source::Buffered(raw.clone());
        received.progress_reported = true;
        Ok(raw)
    }

    fn response_head(
        &self,
        options: &NormalizedOptions,
        received: &Received,
        timings: &Timings,
    ) -> ResponseHead {
        ResponseHead {
            status: received.status,
            headers: received.headers.clone(),
            url: options.url().clone(),
            request_url: self.request_url.clone(),
            redirect_urls: self.redirect_urls.clone(),
            retry_count: self.retry_count,
            is_from_cache: received.from_cache,
            remote_addr: received.remote_addr,
            timings: timings.clone(),
        }
    }
}

/// Body of a stream session, read under the attempt's remaining timers.
struct BodyReader {
    state: AttemptState,
    body: ResponseBodyStream,
    decoder: Option<Box<dyn ContentDecoder>>,
    download: ProgressTracker,
    cancel: CancellationToken,
    options: Arc<NormalizedOptions>,
    events: EventSink,
    done: bool,
}

impl BodyReader {
    fn into_stream(self) -> ResponseBody {
        stream::unfold(self, |mut reader| async move {
            let item = reader.next_chunk().await?;
            Some((item, reader))
        })
        .boxed()
    }

    async fn next_chunk(&mut self) -> Option<Result<Bytes, Error>> {
        while !self.done {
            match self.read().await {
                Ok(Some(chunk)) if chunk.is_empty() => continue,
                Ok(Some(chunk)) => return Some(Ok(chunk)),
                Ok(None) => self.done = true,
                Err(mut error) => {
                    self.done = true;
                    self.state.timings.mark_error();
                    error.attach_options(&self.options);
                    error.attach_timings(self.state.timings.clone());
                    let error = surface_error(&self.options.hooks().before_error, error).await;
                    return Some(Err(error));
                }
            }
        }
        None
    }

    async fn read(&mut self) -> Result<Option<Bytes>, Error> {
        let next = self.state.race(&self.cancel, self.body.next()).await?;
        match next {
            Some(Ok(chunk)) => {
                self.state.timers.touch();
                let progress = self.download.advance(chunk.len());
                self.events.emit(Event::DownloadProgress(progress));
                match &mut self.decoder {
                    Some(decoder) => decoder.push(&chunk).map(Some).map_err(decode_error),
                    None => Ok(Some(chunk)),
                }
            }
            Some(Err(error)) => Err(read_error(error)),
            None => {
                self.done = true;
                self.state.body_finished();
                self.events
                    .emit(Event::DownloadProgress(self.download.finish()));
                match &mut self.decoder {
                    Some(decoder) => decoder.finish().map(Some).map_err(decode_error),
                    None => Ok(None),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_stream_reports_send_phase_and_chunks() {
        let (reporter, mut signals) = PhaseReporter::channel();
        let inner = stream::iter(vec![
            Ok::<_, BoxError>(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cde")),
        ])
        .boxed();
        let uploaded: Vec<_> = UploadStream::new(inner, reporter).collect().await;
        assert_eq!(uploaded.len(), 2);

        let mut seen = Vec::new();
        while let Ok(signal) = signals.try_recv() {
            seen.push(match signal {
                Signal::PhaseStarted(phase) => format!("start:{phase}"),
                Signal::PhaseFinished(phase) => format!("finish:{phase}"),
                Signal::Uploaded(len) => format!("chunk:{len}"),
                Signal::UploadFailed(_) => "failed".to_owned(),
            });
        }
        assert_eq!(seen, ["start:send", "chunk:2", "chunk:3", "finish:send"]);
    }

    #[tokio::test(start_paused = true)]
    async fn race_reports_the_first_expired_phase() {
        let mut state = AttemptState::new(
            Delays {
                response: Some(Duration::from_millis(20)),
                request: Some(Duration::from_millis(100)),
                ..Delays::default()
            },
            EventSink::default(),
        );
        state.timers.arm(TimeoutPhase::Request);
        state.upload_finished();

        let error = state
            .race(&CancellationToken::new(), std::future::pending::<()>())
            .await
            .expect_err("timer fires");
        assert_eq!(error.timeout_phase(), Some(TimeoutPhase::Response));
    }

    #[tokio::test]
    async fn race_prefers_cancellation() {
        let mut state = AttemptState::new(Delays::default(), EventSink::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = state
            .race(&cancel, std::future::ready(()))
            .await
            .expect_err("canceled");
        assert!(error.is_cancel());
    }

    #[test]
    fn identity_encoding_is_not_decoded() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, http::HeaderValue::from_static("identity"));
        assert_eq!(content_encoding(&headers), None);
        headers.insert(CONTENT_ENCODING, http::HeaderValue::from_static(" gzip "));
        assert_eq!(content_encoding(&headers), Some("gzip"));
    }
}
