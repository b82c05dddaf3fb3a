use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::stream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::body::{Body, BodyCodec};
use crate::cache::CacheCoordinator;
use crate::config::ClientProfile;
use crate::engine::{Mode, Session, SessionRuntime, surface_error};
use crate::error::Error;
use crate::hooks::{Hooks, run_init};
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::options::{Defaults, NormalizedOptions, Options, RequestInput, normalize};
use crate::promise::ResponsePromise;
use crate::redirect::RedirectPolicy;
use crate::response::{Response, ResponseLike};
use crate::retry::RetryPolicy;
use crate::stream::{EventSink, RequestStream, RequestWriter};
use crate::timings::Delays;
use crate::transport::{HyperTransport, Transport};
use crate::util::lock_unpoisoned;

/// Middleware around promise-style requests.
///
/// A handler receives the normalized options and decides whether, and with
/// which options, to call the rest of the chain through `next`.
pub trait Handler: Send + Sync {
    fn handle(
        &self,
        options: NormalizedOptions,
        next: Next,
    ) -> BoxFuture<'static, Result<Response, Error>>;
}

struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(NormalizedOptions, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, Error>> + Send + 'static,
{
    fn handle(
        &self,
        options: NormalizedOptions,
        next: Next,
    ) -> BoxFuture<'static, Result<Response, Error>> {
        Box::pin((self.0)(options, next))
    }
}

pub fn handler_fn<F, Fut>(handler: F) -> Arc<dyn Handler>
where
    F: Fn(NormalizedOptions, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, Error>> + Send + 'static,
{
    Arc::new(FnHandler(handler))
}

struct Terminal {
    runtime: SessionRuntime,
    cancel: CancellationToken,
    events: EventSink,
    preset: Mutex<Option<ResponseLike>>,
}

/// The remainder of a handler chain. The last link runs the session.
#[derive(Clone)]
pub struct Next {
    handlers: Arc<[Arc<dyn Handler>]>,
    index: usize,
    terminal: Arc<Terminal>,
}

impl Next {
    pub async fn run(self, options: NormalizedOptions) -> Result<Response, Error> {
        match self.handlers.get(self.index).cloned() {
            Some(handler) => {
                let next = Next {
                    index: self.index + 1,
                    ..self
                };
                handler.handle(options, next).await
            }
            None => {
                let terminal = self.terminal;
                // An init short-circuit only stands in for the first session.
                let preset = lock_unpoisoned(&terminal.preset).take();
                Session::new(
                    terminal.runtime.clone(),
                    options,
                    Mode::Promise,
                    terminal.cancel.clone(),
                    terminal.events.clone(),
                )
                .with_preset(preset)
                .run_promise()
                .await
            }
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Next")
            .field("remaining", &(self.handlers.len() - self.index))
            .finish_non_exhaustive()
    }
}

/// An immutable client instance: defaults, handlers and a shared transport.
///
/// Cloning is cheap. [`Client::extend`] and [`Client::merge`] return new
/// instances that share the transport, cache coordinator and metrics.
#[derive(Clone)]
pub struct Client {
    defaults: Arc<Defaults>,
    handlers: Arc<[Arc<dyn Handler>]>,
    runtime: SessionRuntime,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn new() -> Result<Self, Error> {
        Self::builder().try_build()
    }

    pub fn defaults(&self) -> &Defaults {
        &self.defaults
    }

    pub fn handlers(&self) -> &[Arc<dyn Handler>] {
        &self.handlers
    }

    /// New instance with `options` layered over these defaults.
    pub fn extend(&self, options: Options) -> Result<Client, Error> {
        Ok(Client {
            defaults: Arc::new(self.defaults.merge(options)?),
            handlers: Arc::clone(&self.handlers),
            runtime: self.runtime.clone(),
        })
    }

    pub fn with_handler(&self, handler: Arc<dyn Handler>) -> Client {
        let mut handlers = self.handlers.to_vec();
        handlers.push(handler);
        Client {
            defaults: Arc::clone(&self.defaults),
            handlers: handlers.into(),
            runtime: self.runtime.clone(),
        }
    }

    /// Folds `others` over this instance in order. Later defaults win and
    /// handlers already present are not added twice.
    pub fn merge(&self, others: &[&Client]) -> Client {
        let mut defaults = Defaults::clone(&self.defaults);
        let mut handlers = self.handlers.to_vec();
        for other in others {
            defaults = defaults.merged(&other.defaults);
            for handler in other.handlers.iter() {
                if !handlers.iter().any(|held| Arc::ptr_eq(held, handler)) {
                    handlers.push(Arc::clone(handler));
                }
            }
        }
        Client {
            defaults: Arc::new(defaults),
            handlers: handlers.into(),
            runtime: self.runtime.clone(),
        }
    }

    /// Starts a promise-style session.
    pub fn request(&self, input: impl Into<RequestInput>, options: Options) -> ResponsePromise {
        self.spawn_promise(Some(input.into()), options)
    }

    /// Starts a promise-style session whose URL comes from `options.url`.
    pub fn request_options(&self, options: Options) -> ResponsePromise {
        self.spawn_promise(None, options)
    }

    pub fn get(&self, url: impl Into<RequestInput>) -> ResponsePromise {
        self.request(url, Options::new().method("GET"))
    }

    pub fn post(&self, url: impl Into<RequestInput>, options: Options) -> ResponsePromise {
        self.request(url, options.method("POST"))
    }

    pub fn put(&self, url: impl Into<RequestInput>, options: Options) -> ResponsePromise {
        self.request(url, options.method("PUT"))
    }

    pub fn patch(&self, url: impl Into<RequestInput>, options: Options) -> ResponsePromise {
        self.request(url, options.method("PATCH"))
    }

    pub fn delete(&self, url: impl Into<RequestInput>, options: Options) -> ResponsePromise {
        self.request(url, options.method("DELETE"))
    }

    pub fn head(&self, url: impl Into<RequestInput>) -> ResponsePromise {
        self.request(url, Options::new().method("HEAD"))
    }

    /// Starts a stream-style session. Handlers are not applied.
    pub fn stream(&self, input: impl Into<RequestInput>, options: Options) -> RequestStream {
        self.spawn_stream(Some(input.into()), options)
    }

    /// Starts a stream-style session whose request body is written through
    /// the returned [`RequestWriter`].
    pub fn duplex(
        &self,
        input: impl Into<RequestInput>,
        options: Options,
    ) -> Result<(RequestWriter, RequestStream), Error> {
        if options.body.is_some() || options.json.is_some() || options.form.is_some() {
            return Err(Error::validation(
                "duplex sessions take their body from the request writer",
            ));
        }
        let (writer, receiver) = RequestWriter::channel();
        let body = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|chunk| (chunk, receiver))
        });
        let options = options.body(Body::from_stream(body));
        Ok((writer, self.spawn_stream(Some(input.into()), options)))
    }

    /// Counters of this client and every client derived from it. All zeros
    /// unless metrics were enabled on the builder.
    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.runtime.metrics.snapshot()
    }

    fn spawn_promise(&self, input: Option<RequestInput>, options: Options) -> ResponsePromise {
        let cancel = CancellationToken::new();
        let (events, event_stream) = EventSink::channel();
        let defaults = Arc::clone(&self.defaults);
        let handlers = Arc::clone(&self.handlers);
        let runtime = self.runtime.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let metrics = runtime.metrics.clone();
            let _in_flight = metrics.enter_session();
            let started = Instant::now();
            let result = match prepare(&defaults, input, options, &task_cancel).await {
                Ok((normalized, preset)) => {
                    let next = Next {
                        handlers,
                        index: 0,
                        terminal: Arc::new(Terminal {
                            runtime,
                            cancel: task_cancel,
                            events,
                            preset: Mutex::new(preset),
                        }),
                    };
                    next.run(normalized).await
                }
                Err(error) => Err(error),
            };
            record(&metrics, &result.as_ref().map(Response::status), started);
            result
        });
        ResponsePromise::new(task, cancel, event_stream)
    }

    fn spawn_stream(&self, input: Option<RequestInput>, options: Options) -> RequestStream {
        let cancel = CancellationToken::new();
        let (events, event_stream) = EventSink::channel();
        let defaults = Arc::clone(&self.defaults);
        let runtime = self.runtime.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let metrics = runtime.metrics.clone();
            let _in_flight = metrics.enter_session();
            let started = Instant::now();
            let result = match prepare(&defaults, input, options, &task_cancel).await {
                Ok((normalized, preset)) => {
                    Session::new(runtime, normalized, Mode::Stream, task_cancel, events)
                        .with_preset(preset)
                        .run_stream()
                        .await
                }
                Err(error) => Err(error),
            };
            record(&metrics, &result.as_ref().map(|streaming| streaming.head.status()), started);
            result
        });
        RequestStream::new(task, cancel, event_stream)
    }
}

/// Runs `init` hooks and normalization. Failures here never reach a session,
/// so `beforeError` hooks are applied on the spot.
async fn prepare(
    defaults: &Defaults,
    input: Option<RequestInput>,
    options: Options,
    cancel: &CancellationToken,
) -> Result<(NormalizedOptions, Option<ResponseLike>), Error> {
    let hooks = defaults.hooks().merged(&options.hooks);
    match init_and_normalize(&hooks, defaults, input, options, cancel).await {
        Ok(prepared) => Ok(prepared),
        Err(error) => {
            debug!(code = error.code().as_str(), "request rejected before dispatch");
            Err(surface_error(&hooks.before_error, error).await)
        }
    }
}

async fn init_and_normalize(
    hooks: &Hooks,
    defaults: &Defaults,
    input: Option<RequestInput>,
    mut options: Options,
    cancel: &CancellationToken,
) -> Result<(NormalizedOptions, Option<ResponseLike>), Error> {
    let preset = run_init(&hooks.init, &mut options, cancel).await?;
    let normalized = normalize(input, options, defaults)?;
    Ok((normalized, preset))
}

fn record(
    metrics: &ClientMetrics,
    outcome: &Result<http::StatusCode, &Error>,
    started: Instant,
) {
    match outcome {
        Ok(status) => metrics.record_success(*status, started.elapsed()),
        Err(error) => metrics.record_failure(error, started.elapsed()),
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Client")
            .field("defaults", &self.defaults)
            .field("handlers", &self.handlers.len())
            .field("metrics_enabled", &self.runtime.metrics.is_enabled())
            .finish_non_exhaustive()
    }
}

pub struct ClientBuilder {
    profile: ClientProfile,
    options: Options,
    timeout: Option<Delays>,
    retry: Option<RetryPolicy>,
    redirect: Option<RedirectPolicy>,
    transport: Option<Arc<dyn Transport>>,
    pool_idle_timeout: Option<Duration>,
    pool_max_idle_per_host: Option<usize>,
    body_codec: Option<Arc<dyn BodyCodec>>,
    handlers: Vec<Arc<dyn Handler>>,
    hooks: Hooks,
    metrics_enabled: bool,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            profile: ClientProfile::default(),
            options: Options::new(),
            timeout: None,
            retry: None,
            redirect: None,
            transport: None,
            pool_idle_timeout: None,
            pool_max_idle_per_host: None,
            body_codec: None,
            handlers: Vec::new(),
            hooks: Hooks::new(),
            metrics_enabled: false,
        }
    }

    pub fn profile(mut self, profile: ClientProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Options layered over the profile defaults when the client is built.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn timeout(mut self, timeout: Delays) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn redirect(mut self, redirect: RedirectPolicy) -> Self {
        self.redirect = Some(redirect);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = self.hooks.merged(&hooks);
        self
    }

    /// Replaces the hyper transport, e.g. with an in-memory one in tests.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = Some(pool_idle_timeout);
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = Some(pool_max_idle_per_host);
        self
    }

    pub fn body_codec(mut self, body_codec: Arc<dyn BodyCodec>) -> Self {
        self.body_codec = Some(body_codec);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn handler_fn<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(NormalizedOptions, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, Error>> + Send + 'static,
    {
        self.handler(handler_fn(handler))
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn try_build(self) -> Result<Client, Error> {
        let mut defaults = self.profile.to_defaults();
        if let Some(timeout) = self.timeout {
            defaults = defaults.with_timeout(timeout);
        }
        if let Some(retry) = self.retry {
            defaults = defaults.with_retry(retry);
        }
        if let Some(redirect) = self.redirect {
            defaults = defaults.with_redirect(redirect);
        }
        if let Some(body_codec) = self.body_codec {
            defaults = defaults.with_body_codec(body_codec);
        }
        let mut options = self.options;
        options.hooks = self.hooks.merged(&options.hooks);
        let defaults = defaults.merge(options)?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let mut builder = HyperTransport::builder();
                if let Some(pool_idle_timeout) = self.pool_idle_timeout {
                    builder = builder.pool_idle_timeout(pool_idle_timeout);
                }
                if let Some(pool_max_idle_per_host) = self.pool_max_idle_per_host {
                    builder = builder.pool_max_idle_per_host(pool_max_idle_per_host);
                }
                Arc::new(builder.build()?)
            }
        };
        let metrics = if self.metrics_enabled {
            ClientMetrics::enabled()
        } else {
            ClientMetrics::disabled()
        };

        Ok(Client {
            defaults: Arc::new(defaults),
            handlers: self.handlers.into(),
            runtime: SessionRuntime {
                transport,
                coordinator: CacheCoordinator::new(),
                metrics,
            },
        })
    }

    #[track_caller]
    pub fn build(self) -> Client {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build reqwire client: {error}; use try_build() to handle configuration errors")
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ClientBuilder")
            .field("profile", &self.profile)
            .field("options", &self.options)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("redirect", &self.redirect)
            .field("handlers", &self.handlers.len())
            .field("metrics_enabled", &self.metrics_enabled)
            .finish_non_exhaustive()
    }
}
