use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::options::{NormalizedOptions, Options};
use crate::response::{Response, ResponseHead, ResponseLike};

pub type HookFuture<'a, T> = BoxFuture<'a, Result<T, Error>>;

/// Result of an `init` or `beforeRequest` hook.
#[derive(Debug)]
pub enum HookOutcome {
    Continue,
    /// Skips the network attempt and uses this response instead.
    ShortCircuit(ResponseLike),
}

/// Result of an `afterResponse` hook.
#[derive(Debug)]
pub enum AfterResponse {
    Response(Response),
    /// Starts a new attempt with these options merged over the current ones.
    RetryWithMergedOptions(Options),
}

pub trait InitHook: Send + Sync {
    fn run<'a>(&'a self, options: &'a mut Options) -> HookFuture<'a, HookOutcome>;
}

pub trait BeforeRequestHook: Send + Sync {
    fn run<'a>(&'a self, options: &'a mut NormalizedOptions) -> HookFuture<'a, HookOutcome>;
}

pub trait BeforeRedirectHook: Send + Sync {
    fn run<'a>(
        &'a self,
        options: &'a mut NormalizedOptions,
        response: &'a ResponseHead,
    ) -> HookFuture<'a, ()>;
}

/// `error` is `None` when the retry was requested by an `afterResponse` hook.
pub trait BeforeRetryHook: Send + Sync {
    fn run<'a>(
        &'a self,
        options: &'a mut NormalizedOptions,
        error: Option<&'a Error>,
        retry_count: u32,
    ) -> HookFuture<'a, ()>;
}

pub trait AfterResponseHook: Send + Sync {
    fn run<'a>(&'a self, response: Response) -> HookFuture<'a, AfterResponse>;
}

/// Returns the error to surface in place of the one received.
pub trait BeforeErrorHook: Send + Sync {
    fn run<'a>(&'a self, error: Error) -> BoxFuture<'a, Error>;
}

struct FnHook<F>(F);

impl<F> InitHook for FnHook<F>
where
    F: Fn(&mut Options) -> Result<HookOutcome, Error> + Send + Sync,
{
    fn run<'a>(&'a self, options: &'a mut Options) -> HookFuture<'a, HookOutcome> {
        Box::pin(std::future::ready((self.0)(options)))
    }
}

impl<F> BeforeRequestHook for FnHook<F>
where
    F: Fn(&mut NormalizedOptions) -> Result<HookOutcome, Error> + Send + Sync,
{
    fn run<'a>(&'a self, options: &'a mut NormalizedOptions) -> HookFuture<'a, HookOutcome> {
        Box::pin(std::future::ready((self.0)(options)))
    }
}

impl<F> BeforeRedirectHook for FnHook<F>
where
    F: Fn(&mut NormalizedOptions, &ResponseHead) -> Result<(), Error> + Send + Sync,
{
    fn run<'a>(
        &'a self,
        options: &'a mut NormalizedOptions,
        response: &'a ResponseHead,
    ) -> HookFuture<'a, ()> {
        Box::pin(std::future::ready((self.0)(options, response)))
    }
}

impl<F> BeforeRetryHook for FnHook<F>
where
    F: Fn(&mut NormalizedOptions, Option<&Error>, u32) -> Result<(), Error> + Send + Sync,
{
    fn run<'a>(
        &'a self,
        options: &'a mut NormalizedOptions,
        error: Option<&'a Error>,
        retry_count: u32,
    ) -> HookFuture<'a, ()> {
        Box::pin(std::future::ready((self.0)(options, error, retry_count)))
    }
}

impl<F> AfterResponseHook for FnHook<F>
where
    F: Fn(Response) -> Result<AfterResponse, Error> + Send + Sync,
{
    fn run<'a>(&'a self, response: Response) -> HookFuture<'a, AfterResponse> {
        Box::pin(std::future::ready((self.0)(response)))
    }
}

impl<F> BeforeErrorHook for FnHook<F>
where
    F: Fn(Error) -> Error + Send + Sync,
{
    fn run<'a>(&'a self, error: Error) -> BoxFuture<'a, Error> {
        Box::pin(std::future::ready((self.0)(error)))
    }
}

/// Ordered hook chains.
///
/// Chains only grow by concatenation; [`Hooks::merged`] builds new vectors,
/// so extending one set never changes another.
#[derive(Clone, Default)]
pub struct Hooks {
    pub(crate) init: Vec<Arc<dyn InitHook>>,
    pub(crate) before_request: Vec<Arc<dyn BeforeRequestHook>>,
    pub(crate) before_redirect: Vec<Arc<dyn BeforeRedirectHook>>,
    pub(crate) before_retry: Vec<Arc<dyn BeforeRetryHook>>,
    pub(crate) after_response: Vec<Arc<dyn AfterResponseHook>>,
    pub(crate) before_error: Vec<Arc<dyn BeforeErrorHook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(mut self, hook: Arc<dyn InitHook>) -> Self {
        self.init.push(hook);
        self
    }

    pub fn init_fn<F>(self, hook: F) -> Self
    where
        F: Fn(&mut Options) -> Result<HookOutcome, Error> + Send + Sync + 'static,
    {
        self.init(Arc::new(FnHook(hook)))
    }

    pub fn before_request(mut self, hook: Arc<dyn BeforeRequestHook>) -> Self {
        self.before_request.push(hook);
        self
    }

    pub fn before_request_fn<F>(self, hook: F) -> Self
    where
        F: Fn(&mut NormalizedOptions) -> Result<HookOutcome, Error> + Send + Sync + 'static,
    {
        self.before_request(Arc::new(FnHook(hook)))
    }

    pub fn before_redirect(mut self, hook: Arc<dyn BeforeRedirectHook>) -> Self {
        self.before_redirect.push(hook);
        self
    }

    pub fn before_redirect_fn<F>(self, hook: F) -> Self
    where
        F: Fn(&mut NormalizedOptions, &ResponseHead) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.before_redirect(Arc::new(FnHook(hook)))
    }

    pub fn before_retry(mut self, hook: Arc<dyn BeforeRetryHook>) -> Self {
        self.before_retry.push(hook);
        self
    }

    pub fn before_retry_fn<F>(self, hook: F) -> Self
    where
        F: Fn(&mut NormalizedOptions, Option<&Error>, u32) -> Result<(), Error>
            + Send
            + Sync
            + 'static,
    {
        self.before_retry(Arc::new(FnHook(hook)))
    }

    pub fn after_response(mut self, hook: Arc<dyn AfterResponseHook>) -> Self {
        self.after_response.push(hook);
        self
    }

    pub fn after_response_fn<F>(self, hook: F) -> Self
    where
        F: Fn(Response) -> Result<AfterResponse, Error> + Send + Sync + 'static,
    {
        self.after_response(Arc::new(FnHook(hook)))
    }

    pub fn before_error(mut self, hook: Arc<dyn BeforeErrorHook>) -> Self {
        self.before_error.push(hook);
        self
    }

    pub fn before_error_fn<F>(self, hook: F) -> Self
    where
        F: Fn(Error) -> Error + Send + Sync + 'static,
    {
        self.before_error(Arc::new(FnHook(hook)))
    }

    /// Concatenation: our hooks first, then `other`'s.
    pub fn merged(&self, other: &Hooks) -> Hooks {
        fn concat<T: ?Sized>(left: &[Arc<T>], right: &[Arc<T>]) -> Vec<Arc<T>> {
            left.iter().chain(right).cloned().collect()
        }

        Hooks {
            init: concat(&self.init, &other.init),
            before_request: concat(&self.before_request, &other.before_request),
            before_redirect: concat(&self.before_redirect, &other.before_redirect),
            before_retry: concat(&self.before_retry, &other.before_retry),
            after_response: concat(&self.after_response, &other.after_response),
            before_error: concat(&self.before_error, &other.before_error),
        }
    }

    /// Like [`Hooks::merged`], skipping `other`'s hooks we already hold.
    pub fn union(&self, other: &Hooks) -> Hooks {
        fn join<T: ?Sized>(left: &[Arc<T>], right: &[Arc<T>]) -> Vec<Arc<T>> {
            let mut joined = left.to_vec();
            for hook in right {
                if !joined.iter().any(|held| Arc::ptr_eq(held, hook)) {
                    joined.push(Arc::clone(hook));
                }
            }
            joined
        }

        Hooks {
            init: join(&self.init, &other.init),
            before_request: join(&self.before_request, &other.before_request),
            before_redirect: join(&self.before_redirect, &other.before_redirect),
            before_retry: join(&self.before_retry, &other.before_retry),
            after_response: join(&self.after_response, &other.after_response),
            before_error: join(&self.before_error, &other.before_error),
        }
    }

    pub fn len(&self) -> usize {
        self.init.len()
            + self.before_request.len()
            + self.before_redirect.len()
            + self.before_retry.len()
            + self.after_response.len()
            + self.before_error.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Hooks")
            .field("init", &self.init.len())
            .field("before_request", &self.before_request.len())
            .field("before_redirect", &self.before_redirect.len())
            .field("before_retry", &self.before_retry.len())
            .field("after_response", &self.after_response.len())
            .field("before_error", &self.before_error.len())
            .finish()
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), Error> {
    if cancel.is_cancelled() {
        return Err(Error::cancel());
    }
    Ok(())
}

pub(crate) async fn run_init(
    hooks: &[Arc<dyn InitHook>],
    options: &mut Options,
    cancel: &CancellationToken,
) -> Result<Option<ResponseLike>, Error> {
    for hook in hooks {
        ensure_active(cancel)?;
        if let HookOutcome::ShortCircuit(response) = hook.run(options).await? {
            return Ok(Some(response));
        }
    }
    Ok(None)
}

pub(crate) async fn run_before_request(
    options: &mut NormalizedOptions,
    cancel: &CancellationToken,
) -> Result<Option<ResponseLike>, Error> {
    let hooks = options.hooks().before_request.clone();
    for hook in hooks {
        ensure_active(cancel)?;
        if let HookOutcome::ShortCircuit(response) = hook.run(options).await? {
            return Ok(Some(response));
        }
    }
    Ok(None)
}

pub(crate) async fn run_before_redirect(
    options: &mut NormalizedOptions,
    response: &ResponseHead,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let hooks = options.hooks().before_redirect.clone();
    for hook in hooks {
        ensure_active(cancel)?;
        hook.run(options, response).await?;
    }
    Ok(())
}

pub(crate) async fn run_before_retry(
    options: &mut NormalizedOptions,
    error: Option<&Error>,
    retry_count: u32,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let hooks = options.hooks().before_retry.clone();
    for hook in hooks {
        ensure_active(cancel)?;
        hook.run(options, error, retry_count).await?;
    }
    Ok(())
}

/// Runs the chain. A retry request comes back together with the response the
/// requesting hook was handed, so the session can still deliver it when the
/// retry budget is spent.
pub(crate) async fn run_after_response(
    hooks: &[Arc<dyn AfterResponseHook>],
    mut response: Response,
    cancel: &CancellationToken,
) -> Result<(Response, Option<Options>), Error> {
    for hook in hooks {
        ensure_active(cancel)?;
        match hook.run(response.clone()).await? {
            AfterResponse::Response(next) => response = next,
            AfterResponse::RetryWithMergedOptions(options) => return Ok((response, Some(options))),
        }
    }
    Ok((response, None))
}

pub(crate) async fn run_before_error(hooks: &[Arc<dyn BeforeErrorHook>], mut error: Error) -> Error {
    for hook in hooks {
        error = hook.run(error).await;
    }
    error
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::ErrorCode;
    use crate::options::{Defaults, normalize};

    #[test]
    fn merged_hooks_concatenate_without_aliasing() {
        let parent = Hooks::new().before_request_fn(|_| Ok(HookOutcome::Continue));
        let child = parent.merged(&Hooks::new().before_request_fn(|_| Ok(HookOutcome::Continue)));
        let grandchild = child.clone().before_request_fn(|_| Ok(HookOutcome::Continue));

        assert_eq!(parent.before_request.len(), 1);
        assert_eq!(child.before_request.len(), 2);
        assert_eq!(grandchild.before_request.len(), 3);
        assert!(Arc::ptr_eq(&parent.before_request[0], &child.before_request[0]));
    }

    #[test]
    fn union_skips_hooks_already_held() {
        let parent = Hooks::new().before_error_fn(|error| error);
        let child = parent.clone().before_error_fn(|error| error);
        let merged = parent.union(&child);
        assert_eq!(merged.before_error.len(), 2);
    }

    #[tokio::test]
    async fn before_request_runs_in_order_and_short_circuits() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let second = Arc::clone(&seen);
        let third = Arc::clone(&seen);
        let hooks = Hooks::new()
            .before_request_fn(move |_| {
                first.lock().expect("lock").push(1);
                Ok(HookOutcome::Continue)
            })
            .before_request_fn(move |_| {
                second.lock().expect("lock").push(2);
                Ok(HookOutcome::ShortCircuit(ResponseLike::new(http::StatusCode::ACCEPTED)))
            })
            .before_request_fn(move |_| {
                third.lock().expect("lock").push(3);
                Ok(HookOutcome::Continue)
            });
        let mut options = normalize(
            Some("https://example.test/".into()),
            Options::new().hooks(hooks),
            &Defaults::default(),
        )
        .expect("normalize");

        let response = run_before_request(&mut options, &CancellationToken::new())
            .await
            .expect("hooks run");
        assert_eq!(response.map(|like| like.status), Some(http::StatusCode::ACCEPTED));
        assert_eq!(*seen.lock().expect("lock"), vec![1, 2]);
    }

    #[tokio::test]
    async fn canceled_sessions_skip_hooks() {
        let hooks = Hooks::new().before_request_fn(|_| panic!("hook must not run"));
        let mut options = normalize(
            Some("https://example.test/".into()),
            Options::new().hooks(hooks),
            &Defaults::default(),
        )
        .expect("normalize");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = run_before_request(&mut options, &cancel)
            .await
            .expect_err("canceled");
        assert_eq!(error.code(), ErrorCode::Cancel);
    }

    #[tokio::test]
    async fn before_error_replaces_errors_in_sequence() {
        let hooks = Hooks::new()
            .before_error_fn(|_| Error::validation("first"))
            .before_error_fn(|error| Error::validation(format!("{error} then second")));
        let error = run_before_error(&hooks.before_error, Error::cancel()).await;
        assert_eq!(error.to_string(), "invalid options: invalid options: first then second");
    }
}
