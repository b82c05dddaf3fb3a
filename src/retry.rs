use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::future::BoxFuture;
use http::Method;
use rand::Rng;

use crate::error::{Error, TransportErrorKind};
use crate::timings::Delays;
use crate::util::parse_retry_after;

/// Smallest wait for a `Retry-After` that is zero or already in the past.
const MIN_RETRY_AFTER: Duration = Duration::from_millis(1);

/// Statuses whose `Retry-After` header is honoured.
const RETRY_AFTER_STATUS_CODES: [u16; 3] = [413, 429, 503];

/// Inputs of one retry decision.
///
/// `attempt_count` is 1-based: it numbers the retry about to happen, so the
/// first retry sees `1`.
pub struct RetryContext<'a> {
    pub attempt_count: u32,
    pub retry_options: &'a RetryPolicy,
    pub error: &'a Error,
    pub retry_after: Option<Duration>,
    pub computed_value: Duration,
}

/// Caller-supplied delay function. Returning [`Duration::ZERO`] cancels the retry.
pub trait CalculateDelay: Send + Sync {
    fn calculate_delay<'a>(&'a self, context: RetryContext<'a>) -> BoxFuture<'a, Result<Duration, Error>>;
}

struct FnCalculateDelay<F>(F);

impl<F> CalculateDelay for FnCalculateDelay<F>
where
    F: Fn(&RetryContext<'_>) -> Result<Duration, Error> + Send + Sync,
{
    fn calculate_delay<'a>(&'a self, context: RetryContext<'a>) -> BoxFuture<'a, Result<Duration, Error>> {
        Box::pin(std::future::ready((self.0)(&context)))
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    limit: u32,
    methods: Vec<Method>,
    status_codes: BTreeSet<u16>,
    error_codes: BTreeSet<TransportErrorKind>,
    max_retry_after: Option<Duration>,
    backoff_limit: Option<Duration>,
    noise: Duration,
    calculate_delay: Option<Arc<dyn CalculateDelay>>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("limit", &self.limit)
            .field("methods", &self.methods)
            .field("status_codes", &self.status_codes)
            .field("error_codes", &self.error_codes)
            .field("max_retry_after", &self.max_retry_after)
            .field("backoff_limit", &self.backoff_limit)
            .field("noise", &self.noise)
            .field("calculate_delay", &self.calculate_delay.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            limit: 2,
            methods: default_retry_methods(),
            status_codes: default_retry_status_codes(),
            error_codes: default_retry_error_codes(),
            max_retry_after: None,
            backoff_limit: None,
            noise: Duration::from_millis(100),
            calculate_delay: None,
        }
    }

    pub fn disabled() -> Self {
        Self::standard().limit(0)
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.status_codes = codes.into_iter().collect();
        self
    }

    pub fn error_codes(mut self, codes: impl IntoIterator<Item = TransportErrorKind>) -> Self {
        self.error_codes = codes.into_iter().collect();
        self
    }

    pub fn max_retry_after(mut self, max_retry_after: Duration) -> Self {
        self.max_retry_after = Some(max_retry_after);
        self
    }

    pub fn backoff_limit(mut self, backoff_limit: Duration) -> Self {
        self.backoff_limit = Some(backoff_limit);
        self
    }

    /// Upper bound of the random jitter added to the exponential backoff.
    pub fn noise(mut self, noise: Duration) -> Self {
        self.noise = noise;
        self
    }

    pub fn calculate_delay(mut self, calculate_delay: Arc<dyn CalculateDelay>) -> Self {
        self.calculate_delay = Some(calculate_delay);
        self
    }

    pub fn calculate_delay_fn<F>(self, calculate_delay: F) -> Self
    where
        F: Fn(&RetryContext<'_>) -> Result<Duration, Error> + Send + Sync + 'static,
    {
        self.calculate_delay(Arc::new(FnCalculateDelay(calculate_delay)))
    }

    pub fn limit_value(&self) -> u32 {
        self.limit
    }

    pub fn retries_method(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    pub fn retries_status(&self, status: u16) -> bool {
        self.status_codes.contains(&status)
    }

    pub fn retries_error_code(&self, code: TransportErrorKind) -> bool {
        self.error_codes.contains(&code)
    }

    fn effective_max_retry_after(&self, timeouts: &Delays) -> Option<Duration> {
        self.max_retry_after.or_else(|| {
            [timeouts.request, timeouts.connect]
                .into_iter()
                .flatten()
                .min()
        })
    }

    fn retry_after(error: &Error) -> Option<Duration> {
        let response = error.response()?;
        if !RETRY_AFTER_STATUS_CODES.contains(&response.status().as_u16()) {
            return None;
        }
        parse_retry_after(response.headers(), SystemTime::now())
            .map(|delay| delay.max(MIN_RETRY_AFTER))
    }

    /// Built-in decision: zero means "do not retry".
    pub fn computed_delay(
        &self,
        attempt_count: u32,
        method: &Method,
        error: &Error,
        retry_after: Option<Duration>,
        timeouts: &Delays,
    ) -> Duration {
        if attempt_count == 0 || attempt_count > self.limit {
            return Duration::ZERO;
        }
        if !self.retries_method(method) {
            return Duration::ZERO;
        }
        let code_allowed = error
            .transport_code()
            .is_some_and(|code| self.retries_error_code(code));
        let status_allowed = error
            .status()
            .is_some_and(|status| self.retries_status(status));
        if !code_allowed && !status_allowed {
            return Duration::ZERO;
        }

        if let Some(response) = error.response() {
            if let Some(retry_after) = retry_after {
                return match self.effective_max_retry_after(timeouts) {
                    Some(cap) if retry_after > cap => Duration::ZERO,
                    _ => retry_after,
                };
            }
            if response.status().as_u16() == 413 {
                return Duration::ZERO;
            }
        }

        self.backoff_for_retry(attempt_count)
    }

    pub(crate) fn backoff_for_retry(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(31);
        let base = Duration::from_secs(1).saturating_mul(1_u32 << exponent);
        let noise_ms = self.noise.as_millis().min(u64::MAX as u128) as u64;
        let jitter = if noise_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..noise_ms))
        };
        let delay = base.saturating_add(jitter);
        match self.backoff_limit {
            Some(limit) => delay.min(limit),
            None => delay,
        }
    }

    /// Runs the built-in decision and then the caller's delay function.
    ///
    /// `Ok(None)` means no retry. An error from the delay function replaces
    /// the failure being evaluated.
    pub(crate) async fn next_delay(
        &self,
        attempt_count: u32,
        method: &Method,
        error: &Error,
        timeouts: &Delays,
    ) -> Result<Option<Duration>, Error> {
        let retry_after = Self::retry_after(error);
        let computed_value =
            self.computed_delay(attempt_count, method, error, retry_after, timeouts);
        let delay = match &self.calculate_delay {
            Some(calculate_delay) => {
                calculate_delay
                    .calculate_delay(RetryContext {
                        attempt_count,
                        retry_options: self,
                        error,
                        retry_after,
                        computed_value,
                    })
                    .await?
            }
            None => computed_value,
        };
        Ok((!delay.is_zero()).then_some(delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retry_methods() -> Vec<Method> {
    vec![
        Method::GET,
        Method::PUT,
        Method::HEAD,
        Method::DELETE,
        Method::OPTIONS,
        Method::TRACE,
    ]
}

fn default_retry_status_codes() -> BTreeSet<u16> {
    [408_u16, 413, 429, 500, 502, 503, 504, 521, 522, 524]
        .into_iter()
        .collect()
}

fn default_retry_error_codes() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::TimedOut,
        TransportErrorKind::ConnectionReset,
        TransportErrorKind::AddressInUse,
        TransportErrorKind::ConnectionRefused,
        TransportErrorKind::BrokenPipe,
        TransportErrorKind::HostNotFound,
        TransportErrorKind::NetworkUnreachable,
        TransportErrorKind::DnsTemporaryFailure,
    ]
    .into_iter()
    .collect()
}
