//! `reqwire` is a hook-driven HTTP client: one request engine behind a
//! promise-style API and a stream-style API.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqwire::prelude::{Client, Delays, Options, RetryPolicy};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .options(Options::new().prefix_url("https://api.example.com/v1/"))
//!         .timeout(Delays::request(Duration::from_secs(8)))
//!         .retry(RetryPolicy::standard().limit(3))
//!         .try_build()?;
//!
//!     let item: Item = client
//!         .post("items", Options::new().json(serde_json::json!({ "name": "demo" })))
//!         .json()
//!         .await?;
//!
//!     println!("created id={}", item.id);
//!     Ok(())
//! }
//! ```
//!
//! # Sessions
//!
//! - A session is one logical request: retries and redirects happen inside it.
//! - Dropping a [`ResponsePromise`] or [`RequestStream`] cancels its session.
//! - Every failure is an [`Error`] with a stable [`ErrorCode`].

mod body;
mod cache;
mod client;
mod config;
mod content_encoding;
mod cookies;
mod engine;
mod error;
mod hooks;
mod metrics;
mod options;
mod progress;
mod promise;
mod redirect;
mod response;
mod retry;
mod stream;
mod timings;
mod transport;
mod util;

pub use crate::body::{Body, BodyCodec, BodyStream, ContentDecoder, EncodedBody, StandardBodyCodec};
pub use crate::cache::{CacheStorage, CachedResponse, MemoryCacheStorage};
pub use crate::client::{Client, ClientBuilder, Handler, Next, handler_fn};
pub use crate::config::{ClientProfile, ProfileDefaults};
pub use crate::content_encoding::{DecodeContentEncodingError, IncrementalDecoder};
pub use crate::cookies::CookieJar;
pub use crate::error::{BoxError, Error, ErrorCode, ErrorKind, TimeoutPhase, TransportErrorKind};
pub use crate::hooks::{
    AfterResponse, AfterResponseHook, BeforeErrorHook, BeforeRedirectHook, BeforeRequestHook,
    BeforeRetryHook, HookFuture, HookOutcome, Hooks, InitHook,
};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::options::{
    CacheSetting, Context, Defaults, HeaderInput, NormalizedOptions, Options, RequestInput,
    RetryInput, SearchParams, normalize,
};
pub use crate::progress::Progress;
pub use crate::promise::ResponsePromise;
pub use crate::redirect::RedirectPolicy;
pub use crate::response::{Encoding, Response, ResponseHead, ResponseLike, ResponseType};
pub use crate::retry::{CalculateDelay, RetryContext, RetryPolicy};
pub use crate::stream::{Event, EventStream, RequestStream, RequestWriter};
pub use crate::timings::{Delays, TimingPhases, Timings};
pub use crate::transport::{
    HyperTransport, HyperTransportBuilder, PhaseReporter, ResponseBodyStream, Transport,
    TransportError, TransportRequest, TransportResponse,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Body, Client, ClientBuilder, ClientProfile, Delays, Error, ErrorCode, Event, Hooks,
        HookOutcome, Options, RedirectPolicy, RequestStream, Response, ResponsePromise,
        ResponseType, RetryPolicy,
    };
}

#[cfg(test)]
mod tests;
