use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{
    AGE, CACHE_CONTROL, DATE, ETAG, EXPIRES, HeaderName, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED, VARY,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use crate::error::{BoxError, Error, ErrorKind};
use crate::util::lock_unpoisoned;

const CACHEABLE_STATUS_CODES: [u16; 11] = [200, 203, 204, 300, 301, 308, 404, 405, 410, 414, 501];

/// A stored response, kept exactly as received (body still content-encoded).
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
    pub stored_at: SystemTime,
    /// Request header values named by the response's `Vary` header.
    pub vary: Vec<(HeaderName, Option<HeaderValue>)>,
}

/// Key-value store behind the response cache.
pub trait CacheStorage: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<CachedResponse>, BoxError>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: CachedResponse,
    ) -> BoxFuture<'a, Result<(), BoxError>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), BoxError>>;
}

/// In-process [`CacheStorage`] backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    entries: Mutex<HashMap<String, CachedResponse>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<CachedResponse>, BoxError>> {
        let entry = lock_unpoisoned(&self.entries).get(key).cloned();
        Box::pin(std::future::ready(Ok(entry)))
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: CachedResponse,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        lock_unpoisoned(&self.entries).insert(key.to_owned(), value);
        Box::pin(std::future::ready(Ok(())))
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), BoxError>> {
        lock_unpoisoned(&self.entries).remove(key);
        Box::pin(std::future::ready(Ok(())))
    }
}

fn cache_error(source: BoxError) -> Error {
    Error::new(ErrorKind::Cache { source })
}

pub(crate) fn cache_key(method: &Method, url: &Url) -> String {
    format!("{method}:{url}")
}

fn has_directive(headers: &HeaderMap, directive: &str) -> bool {
    directive_value(headers, directive).is_some()
}

/// `Some("")` for a bare directive, `Some(value)` for `name=value`.
fn directive_value(headers: &HeaderMap, directive: &str) -> Option<String> {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|part| {
            let mut pieces = part.trim().splitn(2, '=');
            let name = pieces.next()?.trim();
            if !name.eq_ignore_ascii_case(directive) {
                return None;
            }
            Some(pieces.next().unwrap_or_default().trim().trim_matches('"').to_owned())
        })
}

fn seconds_directive(headers: &HeaderMap, directive: &str) -> Option<Duration> {
    directive_value(headers, directive)?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn http_date(headers: &HeaderMap, name: HeaderName) -> Option<SystemTime> {
    let value = headers.get(name)?.to_str().ok()?;
    httpdate::parse_http_date(value).ok()
}

/// Whether a request may be answered from storage.
pub(crate) fn request_bypasses_reads(request_headers: &HeaderMap) -> bool {
    has_directive(request_headers, "no-store") || has_directive(request_headers, "no-cache")
}

pub(crate) fn is_cacheable_request(method: &Method, request_headers: &HeaderMap) -> bool {
    matches!(*method, Method::GET | Method::HEAD) && !has_directive(request_headers, "no-store")
}

fn vary_names(headers: &HeaderMap) -> Option<Vec<HeaderName>> {
    let mut names = Vec::new();
    for value in headers.get_all(VARY) {
        let text = value.to_str().ok()?;
        for name in text.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            if name == "*" {
                return None;
            }
            names.push(name.parse().ok()?);
        }
    }
    Some(names)
}

/// Request header values a response varies on; `None` for `Vary: *`.
fn captured_vary(
    response_headers: &HeaderMap,
    request_headers: &HeaderMap,
) -> Option<Vec<(HeaderName, Option<HeaderValue>)>> {
    let vary = vary_names(response_headers)?
        .into_iter()
        .map(|name| {
            let value = request_headers.get(&name).cloned();
            (name, value)
        })
        .collect();
    Some(vary)
}

fn freshness_lifetime(entry: &CachedResponse) -> Duration {
    let headers = &entry.headers;
    if let Some(lifetime) = seconds_directive(headers, "s-maxage") {
        return lifetime;
    }
    if let Some(lifetime) = seconds_directive(headers, "max-age") {
        return lifetime;
    }
    let date = http_date(headers, DATE).unwrap_or(entry.stored_at);
    if let Some(expires) = http_date(headers, EXPIRES) {
        return expires.duration_since(date).unwrap_or_default();
    }
    if let Some(last_modified) = http_date(headers, LAST_MODIFIED) {
        // Heuristic freshness: a tenth of the time since last modification.
        return date.duration_since(last_modified).unwrap_or_default() / 10;
    }
    Duration::ZERO
}

fn current_age(entry: &CachedResponse, now: SystemTime) -> Duration {
    let age_header = entry
        .headers
        .get(AGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_default();
    age_header + now.duration_since(entry.stored_at).unwrap_or_default()
}

impl CachedResponse {
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        !has_directive(&self.headers, "no-cache")
            && current_age(self, now) < freshness_lifetime(self)
    }

    fn has_validators(&self) -> bool {
        self.headers.contains_key(ETAG) || self.headers.contains_key(LAST_MODIFIED)
    }

    fn matches_vary(&self, request_headers: &HeaderMap) -> bool {
        self.vary
            .iter()
            .all(|(name, value)| request_headers.get(name) == value.as_ref())
    }

    fn add_conditional_headers(&self, request_headers: &mut HeaderMap) {
        if let Some(etag) = self.headers.get(ETAG) {
            request_headers.insert(IF_NONE_MATCH, etag.clone());
        }
        if let Some(last_modified) = self.headers.get(LAST_MODIFIED) {
            request_headers.insert(IF_MODIFIED_SINCE, last_modified.clone());
        }
    }

    /// Applies the headers of a `304` and restarts the freshness clock.
    fn refreshed(mut self, not_modified: &HeaderMap, now: SystemTime) -> Self {
        for name in not_modified.keys() {
            if name == http::header::CONTENT_LENGTH {
                continue;
            }
            self.headers.remove(name);
            for value in not_modified.get_all(name) {
                self.headers.append(name.clone(), value.clone());
            }
        }
        self.stored_at = now;
        self
    }
}

/// Builds a storable entry, or `None` when the response may not be stored.
pub(crate) fn storable_entry(
    method: &Method,
    request_headers: &HeaderMap,
    status: StatusCode,
    headers: &HeaderMap,
    body: &Bytes,
    url: &Url,
) -> Option<CachedResponse> {
    if !is_cacheable_request(method, request_headers)
        || !CACHEABLE_STATUS_CODES.contains(&status.as_u16())
        || has_directive(headers, "no-store")
    {
        return None;
    }
    let vary = captured_vary(headers, request_headers)?;
    let entry = CachedResponse {
        status,
        headers: headers.clone(),
        body: body.clone(),
        url: url.clone(),
        stored_at: SystemTime::now(),
        vary,
    };
    (freshness_lifetime(&entry) > Duration::ZERO || entry.has_validators()).then_some(entry)
}

#[derive(Clone, Debug)]
enum FlightState {
    Pending,
    Done(Arc<CachedResponse>),
    Failed,
}

type FlightKey = (usize, String);
type FlightTable = Arc<Mutex<HashMap<FlightKey, Arc<watch::Sender<FlightState>>>>>;

/// Collapses concurrent cache-eligible fetches of the same key.
///
/// One session per key becomes the leader and does the network work; the
/// others wait for it and reuse its response.
#[derive(Clone, Default)]
pub(crate) struct CacheCoordinator {
    flights: FlightTable,
}

pub(crate) enum CacheLookup {
    /// Answer without touching the network.
    Hit(CachedResponse),
    /// Fetch from the network. `stale` carries a stored entry to revalidate.
    Miss {
        flight: FlightGuard,
        stale: Option<CachedResponse>,
    },
}

/// Leadership of one in-flight key. Dropping it without completing marks
/// the flight failed, and waiting sessions fetch for themselves.
pub(crate) struct FlightGuard {
    key: FlightKey,
    sender: Arc<watch::Sender<FlightState>>,
    flights: FlightTable,
    completed: bool,
}

impl FlightGuard {
    fn publish(&mut self, state: FlightState) {
        self.completed = true;
        self.sender.send_replace(state);
        let mut flights = lock_unpoisoned(&self.flights);
        if flights
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.sender))
        {
            flights.remove(&self.key);
        }
    }

    /// Stores a fetched response and hands it to waiting sessions.
    ///
    /// Returns the entry to serve instead of the live response when the
    /// fetch was a successful revalidation.
    pub(crate) async fn complete(
        mut self,
        storage: &dyn CacheStorage,
        method: &Method,
        request_headers: &HeaderMap,
        fetched: CachedResponse,
        stale: Option<CachedResponse>,
    ) -> Result<Option<CachedResponse>, Error> {
        let key = self.key.1.clone();
        if fetched.status == StatusCode::NOT_MODIFIED {
            if let Some(stale) = stale {
                let refreshed = stale.refreshed(&fetched.headers, SystemTime::now());
                storage
                    .set(&key, refreshed.clone())
                    .await
                    .map_err(cache_error)?;
                debug!(key = %key, "cache entry revalidated");
                self.publish(FlightState::Done(Arc::new(refreshed.clone())));
                return Ok(Some(refreshed));
            }
        }

        match storable_entry(
            method,
            request_headers,
            fetched.status,
            &fetched.headers,
            &fetched.body,
            &fetched.url,
        ) {
            Some(entry) => {
                storage.set(&key, entry).await.map_err(cache_error)?;
                debug!(key = %key, "cache entry stored");
            }
            None if stale.is_some() => {
                storage.delete(&key).await.map_err(cache_error)?;
            }
            None => {}
        }
        match captured_vary(&fetched.headers, request_headers) {
            Some(vary) => self.publish(FlightState::Done(Arc::new(CachedResponse {
                vary,
                ..fetched
            }))),
            None => self.publish(FlightState::Failed),
        }
        Ok(None)
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.publish(FlightState::Failed);
        }
    }
}

enum Role {
    Leader(FlightGuard),
    Follower(watch::Receiver<FlightState>),
}

impl CacheCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Leadership that nobody can follow, for sessions that must not share
    /// another session's response.
    fn detached(&self, key: FlightKey) -> FlightGuard {
        let (sender, _) = watch::channel(FlightState::Pending);
        FlightGuard {
            key,
            sender: Arc::new(sender),
            flights: Arc::clone(&self.flights),
            completed: false,
        }
    }

    fn join(&self, key: FlightKey, may_follow: bool) -> Role {
        let mut flights = lock_unpoisoned(&self.flights);
        if let Some(sender) = flights.get(&key) {
            if !may_follow {
                return Role::Leader(self.detached(key));
            }
            return Role::Follower(sender.subscribe());
        }
        let (sender, _) = watch::channel(FlightState::Pending);
        let sender = Arc::new(sender);
        flights.insert(key.clone(), Arc::clone(&sender));
        Role::Leader(FlightGuard {
            key,
            sender,
            flights: Arc::clone(&self.flights),
            completed: false,
        })
    }

    /// Reads through storage for `key`, waiting on any in-flight fetch first.
    pub(crate) async fn lookup(
        &self,
        storage: &Arc<dyn CacheStorage>,
        key: &str,
        request_headers: &mut HeaderMap,
    ) -> Result<CacheLookup, Error> {
        let storage_id = Arc::as_ptr(storage) as *const () as usize;
        let may_follow = !request_bypasses_reads(request_headers);
        loop {
            let mut receiver = match self.join((storage_id, key.to_owned()), may_follow) {
                Role::Leader(flight) => return self.lead(storage, key, request_headers, flight).await,
                Role::Follower(receiver) => receiver,
            };
            let state = loop {
                let current = receiver.borrow_and_update().clone();
                if !matches!(current, FlightState::Pending) {
                    break current;
                }
                if receiver.changed().await.is_err() {
                    break FlightState::Failed;
                }
            };
            match state {
                FlightState::Done(entry) if entry.matches_vary(request_headers) => {
                    debug!(key = %key, "joined in-flight cache fetch");
                    return Ok(CacheLookup::Hit(entry.as_ref().clone()));
                }
                FlightState::Done(_) => {
                    debug!(key = %key, "in-flight response varies, fetching separately");
                    let flight = self.detached((storage_id, key.to_owned()));
                    return self.lead(storage, key, request_headers, flight).await;
                }
                FlightState::Pending | FlightState::Failed => continue,
            }
        }
    }

    async fn lead(
        &self,
        storage: &Arc<dyn CacheStorage>,
        key: &str,
        request_headers: &mut HeaderMap,
        mut flight: FlightGuard,
    ) -> Result<CacheLookup, Error> {
        if request_bypasses_reads(request_headers) {
            return Ok(CacheLookup::Miss { flight, stale: None });
        }
        let stored = storage.get(key).await.map_err(cache_error)?;
        let Some(entry) = stored.filter(|entry| entry.matches_vary(request_headers)) else {
            return Ok(CacheLookup::Miss { flight, stale: None });
        };
        if entry.is_fresh(SystemTime::now()) {
            debug!(key = %key, "cache hit");
            flight.publish(FlightState::Done(Arc::new(entry.clone())));
            return Ok(CacheLookup::Hit(entry));
        }
        if entry.has_validators() {
            entry.add_conditional_headers(request_headers);
            return Ok(CacheLookup::Miss {
                flight,
                stale: Some(entry),
            });
        }
        Ok(CacheLookup::Miss { flight, stale: None })
    }
}
