use http::header::{AUTHORIZATION, COOKIE, HOST, LOCATION};
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::{Error, ErrorKind};
use crate::options::NormalizedOptions;
use crate::util::{is_redirect_status, percent_decode, same_hostname};

/// How `3xx` responses with a `Location` header are handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedirectPolicy {
    follow: bool,
    max_redirects: usize,
    method_rewriting: bool,
}

impl RedirectPolicy {
    pub const fn none() -> Self {
        Self {
            follow: false,
            max_redirects: 0,
            method_rewriting: false,
        }
    }

    pub const fn limited(max_redirects: usize) -> Self {
        Self {
            follow: true,
            max_redirects,
            method_rewriting: false,
        }
    }

    /// Follows up to 10 redirects and rewrites `POST` to `GET` on 301/302.
    pub const fn standard() -> Self {
        Self {
            follow: true,
            max_redirects: 10,
            method_rewriting: true,
        }
    }

    pub const fn follow(&self) -> bool {
        self.follow
    }

    pub const fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub const fn method_rewriting(&self) -> bool {
        self.method_rewriting
    }

    pub const fn with_follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    pub const fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub const fn with_method_rewriting(mut self, method_rewriting: bool) -> Self {
        self.method_rewriting = method_rewriting;
        self
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Decodes a `Location` header as UTF-8, falling back to latin1.
fn decode_location(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => text.to_owned(),
        Err(_) => raw.iter().map(|byte| char::from(*byte)).collect(),
    }
}

fn invalid_location(location: &str, reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidRedirectLocation {
        location: location.to_owned(),
        reason: reason.into(),
    })
}

pub(crate) fn redirect_target(current: &Url, raw_location: &[u8]) -> Result<Url, Error> {
    let location = decode_location(raw_location);
    let target = current
        .join(&location)
        .map_err(|error| invalid_location(&location, error.to_string()))?;

    let valid = percent_decode(target.as_str())
        .map(|bytes| String::from_utf8(bytes).is_ok())
        .unwrap_or(false);
    if !valid {
        return Err(invalid_location(&location, "URI malformed"));
    }
    Ok(target)
}

/// Whether a response should be followed under `policy`.
pub(crate) fn should_follow(policy: RedirectPolicy, status: StatusCode, headers: &HeaderMap) -> bool {
    policy.follow() && is_redirect_status(status) && headers.contains_key(LOCATION)
}

/// Options for the next hop of a redirect.
///
/// `redirect_urls` holds the targets already followed. Returns `Ok(None)`
/// when the response is not a redirect to follow.
pub(crate) fn resolve(
    current: &NormalizedOptions,
    status: StatusCode,
    headers: &HeaderMap,
    redirect_urls: &[Url],
) -> Result<Option<NormalizedOptions>, Error> {
    let policy = current.redirect();
    if !should_follow(policy, status, headers) {
        return Ok(None);
    }
    if redirect_urls.len() >= policy.max_redirects() {
        return Err(Error::new(ErrorKind::MaxRedirects {
            max_redirects: policy.max_redirects(),
            redirect_urls: redirect_urls.to_vec(),
        }));
    }

    let Some(location) = headers.get(LOCATION) else {
        return Ok(None);
    };
    let target = redirect_target(current.url(), location.as_bytes())?;

    let mut next = current.clone();
    let method = current.method().clone();
    let rewrite_to_get = (status == StatusCode::SEE_OTHER
        && method != Method::GET
        && method != Method::HEAD)
        || (policy.method_rewriting()
            && method == Method::POST
            && matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND));

    if rewrite_to_get {
        next.set_method(Method::GET);
        next.clear_body();
    } else if let Some(body) = current.body() {
        if !body.is_replayable() {
            return Err(Error::new(ErrorKind::RedirectBodyNotReplayable {
                status: status.as_u16(),
            }));
        }
    }

    if !same_hostname(current.url(), &target) {
        let headers = next.headers_mut();
        headers.remove(AUTHORIZATION);
        headers.remove(COOKIE);
        headers.remove(HOST);
        next.clear_credentials();
    }

    next.clear_search_params();
    next.set_url(target);
    Ok(Some(next))
}
