use futures_util::future::BoxFuture;
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};
use tracing::warn;
use url::Url;

use crate::error::{BoxError, Error, ErrorKind};

/// Storage for cookies sent and received by sessions.
pub trait CookieJar: Send + Sync {
    /// `Cookie` header value for `url`; empty when nothing matches.
    fn get_cookie_string<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<String, BoxError>>;

    /// Stores one `Set-Cookie` header value received from `url`.
    fn set_cookie<'a>(&'a self, raw: &'a str, url: &'a Url) -> BoxFuture<'a, Result<(), BoxError>>;
}

fn jar_error(source: BoxError) -> Error {
    Error::new(ErrorKind::CookieJar { source })
}

/// Adds the jar's cookies for `url` to `headers`.
pub(crate) async fn attach_cookies(
    jar: &dyn CookieJar,
    url: &Url,
    headers: &mut HeaderMap,
) -> Result<(), Error> {
    let cookies = jar.get_cookie_string(url).await.map_err(jar_error)?;
    if cookies.is_empty() {
        return Ok(());
    }
    let value = HeaderValue::from_str(&cookies).map_err(|source| jar_error(Box::new(source)))?;
    headers.insert(COOKIE, value);
    Ok(())
}

/// Stores every `Set-Cookie` header of a response.
///
/// With `ignore_invalid` set, a rejected cookie is logged and skipped.
pub(crate) async fn store_cookies(
    jar: &dyn CookieJar,
    url: &Url,
    headers: &HeaderMap,
    ignore_invalid: bool,
) -> Result<(), Error> {
    for value in headers.get_all(SET_COOKIE) {
        let Ok(raw) = value.to_str() else {
            if ignore_invalid {
                continue;
            }
            return Err(jar_error("set-cookie header is not valid ASCII".into()));
        };
        if let Err(source) = jar.set_cookie(raw, url).await {
            if ignore_invalid {
                warn!(error = %source, "ignoring rejected cookie");
                continue;
            }
            return Err(jar_error(source));
        }
    }
    Ok(())
}
