use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, TryStreamExt};
use http::header::{CONTENT_LENGTH, HeaderValue};
use http::{Request, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyDataStream, BodyExt, Empty, StreamBody};
use hyper::body::Frame;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpInfo;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::net::TcpStream;
use tower_service::Service;
use tracing::debug;

use super::{PhaseReporter, Transport, TransportError, TransportRequest, TransportResponse};
use crate::body::BodyStream;
use crate::error::{BoxError, Error, TimeoutPhase, TransportErrorKind};

const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

tokio::task_local! {
    static ATTEMPT_PHASES: PhaseReporter;
}

fn current_phases() -> Option<PhaseReporter> {
    ATTEMPT_PHASES.try_with(PhaseReporter::clone).ok()
}

fn default_port(uri: &Uri) -> u16 {
    match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    }
}

/// TCP connector that reports the lookup and connect phases separately.
#[derive(Clone, Debug, Default)]
struct PhasedConnector;

impl PhasedConnector {
    async fn connect(dst: Uri, phases: Option<PhaseReporter>) -> Result<TokioIo<TcpStream>, BoxError> {
        let host = dst
            .host()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']').to_owned())
            .ok_or_else(|| TransportError::new(TransportErrorKind::HostNotFound, "missing host"))?;
        let port = dst.port_u16().unwrap_or_else(|| default_port(&dst));

        if let Some(phases) = &phases {
            phases.started(TimeoutPhase::Lookup);
        }
        let addresses: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|source| {
                let kind = if source.to_string().contains("emporary") {
                    TransportErrorKind::DnsTemporaryFailure
                } else {
                    TransportErrorKind::HostNotFound
                };
                TransportError::new(kind, source)
            })?
            .collect();
        if let Some(phases) = &phases {
            phases.finished(TimeoutPhase::Lookup);
            phases.started(TimeoutPhase::Connect);
        }

        let mut last_error = None;
        for address in addresses {
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    if let Some(phases) = &phases {
                        phases.finished(TimeoutPhase::Connect);
                        if dst.scheme_str() == Some("https") {
                            phases.started(TimeoutPhase::SecureConnect);
                        }
                    }
                    debug!(%address, "connected");
                    return Ok(TokioIo::new(stream));
                }
                Err(error) => last_error = Some(error),
            }
        }
        let error = match last_error {
            Some(error) => TransportError::new(TransportErrorKind::from_io(&error), error),
            None => TransportError::new(TransportErrorKind::HostNotFound, "no addresses resolved"),
        };
        Err(Box::new(error))
    }
}

impl Service<Uri> for PhasedConnector {
    type Response = TokioIo<TcpStream>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let phases = current_phases();
        Box::pin(Self::connect(dst, phases))
    }
}

/// Outermost connector layer; marks the TLS handshake finished.
#[derive(Clone, Debug)]
struct ReportingConnector<C> {
    inner: C,
}

impl<C> Service<Uri> for ReportingConnector<C>
where
    C: Service<Uri> + Send + 'static,
    C::Response: Send + 'static,
    C::Future: Send + 'static,
    C::Error: Into<BoxError>,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let phases = current_phases();
        let secure = dst.scheme_str() == Some("https");
        let connecting = self.inner.call(dst);
        Box::pin(async move {
            let connection = connecting.await.map_err(Into::into)?;
            if secure {
                if let Some(phases) = phases {
                    phases.finished(TimeoutPhase::SecureConnect);
                }
            }
            Ok(connection)
        })
    }
}

#[cfg(feature = "tls-rustls-ring")]
type Connector = ReportingConnector<hyper_rustls::HttpsConnector<PhasedConnector>>;
#[cfg(not(feature = "tls-rustls-ring"))]
type Connector = ReportingConnector<PhasedConnector>;

#[cfg(feature = "tls-rustls-ring")]
fn build_connector() -> Result<Connector, Error> {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .map_err(|source| Error::validation(format!("failed to initialise TLS: {source}")))?
        .https_or_http()
        .enable_http1()
        .wrap_connector(PhasedConnector);
    Ok(ReportingConnector { inner: https })
}

#[cfg(not(feature = "tls-rustls-ring"))]
fn build_connector() -> Result<Connector, Error> {
    Ok(ReportingConnector {
        inner: PhasedConnector,
    })
}

#[derive(Clone, Debug)]
pub struct HyperTransportBuilder {
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
}

impl Default for HyperTransportBuilder {
    fn default() -> Self {
        Self {
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
        }
    }
}

impl HyperTransportBuilder {
    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host;
        self
    }

    pub fn build(self) -> Result<HyperTransport, Error> {
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(self.pool_idle_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .build(build_connector()?);
        Ok(HyperTransport { client })
    }
}

/// Pooled HTTP/1.1 transport over hyper, with rustls for `https` when the
/// `tls-rustls-ring` feature is on.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<Connector, RequestBody>,
}

impl HyperTransport {
    pub fn new() -> Result<Self, Error> {
        Self::builder().build()
    }

    pub fn builder() -> HyperTransportBuilder {
        HyperTransportBuilder::default()
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

fn map_infallible(never: Infallible) -> BoxError {
    match never {}
}

fn request_body(body: Option<BodyStream>, body_len: Option<u64>) -> RequestBody {
    match body {
        Some(stream) if body_len != Some(0) => {
            StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync()
        }
        _ => Empty::<Bytes>::new().map_err(map_infallible).boxed_unsync(),
    }
}

async fn send(
    client: Client<Connector, RequestBody>,
    request: TransportRequest,
) -> Result<TransportResponse, TransportError> {
    let uri: Uri = request
        .url
        .as_str()
        .parse()
        .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;

    let mut builder = Request::builder().method(request.method).uri(uri);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(request.headers);
        if let Some(body_len) = request.body_len {
            if request.body.is_some() && !headers.contains_key(CONTENT_LENGTH) {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
            }
        }
    }
    let http_request = builder
        .body(request_body(request.body, request.body_len))
        .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;

    let response = client
        .request(http_request)
        .await
        .map_err(|source| TransportError::classify(Box::new(source)))?;
    let remote_addr = response
        .extensions()
        .get::<HttpInfo>()
        .map(HttpInfo::remote_addr);
    let (parts, incoming) = response.into_parts();
    let body = BodyDataStream::new(incoming)
        .map(|chunk| chunk.map_err(|source| TransportError::classify(Box::new(source))))
        .boxed();

    Ok(TransportResponse {
        status: parts.status,
        headers: parts.headers,
        body,
        remote_addr,
    })
}

impl Transport for HyperTransport {
    #[cfg(feature = "tls-rustls-ring")]
    fn supports_scheme(&self, scheme: &str) -> bool {
        matches!(scheme, "http" | "https")
    }

    #[cfg(not(feature = "tls-rustls-ring"))]
    fn supports_scheme(&self, scheme: &str) -> bool {
        scheme == "http"
    }

    fn dispatch(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        let client = self.client.clone();
        let phases = request.phases.clone();
        Box::pin(ATTEMPT_PHASES.scope(phases, send(client, request)))
    }
}
