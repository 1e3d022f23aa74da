//! Tower middleware which authenticates requests and leases them a tenant connection.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use pin_project::pin_project;
use thiserror::Error;

use super::{AuthError, Session, SessionVerifier, authenticate};
use crate::BoxFuture;
use crate::config::AuthConfig;
use crate::pool::{self, ConnectionFactory, Lease, TenantKey, TenantPool};

/// A request which names its tenant and carries a session token.
pub trait TenantRequest {
    /// The tenant the request is for, or `None` for the default tenant.
    fn tenant(&self) -> Option<TenantKey>;

    /// The session token, usually read from the cookie named `cookie_name`.
    fn session_token(&self, cookie_name: &str) -> Option<&str>;
}

/// Error returned by [`SessionGateService`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GateError<E> {
    /// The request's session could not be verified.
    #[error("access denied")]
    Denied(#[source] AuthError),

    /// No connection to the request's tenant could be leased.
    #[error("tenant connection unavailable")]
    Unavailable(#[source] pool::Error),

    /// The inner service failed.
    #[error(transparent)]
    Service(E),
}

impl<E> GateError<E> {
    /// Returns `true` if access was denied, which usually means a 401 response.
    pub fn is_denied(&self) -> bool {
        matches!(self, GateError::Denied(_))
    }

    /// Returns `true` if the tenant's database was unavailable, which usually means a
    /// 503 response.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, GateError::Unavailable(_))
    }
}

/// Layer which wraps a service in a [`SessionGateService`].
pub struct SessionGateLayer<F, V>
where
    F: ConnectionFactory,
{
    pool: TenantPool<F>,
    verifier: Arc<V>,
    config: Arc<AuthConfig>,
}

impl<F, V> SessionGateLayer<F, V>
where
    F: ConnectionFactory,
{
    /// Gate requests with `verifier`, leasing connections from `pool`.
    pub fn new(pool: TenantPool<F>, verifier: V, config: AuthConfig) -> Self {
        Self {
            pool,
            verifier: Arc::new(verifier),
            config: Arc::new(config),
        }
    }
}

impl<F, V> fmt::Debug for SessionGateLayer<F, V>
where
    F: ConnectionFactory,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGateLayer")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish()
    }
}

impl<F, V> Clone for SessionGateLayer<F, V>
where
    F: ConnectionFactory,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            verifier: self.verifier.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, F, V> tower::layer::Layer<S> for SessionGateLayer<F, V>
where
    F: ConnectionFactory,
{
    type Service = SessionGateService<S, F, V>;

    fn layer(&self, inner: S) -> Self::Service {
        SessionGateService {
            inner,
            pool: self.pool.clone(),
            verifier: self.verifier.clone(),
            config: self.config.clone(),
        }
    }
}

/// A service which verifies each request's session and leases a connection to the
/// request's tenant before calling the inner service.
///
/// The inner service is called with the [`Session`] and the original request. It is
/// never called for a request which failed verification or got no connection.
pub struct SessionGateService<S, F, V>
where
    F: ConnectionFactory,
{
    inner: S,
    pool: TenantPool<F>,
    verifier: Arc<V>,
    config: Arc<AuthConfig>,
}

impl<S, F, V> SessionGateService<S, F, V>
where
    F: ConnectionFactory,
{
    /// Wrap `inner` in a session gate.
    pub fn new(inner: S, pool: TenantPool<F>, verifier: V, config: AuthConfig) -> Self {
        Self {
            inner,
            pool,
            verifier: Arc::new(verifier),
            config: Arc::new(config),
        }
    }

    /// The wrapped service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// The pool connections are leased from.
    pub fn pool(&self) -> &TenantPool<F> {
        &self.pool
    }
}

impl<S: fmt::Debug, F, V> fmt::Debug for SessionGateService<S, F, V>
where
    F: ConnectionFactory,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGateService")
            .field("inner", &self.inner)
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish()
    }
}

impl<S: Clone, F, V> Clone for SessionGateService<S, F, V>
where
    F: ConnectionFactory,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            pool: self.pool.clone(),
            verifier: self.verifier.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, F, V, R> tower::Service<R> for SessionGateService<S, F, V>
where
    S: tower::Service<(Session<V::Claims, F::Connection>, R)> + Clone,
    F: ConnectionFactory,
    V: SessionVerifier,
    R: TenantRequest,
{
    type Response = S::Response;
    type Error = GateError<S::Error>;
    type Future = ResponseFuture<S, F::Connection, V::Claims, R>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: R) -> Self::Future {
        let token = request.session_token(&self.config.cookie_name);
        let claims = match authenticate(&*self.verifier, &self.config, token) {
            Ok(claims) => claims,
            Err(error) => {
                tracing::debug!(%error, "denying request");
                return ResponseFuture::error(GateError::Denied(error));
            }
        };

        let tenant = request.tenant();
        let pool = self.pool.clone();
        let acquire = Box::pin(async move { pool.acquire(tenant.as_ref().map(TenantKey::as_str)).await });

        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        ResponseFuture::new(acquire, inner, claims, request)
    }
}

/// Future returned by [`SessionGateService`].
#[pin_project]
pub struct ResponseFuture<S, C, T, R>
where
    S: tower::Service<(Session<T, C>, R)>,
{
    #[pin]
    state: State<S, C, T, R>,
    service: Option<S>,
}

impl<S, C, T, R> fmt::Debug for ResponseFuture<S, C, T, R>
where
    S: tower::Service<(Session<T, C>, R)>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture").finish()
    }
}

impl<S, C, T, R> ResponseFuture<S, C, T, R>
where
    S: tower::Service<(Session<T, C>, R)>,
{
    fn new(
        acquire: BoxFuture<'static, Result<Lease<C>, pool::Error>>,
        service: S,
        claims: T,
        request: R,
    ) -> Self {
        Self {
            state: State::Acquiring {
                acquire,
                claims: Some(claims),
                request: Some(request),
            },
            service: Some(service),
        }
    }

    fn error(error: GateError<S::Error>) -> Self {
        Self {
            state: State::Failed(Some(error)),
            service: None,
        }
    }
}

impl<S, C, T, R> Future for ResponseFuture<S, C, T, R>
where
    S: tower::Service<(Session<T, C>, R)>,
{
    type Output = Result<S::Response, GateError<S::Error>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let mut this = self.as_mut().project();
            let next = match this.state.as_mut().project() {
                StateProj::Acquiring {
                    acquire,
                    claims,
                    request,
                } => match ready!(acquire.as_mut().poll(cx)) {
                    Ok(lease) => State::Ready {
                        session: claims.take().map(|claims| Session::new(claims, lease)),
                        request: request.take(),
                    },
                    Err(error) => {
                        tracing::debug!(%error, "no connection for request");
                        return Poll::Ready(Err(GateError::Unavailable(error)));
                    }
                },
                StateProj::Ready { session, request } => {
                    let service = this.service.as_mut().expect("service polled after completion");
                    if let Err(error) = ready!(service.poll_ready(cx)) {
                        return Poll::Ready(Err(GateError::Service(error)));
                    }

                    let session = session.take().expect("session polled after completion");
                    let request = request.take().expect("request polled after completion");
                    State::Request(service.call((session, request)))
                }
                StateProj::Request(future) => {
                    return future.poll(cx).map_err(GateError::Service);
                }
                StateProj::Failed(error) => {
                    return Poll::Ready(Err(error.take().expect("error polled again")));
                }
            };
            this.state.set(next);
        }
    }
}

#[pin_project(project = StateProj)]
#[allow(clippy::large_enum_variant)]
enum State<S, C, T, R>
where
    S: tower::Service<(Session<T, C>, R)>,
{
    Acquiring {
        acquire: BoxFuture<'static, Result<Lease<C>, pool::Error>>,
        claims: Option<T>,
        request: Option<R>,
    },
    Ready {
        session: Option<Session<T, C>>,
        request: Option<R>,
    },
    Request(#[pin] S::Future),
    Failed(Option<GateError<S::Error>>),
}
