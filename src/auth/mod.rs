//! Session verification.
//!
//! A request is only served once its session token has been verified. Verification
//! itself is delegated to a [`SessionVerifier`], so the token format and the crypto
//! behind it are up to the application. This module decides what happens around it:
//! where the token and secret come from, and which failures deny the request.
//!
//! [`service::SessionGateLayer`] applies the check to a tower service and pairs the
//! verified claims with a pooled connection for the request's tenant.

use std::fmt;
use std::ops::Deref;

use thiserror::Error;

use crate::BoxError;
use crate::config::AuthConfig;
use crate::pool::{Lease, TenantKey};

pub mod service;

/// Why a session token was rejected by a [`SessionVerifier`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerificationError {
    /// The token could not be decoded.
    #[error("session token is malformed")]
    Malformed,

    /// The token was valid but has expired.
    #[error("session token has expired")]
    Expired,

    /// The token was not signed with the configured secret.
    #[error("session token signature does not match")]
    BadSignature,

    /// The verifier failed for another reason.
    #[error(transparent)]
    Other(BoxError),
}

impl VerificationError {
    /// Wrap any error as a verification failure.
    pub fn other<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        VerificationError::Other(error.into())
    }
}

/// Error returned when a request can't be authenticated.
///
/// Every variant denies the request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The request carried no session token.
    #[error("no session token")]
    MissingToken,

    /// No secret is configured, so no token can be verified.
    #[error("no session secret configured")]
    MissingSecret,

    /// The session token was rejected.
    #[error("invalid session token")]
    Invalid(#[from] VerificationError),
}

impl AuthError {
    /// Returns `true` if the request should be answered with access denied.
    pub fn is_denied(&self) -> bool {
        matches!(
            self,
            AuthError::MissingToken | AuthError::MissingSecret | AuthError::Invalid(_)
        )
    }

    /// Returns `true` if the failure is due to server configuration rather than the
    /// request.
    pub fn is_misconfigured(&self) -> bool {
        matches!(self, AuthError::MissingSecret)
    }
}

/// Verifies session tokens.
///
/// Implementations must not have side effects visible to the pool; a token is verified
/// at most once per request and never retried. Closures with the same signature as
/// [`SessionVerifier::verify`] implement this trait.
pub trait SessionVerifier: Send + Sync + 'static {
    /// What a valid token decodes to.
    type Claims: Send + 'static;

    /// Verify `token`, which was signed with `secret` and derived with `salt`.
    fn verify(&self, token: &str, secret: &str, salt: &str) -> Result<Self::Claims, VerificationError>;
}

impl<F, T> SessionVerifier for F
where
    F: Fn(&str, &str, &str) -> Result<T, VerificationError> + Send + Sync + 'static,
    T: Send + 'static,
{
    type Claims = T;

    fn verify(&self, token: &str, secret: &str, salt: &str) -> Result<Self::Claims, VerificationError> {
        (self)(token, secret, salt)
    }
}

/// Check a request's session token, returning its claims.
///
/// A missing (or blank) token is checked before a missing secret, so an anonymous
/// request is reported as such even on a misconfigured server.
pub fn authenticate<V>(verifier: &V, config: &AuthConfig, token: Option<&str>) -> Result<V::Claims, AuthError>
where
    V: SessionVerifier + ?Sized,
{
    let token = token
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingToken)?;
    let secret = config.secret().ok_or(AuthError::MissingSecret)?;

    verifier.verify(token, secret, &config.salt).map_err(|error| {
        tracing::debug!(%error, "session token rejected");
        AuthError::from(error)
    })
}

/// Find the value of cookie `name` in a `Cookie` header.
pub fn cookie_value<'h>(header: &'h str, name: &str) -> Option<&'h str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key.trim() == name).then(|| value.trim().trim_matches('"'))
    })
}

/// A verified session with a connection to its tenant's database.
///
/// Dropping the session releases the connection.
pub struct Session<T, C> {
    claims: T,
    lease: Lease<C>,
}

impl<T, C> Session<T, C> {
    /// Pair verified claims with a leased connection.
    pub fn new(claims: T, lease: Lease<C>) -> Self {
        Self { claims, lease }
    }

    /// The verified claims.
    pub fn claims(&self) -> &T {
        &self.claims
    }

    /// The lease on the tenant's connection.
    pub fn lease(&self) -> &Lease<C> {
        &self.lease
    }

    /// The tenant this session is connected to.
    pub fn tenant(&self) -> &TenantKey {
        self.lease.tenant()
    }

    /// Split the session into its claims and lease.
    pub fn into_parts(self) -> (T, Lease<C>) {
        (self.claims, self.lease)
    }
}

impl<T, C> Deref for Session<T, C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.lease
    }
}

impl<T: fmt::Debug, C> fmt::Debug for Session<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("claims", &self.claims)
            .field("lease", &self.lease)
            .finish()
    }
}
