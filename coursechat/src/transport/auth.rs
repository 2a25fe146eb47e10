//! Single refresh-and-retry wrapper for authenticated calls.

use std::future::Future;

use super::{AccessToken, AuthProvider, TransportError};

/// Runs `op` with a fresh access token.
///
/// If `op` fails with [`TransportError::Unauthorized`], the token is
/// refreshed once and `op` is retried once. A second `Unauthorized` is
/// returned to the caller.
///
/// # Errors
///
/// Returns whatever `op` or the auth provider returns.
pub async fn authorized<A, F, Fut, T>(auth: &A, op: F) -> Result<T, TransportError>
where
    A: AuthProvider + ?Sized,
    F: Fn(AccessToken) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let token = auth.access_token().await?;
    match op(token).await {
        Err(TransportError::Unauthorized) => {
            tracing::debug!("access token rejected, refreshing once");
            let token = auth.refresh().await?;
            op(token).await
        }
        other => other,
    }
}
