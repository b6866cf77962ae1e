//! Retry-on-authorization-failure helper.
//!
//! Every transport adapter wraps a single attempt with this policy: when the
//! attempt's outcome classifies as an authorization failure, force one
//! credential refresh and re-run the attempt exactly once. Anything else,
//! including other error statuses, is returned as-is.

use std::future::Future;

use secrecy::SecretString;
use tracing::debug;

use crate::credentials::{CredentialBroker, CredentialError};

/// Executes `op` with a token, retrying once on authorization failure.
///
/// `op` receives the token to present and must return the attempt outcome.
/// `is_auth_failure` classifies a *successful* outcome as an authorization
/// rejection (eg. HTTP 401/403); such outcomes trigger a forced refresh and
/// one more attempt, whose outcome is returned verbatim. Errors produced by
/// `op` itself are never retried here.
pub async fn retry_on_auth_failure<T, E, Op, Fut, Classify>(
    credentials: &CredentialBroker,
    mut op: Op,
    is_auth_failure: Classify,
) -> Result<T, E>
where
    Op: FnMut(SecretString) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Classify: Fn(&T) -> bool,
    E: From<CredentialError>,
{
    let token = credentials.token(false).await.map_err(E::from)?;
    let first = op(token).await?;
    if !is_auth_failure(&first) {
        return Ok(first);
    }

    debug!(event = "auth_retry", "authorization failure, refreshing credentials");
    let token = credentials.token(true).await.map_err(E::from)?;
    op(token).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures_util::FutureExt;
    use secrecy::{ExposeSecret, SecretString};

    use super::retry_on_auth_failure;
    use crate::credentials::{CredentialBroker, CredentialError, TokenFn};

    fn broker_with_counter() -> (CredentialBroker, Arc<AtomicUsize>) {
        let acquisitions = Arc::new(AtomicUsize::new(0));
        let source: TokenFn = Arc::new({
            let acquisitions = Arc::clone(&acquisitions);
            move |_force| {
                let n = acquisitions.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(SecretString::new(format!("tok-{n}"))) }.boxed()
            }
        });
        (CredentialBroker::new(source), acquisitions)
    }

    #[test]
    fn retries_once_after_auth_failure() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let (broker, acquisitions) = broker_with_counter();
            let attempts = AtomicUsize::new(0);

            let result: Result<u16, CredentialError> = retry_on_auth_failure(
                &broker,
                |token| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let status = if token.expose_secret() == "tok-2" {
                        200
                    } else {
                        401
                    };
                    async move { Ok(status) }
                },
                |status| *status == 401 || *status == 403,
            )
            .await;

            assert_eq!(result.expect("final outcome"), 200);
            assert_eq!(attempts.load(Ordering::SeqCst), 2);
            assert_eq!(acquisitions.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn second_auth_failure_is_returned_without_further_retries() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let (broker, acquisitions) = broker_with_counter();
            let attempts = AtomicUsize::new(0);

            let result: Result<u16, CredentialError> = retry_on_auth_failure(
                &broker,
                |_token| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(403) }
                },
                |status| *status == 401 || *status == 403,
            )
            .await;

            assert_eq!(result.expect("final outcome"), 403);
            assert_eq!(attempts.load(Ordering::SeqCst), 2);
            assert_eq!(acquisitions.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn non_auth_outcomes_pass_through_untouched() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let (broker, acquisitions) = broker_with_counter();

            let result: Result<u16, CredentialError> =
                retry_on_auth_failure(&broker, |_token| async move { Ok(503) }, |status| {
                    *status == 401 || *status == 403
                })
                .await;

            assert_eq!(result.expect("final outcome"), 503);
            assert_eq!(acquisitions.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn op_errors_are_not_retried() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let (broker, acquisitions) = broker_with_counter();
            let attempts = AtomicUsize::new(0);

            let result: Result<u16, CredentialError> = retry_on_auth_failure(
                &broker,
                |_token| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async move { Err(CredentialError::new("socket reset")) }
                },
                |_| true,
            )
            .await;

            assert!(result.is_err());
            assert_eq!(attempts.load(Ordering::SeqCst), 1);
            assert_eq!(acquisitions.load(Ordering::SeqCst), 1);
        });
    }
}
