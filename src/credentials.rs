//! Bearer-token cache and refresh coordination.
//!
//! `CredentialBroker` owns the current token for a client and mediates
//! concurrent refresh requests: however many callers ask for a token while a
//! refresh is outstanding, exactly one acquisition runs and every caller
//! observes its settled result.

use std::sync::Arc;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use secrecy::SecretString;
use thiserror::Error;
use tracing::debug;

/// Application-supplied token acquisition hook.
///
/// The `bool` argument requests a forced refresh; implementations should mint
/// a new token rather than returning a cached one when it is set.
pub type TokenFn =
    Arc<dyn Fn(bool) -> BoxFuture<'static, Result<SecretString, CredentialError>> + Send + Sync>;

/// Token acquisition failed.
///
/// Cloneable so that every caller joined to a coalesced refresh can receive
/// the same failure.
#[derive(Clone, Debug, Error)]
#[error("credential acquisition failed: {0}")]
pub struct CredentialError(String);

impl CredentialError {
    /// Creates an error from any displayable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Coalesces concurrent identical async operations into one shared run.
///
/// The cell is either idle or holds one shared pending future. Callers join
/// whatever is in flight; the cell is cleared unconditionally once the shared
/// future settles, success or failure.
pub struct SingleFlight<T: Clone> {
    slot: Mutex<Option<Shared<BoxFuture<'static, T>>>>,
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    /// Creates an idle cell.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Joins the in-flight operation, starting one with `make` if idle.
    pub async fn run<F, Fut>(&self, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let started = make().boxed().shared();
                    *slot = Some(started.clone());
                    started
                }
            }
        };

        let value = shared.clone().await;

        // Only the generation we joined may clear the cell; a later run may
        // already occupy it.
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&shared)) {
            *slot = None;
        }
        value
    }
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared token owner for all transports of a client.
#[derive(Clone)]
pub struct CredentialBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    acquire: TokenFn,
    cached: Mutex<Option<SecretString>>,
    refresh: SingleFlight<Result<SecretString, CredentialError>>,
}

impl CredentialBroker {
    /// Creates a broker with no cached token.
    pub fn new(acquire: TokenFn) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                acquire,
                cached: Mutex::new(None),
                refresh: SingleFlight::new(),
            }),
        }
    }

    /// Returns a valid bearer token, acquiring one if needed.
    ///
    /// A cached token is returned without awaiting unless `force_refresh` is
    /// set. A forced request bypasses the cache but still coalesces with any
    /// acquisition already in flight, so concurrent callers never trigger a
    /// second acquisition.
    pub async fn token(&self, force_refresh: bool) -> Result<SecretString, CredentialError> {
        if !force_refresh {
            if let Some(token) = self.inner.cached.lock().clone() {
                return Ok(token);
            }
        }

        let acquire = Arc::clone(&self.inner.acquire);
        let inner = Arc::clone(&self.inner);
        debug!(event = "token_requested", force_refresh);

        self.inner
            .refresh
            .run(move || async move {
                let token = (acquire)(force_refresh).await?;
                *inner.cached.lock() = Some(token.clone());
                Ok(token)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::FutureExt;
    use parking_lot::Mutex;
    use secrecy::{ExposeSecret, SecretString};

    use super::{CredentialBroker, CredentialError, TokenFn};

    fn counting_source(
        tokens: Vec<Result<&'static str, &'static str>>,
        delay: Duration,
    ) -> (TokenFn, Arc<AtomicUsize>, Arc<Mutex<Vec<bool>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let flags = Arc::new(Mutex::new(Vec::new()));
        let source: TokenFn = Arc::new({
            let calls = Arc::clone(&calls);
            let flags = Arc::clone(&flags);
            move |force| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                flags.lock().push(force);
                let outcome = tokens[call.min(tokens.len() - 1)];
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    outcome
                        .map(|token| SecretString::new(token.to_string()))
                        .map_err(CredentialError::new)
                }
                .boxed()
            }
        });
        (source, calls, flags)
    }

    #[test]
    fn concurrent_requests_share_one_acquisition() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let (source, calls, _) =
                counting_source(vec![Ok("tok-1")], Duration::from_millis(5));
            let broker = CredentialBroker::new(source);

            let (a, b, c) =
                tokio::join!(broker.token(false), broker.token(false), broker.token(false));

            assert_eq!(a.expect("a").expose_secret(), "tok-1");
            assert_eq!(b.expect("b").expose_secret(), "tok-1");
            assert_eq!(c.expect("c").expose_secret(), "tok-1");
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn cached_token_returns_without_acquisition() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let (source, calls, _) = counting_source(vec![Ok("tok-1")], Duration::ZERO);
            let broker = CredentialBroker::new(source);

            broker.token(false).await.expect("prime");
            let again = broker.token(false).await.expect("cached");

            assert_eq!(again.expose_secret(), "tok-1");
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn forced_refresh_bypasses_cache_but_coalesces() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let (source, calls, flags) = counting_source(
                vec![Ok("tok-1"), Ok("tok-2")],
                Duration::from_millis(5),
            );
            let broker = CredentialBroker::new(source);
            broker.token(false).await.expect("prime");

            // Two forced callers racing: one acquisition between them.
            let (a, b) = tokio::join!(broker.token(true), broker.token(true));
            assert_eq!(a.expect("a").expose_secret(), "tok-2");
            assert_eq!(b.expect("b").expose_secret(), "tok-2");
            assert_eq!(calls.load(Ordering::SeqCst), 2);
            assert_eq!(*flags.lock(), vec![false, true]);
        });
    }

    #[test]
    fn failed_refresh_clears_in_flight_state() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let (source, calls, _) = counting_source(
                vec![Err("issuer offline"), Ok("tok-2")],
                Duration::ZERO,
            );
            let broker = CredentialBroker::new(source);

            let err = broker.token(false).await.expect_err("first fails");
            assert!(err.to_string().contains("issuer offline"));

            let token = broker.token(false).await.expect("second succeeds");
            assert_eq!(token.expose_secret(), "tok-2");
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        });
    }
}
