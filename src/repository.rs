//! Features repository: fetches features from the GrowthBook API and keeps them fresh.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

use crate::{
    callbacks::{FeatureRefreshCallback, Subscribers},
    fetcher::{endpoints, FeaturesFetcher, FeaturesPayload},
    refresh_thread::RefreshThread,
    Error, RepositoryConfig, Result,
};

/// Last successfully fetched features.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub features_json: String,
    pub saved_groups_json: String,
    pub fetched_at: DateTime<Utc>,
}

/// State shared between [`FeaturesRepository`] and its refresh thread.
pub(crate) struct RepositoryState {
    cache: RwLock<Option<Arc<CacheEntry>>>,
    callbacks: Subscribers<dyn FeatureRefreshCallback + Send + Sync>,
    swr_ttl: Duration,
    next_refresh_at: Mutex<Instant>,
    /// Set while a stale-while-revalidate fetch is queued or running.
    pub refresh_pending: AtomicBool,
    /// Set while the streaming connection is the active refresh mechanism.
    pub streaming: AtomicBool,
    closed: AtomicBool,
}

impl RepositoryState {
    fn new(swr_ttl: Duration) -> RepositoryState {
        RepositoryState {
            cache: RwLock::new(None),
            callbacks: Subscribers::new(),
            swr_ttl,
            next_refresh_at: Mutex::new(Instant::now()),
            refresh_pending: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn cached(&self) -> Option<Arc<CacheEntry>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_stale(&self) -> bool {
        Instant::now() >= *self.lock_next_refresh()
    }

    /// Push the next revalidation one TTL into the future.
    pub fn defer_next_refresh(&self) {
        *self.lock_next_refresh() = Instant::now() + self.swr_ttl;
    }

    fn lock_next_refresh(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.next_refresh_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Store freshly fetched features and notify subscribers.
    pub fn publish(&self, payload: FeaturesPayload) {
        let entry = Arc::new(CacheEntry {
            features_json: payload.features_json,
            saved_groups_json: payload.saved_groups_json,
            fetched_at: Utc::now(),
        });
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&entry));
        self.defer_next_refresh();

        log::debug!(target: "growthbook", fetched_at:display = entry.fetched_at; "features updated");
        for callback in self.callbacks.snapshot() {
            if self.is_closed() {
                return;
            }
            callback.on_saved_groups_refresh(&entry.saved_groups_json);
            callback.on_refresh(&entry.features_json);
        }
    }

    /// Report a background refresh failure. The cache is left untouched.
    pub fn report_error(&self, error: &Error) {
        log::warn!(target: "growthbook", error:display = error; "failed to refresh features");
        for callback in self.callbacks.snapshot() {
            if self.is_closed() {
                return;
            }
            callback.on_error(error);
        }
    }
}

/// A repository that fetches features from the GrowthBook API on a background thread and serves
/// them from an in-memory cache.
///
/// Feed the features into a [`GrowthBook`](crate::GrowthBook) client either by calling
/// [`FeaturesRepository::get_features_json`] or from a
/// [`FeaturesRepository::on_features_refresh`] callback.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use growthbook::{ContextConfig, RepositoryConfig};
/// let repository = RepositoryConfig::from_client_key("sdk-abc123").to_repository()?;
/// repository.initialize()?;
///
/// let client = Arc::new(
///     ContextConfig::new()
///         .features_json(repository.get_features_json())
///         .to_client()?,
/// );
///
/// let refreshed = Arc::clone(&client);
/// repository.on_features_refresh(move |features_json: &str| {
///     let _ = refreshed.set_features(features_json);
/// });
/// # Ok::<(), growthbook::Error>(())
/// ```
pub struct FeaturesRepository {
    config: RepositoryConfig,
    state: Arc<RepositoryState>,
    thread: RwLock<Option<RefreshThread>>,
    /// Serializes concurrent calls to [`FeaturesRepository::initialize`].
    init_lock: Mutex<()>,
}

impl FeaturesRepository {
    /// Create a new repository. No request is made until [`FeaturesRepository::initialize`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidApiHost`]
    /// - [`Error::InvalidClientKey`]
    pub fn new(config: RepositoryConfig) -> Result<FeaturesRepository> {
        endpoints(&config.api_host, &config.client_key)?;

        Ok(FeaturesRepository {
            state: Arc::new(RepositoryState::new(config.swr_ttl)),
            config,
            thread: RwLock::new(None),
            init_lock: Mutex::new(()),
        })
    }

    /// Fetch features for the first time and start the background refresh.
    ///
    /// Blocks until the first fetch completes. Calling `initialize` again after a successful call
    /// is a no-op; after a failed call it retries.
    ///
    /// # Errors
    ///
    /// Any fetch error. Use [`Error::code`] to tell configuration problems
    /// ([`FetchErrorCode::ConfigurationError`](crate::FetchErrorCode::ConfigurationError)) from
    /// an unreachable server
    /// ([`FetchErrorCode::NoResponseError`](crate::FetchErrorCode::NoResponseError)).
    /// [`Error::RepositoryClosed`] after [`FeaturesRepository::shutdown`].
    pub fn initialize(&self) -> Result<()> {
        let _guard = self.init_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state.is_closed() {
            return Err(Error::RepositoryClosed);
        }
        if self.read_thread().is_some() {
            return Ok(());
        }

        log::info!(target: "growthbook", api_host = self.config.api_host.as_str(), strategy:debug = self.config.refresh_strategy; "initializing features repository");
        let fetcher = FeaturesFetcher::new(&self.config)?;
        let thread = RefreshThread::start(fetcher, Arc::clone(&self.state), &self.config)?;

        if let Err(err) = thread.wait_for_initial_fetch() {
            log::warn!(target: "growthbook", error:display = err; "failed to initialize features repository");
            let _ = thread.shutdown();
            return Err(err);
        }

        let mut slot = self.thread.write().unwrap_or_else(PoisonError::into_inner);
        // `shutdown` may have run while the first fetch was in flight.
        if self.state.is_closed() {
            drop(slot);
            let _ = thread.shutdown();
            return Err(Error::RepositoryClosed);
        }
        *slot = Some(thread);
        Ok(())
    }

    /// Cached features JSON, `"{}"` before the first successful fetch.
    ///
    /// Never blocks on the network. Unless updates are being streamed, a cache older than
    /// [`RepositoryConfig::swr_ttl`] is returned as is and a single background re-fetch is
    /// scheduled.
    pub fn get_features_json(&self) -> String {
        self.revalidate_if_stale();
        match self.state.cached() {
            Some(entry) => entry.features_json.clone(),
            None => "{}".to_owned(),
        }
    }

    /// Cached saved groups JSON, `"{}"` before the first successful fetch or if the payload
    /// carries none.
    ///
    /// Pass it to [`GrowthBook::set_saved_groups`](crate::GrowthBook::set_saved_groups).
    pub fn get_saved_groups_json(&self) -> String {
        match self.state.cached() {
            Some(entry) => entry.saved_groups_json.clone(),
            None => "{}".to_owned(),
        }
    }

    /// Time of the last successful fetch.
    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.state.cached().map(|entry| entry.fetched_at)
    }

    /// Returns `true` while updates are pushed over a streaming connection.
    pub fn is_streaming(&self) -> bool {
        self.state.streaming.load(Ordering::Acquire)
    }

    /// Register a subscriber notified on the refresh thread after each successful fetch, and
    /// on background errors through [`FeatureRefreshCallback::on_error`].
    ///
    /// Subscribers must not call [`FeaturesRepository::refresh`] or
    /// [`FeaturesRepository::shutdown`] on the same repository.
    pub fn on_features_refresh(
        &self,
        callback: impl FeatureRefreshCallback + Send + Sync + 'static,
    ) {
        self.state.callbacks.add(Arc::new(callback));
    }

    /// Remove all subscribers.
    pub fn clear_callbacks(&self) {
        self.state.callbacks.clear();
    }

    /// Re-fetch features now, blocking until the request completes. Initializes the repository
    /// if needed.
    ///
    /// # Errors
    ///
    /// Any fetch error. The cache is left untouched on failure.
    pub fn refresh(&self) -> Result<()> {
        // The read guard must not be held while blocking, or `shutdown` would wait on the fetch.
        let refresher = self.read_thread().as_ref().map(RefreshThread::refresher);
        match refresher {
            Some(refresher) => refresher.refresh(),
            None => self.initialize(),
        }
    }

    /// Stop the background refresh and block until the refresh thread exits. No callback fires
    /// after this returns.
    ///
    /// # Errors
    ///
    /// [`Error::RefreshThreadPanicked`] if the refresh thread panicked.
    pub fn shutdown(&self) -> Result<()> {
        let thread = {
            let mut slot = self.thread.write().unwrap_or_else(PoisonError::into_inner);
            self.state.closed.store(true, Ordering::Release);
            slot.take()
        };
        match thread {
            Some(thread) => {
                log::debug!(target: "growthbook", "shutting down features repository");
                thread.shutdown()
            }
            None => Ok(()),
        }
    }

    fn revalidate_if_stale(&self) {
        if self.is_streaming() {
            return;
        }
        let thread = self.read_thread();
        let Some(thread) = thread.as_ref() else {
            return;
        };
        if !self.state.is_stale() {
            return;
        }
        if self
            .state
            .refresh_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.state.defer_next_refresh();
        if !thread.request_revalidate() {
            self.state.refresh_pending.store(false, Ordering::Release);
        }
    }

    fn read_thread(&self) -> std::sync::RwLockReadGuard<'_, Option<RefreshThread>> {
        self.thread.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for FeaturesRepository {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!(target: "growthbook", error:display = err; "refresh thread did not shut down cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::RepositoryState;
    use crate::{
        callbacks::FeatureRefreshCallback, fetcher::FeaturesPayload, Error, RepositoryConfig,
    };

    fn payload(features_json: &str) -> FeaturesPayload {
        FeaturesPayload {
            features_json: features_json.to_owned(),
            saved_groups_json: r#"{"grp":["1"]}"#.to_owned(),
        }
    }

    #[derive(Default)]
    struct Counter {
        refreshes: AtomicUsize,
        saved_groups: AtomicUsize,
        errors: AtomicUsize,
    }

    struct CountingCallback(Arc<Counter>);

    impl FeatureRefreshCallback for CountingCallback {
        fn on_refresh(&self, _features_json: &str) {
            self.0.refreshes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_saved_groups_refresh(&self, saved_groups_json: &str) {
            assert_eq!(saved_groups_json, r#"{"grp":["1"]}"#);
            self.0.saved_groups.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _error: &Error) {
            self.0.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert!(matches!(
            RepositoryConfig::from_client_key("").to_repository(),
            Err(Error::InvalidClientKey)
        ));
        assert!(matches!(
            RepositoryConfig::from_client_key("key")
                .api_host("::")
                .to_repository(),
            Err(Error::InvalidApiHost(_))
        ));
    }

    #[test]
    fn serves_empty_object_before_initialize() {
        let repository = RepositoryConfig::from_client_key("key")
            .api_host("http://127.0.0.1:9")
            .to_repository()
            .unwrap();
        assert_eq!(repository.get_features_json(), "{}");
        assert_eq!(repository.get_saved_groups_json(), "{}");
        assert!(repository.fetched_at().is_none());
        assert!(!repository.is_streaming());
    }

    #[test]
    fn shutdown_is_final() {
        let repository = RepositoryConfig::from_client_key("key")
            .api_host("http://127.0.0.1:9")
            .to_repository()
            .unwrap();
        repository.shutdown().unwrap();
        repository.shutdown().unwrap();
        assert!(matches!(
            repository.initialize(),
            Err(Error::RepositoryClosed)
        ));
    }

    #[test]
    fn publish_updates_cache_and_notifies_in_order() {
        let state = RepositoryState::new(std::time::Duration::from_secs(60));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for id in 0..3 {
            let order = Arc::clone(&order);
            state.callbacks.add(Arc::new(move |json: &str| {
                order.lock().unwrap().push((id, json.to_owned()));
            }));
        }

        assert!(state.is_stale());
        state.publish(payload("{\"a\":{}}"));
        assert!(!state.is_stale());
        assert_eq!(state.cached().unwrap().features_json, "{\"a\":{}}");
        assert_eq!(state.cached().unwrap().saved_groups_json, r#"{"grp":["1"]}"#);
        assert_eq!(
            *order.lock().unwrap(),
            vec![
                (0, "{\"a\":{}}".to_owned()),
                (1, "{\"a\":{}}".to_owned()),
                (2, "{\"a\":{}}".to_owned())
            ]
        );
    }

    #[test]
    fn closed_state_is_silent() {
        let state = RepositoryState::new(std::time::Duration::from_secs(60));
        let counter = Arc::new(Counter::default());
        state.callbacks.add(Arc::new(CountingCallback(Arc::clone(&counter))));

        state.report_error(&Error::RepositoryClosed);
        assert_eq!(counter.errors.load(Ordering::SeqCst), 1);

        state.publish(payload("{}"));
        assert_eq!(counter.saved_groups.load(Ordering::SeqCst), 1);
        assert_eq!(counter.refreshes.load(Ordering::SeqCst), 1);

        state.closed.store(true, Ordering::Release);
        state.publish(payload("{}"));
        state.report_error(&Error::RepositoryClosed);
        assert_eq!(counter.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(counter.errors.load(Ordering::SeqCst), 1);
        assert!(state.cached().is_some());
    }
}
