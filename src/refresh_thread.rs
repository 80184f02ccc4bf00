//! A background thread that fetches features, keeps them fresh and stores them in the repository
//! cache.
use std::{
    sync::{atomic::Ordering, Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use rand::{thread_rng, Rng};
use tokio::sync::{mpsc, watch};

use crate::{
    fetcher::{FeaturesFetcher, FeaturesPayload},
    repository::RepositoryState,
    sse::{EventDecoder, ServerEvent},
    Error, RefreshStrategy, RepositoryConfig, Result,
};

/// Delay policy between reconnects of the streaming connection.
///
/// The delay doubles after every consecutive failure, starting at [`Backoff::initial`] and capped
/// at [`Backoff::max`]. A random duration up to [`Backoff::jitter`] is subtracted so that many
/// clients disconnected at once do not reconnect in lockstep.
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first reconnect.
    ///
    /// Defaults to [`Backoff::DEFAULT_INITIAL`].
    pub initial: Duration,
    /// Upper bound for the delay.
    ///
    /// Defaults to [`Backoff::DEFAULT_MAX`].
    pub max: Duration,
    /// Maximum randomized duration subtracted from each delay.
    ///
    /// Defaults to [`Backoff::DEFAULT_JITTER`].
    pub jitter: Duration,
}

impl Backoff {
    /// Default value for [`Backoff::initial`].
    pub const DEFAULT_INITIAL: Duration = Duration::from_secs(1);
    /// Default value for [`Backoff::max`].
    pub const DEFAULT_MAX: Duration = Duration::from_secs(30);
    /// Default value for [`Backoff::jitter`].
    pub const DEFAULT_JITTER: Duration = Duration::from_millis(500);

    /// Create a new `Backoff` using default configuration.
    pub fn new() -> Backoff {
        Backoff::default()
    }

    /// Update initial delay with `initial`.
    pub fn with_initial(mut self, initial: Duration) -> Backoff {
        self.initial = initial;
        self
    }

    /// Update maximum delay with `max`.
    pub fn with_max(mut self, max: Duration) -> Backoff {
        self.max = max;
        self
    }

    /// Update jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> Backoff {
        self.jitter = jitter;
        self
    }

    /// Delay before reconnect number `attempt`, counting from zero.
    ///
    /// ```
    /// # use std::time::Duration;
    /// # use growthbook::Backoff;
    /// let backoff = Backoff::new().with_jitter(Duration::ZERO);
    /// assert_eq!(backoff.delay(0), Duration::from_secs(1));
    /// assert_eq!(backoff.delay(3), Duration::from_secs(8));
    /// assert_eq!(backoff.delay(10), Duration::from_secs(30));
    /// ```
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .initial
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max);
        jitter(exponential, self.jitter)
    }
}

impl Default for Backoff {
    fn default() -> Backoff {
        Backoff {
            initial: Backoff::DEFAULT_INITIAL,
            max: Backoff::DEFAULT_MAX,
            jitter: Backoff::DEFAULT_JITTER,
        }
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

enum Command {
    /// Stale-while-revalidate trigger. Clears [`RepositoryState::refresh_pending`] when done.
    Revalidate,
    /// Explicit refresh requested by the host, which blocks on the reply.
    Refresh(std::sync::mpsc::SyncSender<Result<()>>),
}

/// The repository's refresh thread.
///
/// The thread performs the first fetch, then either serves revalidation requests or keeps a
/// streaming connection open, depending on [`RepositoryConfig::refresh_strategy`]. All network
/// I/O and all refresh callbacks run on this thread.
pub(crate) struct RefreshThread {
    join_handle: std::thread::JoinHandle<()>,

    commands: mpsc::UnboundedSender<Command>,

    /// Used to send a stop signal to the refresh thread. Unlike a command, the signal interrupts
    /// in-flight requests and reconnect delays.
    stop_sender: watch::Sender<bool>,

    /// Holds `None` until the first fetch completes, then the outcome of that fetch.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl RefreshThread {
    /// Starts the refresh thread.
    ///
    /// # Errors
    ///
    /// - IO Error if the thread failed to start.
    pub fn start(
        fetcher: FeaturesFetcher,
        state: Arc<RepositoryState>,
        config: &RepositoryConfig,
    ) -> std::io::Result<RefreshThread> {
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let (stop_sender, stop_receiver) = watch::channel(false);

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let worker = Worker {
            fetcher,
            state,
            strategy: config.refresh_strategy,
            retry_on_failure: config.retry_on_failure,
            max_reconnect_attempts: config.max_reconnect_attempts,
            backoff: config.backoff.clone(),
            commands: command_receiver,
            stop: stop_receiver,
        };

        let join_handle = {
            // Cloning Arc for move into thread
            let result = Arc::clone(&result);
            let update_result = move |value| {
                *result.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
                result.1.notify_all();
            };

            std::thread::Builder::new()
                .name("growthbook-refresh".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(runtime) => runtime,
                            Err(err) => {
                                update_result(Err(Error::from(err)));
                                return;
                            }
                        };

                        runtime.block_on(worker.run(&update_result));
                    }));

                    // If catch_unwind returns Err, it means a panic occurred.
                    if let Err(_panic_info) = result {
                        log::error!(target: "growthbook", "refresh thread panicked");
                        update_result(Err(Error::RefreshThreadPanicked));
                    }
                })?
        };

        Ok(RefreshThread {
            join_handle,
            commands,
            stop_sender,
            result,
        })
    }

    /// Blocks until the first fetch completes and returns its outcome.
    ///
    /// # Errors
    ///
    /// - Any fetch error. The thread exits after a failed first fetch.
    /// - [`Error::RefreshThreadPanicked`]
    pub fn wait_for_initial_fetch(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::RefreshThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::RefreshThreadPanicked)?;
                }
            }
        }
    }

    /// Queue a background revalidation. Returns `false` if the thread has exited.
    pub fn request_revalidate(&self) -> bool {
        self.commands.send(Command::Revalidate).is_ok()
    }

    /// A handle for explicit refreshes that does not borrow the thread.
    pub fn refresher(&self) -> Refresher {
        Refresher {
            commands: self.commands.clone(),
        }
    }

    /// Stop the refresh thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped, i.e. the thread has already exited.
        let _ = self.stop_sender.send(true);
    }

    /// Stop the refresh thread and block waiting for it to exit.
    ///
    /// # Errors
    ///
    /// - [`Error::RefreshThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        // Send stop signal in case it wasn't sent before.
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::RefreshThreadPanicked)?;

        Ok(())
    }
}

/// Requests explicit refreshes from a [`RefreshThread`].
pub(crate) struct Refresher {
    commands: mpsc::UnboundedSender<Command>,
}

impl Refresher {
    /// Fetch features on the refresh thread and block until done.
    ///
    /// Must not be called from the refresh thread itself, e.g. from a refresh callback.
    ///
    /// # Errors
    ///
    /// Any fetch error. [`Error::RepositoryClosed`] if the thread stops before replying.
    pub fn refresh(&self) -> Result<()> {
        let (reply, response) = std::sync::mpsc::sync_channel(1);
        self.commands
            .send(Command::Refresh(reply))
            .map_err(|_| Error::RepositoryClosed)?;
        response.recv().map_err(|_| Error::RepositoryClosed)?
    }
}

/// How a streaming session ended.
enum StreamEnd {
    /// Stop was requested.
    Stopped,
    Failed {
        /// Whether the connection was established before failing.
        connected: bool,
        error: Error,
    },
}

struct Worker {
    fetcher: FeaturesFetcher,
    state: Arc<RepositoryState>,
    strategy: RefreshStrategy,
    retry_on_failure: bool,
    max_reconnect_attempts: u32,
    backoff: Backoff,
    commands: mpsc::UnboundedReceiver<Command>,
    stop: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self, report_initial: &impl Fn(Result<()>)) {
        let initial = tokio::select! {
            result = self.fetcher.fetch_features() => result,
            _ = stopped(&mut self.stop) => Err(Error::RepositoryClosed),
        };
        let fetched = match initial {
            Ok(fetched) => fetched,
            Err(err) => {
                report_initial(Err(err));
                return;
            }
        };
        self.store(fetched.payload);
        report_initial(Ok(()));

        if self.strategy == RefreshStrategy::ServerSentEvents {
            if fetched.sse_supported {
                self.stream().await;
            } else {
                log::info!(target: "growthbook", "server does not support streaming, falling back to stale-while-revalidate");
            }
        }

        self.serve_commands().await;
        log::debug!(target: "growthbook", "refresh thread received stop command");
    }

    async fn serve_commands(&mut self) {
        loop {
            let command = tokio::select! {
                command = self.commands.recv() => command,
                _ = stopped(&mut self.stop) => None,
            };
            match command {
                Some(command) => self.handle_command(command).await,
                // Stopped, or the repository is gone.
                None => return,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Revalidate => {
                if let Err(err) = self.fetch_and_publish().await {
                    self.state.report_error(&err);
                }
                self.state.refresh_pending.store(false, Ordering::Release);
            }
            Command::Refresh(reply) => {
                let result = self.fetch_and_publish().await;
                // The host may have given up waiting.
                let _ = reply.send(result);
            }
        }
    }

    async fn fetch_and_publish(&mut self) -> Result<()> {
        let fetched = tokio::select! {
            result = self.fetcher.fetch_features() => result?,
            _ = stopped(&mut self.stop) => return Err(Error::RepositoryClosed),
        };
        self.store(fetched.payload);
        Ok(())
    }

    fn store(&self, payload: Option<FeaturesPayload>) {
        match payload {
            Some(payload) => self.state.publish(payload),
            // Not modified. Subscribers already have these features.
            None => self.state.defer_next_refresh(),
        }
    }

    /// Keep the streaming connection open, reconnecting with backoff. Returns when stopped or
    /// when reconnects are exhausted, in which case the error has been reported.
    async fn stream(&mut self) {
        self.state.streaming.store(true, Ordering::Release);
        let mut failures: u32 = 0;
        loop {
            match self.stream_once(failures > 0).await {
                StreamEnd::Stopped => break,
                StreamEnd::Failed { connected, error } => {
                    failures = if connected { 1 } else { failures + 1 };
                    // Rejected credentials or a bad payload will not fix themselves.
                    if error.is_fatal()
                        || !self.retry_on_failure
                        || failures > self.max_reconnect_attempts
                    {
                        let error = Error::StreamConnection {
                            attempts: failures,
                            source: Arc::new(error),
                        };
                        self.state.streaming.store(false, Ordering::Release);
                        self.state.report_error(&error);
                        log::warn!(target: "growthbook", "streaming disabled, falling back to stale-while-revalidate");
                        return;
                    }

                    let delay = self.backoff.delay(failures - 1);
                    log::debug!(target: "growthbook", error:display = error, attempt = failures, delay_ms = delay.as_millis() as u64; "streaming connection lost, reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stopped(&mut self.stop) => break,
                    }
                }
            }
        }
        self.state.streaming.store(false, Ordering::Release);
    }

    async fn stream_once(&mut self, resync: bool) -> StreamEnd {
        let connected = tokio::select! {
            result = self.fetcher.connect_stream() => result,
            _ = stopped(&mut self.stop) => return StreamEnd::Stopped,
        };
        let mut response = match connected {
            Ok(response) => response,
            Err(error) => {
                return StreamEnd::Failed {
                    connected: false,
                    error,
                }
            }
        };
        log::debug!(target: "growthbook", "streaming connection established");

        if resync {
            // Catch up on updates pushed while disconnected.
            if let Err(err) = self.fetch_and_publish().await {
                self.state.report_error(&err);
            }
        }

        let mut decoder = EventDecoder::default();
        loop {
            tokio::select! {
                chunk = response.chunk() => match chunk {
                    Ok(Some(bytes)) => {
                        for event in decoder.feed(&bytes) {
                            self.handle_event(event).await;
                        }
                    }
                    Ok(None) => {
                        return StreamEnd::Failed {
                            connected: true,
                            error: std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "streaming connection closed by server",
                            )
                            .into(),
                        }
                    }
                    Err(err) => {
                        return StreamEnd::Failed {
                            connected: true,
                            error: err.into(),
                        }
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => return StreamEnd::Stopped,
                },
                _ = stopped(&mut self.stop) => return StreamEnd::Stopped,
            }
        }
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        match event.event.as_deref() {
            None | Some("features") | Some("message") => {
                match self.fetcher.parse_payload(&event.data) {
                    Ok(payload) => self.state.publish(payload),
                    Err(err) => self.state.report_error(&err),
                }
            }
            Some("features-updated") => {
                if let Err(err) = self.fetch_and_publish().await {
                    self.state.report_error(&err);
                }
            }
            Some(other) => {
                log::debug!(target: "growthbook", event = other; "ignoring unknown streaming event");
            }
        }
    }
}

/// Resolves once stop is requested or the [`RefreshThread`] handle is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Backoff;

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::from_secs(30);

        let result = super::jitter(interval, jitter);

        assert!(result <= interval, "{result:?} must be <= {interval:?}");
    }

    #[test]
    fn jitter_truncates_to_zero() {
        let result = super::jitter(Duration::ZERO, Duration::from_secs(30));

        assert_eq!(result, Duration::ZERO);
    }

    #[test]
    fn jitter_works_with_zero_jitter() {
        let result = super::jitter(Duration::from_secs(30), Duration::ZERO);

        assert_eq!(result, Duration::from_secs(30));
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let backoff = Backoff::new()
            .with_initial(Duration::from_millis(100))
            .with_max(Duration::from_millis(500))
            .with_jitter(Duration::ZERO);

        let delays: Vec<_> = (0..5).map(|attempt| backoff.delay(attempt)).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 500, 500].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn backoff_does_not_overflow() {
        let backoff = Backoff::new().with_jitter(Duration::ZERO);
        assert_eq!(backoff.delay(u32::MAX), Backoff::DEFAULT_MAX);
    }

    #[test]
    fn backoff_jitter_stays_below_delay() {
        let backoff = Backoff::new();
        for attempt in 0..8 {
            let delay = backoff.delay(attempt);
            let ceiling = Backoff::new().with_jitter(Duration::ZERO).delay(attempt);
            assert!(delay <= ceiling);
            assert!(delay + Backoff::DEFAULT_JITTER >= ceiling);
        }
    }
}
