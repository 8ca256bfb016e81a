use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::{
    events::{EventSink, NoopSink, RequestEvent},
    CredentialProvider, RefreshError, RefreshOutcome, RefreshPhase,
};

/// Single-flight credential refresh shared by every request of one client.
///
/// The first caller that finds the coordinator idle starts a refresh cycle;
/// everyone arriving while it runs joins that cycle instead of starting
/// another. All participants observe the same [`RefreshOutcome`].
///
/// The refresh itself runs on a spawned task, so dropping any caller's future,
/// including the one that started the cycle, only removes that caller from the
/// waiter set.
pub struct CredentialRefreshCoordinator<P> {
    shared: Arc<Shared<P>>,
}

struct Shared<P> {
    provider: Arc<P>,
    state: Mutex<RefreshState>,
    refresh_timeout: Duration,
    events: Arc<dyn EventSink>,
}

enum RefreshState {
    Idle,
    Refreshing {
        started_at: Instant,
        // Holds `None` until the cycle completes.
        publisher: watch::Sender<Option<RefreshOutcome>>,
    },
}

enum Entry {
    /// This caller started the cycle.
    Owner(watch::Receiver<Option<RefreshOutcome>>),
    /// A cycle started by someone else was already running.
    Joined(watch::Receiver<Option<RefreshOutcome>>),
}

impl<P> Clone for CredentialRefreshCoordinator<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P> fmt::Debug for CredentialRefreshCoordinator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRefreshCoordinator")
            .field("phase", &self.shared.phase())
            .field("refresh_timeout", &self.shared.refresh_timeout)
            .finish()
    }
}

impl<P: CredentialProvider> CredentialRefreshCoordinator<P> {
    pub fn new(provider: Arc<P>, refresh_timeout: Duration) -> Self {
        Self::with_events(provider, refresh_timeout, Arc::new(NoopSink))
    }

    pub fn with_events(
        provider: Arc<P>,
        refresh_timeout: Duration,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                state: Mutex::new(RefreshState::Idle),
                refresh_timeout,
                events,
            }),
        }
    }

    pub fn provider(&self) -> &P {
        &self.shared.provider
    }

    pub fn phase(&self) -> RefreshPhase {
        self.shared.phase()
    }

    /// Waits for the outcome of the current refresh cycle, starting one if idle.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn await_refresh(&self) -> RefreshOutcome {
        match self.enter() {
            Entry::Owner(receiver) | Entry::Joined(receiver) => wait_for_outcome(receiver).await,
        }
    }

    /// Like [`await_refresh`](Self::await_refresh), but returns `None` instead of
    /// waiting when another caller's refresh is already in flight.
    pub async fn await_refresh_or_defer(&self) -> Option<RefreshOutcome> {
        match self.enter() {
            Entry::Owner(receiver) => Some(wait_for_outcome(receiver).await),
            Entry::Joined(_) => None,
        }
    }

    /// Joins the running cycle or starts a new one.
    ///
    /// The state check, the `Idle -> Refreshing` transition and the
    /// subscription all happen under one lock, so exactly one caller per cycle
    /// sees `Idle`.
    fn enter(&self) -> Entry {
        let mut state = self.shared.lock_state();
        if let RefreshState::Refreshing { publisher, .. } = &*state {
            return Entry::Joined(publisher.subscribe());
        }

        let (publisher, receiver) = watch::channel(None);
        let started_at = Instant::now();
        *state = RefreshState::Refreshing {
            started_at,
            publisher,
        };
        drop(state);

        self.shared.events.on_event(&RequestEvent::RefreshStarted);
        #[cfg(feature = "tracing")]
        tracing::info!("starting credential refresh");

        tokio::spawn(drive_cycle(Arc::clone(&self.shared), started_at));
        Entry::Owner(receiver)
    }
}

impl<P> Shared<P> {
    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        // The state is a plain enum; a panic elsewhere cannot leave it half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn phase(&self) -> RefreshPhase {
        match &*self.lock_state() {
            RefreshState::Idle => RefreshPhase::Idle,
            RefreshState::Refreshing { started_at, .. } => RefreshPhase::Refreshing {
                started_at: *started_at,
            },
        }
    }
}

async fn wait_for_outcome(
    mut receiver: watch::Receiver<Option<RefreshOutcome>>,
) -> RefreshOutcome {
    match receiver.wait_for(Option::is_some).await {
        Ok(outcome) => (*outcome).unwrap_or(RefreshOutcome::Failure),
        // Publisher dropped without an outcome.
        Err(_) => RefreshOutcome::Failure,
    }
}

async fn drive_cycle<P: CredentialProvider>(shared: Arc<Shared<P>>, started_at: Instant) {
    let mut cycle = CycleGuard {
        shared: Arc::clone(&shared),
        outcome: RefreshOutcome::Failure,
    };

    let (outcome, error) = match run_refresh(&shared).await {
        Ok(()) => (RefreshOutcome::Success, None),
        Err(err) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %err, "credential refresh failed");
            (RefreshOutcome::Failure, Some(err.to_string()))
        }
    };

    shared.events.on_event(&RequestEvent::RefreshCompleted {
        outcome,
        elapsed: started_at.elapsed(),
        error,
    });

    if outcome == RefreshOutcome::Failure {
        // Once per cycle, before any waiter is released.
        shared.provider.cancel_all_requests();
        shared.events.on_event(&RequestEvent::CancelledAll);
        #[cfg(feature = "tracing")]
        tracing::warn!("cancelled all outstanding requests after failed refresh");
    }

    cycle.outcome = outcome;
}

async fn run_refresh<P: CredentialProvider>(shared: &Shared<P>) -> Result<(), RefreshError> {
    let provider = Arc::clone(&shared.provider);
    let mut task = tokio::spawn(async move { provider.refresh_credentials().await });

    match tokio::time::timeout(shared.refresh_timeout, &mut task).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(err))) => Err(RefreshError::Provider(err)),
        Ok(Err(join)) if join.is_panic() => Err(RefreshError::Panicked),
        Ok(Err(_)) => Err(RefreshError::Aborted),
        Err(_) => {
            task.abort();
            Err(RefreshError::Timeout(shared.refresh_timeout))
        }
    }
}

/// Publishes the cycle outcome and returns the state to `Idle` when dropped.
///
/// Dropping without an explicit outcome (the driver task was torn down)
/// publishes `Failure`, so the state can never stay stuck in `Refreshing`.
struct CycleGuard<P> {
    shared: Arc<Shared<P>>,
    outcome: RefreshOutcome,
}

impl<P> Drop for CycleGuard<P> {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        // Waiters see the outcome before anyone can observe `Idle` again.
        if let RefreshState::Refreshing { publisher, .. } = &*state {
            publisher.send_replace(Some(self.outcome));
        }
        *state = RefreshState::Idle;

        #[cfg(feature = "tracing")]
        tracing::info!(outcome = ?self.outcome, "credential refresh cycle finished");
    }
}
