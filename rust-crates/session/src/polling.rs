use crate::{
    approval::ApprovalCoordinator,
    config::PollingConfig,
    errors::classify,
    executor::TransactionExecutor,
    ledger::{
        LedgerReader,
        LedgerWriter,
    },
    notifications::{
        Component,
        Notice,
        Notifier,
    },
    reconcile::{
        LedgerSnapshot,
        fold_snapshot,
    },
    store::{
        GameSessionStore,
        PatchSource,
    },
    types::{
        Address,
        GameStatus,
        Phase,
        TokenAllowance,
        TransactionKind,
    },
};
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use rand::Rng;
use std::{
    sync::{
        Arc,
        Mutex,
        PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc::{
        self,
        error::TrySendError,
    },
    time::{
        self,
        Instant,
    },
};
use tracing::{
    debug,
    info,
    warn,
};

const COMMAND_BUFFER: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollerCommand {
    FetchNow,
    Shutdown,
}

pub fn poller_channel() -> (mpsc::Sender<PollerCommand>, mpsc::Receiver<PollerCommand>) {
    mpsc::channel(COMMAND_BUFFER)
}

/// Handle to whichever poller is running for the current identity.
#[derive(Clone, Debug, Default)]
pub struct PollTrigger {
    tx: Arc<Mutex<Option<mpsc::Sender<PollerCommand>>>>,
}

impl PollTrigger {
    pub fn attach(&self, tx: mpsc::Sender<PollerCommand>) {
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    pub fn detach(&self) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = tx {
            let _ = tx.try_send(PollerCommand::Shutdown);
        }
    }

    /// Asks for an immediate poll. A no-op when no poller is attached.
    pub fn poll_now(&self) {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return;
        };
        match tx.try_send(PollerCommand::FetchNow) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("poll already queued"),
            Err(TrySendError::Closed(_)) => debug!("poller is gone"),
        }
    }
}

/// Periodic full read of the ledger, folded exactly like events. Covers
/// missed events, dropped connections and transactions that landed late.
#[derive(Clone, Debug)]
pub struct PollingFallback<L> {
    ledger: L,
    store: GameSessionStore,
    executor: TransactionExecutor<L>,
    approval: ApprovalCoordinator<L>,
    config: PollingConfig,
    game: Address,
    notifier: Notifier,
}

impl<L> PollingFallback<L>
where
    L: LedgerReader + LedgerWriter + Clone,
{
    pub fn new(
        ledger: L,
        store: GameSessionStore,
        executor: TransactionExecutor<L>,
        approval: ApprovalCoordinator<L>,
        config: PollingConfig,
        game: Address,
        notifier: Notifier,
    ) -> Self {
        Self {
            ledger,
            store,
            executor,
            approval,
            config,
            game,
            notifier,
        }
    }

    pub fn interval_for(&self, phase: Phase) -> Duration {
        if phase.is_in_progress() {
            self.config.active_interval()
        } else {
            self.config.idle_interval()
        }
    }

    /// Polls immediately, then on the phase-dependent interval until shut down.
    pub async fn run(self, identity: Address, mut commands: mpsc::Receiver<PollerCommand>) {
        info!(%identity, "poller started");
        let mut next = Instant::now();
        loop {
            tokio::select! {
                _ = time::sleep_until(next) => {}
                command = commands.recv() => match command {
                    Some(PollerCommand::FetchNow) => debug!(%identity, "poll requested"),
                    Some(PollerCommand::Shutdown) | None => break,
                },
            }
            self.poll_with_retry(identity).await;
            next = Instant::now() + self.interval_for(self.store.get().phase);
        }
        info!(%identity, "poller stopped");
    }

    /// One polling pass with bounded retries. Returns whether a read succeeded.
    pub async fn poll_with_retry(&self, identity: Address) -> bool {
        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.poll_once(identity).await {
                Ok(()) => {
                    if self.store.get().state_unknown {
                        info!(%identity, "ledger reachable again");
                        self.store.set_state_unknown(identity, false);
                    }
                    return true;
                }
                Err(e) if attempt == max_attempts => {
                    let error = classify(&e);
                    warn!(%identity, attempt, "giving up on poll: {e:#}");
                    self.store.set_state_unknown(identity, true);
                    self.notifier.notify(Notice::StateUnknown {
                        identity,
                        attempts: attempt,
                    });
                    self.notifier.error(Component::Polling, error);
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    warn!(%identity, attempt, ?delay, "poll failed, retrying: {e:#}");
                    time::sleep(delay).await;
                }
            }
        }
        false
    }

    pub async fn poll_once(&self, identity: Address) -> Result<()> {
        let game = self
            .ledger
            .current_game(identity)
            .await
            .wrap_err("failed to read current game")?;
        let randomness = match &game {
            Some(g) if g.is_active && g.status == GameStatus::Pending => self
                .ledger
                .randomness_request(g.request_id)
                .await
                .wrap_err("failed to read randomness request")?,
            _ => None,
        };
        let amount = self
            .ledger
            .allowance(identity, self.game)
            .await
            .wrap_err("failed to read allowance")?;
        self.approval.observe(TokenAllowance {
            owner: identity,
            spender: self.game,
            amount,
            last_checked_at: Instant::now(),
        });

        let snapshot = LedgerSnapshot { game, randomness };
        if let Some(patch) = fold_snapshot(&snapshot, &self.store.get()) {
            self.store.apply(patch, PatchSource::Poll);
        }
        self.release_unconfirmed(identity, &snapshot).await
    }

    /// Gives up on a bet or resolve that timed out and still has not reached
    /// the ledger once the grace window has passed, so the player can retry.
    async fn release_unconfirmed(&self, identity: Address, snapshot: &LedgerSnapshot) -> Result<()> {
        let session = self.store.get();
        let (kind, back_to) = match session.phase {
            Phase::PlacingBet => (TransactionKind::PlaceBet, Phase::Idle),
            Phase::Resolving => (TransactionKind::Resolve, Phase::ReadyToResolve),
            _ => return Ok(()),
        };
        if session.identity != identity || self.executor.is_in_flight(identity, kind) {
            return Ok(());
        }
        let waited = Instant::now().saturating_duration_since(session.last_transition_at);
        if waited < self.config.unconfirmed_grace() {
            return Ok(());
        }
        let unlanded = match kind {
            TransactionKind::PlaceBet => {
                !snapshot.game.as_ref().is_some_and(|g| g.is_active)
                    && self
                        .ledger
                        .can_start_game(identity)
                        .await
                        .wrap_err("failed to read whether a game can start")?
            }
            _ => {
                snapshot.game.as_ref().is_some_and(|g| {
                    g.is_active
                        && g.status == GameStatus::Pending
                        && Some(g.request_id) == session.randomness_request_id
                }) && snapshot.randomness.as_ref().is_some_and(|r| r.fulfilled)
            }
        };
        if unlanded && self.store.rollback_optimistic(identity, session.phase, back_to) {
            warn!(
                %identity,
                ?kind,
                ?waited,
                "timed-out transaction never reached the ledger; released for retry"
            );
        }
        Ok(())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay();
        let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_ms = (base.as_millis() / 2) as u64;
        let jitter = if jitter_ms > 0 {
            rand::rng().random_range(0..=jitter_ms)
        } else {
            0
        };
        exp + Duration::from_millis(jitter)
    }
}
