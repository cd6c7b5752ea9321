use crate::{
    config::RecoveryConfig,
    errors::ClassifiedError,
    executor::TransactionExecutor,
    ledger::LedgerWriter,
    lifecycle::Cooldowns,
    network::NetworkGuard,
    notifications::{
        Component,
        Notice,
        Notifier,
    },
    polling::PollTrigger,
    reconcile::fold_event,
    store::{
        GameSessionStore,
        PatchSource,
        SessionPatch,
    },
    types::{
        Address,
        ContractCall,
        GameSession,
        Phase,
        TransactionKind,
        TxOutcome,
    },
};
use std::time::Duration;
use tokio::{
    sync::watch,
    time::{
        self,
        Instant,
        MissedTickBehavior,
    },
};
use tracing::{
    info,
    warn,
};

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RecoveryError {
    #[error("nothing to recover while the game is {phase}")]
    NotStuck { phase: Phase },
    #[error("recovery is cooling down for another {remaining:?}")]
    CoolingDown { remaining: Duration },
    #[error("a recovery transaction is already in flight")]
    InFlight,
    #[error("recovery was not confirmed in time and may still land")]
    TimedOut,
    #[error("recovery failed: {0}")]
    Failed(ClassifiedError),
}

/// True when the session has been waiting on the oracle for at least `threshold`.
pub fn is_stalled(session: &GameSession, now: Instant, threshold: Duration) -> bool {
    session.phase.can_stall()
        && now.saturating_duration_since(session.last_transition_at) >= threshold
}

/// Flags games the oracle never answered and offers the contract's escape hatch.
#[derive(Clone, Debug)]
pub struct StuckGameRecovery<W> {
    store: GameSessionStore,
    executor: TransactionExecutor<W>,
    config: RecoveryConfig,
    network: NetworkGuard,
    poll: PollTrigger,
    cooldown: Cooldowns,
    notifier: Notifier,
}

impl<W> StuckGameRecovery<W>
where
    W: LedgerWriter + Clone,
{
    pub fn new(
        store: GameSessionStore,
        executor: TransactionExecutor<W>,
        config: RecoveryConfig,
        network: NetworkGuard,
        poll: PollTrigger,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            executor,
            cooldown: Cooldowns::new(config.cooldown()),
            config,
            network,
            poll,
            notifier,
        }
    }

    /// Sets the stuck flag if the current phase has outlived the threshold.
    /// Returns whether the flag was newly set.
    pub fn check(&self) -> bool {
        let session = self.store.get();
        if session.stuck || !is_stalled(&session, Instant::now(), self.config.stuck_threshold()) {
            return false;
        }
        warn!(
            identity = %session.identity,
            phase = ?session.phase,
            request_id = ?session.randomness_request_id,
            "game looks stuck"
        );
        let updated = self.store.set_stuck(session.identity, true);
        if !updated.stuck {
            return false;
        }
        self.notifier.notify(Notice::StuckDetected {
            identity: updated.identity,
            phase: updated.phase,
        });
        true
    }

    pub async fn run_watcher(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check();
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    pub fn cooldown_remaining(&self, identity: Address) -> Option<Duration> {
        self.cooldown.remaining(identity)
    }

    pub fn is_in_flight(&self) -> bool {
        self.executor
            .is_in_flight(self.store.get().identity, TransactionKind::Recover)
    }

    /// Asks the contract to cancel a stuck game. Success folds the settled
    /// phase; failure keeps the phase and stuck flag and records the error.
    pub async fn recover(&self) -> Result<GameSession, RecoveryError> {
        self.attempt(false).await
    }

    /// Like [`Self::recover`] but skips the local stall clock, which restarts
    /// with every process. The contract still refuses games it considers live.
    pub async fn force_recover(&self) -> Result<GameSession, RecoveryError> {
        self.attempt(true).await
    }

    async fn attempt(&self, force: bool) -> Result<GameSession, RecoveryError> {
        let session = self.store.get();
        let identity = session.identity;
        if let Err(error) = self.network.check() {
            self.notifier.error(Component::Recovery, error.clone());
            return Err(RecoveryError::Failed(error));
        }
        if !session.phase.can_stall() || !(force || session.stuck) {
            return Err(RecoveryError::NotStuck {
                phase: session.phase,
            });
        }
        self.cooldown
            .start(identity)
            .map_err(|remaining| RecoveryError::CoolingDown { remaining })?;

        info!(%identity, request_id = ?session.randomness_request_id, "recovering stuck game");
        let call = ContractCall::RecoverStuckSession { player: identity };
        let record = self
            .executor
            .execute(identity, call, self.executor.default_options(0))
            .await
            .map_err(|_| RecoveryError::InFlight)?;

        match record.outcome {
            TxOutcome::Confirmed => {
                for event in &record.events {
                    if let Some(patch) = fold_event(event, &self.store.get()) {
                        self.store.apply(patch, PatchSource::Recovery);
                    }
                }
                if !self.store.get().phase.is_terminal() {
                    let mut patch = SessionPatch::new(identity).phase(Phase::Cancelled);
                    patch.request_id = session.randomness_request_id;
                    self.store.apply(patch, PatchSource::Recovery);
                }
                Ok(self.store.get())
            }
            TxOutcome::Failed(error) => {
                self.store.record_error(identity, Some(error.clone()));
                Err(RecoveryError::Failed(error))
            }
            TxOutcome::TimedOut | TxOutcome::Pending => {
                self.store.record_error(
                    identity,
                    Some(ClassifiedError::timeout(
                        TransactionKind::Recover,
                        self.executor.default_options(0).timeout,
                    )),
                );
                self.poll.poll_now();
                Err(RecoveryError::TimedOut)
            }
        }
    }
}
