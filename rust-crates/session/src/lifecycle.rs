use crate::{
    approval::{
        ApprovalCoordinator,
        ApprovalError,
    },
    config::{
        OrchestratorConfig,
        WagerConfig,
    },
    errors::{
        ClassifiedError,
        classify,
    },
    executor::TransactionExecutor,
    ledger::{
        LedgerReader,
        LedgerWriter,
    },
    network::NetworkGuard,
    notifications::{
        Component,
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
        Amount,
        ContractCall,
        GameSession,
        LedgerEvent,
        Phase,
        RequestId,
        TransactionKind,
        TxOutcome,
    },
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{
        Mutex as AsyncMutex,
        watch,
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

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    #[error("cannot {action} while the game is {phase}")]
    WrongPhase { action: &'static str, phase: Phase },
    #[error("chosen value {value} must be between {min} and {max}")]
    InvalidChoice { value: u32, min: u32, max: u32 },
    #[error("wager {amount} must be between {min} and {max}")]
    InvalidWager {
        amount: Amount,
        min: Amount,
        max: Amount,
    },
    #[error("a {0} transaction is already in flight")]
    InFlight(TransactionKind),
    #[error("transactions are still in flight")]
    Busy,
    #[error("a game is already active on the ledger")]
    GameAlreadyActive,
    #[error("resolve is cooling down for another {remaining:?}")]
    CoolingDown { remaining: Duration },
    #[error("the {0} transaction was not confirmed in time and may still land")]
    TimedOut(TransactionKind),
    #[error("{0}")]
    Ledger(ClassifiedError),
}

/// Drives one identity's bet from Idle to a settled phase. Every transition
/// goes through the store; this type only decides what to submit and when.
#[derive(Clone, Debug)]
pub struct BetLifecycleMachine<L> {
    ledger: L,
    store: GameSessionStore,
    executor: TransactionExecutor<L>,
    approval: ApprovalCoordinator<L>,
    game: Address,
    wager: WagerConfig,
    network: NetworkGuard,
    poll: PollTrigger,
    bet_gate: Arc<AsyncMutex<()>>,
    resolve_cooldown: Cooldowns,
    notifier: Notifier,
}

impl<L> BetLifecycleMachine<L>
where
    L: LedgerReader + LedgerWriter + Clone,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: L,
        store: GameSessionStore,
        executor: TransactionExecutor<L>,
        approval: ApprovalCoordinator<L>,
        config: &OrchestratorConfig,
        network: NetworkGuard,
        poll: PollTrigger,
        notifier: Notifier,
    ) -> Self {
        Self {
            ledger,
            store,
            executor,
            approval,
            game: config.contracts.game,
            wager: config.wager.clone(),
            network,
            poll,
            bet_gate: Arc::default(),
            resolve_cooldown: Cooldowns::new(config.transactions.resolve_cooldown()),
            notifier,
        }
    }

    /// Approves if the fresh allowance is short, then places the bet. Returns
    /// the session once the bet is confirmed and its request id is known.
    pub async fn place_bet(
        &self,
        chosen_value: u32,
        wager: Amount,
    ) -> Result<GameSession, LifecycleError> {
        self.network.check().map_err(|e| self.surface(e))?;
        let Ok(_bet) = self.bet_gate.try_lock() else {
            return Err(LifecycleError::InFlight(TransactionKind::PlaceBet));
        };
        let session = self.store.get();
        let identity = session.identity;
        if session.phase != Phase::Idle {
            return Err(LifecycleError::WrongPhase {
                action: "place a bet",
                phase: session.phase,
            });
        }
        self.check_bounds(chosen_value, wager)?;
        if self.executor.is_in_flight(identity, TransactionKind::PlaceBet) {
            return Err(LifecycleError::InFlight(TransactionKind::PlaceBet));
        }

        let can_start = self
            .ledger
            .can_start_game(identity)
            .await
            .map_err(|e| self.surface(classify(&e)))?;
        if !can_start {
            self.poll.poll_now();
            return Err(LifecycleError::GameAlreadyActive);
        }
        let balance = self
            .ledger
            .token_balance(identity)
            .await
            .map_err(|e| self.surface(classify(&e)))?;
        if balance < wager {
            return Err(self.surface(ClassifiedError::insufficient_balance(wager, balance)));
        }

        let allowance = self
            .approval
            .fresh_allowance(identity, self.game)
            .await
            .map_err(LifecycleError::Ledger)?;
        if allowance.amount < wager {
            self.advance(identity, Phase::Approving, chosen_value, wager)?;
            if let Err(e) = self.approval.ensure_allowance(identity, self.game, wager).await {
                // A late approval only raises the allowance, Idle stays valid.
                self.store
                    .rollback_optimistic(identity, Phase::Approving, Phase::Idle);
                if let Some(error) = e.classified() {
                    self.store.record_error(identity, Some(error.clone()));
                }
                return Err(match e {
                    ApprovalError::Read(error) | ApprovalError::Failed(error) => {
                        LifecycleError::Ledger(error)
                    }
                    ApprovalError::TimedOut => {
                        LifecycleError::TimedOut(TransactionKind::Approve)
                    }
                    ApprovalError::Execute(_) => {
                        LifecycleError::InFlight(TransactionKind::Approve)
                    }
                });
            }
        }

        self.advance(identity, Phase::PlacingBet, chosen_value, wager)?;
        info!(%identity, chosen_value, wager, "placing bet");
        let call = ContractCall::PlaceBet {
            chosen_value,
            wager,
        };
        let record = self
            .executor
            .execute(identity, call, self.executor.default_options(self.wager.bet_fee))
            .await
            .map_err(|_| LifecycleError::InFlight(TransactionKind::PlaceBet))?;

        match record.outcome {
            TxOutcome::Confirmed => {
                let started = record.events.iter().any(|event| {
                    matches!(event, LedgerEvent::SessionStarted { player, .. } if *player == identity)
                });
                self.fold_receipt(&record.events);
                if !started {
                    warn!(%identity, "bet confirmed without a SessionStarted event");
                    self.poll.poll_now();
                }
                Ok(self.store.get())
            }
            TxOutcome::Failed(error) => {
                self.store
                    .rollback_optimistic(identity, Phase::PlacingBet, Phase::Idle);
                self.store.record_error(identity, Some(error.clone()));
                Err(LifecycleError::Ledger(error))
            }
            TxOutcome::TimedOut | TxOutcome::Pending => {
                self.poll.poll_now();
                Err(LifecycleError::TimedOut(TransactionKind::PlaceBet))
            }
        }
    }

    /// Settles a game whose randomness has arrived. Rate limited by the resolve cooldown.
    pub async fn resolve(&self) -> Result<GameSession, LifecycleError> {
        self.network.check().map_err(|e| self.surface(e))?;
        let session = self.store.get();
        let identity = session.identity;
        if session.phase != Phase::ReadyToResolve {
            return Err(LifecycleError::WrongPhase {
                action: "resolve",
                phase: session.phase,
            });
        }
        if self.executor.is_in_flight(identity, TransactionKind::Resolve) {
            return Err(LifecycleError::InFlight(TransactionKind::Resolve));
        }
        self.resolve_cooldown
            .start(identity)
            .map_err(|remaining| LifecycleError::CoolingDown { remaining })?;

        self.store
            .apply(SessionPatch::new(identity).phase(Phase::Resolving), PatchSource::Optimistic);
        info!(%identity, request_id = ?session.randomness_request_id, "resolving game");
        let record = self
            .executor
            .execute(identity, ContractCall::Resolve, self.executor.default_options(0))
            .await
            .map_err(|_| LifecycleError::InFlight(TransactionKind::Resolve))?;

        match record.outcome {
            TxOutcome::Confirmed => {
                self.fold_receipt(&record.events);
                let session = self.store.get();
                if !session.phase.is_terminal() {
                    self.poll.poll_now();
                }
                Ok(session)
            }
            TxOutcome::Failed(error) => {
                self.store
                    .rollback_optimistic(identity, Phase::Resolving, Phase::ReadyToResolve);
                self.store.record_error(identity, Some(error.clone()));
                Err(LifecycleError::Ledger(error))
            }
            TxOutcome::TimedOut | TxOutcome::Pending => {
                self.poll.poll_now();
                Err(LifecycleError::TimedOut(TransactionKind::Resolve))
            }
        }
    }

    /// Returns to Idle after a settled game, once nothing is in flight.
    pub fn reset(&self) -> Result<GameSession, LifecycleError> {
        let session = self.store.get();
        if !session.phase.is_terminal() {
            return Err(LifecycleError::WrongPhase {
                action: "start a new game",
                phase: session.phase,
            });
        }
        if self.executor.any_in_flight(session.identity) {
            return Err(LifecycleError::Busy);
        }
        self.store.reset_to_idle(session.identity);
        Ok(self.store.get())
    }

    pub fn resolve_cooldown_remaining(&self, identity: Address) -> Option<Duration> {
        self.resolve_cooldown.remaining(identity)
    }

    /// Resolves automatically once per game whenever the session reaches
    /// ReadyToResolve. A failed attempt is left for the player to retry.
    pub async fn run_auto_resolve(self, mut shutdown: watch::Receiver<bool>) {
        let mut updates = self.store.subscribe();
        let mut attempted: Option<RequestId> = None;
        loop {
            let session = updates.borrow_and_update().clone();
            if session.phase == Phase::ReadyToResolve
                && session.randomness_request_id != attempted
            {
                if let Some(wait) = self.resolve_cooldown_remaining(session.identity) {
                    tokio::select! {
                        _ = time::sleep(wait) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
                attempted = session.randomness_request_id;
                if let Err(e) = self.resolve().await {
                    debug!("auto-resolve did not settle the game: {e}");
                }
                continue;
            }
            tokio::select! {
                changed = updates.changed() => if changed.is_err() { break },
                _ = shutdown.changed() => break,
            }
        }
    }

    fn check_bounds(&self, chosen_value: u32, wager: Amount) -> Result<(), LifecycleError> {
        let bounds = &self.wager;
        if !(bounds.min_choice..=bounds.max_choice).contains(&chosen_value) {
            return Err(LifecycleError::InvalidChoice {
                value: chosen_value,
                min: bounds.min_choice,
                max: bounds.max_choice,
            });
        }
        if !(bounds.min_wager..=bounds.max_wager).contains(&wager) {
            return Err(LifecycleError::InvalidWager {
                amount: wager,
                min: bounds.min_wager,
                max: bounds.max_wager,
            });
        }
        Ok(())
    }

    fn advance(
        &self,
        identity: Address,
        phase: Phase,
        chosen_value: u32,
        wager: Amount,
    ) -> Result<(), LifecycleError> {
        let patch = SessionPatch::new(identity)
            .phase(phase)
            .bet(chosen_value, wager);
        let session = self.store.apply(patch, PatchSource::Optimistic);
        if session.phase != phase {
            return Err(LifecycleError::WrongPhase {
                action: "place a bet",
                phase: session.phase,
            });
        }
        Ok(())
    }

    fn fold_receipt(&self, events: &[LedgerEvent]) {
        for event in events {
            if let Some(patch) = fold_event(event, &self.store.get()) {
                self.store.apply(patch, PatchSource::Event);
            }
        }
    }

    fn surface(&self, error: ClassifiedError) -> LifecycleError {
        self.notifier.error(Component::Lifecycle, error.clone());
        LifecycleError::Ledger(error)
    }
}

/// Per-identity rate limit. An attempt by one identity never delays another.
#[derive(Clone, Debug)]
pub(crate) struct Cooldowns {
    period: Duration,
    last: Arc<Mutex<HashMap<Address, Instant>>>,
}

impl Cooldowns {
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            period,
            last: Arc::default(),
        }
    }

    pub(crate) fn remaining(&self, identity: Address) -> Option<Duration> {
        let last = self
            .last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&identity)
            .copied();
        self.left_after(last)
    }

    /// Starts the cooldown for `identity`, or returns how long is left on the current one.
    pub(crate) fn start(&self, identity: Address) -> Result<(), Duration> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(left) = self.left_after(last.get(&identity).copied()) {
            return Err(left);
        }
        last.insert(identity, Instant::now());
        Ok(())
    }

    fn left_after(&self, last: Option<Instant>) -> Option<Duration> {
        let elapsed = last?.elapsed();
        (elapsed < self.period).then(|| self.period - elapsed)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        errors::ErrorKind,
        notifications::Notice,
        test_helpers::{
            FakeLedger,
            PLAYER,
            ReceiptScript,
            test_config,
        },
        types::GameStatus,
    };

    struct Harness {
        ledger: FakeLedger,
        store: GameSessionStore,
        machine: BetLifecycleMachine<FakeLedger>,
        notifier: Notifier,
    }

    fn harness_with(config: OrchestratorConfig, network: NetworkGuard) -> Harness {
        let ledger = FakeLedger::default();
        let notifier = Notifier::new();
        let store = GameSessionStore::new(PLAYER, notifier.clone());
        let executor = TransactionExecutor::new(
            ledger.clone(),
            config.transactions.clone(),
            notifier.clone(),
        );
        let approval = ApprovalCoordinator::new(
            ledger.clone(),
            executor.clone(),
            config.wager.approval_policy,
            notifier.clone(),
        );
        let machine = BetLifecycleMachine::new(
            ledger.clone(),
            store.clone(),
            executor,
            approval,
            &config,
            network,
            PollTrigger::default(),
            notifier.clone(),
        );
        Harness {
            ledger,
            store,
            machine,
            notifier,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config(), NetworkGuard::verified())
    }

    fn phase_changes(rx: &mut tokio::sync::broadcast::Receiver<Notice>) -> Vec<(Phase, Phase)> {
        let mut changes = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            if let Notice::PhaseChanged { from, to, .. } = notice {
                changes.push((from, to));
            }
        }
        changes
    }

    async fn ready_to_resolve(h: &Harness) -> RequestId {
        let session = h.machine.place_bet(50, 100).await.unwrap();
        let request_id = session.randomness_request_id.unwrap();
        h.ledger.fulfill_randomness(request_id, false);
        h.store.apply(
            SessionPatch::new(PLAYER)
                .request_id(request_id)
                .phase(Phase::ReadyToResolve)
                .fulfilled(),
            PatchSource::Event,
        );
        request_id
    }

    #[tokio::test]
    async fn place_bet__without_allowance_approves_then_bets() {
        // given
        let h = harness();
        let mut notices = h.notifier.subscribe();

        // when
        let session = h.machine.place_bet(50, 100).await.unwrap();

        // then
        assert_eq!(session.phase, Phase::AwaitingRandomness);
        assert_eq!(session.randomness_request_id, Some(RequestId(1)));
        assert_eq!(
            phase_changes(&mut notices),
            vec![
                (Phase::Idle, Phase::Approving),
                (Phase::Approving, Phase::PlacingBet),
                (Phase::PlacingBet, Phase::AwaitingRandomness),
            ]
        );
        assert_eq!(h.ledger.submissions_of(TransactionKind::Approve), 1);
        assert_eq!(h.ledger.submissions_of(TransactionKind::PlaceBet), 1);
    }

    #[tokio::test]
    async fn place_bet__sufficient_allowance_skips_approving() {
        // given
        let h = harness();
        h.ledger.set_allowance(PLAYER, test_config().contracts.game, 1_000);
        let mut notices = h.notifier.subscribe();

        // when
        h.machine.place_bet(50, 100).await.unwrap();

        // then
        assert_eq!(
            phase_changes(&mut notices),
            vec![
                (Phase::Idle, Phase::PlacingBet),
                (Phase::PlacingBet, Phase::AwaitingRandomness),
            ]
        );
        assert_eq!(h.ledger.submissions_of(TransactionKind::Approve), 0);
    }

    #[tokio::test]
    async fn place_bet__out_of_bounds_submits_nothing() {
        let h = harness();

        let choice = h.machine.place_bet(0, 100).await;
        let wager = h.machine.place_bet(50, 1_000_000).await;

        assert!(matches!(choice, Err(LifecycleError::InvalidChoice { .. })));
        assert!(matches!(wager, Err(LifecycleError::InvalidWager { .. })));
        assert!(h.ledger.submissions().is_empty());
        assert_eq!(h.store.get().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn place_bet__insufficient_balance_fails_fast() {
        // given
        let h = harness();
        h.ledger.set_balance(PLAYER, 10);

        // when
        let err = h.machine.place_bet(50, 100).await.unwrap_err();

        // then
        let LifecycleError::Ledger(error) = err else {
            panic!("expected classified error, got {err:?}");
        };
        assert_eq!(error.kind, ErrorKind::InsufficientBalance);
        assert!(h.ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn place_bet__wrong_network_is_refused() {
        // given
        let network = NetworkGuard::default();
        network.set(Err(ClassifiedError::wrong_network(31337, 1)));
        let h = harness_with(test_config(), network);

        // when
        let err = h.machine.place_bet(50, 100).await.unwrap_err();

        // then
        assert!(matches!(
            err,
            LifecycleError::Ledger(ClassifiedError {
                kind: ErrorKind::WrongNetwork,
                ..
            })
        ));
        assert!(h.ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn place_bet__rejected_approval_rolls_back_to_idle() {
        // given
        let h = harness();
        h.ledger
            .script_next(TransactionKind::Approve, ReceiptScript::RejectSubmit);

        // when
        let err = h.machine.place_bet(50, 100).await.unwrap_err();

        // then
        assert!(matches!(
            err,
            LifecycleError::Ledger(ClassifiedError {
                kind: ErrorKind::UserRejected,
                ..
            })
        ));
        let session = h.store.get();
        assert_eq!(session.phase, Phase::Idle);
        assert_eq!(session.wager_amount, None);
        assert_eq!(h.ledger.submissions_of(TransactionKind::PlaceBet), 0);
    }

    #[tokio::test]
    async fn place_bet__reverted_bet_rolls_back_to_idle() {
        // given
        let h = harness();
        h.ledger.script_next(
            TransactionKind::PlaceBet,
            ReceiptScript::Revert(Some("bet too small".to_string())),
        );

        // when
        let err = h.machine.place_bet(50, 100).await.unwrap_err();

        // then
        assert!(matches!(
            err,
            LifecycleError::Ledger(ClassifiedError {
                kind: ErrorKind::ContractReverted,
                ..
            })
        ));
        let session = h.store.get();
        assert_eq!(session.phase, Phase::Idle);
        assert_eq!(
            session.last_error.map(|e| e.kind),
            Some(ErrorKind::ContractReverted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn place_bet__timeout_keeps_placing_bet() {
        // given
        let h = harness();
        h.ledger.set_allowance(PLAYER, test_config().contracts.game, 1_000);
        h.ledger
            .script_next(TransactionKind::PlaceBet, ReceiptScript::Hang);

        // when
        let err = h.machine.place_bet(50, 100).await.unwrap_err();

        // then
        assert_eq!(err, LifecycleError::TimedOut(TransactionKind::PlaceBet));
        assert_eq!(h.store.get().phase, Phase::PlacingBet);
    }

    #[tokio::test]
    async fn place_bet__refused_when_ledger_has_active_game() {
        // given
        let h = harness();
        h.ledger.set_allowance(PLAYER, test_config().contracts.game, 1_000);
        h.machine.place_bet(50, 100).await.unwrap();
        h.store.switch_identity(crate::test_helpers::OTHER_PLAYER);
        h.store.switch_identity(PLAYER);

        // when
        let err = h.machine.place_bet(50, 100).await.unwrap_err();

        // then
        assert_eq!(err, LifecycleError::GameAlreadyActive);
        assert_eq!(h.ledger.submissions_of(TransactionKind::PlaceBet), 1);
    }

    #[tokio::test]
    async fn place_bet__concurrent_calls_submit_one_bet() {
        // given
        let h = harness();
        h.ledger.script_next(
            TransactionKind::PlaceBet,
            ReceiptScript::Delay(Duration::from_millis(20)),
        );

        // when
        let (first, second) = tokio::join!(
            h.machine.place_bet(50, 100),
            h.machine.place_bet(50, 100),
        );

        // then
        assert!(first.is_ok());
        assert_eq!(
            second.unwrap_err(),
            LifecycleError::InFlight(TransactionKind::PlaceBet)
        );
        assert_eq!(h.ledger.submissions_of(TransactionKind::PlaceBet), 1);
    }

    #[tokio::test]
    async fn resolve__requires_fulfilled_randomness() {
        let h = harness();
        h.machine.place_bet(50, 100).await.unwrap();

        let err = h.machine.resolve().await.unwrap_err();

        assert_eq!(
            err,
            LifecycleError::WrongPhase {
                action: "resolve",
                phase: Phase::AwaitingRandomness,
            }
        );
    }

    #[tokio::test]
    async fn resolve__settles_game_from_receipt() {
        // given
        let h = harness();
        ready_to_resolve(&h).await;
        h.ledger.set_outcome(GameStatus::Won, 12, 190);

        // when
        let session = h.machine.resolve().await.unwrap();

        // then
        assert_eq!(session.phase, Phase::CompletedWin);
        assert_eq!(session.rolled_value, Some(12));
        assert_eq!(session.payout, Some(190));
    }

    #[tokio::test(start_paused = true)]
    async fn resolve__failure_returns_to_ready_and_cools_down() {
        // given
        let h = harness();
        ready_to_resolve(&h).await;
        h.ledger.script_next(
            TransactionKind::Resolve,
            ReceiptScript::Revert(Some("randomness not ready".to_string())),
        );

        // when
        let failed = h.machine.resolve().await;
        let too_soon = h.machine.resolve().await;
        time::advance(Duration::from_millis(5_001)).await;
        let retried = h.machine.resolve().await;

        // then
        assert!(matches!(failed, Err(LifecycleError::Ledger(_))));
        assert!(matches!(too_soon, Err(LifecycleError::CoolingDown { .. })));
        assert!(retried.unwrap().phase.is_terminal());
        assert_eq!(h.ledger.submissions_of(TransactionKind::Resolve), 2);
    }

    #[tokio::test]
    async fn reset__only_after_settlement() {
        // given
        let h = harness();
        ready_to_resolve(&h).await;
        let premature = h.machine.reset();
        h.machine.resolve().await.unwrap();

        // when
        let session = h.machine.reset().unwrap();

        // then
        assert!(matches!(premature, Err(LifecycleError::WrongPhase { .. })));
        assert_eq!(session.phase, Phase::Idle);
        assert_eq!(session.randomness_request_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn run_auto_resolve__resolves_once_randomness_arrives() {
        // given
        let mut config = test_config();
        config.transactions.auto_resolve = true;
        let h = harness_with(config, NetworkGuard::verified());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(h.machine.clone().run_auto_resolve(shutdown_rx));

        // when
        ready_to_resolve(&h).await;
        time::sleep(Duration::from_millis(10)).await;

        // then
        assert!(h.store.get().phase.is_terminal());
        assert_eq!(h.ledger.submissions_of(TransactionKind::Resolve), 1);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cooldowns__start_for_one_identity_leaves_others_free() {
        // given
        let cooldowns = Cooldowns::new(Duration::from_secs(5));
        let other = crate::test_helpers::OTHER_PLAYER;

        // when
        let first = cooldowns.start(PLAYER);
        let again = cooldowns.start(PLAYER);
        let other_first = cooldowns.start(other);
        time::advance(Duration::from_secs(5)).await;

        // then
        assert!(first.is_ok());
        assert_eq!(again, Err(Duration::from_secs(5)));
        assert!(other_first.is_ok());
        assert_eq!(cooldowns.remaining(PLAYER), None);
        assert!(cooldowns.start(PLAYER).is_ok());
    }
}
