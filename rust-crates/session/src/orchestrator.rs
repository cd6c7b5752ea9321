use crate::{
    actions::{
        ActionContext,
        AvailableActions,
    },
    approval::ApprovalCoordinator,
    config::OrchestratorConfig,
    errors::{
        ClassifiedError,
        classify,
    },
    events::EventReconciler,
    executor::TransactionExecutor,
    ledger::Ledger,
    lifecycle::{
        BetLifecycleMachine,
        LifecycleError,
    },
    network::NetworkGuard,
    notifications::{
        Component,
        Notice,
        Notifier,
    },
    polling::{
        PollTrigger,
        PollingFallback,
        poller_channel,
    },
    recovery::{
        RecoveryError,
        StuckGameRecovery,
    },
    store::GameSessionStore,
    types::{
        Address,
        Amount,
        GameSession,
        HistoryEntry,
        PlayerStats,
        SessionContext,
        TokenAllowance,
        TransactionKind,
    },
};
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use std::sync::{
    Mutex,
    PoisonError,
};
use tokio::{
    sync::{
        broadcast,
        watch,
    },
    task::JoinHandle,
};
use tracing::{
    info,
    warn,
};

/// Background work scoped to one identity. Dropping it stops everything.
struct SessionTasks {
    identity: Address,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Drop for SessionTasks {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Entry point: owns the store and wires every component for the current identity.
pub struct GameOrchestrator<L> {
    ledger: L,
    config: OrchestratorConfig,
    notifier: Notifier,
    store: GameSessionStore,
    executor: TransactionExecutor<L>,
    approval: ApprovalCoordinator<L>,
    lifecycle: BetLifecycleMachine<L>,
    recovery: StuckGameRecovery<L>,
    network: NetworkGuard,
    poll: PollTrigger,
    tasks: Mutex<Option<SessionTasks>>,
}

impl<L: Ledger> GameOrchestrator<L> {
    pub fn new(ledger: L, config: OrchestratorConfig, identity: Address) -> Result<Self> {
        config.validate().wrap_err("invalid orchestrator config")?;
        let notifier = Notifier::new();
        let store = GameSessionStore::new(identity, notifier.clone());
        let network = NetworkGuard::default();
        let poll = PollTrigger::default();
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
        let lifecycle = BetLifecycleMachine::new(
            ledger.clone(),
            store.clone(),
            executor.clone(),
            approval.clone(),
            &config,
            network.clone(),
            poll.clone(),
            notifier.clone(),
        );
        let recovery = StuckGameRecovery::new(
            store.clone(),
            executor.clone(),
            config.recovery.clone(),
            network.clone(),
            poll.clone(),
            notifier.clone(),
        );
        Ok(Self {
            ledger,
            config,
            notifier,
            store,
            executor,
            approval,
            lifecycle,
            recovery,
            network,
            poll,
            tasks: Mutex::new(None),
        })
    }

    /// Verifies the chain and starts event, polling and recovery tasks for
    /// the current identity. Must be called from within a tokio runtime.
    pub async fn connect(&self) -> Result<SessionContext, ClassifiedError> {
        let actual = match self.ledger.chain_id().await {
            Ok(chain_id) => chain_id,
            Err(e) => {
                let error = classify(&e);
                self.network.set(Err(error.clone()));
                self.notifier.error(Component::Lifecycle, error.clone());
                return Err(error);
            }
        };
        let expected = self.config.network.chain_id;
        if actual != expected {
            let error = ClassifiedError::wrong_network(expected, actual);
            self.network.set(Err(error.clone()));
            self.stop_tasks();
            self.notifier.error(Component::Lifecycle, error.clone());
            return Err(error);
        }
        self.network.set(Ok(()));
        let identity = self.store.get().identity;
        self.start_tasks(identity);
        info!(%identity, chain_id = actual, "connected");
        Ok(self.context())
    }

    /// Drops everything tied to the previous identity and starts fresh for `identity`.
    pub fn switch_identity(&self, identity: Address) -> GameSession {
        self.stop_tasks();
        let session = self.store.switch_identity(identity);
        if self.network.is_ok() {
            self.start_tasks(identity);
        }
        session
    }

    pub fn shutdown(&self) {
        self.stop_tasks();
        info!("orchestrator shut down");
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            identity: self.store.get().identity,
            game: self.config.contracts.game,
            chain_id: self.config.network.chain_id,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn session(&self) -> GameSession {
        self.store.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<GameSession> {
        self.store.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notifier.subscribe()
    }

    pub async fn place_bet(
        &self,
        chosen_value: u32,
        wager: Amount,
    ) -> Result<GameSession, LifecycleError> {
        self.lifecycle.place_bet(chosen_value, wager).await
    }

    pub async fn resolve(&self) -> Result<GameSession, LifecycleError> {
        self.lifecycle.resolve().await
    }

    pub async fn recover(&self) -> Result<GameSession, RecoveryError> {
        self.recovery.recover().await
    }

    /// Recovery for a game the ledger still holds open, without waiting for
    /// this process to see it stall. Cooldown and in-flight rules still apply.
    pub async fn force_recover(&self) -> Result<GameSession, RecoveryError> {
        self.recovery.force_recover().await
    }

    /// Resolves once the stuck watcher flags the game, or the game stops
    /// waiting on the oracle.
    pub async fn wait_until_stuck(&self) -> GameSession {
        let mut updates = self.store.subscribe();
        match updates
            .wait_for(|session| session.stuck || !session.phase.can_stall())
            .await
        {
            Ok(session) => session.clone(),
            Err(_) => self.store.get(),
        }
    }

    pub fn reset(&self) -> Result<GameSession, LifecycleError> {
        self.lifecycle.reset()
    }

    /// Requests an immediate ledger read from the poller.
    pub fn poll_now(&self) {
        self.poll.poll_now();
    }

    /// Reads the ledger and folds the snapshot before returning. False when
    /// every attempt failed and the session is marked state-unknown.
    pub async fn sync(&self) -> bool {
        if self.network.check().is_err() {
            return false;
        }
        let identity = self.store.get().identity;
        self.poller().poll_with_retry(identity).await
    }

    pub fn last_seen_allowance(&self) -> Option<TokenAllowance> {
        self.approval.last_seen()
    }

    pub fn available_actions(&self) -> AvailableActions {
        let session = self.store.get();
        let identity = session.identity;
        let ctx = ActionContext {
            network_ok: self.network.is_ok(),
            bet_in_flight: self
                .executor
                .is_in_flight(identity, TransactionKind::PlaceBet),
            resolve_in_flight: self
                .executor
                .is_in_flight(identity, TransactionKind::Resolve),
            recover_in_flight: self.recovery.is_in_flight(),
            any_in_flight: self.executor.any_in_flight(identity),
            resolve_cooling_down: self
                .lifecycle
                .resolve_cooldown_remaining(identity)
                .is_some(),
            recover_cooling_down: self.recovery.cooldown_remaining(identity).is_some(),
        };
        AvailableActions::project(&session, ctx)
    }

    pub async fn player_stats(&self) -> Result<PlayerStats> {
        let identity = self.store.get().identity;
        self.ledger
            .player_stats(identity)
            .await
            .wrap_err_with(|| format!("failed to read stats for {identity}"))
    }

    /// Most recent settled games, newest first. `limit` is capped at the configured depth.
    pub async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let identity = self.store.get().identity;
        let limit = limit.min(self.config.polling.history_depth);
        self.ledger
            .recent_history(identity, limit)
            .await
            .wrap_err_with(|| format!("failed to read history for {identity}"))
    }

    fn start_tasks(&self, identity: Address) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.as_ref().is_some_and(|t| t.identity == identity) {
            return;
        }
        // Replacing the slot drops the previous identity's tasks.
        tasks.take();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (poll_tx, poll_rx) = poller_channel();
        self.poll.attach(poll_tx);

        let events = EventReconciler::new(
            self.ledger.clone(),
            self.store.clone(),
            self.approval.clone(),
            self.notifier.clone(),
        );
        let poller = self.poller();
        let mut handles = vec![
            tokio::spawn(events.run(identity, shutdown_rx.clone())),
            tokio::spawn(poller.run(identity, poll_rx)),
            tokio::spawn(self.recovery.clone().run_watcher(shutdown_rx.clone())),
        ];
        if self.config.transactions.auto_resolve {
            handles.push(tokio::spawn(
                self.lifecycle.clone().run_auto_resolve(shutdown_rx),
            ));
        }
        info!(%identity, tasks = handles.len(), "session tasks started");
        *tasks = Some(SessionTasks {
            identity,
            shutdown,
            handles,
        });
    }

    fn poller(&self) -> PollingFallback<L> {
        PollingFallback::new(
            self.ledger.clone(),
            self.store.clone(),
            self.executor.clone(),
            self.approval.clone(),
            self.config.polling.clone(),
            self.config.contracts.game,
            self.notifier.clone(),
        )
    }

    fn stop_tasks(&self) {
        self.poll.detach();
        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tasks) = previous {
            info!(identity = %tasks.identity, "stopping session tasks");
        }
    }
}

impl<L> Drop for GameOrchestrator<L> {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if tasks.is_some() {
            warn!("orchestrator dropped without shutdown; aborting session tasks");
        }
    }
}
