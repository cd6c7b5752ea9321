use crate::{
    approval::ApprovalCoordinator,
    errors::classify,
    ledger::{
        EventFilter,
        EventSource,
        LedgerReader,
        LedgerWriter,
    },
    notifications::{
        Component,
        Notifier,
    },
    reconcile::fold_event,
    store::{
        GameSessionStore,
        PatchSource,
    },
    types::{
        Address,
        LedgerEvent,
    },
};
use futures::StreamExt;
use std::time::Duration;
use tokio::{
    sync::watch,
    time,
};
use tracing::{
    debug,
    info,
    warn,
};

const INITIAL_RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);
const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);

/// Feeds contract events for one identity into the store.
#[derive(Clone, Debug)]
pub struct EventReconciler<L> {
    source: L,
    store: GameSessionStore,
    approval: ApprovalCoordinator<L>,
    notifier: Notifier,
}

impl<L> EventReconciler<L>
where
    L: EventSource + LedgerReader + LedgerWriter + Clone,
{
    pub fn new(
        source: L,
        store: GameSessionStore,
        approval: ApprovalCoordinator<L>,
        notifier: Notifier,
    ) -> Self {
        Self {
            source,
            store,
            approval,
            notifier,
        }
    }

    /// Runs until `shutdown` flips. A stream that ends or errors is replaced
    /// after a backoff; the old one is dropped first so listeners never pile up.
    pub async fn run(self, identity: Address, mut shutdown: watch::Receiver<bool>) {
        let filter = EventFilter { player: identity };
        let mut delay = INITIAL_RESUBSCRIBE_DELAY;
        info!(%identity, "event reconciler started");

        while !*shutdown.borrow() {
            let mut stream = match self.source.subscribe(filter).await {
                Ok(stream) => {
                    debug!(%identity, "subscribed to ledger events");
                    delay = INITIAL_RESUBSCRIBE_DELAY;
                    stream
                }
                Err(e) => {
                    self.notifier.error(Component::Events, classify(&e));
                    if wait_or_shutdown(&mut shutdown, delay).await {
                        break;
                    }
                    delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    next = stream.next() => match next {
                        Some(Ok(event)) => self.handle(&event),
                        Some(Err(e)) => {
                            self.notifier.error(Component::Events, classify(&e));
                            break;
                        }
                        None => {
                            warn!(%identity, "event stream ended");
                            break;
                        }
                    },
                }
            }
            drop(stream);

            let stopping = *shutdown.borrow();
            if stopping || wait_or_shutdown(&mut shutdown, delay).await {
                break;
            }
            delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
        }
        info!(%identity, "event reconciler stopped");
    }

    pub fn handle(&self, event: &LedgerEvent) {
        if matches!(event, LedgerEvent::Approval { .. }) {
            self.approval.observe_event(event);
            return;
        }
        if let Some(patch) = fold_event(event, &self.store.get()) {
            self.store.apply(patch, PatchSource::Event);
        }
    }
}

/// Sleeps for `delay`; returns true if shutdown was requested meanwhile.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = time::sleep(delay) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        config::{
            ApprovalPolicy,
            TransactionConfig,
        },
        executor::TransactionExecutor,
        test_helpers::{
            FakeLedger,
            GAME,
            OTHER_PLAYER,
            PLAYER,
        },
        types::{
            Phase,
            RequestId,
        },
    };

    fn reconciler(ledger: &FakeLedger) -> (EventReconciler<FakeLedger>, GameSessionStore) {
        let notifier = Notifier::new();
        let store = GameSessionStore::new(PLAYER, notifier.clone());
        let executor =
            TransactionExecutor::new(ledger.clone(), TransactionConfig::default(), notifier.clone());
        let approval = ApprovalCoordinator::new(
            ledger.clone(),
            executor,
            ApprovalPolicy::Unlimited,
            notifier.clone(),
        );
        (
            EventReconciler::new(ledger.clone(), store.clone(), approval, notifier),
            store,
        )
    }

    fn started(player: Address, request_id: u64) -> LedgerEvent {
        LedgerEvent::SessionStarted {
            player,
            request_id: RequestId(request_id),
            chosen_value: 50,
            amount: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run__folds_events_for_identity_only() {
        // given
        let ledger = FakeLedger::default();
        let (reconciler, store) = reconciler(&ledger);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reconciler.run(PLAYER, shutdown_rx));
        time::sleep(Duration::from_millis(1)).await;

        // when
        ledger.emit(started(OTHER_PLAYER, 9));
        ledger.emit(started(PLAYER, 2));
        time::sleep(Duration::from_millis(1)).await;

        // then
        let session = store.get();
        assert_eq!(session.phase, Phase::AwaitingRandomness);
        assert_eq!(session.randomness_request_id, Some(RequestId(2)));
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run__resubscribes_after_stream_ends() {
        // given
        let ledger = FakeLedger::default();
        let (reconciler, store) = reconciler(&ledger);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reconciler.run(PLAYER, shutdown_rx));
        time::sleep(Duration::from_millis(1)).await;

        // when
        ledger.drop_event_streams();
        time::sleep(INITIAL_RESUBSCRIBE_DELAY * 2).await;
        ledger.emit(started(PLAYER, 4));
        time::sleep(Duration::from_millis(1)).await;

        // then
        assert_eq!(ledger.subscribe_calls(), 2);
        assert_eq!(ledger.live_subscriptions(), 1);
        assert_eq!(store.get().randomness_request_id, Some(RequestId(4)));
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run__shutdown_releases_subscription() {
        // given
        let ledger = FakeLedger::default();
        let (reconciler, _) = reconciler(&ledger);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reconciler.run(PLAYER, shutdown_rx));
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(ledger.live_subscriptions(), 1);

        // when
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        // then
        assert_eq!(ledger.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn handle__approval_event_updates_last_seen_allowance() {
        // given
        let ledger = FakeLedger::default();
        let (reconciler, store) = reconciler(&ledger);

        // when
        reconciler.handle(&LedgerEvent::Approval {
            owner: PLAYER,
            spender: GAME,
            amount: 300,
        });

        // then
        assert_eq!(reconciler.approval.last_seen().map(|a| a.amount), Some(300));
        assert_eq!(store.get().phase, Phase::Idle);
    }
}
