use crate::{
    errors::ClassifiedError,
    notifications::{
        Notice,
        Notifier,
    },
    types::{
        Address,
        Amount,
        GameSession,
        Phase,
        RequestId,
    },
};
use std::sync::{
    Arc,
    Mutex,
    MutexGuard,
};
use tokio::{
    sync::watch,
    time::Instant,
};
use tracing::{
    debug,
    info,
};

/// Where a patch came from. Used for logging only; merging never looks at it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchSource {
    Event,
    Poll,
    Optimistic,
    Recovery,
}

/// A minimal set of observed facts about one identity's session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionPatch {
    pub identity: Address,
    pub phase: Option<Phase>,
    pub chosen_value: Option<u32>,
    pub wager_amount: Option<Amount>,
    pub rolled_value: Option<u32>,
    pub payout: Option<Amount>,
    pub request_id: Option<RequestId>,
    pub randomness_fulfilled: bool,
}

impl SessionPatch {
    pub fn new(identity: Address) -> Self {
        Self {
            identity,
            phase: None,
            chosen_value: None,
            wager_amount: None,
            rolled_value: None,
            payout: None,
            request_id: None,
            randomness_fulfilled: false,
        }
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn bet(mut self, chosen_value: u32, wager_amount: Amount) -> Self {
        self.chosen_value = Some(chosen_value);
        self.wager_amount = Some(wager_amount);
        self
    }

    pub fn outcome(mut self, rolled_value: u32, payout: Amount) -> Self {
        self.rolled_value = Some(rolled_value);
        self.payout = Some(payout);
        self
    }

    pub fn fulfilled(mut self) -> Self {
        self.randomness_fulfilled = true;
        self
    }
}

/// The single owner of [`GameSession`]. Cheap to clone; all clones share state.
#[derive(Clone, Debug)]
pub struct GameSessionStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    session: Mutex<GameSession>,
    watch_tx: watch::Sender<GameSession>,
    notifier: Notifier,
}

impl GameSessionStore {
    pub fn new(identity: Address, notifier: Notifier) -> Self {
        let session = GameSession::idle(identity);
        let (watch_tx, _) = watch::channel(session.clone());
        Self {
            inner: Arc::new(StoreInner {
                session: Mutex::new(session),
                watch_tx,
                notifier,
            }),
        }
    }

    pub fn get(&self) -> GameSession {
        self.lock().clone()
    }

    /// Receives every state that an operation actually changed.
    pub fn subscribe(&self) -> watch::Receiver<GameSession> {
        self.inner.watch_tx.subscribe()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    /// Folds observed facts into the session. Never fails and never moves the
    /// phase backwards; the same fact applied twice changes nothing.
    pub fn apply(&self, patch: SessionPatch, source: PatchSource) -> GameSession {
        self.mutate(|session| merge(session, &patch, source))
    }

    /// Undoes an optimistic phase after a definitive failure, provided nothing
    /// observed on the ledger has moved the session since.
    pub fn rollback_optimistic(&self, identity: Address, from: Phase, to: Phase) -> bool {
        let mut rolled_back = false;
        self.mutate(|session| {
            let optimistic = match from {
                Phase::Approving | Phase::PlacingBet => {
                    session.randomness_request_id.is_none()
                }
                Phase::Resolving => true,
                _ => false,
            };
            if session.identity != identity
                || session.phase != from
                || !optimistic
                || to.rank() >= from.rank()
            {
                return;
            }
            debug!(%identity, ?from, ?to, "rolling back optimistic phase");
            session.phase = to;
            session.last_transition_at = Instant::now();
            if to == Phase::Idle {
                session.chosen_value = None;
                session.wager_amount = None;
                session.started_at = None;
            }
            rolled_back = true;
        });
        rolled_back
    }

    /// Starts a fresh session for the same identity. Only a settled session may be reset.
    pub fn reset_to_idle(&self, identity: Address) -> bool {
        let mut reset = false;
        self.mutate(|session| {
            if session.identity == identity && session.phase.is_terminal() {
                *session = GameSession::idle(identity);
                reset = true;
            }
        });
        reset
    }

    /// Replaces the session with an idle one for `identity`. Patches still in
    /// flight for the previous identity are dropped when they arrive.
    pub fn switch_identity(&self, identity: Address) -> GameSession {
        self.mutate(|session| {
            if session.identity != identity {
                info!(from = %session.identity, to = %identity, "switching identity");
                *session = GameSession::idle(identity);
            }
        })
    }

    pub fn set_stuck(&self, identity: Address, stuck: bool) -> GameSession {
        self.mutate(|session| {
            if session.identity != identity {
                return;
            }
            if stuck && !session.phase.can_stall() {
                return;
            }
            session.stuck = stuck;
        })
    }

    pub fn record_error(
        &self,
        identity: Address,
        error: Option<ClassifiedError>,
    ) -> GameSession {
        self.mutate(|session| {
            if session.identity == identity {
                session.last_error = error;
            }
        })
    }

    pub fn set_state_unknown(&self, identity: Address, unknown: bool) -> GameSession {
        self.mutate(|session| {
            if session.identity == identity {
                session.state_unknown = unknown;
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, GameSession> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mutate(&self, f: impl FnOnce(&mut GameSession)) -> GameSession {
        let mut guard = self.lock();
        let before = guard.clone();
        f(&mut guard);
        let after = guard.clone();
        if after != before {
            // Notified under the lock so subscribers observe changes in order.
            self.inner.watch_tx.send_replace(after.clone());
            if after.phase != before.phase {
                self.inner.notifier.notify(Notice::PhaseChanged {
                    identity: after.identity,
                    from: before.phase,
                    to: after.phase,
                });
            }
        }
        after
    }
}

fn merge(session: &mut GameSession, patch: &SessionPatch, source: PatchSource) {
    if patch.identity != session.identity {
        debug!(
            ?source,
            patch_identity = %patch.identity,
            "dropping patch for another identity"
        );
        return;
    }
    match (session.randomness_request_id, patch.request_id) {
        (Some(current), Some(incoming)) if current != incoming => {
            debug!(?source, %current, %incoming, "dropping patch for another game");
            return;
        }
        (None, Some(incoming)) if session.phase.is_terminal() => {
            debug!(?source, %incoming, "session settled; reset before adopting a new game");
            return;
        }
        (None, Some(incoming)) => session.randomness_request_id = Some(incoming),
        _ => {}
    }

    fill(&mut session.chosen_value, patch.chosen_value);
    fill(&mut session.wager_amount, patch.wager_amount);
    fill(&mut session.rolled_value, patch.rolled_value);
    fill(&mut session.payout, patch.payout);
    if patch.randomness_fulfilled {
        session.randomness_fulfilled = true;
    }

    let Some(next) = patch.phase else {
        return;
    };
    if next.rank() <= session.phase.rank() {
        return;
    }
    debug!(?source, from = ?session.phase, to = ?next, "advancing phase");
    let now = Instant::now();
    session.phase = next;
    session.last_transition_at = now;
    session.started_at.get_or_insert(now);
    session.last_error = None;
    // The stall timer restarts with every transition.
    session.stuck = false;
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::notifications::Notice;
    use proptest::prelude::*;

    fn alice() -> Address {
        Address([0xa1; 20])
    }

    fn bob() -> Address {
        Address([0xb0; 20])
    }

    fn store() -> GameSessionStore {
        GameSessionStore::new(alice(), Notifier::new())
    }

    fn awaiting(request_id: u64) -> SessionPatch {
        SessionPatch::new(alice())
            .phase(Phase::AwaitingRandomness)
            .request_id(RequestId(request_id))
            .bet(50, 100)
    }

    #[tokio::test]
    async fn apply__same_fact_twice_notifies_once() {
        // given
        let store = store();
        let mut notices = store.notifier().subscribe();
        let patch = awaiting(7);

        // when
        let first = store.apply(patch.clone(), PatchSource::Event);
        let second = store.apply(patch, PatchSource::Poll);

        // then
        assert_eq!(first, second);
        let notice = notices.try_recv().unwrap();
        assert_eq!(
            notice,
            Notice::PhaseChanged {
                identity: alice(),
                from: Phase::Idle,
                to: Phase::AwaitingRandomness,
            }
        );
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn apply__older_phase_does_not_regress() {
        // given
        let store = store();
        store.apply(
            awaiting(7).phase(Phase::ReadyToResolve).fulfilled(),
            PatchSource::Event,
        );

        // when
        let session = store.apply(awaiting(7), PatchSource::Poll);

        // then
        assert_eq!(session.phase, Phase::ReadyToResolve);
        assert!(session.randomness_fulfilled);
    }

    #[tokio::test]
    async fn apply__patch_for_other_request_is_dropped() {
        // given
        let store = store();
        store.apply(awaiting(7), PatchSource::Event);

        // when
        let session = store.apply(
            SessionPatch::new(alice())
                .phase(Phase::Cancelled)
                .request_id(RequestId(3)),
            PatchSource::Poll,
        );

        // then
        assert_eq!(session.phase, Phase::AwaitingRandomness);
        assert_eq!(session.randomness_request_id, Some(RequestId(7)));
    }

    #[tokio::test]
    async fn apply__patch_for_other_identity_is_dropped() {
        let store = store();
        let session = store.apply(
            SessionPatch::new(bob())
                .phase(Phase::AwaitingRandomness)
                .request_id(RequestId(1)),
            PatchSource::Event,
        );
        assert_eq!(session.phase, Phase::Idle);
        assert_eq!(session.randomness_request_id, None);
    }

    #[tokio::test]
    async fn apply__first_terminal_fact_wins() {
        // given
        let store = store();
        store.apply(awaiting(7), PatchSource::Event);
        store.apply(
            awaiting(7).phase(Phase::Cancelled),
            PatchSource::Recovery,
        );

        // when
        let session = store.apply(
            awaiting(7).phase(Phase::CompletedWin).outcome(42, 200),
            PatchSource::Event,
        );

        // then
        assert_eq!(session.phase, Phase::Cancelled);
    }

    #[tokio::test]
    async fn apply__settled_session_ignores_new_game_until_reset() {
        // given
        let store = store();
        store.apply(
            SessionPatch::new(alice()).phase(Phase::Cancelled),
            PatchSource::Recovery,
        );

        // when
        let ignored = store.apply(awaiting(9), PatchSource::Poll);
        let reset = store.reset_to_idle(alice());
        let adopted = store.apply(awaiting(9), PatchSource::Poll);

        // then
        assert_eq!(ignored.phase, Phase::Cancelled);
        assert!(reset);
        assert_eq!(adopted.phase, Phase::AwaitingRandomness);
        assert_eq!(adopted.randomness_request_id, Some(RequestId(9)));
    }

    #[tokio::test]
    async fn reset_to_idle__refuses_while_in_progress() {
        let store = store();
        store.apply(awaiting(7), PatchSource::Event);
        assert!(!store.reset_to_idle(alice()));
        assert_eq!(store.get().phase, Phase::AwaitingRandomness);
    }

    #[tokio::test]
    async fn rollback_optimistic__reverts_unobserved_bet() {
        // given
        let store = store();
        store.apply(
            SessionPatch::new(alice())
                .phase(Phase::PlacingBet)
                .bet(50, 100),
            PatchSource::Optimistic,
        );

        // when
        let rolled_back = store.rollback_optimistic(alice(), Phase::PlacingBet, Phase::Idle);

        // then
        assert!(rolled_back);
        let session = store.get();
        assert_eq!(session.phase, Phase::Idle);
        assert_eq!(session.wager_amount, None);
    }

    #[tokio::test]
    async fn rollback_optimistic__keeps_phase_once_ledger_saw_the_game() {
        // given
        let store = store();
        store.apply(
            SessionPatch::new(alice()).phase(Phase::PlacingBet),
            PatchSource::Optimistic,
        );
        store.apply(awaiting(7), PatchSource::Event);

        // when
        let rolled_back = store.rollback_optimistic(alice(), Phase::PlacingBet, Phase::Idle);

        // then
        assert!(!rolled_back);
        assert_eq!(store.get().phase, Phase::AwaitingRandomness);
    }

    #[tokio::test]
    async fn set_stuck__only_applies_to_waiting_phases() {
        // given
        let store = store();

        // when
        let idle = store.set_stuck(alice(), true);
        store.apply(awaiting(7), PatchSource::Event);
        let waiting = store.set_stuck(alice(), true);
        let settled = store.apply(
            awaiting(7).phase(Phase::CompletedLoss).outcome(3, 0),
            PatchSource::Event,
        );

        // then
        assert!(!idle.stuck);
        assert!(waiting.stuck);
        assert!(!settled.stuck);
    }

    #[tokio::test]
    async fn switch_identity__drops_late_patches_for_previous_identity() {
        // given
        let store = store();
        store.apply(awaiting(7), PatchSource::Event);

        // when
        store.switch_identity(bob());
        let session = store.apply(awaiting(7).phase(Phase::ReadyToResolve), PatchSource::Poll);

        // then
        assert_eq!(session.identity, bob());
        assert_eq!(session.phase, Phase::Idle);
    }

    fn arb_phase() -> impl Strategy<Value = Phase> {
        prop_oneof![
            Just(Phase::Idle),
            Just(Phase::Approving),
            Just(Phase::PlacingBet),
            Just(Phase::AwaitingRandomness),
            Just(Phase::ReadyToResolve),
            Just(Phase::Resolving),
            Just(Phase::CompletedWin),
            Just(Phase::CompletedLoss),
            Just(Phase::Cancelled),
        ]
    }

    fn arb_source() -> impl Strategy<Value = PatchSource> {
        prop_oneof![
            Just(PatchSource::Event),
            Just(PatchSource::Poll),
            Just(PatchSource::Optimistic),
            Just(PatchSource::Recovery),
        ]
    }

    proptest! {
        #[test]
        fn apply__phase_never_decreases_for_any_interleaving(
            steps in prop::collection::vec(
                (arb_phase(), prop::option::of(0u64..3), arb_source()),
                1..40,
            )
        ) {
            let store = store();
            let mut last_rank = store.get().phase.rank();
            for (phase, request_id, source) in steps {
                let mut patch = SessionPatch::new(alice()).phase(phase);
                patch.request_id = request_id.map(RequestId);
                let session = store.apply(patch, source);
                prop_assert!(session.phase.rank() >= last_rank);
                last_rank = session.phase.rank();
            }
        }
    }
}
