#![allow(non_snake_case)]

use session_orchestrator::{
    lifecycle::LifecycleError,
    notifications::Notice,
    test_helpers::{
        GAME,
        OTHER_PLAYER,
        PLAYER,
        ReceiptScript,
        TestContext,
    },
    types::{
        GameStatus,
        LedgerEvent,
        Phase,
        RequestId,
        TransactionKind,
    },
};
use std::time::Duration;
use tokio::sync::broadcast;

async fn awaiting_randomness() -> TestContext {
    let ctx = TestContext::new().await;
    ctx.ledger.set_allowance(PLAYER, GAME, 1_000);
    ctx.orchestrator.place_bet(42, 50).await.unwrap();
    ctx.settle().await;
    ctx
}

fn transitions_to(notices: &mut broadcast::Receiver<Notice>, phase: Phase) -> usize {
    let mut count = 0;
    while let Ok(notice) = notices.try_recv() {
        if matches!(notice, Notice::PhaseChanged { to, .. } if to == phase) {
            count += 1;
        }
    }
    count
}

#[tokio::test(start_paused = true)]
async fn fulfillment__event_then_poll_transitions_once() {
    // given
    let ctx = awaiting_randomness().await;
    let mut notices = ctx.orchestrator.notices();

    // when
    ctx.ledger.fulfill_randomness(RequestId(1), true);
    ctx.settle().await;
    ctx.orchestrator.poll_now();
    ctx.settle().await;

    // then
    let session = ctx.orchestrator.session();
    assert_eq!(session.phase, Phase::ReadyToResolve);
    assert!(session.randomness_fulfilled);
    assert_eq!(transitions_to(&mut notices, Phase::ReadyToResolve), 1);
}

#[tokio::test(start_paused = true)]
async fn fulfillment__missed_event_is_picked_up_by_poll() {
    // given
    let ctx = awaiting_randomness().await;

    // when
    ctx.ledger.fulfill_randomness(RequestId(1), false);
    ctx.orchestrator.poll_now();
    ctx.settle().await;

    // then
    assert_eq!(ctx.orchestrator.session().phase, Phase::ReadyToResolve);
    assert!(ctx.orchestrator.available_actions().can_resolve);
}

#[tokio::test(start_paused = true)]
async fn fulfillment__missed_event_is_picked_up_by_periodic_poll() {
    // given
    let ctx = awaiting_randomness().await;

    // when
    ctx.ledger.fulfill_randomness(RequestId(1), false);
    tokio::time::sleep(ctx.orchestrator.config().polling.active_interval() + Duration::from_secs(1))
        .await;

    // then
    assert_eq!(ctx.orchestrator.session().phase, Phase::ReadyToResolve);
}

#[tokio::test(start_paused = true)]
async fn events__duplicates_are_idempotent() {
    // given
    let ctx = awaiting_randomness().await;
    let before = ctx.orchestrator.session();
    let mut notices = ctx.orchestrator.notices();
    let started = LedgerEvent::SessionStarted {
        player: PLAYER,
        request_id: RequestId(1),
        chosen_value: 42,
        amount: 50,
    };

    // when
    ctx.ledger.emit(started.clone());
    ctx.ledger.emit(started);
    ctx.settle().await;

    // then
    assert_eq!(ctx.orchestrator.session(), before);
    assert_eq!(transitions_to(&mut notices, Phase::AwaitingRandomness), 0);
}

#[tokio::test(start_paused = true)]
async fn events__other_players_are_ignored() {
    // given
    let ctx = TestContext::new().await;
    ctx.settle().await;

    // when
    ctx.ledger.emit(LedgerEvent::SessionStarted {
        player: OTHER_PLAYER,
        request_id: RequestId(9),
        chosen_value: 3,
        amount: 10,
    });
    ctx.settle().await;

    // then
    let session = ctx.orchestrator.session();
    assert_eq!(session.phase, Phase::Idle);
    assert_eq!(session.randomness_request_id, None);
}

#[tokio::test(start_paused = true)]
async fn resolve__settles_with_outcome() {
    // given
    let ctx = awaiting_randomness().await;
    ctx.ledger.set_outcome(GameStatus::Won, 12, 190);
    ctx.ledger.fulfill_randomness(RequestId(1), true);
    ctx.settle().await;

    // when
    let session = ctx.orchestrator.resolve().await.unwrap();

    // then
    assert_eq!(session.phase, Phase::CompletedWin);
    assert_eq!(session.rolled_value, Some(12));
    assert_eq!(session.payout, Some(190));
    assert_eq!(ctx.ledger.submissions_of(TransactionKind::Resolve), 1);
    assert!(ctx.orchestrator.available_actions().can_reset);
}

#[tokio::test(start_paused = true)]
async fn resolve__timeout_that_never_lands_can_be_retried() {
    // given
    let ctx = awaiting_randomness().await;
    ctx.ledger.fulfill_randomness(RequestId(1), true);
    ctx.settle().await;
    ctx.ledger
        .script_next(TransactionKind::Resolve, ReceiptScript::Hang);
    let first = ctx.orchestrator.resolve().await;
    let polling = &ctx.orchestrator.config().polling;
    let wait = polling.unconfirmed_grace() + polling.active_interval() + Duration::from_secs(1);

    // when
    tokio::time::sleep(wait).await;
    let released = ctx.orchestrator.session();
    let actions = ctx.orchestrator.available_actions();
    let retried = ctx.orchestrator.resolve().await;

    // then
    assert_eq!(
        first.unwrap_err(),
        LifecycleError::TimedOut(TransactionKind::Resolve)
    );
    assert_eq!(released.phase, Phase::ReadyToResolve);
    assert!(actions.can_resolve);
    assert_eq!(retried.unwrap().phase, Phase::CompletedLoss);
    assert_eq!(ctx.ledger.submissions_of(TransactionKind::Resolve), 2);
}

#[tokio::test(start_paused = true)]
async fn reset__stale_completion_does_not_resurrect_old_game() {
    // given
    let ctx = awaiting_randomness().await;
    ctx.ledger.fulfill_randomness(RequestId(1), true);
    ctx.settle().await;
    ctx.orchestrator.resolve().await.unwrap();
    ctx.orchestrator.reset().unwrap();

    // when
    ctx.ledger.emit(LedgerEvent::SessionCompleted {
        player: PLAYER,
        request_id: RequestId(1),
        chosen_value: 42,
        rolled_value: 87,
        amount: 50,
        payout: 0,
        status: GameStatus::Lost,
    });
    ctx.orchestrator.poll_now();
    ctx.settle().await;

    // then
    let session = ctx.orchestrator.session();
    assert_eq!(session.phase, Phase::Idle);
    assert_eq!(session.randomness_request_id, None);
    assert!(ctx.orchestrator.available_actions().can_place_bet);
}

#[tokio::test(start_paused = true)]
async fn events__dropped_stream_is_resubscribed() {
    // given
    let ctx = TestContext::new().await;
    ctx.settle().await;
    assert_eq!(ctx.ledger.subscribe_calls(), 1);

    // when
    ctx.ledger.drop_event_streams();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // then
    assert_eq!(ctx.ledger.subscribe_calls(), 2);
    assert_eq!(ctx.ledger.live_subscriptions(), 1);
}

#[tokio::test(start_paused = true)]
async fn poll__repeated_failures_mark_state_unknown_until_a_read_succeeds() {
    // given
    let ctx = TestContext::new().await;
    ctx.settle().await;
    let mut notices = ctx.orchestrator.notices();
    let attempts = ctx.orchestrator.config().polling.max_attempts;
    ctx.ledger.fail_next_reads(attempts);

    // when
    ctx.orchestrator.poll_now();
    tokio::time::sleep(Duration::from_secs(10)).await;
    let unknown = ctx.orchestrator.session().state_unknown;
    ctx.orchestrator.poll_now();
    ctx.settle().await;

    // then
    assert!(unknown);
    assert!(!ctx.orchestrator.session().state_unknown);
    let mut saw_state_unknown = false;
    while let Ok(notice) = notices.try_recv() {
        saw_state_unknown |= matches!(notice, Notice::StateUnknown { .. });
    }
    assert!(saw_state_unknown);
}

#[tokio::test(start_paused = true)]
async fn switch_identity__drops_previous_session() {
    // given
    let ctx = awaiting_randomness().await;

    // when
    let session = ctx.orchestrator.switch_identity(OTHER_PLAYER);
    ctx.ledger.fulfill_randomness(RequestId(1), true);
    ctx.settle().await;

    // then
    assert_eq!(session.identity, OTHER_PLAYER);
    assert_eq!(session.phase, Phase::Idle);
    let current = ctx.orchestrator.session();
    assert_eq!(current.identity, OTHER_PLAYER);
    assert_eq!(current.phase, Phase::Idle);
    assert_eq!(ctx.orchestrator.context().identity, OTHER_PLAYER);
}

#[tokio::test(start_paused = true)]
async fn connect__wrong_chain_blocks_actions() {
    // given
    let ctx = TestContext::new().await;
    ctx.ledger.set_chain_id(1);

    // when
    let result = ctx.orchestrator.connect().await;

    // then
    assert!(result.is_err());
    assert!(!ctx.orchestrator.available_actions().can_place_bet);
    assert!(ctx.orchestrator.place_bet(42, 50).await.is_err());
    assert!(ctx.ledger.submissions().is_empty());
}
