//! The one reconciliation function both the event feed and the poller go
//! through. Pure: takes an observation and the current session, returns the
//! minimal patch (if any) the store should fold.

use crate::{
    store::SessionPatch,
    types::{
        GameRecord,
        GameSession,
        GameStatus,
        LedgerEvent,
        Phase,
        RandomnessRequest,
        RequestId,
    },
};

/// Everything one polling pass read from the ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub game: Option<GameRecord>,
    pub randomness: Option<RandomnessRequest>,
}

pub fn fold_event(event: &LedgerEvent, session: &GameSession) -> Option<SessionPatch> {
    match event {
        LedgerEvent::SessionStarted {
            player,
            request_id,
            chosen_value,
            amount,
        } => Some(
            SessionPatch::new(*player)
                .phase(Phase::AwaitingRandomness)
                .request_id(*request_id)
                .bet(*chosen_value, *amount),
        ),
        LedgerEvent::SessionCompleted {
            player,
            request_id,
            chosen_value,
            rolled_value,
            amount,
            payout,
            status,
        } => {
            if !is_current(session, *request_id) {
                return None;
            }
            let patch = SessionPatch::new(*player)
                .request_id(*request_id)
                .bet(*chosen_value, *amount)
                .outcome(*rolled_value, *payout)
                .fulfilled();
            Some(match terminal_phase(*status) {
                Some(phase) => patch.phase(phase),
                None => patch,
            })
        }
        LedgerEvent::SessionCancelled {
            player, request_id, ..
        } => is_current(session, *request_id).then(|| {
            SessionPatch::new(*player)
                .request_id(*request_id)
                .phase(Phase::Cancelled)
        }),
        LedgerEvent::RandomnessFulfilled { request_id } => {
            is_current(session, *request_id).then(|| fulfilled(session, *request_id))
        }
        LedgerEvent::Approval { .. } => None,
    }
}

pub fn fold_snapshot(snapshot: &LedgerSnapshot, session: &GameSession) -> Option<SessionPatch> {
    let game = snapshot.game.as_ref()?;
    if game.player != session.identity {
        return None;
    }
    let base = SessionPatch::new(game.player)
        .request_id(game.request_id)
        .bet(game.chosen_value, game.wager_amount);

    if let Some(phase) = terminal_phase(game.status) {
        // The ledger keeps the last settled game around; it only counts if it
        // is the game this session is tracking.
        if !is_current(session, game.request_id) {
            return None;
        }
        let mut patch = base.phase(phase);
        patch.rolled_value = game.rolled_value;
        patch.payout = game.payout;
        return Some(patch);
    }

    if !game.is_active {
        // Pending but inactive: not visible yet, which is not the same as cancelled.
        return None;
    }
    let randomness_ready = snapshot
        .randomness
        .as_ref()
        .is_some_and(|r| r.request_id == game.request_id && r.fulfilled);
    Some(if randomness_ready {
        base.phase(Phase::ReadyToResolve).fulfilled()
    } else {
        base.phase(Phase::AwaitingRandomness)
    })
}

fn fulfilled(session: &GameSession, request_id: RequestId) -> SessionPatch {
    SessionPatch::new(session.identity)
        .request_id(request_id)
        .phase(Phase::ReadyToResolve)
        .fulfilled()
}

fn is_current(session: &GameSession, request_id: RequestId) -> bool {
    session.randomness_request_id == Some(request_id)
}

fn terminal_phase(status: GameStatus) -> Option<Phase> {
    match status {
        GameStatus::Won => Some(Phase::CompletedWin),
        GameStatus::Lost => Some(Phase::CompletedLoss),
        GameStatus::Cancelled => Some(Phase::Cancelled),
        GameStatus::Pending => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::types::Address;

    fn alice() -> Address {
        Address([0xa1; 20])
    }

    fn tracking(request_id: u64, phase: Phase) -> GameSession {
        let mut session = GameSession::idle(alice());
        session.phase = phase;
        session.randomness_request_id = Some(RequestId(request_id));
        session
    }

    fn pending_game(request_id: u64, is_active: bool) -> GameRecord {
        GameRecord {
            player: alice(),
            request_id: RequestId(request_id),
            chosen_value: 50,
            wager_amount: 100,
            rolled_value: None,
            payout: None,
            status: GameStatus::Pending,
            is_active,
        }
    }

    #[test]
    fn fold_event__session_started_adopts_request_id() {
        // given
        let session = GameSession::idle(alice());
        let event = LedgerEvent::SessionStarted {
            player: alice(),
            request_id: RequestId(4),
            chosen_value: 50,
            amount: 100,
        };

        // when
        let patch = fold_event(&event, &session).unwrap();

        // then
        assert_eq!(patch.phase, Some(Phase::AwaitingRandomness));
        assert_eq!(patch.request_id, Some(RequestId(4)));
        assert_eq!(patch.wager_amount, Some(100));
    }

    #[test]
    fn fold_event__randomness_for_other_request_is_ignored() {
        let session = tracking(4, Phase::AwaitingRandomness);
        let event = LedgerEvent::RandomnessFulfilled {
            request_id: RequestId(5),
        };
        assert_eq!(fold_event(&event, &session), None);
    }

    #[test]
    fn fold_event__randomness_for_current_request_readies_resolution() {
        let session = tracking(4, Phase::AwaitingRandomness);
        let event = LedgerEvent::RandomnessFulfilled {
            request_id: RequestId(4),
        };
        let patch = fold_event(&event, &session).unwrap();
        assert_eq!(patch.phase, Some(Phase::ReadyToResolve));
        assert!(patch.randomness_fulfilled);
    }

    #[test]
    fn fold_event__completion_maps_status_to_terminal_phase() {
        // given
        let session = tracking(4, Phase::Resolving);
        let event = LedgerEvent::SessionCompleted {
            player: alice(),
            request_id: RequestId(4),
            chosen_value: 50,
            rolled_value: 12,
            amount: 100,
            payout: 0,
            status: GameStatus::Lost,
        };

        // when
        let patch = fold_event(&event, &session).unwrap();

        // then
        assert_eq!(patch.phase, Some(Phase::CompletedLoss));
        assert_eq!(patch.rolled_value, Some(12));
        assert_eq!(patch.payout, Some(0));
    }

    #[test]
    fn fold_event__late_completion_after_reset_is_ignored() {
        let session = GameSession::idle(alice());
        let event = LedgerEvent::SessionCancelled {
            player: alice(),
            request_id: RequestId(4),
            reason: "timeout".to_string(),
        };
        assert_eq!(fold_event(&event, &session), None);
    }

    #[test]
    fn fold_snapshot__inactive_pending_game_is_not_a_cancellation() {
        let session = tracking(4, Phase::PlacingBet);
        let snapshot = LedgerSnapshot {
            game: Some(pending_game(4, false)),
            randomness: None,
        };
        assert_eq!(fold_snapshot(&snapshot, &session), None);
    }

    #[test]
    fn fold_snapshot__active_game_with_fulfilled_randomness() {
        // given
        let session = GameSession::idle(alice());
        let snapshot = LedgerSnapshot {
            game: Some(pending_game(4, true)),
            randomness: Some(RandomnessRequest {
                request_id: RequestId(4),
                active: true,
                fulfilled: true,
            }),
        };

        // when
        let patch = fold_snapshot(&snapshot, &session).unwrap();

        // then
        assert_eq!(patch.phase, Some(Phase::ReadyToResolve));
        assert_eq!(patch.request_id, Some(RequestId(4)));
        assert!(patch.randomness_fulfilled);
    }

    #[test]
    fn fold_snapshot__settled_previous_game_does_not_resurrect() {
        // given
        let session = GameSession::idle(alice());
        let mut game = pending_game(4, false);
        game.status = GameStatus::Won;
        game.rolled_value = Some(80);
        game.payout = Some(190);

        // when
        let patch = fold_snapshot(
            &LedgerSnapshot {
                game: Some(game),
                randomness: None,
            },
            &session,
        );

        // then
        assert_eq!(patch, None);
    }
}
