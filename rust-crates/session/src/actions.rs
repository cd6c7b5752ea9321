use crate::types::{
    GameSession,
    Phase,
};

/// What the ledger client and the orchestrator's own bookkeeping currently allow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActionContext {
    pub network_ok: bool,
    pub bet_in_flight: bool,
    pub resolve_in_flight: bool,
    pub recover_in_flight: bool,
    pub any_in_flight: bool,
    pub resolve_cooling_down: bool,
    pub recover_cooling_down: bool,
}

/// Which user actions make sense right now, derived from one session snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvailableActions {
    pub can_place_bet: bool,
    pub can_resolve: bool,
    pub can_recover: bool,
    pub can_reset: bool,
    pub status: String,
}

impl AvailableActions {
    pub fn project(session: &GameSession, ctx: ActionContext) -> Self {
        let phase = session.phase;
        Self {
            can_place_bet: ctx.network_ok && phase == Phase::Idle && !ctx.bet_in_flight,
            can_resolve: ctx.network_ok
                && phase == Phase::ReadyToResolve
                && !ctx.resolve_in_flight
                && !ctx.resolve_cooling_down,
            can_recover: ctx.network_ok
                && session.stuck
                && phase.can_stall()
                && !ctx.recover_in_flight
                && !ctx.recover_cooling_down,
            can_reset: phase.is_terminal() && !ctx.any_in_flight,
            status: status_line(session),
        }
    }
}

pub fn status_line(session: &GameSession) -> String {
    let mut line = match session.phase {
        Phase::Idle => "Ready to play".to_string(),
        Phase::Approving => "Approving tokens...".to_string(),
        Phase::PlacingBet => match (session.wager_amount, session.chosen_value) {
            (Some(wager), Some(value)) => format!("Placing bet of {wager} on {value}..."),
            _ => "Placing bet...".to_string(),
        },
        Phase::AwaitingRandomness => match session.randomness_request_id {
            Some(id) => format!("Waiting for randomness {id}"),
            None => "Waiting for randomness".to_string(),
        },
        Phase::ReadyToResolve => "Randomness arrived, ready to resolve".to_string(),
        Phase::Resolving => "Resolving...".to_string(),
        Phase::CompletedWin => format!(
            "Won! Rolled {}, paid out {}",
            display_or_dash(session.rolled_value),
            display_or_dash(session.payout)
        ),
        Phase::CompletedLoss => {
            format!("Lost. Rolled {}", display_or_dash(session.rolled_value))
        }
        Phase::Cancelled => "Game cancelled".to_string(),
    };
    if session.stuck {
        line.push_str(" (stuck, recovery available)");
    }
    if session.state_unknown {
        line.push_str(" [ledger unreachable, state may be stale]");
    }
    if let Some(error) = &session.last_error {
        line.push_str(&format!(" | {}", error.user_message));
    }
    line
}

fn display_or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
