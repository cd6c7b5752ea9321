use crate::errors::ClassifiedError;
use chrono::{
    DateTime,
    Utc,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    str::FromStr,
};
use tokio::time::Instant;

/// Token amounts and payouts. The ledger uses 256-bit words; the client caps at `u128`.
pub type Amount = u128;

/// Largest allowance the client can express, used by the unlimited approval policy.
pub const MAX_AMOUNT: Amount = Amount::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl FromStr for Address {
    type Err = color_eyre::eyre::Report;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let cleaned = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(cleaned)
            .wrap_err_with(|| format!("address '{raw}' is not valid hex"))?;
        let bytes: [u8; 20] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            eyre!("address '{raw}' has {} bytes, expected 20", bytes.len())
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Address::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

/// Identifier of an oracle randomness request, as emitted by the game contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHash(pub [u8; 32]);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for TxHash {
    type Err = color_eyre::eyre::Report;

    fn from_str(raw: &str) -> Result<Self> {
        let cleaned = raw.trim().trim_start_matches("0x");
        let bytes = hex::decode(cleaned)
            .wrap_err_with(|| format!("transaction hash '{raw}' is not valid hex"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| eyre!("transaction hash '{raw}' must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Who the orchestrator is acting for and against which deployment.
/// Passed explicitly so an identity switch is a visible transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionContext {
    pub identity: Address,
    pub game: Address,
    pub chain_id: u64,
}

/// Bet lifecycle phase. Ordering follows [`Phase::rank`], not declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Approving,
    PlacingBet,
    AwaitingRandomness,
    ReadyToResolve,
    Resolving,
    CompletedWin,
    CompletedLoss,
    Cancelled,
}

impl Phase {
    /// Position in the total order used by the store. All terminal phases share a rank.
    pub fn rank(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Approving => 1,
            Phase::PlacingBet => 2,
            Phase::AwaitingRandomness => 3,
            Phase::ReadyToResolve => 4,
            Phase::Resolving => 5,
            Phase::CompletedWin | Phase::CompletedLoss | Phase::Cancelled => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::CompletedWin | Phase::CompletedLoss | Phase::Cancelled
        )
    }

    /// Phases where the session is waiting on the oracle and may be flagged stuck.
    pub fn can_stall(self) -> bool {
        matches!(self, Phase::AwaitingRandomness | Phase::ReadyToResolve)
    }

    /// A game exists (or is being created) on the ledger for this identity.
    pub fn is_in_progress(self) -> bool {
        !matches!(self, Phase::Idle) && !self.is_terminal()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "Idle",
            Phase::Approving => "Approving",
            Phase::PlacingBet => "Placing bet",
            Phase::AwaitingRandomness => "Awaiting randomness",
            Phase::ReadyToResolve => "Ready to resolve",
            Phase::Resolving => "Resolving",
            Phase::CompletedWin => "Won",
            Phase::CompletedLoss => "Lost",
            Phase::Cancelled => "Cancelled",
        };
        write!(f, "{name}")
    }
}

/// Canonical state of the current game for one identity. Owned by the store.
#[derive(Clone, Debug, PartialEq)]
pub struct GameSession {
    pub identity: Address,
    pub phase: Phase,
    pub chosen_value: Option<u32>,
    pub wager_amount: Option<Amount>,
    pub rolled_value: Option<u32>,
    pub payout: Option<Amount>,
    pub randomness_request_id: Option<RequestId>,
    pub randomness_fulfilled: bool,
    pub started_at: Option<Instant>,
    pub last_transition_at: Instant,
    pub last_error: Option<ClassifiedError>,
    pub stuck: bool,
    pub state_unknown: bool,
}

impl GameSession {
    pub fn idle(identity: Address) -> Self {
        Self {
            identity,
            phase: Phase::Idle,
            chosen_value: None,
            wager_amount: None,
            rolled_value: None,
            payout: None,
            randomness_request_id: None,
            randomness_fulfilled: false,
            started_at: None,
            last_transition_at: Instant::now(),
            last_error: None,
            stuck: false,
            state_unknown: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenAllowance {
    pub owner: Address,
    pub spender: Address,
    pub amount: Amount,
    pub last_checked_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    Approve,
    PlaceBet,
    Resolve,
    Recover,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionKind::Approve => "approve",
            TransactionKind::PlaceBet => "place bet",
            TransactionKind::Resolve => "resolve",
            TransactionKind::Recover => "recover",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TxOutcome {
    Pending,
    Confirmed,
    Failed(ClassifiedError),
    TimedOut,
}

impl TxOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxOutcome::Pending)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransactionRecord {
    pub kind: TransactionKind,
    pub hash: Option<TxHash>,
    pub submitted_at: Instant,
    pub confirmed_at: Option<Instant>,
    pub outcome: TxOutcome,
    /// Events decoded from the receipt, empty unless confirmed.
    pub events: Vec<LedgerEvent>,
}

impl TransactionRecord {
    pub fn pending(kind: TransactionKind) -> Self {
        Self {
            kind,
            hash: None,
            submitted_at: Instant::now(),
            confirmed_at: None,
            outcome: TxOutcome::Pending,
            events: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessRequest {
    pub request_id: RequestId,
    pub active: bool,
    pub fulfilled: bool,
}

/// Ledger-side status of a game record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameStatus {
    Pending,
    Won,
    Lost,
    Cancelled,
}

/// The game contract's view of an identity's current (or most recent) game.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GameRecord {
    pub player: Address,
    pub request_id: RequestId,
    pub chosen_value: u32,
    pub wager_amount: Amount,
    pub rolled_value: Option<u32>,
    pub payout: Option<Amount>,
    pub status: GameStatus,
    pub is_active: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlayerStats {
    pub games_played: u64,
    pub games_won: u64,
    pub total_wagered: Amount,
    pub total_paid_out: Amount,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub request_id: RequestId,
    pub chosen_value: u32,
    pub rolled_value: Option<u32>,
    pub wager_amount: Amount,
    pub payout: Amount,
    pub status: GameStatus,
    pub settled_at: DateTime<Utc>,
}

/// Contract events the client listens for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEvent {
    SessionStarted {
        player: Address,
        request_id: RequestId,
        chosen_value: u32,
        amount: Amount,
    },
    SessionCompleted {
        player: Address,
        request_id: RequestId,
        chosen_value: u32,
        rolled_value: u32,
        amount: Amount,
        payout: Amount,
        status: GameStatus,
    },
    SessionCancelled {
        player: Address,
        request_id: RequestId,
        reason: String,
    },
    RandomnessFulfilled {
        request_id: RequestId,
    },
    Approval {
        owner: Address,
        spender: Address,
        amount: Amount,
    },
}

/// State-changing calls. Only the transaction executor submits these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContractCall {
    Approve { spender: Address, amount: Amount },
    PlaceBet { chosen_value: u32, wager: Amount },
    Resolve,
    RecoverStuckSession { player: Address },
}

impl ContractCall {
    pub fn kind(&self) -> TransactionKind {
        match self {
            ContractCall::Approve { .. } => TransactionKind::Approve,
            ContractCall::PlaceBet { .. } => TransactionKind::PlaceBet,
            ContractCall::Resolve => TransactionKind::Resolve,
            ContractCall::RecoverStuckSession { .. } => TransactionKind::Recover,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    Reverted { reason: Option<String> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub hash: TxHash,
    pub status: ReceiptStatus,
    pub events: Vec<LedgerEvent>,
}
