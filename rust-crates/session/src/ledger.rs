//! Narrow interfaces to the ledger client. Everything behind them is assumed
//! correct but slow, sometimes unavailable and sometimes silent.

use crate::types::{
    Address,
    Amount,
    ContractCall,
    GameRecord,
    HistoryEntry,
    LedgerEvent,
    PlayerStats,
    RandomnessRequest,
    Receipt,
    RequestId,
    TxHash,
};
use color_eyre::eyre::Result;
use futures::stream::BoxStream;
use std::future::Future;

pub type EventStream = BoxStream<'static, Result<LedgerEvent>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxParams {
    pub value: Amount,
    pub gas_limit: u64,
}

/// Events are scoped by the indexed player where the schema allows it.
/// `RandomnessFulfilled` carries only a request id and is always delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventFilter {
    pub player: Address,
}

impl EventFilter {
    pub fn matches(&self, event: &LedgerEvent) -> bool {
        match event {
            LedgerEvent::SessionStarted { player, .. }
            | LedgerEvent::SessionCompleted { player, .. }
            | LedgerEvent::SessionCancelled { player, .. } => *player == self.player,
            LedgerEvent::Approval { owner, .. } => *owner == self.player,
            LedgerEvent::RandomnessFulfilled { .. } => true,
        }
    }
}

pub trait LedgerReader: Send + Sync {
    fn chain_id(&self) -> impl Future<Output = Result<u64>> + Send;

    /// The player's current game, or the most recent one if it has settled.
    fn current_game(
        &self,
        player: Address,
    ) -> impl Future<Output = Result<Option<GameRecord>>> + Send;

    fn allowance(
        &self,
        owner: Address,
        spender: Address,
    ) -> impl Future<Output = Result<Amount>> + Send;

    fn token_balance(&self, owner: Address) -> impl Future<Output = Result<Amount>> + Send;

    fn player_stats(
        &self,
        player: Address,
    ) -> impl Future<Output = Result<PlayerStats>> + Send;

    fn recent_history(
        &self,
        player: Address,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<HistoryEntry>>> + Send;

    fn randomness_request(
        &self,
        request_id: RequestId,
    ) -> impl Future<Output = Result<Option<RandomnessRequest>>> + Send;

    fn can_start_game(&self, player: Address) -> impl Future<Output = Result<bool>> + Send;
}

pub trait LedgerWriter: Send + Sync {
    fn estimate_gas(
        &self,
        from: Address,
        call: &ContractCall,
        value: Amount,
    ) -> impl Future<Output = Result<u64>> + Send;

    fn submit(
        &self,
        from: Address,
        call: &ContractCall,
        params: TxParams,
    ) -> impl Future<Output = Result<TxHash>> + Send;

    /// Resolves once the transaction is mined. May never resolve.
    fn wait_for_receipt(&self, hash: TxHash) -> impl Future<Output = Result<Receipt>> + Send;
}

pub trait EventSource: Send + Sync {
    fn subscribe(
        &self,
        filter: EventFilter,
    ) -> impl Future<Output = Result<EventStream>> + Send;
}

/// A complete ledger client: reads, writes and the event feed.
pub trait Ledger: LedgerReader + LedgerWriter + EventSource + Clone + 'static {}

impl<T> Ledger for T where T: LedgerReader + LedgerWriter + EventSource + Clone + 'static {}
