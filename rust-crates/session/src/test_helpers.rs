//! In-memory ledger for tests. Submissions mutate a small model of the game
//! and token contracts so reads, receipts and events stay consistent.

use crate::{
    config::{
        ContractAddresses,
        OrchestratorConfig,
    },
    errors::LedgerFault,
    ledger::{
        EventFilter,
        EventSource,
        EventStream,
        LedgerReader,
        LedgerWriter,
        TxParams,
    },
    orchestrator::GameOrchestrator,
    types::{
        Address,
        Amount,
        ContractCall,
        GameRecord,
        GameStatus,
        HistoryEntry,
        LedgerEvent,
        PlayerStats,
        RandomnessRequest,
        Receipt,
        ReceiptStatus,
        RequestId,
        TransactionKind,
        TxHash,
    },
};
use color_eyre::eyre::{
    Result,
    eyre,
};
use futures::StreamExt;
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
    time::Duration,
};
use tokio::sync::mpsc;

pub const PLAYER: Address = Address([0xa1; 20]);
pub const OTHER_PLAYER: Address = Address([0xb2; 20]);
pub const GAME: Address = Address([0x6a; 20]);
pub const TOKEN: Address = Address([0x70; 20]);

const DEFAULT_BALANCE: Amount = 1_000_000;

/// A valid config pointing at the fake deployment, with auto-resolve off so
/// tests drive resolution explicitly.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        contracts: ContractAddresses {
            game: GAME,
            token: TOKEN,
        },
        ..OrchestratorConfig::default()
    };
    config.transactions.auto_resolve = false;
    config
}

/// A connected orchestrator for [`PLAYER`] on top of a fresh [`FakeLedger`].
pub struct TestContext {
    pub ledger: FakeLedger,
    pub orchestrator: GameOrchestrator<FakeLedger>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: OrchestratorConfig) -> Self {
        Self::with_ledger(FakeLedger::default(), config).await
    }

    pub async fn with_ledger(ledger: FakeLedger, config: OrchestratorConfig) -> Self {
        let orchestrator = GameOrchestrator::new(ledger.clone(), config, PLAYER)
            .unwrap_or_else(|e| panic!("test config rejected: {e:#}"));
        orchestrator
            .connect()
            .await
            .unwrap_or_else(|e| panic!("fake ledger refused connection: {e}"));
        Self {
            ledger,
            orchestrator,
        }
    }

    /// Lets background tasks run without moving past any real deadline.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.orchestrator.shutdown();
    }
}

/// How the fake ledger treats the next submission of a kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiptScript {
    Confirm,
    /// Mined after a delay.
    Delay(Duration),
    /// Mined but reverted.
    Revert(Option<String>),
    /// Accepted but never mined until [`FakeLedger::land_pending`].
    Hang,
    /// Refused by the wallet before submission.
    RejectSubmit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub from: Address,
    pub call: ContractCall,
    pub params: TxParams,
    pub hash: TxHash,
}

#[derive(Clone, Debug, Default)]
pub struct FakeLedger {
    state: Arc<Mutex<FakeLedgerState>>,
}

#[derive(Debug)]
struct FakeLedgerState {
    chain_id: u64,
    game: Option<GameRecord>,
    allowances: HashMap<(Address, Address), Amount>,
    balances: HashMap<Address, Amount>,
    stats: PlayerStats,
    history: Vec<HistoryEntry>,
    randomness: HashMap<RequestId, RandomnessRequest>,
    gas_estimate: Option<u64>,
    scripts: HashMap<TransactionKind, VecDeque<ReceiptScript>>,
    receipts: HashMap<TxHash, (ReceiptScript, Receipt)>,
    hanging: Vec<Submission>,
    submissions: Vec<Submission>,
    subscribers: Vec<(EventFilter, mpsc::UnboundedSender<Result<LedgerEvent>>)>,
    subscribe_calls: usize,
    failing_reads: u32,
    game_reads: u32,
    allowance_reads: u32,
    next_request_id: u64,
    next_hash: u64,
    outcome: (GameStatus, u32, Amount),
}

impl Default for FakeLedgerState {
    fn default() -> Self {
        Self {
            chain_id: 31337,
            game: None,
            allowances: HashMap::new(),
            balances: HashMap::new(),
            stats: PlayerStats::default(),
            history: Vec::new(),
            randomness: HashMap::new(),
            gas_estimate: Some(100_000),
            scripts: HashMap::new(),
            receipts: HashMap::new(),
            hanging: Vec::new(),
            submissions: Vec::new(),
            subscribers: Vec::new(),
            subscribe_calls: 0,
            failing_reads: 0,
            game_reads: 0,
            allowance_reads: 0,
            next_request_id: 1,
            next_hash: 1,
            outcome: (GameStatus::Lost, 87, 0),
        }
    }
}

impl FakeLedger {
    fn state(&self) -> MutexGuard<'_, FakeLedgerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.state().chain_id = chain_id;
    }

    pub fn set_allowance(&self, owner: Address, spender: Address, amount: Amount) {
        self.state().allowances.insert((owner, spender), amount);
    }

    pub fn set_balance(&self, owner: Address, amount: Amount) {
        self.state().balances.insert(owner, amount);
    }

    pub fn set_gas_estimate(&self, estimate: Option<u64>) {
        self.state().gas_estimate = estimate;
    }

    pub fn set_stats(&self, stats: PlayerStats) {
        self.state().stats = stats;
    }

    pub fn push_history(&self, entry: HistoryEntry) {
        self.state().history.push(entry);
    }

    pub fn set_game(&self, game: Option<GameRecord>) {
        let mut state = self.state();
        if let Some(game) = &game {
            state.randomness.entry(game.request_id).or_insert(RandomnessRequest {
                request_id: game.request_id,
                active: game.is_active,
                fulfilled: false,
            });
        }
        state.game = game;
    }

    /// Outcome of the next resolve: status, rolled value, payout.
    pub fn set_outcome(&self, status: GameStatus, rolled_value: u32, payout: Amount) {
        self.state().outcome = (status, rolled_value, payout);
    }

    pub fn script_next(&self, kind: TransactionKind, script: ReceiptScript) {
        self.state()
            .scripts
            .entry(kind)
            .or_default()
            .push_back(script);
    }

    /// The next `count` game reads fail with a network error.
    pub fn fail_next_reads(&self, count: u32) {
        self.state().failing_reads = count;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn submissions_of(&self, kind: TransactionKind) -> usize {
        self.state()
            .submissions
            .iter()
            .filter(|s| s.call.kind() == kind)
            .count()
    }

    pub fn game(&self) -> Option<GameRecord> {
        self.state().game.clone()
    }

    pub fn game_reads(&self) -> u32 {
        self.state().game_reads
    }

    pub fn allowance_reads(&self) -> u32 {
        self.state().allowance_reads
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    pub fn live_subscriptions(&self) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state.subscribers.len()
    }

    /// Marks the randomness for `request_id` fulfilled, optionally announcing it.
    pub fn fulfill_randomness(&self, request_id: RequestId, announce: bool) {
        let mut state = self.state();
        if let Some(request) = state.randomness.get_mut(&request_id) {
            request.fulfilled = true;
        }
        if announce {
            state.emit(&LedgerEvent::RandomnessFulfilled { request_id });
        }
    }

    pub fn emit(&self, event: LedgerEvent) {
        self.state().emit(&event);
    }

    /// Ends every open event stream, as a dropped connection would.
    pub fn drop_event_streams(&self) {
        self.state().subscribers.clear();
    }

    /// Mines every hanging submission. Their receipts are never delivered.
    pub fn land_pending(&self) {
        let mut state = self.state();
        let hanging = std::mem::take(&mut state.hanging);
        for submission in hanging {
            let (status, events) = state.apply_call(submission.from, &submission.call);
            if status == ReceiptStatus::Success {
                for event in &events {
                    state.emit(event);
                }
            }
        }
    }
}

impl FakeLedgerState {
    fn emit(&mut self, event: &LedgerEvent) {
        self.subscribers.retain(|(filter, tx)| {
            if !filter.matches(event) {
                return !tx.is_closed();
            }
            tx.send(Ok(event.clone())).is_ok()
        });
    }

    fn next_hash(&mut self) -> TxHash {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&self.next_hash.to_be_bytes());
        self.next_hash += 1;
        TxHash(bytes)
    }

    fn apply_call(
        &mut self,
        from: Address,
        call: &ContractCall,
    ) -> (ReceiptStatus, Vec<LedgerEvent>) {
        match call {
            ContractCall::Approve { spender, amount } => {
                self.allowances.insert((from, *spender), *amount);
                (
                    ReceiptStatus::Success,
                    vec![LedgerEvent::Approval {
                        owner: from,
                        spender: *spender,
                        amount: *amount,
                    }],
                )
            }
            ContractCall::PlaceBet {
                chosen_value,
                wager,
            } => {
                if self.game.as_ref().is_some_and(|g| g.is_active) {
                    return reverted("game already active");
                }
                let allowance = self.allowances.get(&(from, GAME)).copied().unwrap_or(0);
                if allowance < *wager {
                    return reverted("ERC20: insufficient allowance");
                }
                let request_id = RequestId(self.next_request_id);
                self.next_request_id += 1;
                self.game = Some(GameRecord {
                    player: from,
                    request_id,
                    chosen_value: *chosen_value,
                    wager_amount: *wager,
                    rolled_value: None,
                    payout: None,
                    status: GameStatus::Pending,
                    is_active: true,
                });
                self.randomness.insert(request_id, RandomnessRequest {
                    request_id,
                    active: true,
                    fulfilled: false,
                });
                (
                    ReceiptStatus::Success,
                    vec![LedgerEvent::SessionStarted {
                        player: from,
                        request_id,
                        chosen_value: *chosen_value,
                        amount: *wager,
                    }],
                )
            }
            ContractCall::Resolve => {
                let (status, rolled_value, payout) = self.outcome;
                let Some(game) = self.game.as_mut().filter(|g| g.is_active) else {
                    return reverted("no active game");
                };
                game.status = status;
                game.rolled_value = Some(rolled_value);
                game.payout = Some(payout);
                game.is_active = false;
                (
                    ReceiptStatus::Success,
                    vec![LedgerEvent::SessionCompleted {
                        player: game.player,
                        request_id: game.request_id,
                        chosen_value: game.chosen_value,
                        rolled_value,
                        amount: game.wager_amount,
                        payout,
                        status,
                    }],
                )
            }
            ContractCall::RecoverStuckSession { player } => {
                let Some(game) = self
                    .game
                    .as_mut()
                    .filter(|g| g.is_active && g.player == *player)
                else {
                    return reverted("no stuck game");
                };
                game.status = GameStatus::Cancelled;
                game.is_active = false;
                (
                    ReceiptStatus::Success,
                    vec![LedgerEvent::SessionCancelled {
                        player: *player,
                        request_id: game.request_id,
                        reason: "recovered".to_string(),
                    }],
                )
            }
        }
    }
}

fn reverted(reason: &str) -> (ReceiptStatus, Vec<LedgerEvent>) {
    (
        ReceiptStatus::Reverted {
            reason: Some(reason.to_string()),
        },
        Vec::new(),
    )
}

impl LedgerReader for FakeLedger {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.state().chain_id)
    }

    async fn current_game(&self, player: Address) -> Result<Option<GameRecord>> {
        let mut state = self.state();
        state.game_reads += 1;
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(LedgerFault::Network("connection reset".to_string()).into());
        }
        Ok(state.game.clone().filter(|g| g.player == player))
    }

    async fn allowance(&self, owner: Address, spender: Address) -> Result<Amount> {
        let mut state = self.state();
        state.allowance_reads += 1;
        Ok(state.allowances.get(&(owner, spender)).copied().unwrap_or(0))
    }

    async fn token_balance(&self, owner: Address) -> Result<Amount> {
        Ok(self
            .state()
            .balances
            .get(&owner)
            .copied()
            .unwrap_or(DEFAULT_BALANCE))
    }

    async fn player_stats(&self, _player: Address) -> Result<PlayerStats> {
        Ok(self.state().stats.clone())
    }

    async fn recent_history(&self, _player: Address, limit: usize) -> Result<Vec<HistoryEntry>> {
        Ok(self.state().history.iter().take(limit).cloned().collect())
    }

    async fn randomness_request(&self, request_id: RequestId) -> Result<Option<RandomnessRequest>> {
        Ok(self.state().randomness.get(&request_id).cloned())
    }

    async fn can_start_game(&self, player: Address) -> Result<bool> {
        Ok(!self
            .state()
            .game
            .as_ref()
            .is_some_and(|g| g.player == player && g.is_active))
    }
}

impl LedgerWriter for FakeLedger {
    async fn estimate_gas(&self, _from: Address, _call: &ContractCall, _value: Amount) -> Result<u64> {
        self.state()
            .gas_estimate
            .ok_or_else(|| eyre!("gas estimation unavailable"))
    }

    async fn submit(&self, from: Address, call: &ContractCall, params: TxParams) -> Result<TxHash> {
        let mut state = self.state();
        let script = state
            .scripts
            .get_mut(&call.kind())
            .and_then(VecDeque::pop_front)
            .unwrap_or(ReceiptScript::Confirm);
        if script == ReceiptScript::RejectSubmit {
            return Err(LedgerFault::UserRejected.into());
        }
        let hash = state.next_hash();
        let submission = Submission {
            from,
            call: call.clone(),
            params,
            hash,
        };
        state.submissions.push(submission.clone());

        let receipt = match &script {
            ReceiptScript::Hang => {
                state.hanging.push(submission);
                Receipt {
                    hash,
                    status: ReceiptStatus::Success,
                    events: Vec::new(),
                }
            }
            ReceiptScript::Revert(reason) => Receipt {
                hash,
                status: ReceiptStatus::Reverted {
                    reason: reason.clone(),
                },
                events: Vec::new(),
            },
            _ => {
                let (status, events) = state.apply_call(from, call);
                if status == ReceiptStatus::Success {
                    for event in &events {
                        state.emit(event);
                    }
                }
                Receipt {
                    hash,
                    status,
                    events,
                }
            }
        };
        state.receipts.insert(hash, (script, receipt));
        Ok(hash)
    }

    async fn wait_for_receipt(&self, hash: TxHash) -> Result<Receipt> {
        let found = self.state().receipts.get(&hash).cloned();
        let Some((script, receipt)) = found else {
            return Err(eyre!("unknown transaction {hash}"));
        };
        match script {
            ReceiptScript::Hang => futures::future::pending().await,
            ReceiptScript::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(receipt)
            }
            _ => Ok(receipt),
        }
    }
}

impl EventSource for FakeLedger {
    async fn subscribe(&self, filter: EventFilter) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.subscribe_calls += 1;
        state.subscribers.push((filter, tx));
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }
}
