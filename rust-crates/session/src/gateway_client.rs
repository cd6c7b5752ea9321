//! Ledger client that talks to an HTTP gateway in front of the game and token
//! contracts. Amounts travel as decimal strings; addresses and hashes as 0x hex.

use crate::{
    config::ContractAddresses,
    errors::LedgerFault,
    ledger::{
        EventFilter,
        EventSource,
        EventStream,
        LedgerReader,
        LedgerWriter,
        TxParams,
    },
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
        TxHash,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use color_eyre::eyre::{
    Report,
    Result,
    WrapErr,
    eyre,
};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{
    Deserialize,
    Serialize,
    de::DeserializeOwned,
};
use std::{
    collections::VecDeque,
    fmt,
    str::FromStr,
    time::Duration,
};
use tracing::debug;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const REVERT_CODE: i64 = -32000;

#[derive(Clone)]
pub struct GatewayClient {
    base_url: String,
    contracts: ContractAddresses,
    http: reqwest::Client,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>, contracts: ContractAddresses) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .build()
            .wrap_err("failed to build HTTP client for ledger gateway")?;
        Ok(Self {
            base_url,
            contracts,
            http,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let res = self
            .http
            .get(url)
            .send()
            .await
            .wrap_err("ledger gateway request failed")?;
        read_json(res, what).await
    }

    async fn get_optional<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let res = self
            .http
            .get(url)
            .send()
            .await
            .wrap_err("ledger gateway request failed")?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        read_json(res, what).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        what: &str,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let res = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .wrap_err("ledger gateway request failed")?;
        read_json(res, what).await
    }

    fn transaction(&self, from: Address, call: &ContractCall, value: Amount) -> TransactionDto {
        let to = match call {
            ContractCall::Approve { .. } => self.contracts.token,
            _ => self.contracts.game,
        };
        TransactionDto {
            from,
            to,
            call: call.into(),
            value: value.to_string(),
            gas_limit: None,
        }
    }

    async fn fetch_events(&self, player: Address, cursor: Option<u64>) -> Result<EventPageDto> {
        let path = match cursor {
            Some(cursor) => format!("/events/{player}?after={cursor}"),
            None => format!("/events/{player}"),
        };
        self.get(&path, "events").await
    }
}

async fn read_json<T: DeserializeOwned>(res: reqwest::Response, what: &str) -> Result<T> {
    let status = res.status();
    let bytes = res
        .bytes()
        .await
        .wrap_err("failed to read ledger gateway response body")?;
    if !status.is_success() {
        return Err(gateway_error(status, &bytes, what));
    }
    serde_json::from_slice(&bytes).wrap_err_with(|| format!("invalid gateway {what} payload"))
}

fn gateway_error(status: StatusCode, bytes: &[u8], what: &str) -> Report {
    if let Ok(body) = serde_json::from_slice::<ErrorBodyDto>(bytes) {
        return Report::new(LedgerFault::from(body))
            .wrap_err(format!("gateway rejected {what} request"));
    }
    if matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    ) {
        return Report::new(LedgerFault::Network(format!(
            "gateway responded with {status}"
        )));
    }
    let body = String::from_utf8_lossy(bytes);
    eyre!("gateway responded with {status} when fetching {what}: {body}")
}

fn parse_amount(raw: &str) -> Result<Amount> {
    raw.trim()
        .parse::<Amount>()
        .wrap_err_with(|| format!("amount '{raw}' is not a decimal integer"))
}

impl LedgerReader for GatewayClient {
    async fn chain_id(&self) -> Result<u64> {
        let dto: ChainDto = self.get("/chain", "chain").await?;
        Ok(dto.chain_id)
    }

    async fn current_game(&self, player: Address) -> Result<Option<GameRecord>> {
        let dto: Option<GameDto> = self
            .get_optional(&format!("/games/{player}/current"), "current game")
            .await?;
        dto.map(GameRecord::try_from).transpose()
    }

    async fn allowance(&self, owner: Address, spender: Address) -> Result<Amount> {
        let path = format!("/tokens/{}/allowance/{owner}/{spender}", self.contracts.token);
        let dto: AmountDto = self.get(&path, "allowance").await?;
        parse_amount(&dto.amount)
    }

    async fn token_balance(&self, owner: Address) -> Result<Amount> {
        let path = format!("/tokens/{}/balance/{owner}", self.contracts.token);
        let dto: AmountDto = self.get(&path, "balance").await?;
        parse_amount(&dto.amount)
    }

    async fn player_stats(&self, player: Address) -> Result<PlayerStats> {
        let dto: StatsDto = self
            .get(&format!("/players/{player}/stats"), "player stats")
            .await?;
        dto.try_into()
    }

    async fn recent_history(&self, player: Address, limit: usize) -> Result<Vec<HistoryEntry>> {
        let dtos: Vec<HistoryDto> = self
            .get(&format!("/players/{player}/history?limit={limit}"), "history")
            .await?;
        dtos.into_iter().map(HistoryEntry::try_from).collect()
    }

    async fn randomness_request(&self, request_id: RequestId) -> Result<Option<RandomnessRequest>> {
        let dto: Option<RandomnessDto> = self
            .get_optional(&format!("/randomness/{}", request_id.0), "randomness request")
            .await?;
        Ok(dto.map(|dto| RandomnessRequest {
            request_id: RequestId(dto.request_id),
            active: dto.active,
            fulfilled: dto.fulfilled,
        }))
    }

    async fn can_start_game(&self, player: Address) -> Result<bool> {
        let dto: CanStartDto = self
            .get(&format!("/games/{player}/can-start"), "can-start")
            .await?;
        Ok(dto.can_start)
    }
}

impl LedgerWriter for GatewayClient {
    async fn estimate_gas(&self, from: Address, call: &ContractCall, value: Amount) -> Result<u64> {
        let body = self.transaction(from, call, value);
        let dto: GasDto = self
            .post("/transactions/estimate", &body, "gas estimate")
            .await?;
        Ok(dto.gas)
    }

    async fn submit(&self, from: Address, call: &ContractCall, params: TxParams) -> Result<TxHash> {
        let mut body = self.transaction(from, call, params.value);
        body.gas_limit = Some(params.gas_limit);
        let dto: SubmittedDto = self.post("/transactions", &body, "submission").await?;
        TxHash::from_str(&dto.hash)
    }

    async fn wait_for_receipt(&self, hash: TxHash) -> Result<Receipt> {
        let path = format!("/transactions/{hash}/receipt");
        loop {
            let dto: Option<ReceiptDto> = self.get_optional(&path, "receipt").await?;
            match dto {
                Some(dto) => return dto.into_receipt(hash),
                None => {
                    debug!(%hash, "receipt not available yet");
                    tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
                }
            }
        }
    }
}

impl EventSource for GatewayClient {
    /// Long-polls the gateway's event feed. The stream yields an error and
    /// ends its usefulness on the first failed request; callers resubscribe.
    async fn subscribe(&self, filter: EventFilter) -> Result<EventStream> {
        let client = self.clone();
        let state = (client, None::<u64>, VecDeque::<LedgerEvent>::new(), false);
        let stream = futures::stream::unfold(
            state,
            move |(client, mut cursor, mut buffered, failed)| async move {
                if failed {
                    return None;
                }
                loop {
                    if let Some(event) = buffered.pop_front() {
                        return Some((Ok(event), (client, cursor, buffered, false)));
                    }
                    let page = match client.fetch_events(filter.player, cursor).await {
                        Ok(page) => page,
                        Err(e) => return Some((Err(e), (client, cursor, buffered, true))),
                    };
                    cursor = Some(page.cursor);
                    for dto in page.events {
                        match LedgerEvent::try_from(dto) {
                            Ok(event) if filter.matches(&event) => buffered.push_back(event),
                            Ok(_) => {}
                            Err(e) => {
                                return Some((Err(e), (client, cursor, buffered, true)));
                            }
                        }
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

impl fmt::Display for GatewayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_url)
    }
}

impl fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ErrorBodyDto {
    code: i64,
    message: String,
    #[serde(default)]
    reason: Option<String>,
}

impl From<ErrorBodyDto> for LedgerFault {
    fn from(dto: ErrorBodyDto) -> Self {
        match dto.code {
            4001 => LedgerFault::UserRejected,
            REVERT_CODE => LedgerFault::Reverted { reason: dto.reason },
            _ if dto.reason.is_some() => LedgerFault::Reverted { reason: dto.reason },
            code => LedgerFault::Rpc {
                code,
                message: dto.message,
            },
        }
    }
}

#[derive(Deserialize)]
struct ChainDto {
    chain_id: u64,
}

#[derive(Deserialize)]
struct AmountDto {
    amount: String,
}

#[derive(Deserialize)]
struct CanStartDto {
    can_start: bool,
}

#[derive(Deserialize)]
struct GasDto {
    gas: u64,
}

#[derive(Deserialize)]
struct SubmittedDto {
    hash: String,
}

#[derive(Deserialize)]
struct RandomnessDto {
    request_id: u64,
    active: bool,
    fulfilled: bool,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum GameStatusDto {
    Pending,
    Won,
    Lost,
    Cancelled,
}

#[derive(Deserialize)]
struct GameDto {
    player: Address,
    request_id: u64,
    chosen_value: u32,
    wager_amount: String,
    rolled_value: Option<u32>,
    payout: Option<String>,
    status: GameStatusDto,
    is_active: bool,
}

#[derive(Deserialize)]
struct StatsDto {
    games_played: u64,
    games_won: u64,
    total_wagered: String,
    total_paid_out: String,
}

#[derive(Deserialize)]
struct HistoryDto {
    request_id: u64,
    chosen_value: u32,
    rolled_value: Option<u32>,
    wager_amount: String,
    payout: String,
    status: GameStatusDto,
    settled_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReceiptStatusDto {
    Success,
    Reverted,
}

#[derive(Deserialize)]
struct ReceiptDto {
    status: ReceiptStatusDto,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    events: Vec<EventDto>,
}

#[derive(Deserialize)]
struct EventPageDto {
    cursor: u64,
    events: Vec<EventDto>,
}

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum EventDto {
    SessionStarted {
        player: Address,
        request_id: u64,
        chosen_value: u32,
        amount: String,
    },
    SessionCompleted {
        player: Address,
        request_id: u64,
        chosen_value: u32,
        rolled_value: u32,
        amount: String,
        payout: String,
        status: GameStatusDto,
    },
    SessionCancelled {
        player: Address,
        request_id: u64,
        reason: String,
    },
    RandomnessFulfilled {
        request_id: u64,
    },
    Approval {
        owner: Address,
        spender: Address,
        amount: String,
    },
}

#[derive(Serialize)]
struct TransactionDto {
    from: Address,
    to: Address,
    call: CallDto,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    gas_limit: Option<u64>,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(tag = "method", rename_all = "snake_case")]
enum CallDto {
    Approve { spender: Address, amount: String },
    PlaceBet { chosen_value: u32, wager: String },
    Resolve,
    RecoverStuckSession { player: Address },
}

impl From<&ContractCall> for CallDto {
    fn from(call: &ContractCall) -> Self {
        match call {
            ContractCall::Approve { spender, amount } => CallDto::Approve {
                spender: *spender,
                amount: amount.to_string(),
            },
            ContractCall::PlaceBet {
                chosen_value,
                wager,
            } => CallDto::PlaceBet {
                chosen_value: *chosen_value,
                wager: wager.to_string(),
            },
            ContractCall::Resolve => CallDto::Resolve,
            ContractCall::RecoverStuckSession { player } => {
                CallDto::RecoverStuckSession { player: *player }
            }
        }
    }
}

impl From<GameStatusDto> for GameStatus {
    fn from(value: GameStatusDto) -> Self {
        match value {
            GameStatusDto::Pending => GameStatus::Pending,
            GameStatusDto::Won => GameStatus::Won,
            GameStatusDto::Lost => GameStatus::Lost,
            GameStatusDto::Cancelled => GameStatus::Cancelled,
        }
    }
}

impl TryFrom<GameDto> for GameRecord {
    type Error = Report;

    fn try_from(dto: GameDto) -> Result<Self> {
        Ok(GameRecord {
            player: dto.player,
            request_id: RequestId(dto.request_id),
            chosen_value: dto.chosen_value,
            wager_amount: parse_amount(&dto.wager_amount)?,
            rolled_value: dto.rolled_value,
            payout: dto.payout.as_deref().map(parse_amount).transpose()?,
            status: dto.status.into(),
            is_active: dto.is_active,
        })
    }
}

impl TryFrom<StatsDto> for PlayerStats {
    type Error = Report;

    fn try_from(dto: StatsDto) -> Result<Self> {
        Ok(PlayerStats {
            games_played: dto.games_played,
            games_won: dto.games_won,
            total_wagered: parse_amount(&dto.total_wagered)?,
            total_paid_out: parse_amount(&dto.total_paid_out)?,
        })
    }
}

impl TryFrom<HistoryDto> for HistoryEntry {
    type Error = Report;

    fn try_from(dto: HistoryDto) -> Result<Self> {
        Ok(HistoryEntry {
            request_id: RequestId(dto.request_id),
            chosen_value: dto.chosen_value,
            rolled_value: dto.rolled_value,
            wager_amount: parse_amount(&dto.wager_amount)?,
            payout: parse_amount(&dto.payout)?,
            status: dto.status.into(),
            settled_at: dto.settled_at,
        })
    }
}

impl TryFrom<EventDto> for LedgerEvent {
    type Error = Report;

    fn try_from(dto: EventDto) -> Result<Self> {
        Ok(match dto {
            EventDto::SessionStarted {
                player,
                request_id,
                chosen_value,
                amount,
            } => LedgerEvent::SessionStarted {
                player,
                request_id: RequestId(request_id),
                chosen_value,
                amount: parse_amount(&amount)?,
            },
            EventDto::SessionCompleted {
                player,
                request_id,
                chosen_value,
                rolled_value,
                amount,
                payout,
                status,
            } => LedgerEvent::SessionCompleted {
                player,
                request_id: RequestId(request_id),
                chosen_value,
                rolled_value,
                amount: parse_amount(&amount)?,
                payout: parse_amount(&payout)?,
                status: status.into(),
            },
            EventDto::SessionCancelled {
                player,
                request_id,
                reason,
            } => LedgerEvent::SessionCancelled {
                player,
                request_id: RequestId(request_id),
                reason,
            },
            EventDto::RandomnessFulfilled { request_id } => LedgerEvent::RandomnessFulfilled {
                request_id: RequestId(request_id),
            },
            EventDto::Approval {
                owner,
                spender,
                amount,
            } => LedgerEvent::Approval {
                owner,
                spender,
                amount: parse_amount(&amount)?,
            },
        })
    }
}

impl ReceiptDto {
    fn into_receipt(self, hash: TxHash) -> Result<Receipt> {
        let status = match self.status {
            ReceiptStatusDto::Success => ReceiptStatus::Success,
            ReceiptStatusDto::Reverted => ReceiptStatus::Reverted {
                reason: self.reason,
            },
        };
        let events = self
            .events
            .into_iter()
            .map(LedgerEvent::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Receipt {
            hash,
            status,
            events,
        })
    }
}
