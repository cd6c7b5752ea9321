use crate::types::{
    Amount,
    TransactionKind,
};
use color_eyre::eyre::Report;
use std::{
    fmt,
    time::Duration,
};

const MAX_REASON_LEN: usize = 120;

/// Closed taxonomy every failure is mapped into before it reaches the session or the UI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UserRejected,
    NetworkUnavailable,
    WrongNetwork,
    InsufficientBalance,
    InsufficientAllowance,
    ContractReverted,
    Timeout,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::UserRejected => "user rejected",
            ErrorKind::NetworkUnavailable => "network unavailable",
            ErrorKind::WrongNetwork => "wrong network",
            ErrorKind::InsufficientBalance => "insufficient balance",
            ErrorKind::InsufficientAllowance => "insufficient allowance",
            ErrorKind::ContractReverted => "contract reverted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    /// Safe to show to the player. Never contains a raw error chain.
    pub user_message: String,
    /// Full error text for logs.
    pub detail: String,
}

impl ClassifiedError {
    pub fn new(
        kind: ErrorKind,
        user_message: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            user_message: user_message.into(),
            detail: detail.into(),
        }
    }

    pub fn timeout(kind: TransactionKind, after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!(
                "The {kind} transaction is taking longer than expected. It may still confirm."
            ),
            format!("{kind} confirmation not observed within {after:?}"),
        )
    }

    pub fn wrong_network(expected: u64, actual: u64) -> Self {
        classify_fault(&LedgerFault::ChainMismatch { expected, actual })
    }

    pub fn insufficient_balance(needed: Amount, available: Amount) -> Self {
        classify_fault(&LedgerFault::InsufficientBalance { needed, available })
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.user_message, self.kind)
    }
}

impl std::error::Error for ClassifiedError {}

/// Structured failures a ledger adapter can raise. Anything else is classified by message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerFault {
    #[error("user rejected the request")]
    UserRejected,
    #[error("ledger unreachable: {0}")]
    Network(String),
    #[error("connected to chain {actual}, expected {expected}")]
    ChainMismatch { expected: u64, actual: u64 },
    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: Amount, available: Amount },
    #[error("insufficient allowance: need {needed}, have {available}")]
    InsufficientAllowance { needed: Amount, available: Amount },
    #[error("execution reverted{}", .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Reverted { reason: Option<String> },
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
}

/// Maps a raw error from the ledger client into the taxonomy.
pub fn classify(error: &Report) -> ClassifiedError {
    if let Some(fault) = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<LedgerFault>())
    {
        return with_detail(classify_fault(fault), error);
    }
    if let Some(classified) = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<ClassifiedError>())
    {
        return classified.clone();
    }
    if let Some(http) = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<reqwest::Error>())
        && (http.is_connect() || http.is_timeout() || http.is_request())
    {
        return with_detail(
            classify_fault(&LedgerFault::Network(http.to_string())),
            error,
        );
    }
    classify_message(&format!("{error:#}"))
}

pub fn classify_fault(fault: &LedgerFault) -> ClassifiedError {
    let detail = fault.to_string();
    match fault {
        LedgerFault::UserRejected => ClassifiedError::new(
            ErrorKind::UserRejected,
            "You declined the request in your wallet.",
            detail,
        ),
        LedgerFault::Network(_) => ClassifiedError::new(
            ErrorKind::NetworkUnavailable,
            "Unable to reach the network. Check your connection.",
            detail,
        ),
        LedgerFault::ChainMismatch { expected, .. } => ClassifiedError::new(
            ErrorKind::WrongNetwork,
            format!("Wrong network. Switch your wallet to chain {expected}."),
            detail,
        ),
        LedgerFault::InsufficientBalance { .. } => ClassifiedError::new(
            ErrorKind::InsufficientBalance,
            "Your token balance is too low for this wager.",
            detail,
        ),
        LedgerFault::InsufficientAllowance { .. } => ClassifiedError::new(
            ErrorKind::InsufficientAllowance,
            "The game is not approved to spend enough of your tokens.",
            detail,
        ),
        LedgerFault::Reverted { reason } => {
            classify_revert(reason.as_deref().map(str::trim), detail)
        }
        LedgerFault::Rpc { code, message } => match code {
            4001 => ClassifiedError::new(
                ErrorKind::UserRejected,
                "You declined the request in your wallet.",
                detail,
            ),
            4901 | 4902 => ClassifiedError::new(
                ErrorKind::WrongNetwork,
                "Wrong network. Switch your wallet to the supported chain.",
                detail,
            ),
            _ => {
                let mut classified = classify_message(message);
                classified.detail = detail;
                classified
            }
        },
    }
}

fn classify_revert(reason: Option<&str>, detail: String) -> ClassifiedError {
    let Some(reason) = reason.filter(|r| !r.is_empty()) else {
        return ClassifiedError::new(
            ErrorKind::ContractReverted,
            "The game contract rejected the transaction.",
            detail,
        );
    };
    let lower = reason.to_lowercase();
    if lower.contains("insufficient allowance") || lower.contains("exceeds allowance") {
        return ClassifiedError::new(
            ErrorKind::InsufficientAllowance,
            "The game is not approved to spend enough of your tokens.",
            detail,
        );
    }
    if lower.contains("insufficient balance") || lower.contains("exceeds balance") {
        return ClassifiedError::new(
            ErrorKind::InsufficientBalance,
            "Your token balance is too low for this wager.",
            detail,
        );
    }
    ClassifiedError::new(
        ErrorKind::ContractReverted,
        format!(
            "The game contract rejected the transaction: {}",
            sanitize_reason(reason)
        ),
        detail,
    )
}

/// Fallback for errors that carry no structure, matched on their rendered text.
pub fn classify_message(message: &str) -> ClassifiedError {
    let lower = message.to_lowercase();

    if lower.contains("user rejected")
        || lower.contains("user denied")
        || lower.contains("rejected by user")
    {
        return classify_fault(&LedgerFault::UserRejected)
            .with_detail_text(message);
    }
    if lower.contains("wrong network")
        || lower.contains("chain mismatch")
        || lower.contains("unsupported chain")
    {
        return ClassifiedError::new(
            ErrorKind::WrongNetwork,
            "Wrong network. Switch your wallet to the supported chain.",
            message,
        );
    }
    if let Some(idx) = lower.find("execution reverted") {
        let reason = message[idx + "execution reverted".len()..]
            .trim_start_matches(':')
            .trim();
        return classify_revert(Some(reason), message.to_string());
    }
    if lower.contains("insufficient allowance") {
        return classify_revert(Some("insufficient allowance"), message.to_string());
    }
    if lower.contains("insufficient funds") || lower.contains("insufficient balance") {
        return classify_revert(Some("insufficient balance"), message.to_string());
    }
    if lower.contains("connection")
        || lower.contains("network")
        || lower.contains("timed out")
        || lower.contains("unreachable")
        || lower.contains("503")
    {
        return classify_fault(&LedgerFault::Network(message.to_string()));
    }
    ClassifiedError::new(
        ErrorKind::Unknown,
        "Something went wrong. Please try again.",
        message,
    )
}

impl ClassifiedError {
    fn with_detail_text(mut self, detail: &str) -> Self {
        self.detail = detail.to_string();
        self
    }
}

fn with_detail(mut classified: ClassifiedError, error: &Report) -> ClassifiedError {
    classified.detail = format!("{error:#}");
    classified
}

fn sanitize_reason(reason: &str) -> String {
    let mut cleaned: String = reason
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_REASON_LEN)
        .collect();
    if reason.chars().count() > MAX_REASON_LEN {
        cleaned.push_str("...");
    }
    cleaned
}
