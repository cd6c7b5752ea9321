use crate::{
    config::ApprovalPolicy,
    errors::{
        ClassifiedError,
        classify,
    },
    executor::{
        ExecuteError,
        TransactionExecutor,
    },
    ledger::{
        LedgerReader,
        LedgerWriter,
    },
    notifications::{
        Component,
        Notice,
        Notifier,
    },
    types::{
        Address,
        Amount,
        ContractCall,
        LedgerEvent,
        TokenAllowance,
        TxOutcome,
    },
};
use std::sync::{
    Arc,
    Mutex,
    PoisonError,
};
use tokio::{
    sync::Mutex as AsyncMutex,
    time::Instant,
};
use tracing::{
    debug,
    info,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllowanceStatus {
    /// The fresh read already covered the amount; nothing was submitted.
    AlreadySufficient,
    /// An approval was submitted and confirmed.
    Approved,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ApprovalError {
    #[error("could not read allowance: {0}")]
    Read(ClassifiedError),
    #[error("approval failed: {0}")]
    Failed(ClassifiedError),
    #[error("approval was not confirmed in time")]
    TimedOut,
    #[error(transparent)]
    Execute(#[from] ExecuteError),
}

impl ApprovalError {
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            ApprovalError::Read(e) | ApprovalError::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Serializes approvals and always decides from a fresh allowance read.
#[derive(Clone, Debug)]
pub struct ApprovalCoordinator<L> {
    ledger: L,
    executor: TransactionExecutor<L>,
    policy: ApprovalPolicy,
    gate: Arc<AsyncMutex<()>>,
    last_seen: Arc<Mutex<Option<TokenAllowance>>>,
    notifier: Notifier,
}

impl<L> ApprovalCoordinator<L>
where
    L: LedgerReader + LedgerWriter + Clone,
{
    pub fn new(
        ledger: L,
        executor: TransactionExecutor<L>,
        policy: ApprovalPolicy,
        notifier: Notifier,
    ) -> Self {
        Self {
            ledger,
            executor,
            policy,
            gate: Arc::default(),
            last_seen: Arc::default(),
            notifier,
        }
    }

    /// Reads the allowance from the ledger. The result is recorded for display only.
    pub async fn fresh_allowance(
        &self,
        owner: Address,
        spender: Address,
    ) -> Result<TokenAllowance, ClassifiedError> {
        let amount = self.ledger.allowance(owner, spender).await.map_err(|e| {
            let error = classify(&e);
            self.notifier.error(Component::Approval, error.clone());
            error
        })?;
        let allowance = TokenAllowance {
            owner,
            spender,
            amount,
            last_checked_at: Instant::now(),
        };
        self.observe(allowance.clone());
        Ok(allowance)
    }

    /// Makes sure `spender` may move at least `amount` of `owner`'s tokens.
    /// Concurrent callers queue behind the first; each re-reads before deciding,
    /// so an approval confirmed by one caller is never submitted again.
    pub async fn ensure_allowance(
        &self,
        owner: Address,
        spender: Address,
        amount: Amount,
    ) -> Result<AllowanceStatus, ApprovalError> {
        let _gate = self.gate.lock().await;

        let current = self
            .fresh_allowance(owner, spender)
            .await
            .map_err(ApprovalError::Read)?;
        if current.amount >= amount {
            debug!(%owner, %spender, allowance = current.amount, amount, "allowance sufficient");
            return Ok(AllowanceStatus::AlreadySufficient);
        }

        let approve = self.policy.approval_amount(amount);
        info!(%owner, %spender, current = current.amount, approve, "requesting approval");
        let call = ContractCall::Approve {
            spender,
            amount: approve,
        };
        let record = self
            .executor
            .execute(owner, call, self.executor.default_options(0))
            .await?;
        match record.outcome {
            TxOutcome::Confirmed => {
                self.observe(TokenAllowance {
                    owner,
                    spender,
                    amount: approve,
                    last_checked_at: Instant::now(),
                });
                Ok(AllowanceStatus::Approved)
            }
            TxOutcome::Failed(error) => Err(ApprovalError::Failed(error)),
            TxOutcome::TimedOut | TxOutcome::Pending => Err(ApprovalError::TimedOut),
        }
    }

    /// Folds an `Approval` event into the last-seen allowance.
    pub fn observe_event(&self, event: &LedgerEvent) {
        if let LedgerEvent::Approval {
            owner,
            spender,
            amount,
        } = event
        {
            self.observe(TokenAllowance {
                owner: *owner,
                spender: *spender,
                amount: *amount,
                last_checked_at: Instant::now(),
            });
        }
    }

    pub fn last_seen(&self) -> Option<TokenAllowance> {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records an allowance seen outside of a decision, e.g. by the poller.
    pub fn observe(&self, allowance: TokenAllowance) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(allowance.clone());
        self.notifier.notify(Notice::AllowanceObserved(allowance));
    }
}
