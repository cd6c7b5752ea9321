use crate::{
    config::TransactionConfig,
    errors::{
        ClassifiedError,
        classify,
    },
    ledger::{
        LedgerWriter,
        TxParams,
    },
    notifications::{
        Component,
        Notifier,
    },
    types::{
        Address,
        Amount,
        ContractCall,
        ReceiptStatus,
        TransactionKind,
        TransactionRecord,
        TxOutcome,
    },
};
use color_eyre::eyre::Report;
use std::{
    collections::HashSet,
    sync::{
        Arc,
        Mutex,
        PoisonError,
    },
    time::Duration,
};
use tokio::time::{
    self,
    Instant,
};
use tracing::{
    info,
    warn,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub value: Amount,
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ExecuteError {
    #[error("a {kind} transaction is already in flight for {identity}")]
    AlreadyInFlight {
        identity: Address,
        kind: TransactionKind,
    },
}

type InFlight = Arc<Mutex<HashSet<(Address, TransactionKind)>>>;

/// The only component that submits state-changing calls.
#[derive(Clone, Debug)]
pub struct TransactionExecutor<W> {
    writer: W,
    config: TransactionConfig,
    in_flight: InFlight,
    notifier: Notifier,
}

impl<W> TransactionExecutor<W>
where
    W: LedgerWriter + Clone,
{
    pub fn new(writer: W, config: TransactionConfig, notifier: Notifier) -> Self {
        Self {
            writer,
            config,
            in_flight: Arc::default(),
            notifier,
        }
    }

    pub fn default_options(&self, value: Amount) -> ExecuteOptions {
        ExecuteOptions {
            value,
            timeout: self.config.timeout(),
        }
    }

    pub fn is_in_flight(&self, identity: Address, kind: TransactionKind) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(identity, kind))
    }

    pub fn any_in_flight(&self, identity: Address) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(owner, _)| *owner == identity)
    }

    /// Estimates, submits and waits for one call. Never retries: a timeout is
    /// reported as `TimedOut` and the transaction may still land later.
    pub async fn execute(
        &self,
        identity: Address,
        call: ContractCall,
        options: ExecuteOptions,
    ) -> Result<TransactionRecord, ExecuteError> {
        let kind = call.kind();
        let _slot = InFlightSlot::claim(&self.in_flight, identity, kind)?;
        let mut record = TransactionRecord::pending(kind);

        let gas_limit = self.gas_limit(identity, &call, options.value).await;
        let params = TxParams {
            value: options.value,
            gas_limit,
        };
        let hash = match self.writer.submit(identity, &call, params).await {
            Ok(hash) => hash,
            Err(e) => {
                return Ok(self.failed(record, classify(&e)));
            }
        };
        info!(%identity, %kind, %hash, gas_limit, "transaction submitted");
        record.hash = Some(hash);
        record.submitted_at = Instant::now();

        match time::timeout(options.timeout, self.writer.wait_for_receipt(hash)).await {
            Err(_) => Ok(self.timed_out(record, options.timeout, None)),
            Ok(Err(e)) => Ok(self.timed_out(record, options.timeout, Some(e))),
            Ok(Ok(receipt)) => match receipt.status {
                ReceiptStatus::Success => {
                    info!(%identity, %kind, %hash, "transaction confirmed");
                    record.confirmed_at = Some(Instant::now());
                    record.events = receipt.events;
                    record.outcome = TxOutcome::Confirmed;
                    Ok(record)
                }
                ReceiptStatus::Reverted { reason } => {
                    let fault = crate::errors::LedgerFault::Reverted { reason };
                    Ok(self.failed(record, classify(&Report::new(fault))))
                }
            },
        }
    }

    async fn gas_limit(&self, identity: Address, call: &ContractCall, value: Amount) -> u64 {
        match self.writer.estimate_gas(identity, call, value).await {
            Ok(estimate) => {
                estimate.saturating_mul(self.config.gas_multiplier_percent) / 100
            }
            Err(e) => {
                warn!(
                    kind = %call.kind(),
                    fallback = self.config.fallback_gas_limit,
                    "gas estimation failed, using fallback limit: {e:#}"
                );
                self.config.fallback_gas_limit
            }
        }
    }

    fn failed(&self, mut record: TransactionRecord, error: ClassifiedError) -> TransactionRecord {
        self.notifier.error(Component::Executor, error.clone());
        record.outcome = TxOutcome::Failed(error);
        record
    }

    fn timed_out(
        &self,
        mut record: TransactionRecord,
        after: Duration,
        cause: Option<Report>,
    ) -> TransactionRecord {
        if let Some(cause) = cause {
            warn!(kind = %record.kind, "lost track of receipt: {cause:#}");
        }
        self.notifier
            .error(Component::Executor, ClassifiedError::timeout(record.kind, after));
        record.outcome = TxOutcome::TimedOut;
        record
    }
}

/// Holds a `(identity, kind)` slot for the lifetime of one execution.
struct InFlightSlot {
    registry: InFlight,
    key: (Address, TransactionKind),
}

impl InFlightSlot {
    fn claim(
        registry: &InFlight,
        identity: Address,
        kind: TransactionKind,
    ) -> Result<Self, ExecuteError> {
        let key = (identity, kind);
        let inserted = registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        if !inserted {
            return Err(ExecuteError::AlreadyInFlight { identity, kind });
        }
        Ok(Self {
            registry: registry.clone(),
            key,
        })
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
