use crate::{
    errors::ClassifiedError,
    types::{
        Address,
        Phase,
        TokenAllowance,
    },
};
use tokio::sync::broadcast;
use tracing::error;

const NOTICE_CAPACITY: usize = 64;

/// Which part of the orchestrator raised a notice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    Approval,
    Executor,
    Events,
    Polling,
    Lifecycle,
    Recovery,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    PhaseChanged {
        identity: Address,
        from: Phase,
        to: Phase,
    },
    Error {
        component: Component,
        error: ClassifiedError,
    },
    StateUnknown {
        identity: Address,
        attempts: u32,
    },
    StuckDetected {
        identity: Address,
        phase: Phase,
    },
    AllowanceObserved(TokenAllowance),
}

/// Single fan-out channel every component reports through.
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn notify(&self, notice: Notice) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.tx.send(notice);
    }

    pub fn error(&self, component: Component, error: ClassifiedError) {
        error!(
            ?component,
            kind = ?error.kind,
            detail = %error.detail,
            "{}",
            error.user_message
        );
        self.notify(Notice::Error { component, error });
    }
}
