//! One-shot latches signalled by the fan-out writer.
//!
//! Each write hands back a [`LatchPair`]: `dispatched` fires when the row's
//! batch is issued to the store and `completed` when the store confirms it.
//! A latch never returns to pending once it has fired or failed.

use tokio::sync::watch;

use crate::error::{IngestionError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum LatchState {
    Pending,
    Released,
    Failed(String),
}

/// Signalling side of a latch.
#[derive(Debug)]
pub struct LatchTrigger {
    tx: watch::Sender<LatchState>,
}

impl LatchTrigger {
    pub fn release(&self) {
        self.settle(LatchState::Released);
    }

    pub fn fail(&self, message: &str) {
        self.settle(LatchState::Failed(message.to_string()));
    }

    fn settle(&self, outcome: LatchState) {
        self.tx.send_if_modified(|state| {
            if *state == LatchState::Pending {
                *state = outcome;
                true
            } else {
                false
            }
        });
    }
}

/// Waiting side of a latch. Clones observe the same latch.
#[derive(Debug, Clone)]
pub struct Latch {
    rx: watch::Receiver<LatchState>,
}

impl Latch {
    pub fn is_released(&self) -> bool {
        *self.rx.borrow() == LatchState::Released
    }

    /// Released or failed.
    pub fn is_settled(&self) -> bool {
        *self.rx.borrow() != LatchState::Pending
    }

    /// Wait until the latch fires. A failed latch, or one whose trigger was
    /// dropped while pending, is an error.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        let state = rx
            .wait_for(|state| *state != LatchState::Pending)
            .await
            .map_err(|_| IngestionError::Latch("writer dropped before signalling".to_string()))?;

        match &*state {
            LatchState::Failed(message) => Err(IngestionError::Latch(message.clone())),
            _ => Ok(()),
        }
    }
}

/// Create a pending latch.
pub fn latch() -> (LatchTrigger, Latch) {
    let (tx, rx) = watch::channel(LatchState::Pending);
    (LatchTrigger { tx }, Latch { rx })
}

/// The pair of latches for one event write.
#[derive(Debug, Clone)]
pub struct LatchPair {
    pub dispatched: Latch,
    pub completed: Latch,
}

/// Triggers matching a [`LatchPair`], held by the writer.
#[derive(Debug)]
pub struct LatchPairTrigger {
    pub dispatched: LatchTrigger,
    pub completed: LatchTrigger,
}

impl LatchPairTrigger {
    /// Fail both halves; a pair that was already dispatched only fails
    /// completion.
    pub fn fail(&self, message: &str) {
        self.dispatched.fail(message);
        self.completed.fail(message);
    }
}

pub fn latch_pair() -> (LatchPairTrigger, LatchPair) {
    let (dispatched_tx, dispatched) = latch();
    let (completed_tx, completed) = latch();
    (
        LatchPairTrigger {
            dispatched: dispatched_tx,
            completed: completed_tx,
        },
        LatchPair {
            dispatched,
            completed,
        },
    )
}

/// Gather barrier: wait for every completion latch, failing on the first
/// failed write.
pub async fn await_completed(pairs: &[LatchPair]) -> Result<()> {
    for pair in pairs {
        pair.completed.wait().await?;
    }
    Ok(())
}
