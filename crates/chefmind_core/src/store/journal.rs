//! Snapshot-based transaction journal for engines without native
//! transactions.
//!
//! # Invariants
//! - The first frame is the state captured at `Begin`; later frames belong
//!   to savepoints, newest last.
//! - Rolling back restores a frame's snapshot and discards it with every
//!   newer frame.
//! - `is_open` never takes the frame lock, so engines may ask it while
//!   holding their own data locks.

use super::{StoreError, StoreResult};
use crate::transaction::TxStatement;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

struct Frame<S> {
    savepoint: Option<String>,
    snapshot: S,
}

pub(crate) struct SnapshotJournal<S> {
    backend: &'static str,
    frames: Mutex<Vec<Frame<S>>>,
    open: AtomicBool,
}

impl<S> SnapshotJournal<S> {
    pub(crate) fn new(backend: &'static str) -> Self {
        Self {
            backend,
            frames: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Applies one control statement.
    ///
    /// `capture` is called when a frame is opened, `restore` when state must
    /// be rewound to a frame.
    pub(crate) fn apply(
        &self,
        statement: &TxStatement,
        capture: impl FnOnce() -> StoreResult<S>,
        restore: impl FnOnce(S) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let mut frames = self.frames.lock();
        let outcome = Self::step(self.backend, &mut frames, statement, capture, restore);
        self.open.store(!frames.is_empty(), Ordering::Release);
        outcome
    }

    fn step(
        backend: &'static str,
        frames: &mut Vec<Frame<S>>,
        statement: &TxStatement,
        capture: impl FnOnce() -> StoreResult<S>,
        restore: impl FnOnce(S) -> StoreResult<()>,
    ) -> StoreResult<()> {
        match statement {
            TxStatement::Begin(_) => {
                if !frames.is_empty() {
                    return Err(StoreError::backend(
                        backend,
                        "cannot start a transaction within a transaction",
                    ));
                }
                frames.push(Frame {
                    savepoint: None,
                    snapshot: capture()?,
                });
                Ok(())
            }
            TxStatement::Commit => {
                if frames.is_empty() {
                    return Err(StoreError::NoActiveTransaction);
                }
                frames.clear();
                Ok(())
            }
            TxStatement::Rollback => {
                let mut drained = frames.drain(..);
                let base = drained.next().ok_or(StoreError::NoActiveTransaction)?;
                drop(drained);
                restore(base.snapshot)
            }
            TxStatement::Savepoint(name) => {
                if frames.is_empty() {
                    return Err(StoreError::NoActiveTransaction);
                }
                frames.push(Frame {
                    savepoint: Some(name.clone()),
                    snapshot: capture()?,
                });
                Ok(())
            }
            TxStatement::ReleaseSavepoint(name) => {
                let index = find_savepoint(frames, name)?;
                frames.truncate(index);
                Ok(())
            }
            TxStatement::RollbackToSavepoint(name) => {
                let index = find_savepoint(frames, name)?;
                frames.truncate(index + 1);
                match frames.pop() {
                    Some(frame) => restore(frame.snapshot),
                    None => Err(StoreError::UnknownSavepoint(name.clone())),
                }
            }
        }
    }
}

fn find_savepoint<S>(frames: &[Frame<S>], name: &str) -> StoreResult<usize> {
    frames
        .iter()
        .rposition(|frame| frame.savepoint.as_deref() == Some(name))
        .ok_or_else(|| StoreError::UnknownSavepoint(name.to_string()))
}
