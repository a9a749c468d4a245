//! Per-item state table shared by the worker pool and the progress renderer.
//!
//! The table is the only mutable resource touched by more than one task. Every
//! claim and terminal transition happens under one short-held mutex and never
//! across an `.await`, so the renderer can take snapshots without stalling
//! workers.

use crate::packages::result::{ItemFailure, RunResult};
use crate::runtime::progress::ProgressView;
use anyhow::{bail, Error as AnyError, Result};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lifecycle of a single item. `Pending -> Running -> (Succeeded | Failed)`, each step once.
#[derive(Debug)]
pub enum ItemState {
    Pending,
    Running,
    Succeeded,
    Failed(AnyError),
}

impl ItemState {
    pub fn status(&self) -> ItemStatus {
        match self {
            ItemState::Pending => ItemStatus::Pending,
            ItemState::Running => ItemStatus::Running,
            ItemState::Succeeded => ItemStatus::Succeeded,
            ItemState::Failed(_) => ItemStatus::Failed,
        }
    }
}

/// Payload-free view of [`ItemState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Succeeded | ItemStatus::Failed)
    }
}

/// An item handed to exactly one worker by [`PackageStates::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub index: usize,
    pub item: String,
}

#[derive(Debug)]
struct Slot {
    item: String,
    state: ItemState,
    worker: Option<usize>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    pending: usize,
    running: usize,
    succeeded: usize,
    failed: usize,
}

#[derive(Debug)]
struct StateTable {
    slots: Vec<Slot>,
    next_pending: usize,
    counts: Counts,
}

#[derive(Debug)]
pub struct PackageStates {
    total: usize,
    table: Mutex<StateTable>,
}

impl PackageStates {
    /// Builds the table in submission order. Duplicate identifiers are rejected: collapsing
    /// them is the caller's job.
    pub fn new(items: Vec<String>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(items.len());
        for item in &items {
            if !seen.insert(item.as_str()) {
                bail!("duplicate package identifier {item}");
            }
        }

        let total = items.len();
        let slots = items
            .into_iter()
            .map(|item| Slot {
                item,
                state: ItemState::Pending,
                worker: None,
            })
            .collect();

        Ok(Self {
            total,
            table: Mutex::new(StateTable {
                slots,
                next_pending: 0,
                counts: Counts {
                    pending: total,
                    ..Counts::default()
                },
            }),
        })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Atomically moves the next pending item to `Running` on behalf of `worker`.
    pub fn claim(&self, worker: usize) -> Option<Claim> {
        let mut table = self.lock();
        let index = table.next_pending;
        if index >= table.slots.len() {
            return None;
        }

        table.next_pending += 1;
        table.counts.pending -= 1;
        table.counts.running += 1;
        let slot = &mut table.slots[index];
        debug_assert!(matches!(slot.state, ItemState::Pending));
        slot.state = ItemState::Running;
        slot.worker = Some(worker);

        Some(Claim {
            index,
            item: slot.item.clone(),
        })
    }

    pub fn succeed(&self, index: usize) -> Result<()> {
        self.finish(index, Ok(()))
    }

    pub fn fail(&self, index: usize, error: AnyError) -> Result<()> {
        self.finish(index, Err(error))
    }

    /// Records the terminal state of a running item. A second transition is refused and the
    /// first outcome is kept.
    pub fn finish(&self, index: usize, outcome: Result<()>) -> Result<()> {
        let mut table = self.lock();
        let Some(slot) = table.slots.get_mut(index) else {
            bail!("package index {index} is out of range");
        };

        match slot.state {
            ItemState::Running => {}
            ItemState::Pending => bail!("package {} was never claimed", slot.item),
            ItemState::Succeeded | ItemState::Failed(_) => {
                bail!("package {} already reached a terminal state", slot.item)
            }
        }

        let succeeded = outcome.is_ok();
        slot.state = match outcome {
            Ok(()) => ItemState::Succeeded,
            Err(err) => ItemState::Failed(err),
        };

        table.counts.running -= 1;
        if succeeded {
            table.counts.succeeded += 1;
        } else {
            table.counts.failed += 1;
        }
        Ok(())
    }

    pub fn status(&self, item: &str) -> Option<ItemStatus> {
        let table = self.lock();
        table
            .slots
            .iter()
            .find(|slot| slot.item == item)
            .map(|slot| slot.state.status())
    }

    /// Worker that claimed `item`, if any.
    pub fn claimed_by(&self, item: &str) -> Option<usize> {
        let table = self.lock();
        table
            .slots
            .iter()
            .find(|slot| slot.item == item)
            .and_then(|slot| slot.worker)
    }

    /// Consistent projection of the table for display. Counts always add up to the total.
    pub fn snapshot(&self) -> ProgressView {
        let table = self.lock();
        let in_flight = table
            .slots
            .iter()
            .filter(|slot| matches!(slot.state, ItemState::Running))
            .map(|slot| slot.item.clone())
            .collect();

        ProgressView {
            total: self.total,
            pending: table.counts.pending,
            running: table.counts.running,
            succeeded: table.counts.succeeded,
            failed: table.counts.failed,
            in_flight,
        }
    }

    /// Moves the recorded outcomes into a [`RunResult`]. Must only be called once every worker
    /// has exited; the table is left empty afterwards.
    pub fn drain_result(&self, cancelled: bool, elapsed: Duration) -> RunResult {
        let mut table = self.lock();
        let counts = table.counts;
        debug_assert_eq!(counts.running, 0, "drained while items were still running");

        let failures = std::mem::take(&mut table.slots)
            .into_iter()
            .filter_map(|slot| match slot.state {
                ItemState::Failed(error) => Some(ItemFailure {
                    item: slot.item,
                    error,
                }),
                _ => None,
            })
            .collect();
        table.next_pending = 0;
        table.counts = Counts::default();

        RunResult {
            total: self.total,
            succeeded: counts.succeeded,
            failed: counts.failed,
            pending: counts.pending,
            cancelled,
            elapsed,
            failures,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
