// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A process group whose members are threads of one OS process.
//!
//! Collectives rendezvous on a mutex/condvar pair. The last member to arrive
//! computes the outcome and bumps the generation counter, which releases
//! everybody else. Mailboxes are unbounded `async-std` channels.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_std::channel::{self, Receiver, Sender, TryRecvError};
use async_std::task;
use bytes::Bytes;

use crate::{Envelope, GroupError, ProcessGroup, ReduceOp};

/// How often a blocked member re-checks whether the group was aborted.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn poisoned<T>(_: PoisonError<T>) -> GroupError {
    GroupError::Aborted("group state poisoned by a panicking member".to_string())
}

/// Poison shared by a world and every group split from it.
#[derive(Default)]
struct AbortState {
    aborted: AtomicBool,
    reason: Mutex<String>,
}

impl AbortState {
    fn abort(&self, reason: &str) {
        if let Ok(mut first_reason) = self.reason.lock() {
            if first_reason.is_empty() {
                *first_reason = reason.to_string();
            }
        }
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), GroupError> {
        if !self.aborted.load(Ordering::SeqCst) {
            return Ok(());
        }
        let reason = self.reason.lock().map_err(poisoned)?.clone();
        Err(GroupError::Aborted(reason))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Kind {
    Barrier,
    Reduce(ReduceOp),
    Split,
}

impl Kind {
    fn name(self) -> &'static str {
        match self {
            Kind::Barrier => "barrier",
            Kind::Reduce(ReduceOp::Sum) => "all_reduce(sum)",
            Kind::Reduce(ReduceOp::Max) => "all_reduce(max)",
            Kind::Reduce(ReduceOp::Min) => "all_reduce(min)",
            Kind::Split => "split",
        }
    }
}

/// New groups produced by a split, keyed by the member's rank in the parent.
type SplitGroups = Arc<Mutex<BTreeMap<usize, LocalGroup>>>;

#[derive(Clone)]
enum Outcome {
    Done,
    Value(u64),
    Split(SplitGroups),
}

struct Rendezvous {
    arrived: usize,
    generation: u64,
    kind: Kind,
    value: u64,

    /// (colour, key, parent rank) of every member that joined a split.
    splits: Vec<(u32, usize, usize)>,
    outcome: Outcome,
}

struct Shared {
    size: usize,
    rendezvous: Mutex<Rendezvous>,
    cond: Condvar,
    mailboxes: Vec<Sender<Envelope>>,
    abort: Arc<AbortState>,
}

/// One member of a thread-backed process group.
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
    inbox: Receiver<Envelope>,
}

fn build_groups(size: usize, abort: Arc<AbortState>) -> Vec<LocalGroup> {
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| channel::unbounded()).unzip();
    let shared = Arc::new(Shared {
        size,
        rendezvous: Mutex::new(Rendezvous {
            arrived: 0,
            generation: 0,
            kind: Kind::Barrier,
            value: 0,
            splits: Vec::new(),
            outcome: Outcome::Done,
        }),
        cond: Condvar::new(),
        mailboxes: senders,
        abort,
    });
    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| LocalGroup {
            rank,
            shared: shared.clone(),
            inbox,
        })
        .collect()
}

/// Creates the members of a new group.
pub struct LocalWorld {
    groups: Vec<LocalGroup>,
}

impl LocalWorld {
    pub fn new(size: usize) -> Result<Self, GroupError> {
        if size == 0 {
            return Err(GroupError::Empty);
        }
        Ok(Self {
            groups: build_groups(size, Arc::new(AbortState::default())),
        })
    }

    /// Hand out the members, ordered by rank, so each can be moved to its
    /// own thread.
    #[must_use]
    pub fn into_groups(self) -> Vec<LocalGroup> {
        self.groups
    }
}

impl LocalGroup {
    fn lock(&self) -> Result<MutexGuard<'_, Rendezvous>, GroupError> {
        self.shared.rendezvous.lock().map_err(poisoned)
    }

    fn collective(
        &self,
        kind: Kind,
        value: u64,
        split: Option<(u32, usize)>,
    ) -> Result<Outcome, GroupError> {
        self.shared.abort.check()?;

        let mut rendezvous = self.lock()?;
        if rendezvous.arrived == 0 {
            rendezvous.kind = kind;
            rendezvous.value = value;
            rendezvous.splits.clear();
        } else if rendezvous.kind != kind {
            let err = GroupError::MismatchedCollective {
                rank: self.rank,
                called: kind.name(),
                pending: rendezvous.kind.name(),
            };
            drop(rendezvous);
            self.abort(&err.to_string());
            return Err(err);
        } else if let Kind::Reduce(op) = kind {
            rendezvous.value = op.apply(rendezvous.value, value);
        }

        if let Some((color, key)) = split {
            rendezvous.splits.push((color, key, self.rank));
        }
        rendezvous.arrived += 1;

        let generation = rendezvous.generation;
        if rendezvous.arrived == self.shared.size {
            rendezvous.outcome = match kind {
                Kind::Barrier => Outcome::Done,
                Kind::Reduce(_) => Outcome::Value(rendezvous.value),
                Kind::Split => Outcome::Split(self.build_splits(&rendezvous.splits)),
            };
            rendezvous.arrived = 0;
            rendezvous.generation += 1;
            self.shared.cond.notify_all();
            return Ok(rendezvous.outcome.clone());
        }

        while rendezvous.generation == generation {
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(rendezvous, POLL_INTERVAL)
                .map_err(poisoned)?;
            rendezvous = guard;
            if rendezvous.generation == generation {
                self.shared.abort.check()?;
            }
        }
        Ok(rendezvous.outcome.clone())
    }

    fn build_splits(&self, splits: &[(u32, usize, usize)]) -> SplitGroups {
        let mut by_color: BTreeMap<u32, Vec<(usize, usize)>> = BTreeMap::new();
        for &(color, key, parent_rank) in splits {
            by_color.entry(color).or_default().push((key, parent_rank));
        }

        let mut groups = BTreeMap::new();
        for members in by_color.values_mut() {
            members.sort_unstable();
            let new_groups = build_groups(members.len(), self.shared.abort.clone());
            for (&(_, parent_rank), group) in members.iter().zip(new_groups) {
                groups.insert(parent_rank, group);
            }
        }
        Arc::new(Mutex::new(groups))
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) -> Result<(), GroupError> {
        self.collective(Kind::Barrier, 0, None)?;
        Ok(())
    }

    fn all_reduce(&self, value: u64, op: ReduceOp) -> Result<u64, GroupError> {
        match self.collective(Kind::Reduce(op), value, None)? {
            Outcome::Value(total) => Ok(total),
            _ => Err(GroupError::Aborted(format!(
                "rank {} got no value from {}",
                self.rank,
                Kind::Reduce(op).name()
            ))),
        }
    }

    fn split(&self, color: u32, key: usize) -> Result<Self, GroupError> {
        match self.collective(Kind::Split, 0, Some((color, key)))? {
            Outcome::Split(groups) => groups
                .lock()
                .map_err(poisoned)?
                .remove(&self.rank)
                .ok_or_else(|| {
                    GroupError::Aborted(format!("rank {} missing from split", self.rank))
                }),
            _ => Err(GroupError::Aborted(format!(
                "rank {} got no group from split",
                self.rank
            ))),
        }
    }

    fn send(&self, dest: usize, payload: Bytes) -> Result<(), GroupError> {
        self.shared.abort.check()?;
        let mailbox = self
            .shared
            .mailboxes
            .get(dest)
            .ok_or(GroupError::NoSuchRank {
                rank: dest,
                size: self.shared.size,
            })?;
        mailbox
            .try_send(Envelope {
                from: self.rank,
                payload,
            })
            .map_err(|_| GroupError::PeerGone(dest))
    }

    fn try_recv(&self) -> Result<Option<Envelope>, GroupError> {
        self.shared.abort.check()?;
        match self.inbox.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => Err(GroupError::PeerGone(self.rank)),
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Envelope, GroupError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.shared.abort.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Err(GroupError::Timeout(timeout));
            }

            let slice = (deadline - now).min(POLL_INTERVAL);
            match task::block_on(async_std::future::timeout(slice, self.inbox.recv())) {
                Ok(Ok(envelope)) => return Ok(envelope),
                Ok(Err(_)) => return Err(GroupError::PeerGone(self.rank)),
                Err(_) => {
                    // Slice elapsed
                }
            }
        }
    }

    fn abort(&self, reason: &str) {
        self.shared.abort.abort(reason);
        self.shared.cond.notify_all();
    }
}
