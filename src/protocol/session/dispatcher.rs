use super::super::{
    error::{Error, Result},
    frame::S7Pdu,
};
use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};
use tokio::sync::{oneshot, OwnedSemaphorePermit};

/// Entry stored for each inflight job.
///
/// Holding an entry implies one concurrency slot is taken; the permit is
/// released when the entry is dropped (reply, timeout, send failure or
/// teardown).
#[derive(Debug)]
struct InflightEntry {
    tx: oneshot::Sender<Result<S7Pdu>>,
    deadline: Instant,
    _permit: OwnedSemaphorePermit,
}

/// What happened to an incoming reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Delivered,
    /// No pending job carries this reference
    Miss(u16),
}

/// Pending-jobs table and reference allocator.
///
/// Owned by the session IO loop only, so no locking is needed.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    inflight: HashMap<u16, InflightEntry>,
    timeouts: BTreeMap<Instant, Vec<u16>>,
    /// Timed-out references and the instant they become reusable
    quarantine: HashMap<u16, Instant>,
    last_ref: u16,
    ref_grace: Duration,
}

impl Dispatcher {
    pub(crate) fn new(ref_grace: Duration) -> Self {
        Self {
            inflight: HashMap::with_capacity(64),
            timeouts: BTreeMap::new(),
            quarantine: HashMap::new(),
            last_ref: 0,
            ref_grace,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.inflight.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Next free reference in 1..=65535, skipping outstanding and quarantined ones
    pub(crate) fn allocate_ref(&mut self, now: Instant) -> Option<u16> {
        self.quarantine.retain(|_, until| *until > now);
        let mut candidate = self.last_ref;
        for _ in 0..u16::MAX {
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                candidate = 1;
            }
            if !self.inflight.contains_key(&candidate) && !self.quarantine.contains_key(&candidate)
            {
                self.last_ref = candidate;
                return Some(candidate);
            }
        }
        None
    }

    pub(crate) fn register(
        &mut self,
        pdu_ref: u16,
        tx: oneshot::Sender<Result<S7Pdu>>,
        permit: OwnedSemaphorePermit,
        deadline: Instant,
    ) {
        self.inflight.insert(
            pdu_ref,
            InflightEntry {
                tx,
                deadline,
                _permit: permit,
            },
        );
        self.timeouts.entry(deadline).or_default().push(pdu_ref);
    }

    /// Complete the job matching the reply's reference
    pub(crate) fn resolve(&mut self, pdu: S7Pdu) -> Resolution {
        let pdu_ref = pdu.pdu_ref();
        match self.inflight.remove(&pdu_ref) {
            Some(entry) => {
                let _ = entry.tx.send(Ok(pdu));
                Resolution::Delivered
            }
            None => Resolution::Miss(pdu_ref),
        }
    }

    /// Fail one job, e.g. when its PDU could not be written
    pub(crate) fn fail(&mut self, pdu_ref: u16, err: Error) {
        if let Some(entry) = self.inflight.remove(&pdu_ref) {
            let _ = entry.tx.send(Err(err));
        }
    }

    /// Earliest deadline among pending jobs
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timeouts.keys().next().copied()
    }

    /// Fail every job whose deadline has passed and quarantine its reference.
    ///
    /// Returns the expired references.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<u16> {
        let due: Vec<Instant> = self.timeouts.range(..=now).map(|(dl, _)| *dl).collect();
        let mut expired = Vec::new();
        for dl in due {
            let Some(refs) = self.timeouts.remove(&dl) else {
                continue;
            };
            for pdu_ref in refs {
                // the reference may have been resolved and reused since
                let stale = self
                    .inflight
                    .get(&pdu_ref)
                    .map_or(true, |entry| entry.deadline > now);
                if stale {
                    continue;
                }
                if let Some(entry) = self.inflight.remove(&pdu_ref) {
                    let _ = entry.tx.send(Err(Error::ErrRequestTimeout));
                    self.quarantine.insert(pdu_ref, now + self.ref_grace);
                    expired.push(pdu_ref);
                }
            }
        }
        expired
    }

    /// Fail every pending job with `ErrNotConnected` and clear the table
    pub(crate) fn drain(&mut self) -> usize {
        let count = self.inflight.len();
        for (_, entry) in self.inflight.drain() {
            let _ = entry.tx.send(Err(Error::ErrNotConnected));
        }
        self.timeouts.clear();
        count
    }
}
