//! A CPU rendition of the work-group model: compute units of lock-stepped
//! lanes sharing tile-local memory and a barrier.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Barrier, Condvar, Mutex,
    },
};

use thiserror::Error;

/// How many compute units run at once and how many lanes each one has.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cohort {
    pub units: usize,
    pub lanes: usize,
}

impl Cohort {
    pub fn new(units: usize, lanes: usize) -> Self {
        Cohort {
            units: units.max(1),
            lanes: lanes.max(1),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("kernel panicked in group {group}, member {member}: {message}")]
pub struct LaneFault {
    pub group: usize,
    pub member: usize,
    pub message: String,
}

/// Holds a unit's lanes until every one of them has been spawned. A closed
/// gate sends them home before they ever reach the barrier.
#[derive(Default)]
struct StartGate {
    open: Mutex<Option<bool>>,
    settled: Condvar,
}

impl StartGate {
    fn settle(&self, open: bool) {
        if let Ok(mut state) = self.open.lock() {
            state.get_or_insert(open);
        }
        self.settled.notify_all();
    }

    fn wait(&self) -> bool {
        let Ok(state) = self.open.lock() else {
            return false;
        };
        match self.settled.wait_while(state, |open| open.is_none()) {
            Ok(state) => state.unwrap_or(false),
            Err(_) => false,
        }
    }
}

struct ComputeUnit {
    gate: StartGate,
    barrier: Barrier,
    group: AtomicUsize,
    local: Box<[AtomicU32]>,
}

impl ComputeUnit {
    fn new(lanes: usize, members: usize) -> Self {
        ComputeUnit {
            gate: StartGate::default(),
            barrier: Barrier::new(lanes),
            group: AtomicUsize::new(0),
            local: (0..members).map(|_| AtomicU32::new(0)).collect(),
        }
    }
}

struct Dispatch<'a, B, A> {
    groups: usize,
    members: usize,
    lanes: usize,
    next: AtomicUsize,
    faulted: AtomicBool,
    fault: Mutex<Option<LaneFault>>,
    before: &'a B,
    after: &'a A,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<B, A> Dispatch<'_, B, A>
where
    B: Fn(usize, usize, &[AtomicU32]) + Sync,
    A: Fn(usize, usize, &[AtomicU32]) + Sync,
{
    /// Keeps the first fault and tells every unit to stop claiming groups.
    fn record(&self, fault: LaneFault) {
        self.faulted.store(true, Ordering::Relaxed);
        if let Ok(mut slot) = self.fault.lock() {
            slot.get_or_insert(fault);
        }
    }

    // A faulted lane keeps meeting the barrier so its siblings never hang.
    fn guarded<F>(&self, kernel: &F, group: usize, member: usize, local: &[AtomicU32])
    where
        F: Fn(usize, usize, &[AtomicU32]),
    {
        if self.faulted.load(Ordering::Relaxed) {
            return;
        }
        let ran = panic::catch_unwind(AssertUnwindSafe(|| kernel(group, member, local)));
        if let Err(payload) = ran {
            self.record(LaneFault {
                group,
                member,
                message: panic_message(payload.as_ref()),
            });
        }
    }

    fn lane(&self, unit: &ComputeUnit, lane: usize) {
        loop {
            if lane == 0 {
                let claimed = if self.faulted.load(Ordering::Relaxed) {
                    self.groups
                } else {
                    self.next.fetch_add(1, Ordering::Relaxed)
                };
                unit.group.store(claimed, Ordering::Relaxed);
            }
            unit.barrier.wait();
            let group = unit.group.load(Ordering::Relaxed);
            if group >= self.groups {
                break;
            }
            for member in (lane..self.members).step_by(self.lanes) {
                self.guarded(self.before, group, member, &unit.local);
            }
            unit.barrier.wait();
            for member in (lane..self.members).step_by(self.lanes) {
                self.guarded(self.after, group, member, &unit.local);
            }
        }
    }
}

/// Runs `groups` work-groups of `members` invocations each on
/// `cohort.units * cohort.lanes` scoped threads. Every group runs
/// `before` for all its members, meets a barrier, then runs `after` for all
/// its members. Both phases see the same tile-local memory, which holds
/// `members` words.
pub fn dispatch<B, A>(
    cohort: Cohort,
    groups: usize,
    members: usize,
    before: B,
    after: A,
) -> Result<(), LaneFault>
where
    B: Fn(usize, usize, &[AtomicU32]) + Sync,
    A: Fn(usize, usize, &[AtomicU32]) + Sync,
{
    let lanes = cohort.lanes.min(members.max(1));
    let dispatch = Dispatch {
        groups,
        members,
        lanes,
        next: AtomicUsize::new(0),
        faulted: AtomicBool::new(false),
        fault: Mutex::new(None),
        before: &before,
        after: &after,
    };
    let units: Vec<ComputeUnit> = (0..cohort.units.min(groups.max(1)))
        .map(|_| ComputeUnit::new(lanes, members))
        .collect();

    let joined = crossbeam::scope(|spawner| {
        for unit in &units {
            let mut spawned = true;
            for lane in 0..lanes {
                let dispatch = &dispatch;
                let started = spawner
                    .builder()
                    .name(format!("tilebrot-lane-{lane}"))
                    .spawn(move |_| {
                        if unit.gate.wait() {
                            dispatch.lane(unit, lane);
                        }
                    });
                if let Err(e) = started {
                    dispatch.record(LaneFault {
                        group: groups,
                        member: lane,
                        message: format!("failed to spawn lane: {e}"),
                    });
                    spawned = false;
                    break;
                }
            }
            unit.gate.settle(spawned);
            if !spawned {
                break;
            }
        }
    });

    let recorded = dispatch.fault.into_inner().ok().flatten();
    match (recorded, joined) {
        (Some(fault), _) => Err(fault),
        (None, Ok(())) => Ok(()),
        (None, Err(payload)) => Err(LaneFault {
            group: groups,
            member: 0,
            message: panic_message(payload.as_ref()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(len: usize) -> Vec<AtomicU32> {
        (0..len).map(|_| AtomicU32::new(0)).collect()
    }

    #[test]
    fn every_member_runs_once_per_phase() {
        let groups = 37;
        let members = 9;
        let before_hits = counters(groups * members);
        let after_hits = counters(groups * members);
        dispatch(
            Cohort::new(3, 4),
            groups,
            members,
            |g, m, _| {
                before_hits[g * members + m].fetch_add(1, Ordering::Relaxed);
            },
            |g, m, _| {
                after_hits[g * members + m].fetch_add(1, Ordering::Relaxed);
            },
        )
        .unwrap();
        assert!(before_hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
        assert!(after_hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn barrier_publishes_the_whole_tile() {
        let groups = 20;
        let members = 16;
        let sums = counters(groups * members);
        dispatch(
            Cohort::new(4, 4),
            groups,
            members,
            |g, m, local| local[m].store((g * 100 + m) as u32, Ordering::Relaxed),
            |g, m, local| {
                let sum: u32 = local.iter().map(|v| v.load(Ordering::Relaxed)).sum();
                sums[g * members + m].store(sum, Ordering::Relaxed);
            },
        )
        .unwrap();
        for g in 0..groups {
            let expected: u32 = (0..members).map(|m| (g * 100 + m) as u32).sum();
            for m in 0..members {
                assert_eq!(sums[g * members + m].load(Ordering::Relaxed), expected);
            }
        }
    }

    #[test]
    fn kernel_panic_becomes_a_fault() {
        let fault = dispatch(
            Cohort::new(2, 4),
            8,
            4,
            |g, m, _| {
                if g == 3 && m == 2 {
                    panic!("lost device");
                }
            },
            |_, _, _| {},
        )
        .unwrap_err();
        assert_eq!(fault.group, 3);
        assert_eq!(fault.member, 2);
        assert!(fault.message.contains("lost device"));
    }

    #[test]
    fn no_groups_is_a_no_op() {
        dispatch(Cohort::new(4, 4), 0, 16, |_, _, _| {}, |_, _, _| {}).unwrap();
    }

    #[test]
    fn closed_gate_sends_waiting_lanes_home() {
        let gate = StartGate::default();
        let released = crossbeam::scope(|spawner| {
            let waiting: Vec<_> = (0..3).map(|_| spawner.spawn(|_| gate.wait())).collect();
            gate.settle(false);
            waiting.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>()
        })
        .unwrap();
        assert_eq!(released, vec![false; 3]);
        // The first decision sticks.
        gate.settle(true);
        assert!(!gate.wait());
    }

    #[test]
    fn open_gate_lets_lanes_run() {
        let gate = StartGate::default();
        gate.settle(true);
        assert!(gate.wait());
    }
}
