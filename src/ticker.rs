//! Timing multiplexer scheduling all radio obligations on one counter
//!
//! Every periodic or one-shot timing obligation of the link layer - one per
//! connection plus the LLL preempt timeout - is a ticker node. The ticker
//! multiplexes the nodes onto the single compare channel of the
//! [counter capability](crate::hw::cntr::traits::CompareCounter) and
//! guarantees that nodes fire in non-decreasing expiry-tick order, with
//! counter wraparound handled by signed-difference comparison.
//!
//! Mutating calls ([`start`], [`update`], [`stop`]) may be issued from any
//! registered user context. They never touch node memory directly: each
//! call enqueues an operation into the caller's own operation FIFO and
//! returns [`Status::Busy`]; the ticker job drains the FIFOs, applies the
//! operations and reports each outcome through a closed completion-action
//! enumeration. `Busy` is a normal outcome, not an error; only thread
//! context may block waiting for the final status.
//!
//! Two deferred routines share the work:
//!
//! * the **worker** (high priority) dispatches expired nodes to their
//!   targets and advances periodic nodes, honoring lazy skip counts, the
//!   one-shot force flag and the sub-tick remainder accumulator
//! * the **job** (low priority) applies queued operations, resolves slot
//!   collisions and re-arms the compare channel for the earliest pending
//!   expiry

use crate::config::{MAX_CONN, TICKER_USER_OPS};
use crate::context::{self, ContextId, CONTEXT_COUNT};
use crate::crit_sect;
use crate::error::Error;
use crate::hw::cntr::traits::CompareCounter;
use crate::hw::cntr::{ticks_is_after, Ticks, CNTR_HZ, CNTR_MASK};
use crate::mayfly::{self, Call};
use crate::mem::fifo::Fifo;
use crate::mutex::Mutex;
use crate::sync::Signal;
use crate::ull;

/// Ticker node driving the LLL preempt timeout
pub const TICKER_ID_LLL_PREEMPT: u8 = 0;
/// First ticker node driving a connection; node id = base + handle
pub const TICKER_ID_CONN_BASE: u8 = 1;
/// Number of ticker nodes
pub const TICKER_NODES: usize = 1 + MAX_CONN;

/// One full tick in remainder accumulator units (millionths of a tick)
const REMAINDER_TICK: u32 = 1_000_000;

/// Outcome of a ticker operation
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Status {
    /// The operation was applied
    Success,
    /// The operation could not be applied (unknown node, wrong state)
    Failure,
    /// The operation was queued and will be applied by the ticker job
    Busy,
}

/// What a node expiry drives, dispatched by match in the worker
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExpiryAction {
    /// Kick the prepare of a connection event
    ConnPrepare {
        /// Connection handle owning the node
        handle: u16,
    },
    /// Run the LLL preempt arbitration
    LllPreempt,
}

/// Timing snapshot passed to the expiry target
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ExpireInfo {
    /// Absolute tick this expiry was scheduled at
    pub ticks_at_expire: Ticks,
    /// Sub-tick remainder in microseconds
    pub remainder_us: u32,
    /// Number of periods skipped since the last dispatched expiry
    pub lazy: u16,
}

/// Completion action of a queued operation, run by the job
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OpDone {
    /// Nobody waits for the outcome
    None,
    /// The outcome must be success; anything else is an invariant violation
    AssertSuccess,
    /// Store the outcome for the blocked thread-context caller and wake it
    ThreadStatus,
    /// A connection stop completed; release its resources in ULL context
    ConnStopped {
        /// Connection handle being cleaned up
        handle: u16,
    },
}

#[derive(Debug, Clone, Copy)]
enum OpKind {
    Start {
        id: u8,
        ticks_anchor: Ticks,
        offset_us: u32,
        interval_us: u32,
        lazy: u16,
        slot_ticks: Ticks,
        action: ExpiryAction,
    },
    Update {
        id: u8,
        drift_plus: Ticks,
        drift_minus: Ticks,
        lazy: Option<u16>,
        force: bool,
    },
    Stop {
        id: u8,
    },
}

#[derive(Debug, Clone, Copy)]
struct Op {
    kind: OpKind,
    done: OpDone,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    active: bool,
    ticks_at_expire: Ticks,
    interval_ticks: Ticks,
    remainder_periodic: u32,
    remainder_current: u32,
    lazy_periodic: u16,
    lazy_current: u16,
    force: bool,
    slot_ticks: Ticks,
    action: ExpiryAction,
}

const NODE_INIT: Node = Node {
    active: false,
    ticks_at_expire: 0,
    interval_ticks: 0,
    remainder_periodic: 0,
    remainder_current: 0,
    lazy_periodic: 0,
    lazy_current: 0,
    force: false,
    slot_ticks: 0,
    action: ExpiryAction::LllPreempt,
};

struct Instance {
    cntr: &'static dyn CompareCounter,
    nodes: [Node; TICKER_NODES],
}

// Safety: the instance is only reachable through the IRQ mutex below
unsafe impl Send for Instance {}

static INSTANCE: Mutex<Option<Instance>> = Mutex::new(None);

const OPS_INIT: Fifo<Op, { TICKER_USER_OPS + 1 }> = Fifo::new();
static OPS: [Fifo<Op, { TICKER_USER_OPS + 1 }>; CONTEXT_COUNT] = [OPS_INIT; CONTEXT_COUNT];

static THREAD_STATUS: Mutex<Status> = Mutex::new(Status::Busy);
static THREAD_STATUS_SIGNAL: Signal = Signal::new();

fn use_instance<F, R>(func: F) -> R
where
    F: FnOnce(&mut Instance) -> R,
{
    crit_sect::locked(|cs| {
        let instance_option = &mut INSTANCE.borrow_mut(cs);
        let instance = instance_option.as_mut().unwrap();
        func(instance)
    })
}

/// Initializes the ticker with the counter capability and starts the counter
pub fn init(cntr: &'static dyn CompareCounter) -> Result<(), Error> {
    cntr.start()?;

    crit_sect::locked(|cs| {
        let prev = INSTANCE.borrow_mut(cs).replace(Instance {
            cntr,
            nodes: [NODE_INIT; TICKER_NODES],
        });
        assert!(prev.is_none());
    });

    Ok(())
}

/// Deactivates all nodes and disarms the compare channel
///
/// Used by `ll_reset`; queued operations are dropped.
pub fn reset() {
    for ops in OPS.iter() {
        ops.reset();
    }

    use_instance(|i| {
        i.nodes = [NODE_INIT; TICKER_NODES];
        i.cntr.compare_clear();
    });

    THREAD_STATUS_SIGNAL.reset();
}

/// Tears the ticker instance down
///
/// This function is intended to be used between unit tests.
#[doc(hidden)]
pub fn deinit() {
    for ops in OPS.iter() {
        ops.reset();
    }

    crit_sect::locked(|cs| {
        if let Some(i) = INSTANCE.borrow_mut(cs).take() {
            i.cntr.compare_clear();
            let _ = i.cntr.stop();
        }
    });

    THREAD_STATUS_SIGNAL.reset();
}

/// Queues starting a node
///
/// The first expiry fires `offset_us` after the `ticks_anchor` tick; a
/// non-zero `interval_us` makes the node periodic. `lazy` periods are
/// skipped between dispatched expiries (peripheral latency). `slot_ticks`
/// reserves the radio time the resulting event occupies, used for
/// collision deferral.
#[allow(clippy::too_many_arguments)]
pub fn start(
    user: ContextId,
    id: u8,
    ticks_anchor: Ticks,
    offset_us: u32,
    interval_us: u32,
    lazy: u16,
    slot_ticks: Ticks,
    action: ExpiryAction,
    done: OpDone,
) -> Status {
    enqueue_op(
        user,
        Op {
            kind: OpKind::Start {
                id,
                ticks_anchor,
                offset_us,
                interval_us,
                lazy,
                slot_ticks,
                action,
            },
            done,
        },
    )
}

/// Queues a node update
///
/// Drift corrections move the next expiry without touching the period;
/// `lazy` replaces the configured skip count when present; `force` makes
/// the next period fire regardless of the skip count, once.
pub fn update(
    user: ContextId,
    id: u8,
    drift_plus: Ticks,
    drift_minus: Ticks,
    lazy: Option<u16>,
    force: bool,
    done: OpDone,
) -> Status {
    enqueue_op(
        user,
        Op {
            kind: OpKind::Update {
                id,
                drift_plus,
                drift_minus,
                lazy,
                force,
            },
            done,
        },
    )
}

/// Queues stopping a node
pub fn stop(user: ContextId, id: u8, done: OpDone) -> Status {
    enqueue_op(user, Op { kind: OpKind::Stop { id }, done })
}

/// Returns the next expiry tick of a node, or `None` when inactive
///
/// Queued but unapplied operations are not reflected.
pub fn next_expiry(id: u8) -> Option<Ticks> {
    use_instance(|i| {
        let node = &i.nodes[id as usize];
        node.active.then_some(node.ticks_at_expire)
    })
}

/// Reads the current counter value
pub fn ticks_now() -> Ticks {
    use_instance(|i| i.cntr.now())
}

/// Blocks until a `ThreadStatus` operation completed and returns its outcome
///
/// Must only be called from thread context, with exactly one such
/// operation outstanding.
pub fn thread_status_take(status: Status) -> Status {
    if status != Status::Busy {
        return status;
    }

    THREAD_STATUS_SIGNAL.take();
    crit_sect::locked(|cs| *THREAD_STATUS.borrow(cs))
}

/// Compare-channel IRQ entry, routed here by the platform glue
pub fn compare_isr() {
    let ret = mayfly::enqueue(context::current(), ContextId::UllHigh, Call::TickerWorker);
    assert!(ret.is_ok());
}

fn enqueue_op(user: ContextId, op: Op) -> Status {
    if OPS[user as usize].enqueue(op).is_err() {
        return Status::Failure;
    }

    let ret = mayfly::enqueue(user, ContextId::UllLow, Call::TickerJob);
    assert!(ret.is_ok());

    Status::Busy
}

fn advance_one_period(node: &mut Node) {
    node.ticks_at_expire = node.ticks_at_expire.wrapping_add(node.interval_ticks) & CNTR_MASK;
    node.remainder_current += node.remainder_periodic;
    if node.remainder_current >= REMAINDER_TICK {
        node.remainder_current -= REMAINDER_TICK;
        node.ticks_at_expire = node.ticks_at_expire.wrapping_add(1) & CNTR_MASK;
    }
}

/// Expiry dispatch routine, run in the high priority deferred context
pub fn worker() {
    let mut fires: [Option<(ExpiryAction, ExpireInfo)>; TICKER_NODES] = [None; TICKER_NODES];
    let mut n_fires = 0;

    use_instance(|i| {
        let now = i.cntr.now();

        while n_fires < TICKER_NODES {
            // Earliest active node already due
            let mut due: Option<usize> = None;
            for (idx, node) in i.nodes.iter().enumerate() {
                if !node.active || ticks_is_after(node.ticks_at_expire, now) {
                    continue;
                }
                due = match due {
                    None => Some(idx),
                    Some(d) => {
                        if ticks_is_after(i.nodes[d].ticks_at_expire, node.ticks_at_expire) {
                            Some(idx)
                        } else {
                            Some(d)
                        }
                    }
                };
            }

            let Some(idx) = due else { break };
            let node = &mut i.nodes[idx];

            if node.lazy_current < node.lazy_periodic && !node.force {
                // Deliberate skip implementing peripheral latency
                node.lazy_current += 1;
                advance_one_period(node);
                continue;
            }

            let info = ExpireInfo {
                ticks_at_expire: node.ticks_at_expire,
                remainder_us: node.remainder_current / CNTR_HZ,
                lazy: node.lazy_current,
            };
            let action = node.action;

            node.lazy_current = 0;
            node.force = false;
            if node.interval_ticks == 0 && node.remainder_periodic == 0 {
                node.active = false;
            } else {
                advance_one_period(node);
            }

            fires[n_fires] = Some((action, info));
            n_fires += 1;
        }
    });

    for (action, info) in fires.iter().flatten() {
        defmt::trace!("ticker expire @{} lazy={}", info.ticks_at_expire, info.lazy);
        match action {
            ExpiryAction::ConnPrepare { handle } => ull::conn::ticker_expired(*handle, *info),
            ExpiryAction::LllPreempt => {
                let ret =
                    mayfly::enqueue(ContextId::UllHigh, ContextId::Lll, Call::LllPreempt);
                assert!(ret.is_ok());
            }
        }
    }

    // Leftover catch-up work and compare re-arming belong to the job
    let ret = mayfly::enqueue(ContextId::UllHigh, ContextId::UllLow, Call::TickerJob);
    assert!(ret.is_ok());
}

/// Operation processing routine, run in the low priority deferred context
pub fn job() {
    const DONE_MAX: usize = CONTEXT_COUNT * (TICKER_USER_OPS + 1);
    let mut dones: [Option<(Status, OpDone)>; DONE_MAX] = [None; DONE_MAX];
    let mut n_dones = 0;

    let worker_needed = use_instance(|i| {
        for user in ContextId::ALL {
            while let Some(op) = OPS[user as usize].dequeue() {
                let status = apply_op(i, &op.kind);
                if n_dones < DONE_MAX {
                    dones[n_dones] = Some((status, op.done));
                    n_dones += 1;
                }
            }
        }

        resolve_slot_collisions(i);

        rearm_compare(i)
    });

    for (status, done) in dones.iter().flatten() {
        complete_op(*status, *done);
    }

    if worker_needed {
        let ret = mayfly::enqueue(ContextId::UllLow, ContextId::UllHigh, Call::TickerWorker);
        assert!(ret.is_ok());
    }
}

fn apply_op(i: &mut Instance, kind: &OpKind) -> Status {
    match *kind {
        OpKind::Start {
            id,
            ticks_anchor,
            offset_us,
            interval_us,
            lazy,
            slot_ticks,
            action,
        } => {
            let node = &mut i.nodes[id as usize];
            if node.active {
                return Status::Failure;
            }

            let offset_scaled = (offset_us as u64) * (CNTR_HZ as u64);
            let interval_scaled = (interval_us as u64) * (CNTR_HZ as u64);

            node.ticks_at_expire = ticks_anchor
                .wrapping_add((offset_scaled / REMAINDER_TICK as u64) as Ticks)
                & CNTR_MASK;
            node.interval_ticks = (interval_scaled / REMAINDER_TICK as u64) as Ticks;
            node.remainder_periodic = (interval_scaled % REMAINDER_TICK as u64) as u32;
            node.remainder_current = 0;
            node.lazy_periodic = lazy;
            node.lazy_current = 0;
            node.force = false;
            node.slot_ticks = slot_ticks;
            node.action = action;
            node.active = true;

            Status::Success
        }
        OpKind::Update {
            id,
            drift_plus,
            drift_minus,
            lazy,
            force,
        } => {
            let node = &mut i.nodes[id as usize];
            if !node.active {
                return Status::Failure;
            }

            node.ticks_at_expire = node
                .ticks_at_expire
                .wrapping_add(drift_plus)
                .wrapping_sub(drift_minus)
                & CNTR_MASK;
            if let Some(lazy) = lazy {
                node.lazy_periodic = lazy;
            }
            if force {
                node.force = true;
            }

            Status::Success
        }
        OpKind::Stop { id } => {
            let node = &mut i.nodes[id as usize];
            if !node.active {
                return Status::Failure;
            }

            node.active = false;
            Status::Success
        }
    }
}

/// Defers later-starting nodes whose reserved slot overlaps an earlier one
fn resolve_slot_collisions(i: &mut Instance) {
    for _ in 0..TICKER_NODES {
        let mut deferred = false;

        for a in 0..TICKER_NODES {
            if !i.nodes[a].active || i.nodes[a].slot_ticks == 0 {
                continue;
            }

            let a_end = i.nodes[a]
                .ticks_at_expire
                .wrapping_add(i.nodes[a].slot_ticks)
                & CNTR_MASK;

            for b in 0..TICKER_NODES {
                if a == b || !i.nodes[b].active || i.nodes[b].interval_ticks == 0 {
                    continue;
                }

                let b_start = i.nodes[b].ticks_at_expire;
                if !ticks_is_after(b_start, i.nodes[a].ticks_at_expire) {
                    // `b` does not start inside `a`'s window from the front
                    continue;
                }
                if ticks_is_after(a_end, b_start) {
                    let node_b = &mut i.nodes[b];
                    node_b.lazy_current = node_b.lazy_current.saturating_add(1);
                    advance_one_period(node_b);
                    deferred = true;
                }
            }
        }

        if !deferred {
            break;
        }
    }
}

/// Re-arms the compare channel; returns whether the worker must run because
/// the earliest expiry already passed
fn rearm_compare(i: &mut Instance) -> bool {
    let mut earliest: Option<Ticks> = None;
    for node in i.nodes.iter() {
        if !node.active {
            continue;
        }
        earliest = match earliest {
            None => Some(node.ticks_at_expire),
            Some(t) => {
                if ticks_is_after(t, node.ticks_at_expire) {
                    Some(node.ticks_at_expire)
                } else {
                    Some(t)
                }
            }
        };
    }

    match earliest {
        None => {
            i.cntr.compare_clear();
            false
        }
        Some(at) => {
            let ret = i.cntr.compare_set(at);
            assert!(ret.is_ok());

            // The target may have passed while arming; recover by running
            // the worker directly instead of waiting a full counter wrap
            !ticks_is_after(at, i.cntr.now())
        }
    }
}

fn complete_op(status: Status, done: OpDone) {
    match done {
        OpDone::None => (),
        OpDone::AssertSuccess => assert_eq!(status, Status::Success),
        OpDone::ThreadStatus => {
            crit_sect::locked(|cs| *THREAD_STATUS.borrow_mut(cs) = status);
            THREAD_STATUS_SIGNAL.give();
        }
        OpDone::ConnStopped { handle } => {
            let ret = mayfly::enqueue(
                ContextId::UllLow,
                ContextId::UllHigh,
                Call::ConnRelease { handle },
            );
            assert!(ret.is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::cntr::mock_cntr::MockCntr;
    use serial_test::serial;

    static CNTR: MockCntr = MockCntr;

    fn fixture() {
        mayfly::deinit();
        deinit();
        MockCntr::reset();
        context::leave(ContextId::Thread);
        init(&CNTR).unwrap();
    }

    fn pump() {
        // Drain deferred contexts in priority order until quiet
        for _ in 0..4 {
            mayfly::run(ContextId::UllHigh);
            mayfly::run(ContextId::UllLow);
        }
    }

    #[test]
    #[serial]
    fn test_start_arms_compare_at_first_expiry() {
        fixture();

        let status = start(
            ContextId::Thread,
            TICKER_ID_CONN_BASE,
            0,
            30_518, // 1000 ticks and a bit
            30_000 * 1000,
            0,
            10,
            ExpiryAction::LllPreempt,
            OpDone::AssertSuccess,
        );
        assert_eq!(status, Status::Busy);

        pump();

        let expiry = next_expiry(TICKER_ID_CONN_BASE).unwrap();
        assert_eq!(expiry, 1000);
        assert_eq!(MockCntr::compare_get(), Some(1000));
    }

    #[test]
    #[serial]
    fn test_start_on_active_node_fails() {
        fixture();

        start(
            ContextId::Thread,
            TICKER_ID_CONN_BASE,
            0,
            1000,
            10_000,
            0,
            0,
            ExpiryAction::LllPreempt,
            OpDone::AssertSuccess,
        );
        pump();

        let status = start(
            ContextId::Thread,
            TICKER_ID_CONN_BASE,
            0,
            1000,
            10_000,
            0,
            0,
            ExpiryAction::LllPreempt,
            OpDone::ThreadStatus,
        );
        pump();
        assert_eq!(thread_status_take(status), Status::Failure);
    }

    #[test]
    #[serial]
    fn test_update_zero_drift_is_idempotent() {
        fixture();

        start(
            ContextId::Thread,
            TICKER_ID_CONN_BASE,
            0,
            100_000,
            50_000,
            0,
            0,
            ExpiryAction::LllPreempt,
            OpDone::AssertSuccess,
        );
        pump();

        let before = next_expiry(TICKER_ID_CONN_BASE).unwrap();

        let status = update(
            ContextId::Thread,
            TICKER_ID_CONN_BASE,
            0,
            0,
            None,
            false,
            OpDone::ThreadStatus,
        );
        pump();

        assert_eq!(thread_status_take(status), Status::Success);
        assert_eq!(next_expiry(TICKER_ID_CONN_BASE).unwrap(), before);
    }

    #[test]
    #[serial]
    fn test_drift_moves_expiry_both_ways() {
        fixture();

        start(
            ContextId::Thread,
            TICKER_ID_CONN_BASE,
            0,
            100_000,
            50_000,
            0,
            0,
            ExpiryAction::LllPreempt,
            OpDone::AssertSuccess,
        );
        pump();
        let base = next_expiry(TICKER_ID_CONN_BASE).unwrap();

        update(
            ContextId::Thread,
            TICKER_ID_CONN_BASE,
            7,
            0,
            None,
            false,
            OpDone::AssertSuccess,
        );
        pump();
        assert_eq!(next_expiry(TICKER_ID_CONN_BASE).unwrap(), base + 7);

        update(
            ContextId::Thread,
            TICKER_ID_CONN_BASE,
            0,
            10,
            None,
            false,
            OpDone::AssertSuccess,
        );
        pump();
        assert_eq!(next_expiry(TICKER_ID_CONN_BASE).unwrap(), base - 3);
    }

    #[test]
    #[serial]
    fn test_periodic_node_advances_on_expiry() {
        fixture();

        // 10 ms period = 327.68 ticks; remainder accumulates
        start(
            ContextId::Thread,
            TICKER_ID_CONN_BASE,
            0,
            10_000,
            10_000,
            0,
            0,
            ExpiryAction::LllPreempt,
            OpDone::AssertSuccess,
        );
        pump();

        let first = next_expiry(TICKER_ID_CONN_BASE).unwrap();
        assert_eq!(first, 327);

        MockCntr::set_now(first);
        compare_isr();
        pump();

        let second = next_expiry(TICKER_ID_CONN_BASE).unwrap();
        assert_eq!(second, first + 327);

        MockCntr::set_now(second);
        compare_isr();
        pump();

        // The accumulated remainder (2 * 0.68 ticks) adds a full tick
        let third = next_expiry(TICKER_ID_CONN_BASE).unwrap();
        assert_eq!(third, second + 328);
    }

    #[test]
    #[serial]
    fn test_lazy_skips_periods_until_forced() {
        fixture();

        start(
            ContextId::Thread,
            TICKER_ID_CONN_BASE,
            0,
            10_000,
            10_000,
            2, // skip two periods between dispatched expiries
            0,
            ExpiryAction::LllPreempt,
            OpDone::AssertSuccess,
        );
        pump();
        let first = next_expiry(TICKER_ID_CONN_BASE).unwrap();

        // First two expiries are skipped in place
        MockCntr::set_now(first);
        compare_isr();
        pump();
        MockCntr::set_now(next_expiry(TICKER_ID_CONN_BASE).unwrap());
        compare_isr();
        pump();

        // Force overrides the remaining skip
        update(
            ContextId::Thread,
            TICKER_ID_CONN_BASE,
            0,
            0,
            None,
            true,
            OpDone::AssertSuccess,
        );
        pump();

        let before = next_expiry(TICKER_ID_CONN_BASE).unwrap();
        MockCntr::set_now(before);
        compare_isr();
        pump();

        // The forced expiry dispatched and the node advanced one period
        let after = next_expiry(TICKER_ID_CONN_BASE).unwrap();
        assert!(ticks_is_after(after, before));
    }

    #[test]
    #[serial]
    fn test_one_shot_node_deactivates() {
        fixture();

        start(
            ContextId::Thread,
            TICKER_ID_LLL_PREEMPT,
            0,
            5_000,
            0,
            0,
            0,
            ExpiryAction::LllPreempt,
            OpDone::AssertSuccess,
        );
        pump();

        let at = next_expiry(TICKER_ID_LLL_PREEMPT).unwrap();
        MockCntr::set_now(at);
        compare_isr();
        pump();

        assert_eq!(next_expiry(TICKER_ID_LLL_PREEMPT), None);
    }

    #[test]
    #[serial]
    fn test_stop_deactivates_and_reports() {
        fixture();

        start(
            ContextId::Thread,
            TICKER_ID_CONN_BASE,
            0,
            1_000,
            10_000,
            0,
            0,
            ExpiryAction::LllPreempt,
            OpDone::AssertSuccess,
        );
        pump();

        let status = stop(ContextId::Thread, TICKER_ID_CONN_BASE, OpDone::ThreadStatus);
        pump();
        assert_eq!(thread_status_take(status), Status::Success);
        assert_eq!(next_expiry(TICKER_ID_CONN_BASE), None);

        // Stopping again fails
        let status = stop(ContextId::Thread, TICKER_ID_CONN_BASE, OpDone::ThreadStatus);
        pump();
        assert_eq!(thread_status_take(status), Status::Failure);
    }

    #[test]
    #[serial]
    fn test_slot_collision_defers_later_node() {
        fixture();

        // Two periodic nodes 5 ticks apart, first one reserving 100 ticks
        start(
            ContextId::Thread,
            TICKER_ID_CONN_BASE,
            0,
            30_518, // 1000 ticks
            100_000,
            0,
            100,
            ExpiryAction::LllPreempt,
            OpDone::AssertSuccess,
        );
        start(
            ContextId::Thread,
            TICKER_ID_CONN_BASE + 1,
            0,
            30_670, // 1005 ticks
            100_000,
            0,
            100,
            ExpiryAction::LllPreempt,
            OpDone::AssertSuccess,
        );
        pump();

        let a = next_expiry(TICKER_ID_CONN_BASE).unwrap();
        let b = next_expiry(TICKER_ID_CONN_BASE + 1).unwrap();

        // The second node was pushed out of the first one's slot by a period
        assert!(ticks_is_after(b, a + 100));
    }
}
