//! Deferred inter-context call scheduler
//!
//! A mayfly is a small call descriptor posted from one execution context
//! into another without a full context switch: the caller enqueues the
//! descriptor into the per-(caller, callee) FIFO and signals the callee
//! context through the platform scheduling hook; the callee drains its
//! queues the next time it runs.
//!
//! Calls are a closed enumeration dispatched by match in the callee
//! context, keeping the hot paths free of indirect calls. Within one
//! (caller, callee) pair FIFO order is guaranteed. Queue depths are sized
//! to the worst legitimate concurrency, so a full queue is an invariant
//! violation and asserts instead of degrading.
//!
//! Singleton calls (the ticker worker and job, the RX demux, the pipeline
//! resume) carry a pending flag: re-posting one that is already queued is
//! a no-op, which gives each of those call sites the
//! at-most-one-outstanding discipline the queue sizing relies on.

use crate::config::MAYFLY_QUEUE_CNT;
use crate::context::{self, ContextId, CONTEXT_COUNT};
use crate::error::Error;
use crate::lll::PrepareParam;
use crate::mem::fifo::Fifo;
use crate::{lll, ticker, ull};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A deferred call executed in the destination context
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Call {
    /// Run the ticker worker (expiry dispatch)
    TickerWorker,
    /// Run the ticker job (operation processing and rescheduling)
    TickerJob,
    /// Prepare a radio event in LLL context
    LllPrepare(PrepareParam),
    /// Drain the prepare pipeline head after an event completed
    LllResume,
    /// Abort the LLL activity of the passed connection
    LllDisable {
        /// Connection handle whose event is torn down
        handle: u16,
    },
    /// Preempt arbitration at the due time of a queued event
    LllPreempt,
    /// Drain the ULL RX queue and the TX acknowledgement FIFO
    RxDemux,
    /// Distribute host-submitted TX nodes onto their connections
    TxDemux,
    /// Release a stopped connection's resources (post ticker-stop)
    ConnRelease {
        /// Connection handle being cleaned up
        handle: u16,
    },
}

const SINGLETON_CNT: usize = 6;

impl Call {
    /// Index into the pending-flag table for singleton calls
    fn singleton_idx(&self) -> Option<usize> {
        match self {
            Call::TickerWorker => Some(0),
            Call::TickerJob => Some(1),
            Call::LllResume => Some(2),
            Call::LllPreempt => Some(3),
            Call::RxDemux => Some(4),
            Call::TxDemux => Some(5),
            _ => None,
        }
    }
}

const QUEUE_INIT: Fifo<Call, MAYFLY_QUEUE_CNT> = Fifo::new();
const ROW_INIT: [Fifo<Call, MAYFLY_QUEUE_CNT>; CONTEXT_COUNT] = [QUEUE_INIT; CONTEXT_COUNT];

/// Queues indexed by [callee][caller]
static QUEUES: [[Fifo<Call, MAYFLY_QUEUE_CNT>; CONTEXT_COUNT]; CONTEXT_COUNT] =
    [ROW_INIT; CONTEXT_COUNT];

const PENDING_INIT: AtomicBool = AtomicBool::new(false);
static PENDING: [AtomicBool; SINGLETON_CNT] = [PENDING_INIT; SINGLETON_CNT];

/// Platform hook requesting that the passed context runs soon
///
/// On hardware the hook pends the software IRQ backing the context; on the
/// mocked platform the test harness records the request and pumps the
/// context itself.
pub type SchedHook = fn(ContextId);

static SCHED_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Installs the platform scheduling hook
pub fn init(sched: SchedHook) {
    SCHED_HOOK.store(sched as usize, Ordering::Relaxed);
}

/// Removes the scheduling hook
///
/// This function is intended to be used between unit tests.
#[doc(hidden)]
pub fn deinit() {
    SCHED_HOOK.store(0, Ordering::Relaxed);

    for pending in PENDING.iter() {
        pending.store(false, Ordering::Relaxed);
    }
    for row in QUEUES.iter() {
        for queue in row.iter() {
            queue.reset();
        }
    }
}

fn sched(callee: ContextId) {
    let hook = SCHED_HOOK.load(Ordering::Relaxed);
    if hook != 0 {
        // Safety: the value was stored from a valid `SchedHook` in init()
        let hook: SchedHook = unsafe { core::mem::transmute(hook) };
        hook(callee);
    }
}

/// Posts a call from `caller` into `callee` context
///
/// Posting a singleton call that is already pending succeeds without
/// enqueueing a duplicate. A full queue reports [`Error::NoMemory`]; all
/// call sites treat that as a broken invariant and assert.
pub fn enqueue(caller: ContextId, callee: ContextId, call: Call) -> Result<(), Error> {
    if let Some(idx) = call.singleton_idx() {
        if PENDING[idx]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Already queued; the pending drain will pick up the state
            // this post refers to
            return Ok(());
        }
    }

    QUEUES[callee as usize][caller as usize].enqueue(call)?;

    sched(callee);
    Ok(())
}

/// Drains every caller queue of the passed context, executing the calls
///
/// Runs in the callee context: on hardware this is the body of the
/// context's software IRQ handler, on the mocked platform tests call it to
/// pump a context. Calls posted while draining are executed in the same
/// run.
pub fn run(callee: ContextId) {
    let prev = context::enter(callee);

    loop {
        let mut idle = true;

        for caller in ContextId::ALL {
            while let Some(call) = QUEUES[callee as usize][caller as usize].dequeue() {
                idle = false;

                if let Some(idx) = call.singleton_idx() {
                    PENDING[idx].store(false, Ordering::Release);
                }

                dispatch(call);
            }
        }

        if idle {
            break;
        }
    }

    context::leave(prev);
}

fn dispatch(call: Call) {
    match call {
        Call::TickerWorker => ticker::worker(),
        Call::TickerJob => ticker::job(),
        Call::LllPrepare(param) => lll::prepare(&param, false),
        Call::LllResume => lll::resume(),
        Call::LllDisable { handle } => lll::disable(handle),
        Call::LllPreempt => lll::preempt(),
        Call::RxDemux => ull::rx_demux(),
        Call::TxDemux => ull::conn::tx_demux(),
        Call::ConnRelease { handle } => ull::conn::release_deferred(handle),
    }
}
