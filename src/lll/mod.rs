//! Lower link layer: the radio-interrupt-context event dispatcher
//!
//! The LLL owns the radio. Exactly one radio event is armed or running at
//! any time (the *current* event); everything else waits in the
//! [prepare pipeline](pipeline). Prepares arrive from the ticker through
//! the mayfly; each one either becomes current immediately (idle radio,
//! empty pipeline) or is inserted into the pipeline and arms the one-shot
//! preempt timeout at the earliest queued expiry. When the preempt timeout
//! finds the radio still busy with an event the queued head must displace,
//! the current event is aborted through the radio disable path and
//! completes with a not-a-clean-exchange outcome.
//!
//! Event completion flows bottom-up: the connection ISR retires the current
//! event and posts an event-done node towards the ULL; the ULL done handler
//! posts [`resume`] back into this context, which flushes the pipeline head
//! and arms the next event.

pub mod conn;
pub mod pipeline;

use crate::context::{self, ContextId};
use crate::crit_sect;
use crate::hw::cntr::Ticks;
use crate::hw::radio::traits::RadioOps;
use crate::mutex::Mutex;
use crate::ticker::{self, ExpiryAction, OpDone};
use crate::ull;
use pipeline::Pipeline;

/// Closed set of radio event kinds this controller schedules
///
/// Scanning, advertising and periodic sync events plug in here as further
/// variants with their own prepare and abort implementations.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EventKind {
    /// Connection event of the passed handle
    Conn {
        /// Connection handle owning the event
        handle: u16,
    },
}

/// Timing and dispatch parameters of one prepare request
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PrepareParam {
    /// Absolute tick the event is scheduled at
    pub ticks_at_expire: Ticks,
    /// Sub-tick remainder in microseconds
    pub remainder_us: u32,
    /// Periods skipped since the previous prepare of this event
    pub lazy: u16,
    /// Which event implementation the request dispatches to
    pub kind: EventKind,
}

/// One entry of the prepare pipeline
#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// Timing and dispatch parameters
    pub param: PrepareParam,
    /// Arbitration priority, lower wins
    pub prio: u8,
    /// Re-run of a previously pre-empted event
    pub is_resume: bool,
    /// Skipped at dispatch, retired at the next flush
    pub is_aborted: bool,
}

/// Radio ISR routing, set by the event implementations before every radio
/// operation and dispatched by [`radio_isr`]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IsrTarget {
    /// No event owns the radio; a spurious latched event is cleared
    Race,
    /// Transmission completed for a connection event
    ConnTx {
        /// Owning connection handle
        handle: u16,
    },
    /// Reception completed (or its window closed) for a connection event
    ConnRx {
        /// Owning connection handle
        handle: u16,
    },
    /// The aborted radio operation of a connection event wound down
    ConnAbort {
        /// Owning connection handle
        handle: u16,
    },
}

struct LllState {
    curr: Option<Event>,
    pipeline: Pipeline,
    isr: IsrTarget,
}

static STATE: Mutex<LllState> = Mutex::new(LllState {
    curr: None,
    pipeline: Pipeline::new(),
    isr: IsrTarget::Race,
});

struct RadioRef(Option<&'static dyn RadioOps>);
// Safety: the reference is written once at init from thread context and
// only read afterwards
unsafe impl Send for RadioRef {}

static RADIO: Mutex<RadioRef> = Mutex::new(RadioRef(None));

/// Initializes the LLL with the radio capability
pub fn init(radio: &'static dyn RadioOps) {
    crit_sect::locked(|cs| {
        let prev = RADIO.borrow_mut(cs).0.replace(radio);
        assert!(prev.is_none());
    });

    radio.reset();
}

/// Drops all LLL state
///
/// Used by `ll_reset` and between unit tests.
pub fn reset() {
    crit_sect::locked(|cs| {
        let mut state = STATE.borrow_mut(cs);
        state.curr = None;
        state.pipeline.reset();
        state.isr = IsrTarget::Race;
    });
}

/// Tears the radio binding down
///
/// This function is intended to be used between unit tests.
#[doc(hidden)]
pub fn deinit() {
    reset();
    crit_sect::locked(|cs| RADIO.borrow_mut(cs).0 = None);
}

pub(crate) fn radio() -> &'static dyn RadioOps {
    crit_sect::locked(|cs| RADIO.borrow(cs).0).unwrap()
}

pub(crate) fn isr_target_set(target: IsrTarget) {
    crit_sect::locked(|cs| STATE.borrow_mut(cs).isr = target);
}

/// Radio IRQ entry, routed here by the platform glue (or by a test acting
/// as the radio)
pub fn radio_isr() {
    let prev = context::enter(ContextId::Lll);

    let target = crit_sect::locked(|cs| STATE.borrow(cs).isr);
    match target {
        IsrTarget::Race => radio().status_reset(),
        IsrTarget::ConnTx { handle } => conn::isr_tx(handle),
        IsrTarget::ConnRx { handle } => conn::isr_rx(handle),
        IsrTarget::ConnAbort { handle } => conn::isr_abort(handle),
    }

    context::leave(prev);
}

/// Handles one prepare request in LLL context
///
/// Dispatches immediately when the radio is idle and nothing is queued;
/// otherwise inserts into the pipeline and arms the preempt timeout at the
/// queued head's expiry.
pub fn prepare(param: &PrepareParam, is_resume: bool) {
    let event = Event {
        param: *param,
        prio: 0,
        is_resume,
        is_aborted: false,
    };

    enum Outcome {
        RunNow,
        Queued { head_ticks: Ticks },
        Dropped,
    }

    let outcome = crit_sect::locked(|cs| {
        let mut state = STATE.borrow_mut(cs);

        if state.curr.is_none() && state.pipeline.is_empty() {
            state.curr = Some(event);
            Outcome::RunNow
        } else {
            match state.pipeline.enqueue(event) {
                Ok(()) => Outcome::Queued {
                    head_ticks: state.pipeline.head().unwrap().param.ticks_at_expire,
                },
                Err(_) => Outcome::Dropped,
            }
        }
    });

    match outcome {
        Outcome::RunNow => dispatch_prepare(&event),
        Outcome::Queued { head_ticks } => preempt_ticker_arm(head_ticks),
        Outcome::Dropped => {
            // Pipeline exhausted: the owner misses this occurrence and
            // recovers through its latency/force machinery
            defmt::info!("prepare pipeline full, occurrence dropped");
            retire_unrun(&event);
        }
    }
}

/// Flushes the pipeline head after an event completed
///
/// Skips and retires aborted entries, then dispatches the first live one.
/// When entries stay queued behind the dispatched event, the preempt
/// timeout is re-armed at the new head's expiry, so a resumed or
/// long-running event cannot push the queue past its deadline.
pub fn resume() {
    loop {
        let head = crit_sect::locked(|cs| {
            let mut state = STATE.borrow_mut(cs);
            if state.curr.is_some() {
                None
            } else {
                state.pipeline.dequeue()
            }
        });

        let Some(event) = head else { return };

        if event.is_aborted {
            retire_unrun(&event);
            continue;
        }

        crit_sect::locked(|cs| STATE.borrow_mut(cs).curr = Some(event));
        dispatch_prepare(&event);

        let next_ticks = crit_sect::locked(|cs| {
            STATE
                .borrow(cs)
                .pipeline
                .head()
                .map(|e| e.param.ticks_at_expire)
        });
        if let Some(ticks) = next_ticks {
            preempt_ticker_arm(ticks);
        }
        return;
    }
}

/// Preempt timeout expiry: aborts the current event when the queued head
/// is due and must displace it
pub fn preempt() {
    enum Action {
        AbortCurr(EventKind),
        Flush,
        Nothing,
    }

    let action = crit_sect::locked(|cs| {
        let state = STATE.borrow(cs);

        match (&state.curr, state.pipeline.head()) {
            (Some(curr), Some(head)) if !head.is_aborted => Action::AbortCurr(curr.param.kind),
            (None, Some(_)) => Action::Flush,
            _ => Action::Nothing,
        }
    });

    match action {
        Action::AbortCurr(EventKind::Conn { handle }) => conn::abort_current(handle),
        Action::Flush => resume(),
        Action::Nothing => (),
    }
}

/// Aborts all LLL activity of the passed connection: the current event if
/// it belongs to the connection, and every queued prepare of it
pub fn disable(handle: u16) {
    let kind = EventKind::Conn { handle };

    let curr_matches = crit_sect::locked(|cs| {
        let mut state = STATE.borrow_mut(cs);
        state.pipeline.abort_by_kind(kind);
        matches!(state.curr, Some(ev) if ev.param.kind == kind)
    });

    // Retire the marked entries right away; nothing will flush them if the
    // radio stays idle
    let mut retired: [Option<Event>; crate::config::EVENT_PIPELINE_MAX] =
        [None; crate::config::EVENT_PIPELINE_MAX];
    let mut n_retired = 0;
    crit_sect::locked(|cs| {
        STATE.borrow_mut(cs).pipeline.drain_aborted(|ev| {
            retired[n_retired] = Some(ev);
            n_retired += 1;
        });
    });
    for ev in retired.iter().flatten() {
        retire_unrun(ev);
    }

    if curr_matches {
        conn::abort_current(handle);
    } else {
        resume();
    }
}

/// Clears the current event; called by the event implementation once its
/// radio activity fully wound down
pub(crate) fn curr_clear() {
    crit_sect::locked(|cs| {
        let mut state = STATE.borrow_mut(cs);
        state.curr = None;
        state.isr = IsrTarget::Race;
    });
}

fn dispatch_prepare(event: &Event) {
    match event.param.kind {
        EventKind::Conn { .. } => conn::event_start(&event.param),
    }
}

/// Produces the event-done accounting for an entry that never ran (dropped
/// or aborted while still queued)
fn retire_unrun(event: &Event) {
    match event.param.kind {
        EventKind::Conn { handle } => {
            ull::event_done(handle, conn::done_extra_unrun(event.param.lazy));
        }
    }
}

fn preempt_ticker_arm(head_ticks: Ticks) {
    let user = context::current();

    // A previous arm may or may not still be pending; the stop outcome is
    // deliberately ignored and the start applied right after it
    ticker::stop(user, ticker::TICKER_ID_LLL_PREEMPT, OpDone::None);
    ticker::start(
        user,
        ticker::TICKER_ID_LLL_PREEMPT,
        head_ticks,
        0,
        0,
        0,
        0,
        ExpiryAction::LllPreempt,
        OpDone::None,
    );
}
