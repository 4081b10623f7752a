//! Prepare pipeline: the ordered queue of radio events about to run
//!
//! Entries are kept in ascending `ticks_at_expire` order using wraparound
//! signed-difference comparison, with two exceptions shaping the order:
//!
//! * resume entries (re-runs of previously pre-empted events) always go to
//!   the tail, so an in-progress multi-part event cannot starve newly
//!   expiring events that were scheduled before its resumption
//! * aborted entries keep their position but are ignored by every ordering
//!   decision; they are skipped and retired when the head is flushed
//!
//! The pipeline is a fixed array of slots chained by indexes. At most
//! [`EVENT_PIPELINE_MAX`](crate::config::EVENT_PIPELINE_MAX) entries are
//! live; enqueueing into a full pipeline fails without corrupting the
//! existing order and the affected event simply misses its occurrence,
//! recovering through the latency machinery.

use crate::config::EVENT_PIPELINE_MAX;
use crate::error::Error;
use crate::hw::cntr::{ticks_diff, CNTR_MSBIT};
use super::{Event, EventKind};

#[derive(Clone, Copy)]
struct Slot {
    event: Event,
    next: Option<u8>,
}

/// Expiry-ordered queue of prepare requests
pub struct Pipeline {
    slots: [Option<Slot>; EVENT_PIPELINE_MAX],
    head: Option<u8>,
    tail: Option<u8>,
}

impl Pipeline {
    /// Creates an empty pipeline
    pub const fn new() -> Self {
        Self {
            slots: [None; EVENT_PIPELINE_MAX],
            head: None,
            tail: None,
        }
    }

    /// Number of live entries
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Checks whether no entry is queued
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn slot_alloc(&mut self, event: Event) -> Option<u8> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Slot { event, next: None });
                return Some(idx as u8);
            }
        }
        None
    }

    fn event(&self, idx: u8) -> &Event {
        &self.slots[idx as usize].as_ref().unwrap().event
    }

    fn next_of(&self, idx: u8) -> Option<u8> {
        self.slots[idx as usize].as_ref().unwrap().next
    }

    fn link(&mut self, idx: u8, next: Option<u8>) {
        self.slots[idx as usize].as_mut().unwrap().next = next;
    }

    /// Inserts a prepare request, keeping the order described in the module
    /// documentation
    ///
    /// Fails with [`Error::NoMemory`] when all slots are live.
    pub fn enqueue(&mut self, event: Event) -> Result<(), Error> {
        let is_resume = event.is_resume;
        let ticks = event.param.ticks_at_expire;

        let new = self.slot_alloc(event).ok_or(Error::NoMemory)?;

        let Some(tail) = self.tail else {
            self.head = Some(new);
            self.tail = Some(new);
            return Ok(());
        };

        // Should the prepare be placed as the tail?
        let e_tail = self.event(tail);
        let diff = ticks_diff(ticks, e_tail.param.ticks_at_expire);
        if is_resume
            || (!e_tail.is_aborted && !e_tail.is_resume && (diff & CNTR_MSBIT) == 0)
        {
            self.link(tail, Some(new));
            self.tail = Some(new);
            return Ok(());
        }

        // Should the prepare be placed as the head?
        let head = self.head.unwrap();
        let e_head = self.event(head);
        let diff = ticks_diff(e_head.param.ticks_at_expire, ticks);
        if !e_head.is_aborted
            && (e_head.is_resume || (diff != 0 && (diff & CNTR_MSBIT) == 0))
        {
            self.link(new, Some(head));
            self.head = Some(new);
            return Ok(());
        }

        // Walk for the last entry the new one must follow: the latest
        // non-aborted, non-resume entry not later than the new one
        let mut prev: Option<u8> = None;
        let mut curr = head;
        loop {
            let e_curr = self.event(curr);
            if !e_curr.is_aborted && !e_curr.is_resume {
                prev = Some(curr);
            }

            let Some(following) = self.next_of(curr) else {
                break;
            };
            curr = following;

            let e_curr = self.event(curr);
            let diff = ticks_diff(ticks, e_curr.param.ticks_at_expire);
            if e_curr.is_resume || (!e_curr.is_aborted && (diff & CNTR_MSBIT) != 0) {
                break;
            }
        }

        match prev {
            None => {
                let old_head = self.head;
                self.link(new, old_head);
                self.head = Some(new);
                if self.next_of(new).is_none() {
                    self.tail = Some(new);
                }
            }
            Some(prev) => {
                let following = self.next_of(prev);
                self.link(new, following);
                self.link(prev, Some(new));
                if self.next_of(new).is_none() {
                    self.tail = Some(new);
                }
            }
        }

        Ok(())
    }

    /// Returns a copy of the head entry without consuming it
    pub fn head(&self) -> Option<Event> {
        self.head.map(|idx| *self.event(idx))
    }

    /// Removes and returns the head entry
    pub fn dequeue(&mut self) -> Option<Event> {
        let head = self.head?;
        let slot = self.slots[head as usize].take().unwrap();

        self.head = slot.next;
        if self.head.is_none() {
            self.tail = None;
        }

        Some(slot.event)
    }

    /// Runs `f` over every live entry in list order
    pub fn for_each(&self, mut f: impl FnMut(&Event)) {
        let mut curr = self.head;
        while let Some(idx) = curr {
            f(self.event(idx));
            curr = self.next_of(idx);
        }
    }

    /// Runs `f` over every live entry in list order with mutable access
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut Event)) {
        let mut curr = self.head;
        while let Some(idx) = curr {
            let slot = self.slots[idx as usize].as_mut().unwrap();
            f(&mut slot.event);
            curr = slot.next;
        }
    }

    /// Marks every entry of the passed event kind aborted, returning how
    /// many were newly marked
    pub fn abort_by_kind(&mut self, kind: EventKind) -> usize {
        let mut marked = 0;
        self.for_each_mut(|event| {
            if event.param.kind == kind && !event.is_aborted {
                event.is_aborted = true;
                marked += 1;
            }
        });
        marked
    }

    /// Unlinks every aborted entry, passing each to `f` for retirement
    pub fn drain_aborted(&mut self, mut f: impl FnMut(Event)) {
        let mut prev: Option<u8> = None;
        let mut curr = self.head;

        while let Some(idx) = curr {
            let slot = *self.slots[idx as usize].as_ref().unwrap();

            if slot.event.is_aborted {
                self.slots[idx as usize] = None;
                match prev {
                    None => self.head = slot.next,
                    Some(prev) => self.link(prev, slot.next),
                }
                if slot.next.is_none() {
                    self.tail = prev;
                }
                f(slot.event);
            } else {
                prev = Some(idx);
            }

            curr = slot.next;
        }
    }

    /// Drops every entry
    pub fn reset(&mut self) {
        self.slots = [None; EVENT_PIPELINE_MAX];
        self.head = None;
        self.tail = None;
    }
}

#[cfg(test)]
mod tests {
    use super::super::PrepareParam;
    use super::*;

    fn event(ticks: u32, handle: u16, is_resume: bool) -> Event {
        Event {
            param: PrepareParam {
                ticks_at_expire: ticks,
                remainder_us: 0,
                lazy: 0,
                kind: EventKind::Conn { handle },
            },
            prio: 0,
            is_resume,
            is_aborted: false,
        }
    }

    fn collect_ticks(p: &Pipeline) -> std::vec::Vec<(u32, bool)> {
        let mut out = std::vec::Vec::new();
        p.for_each(|e| out.push((e.param.ticks_at_expire, e.is_resume)));
        out
    }

    #[test]
    fn test_ascending_insertion_keeps_order() {
        let mut p = Pipeline::new();

        for i in 0..4u32 {
            p.enqueue(event(1000 + i * 500, i as u16, false)).unwrap();
        }

        let order = collect_ticks(&p);
        assert_eq!(
            order,
            [(1000, false), (1500, false), (2000, false), (2500, false)]
        );
    }

    #[test]
    fn test_descending_insertion_is_reordered() {
        let mut p = Pipeline::new();

        for i in 0..4u32 {
            p.enqueue(event(3500 - i * 500, i as u16, false)).unwrap();
        }

        let order = collect_ticks(&p);
        assert_eq!(
            order,
            [(2000, false), (2500, false), (3000, false), (3500, false)]
        );
    }

    #[test]
    fn test_mixed_insertion_is_sorted() {
        let mut p = Pipeline::new();

        for (i, ticks) in [5000u32, 2000, 8000, 3000].iter().enumerate() {
            p.enqueue(event(*ticks, i as u16, false)).unwrap();
        }

        let order: std::vec::Vec<u32> =
            collect_ticks(&p).iter().map(|(t, _)| *t).collect();
        assert_eq!(order, [2000, 3000, 5000, 8000]);
    }

    #[test]
    fn test_resume_goes_to_tail_despite_earlier_expiry() {
        let mut p = Pipeline::new();

        p.enqueue(event(1000, 0, false)).unwrap();
        p.enqueue(event(500, 1, true)).unwrap();
        p.enqueue(event(2000, 2, false)).unwrap();
        p.enqueue(event(100, 3, true)).unwrap();

        let order = collect_ticks(&p);
        assert_eq!(
            order,
            [(1000, false), (2000, false), (500, true), (100, true)]
        );
    }

    #[test]
    fn test_no_normal_entry_after_a_resume_entry() {
        let mut p = Pipeline::new();

        p.enqueue(event(1000, 0, false)).unwrap();
        p.enqueue(event(1300, 1, true)).unwrap();
        p.enqueue(event(700, 2, false)).unwrap();

        let order = collect_ticks(&p);
        assert_eq!(order, [(700, false), (1000, false), (1300, true)]);
    }

    #[test]
    fn test_enqueue_beyond_capacity_fails_cleanly() {
        let mut p = Pipeline::new();

        for i in 0..EVENT_PIPELINE_MAX as u32 {
            p.enqueue(event(1000 + i, i as u16, false)).unwrap();
        }

        assert_eq!(
            p.enqueue(event(9000, 9, false)),
            Err(Error::NoMemory)
        );
        assert_eq!(p.count(), EVENT_PIPELINE_MAX);

        // Order intact after the failed insert
        let order: std::vec::Vec<u32> =
            collect_ticks(&p).iter().map(|(t, _)| *t).collect();
        assert_eq!(order, [1000, 1001, 1002, 1003]);
    }

    #[test]
    fn test_ordering_ignores_aborted_entries() {
        let mut p = Pipeline::new();

        p.enqueue(event(1000, 0, false)).unwrap();
        p.enqueue(event(2000, 1, false)).unwrap();
        p.abort_by_kind(EventKind::Conn { handle: 1 });

        // New entry later than the aborted tail but earlier than nothing
        // else goes behind the last live entry
        p.enqueue(event(1500, 2, false)).unwrap();

        let live: std::vec::Vec<u32> = {
            let mut out = std::vec::Vec::new();
            p.for_each(|e| {
                if !e.is_aborted {
                    out.push(e.param.ticks_at_expire)
                }
            });
            out
        };
        assert_eq!(live, [1000, 1500]);
    }

    #[test]
    fn test_wraparound_ordering_uses_signed_difference() {
        let mut p = Pipeline::new();

        let near_wrap = CNTR_MSBIT.wrapping_mul(2).wrapping_sub(10); // MASK - 9
        p.enqueue(event(near_wrap, 0, false)).unwrap();
        p.enqueue(event(5, 1, false)).unwrap(); // after the wrap

        let order: std::vec::Vec<u32> =
            collect_ticks(&p).iter().map(|(t, _)| *t).collect();
        assert_eq!(order, [near_wrap, 5]);
    }

    #[test]
    fn test_dequeue_pops_in_list_order() {
        let mut p = Pipeline::new();

        p.enqueue(event(300, 0, false)).unwrap();
        p.enqueue(event(100, 1, false)).unwrap();
        p.enqueue(event(200, 2, true)).unwrap();

        assert_eq!(p.dequeue().unwrap().param.ticks_at_expire, 100);
        assert_eq!(p.dequeue().unwrap().param.ticks_at_expire, 300);
        let last = p.dequeue().unwrap();
        assert_eq!(last.param.ticks_at_expire, 200);
        assert!(last.is_resume);
        assert!(p.dequeue().is_none());
        assert!(p.is_empty());
    }
}
