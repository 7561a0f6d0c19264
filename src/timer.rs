//! The timer wheel.
//!
//! Timers sit in an ordered list keyed by `deadline`; firing a timer may
//! itself schedule further timers, which insert correctly because the list
//! stays sorted after every public operation. Two timers with an equal
//! deadline fire in FIFO order of insertion, matched here by a strictly
//! increasing sequence number used as a tie-breaker.
//!
//! A timer's callback is handed `&mut TimerWheel` so it can reschedule
//! itself, and an explicit reschedule from inside the callback always wins
//! over the automatic periodic reinsertion; any device state the callback
//! needs to touch is captured by the closure as an `Rc<RefCell<_>>` so
//! several I/O ports and the scheduler can share one device without a
//! borrow-checker fight.

use crate::arena::{Arena, Handle};
use crate::tick::Tick;

pub type TimerHandle = Handle<Timer>;

/// A single timer entry. `period` is preserved across disable so that
/// re-enabling a periodic timer does not lose its cadence.
pub struct Timer {
    deadline: Tick,
    period: Tick,
    enabled: bool,
    periodic: bool,
    seq: u64,
    callback: Box<dyn FnMut(&mut TimerWheel)>,
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("deadline", &self.deadline)
            .field("period", &self.period)
            .field("enabled", &self.enabled)
            .field("periodic", &self.periodic)
            .finish()
    }
}

/// The timer wheel itself. `order` is a `Vec` of handles kept sorted by
/// `(deadline, seq)` on every mutation — adequate at the scale the fabric
/// runs at (tens of live timers), and a single obviously-correct structure
/// beats a hand-rolled intrusive linked list for this size.
#[derive(Default)]
pub struct TimerWheel {
    timers: Arena<Timer>,
    order: Vec<TimerHandle>,
    now: Tick,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            timers: Arena::new(),
            order: Vec::new(),
            now: 0,
            next_seq: 0,
        }
    }

    pub fn now(&self) -> Tick {
        self.now
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Register a new, initially-disabled timer. Never fails (arena-backed).
    pub fn add(&mut self, callback: impl FnMut(&mut TimerWheel) + 'static) -> TimerHandle {
        self.timers.insert(Timer {
            deadline: self.now,
            period: 0,
            enabled: false,
            periodic: false,
            seq: 0,
            callback: Box::new(callback),
        })
    }

    pub fn remove(&mut self, handle: TimerHandle) {
        self.unlink(handle);
        self.timers.remove(handle);
    }

    /// Schedule (or reschedule) `handle` to fire `delta` ticks from now.
    /// Implicitly enables a disabled timer.
    pub fn set_delay(&mut self, handle: TimerHandle, delta: Tick) {
        self.unlink(handle);
        let seq = self.next_seq();
        let now = self.now;
        if let Some(timer) = self.timers.get_mut(handle) {
            timer.deadline = now + delta;
            timer.enabled = true;
            timer.seq = seq;
        } else {
            return;
        }
        self.link_sorted(handle);
    }

    pub fn set_periodic(&mut self, handle: TimerHandle, period: Tick) {
        if let Some(timer) = self.timers.get_mut(handle) {
            timer.period = period;
            timer.periodic = period != 0;
        }
    }

    pub fn enable(&mut self, handle: TimerHandle) {
        let already_enabled = self.timers.get(handle).map(|t| t.enabled).unwrap_or(true);
        if already_enabled {
            return;
        }
        let deadline = self.timers.get(handle).map(|t| t.deadline).unwrap_or(self.now);
        self.set_delay(handle, deadline.saturating_sub(self.now));
    }

    /// Disable a timer. Safe to call on a timer currently being processed:
    /// the firing loop samples the head handle fresh on each iteration, so
    /// an unlink here simply removes it before the next sample.
    pub fn disable(&mut self, handle: TimerHandle) {
        self.unlink(handle);
        if let Some(timer) = self.timers.get_mut(handle) {
            timer.enabled = false;
        }
    }

    pub fn is_enabled(&self, handle: TimerHandle) -> bool {
        self.timers.get(handle).map(|t| t.enabled).unwrap_or(false)
    }

    pub fn deadline(&self, handle: TimerHandle) -> Option<Tick> {
        self.timers.get(handle).map(|t| t.deadline)
    }

    /// Ticks until the earliest enabled timer fires, or `None` if none are
    /// scheduled. The executor must not advance time past this value
    /// without reconciling.
    pub fn next_deadline(&self) -> Option<Tick> {
        self.order.first().and_then(|h| self.deadline(*h))
    }

    /// Fire every timer whose deadline is `<= now`, advancing the wheel's
    /// clock to each deadline in turn.
    pub fn process_now(&mut self) {
        loop {
            let Some(&head) = self.order.first() else {
                break;
            };
            let Some(deadline) = self.deadline(head) else {
                self.order.remove(0);
                continue;
            };
            if deadline > self.now {
                break;
            }
            self.now = deadline;
            self.unlink(head);

            let (periodic, period) = match self.timers.get(head) {
                Some(t) => (t.periodic, t.period),
                None => continue,
            };

            let mut callback = match self.timers.get_mut(head) {
                Some(timer) => {
                    timer.enabled = false;
                    std::mem::replace(&mut timer.callback, Box::new(|_| {}))
                }
                None => continue,
            };
            callback(self);
            if let Some(timer) = self.timers.get_mut(head) {
                timer.callback = callback;
            }

            // A callback that called `set_delay` itself already relinked
            // `head` with its own deadline; only the automatic periodic
            // reinsertion path still needs handling here.
            let still_enabled = self.timers.get(head).map(|t| t.enabled).unwrap_or(false);
            if !still_enabled && periodic && self.timers.contains(head) {
                self.set_delay(head, period);
            }
        }
    }

    pub fn advance_to_next_deadline(&mut self) {
        if let Some(deadline) = self.next_deadline() {
            self.now = deadline;
        }
        self.process_now();
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn unlink(&mut self, handle: TimerHandle) {
        self.order.retain(|h| *h != handle);
    }

    fn link_sorted(&mut self, handle: TimerHandle) {
        let (deadline, seq) = match self.timers.get(handle) {
            Some(t) => (t.deadline, t.seq),
            None => return,
        };
        let pos = self
            .order
            .partition_point(|h| self.cmp_key(*h) <= (deadline, seq));
        self.order.insert(pos, handle);
    }

    fn cmp_key(&self, handle: TimerHandle) -> (Tick, u64) {
        self.timers
            .get(handle)
            .map(|t| (t.deadline, t.seq))
            .unwrap_or((Tick::MAX, u64::MAX))
    }

    /// Assert the wheel's ordering invariant; used by tests.
    #[cfg(test)]
    pub fn assert_sorted(&self) {
        for w in self.order.windows(2) {
            assert!(self.cmp_key(w[0]) <= self.cmp_key(w[1]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn fires_in_deadline_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut wheel = TimerWheel::new();

        let mk = |log: Rc<RefCell<Vec<&'static str>>>, name: &'static str| {
            move |_: &mut TimerWheel| log.borrow_mut().push(name)
        };

        let t1 = wheel.add(mk(log.clone(), "t1"));
        let t2 = wheel.add(mk(log.clone(), "t2"));
        let t3 = wheel.add(mk(log.clone(), "t3"));

        wheel.set_delay(t1, 100);
        wheel.set_delay(t2, 50);
        wheel.set_delay(t3, 100);
        wheel.assert_sorted();

        wheel.now = 150;
        wheel.process_now();

        assert_eq!(*log.borrow(), vec!["t2", "t1", "t3"]);
    }

    #[test]
    fn periodic_timer_reschedules_without_drift() {
        let count = Rc::new(RefCell::new(0u32));
        let mut wheel = TimerWheel::new();
        let c = count.clone();
        let t = wheel.add(move |_: &mut TimerWheel| *c.borrow_mut() += 1);
        wheel.set_delay(t, 10);
        wheel.set_periodic(t, 10);

        for expected in 1..=5u32 {
            wheel.now += 10;
            wheel.process_now();
            assert_eq!(*count.borrow(), expected);
            assert_eq!(wheel.deadline(t), Some(10 * (expected as u64 + 1)));
        }
    }

    #[test]
    fn callback_can_override_automatic_reschedule() {
        let mut wheel = TimerWheel::new();
        let handle_cell: Rc<RefCell<Option<TimerHandle>>> = Rc::new(RefCell::new(None));
        let hc = handle_cell.clone();
        let t = wheel.add(move |wheel: &mut TimerWheel| {
            let h = hc.borrow().unwrap();
            wheel.set_delay(h, 1);
        });
        *handle_cell.borrow_mut() = Some(t);
        wheel.set_delay(t, 10);
        wheel.set_periodic(t, 10);

        wheel.now = 10;
        wheel.process_now();
        // The callback's explicit reschedule (now + 1 = 11) wins over the
        // automatic periodic reinsertion (10 + 10 = 20).
        assert_eq!(wheel.deadline(t), Some(11));
    }

    #[test]
    fn disable_preserves_period() {
        let mut wheel = TimerWheel::new();
        let t = wheel.add(|_: &mut TimerWheel| {});
        wheel.set_delay(t, 10);
        wheel.set_periodic(t, 25);
        wheel.disable(t);
        assert!(!wheel.is_enabled(t));
        wheel.enable(t);
        assert!(wheel.is_enabled(t));
    }

    #[test]
    fn set_delay_implicitly_enables() {
        let mut wheel = TimerWheel::new();
        let t = wheel.add(|_: &mut TimerWheel| {});
        assert!(!wheel.is_enabled(t));
        wheel.set_delay(t, 5);
        assert!(wheel.is_enabled(t));
    }

    #[test]
    fn disable_during_processing_is_safe() {
        let mut wheel = TimerWheel::new();
        let other_cell: Rc<RefCell<Option<TimerHandle>>> = Rc::new(RefCell::new(None));
        let oc = other_cell.clone();
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        let t1 = wheel.add(move |wheel: &mut TimerWheel| {
            let other = oc.borrow().unwrap();
            wheel.disable(other);
        });
        let t2 = wheel.add(move |_: &mut TimerWheel| *f.borrow_mut() = true);
        *other_cell.borrow_mut() = Some(t2);

        wheel.set_delay(t1, 5);
        wheel.set_delay(t2, 5);
        wheel.now = 5;
        wheel.process_now();

        assert!(!*fired.borrow());
        assert!(!wheel.is_enabled(t2));
    }
}
