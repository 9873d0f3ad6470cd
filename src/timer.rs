//! Ordered-map timer queue: one-shot and repeating callbacks, all armed
//! against a single [`crate::timerfd::TimerFd`] rather than a timing wheel.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::{Rc, Weak};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::time::{Duration, Timestamp};
use crate::timerfd::TimerFd;

/// Identifies a scheduled timer for [`TimerQueue::cancel`]. Opaque outside
/// this module; carries no ordering or equality guarantees of its own.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TimerId(u64);

struct Timer {
    callback: RefCell<Box<dyn FnMut()>>,
    expiration: Timestamp,
    interval: Duration,
    repeat: bool,
    sequence: u64,
}

impl Timer {
    fn key(&self) -> (Timestamp, u64) {
        (self.expiration, self.sequence)
    }
}

struct TimerQueueInner {
    #[allow(dead_code)]
    event_loop: EventLoop,
    timer_fd: TimerFd,
    #[allow(dead_code)]
    channel: Channel,
    timers: RefCell<BTreeMap<(Timestamp, u64), Timer>>,
    active_ids: RefCell<HashMap<u64, Timestamp>>,
    calling_expired_timers: Cell<bool>,
    canceling_ids: RefCell<HashSet<u64>>,
    next_sequence: Cell<u64>,
}

/// Owns every outstanding timer for one [`EventLoop`]. Never accessed from a
/// thread other than the loop's own; cross-thread scheduling goes through
/// `run_in_loop`.
#[derive(Clone)]
pub struct TimerQueue(Rc<TimerQueueInner>);

impl TimerQueue {
    pub fn new(event_loop: &EventLoop) -> std::io::Result<TimerQueue> {
        let timer_fd = TimerFd::new()?;
        let channel = Channel::new(event_loop, timer_fd.as_raw_fd());

        let inner = Rc::new(TimerQueueInner {
            event_loop: event_loop.clone(),
            timer_fd,
            channel: channel.clone(),
            timers: RefCell::new(BTreeMap::new()),
            active_ids: RefCell::new(HashMap::new()),
            calling_expired_timers: Cell::new(false),
            canceling_ids: RefCell::new(HashSet::new()),
            next_sequence: Cell::new(0),
        });

        let weak: Weak<TimerQueueInner> = Rc::downgrade(&inner);
        channel.set_read_callback(move |received_at| {
            if let Some(inner) = weak.upgrade() {
                TimerQueue(inner).handle_read(received_at);
            }
        });
        channel.enable_read();

        Ok(TimerQueue(inner))
    }

    /// Schedules `callback` to run once at `at`. Thread-safe.
    pub fn add_timer(&self, at: Timestamp, callback: impl FnMut() + 'static) -> TimerId {
        self.schedule(at, Duration::default(), false, callback)
    }

    /// Schedules `callback` to run repeatedly every `interval`, first firing
    /// at `at`. Thread-safe.
    pub fn add_repeating_timer(
        &self,
        at: Timestamp,
        interval: Duration,
        callback: impl FnMut() + 'static,
    ) -> TimerId {
        self.schedule(at, interval, true, callback)
    }

    fn schedule(
        &self,
        at: Timestamp,
        interval: Duration,
        repeat: bool,
        callback: impl FnMut() + 'static,
    ) -> TimerId {
        let sequence = self.0.next_sequence.get();
        self.0.next_sequence.set(sequence + 1);
        let timer = Timer {
            callback: RefCell::new(Box::new(callback)),
            expiration: at,
            interval,
            repeat,
            sequence,
        };
        let id = TimerId(sequence);

        let this = self.clone();
        self.0.event_loop.run_in_loop(move || this.add_timer_in_loop(timer));
        id
    }

    /// Cancels a pending timer. A no-op if it already fired and was not
    /// repeating; a repeating timer cancelled from within its own callback is
    /// recorded so the in-flight expiry pass does not reschedule it.
    pub fn cancel(&self, id: TimerId) {
        let this = self.clone();
        self.0.event_loop.run_in_loop(move || this.cancel_in_loop(id));
    }

    fn add_timer_in_loop(&self, timer: Timer) {
        let key = timer.key();
        self.0.active_ids.borrow_mut().insert(timer.sequence, timer.expiration);
        let earliest_changed = self
            .0
            .timers
            .borrow()
            .keys()
            .next()
            .map(|first| key < *first)
            .unwrap_or(true);
        self.0.timers.borrow_mut().insert(key, timer);

        if earliest_changed {
            self.rearm();
        }
    }

    fn cancel_in_loop(&self, id: TimerId) {
        if let Some(expiration) = self.0.active_ids.borrow_mut().remove(&id.0) {
            self.0.timers.borrow_mut().remove(&(expiration, id.0));
        } else if self.0.calling_expired_timers.get() {
            self.0.canceling_ids.borrow_mut().insert(id.0);
        }
    }

    fn handle_read(&self, received_at: Timestamp) {
        let _ = self.0.timer_fd.read();
        self.0.calling_expired_timers.set(true);
        self.0.canceling_ids.borrow_mut().clear();

        let expired = self.pop_expired(received_at);
        for timer in &expired {
            timer.callback.borrow_mut()();
        }

        self.0.calling_expired_timers.set(false);
        self.reset(expired, received_at);
    }

    fn pop_expired(&self, now: Timestamp) -> Vec<Timer> {
        let boundary = (now, u64::MAX);
        let mut timers = self.0.timers.borrow_mut();
        let expired_keys: Vec<(Timestamp, u64)> = timers.range(..=boundary).map(|(k, _)| *k).collect();

        let mut expired = Vec::with_capacity(expired_keys.len());
        let mut active_ids = self.0.active_ids.borrow_mut();
        for key in expired_keys {
            if let Some(timer) = timers.remove(&key) {
                active_ids.remove(&timer.sequence);
                expired.push(timer);
            }
        }
        expired
    }

    fn reset(&self, expired: Vec<Timer>, now: Timestamp) {
        let canceling = self.0.canceling_ids.borrow();
        for mut timer in expired {
            if timer.repeat && !canceling.contains(&timer.sequence) {
                timer.expiration = if timer.expiration + timer.interval > now {
                    timer.expiration + timer.interval
                } else {
                    now + timer.interval
                };
                let key = timer.key();
                self.0.active_ids.borrow_mut().insert(timer.sequence, timer.expiration);
                self.0.timers.borrow_mut().insert(key, timer);
            }
        }
        drop(canceling);
        self.rearm();
    }

    /// Arms the underlying `timerfd` against the earliest pending timer, or
    /// disarms it entirely once the queue is empty.
    fn rearm(&self) {
        let now = Timestamp::now();
        match self.0.timers.borrow().keys().next() {
            Some((expiration, _)) => {
                let delay = (*expiration - now).max(Duration::from_micros(100));
                if let Err(e) = self.0.timer_fd.arm(delay) {
                    log::error!("TimerQueue::rearm failed: {e}");
                }
            }
            None => {
                if let Err(e) = self.0.timer_fd.disarm() {
                    log::error!("TimerQueue::rearm disarm failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_key_orders_by_expiration_then_sequence() {
        let a = Timer {
            callback: RefCell::new(Box::new(|| {})),
            expiration: Timestamp::from_micros(100),
            interval: Duration::default(),
            repeat: false,
            sequence: 5,
        };
        let b = Timer {
            callback: RefCell::new(Box::new(|| {})),
            expiration: Timestamp::from_micros(100),
            interval: Duration::default(),
            repeat: false,
            sequence: 2,
        };
        assert!(b.key() < a.key());
    }
}
