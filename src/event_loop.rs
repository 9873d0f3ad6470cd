//! The reactor: one per thread, driving a [`crate::poller::Demultiplexer`]
//! and dispatching ready [`Channel`]s, timer expirations, and functors queued
//! from other threads.

use std::cell::{Cell, RefCell};
use std::io;
use std::sync::{Arc, Once};
use std::thread::{self, ThreadId};

use crate::channel::Channel;
use crate::eventfd::EventFd;
use crate::poller::{Demultiplexer, MAX_POLL_TIMEOUT_MS};
use crate::time::{Duration, Timestamp};
use crate::timer::{TimerId, TimerQueue};

/// Wraps a boxed functor so it can sit in a cross-thread mailbox.
///
/// Sound because pending functors are only ever *called* by the loop's own
/// thread after being popped out of the mailbox; other threads only move the
/// box in, they never touch its contents.
struct SendableFunctor(Box<dyn FnOnce() + 'static>);
unsafe impl Send for SendableFunctor {}

static SIGPIPE_ONCE: Once = Once::new();

fn ignore_sigpipe_once() {
    SIGPIPE_ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

struct EventLoopInner {
    thread_id: ThreadId,
    demultiplexer: RefCell<Demultiplexer>,
    quit: std::sync::atomic::AtomicBool,
    looping: Cell<bool>,
    event_handling: Cell<bool>,
    calling_pending_functors: Cell<bool>,
    pending_functors: std::sync::Mutex<Vec<SendableFunctor>>,
    iteration: Cell<u64>,
    wakeup_fd: EventFd,
    wakeup_channel: RefCell<Option<Channel>>,
    timer_queue: RefCell<Option<TimerQueue>>,
}

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = Cell::new(false);
}

/// `EventLoopInner`'s `Cell`/`RefCell` fields (including the `Rc`-based
/// `Channel`/`TimerQueue` they hold) are touched only by the thread that owns
/// the loop, enforced at runtime by `assert_in_loop_thread`. The only state
/// genuinely accessed from other threads is `pending_functors` (its own
/// `Mutex`) and `wakeup_fd` (a plain, thread-safe `write(2)`). An `EventLoop`
/// handle living on a foreign thread is only ever dropped there while the
/// owning thread's own handle (kept alive for the loop's whole lifetime by
/// `EventLoopThread`) is still live, so the final, content-dropping decrement
/// of the `Arc` always happens on the owning thread.
unsafe impl Send for EventLoopInner {}
unsafe impl Sync for EventLoopInner {}

/// A single-threaded event loop. Cheap to clone: every clone refers to the
/// same loop and may be handed to other threads, but only the thread that
/// constructed it may call [`EventLoop::run`] or touch a [`Channel`] tied to
/// it directly — other threads may only call the handful of methods this
/// module documents as thread-safe (`queue_in_loop`, `run_in_loop`, `quit`).
#[derive(Clone)]
pub struct EventLoop(Arc<EventLoopInner>);

impl EventLoop {
    /// Creates a loop bound to the calling thread. Panics if another
    /// `EventLoop` already exists on this thread — mirrors the C++ original's
    /// one-loop-per-thread assertion.
    pub fn new(use_epoll: bool) -> io::Result<EventLoop> {
        ignore_sigpipe_once();

        LOOP_IN_THIS_THREAD.with(|flag| {
            if flag.get() {
                panic!("another EventLoop already exists in this thread");
            }
            flag.set(true);
        });

        let demultiplexer = Demultiplexer::new(use_epoll)?;
        let wakeup_fd = EventFd::new()?;

        let inner = Arc::new(EventLoopInner {
            thread_id: thread::current().id(),
            demultiplexer: RefCell::new(demultiplexer),
            quit: std::sync::atomic::AtomicBool::new(false),
            looping: Cell::new(false),
            event_handling: Cell::new(false),
            calling_pending_functors: Cell::new(false),
            pending_functors: std::sync::Mutex::new(Vec::new()),
            iteration: Cell::new(0),
            wakeup_fd,
            wakeup_channel: RefCell::new(None),
            timer_queue: RefCell::new(None),
        });
        let event_loop = EventLoop(inner);

        let wakeup_fd_raw = event_loop.0.wakeup_fd.as_raw_fd();
        let wakeup_channel = Channel::new(&event_loop, wakeup_fd_raw);
        {
            let el = event_loop.clone();
            wakeup_channel.set_read_callback(move |_received_at| {
                if let Err(e) = el.0.wakeup_fd.read() {
                    log::warn!("EventLoop wakeup read failed: {e}");
                }
            });
        }
        wakeup_channel.enable_read();
        *event_loop.0.wakeup_channel.borrow_mut() = Some(wakeup_channel);

        let timer_queue = TimerQueue::new(&event_loop)?;
        *event_loop.0.timer_queue.borrow_mut() = Some(timer_queue);

        Ok(event_loop)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.0.thread_id
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop used from a thread other than the one that created it: {:?} != {:?}",
                thread::current().id(),
                self.0.thread_id
            );
        }
    }

    /// Runs until [`EventLoop::quit`] is called. Must be called from the
    /// loop's own thread.
    pub fn run(&self) -> io::Result<()> {
        self.assert_in_loop_thread();
        assert!(!self.0.looping.get(), "EventLoop::run called re-entrantly");
        self.0.looping.set(true);
        self.0.quit.store(false, std::sync::atomic::Ordering::SeqCst);
        log::trace!("EventLoop starting");

        while !self.0.quit.load(std::sync::atomic::Ordering::SeqCst) {
            let mut active_channels = Vec::new();
            let poll_return_time = {
                let mut demux = self.0.demultiplexer.borrow_mut();
                demux.poll(MAX_POLL_TIMEOUT_MS, &mut active_channels)?
            };
            self.0.iteration.set(self.0.iteration.get() + 1);

            self.0.event_handling.set(true);
            for channel in &active_channels {
                channel.handle_event(poll_return_time);
            }
            self.0.event_handling.set(false);

            self.do_pending_functors();
        }

        log::trace!("EventLoop stopping");
        self.0.looping.set(false);
        Ok(())
    }

    /// Requests the loop to stop after its current iteration. Safe to call
    /// from any thread.
    pub fn quit(&self) {
        self.0.quit.store(true, std::sync::atomic::Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `f` synchronously if already on the loop thread, otherwise queues
    /// it to run on the next iteration.
    pub fn run_in_loop(&self, f: impl FnOnce() + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Queues `f` to run on the loop thread on its next iteration, waking the
    /// loop if necessary. Callable from any thread.
    pub fn queue_in_loop(&self, f: impl FnOnce() + 'static) {
        self.0
            .pending_functors
            .lock()
            .unwrap()
            .push(SendableFunctor(Box::new(f)));

        if !self.is_in_loop_thread() || self.0.calling_pending_functors.get() {
            self.wakeup();
        }
    }

    fn do_pending_functors(&self) {
        let functors = std::mem::take(&mut *self.0.pending_functors.lock().unwrap());
        self.0.calling_pending_functors.set(true);
        for functor in functors {
            (functor.0)();
        }
        self.0.calling_pending_functors.set(false);
    }

    fn wakeup(&self) {
        if let Err(e) = self.0.wakeup_fd.write_one() {
            log::warn!("EventLoop::wakeup failed: {e}");
        }
    }

    fn timer_queue(&self) -> TimerQueue {
        self.0
            .timer_queue
            .borrow()
            .clone()
            .expect("timer queue initialized during EventLoop::new")
    }

    /// Schedules `callback` to run at `at`. Unlike `run_in_loop`/`queue_in_loop`,
    /// this touches the loop's `TimerQueue` directly and so must be called
    /// from the loop thread.
    pub fn run_at(&self, at: Timestamp, callback: impl FnMut() + 'static) -> TimerId {
        self.assert_in_loop_thread();
        self.timer_queue().add_timer(at, callback)
    }

    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + 'static) -> TimerId {
        self.run_at(Timestamp::now() + delay, callback)
    }

    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + 'static) -> TimerId {
        self.assert_in_loop_thread();
        self.timer_queue()
            .add_repeating_timer(Timestamp::now() + interval, interval, callback)
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.assert_in_loop_thread();
        self.timer_queue().cancel(id);
    }

    pub(crate) fn update_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.0.demultiplexer.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.0.demultiplexer.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.0.demultiplexer.borrow().has_channel(channel)
    }

    pub fn iteration(&self) -> u64 {
        self.0.iteration.get()
    }

    pub fn event_handling(&self) -> bool {
        self.0.event_handling.get()
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread_id", &self.0.thread_id)
            .field("iteration", &self.0.iteration.get())
            .finish()
    }
}
