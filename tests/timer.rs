//! Scenario 4: a repeating timer fires 5 times at ~100 ms and is cancelled
//! from within its own callback on the 5th firing.

mod support;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::mpsc;
use std::time::Duration as StdDuration;

use multireactor::{Duration, EventLoopThread, Timestamp};

#[test]
fn run_every_fires_five_times_then_cancels() {
    support::init_logging();

    let thread = EventLoopThread::new("timer-test", None).unwrap();
    let event_loop = thread.event_loop().clone();

    let (tx, rx) = mpsc::channel::<Timestamp>();

    event_loop.run_in_loop({
        let event_loop = event_loop.clone();
        move || {
            let count = Rc::new(Cell::new(0u32));
            let timer_id = Rc::new(RefCell::new(None));
            let timer_id_for_cb = timer_id.clone();

            let id = event_loop.run_every(Duration::from_secs_f64(0.1), {
                let event_loop = event_loop.clone();
                move || {
                    let _ = tx.send(Timestamp::now());
                    count.set(count.get() + 1);
                    if count.get() >= 5 {
                        if let Some(id) = timer_id_for_cb.borrow_mut().take() {
                            event_loop.cancel_timer(id);
                        }
                    }
                }
            });
            *timer_id.borrow_mut() = Some(id);
        }
    });

    let mut ticks = Vec::new();
    for _ in 0..5 {
        ticks.push(rx.recv_timeout(StdDuration::from_secs(2)).unwrap());
    }
    assert!(
        rx.recv_timeout(StdDuration::from_millis(300)).is_err(),
        "timer must not fire a 6th time after cancelling itself"
    );

    for pair in ticks.windows(2) {
        let delta = (pair[1] - pair[0]).as_millis_f64();
        assert!((95.0..=150.0).contains(&delta), "consecutive ticks {delta} ms apart");
    }
}
