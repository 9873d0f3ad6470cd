//! Runs a single [`EventLoop`] on a dedicated OS thread, handing the caller a
//! handle to it once the loop is constructed and ready.

use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::event_loop::EventLoop;

/// Called once inside the new thread, after its `EventLoop` exists but before
/// `EventLoopThread::new` returns a handle to it. Shared (not `FnOnce`) so a
/// pool can hand the same initializer to every thread it spawns.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

pub struct EventLoopThread {
    loop_handle: Option<EventLoop>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawns the thread and blocks until its `EventLoop` has been created
    /// and is ready to accept `run_in_loop`/`queue_in_loop` calls.
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> io::Result<EventLoopThread> {
        let name = name.into();
        let (tx, rx) = mpsc::sync_channel::<io::Result<EventLoop>>(0);

        let thread = std::thread::Builder::new().name(name).spawn(move || {
            let event_loop = match EventLoop::new(true) {
                Ok(l) => l,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };

            if let Some(cb) = init {
                cb(&event_loop);
            }

            if tx.send(Ok(event_loop.clone())).is_err() {
                return;
            }

            if let Err(e) = event_loop.run() {
                log::error!("EventLoopThread loop exited with error: {e}");
            }
        })?;

        let event_loop = match rx.recv() {
            Ok(result) => result?,
            Err(_) => {
                let _ = thread.join();
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "event loop thread exited before starting its loop",
                ));
            }
        };

        Ok(EventLoopThread {
            loop_handle: Some(event_loop),
            thread: Some(thread),
        })
    }

    /// The loop running on this thread.
    pub fn event_loop(&self) -> &EventLoop {
        self.loop_handle
            .as_ref()
            .expect("event loop present for the thread's whole lifetime")
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = self.loop_handle.take() {
            event_loop.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
