//! A fixed pool of `EventLoopThread`s, handed out round-robin (or by hash)
//! so a `TcpServer` can spread its connections across reactors.

use std::io;

use crate::event_loop::EventLoop;
use crate::event_loop_thread::{EventLoopThread, ThreadInitCallback};

pub struct EventLoopThreadPool {
    base_loop: EventLoop,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<EventLoop>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: &EventLoop, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop: base_loop.clone(),
            name: name.into(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Must be called before `start`.
    pub fn set_thread_number(&mut self, num: usize) {
        assert!(!self.started);
        self.num_threads = num;
    }

    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> io::Result<()> {
        assert!(!self.started);
        self.base_loop.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let thread_name = format!("{}-{}", self.name, i);
            let thread = EventLoopThread::new(thread_name, init.clone())?;
            self.loops.push(thread.event_loop().clone());
            self.threads.push(thread);
        }

        if self.num_threads == 0 {
            if let Some(cb) = init {
                cb(&self.base_loop);
            }
        }

        Ok(())
    }

    /// Round-robins across the pool, falling back to the base loop if the
    /// pool has no threads.
    pub fn get_next_loop(&mut self) -> EventLoop {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started);

        if self.loops.is_empty() {
            return self.base_loop.clone();
        }

        let next_loop = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        next_loop
    }

    pub fn get_loop_for_hash(&self, hash_code: usize) -> EventLoop {
        self.base_loop.assert_in_loop_thread();
        if self.loops.is_empty() {
            self.base_loop.clone()
        } else {
            self.loops[hash_code % self.loops.len()].clone()
        }
    }

    pub fn get_all_loops(&self) -> Vec<EventLoop> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
