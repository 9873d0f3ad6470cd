//! A single-host, multi-reactor TCP networking runtime.
//!
//! An [`EventLoop`] is a single-threaded reactor: it blocks in a
//! [`poller::Demultiplexer`] (epoll or poll, chosen by [`Config`] or
//! [`EventLoop::new`]'s argument), dispatches ready [`Channel`]s, runs
//! expired timers, and drains a cross-thread task queue, once per iteration.
//!
//! [`net::TcpServer`] spreads accepted connections across an
//! [`EventLoopThreadPool`] round-robin; [`net::TcpClient`] connects (with
//! exponential-backoff retry via an internal `Connector`) on a single loop.
//! Both hand the application a [`net::TcpConnection`], a buffered,
//! callback-driven per-connection pipeline with high-water-mark
//! backpressure.
//!
//! Nothing in this crate spawns threads on your behalf beyond what
//! [`EventLoopThreadPool::start`] is explicitly told to create — a lone
//! `EventLoop` on the calling thread is the default.

mod buffer;
mod channel;
pub mod config;
mod endpoint;
mod error;
mod event_loop;
mod event_loop_thread;
mod event_loop_thread_pool;
mod eventfd;
pub mod net;
mod poller;
mod socket;
mod time;
mod timer;
mod timerfd;

pub use buffer::Buffer;
pub use channel::Channel;
pub use config::Config;
pub use endpoint::Endpoint;
pub use error::{ConfigError, InvalidAddress};
pub use event_loop::EventLoop;
pub use event_loop_thread::{EventLoopThread, ThreadInitCallback};
pub use event_loop_thread_pool::EventLoopThreadPool;
pub use poller::Demultiplexer;
pub use socket::Socket;
pub use time::{Duration, Timestamp};
pub use timer::{TimerId, TimerQueue};
