//! Listens for and accepts new connections on behalf of a `TcpServer`.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::channel::Channel;
use crate::endpoint::Endpoint;
use crate::error::last_os_error;
use crate::event_loop::EventLoop;
use crate::socket::Socket;

type NewConnectionCallback = Box<dyn FnMut(OwnedFd, Endpoint)>;

/// Owns the listening socket and its read-readiness channel. Falls back to
/// an idle reserved descriptor to shed load gracefully once the process runs
/// out of file descriptors.
pub struct Acceptor {
    event_loop: EventLoop,
    socket: Socket,
    channel: Channel,
    connection_callback: std::cell::RefCell<Option<NewConnectionCallback>>,
    idle_fd: std::cell::Cell<RawFd>,
    is_listening: std::cell::Cell<bool>,
}

impl Acceptor {
    pub fn new(event_loop: &EventLoop, listen_addr: Endpoint, reuse_port: bool) -> io::Result<std::rc::Rc<Acceptor>> {
        let socket = Socket::new(listen_addr.as_socket_addr())?;
        let channel = Channel::new(event_loop, socket.as_raw_fd());
        let idle_fd = open_dev_null()?;

        socket.set_reuseaddr(true)?;
        socket.set_reuseport(reuse_port)?;
        socket.bind(listen_addr.as_socket_addr())?;

        let acceptor = std::rc::Rc::new(Acceptor {
            event_loop: event_loop.clone(),
            socket,
            channel: channel.clone(),
            connection_callback: std::cell::RefCell::new(None),
            idle_fd: std::cell::Cell::new(idle_fd),
            is_listening: std::cell::Cell::new(false),
        });

        let weak = std::rc::Rc::downgrade(&acceptor);
        channel.set_read_callback(move |_received_at| {
            if let Some(a) = weak.upgrade() {
                a.handle_read();
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(OwnedFd, Endpoint) + 'static) {
        *self.connection_callback.borrow_mut() = Some(Box::new(cb));
    }

    /// The address actually bound, which may differ from the address passed
    /// to `new` when that address asked for an OS-assigned port (port 0).
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.socket.local_addr()
    }

    pub fn listen(&self) -> io::Result<()> {
        self.event_loop.assert_in_loop_thread();
        self.socket.listen()?;
        self.is_listening.set(true);
        self.channel.enable_read();
        Ok(())
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();
        match self.socket.accept() {
            Ok(Some((fd, peer))) => {
                log::trace!("accept from: {peer}");
                match self.connection_callback.borrow_mut().as_mut() {
                    Some(cb) => cb(fd, peer),
                    None => drop(fd),
                }
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("Acceptor::handle_read accept error: {e}");
                if e.raw_os_error() == Some(libc::EMFILE) {
                    let _ = unsafe { libc::close(self.idle_fd.get()) };
                    let accepted = unsafe {
                        libc::accept(self.socket.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut())
                    };
                    if accepted >= 0 {
                        let _ = unsafe { libc::close(accepted) };
                    }
                    match open_dev_null() {
                        Ok(fd) => self.idle_fd.set(fd),
                        Err(e) => log::error!("Acceptor::handle_read could not reopen idle fd: {e}"),
                    }
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
        let fd = self.idle_fd.get();
        if fd >= 0 {
            let _ = unsafe { libc::close(fd) };
        }
    }
}

fn open_dev_null() -> io::Result<RawFd> {
    const DEV_NULL: &[u8] = b"/dev/null\0";
    let fd = unsafe { libc::open(DEV_NULL.as_ptr() as *const libc::c_char, libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(last_os_error());
    }
    Ok(fd)
}
