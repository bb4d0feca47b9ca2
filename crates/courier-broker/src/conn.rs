use std::io;

use courier_wire::FrameBuf;
use mio::{Interest, Registry, Token, net::TcpStream};
use tracing::debug;

/// One accepted socket and its inbound framing state.
///
/// A connection is *pending* from accept until its first valid `CONNECT` is
/// processed, after which it is bound to a client by name. The inbound
/// buffer is bounded by the broker's request cap; overflow drops the
/// accumulated bytes without closing the connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    inbound: FrameBuf,
    client: Option<String>,
    /// True if WRITABLE interest is currently registered for this stream.
    /// Held exactly while the bound client has queued outbound bytes.
    writable_armed: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, inbound_limit: usize) -> Self {
        Self {
            stream,
            inbound: FrameBuf::with_limit(inbound_limit),
            client: None,
            writable_armed: false,
        }
    }

    #[inline]
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    #[inline]
    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.client.is_none()
    }

    pub fn bind_client(&mut self, name: &str) {
        self.client = Some(name.to_owned());
    }

    /// Feed freshly read bytes through the inbound framer.
    pub fn extract_frames(&mut self, chunk: &[u8]) -> Vec<String> {
        self.inbound.extend(chunk)
    }

    /// Register WRITABLE interest on the empty-to-nonempty queue transition.
    pub fn arm_writable(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        if !self.writable_armed {
            registry.reregister(&mut self.stream, token, Interest::READABLE | Interest::WRITABLE)?;
            self.writable_armed = true;
        }
        Ok(())
    }

    /// Drop WRITABLE interest once the queue has fully drained.
    pub fn disarm_writable(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        if self.writable_armed {
            registry.reregister(&mut self.stream, token, Interest::READABLE)?;
            self.writable_armed = false;
        }
        Ok(())
    }

    /// Deregister from the poller and shut the socket down.
    pub fn close(mut self, registry: &Registry) {
        if let Err(err) = registry.deregister(&mut self.stream) {
            debug!(?err, "deregister connection");
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Set SO_KEEPALIVE on an accepted stream. mio does not expose this option,
/// so it goes through `setsockopt` directly.
pub(crate) fn set_keepalive(stream: &TcpStream) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let on: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &on as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
