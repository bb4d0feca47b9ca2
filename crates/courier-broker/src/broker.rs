use std::{
    io::{self, Read, Write},
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use courier_wire::{Command, frame, frame_into};
use indexmap::IndexMap;
use mio::{Events, Interest, Poll, Token, net::TcpListener};
use tracing::{debug, info, trace, warn};

use crate::{
    client::ClientRecord,
    conn::{Connection, set_keepalive},
    repeater::Repeater,
    soft_panic,
    topics::TopicIndex,
};

const LISTENER: Token = Token(0);

/// The broker engine: a single-threaded readiness loop over one listening
/// socket and every client connection.
///
/// All state lives on this struct and is only touched between poll waits,
/// so no part of it needs locking. Sessions move through a small state
/// machine: an accepted connection is *pending* until its first valid
/// `CONNECT`; a bound client whose socket closes becomes *lost* and keeps
/// its subscriptions and queued bytes until the same name reconnects or the
/// lost window expires.
pub struct Broker {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    next_token: usize,

    /// Every open connection, pending or bound.
    conns: IndexMap<Token, Connection>,
    /// Every session, connected or lost, keyed by name. Name uniqueness
    /// across both substates falls out of the single map.
    clients: IndexMap<String, ClientRecord>,
    topics: TopicIndex,

    lost_timeout: Duration,
    sweep: Repeater,
}

impl Broker {
    /// Bytes read from or written to a socket per call.
    pub const BUFFER_SIZE: usize = 1024;
    /// Cap on buffered undelimited inbound bytes per connection.
    pub const MAX_REQUEST_SIZE: usize = 10 * Self::BUFFER_SIZE;
    /// How long a lost session awaits reconnection before removal.
    pub const LOST_TIMEOUT: Duration = Duration::from_secs(60);

    const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
    const POLL_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        info!(%addr, "broker listening");
        Ok(Self {
            poll,
            events: Events::with_capacity(128),
            listener,
            next_token: LISTENER.0 + 1,
            conns: IndexMap::new(),
            clients: IndexMap::new(),
            topics: TopicIndex::default(),
            lost_timeout: Self::LOST_TIMEOUT,
            sweep: Repeater::every(Self::SWEEP_INTERVAL),
        })
    }

    /// Shorten (or lengthen) the lost-client retention window.
    pub fn with_lost_timeout(mut self, timeout: Duration) -> Self {
        self.lost_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Drive the loop until `shutdown` is observed set. The flag is
    /// rechecked after every poll wait (at most one second), and the loop
    /// exits without draining queued bytes.
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            self.tick()?;
        }
        info!("broker stopping");
        Ok(())
    }

    /// One poll wait plus the dispatch of everything it surfaced.
    fn tick(&mut self) -> io::Result<()> {
        if let Err(err) = self.poll.poll(&mut self.events, Some(Self::POLL_TIMEOUT)) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            if token == LISTENER {
                self.accept_pending();
                continue;
            }
            if !self.conns.contains_key(&token) {
                // Connection dropped earlier in this same tick.
                trace!(token = token.0, "stale event");
                continue;
            }
            // Reads drain before writes for the same descriptor.
            if readable {
                self.handle_readable(token);
            }
            if writable && self.conns.contains_key(&token) {
                self.handle_writable(token);
            }
        }

        if self.clients.values().any(|c| !c.is_connected()) && self.sweep.fired() {
            self.sweep_lost();
        }
        Ok(())
    }

    /// Accept every queued connection; mio is edge-triggered, so stopping
    /// short of `WouldBlock` would strand peers until the next arrival.
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(?err, "set nodelay");
                    }
                    set_keepalive(&stream);
                    if let Err(err) =
                        self.poll.registry().register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(?err, "register accepted connection");
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                        continue;
                    }
                    info!(token = token.0, %peer_addr, "connection registered");
                    self.conns.insert(token, Connection::new(stream, Self::MAX_REQUEST_SIZE));
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(?err, "accept");
                    break;
                }
            }
        }
    }

    /// Read until `WouldBlock`, framing as we go and feeding each complete
    /// frame to the command processor. A zero-byte read means the peer
    /// closed.
    fn handle_readable(&mut self, token: Token) {
        let mut buf = [0_u8; Self::BUFFER_SIZE];
        loop {
            let Some(conn) = self.conns.get_mut(&token) else { return };
            match conn.stream_mut().read(&mut buf) {
                Ok(0) => {
                    self.peer_closed(token);
                    return;
                }
                Ok(n) => {
                    let frames = conn.extract_frames(&buf[..n]);
                    for line in frames {
                        self.process_frame(token, &line);
                        if !self.conns.contains_key(&token) {
                            return;
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(token = token.0, ?err, "read failed");
                    self.peer_closed(token);
                    return;
                }
            }
        }
    }

    /// Flush the bound client's queue until it drains or the kernel blocks.
    /// Unwritten tails go back to the front of the queue and wait for the
    /// next writable edge; write interest is dropped only once fully
    /// drained.
    fn handle_writable(&mut self, token: Token) {
        let Some(name) = self.bound_client(token) else { return };
        loop {
            let Some(client) = self.clients.get_mut(&name) else { return };
            if !client.has_outbound() {
                if let Some(conn) = self.conns.get_mut(&token)
                    && let Err(err) = conn.disarm_writable(self.poll.registry(), token)
                {
                    debug!(?err, "disarm writable");
                }
                return;
            }
            let (chunk, _remaining) = client.dequeue_chunk(Self::BUFFER_SIZE);
            let Some(conn) = self.conns.get_mut(&token) else { return };
            match conn.stream_mut().write(&chunk) {
                Ok(n) if n == chunk.len() => {}
                Ok(n) => {
                    self.requeue(&name, &chunk[n..]);
                    return;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.requeue(&name, &chunk);
                    return;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                    self.requeue(&name, &chunk);
                }
                Err(err) => {
                    debug!(token = token.0, ?err, "write failed");
                    self.client_lost(token, &name);
                    return;
                }
            }
        }
    }

    fn requeue(&mut self, name: &str, bytes: &[u8]) {
        if let Some(client) = self.clients.get_mut(name) {
            client.requeue_front(bytes);
        }
    }

    fn bound_client(&self, token: Token) -> Option<String> {
        self.conns.get(&token).and_then(|c| c.client().map(str::to_owned))
    }

    /// Interpret one frame against the connection's session state.
    fn process_frame(&mut self, token: Token, line: &str) {
        let cmd = Command::parse(line);

        if self.conns.get(&token).is_some_and(Connection::is_pending) {
            // A pending connection gets exactly one chance: a valid CONNECT.
            match cmd {
                Some(Command::Connect { name }) => self.process_connect(token, &name),
                _ => {
                    debug!(token = token.0, "protocol violation while pending");
                    self.remove_connection(token);
                }
            }
            return;
        }

        match cmd {
            Some(Command::Disconnect) => self.process_disconnect(token),
            Some(Command::Publish { topic, data }) => self.process_publish(&topic, &data),
            Some(Command::Subscribe { topic }) => self.process_subscribe(token, &topic),
            Some(Command::Unsubscribe { topic }) => self.process_unsubscribe(token, &topic),
            // CONNECT on a bound connection and anything unparseable are
            // tolerated without reply.
            Some(Command::Connect { .. }) | None => {}
        }
    }

    fn process_connect(&mut self, token: Token, name: &str) {
        match self.clients.get(name) {
            Some(existing) if existing.is_connected() => {
                info!(name, "connect refused, name taken");
                let reply = frame("ERROR: Name already taken");
                if let Some(conn) = self.conns.get_mut(&token) {
                    let _ = conn.stream_mut().write(&reply);
                }
                self.remove_connection(token);
            }
            Some(_) => self.restore_client(token, name),
            None => self.add_client(token, name),
        }
    }

    fn add_client(&mut self, token: Token, name: &str) {
        let mut client = ClientRecord::new(name, token);
        self.send_reply(token, &mut client, &frame("OK: Conn accepted"));
        if let Some(conn) = self.conns.get_mut(&token) {
            conn.bind_client(name);
        }
        self.clients.insert(name.to_owned(), client);
        info!(name, "client added");
    }

    /// Reconnect within the lost window: rebind the session and send
    /// `RESTORED <name>` plus the retained topic list, as two frames in one
    /// send. No subscriptions means a bare delimiter frame, so the peer's
    /// two-frame parser always lines up.
    fn restore_client(&mut self, token: Token, name: &str) {
        let Some(mut client) = self.clients.swap_remove(name) else { return };
        let topic_list =
            client.topics().iter().map(String::as_str).collect::<Vec<_>>().join(" ");
        let mut reply = frame(&format!("RESTORED {name}"));
        frame_into(&mut reply, topic_list.as_bytes());

        client.restore(token);
        self.send_reply(token, &mut client, &reply);
        if let Some(conn) = self.conns.get_mut(&token) {
            conn.bind_client(name);
        }
        self.clients.insert(name.to_owned(), client);
        info!(name, "client restored");
    }

    /// Write a reply straight to the socket; a blocked or partial write
    /// parks the remainder at the front of the client's queue, ahead of any
    /// retained stream, and arms write interest. Also arms when a restored
    /// session already has bytes waiting.
    fn send_reply(&mut self, token: Token, client: &mut ClientRecord, reply: &[u8]) {
        let Some(conn) = self.conns.get_mut(&token) else { return };
        match conn.stream_mut().write(reply) {
            Ok(n) if n == reply.len() => {}
            Ok(n) => client.requeue_front(&reply[n..]),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                client.requeue_front(reply);
            }
            Err(err) => {
                // The peer is gone; the next read surfaces it.
                debug!(token = token.0, ?err, "reply write failed");
            }
        }
        if client.has_outbound()
            && let Err(err) = conn.arm_writable(self.poll.registry(), token)
        {
            debug!(?err, "arm writable");
        }
    }

    fn process_disconnect(&mut self, token: Token) {
        if let Some(name) = self.bound_client(token) {
            self.remove_client(&name);
        }
    }

    /// Fan a publish out to every subscriber's queue. Recipients whose
    /// queue goes empty-to-nonempty get write interest armed, connected
    /// ones immediately, lost ones when they restore.
    fn process_publish(&mut self, topic: &str, data: &str) {
        debug!(topic, data, "publish");
        let subscribers: Vec<String> =
            self.topics.subscribers(topic).map(str::to_owned).collect();
        if subscribers.is_empty() {
            return;
        }
        let message = frame(&format!("{topic} {data}"));
        for name in subscribers {
            let Some(client) = self.clients.get_mut(&name) else {
                soft_panic!("topic {topic} references unknown client {name}");
                continue;
            };
            let before = client.outbound_len();
            let after = client.enqueue(&message);
            trace!(client = %name, topic, "message enqueued");
            if before == 0
                && after > 0
                && let Some(token) = client.token()
                && let Some(conn) = self.conns.get_mut(&token)
                && let Err(err) = conn.arm_writable(self.poll.registry(), token)
            {
                debug!(?err, "arm writable");
            }
        }
    }

    fn process_subscribe(&mut self, token: Token, topic: &str) {
        let Some(name) = self.bound_client(token) else { return };
        let Some(client) = self.clients.get_mut(&name) else {
            soft_panic!("connection bound to unknown client {name}");
            return;
        };
        if client.subscribe(topic) {
            self.topics.add(topic, &name);
        }
        debug!(client = %name, topic, "subscribed");
    }

    fn process_unsubscribe(&mut self, token: Token, topic: &str) {
        let Some(name) = self.bound_client(token) else { return };
        let Some(client) = self.clients.get_mut(&name) else {
            soft_panic!("connection bound to unknown client {name}");
            return;
        };
        if client.unsubscribe(topic) {
            self.topics.remove(topic, &name);
        }
        debug!(client = %name, topic, "unsubscribed");
    }

    /// The peer closed or the socket died. A bound client becomes lost; a
    /// pending connection is simply dropped.
    fn peer_closed(&mut self, token: Token) {
        match self.bound_client(token) {
            Some(name) => self.client_lost(token, &name),
            None => self.remove_connection(token),
        }
    }

    fn client_lost(&mut self, token: Token, name: &str) {
        if let Some(client) = self.clients.get_mut(name) {
            client.mark_lost();
        }
        self.remove_connection(token);
        info!(name, "client lost");
    }

    /// Permanent removal: unhook the session from the name table and every
    /// topic it subscribed to, then drop its connection if one is still
    /// bound.
    fn remove_client(&mut self, name: &str) {
        let Some(client) = self.clients.swap_remove(name) else { return };
        for topic in client.topics() {
            self.topics.remove(topic, name);
        }
        if let Some(token) = client.token() {
            self.remove_connection(token);
        }
        info!(name, "client removed");
    }

    fn remove_connection(&mut self, token: Token) {
        if let Some(conn) = self.conns.swap_remove(&token) {
            conn.close(self.poll.registry());
            debug!(token = token.0, "connection removed");
        }
    }

    /// Permanently remove every lost client whose window has expired.
    fn sweep_lost(&mut self) {
        let expired: Vec<String> = self
            .clients
            .iter()
            .filter(|(_, c)| c.lost_at().is_some_and(|at| at.elapsed() > self.lost_timeout))
            .map(|(name, _)| name.clone())
            .collect();
        for name in expired {
            debug!(%name, "lost window expired");
            self.remove_client(&name);
        }
    }
}
