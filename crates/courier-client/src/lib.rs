use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    time::Duration,
};

use courier_wire::{Command, EOM, FrameBuf, MAX_NAME_LEN, frame};
use thiserror::Error;
use tracing::debug;

/// Cap on buffered undelimited bytes from the broker.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024;

const BUFFER_SIZE: usize = 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("client name must be between 1 and 64 characters")]
    InvalidName,
    #[error("name already taken")]
    NameTaken,
    #[error("topic must not be empty")]
    EmptyTopic,
    #[error("unexpected reply from server: {0}")]
    UnexpectedReply(String),
    #[error("server closed the connection")]
    ServerClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How the broker answered a `CONNECT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Greeting {
    /// Fresh session.
    Accepted,
    /// Reconnected within the lost window; `topics` are the retained
    /// subscriptions.
    Restored { topics: Vec<String> },
}

/// One published message as received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub data: String,
}

impl Delivery {
    fn parse(line: &str) -> Self {
        let (topic, data) = line.split_once(' ').map_or((line, ""), |(t, d)| (t, d));
        Self { topic: topic.to_owned(), data: data.to_owned() }
    }
}

/// Blocking broker client.
///
/// Deliveries arrive on the same socket as command replies; either pull
/// them with [`recv`](Self::recv), or move the read side to its own thread
/// with [`incoming`](Self::incoming).
#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
    rx: FrameBuf,
    pending: VecDeque<String>,
    topics: Vec<String>,
}

impl Client {
    /// Connect and run the `CONNECT` handshake.
    ///
    /// The handshake has a 10-second read timeout; afterwards reads block
    /// indefinitely (deliveries arrive whenever someone publishes).
    pub fn connect(host: &str, port: u16, name: &str) -> Result<(Self, Greeting), ClientError> {
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(ClientError::InvalidName);
        }
        let mut stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.write_all(&frame(&Command::Connect { name: name.to_owned() }.encode()))?;

        // The handshake is read raw rather than through the framer: a
        // restored session with no subscriptions sends a bare-delimiter
        // frame, which the framer would drop as empty.
        let mut raw = Vec::new();
        let first = read_delimited(&mut stream, &mut raw)?;
        let greeting = match first.as_str() {
            "OK: Conn accepted" => Greeting::Accepted,
            "ERROR: Name already taken" => return Err(ClientError::NameTaken),
            _ if first == format!("RESTORED {name}") => {
                let topic_line = read_delimited(&mut stream, &mut raw)?;
                let topics: Vec<String> =
                    topic_line.split(' ').filter(|t| !t.is_empty()).map(str::to_owned).collect();
                Greeting::Restored { topics }
            }
            other => return Err(ClientError::UnexpectedReply(other.to_owned())),
        };
        stream.set_read_timeout(None)?;
        debug!(?greeting, "connected");

        let mut client = Self {
            stream,
            rx: FrameBuf::with_limit(MAX_MESSAGE_SIZE),
            pending: VecDeque::new(),
            topics: Vec::new(),
        };
        if let Greeting::Restored { topics } = &greeting {
            client.topics = topics.clone();
        }
        // Deliveries can ride in right behind the greeting; keep them.
        client.pending.extend(client.rx.extend(&raw));
        Ok((client, greeting))
    }

    pub fn subscribe(&mut self, topic: &str) -> Result<(), ClientError> {
        if topic.is_empty() {
            return Err(ClientError::EmptyTopic);
        }
        self.send(&Command::Subscribe { topic: topic.to_owned() })?;
        if !self.topics.iter().any(|t| t == topic) {
            self.topics.push(topic.to_owned());
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, topic: &str) -> Result<(), ClientError> {
        if topic.is_empty() {
            return Err(ClientError::EmptyTopic);
        }
        self.send(&Command::Unsubscribe { topic: topic.to_owned() })?;
        self.topics.retain(|t| t != topic);
        Ok(())
    }

    pub fn publish(&mut self, topic: &str, data: &str) -> Result<(), ClientError> {
        if topic.is_empty() {
            return Err(ClientError::EmptyTopic);
        }
        self.send(&Command::Publish { topic: topic.to_owned(), data: data.to_owned() })?;
        Ok(())
    }

    /// Topics this session believes it is subscribed to.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Block until the next delivery.
    pub fn recv(&mut self) -> Result<Delivery, ClientError> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Delivery::parse(&line));
            }
            let mut buf = [0_u8; BUFFER_SIZE];
            let n = self.stream.read(&mut buf)?;
            if n == 0 {
                return Err(ClientError::ServerClosed);
            }
            self.pending.extend(self.rx.extend(&buf[..n]));
        }
    }

    /// Bound how long [`recv`](Self::recv) blocks; `None` means forever.
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Move the read side (including any frames already buffered) onto a
    /// cloned socket handle, for a dedicated delivery thread.
    pub fn incoming(&mut self) -> io::Result<Incoming> {
        Ok(Incoming {
            stream: self.stream.try_clone()?,
            rx: std::mem::replace(&mut self.rx, FrameBuf::with_limit(MAX_MESSAGE_SIZE)),
            pending: std::mem::take(&mut self.pending),
        })
    }

    /// A handle that can tear the session down from elsewhere, e.g. a
    /// signal handler.
    pub fn disconnector(&self) -> io::Result<Disconnector> {
        Ok(Disconnector { stream: self.stream.try_clone()? })
    }

    /// Tell the broker to forget this session and close the socket. The
    /// broker removes the session immediately; there is no lost window
    /// after an explicit disconnect.
    pub fn disconnect(mut self) -> Result<(), ClientError> {
        self.send(&Command::Disconnect)?;
        self.stream.shutdown(Shutdown::Both)?;
        Ok(())
    }

    fn send(&mut self, command: &Command) -> io::Result<()> {
        self.stream.write_all(&frame(&command.encode()))
    }
}

/// The read half of a [`Client`], detached via [`Client::incoming`].
pub struct Incoming {
    stream: TcpStream,
    rx: FrameBuf,
    pending: VecDeque<String>,
}

impl Incoming {
    /// Block until the next delivery.
    pub fn recv(&mut self) -> Result<Delivery, ClientError> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Delivery::parse(&line));
            }
            let mut buf = [0_u8; BUFFER_SIZE];
            let n = self.stream.read(&mut buf)?;
            if n == 0 {
                return Err(ClientError::ServerClosed);
            }
            self.pending.extend(self.rx.extend(&buf[..n]));
        }
    }
}

/// Best-effort session teardown, clonable off a live [`Client`].
pub struct Disconnector {
    stream: TcpStream,
}

impl Disconnector {
    pub fn disconnect(&self) {
        let _ = (&self.stream).write_all(&frame(&Command::Disconnect.encode()));
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Read one whole frame during the handshake, where even an empty frame is
/// meaningful. Consumed bytes are drained from `raw`; over-read bytes stay
/// for the caller.
fn read_delimited(stream: &mut TcpStream, raw: &mut Vec<u8>) -> Result<String, ClientError> {
    loop {
        if let Some(pos) = raw.windows(EOM.len()).position(|w| w == EOM) {
            let body: Vec<u8> = raw.drain(..pos).collect();
            raw.drain(..EOM.len());
            return String::from_utf8(body)
                .map_err(|_| ClientError::UnexpectedReply("<invalid utf-8>".to_owned()));
        }
        let mut buf = [0_u8; BUFFER_SIZE];
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(ClientError::ServerClosed);
        }
        raw.extend_from_slice(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, thread};

    use courier_wire::frame_into;

    use super::*;

    /// Accept one connection, capture the client's first write, send the
    /// scripted reply and keep the socket open until the test finishes.
    fn scripted_server(reply: Vec<u8>) -> (u16, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut got = vec![0_u8; 256];
            let n = stream.read(&mut got).unwrap();
            got.truncate(n);
            stream.write_all(&reply).unwrap();
            // Hold the socket open briefly so the client side never races
            // an early close during the handshake.
            thread::sleep(Duration::from_millis(100));
            got
        });
        (port, handle)
    }

    #[test]
    fn handshake_accepted() {
        let (port, server) = scripted_server(frame("OK: Conn accepted"));
        let (_, greeting) = Client::connect("127.0.0.1", port, "alice").unwrap();
        assert_eq!(greeting, Greeting::Accepted);
        assert_eq!(server.join().unwrap(), b"CONNECT alice\n\nx");
    }

    #[test]
    fn handshake_restored_with_topics() {
        let mut reply = frame("RESTORED bob");
        frame_into(&mut reply, b"weather sports");
        let (port, _server) = scripted_server(reply);
        let (client, greeting) = Client::connect("127.0.0.1", port, "bob").unwrap();
        assert_eq!(
            greeting,
            Greeting::Restored { topics: vec!["weather".to_owned(), "sports".to_owned()] }
        );
        assert_eq!(client.topics(), ["weather", "sports"]);
    }

    #[test]
    fn handshake_restored_without_topics() {
        // No subscriptions: the second frame is a bare delimiter.
        let mut reply = frame("RESTORED bob");
        frame_into(&mut reply, b"");
        let (port, _server) = scripted_server(reply);
        let (client, greeting) = Client::connect("127.0.0.1", port, "bob").unwrap();
        assert_eq!(greeting, Greeting::Restored { topics: vec![] });
        assert!(client.topics().is_empty());
    }

    #[test]
    fn handshake_keeps_early_deliveries() {
        let mut reply = frame("RESTORED bob");
        frame_into(&mut reply, b"weather");
        frame_into(&mut reply, b"weather sunny after rain");
        let (port, _server) = scripted_server(reply);
        let (mut client, _) = Client::connect("127.0.0.1", port, "bob").unwrap();
        let delivery = client.recv().unwrap();
        assert_eq!(delivery.topic, "weather");
        assert_eq!(delivery.data, "sunny after rain");
    }

    #[test]
    fn handshake_name_taken() {
        let (port, _server) = scripted_server(frame("ERROR: Name already taken"));
        let err = Client::connect("127.0.0.1", port, "alice").unwrap_err();
        assert!(matches!(err, ClientError::NameTaken));
    }

    #[test]
    fn handshake_unexpected_reply() {
        let (port, _server) = scripted_server(frame("HOWDY"));
        let err = Client::connect("127.0.0.1", port, "alice").unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedReply(_)));
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(matches!(
            Client::connect("127.0.0.1", 1, "").unwrap_err(),
            ClientError::InvalidName
        ));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            Client::connect("127.0.0.1", 1, &long).unwrap_err(),
            ClientError::InvalidName
        ));
    }

    #[test]
    fn empty_topic_rejected_locally() {
        let (port, _server) = scripted_server(frame("OK: Conn accepted"));
        let (mut client, _) = Client::connect("127.0.0.1", port, "alice").unwrap();
        assert!(matches!(client.subscribe("").unwrap_err(), ClientError::EmptyTopic));
        assert!(matches!(client.publish("", "x").unwrap_err(), ClientError::EmptyTopic));
    }
}
