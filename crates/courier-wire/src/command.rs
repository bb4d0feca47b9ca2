/// Longest client name the broker will bind a session to.
pub const MAX_NAME_LEN: usize = 64;

/// One parsed wire command.
///
/// The grammar is a single uppercase command word, then space-separated
/// arguments. For `PUBLISH` the payload is everything after the topic,
/// preserved byte-for-byte (it may contain spaces, or be empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { name: String },
    Disconnect,
    Publish { topic: String, data: String },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

impl Command {
    /// Parse one frame body.
    ///
    /// Returns `None` for unknown command words, missing or empty required
    /// arguments, and names over [`MAX_NAME_LEN`]. Splitting is on single
    /// spaces, never on whitespace runs: `PUBLISH  t` has an empty topic and
    /// is rejected.
    pub fn parse(line: &str) -> Option<Self> {
        let (word, rest) = line.split_once(' ').map_or((line, ""), |(w, r)| (w, r));
        match word {
            "CONNECT" => {
                let name = first_arg(rest)?;
                if name.chars().count() > MAX_NAME_LEN {
                    return None;
                }
                Some(Self::Connect { name: name.to_owned() })
            }
            // Trailing junk after the command word is tolerated and ignored.
            "DISCONNECT" => Some(Self::Disconnect),
            "PUBLISH" => {
                let (topic, data) = rest.split_once(' ').map_or((rest, ""), |(t, d)| (t, d));
                if topic.is_empty() {
                    return None;
                }
                Some(Self::Publish { topic: topic.to_owned(), data: data.to_owned() })
            }
            "SUBSCRIBE" => first_arg(rest).map(|t| Self::Subscribe { topic: t.to_owned() }),
            "UNSUBSCRIBE" => first_arg(rest).map(|t| Self::Unsubscribe { topic: t.to_owned() }),
            _ => None,
        }
    }

    /// The wire form of this command, without the frame delimiter.
    pub fn encode(&self) -> String {
        match self {
            Self::Connect { name } => format!("CONNECT {name}"),
            Self::Disconnect => "DISCONNECT".to_owned(),
            Self::Publish { topic, data } => format!("PUBLISH {topic} {data}"),
            Self::Subscribe { topic } => format!("SUBSCRIBE {topic}"),
            Self::Unsubscribe { topic } => format!("UNSUBSCRIBE {topic}"),
        }
    }
}

/// First space-separated token of `rest`, if nonempty.
fn first_arg(rest: &str) -> Option<&str> {
    let arg = rest.split(' ').next().unwrap_or("");
    if arg.is_empty() { None } else { Some(arg) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_commands() {
        assert_eq!(
            Command::parse("CONNECT alice"),
            Some(Command::Connect { name: "alice".into() })
        );
        assert_eq!(Command::parse("DISCONNECT"), Some(Command::Disconnect));
        assert_eq!(
            Command::parse("PUBLISH weather sunny"),
            Some(Command::Publish { topic: "weather".into(), data: "sunny".into() })
        );
        assert_eq!(
            Command::parse("SUBSCRIBE weather"),
            Some(Command::Subscribe { topic: "weather".into() })
        );
        assert_eq!(
            Command::parse("UNSUBSCRIBE weather"),
            Some(Command::Unsubscribe { topic: "weather".into() })
        );
    }

    #[test]
    fn publish_data_preserved_verbatim() {
        assert_eq!(
            Command::parse("PUBLISH t a b  c "),
            Some(Command::Publish { topic: "t".into(), data: "a b  c ".into() })
        );
        // Payload may be empty entirely.
        assert_eq!(
            Command::parse("PUBLISH t"),
            Some(Command::Publish { topic: "t".into(), data: String::new() })
        );
    }

    #[test]
    fn single_space_splitting() {
        // Two spaces mean an empty first argument, which is invalid.
        assert_eq!(Command::parse("PUBLISH  t"), None);
        assert_eq!(Command::parse("SUBSCRIBE  t"), None);
        assert_eq!(Command::parse("CONNECT "), None);
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("HELLO world"), None);
        assert_eq!(Command::parse("connect alice"), None);
        assert_eq!(Command::parse("CONNECT"), None);
        assert_eq!(Command::parse("SUBSCRIBE"), None);
    }

    #[test]
    fn rejects_oversized_name() {
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(Command::parse(&format!("CONNECT {long}")), None);
        let max = "x".repeat(MAX_NAME_LEN);
        assert!(Command::parse(&format!("CONNECT {max}")).is_some());
    }

    #[test]
    fn extra_arguments_ignored() {
        assert_eq!(
            Command::parse("CONNECT alice bob"),
            Some(Command::Connect { name: "alice".into() })
        );
        assert_eq!(
            Command::parse("SUBSCRIBE a b"),
            Some(Command::Subscribe { topic: "a".into() })
        );
        assert_eq!(Command::parse("DISCONNECT now"), Some(Command::Disconnect));
    }

    #[test]
    fn encode_roundtrips() {
        for line in ["CONNECT alice", "DISCONNECT", "PUBLISH t a b", "SUBSCRIBE t", "UNSUBSCRIBE t"]
        {
            let cmd = Command::parse(line).unwrap();
            assert_eq!(cmd.encode(), line);
        }
    }
}
