//! Typed parsing for the asynchronous events the scanner subscribes to.
//!
//! Only CIRC and STREAM events get a structured representation; anything
//! else is passed through as [`ControlEvent::Other`] so the caller can
//! log and ignore it.

use crate::proto::split_quoted;
use crate::{Error, Fingerprint};
use std::fmt::{self, Display, Formatter};

/// A circuit identifier, as assigned by the Tor client.
///
/// Opaque: we only ever echo it back in commands and use it as a map key.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct CircuitId(String);

impl CircuitId {
    /// Wrap a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        CircuitId(id.into())
    }

    /// View the identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CircuitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stream identifier, as assigned by the Tor client.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct StreamId(String);

impl StreamId {
    /// Wrap a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        StreamId(id.into())
    }

    /// View the identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The status of a circuit, from a CIRC event.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CircStatus {
    /// Circuit ID assigned; construction is starting.
    Launched,
    /// One more hop has been completed.
    Extended,
    /// The circuit is complete and usable.
    Built,
    /// Construction failed; the REASON argument says why.
    Failed,
    /// The circuit has been torn down.
    Closed,
    /// A status this crate does not model.
    Unrecognized(String),
}

impl CircStatus {
    /// Parse a status token from a CIRC event.
    fn from_token(tok: &str) -> Self {
        match tok {
            "LAUNCHED" => CircStatus::Launched,
            "EXTENDED" => CircStatus::Extended,
            "BUILT" => CircStatus::Built,
            "FAILED" => CircStatus::Failed,
            "CLOSED" => CircStatus::Closed,
            other => CircStatus::Unrecognized(other.to_owned()),
        }
    }
}

/// The status of a stream, from a STREAM event.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum StreamStatus {
    /// New connection request; the stream is waiting to be attached.
    New,
    /// New resolve request; likewise waiting to be attached.
    NewResolve,
    /// Any other stream status; the scanner ignores these.
    Unrecognized(String),
}

impl StreamStatus {
    /// Parse a status token from a STREAM event.
    fn from_token(tok: &str) -> Self {
        match tok {
            "NEW" => StreamStatus::New,
            "NEWRESOLVE" => StreamStatus::NewResolve,
            other => StreamStatus::Unrecognized(other.to_owned()),
        }
    }
}

/// A parsed CIRC event.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CircEvent {
    /// The circuit this event describes.
    pub id: CircuitId,
    /// Its new status.
    pub status: CircStatus,
    /// The relays on the circuit's path, if the event listed any.
    ///
    /// The client does not always echo the requested path on failure,
    /// which is why the scanner keeps its own circuit registry.
    pub path: Vec<Fingerprint>,
    /// The local reason for a FAILED or CLOSED transition.
    pub reason: Option<String>,
    /// The reason reported by a remote relay, if any.
    pub remote_reason: Option<String>,
}

/// A parsed STREAM event.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct StreamEvent {
    /// The stream this event describes.
    pub id: StreamId,
    /// Its new status.
    pub status: StreamStatus,
    /// The circuit the stream is attached to; `"0"` (unattached) is
    /// reported as `None`.
    pub circuit: Option<CircuitId>,
    /// The destination, as `host:port` or `host` for resolves.
    pub target: String,
    /// The `SOURCE_ADDR` argument: the client-side address and source
    /// port of the connection that opened this stream.
    pub source_addr: Option<String>,
}

impl StreamEvent {
    /// Extract the local source port from `SOURCE_ADDR`.
    ///
    /// This port is the key the attacher uses to pair the stream with
    /// the circuit its probe intends to use.
    pub fn source_port(&self) -> Option<u16> {
        let addr = self.source_addr.as_deref()?;
        let (_, port) = addr.rsplit_once(':')?;
        port.parse().ok()
    }
}

/// Any asynchronous event from the control connection.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ControlEvent {
    /// A circuit status change.
    Circ(CircEvent),
    /// A stream status change.
    Stream(StreamEvent),
    /// An event type the scanner did not subscribe to or does not model.
    Other(String),
}

/// Parse the body of a 650 line (everything after `650 `).
pub fn parse_event(body: &str) -> Result<ControlEvent, Error> {
    let (kind, rest) = body.split_once(' ').unwrap_or((body, ""));
    match kind {
        "CIRC" => parse_circ(rest).map(ControlEvent::Circ),
        "STREAM" => parse_stream(rest).map(ControlEvent::Stream),
        _ => Ok(ControlEvent::Other(body.to_owned())),
    }
}

/// Parse one `$fingerprint=nickname` path entry.
fn parse_path_entry(entry: &str) -> Result<Fingerprint, Error> {
    let fp = entry
        .split(|c| c == '=' || c == '~')
        .next()
        .unwrap_or(entry);
    fp.parse()
}

/// Scan trailing `KEY=VALUE` arguments for one key.
fn find_arg<'a>(words: &[&'a str], key: &str) -> Option<&'a str> {
    words.iter().find_map(|w| {
        w.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix('='))
    })
}

/// Parse the body of a CIRC event.
fn parse_circ(body: &str) -> Result<CircEvent, Error> {
    let words = split_quoted(body);
    let mut it = words.iter();
    let id = it
        .next()
        .ok_or_else(|| Error::Protocol(format!("CIRC event without id: {:?}", body)))?;
    let status = it
        .next()
        .ok_or_else(|| Error::Protocol(format!("CIRC event without status: {:?}", body)))?;

    let mut path = Vec::new();
    if let Some(word) = words.get(2) {
        if word.starts_with('$') {
            for entry in word.split(',') {
                match parse_path_entry(entry) {
                    Ok(fp) => path.push(fp),
                    Err(_) => {
                        return Err(Error::Protocol(format!(
                            "Bad path entry in CIRC event: {:?}",
                            entry
                        )))
                    }
                }
            }
        }
    }

    Ok(CircEvent {
        id: CircuitId::new(*id),
        status: CircStatus::from_token(status),
        path,
        reason: find_arg(&words, "REASON").map(str::to_owned),
        remote_reason: find_arg(&words, "REMOTE_REASON").map(str::to_owned),
    })
}

/// Parse the body of a STREAM event.
fn parse_stream(body: &str) -> Result<StreamEvent, Error> {
    let words = split_quoted(body);
    if words.len() < 4 {
        return Err(Error::Protocol(format!("short STREAM event: {:?}", body)));
    }
    let circuit = match words[2] {
        "0" => None,
        other => Some(CircuitId::new(other)),
    };
    Ok(StreamEvent {
        id: StreamId::new(words[0]),
        status: StreamStatus::from_token(words[1]),
        circuit,
        target: words[3].to_owned(),
        source_addr: find_arg(&words, "SOURCE_ADDR").map(str::to_owned),
    })
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn circ_built() {
        let ev = parse_event(
            "CIRC 4 BUILT $0123456789ABCDEF0123456789ABCDEF01234567=guardy,$89ABCDEF0123456789ABCDEF0123456789ABCDEF~exity \
             BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL TIME_CREATED=2026-01-01T00:00:00",
        )
        .unwrap();
        let ev = match ev {
            ControlEvent::Circ(c) => c,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(ev.id.as_str(), "4");
        assert_eq!(ev.status, CircStatus::Built);
        assert_eq!(ev.path.len(), 2);
        assert_eq!(
            ev.path[1].to_string(),
            "89ABCDEF0123456789ABCDEF0123456789ABCDEF"
        );
        assert!(ev.reason.is_none());
    }

    #[test]
    fn circ_failed_without_path() {
        let ev = parse_event("CIRC 17 FAILED REASON=TIMEOUT").unwrap();
        let ev = match ev {
            ControlEvent::Circ(c) => c,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(ev.status, CircStatus::Failed);
        assert!(ev.path.is_empty());
        assert_eq!(ev.reason.as_deref(), Some("TIMEOUT"));
    }

    #[test]
    fn circ_failed_remote_reason() {
        let ev = parse_event(
            "CIRC 9 FAILED $0123456789ABCDEF0123456789ABCDEF01234567 REASON=DESTROYED REMOTE_REASON=RESOURCELIMIT",
        )
        .unwrap();
        let ev = match ev {
            ControlEvent::Circ(c) => c,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(ev.reason.as_deref(), Some("DESTROYED"));
        assert_eq!(ev.remote_reason.as_deref(), Some("RESOURCELIMIT"));
    }

    #[test]
    fn stream_newresolve() {
        let ev = parse_event(
            "STREAM 33 NEWRESOLVE 0 example.com:0 SOURCE_ADDR=127.0.0.1:41392 PURPOSE=DNS_REQUEST",
        )
        .unwrap();
        let ev = match ev {
            ControlEvent::Stream(s) => s,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(ev.id.as_str(), "33");
        assert_eq!(ev.status, StreamStatus::NewResolve);
        assert!(ev.circuit.is_none());
        assert_eq!(ev.source_port(), Some(41392));
    }

    #[test]
    fn stream_other_status() {
        let ev = parse_event("STREAM 33 SENTCONNECT 8 example.com:80").unwrap();
        match ev {
            ControlEvent::Stream(s) => {
                assert!(matches!(s.status, StreamStatus::Unrecognized(_)));
                assert_eq!(s.source_port(), None);
                assert_eq!(s.circuit.unwrap().as_str(), "8");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unmodeled_event() {
        match parse_event("BW 12345 67890").unwrap() {
            ControlEvent::Other(body) => assert!(body.starts_with("BW")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
