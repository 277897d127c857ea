//! The control connection itself: authentication, command/reply
//! plumbing, and the reactor task that demultiplexes replies from
//! asynchronous events.

use crate::events::{parse_event, CircuitId, ControlEvent, StreamId};
use crate::proto::{decode_line, LineKind, Reply, ReplyLine, EVENT_CODE};
use crate::{Error, Fingerprint, Result};

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// A not-yet-launched control connection.
///
/// In this state, commands are exchanged synchronously; use it to
/// authenticate, then call [`ControlConn::launch`] to split off the
/// reactor and start receiving asynchronous events.
pub struct ControlConn {
    /// Buffered reader over the read half of the socket.
    reader: BufReader<OwnedReadHalf>,
    /// Write half of the socket.
    writer: OwnedWriteHalf,
}

impl ControlConn {
    /// Open a control connection to `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (r, w) = stream.into_split();
        Ok(ControlConn {
            reader: BufReader::new(r),
            writer: w,
        })
    }

    /// Read one CRLF-terminated line, without its terminator.
    async fn read_line(&mut self) -> Result<String> {
        read_line_from(&mut self.reader).await
    }

    /// Send `cmd` and collect its complete reply.
    ///
    /// Only usable before [`ControlConn::launch`]; afterwards the
    /// reactor owns the read half.
    pub async fn request(&mut self, cmd: &str) -> Result<Reply> {
        self.writer
            .write_all(format!("{}\r\n", cmd).as_bytes())
            .await?;
        self.writer.flush().await?;

        let mut acc = ReplyAccumulator::new();
        loop {
            let line = self.read_line().await?;
            let decoded = decode_line(&line)?;
            if decoded.code == EVENT_CODE {
                // We have not subscribed to anything yet; this would be
                // a protocol violation, but ignoring it is harmless.
                trace!("Ignoring early event: {}", line);
                continue;
            }
            if let Some(reply) = acc.push(decoded) {
                return Ok(reply);
            }
        }
    }

    /// Authenticate to the controller.
    ///
    /// Asks PROTOCOLINFO which methods are available, preferring null
    /// authentication, then cookie authentication with the cookie file
    /// the controller names.
    pub async fn authenticate(&mut self) -> Result<()> {
        let info = self.request("PROTOCOLINFO 1").await?.into_result()?;
        let methods = info.find_value("METHODS").unwrap_or_default();

        if methods.split(',').any(|m| m == "NULL") {
            self.request("AUTHENTICATE").await?.into_result()?;
            debug!("Authenticated to control port (null auth).");
            return Ok(());
        }

        if methods.split(',').any(|m| m == "COOKIE" || m == "SAFECOOKIE") {
            let path = PathBuf::from(info.find_value("COOKIEFILE").ok_or_else(|| {
                Error::Protocol("Controller offered cookie auth without COOKIEFILE".into())
            })?);
            let cookie = tokio::fs::read(&path)
                .await
                .map_err(|err| Error::CookieUnreadable { path, err })?;
            let cmd = format!("AUTHENTICATE {}", hex::encode(cookie));
            self.request(&cmd).await?.into_result()?;
            debug!("Authenticated to control port (cookie auth).");
            return Ok(());
        }

        Err(Error::AuthUnsupported(methods))
    }

    /// Split the connection into a command handle and an event stream,
    /// spawning the reactor task that services both.
    pub fn launch(self) -> (ControlHandle, mpsc::UnboundedReceiver<ControlEvent>) {
        let ControlConn { reader, writer } = self;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(Some(VecDeque::new())),
        });
        let reactor_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            if let Err(e) = run_reactor(reader, &reactor_shared, events_tx).await {
                debug!("Control reactor exiting: {}", e);
            }
            // Wake up anybody still waiting for a reply.
            if let Some(pending) = reactor_shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                drop(pending);
            }
        });
        (ControlHandle { shared }, events_rx)
    }
}

/// State shared between the [`ControlHandle`] and the reactor.
struct Shared {
    /// The write half, serialized so concurrent commands cannot
    /// interleave their bytes.
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// Reply slots for commands in flight, in send order.  The
    /// controller answers commands in order, so FIFO completion is
    /// correct.  `None` once the connection has died.
    pending: Mutex<Option<VecDeque<oneshot::Sender<Reply>>>>,
}

/// A cloneable handle for issuing control-port commands.
#[derive(Clone)]
pub struct ControlHandle {
    /// Shared connection state.
    shared: Arc<Shared>,
}

impl ControlHandle {
    /// Send one command and wait for its reply.
    ///
    /// A negative reply (4xx/5xx) is returned as [`Error::Rejected`].
    pub async fn command(&self, cmd: &str) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        {
            // Register the reply slot while holding the write lock, so
            // the pending queue order matches the wire order.
            let mut writer = self.shared.writer.lock().await;
            {
                let mut pending = self
                    .shared
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                match pending.as_mut() {
                    Some(q) => q.push_back(tx),
                    None => return Err(Error::ConnectionClosed),
                }
            }
            writer
                .write_all(format!("{}\r\n", cmd).as_bytes())
                .await?;
            writer.flush().await?;
        }
        let reply = rx.await.map_err(|_| Error::ConnectionClosed)?;
        reply.into_result()
    }

    /// Set a single configuration option.
    pub async fn set_conf(&self, key: &str, value: &str) -> Result<()> {
        self.command(&format!("SETCONF {}=\"{}\"", key, value))
            .await?;
        Ok(())
    }

    /// Subscribe to the given event types, replacing any previous
    /// subscription.
    pub async fn set_events(&self, events: &[&str]) -> Result<()> {
        self.command(&format!("SETEVENTS {}", events.join(" ")))
            .await?;
        Ok(())
    }

    /// Ask the client to build a new circuit through `path`.
    ///
    /// Returns the circuit id the client assigned.
    pub async fn extend_circuit(&self, path: &[Fingerprint]) -> Result<CircuitId> {
        let spec = path
            .iter()
            .map(|fp| format!("${}", fp))
            .collect::<Vec<_>>()
            .join(",");
        let reply = self.command(&format!("EXTENDCIRCUIT 0 {}", spec)).await?;
        // Reply shape: "EXTENDED <circuit id>"
        let mut words = reply.first_line().split_ascii_whitespace();
        match (words.next(), words.next()) {
            (Some("EXTENDED"), Some(id)) => Ok(CircuitId::new(id)),
            _ => Err(Error::Protocol(format!(
                "Unexpected EXTENDCIRCUIT reply: {:?}",
                reply.first_line()
            ))),
        }
    }

    /// Attach `stream` to `circuit`.
    pub async fn attach_stream(&self, stream: &StreamId, circuit: &CircuitId) -> Result<()> {
        self.command(&format!("ATTACHSTREAM {} {}", stream, circuit))
            .await?;
        Ok(())
    }

    /// Close a circuit we are done with.
    pub async fn close_circuit(&self, circuit: &CircuitId) -> Result<()> {
        self.command(&format!("CLOSECIRCUIT {}", circuit)).await?;
        Ok(())
    }
}

/// Accumulates reply lines until a final line completes the reply.
struct ReplyAccumulator {
    /// Lines collected so far.
    lines: Vec<String>,
    /// Whether we are inside a dot-terminated data block.
    in_data: bool,
}

impl ReplyAccumulator {
    /// Create an empty accumulator.
    fn new() -> Self {
        ReplyAccumulator {
            lines: Vec::new(),
            in_data: false,
        }
    }

    /// Add a raw data-block line; returns true while still in the block.
    fn push_data(&mut self, line: &str) -> bool {
        if line == "." {
            self.in_data = false;
        } else if let Some(last) = self.lines.last_mut() {
            last.push('\n');
            last.push_str(line);
        }
        self.in_data
    }

    /// Add a decoded line; returns the completed reply on a final line.
    fn push(&mut self, line: ReplyLine) -> Option<Reply> {
        self.lines.push(line.text);
        match line.kind {
            LineKind::Middle => None,
            LineKind::Data => {
                self.in_data = true;
                None
            }
            LineKind::Final => Some(Reply {
                code: line.code,
                lines: std::mem::take(&mut self.lines),
            }),
        }
    }
}

/// Read one CRLF-terminated line from `reader`.
async fn read_line_from(reader: &mut BufReader<OwnedReadHalf>) -> Result<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(Error::ConnectionClosed);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// The reactor: reads the socket forever, completing pending replies and
/// forwarding asynchronous events.
async fn run_reactor(
    mut reader: BufReader<OwnedReadHalf>,
    shared: &Shared,
    events_tx: mpsc::UnboundedSender<ControlEvent>,
) -> Result<()> {
    let mut acc = ReplyAccumulator::new();
    loop {
        let line = read_line_from(&mut reader).await?;

        if acc.in_data {
            acc.push_data(&line);
            continue;
        }

        let decoded = decode_line(&line)?;
        if decoded.code == EVENT_CODE {
            // CIRC and STREAM events are single 650-lines; richer events
            // we did not subscribe to may continue, and we skip those
            // continuations when they arrive as non-final lines.
            if decoded.kind != LineKind::Final {
                trace!("Skipping multi-line event fragment: {}", line);
                continue;
            }
            match parse_event(&decoded.text) {
                Ok(ev) => {
                    if events_tx.send(ev).is_err() {
                        // Nobody is listening any more; keep servicing
                        // command replies regardless.
                        trace!("Event receiver dropped.");
                    }
                }
                Err(e) => warn!("Ignoring unparseable event: {}", e),
            }
            continue;
        }

        if let Some(reply) = acc.push(decoded) {
            let slot = {
                let mut pending = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.as_mut().and_then(VecDeque::pop_front)
            };
            match slot {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => warn!("Reply with no command outstanding: {:?}", reply.first_line()),
            }
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// A scripted controller: answers every command with canned replies,
    /// then emits a burst of events.
    async fn fake_controller(listener: TcpListener) {
        let (mut sock, _) = listener.accept().await.unwrap();
        let (r, mut w) = sock.split();
        let mut r = tokio::io::BufReader::new(r);
        let mut line = String::new();

        // AUTHENTICATE
        r.read_line(&mut line).await.unwrap();
        w.write_all(b"250 OK\r\n").await.unwrap();

        // EXTENDCIRCUIT
        line.clear();
        r.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("EXTENDCIRCUIT 0 $"));
        w.write_all(b"250 EXTENDED 42\r\n").await.unwrap();

        // An event interleaved with the next command's reply.
        line.clear();
        r.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("ATTACHSTREAM"));
        w.write_all(b"650 CIRC 42 BUILT $0123456789ABCDEF0123456789ABCDEF01234567\r\n")
            .await
            .unwrap();
        w.write_all(b"552 Unknown stream \"7\"\r\n").await.unwrap();
        w.flush().await.unwrap();

        // Hold the socket open until the client is done.
        let mut buf = [0_u8; 64];
        let _ = r.read(&mut buf).await;
    }

    #[tokio::test]
    async fn command_reply_and_event_demux() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(fake_controller(listener));

        let mut conn = ControlConn::connect(addr).await.unwrap();
        conn.request("AUTHENTICATE").await.unwrap();
        let (handle, mut events) = conn.launch();

        let fp: Fingerprint = "0123456789ABCDEF0123456789ABCDEF01234567".parse().unwrap();
        let circ = handle.extend_circuit(&[fp, fp]).await.unwrap();
        assert_eq!(circ.as_str(), "42");

        let err = handle
            .attach_stream(&StreamId::new("7"), &circ)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected { code: 552, .. }));

        match events.recv().await.unwrap() {
            ControlEvent::Circ(ev) => {
                assert_eq!(ev.id.as_str(), "42");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        drop(handle);
        server.abort();
    }
}
