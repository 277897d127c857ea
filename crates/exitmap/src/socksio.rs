//! The I/O facade that pins a probe's traffic to its circuit.
//!
//! Every connect or resolve a probe performs goes through the local Tor
//! client's SOCKS port.  The client leaves the resulting stream
//! unattached (`__LeaveStreamsUnattached`), and the kernel-chosen local
//! source port of our SOCKS connection is the correlation key: we tell
//! the scan reactor "source port P belongs to circuit C" *before*
//! sending the request bytes, so that by the time the client announces
//! the new stream (which carries the same source port), the attacher
//! can pair them up.
//!
//! Probes receive this facade as a trait object they close over, which
//! keeps the redirection scoped to the probe instead of the process.

use crate::sink::ProbeStatus;
use crate::worker::WorkerMsg;
use async_trait::async_trait;
use exitmap_control::CircuitId;
use exitmap_socks as socks;
use exitmap_socks::{SocksCmd, SocksReply, SocksStatus};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// An error from a facade operation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SocksIoError {
    /// The local Tor client refused our TCP connection.
    #[error("Connection to the Tor client's SOCKS port was refused")]
    ProxyRefused,

    /// The connection to the local Tor client died mid-exchange.
    #[error("Connection to the Tor client was lost")]
    ConnectionLost,

    /// The SOCKS exchange ended early.
    #[error("Unexpected end of stream during SOCKS exchange")]
    Eof,

    /// The proxy rejected our request with a SOCKS status code.
    #[error("SOCKS request rejected: {}", .0.token())]
    Rejected(SocksStatus),

    /// The proxy violated the SOCKS protocol.
    #[error("SOCKS protocol error")]
    Proto(#[from] socks::Error),

    /// A resolve succeeded but carried no usable IPv4 address.
    #[error("Resolver returned no usable address")]
    NoAddress,

    /// Some other I/O error.
    #[error("I/O error during SOCKS exchange")]
    Io(#[source] std::io::Error),
}

impl SocksIoError {
    /// Classify an I/O error from an established SOCKS connection.
    fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind as K;
        match err.kind() {
            K::UnexpectedEof => SocksIoError::Eof,
            K::ConnectionReset | K::ConnectionAborted | K::BrokenPipe => {
                SocksIoError::ConnectionLost
            }
            _ => SocksIoError::Io(err),
        }
    }

    /// The probe status token this error maps to.
    pub fn status(&self) -> ProbeStatus {
        match self {
            SocksIoError::ProxyRefused => ProbeStatus::TorConnectionRefused,
            SocksIoError::ConnectionLost => ProbeStatus::TorConnectionLost,
            SocksIoError::Eof => ProbeStatus::EofError,
            SocksIoError::Rejected(status) => match status {
                SocksStatus::NotAllowed => ProbeStatus::SocksRulesetBlocked,
                SocksStatus::NetworkUnreachable => ProbeStatus::NetworkUnreachable,
                SocksStatus::HostUnreachable => ProbeStatus::DnsFail,
                SocksStatus::ConnectionRefused => ProbeStatus::ConnectionRefused,
                SocksStatus::TtlExpired => ProbeStatus::TtlExpired,
                SocksStatus::CommandNotSupported => ProbeStatus::SocksCommandUnsupported,
                SocksStatus::AddressTypeNotSupported => ProbeStatus::SocksAddressUnsupported,
                _ => ProbeStatus::SocksGeneralFailure,
            },
            SocksIoError::Proto(_) | SocksIoError::NoAddress => ProbeStatus::Exception,
            SocksIoError::Io(_) => ProbeStatus::TorConnectionLost,
        }
    }
}

/// Network operations available to a probe, pinned to one circuit.
#[async_trait]
pub trait CircuitIo: Send + Sync {
    /// Resolve a hostname at the circuit's exit.
    async fn resolve(&self, hostname: &str) -> Result<Ipv4Addr, SocksIoError>;

    /// Open a TCP connection from the circuit's exit.
    async fn connect(&self, hostname: &str, port: u16) -> Result<TcpStream, SocksIoError>;
}

/// The production facade: speaks SOCKS5 to the local client and
/// announces each source port to the reactor.
pub struct SocksCircuitIo {
    /// The client's SOCKS listener.
    socks_addr: SocketAddr,
    /// The circuit this probe's streams must ride.
    circuit: CircuitId,
    /// Channel to the scan reactor.
    reactor_tx: mpsc::UnboundedSender<WorkerMsg>,
}

impl SocksCircuitIo {
    /// Create a facade for `circuit`.
    pub fn new(
        socks_addr: SocketAddr,
        circuit: CircuitId,
        reactor_tx: mpsc::UnboundedSender<WorkerMsg>,
    ) -> Self {
        SocksCircuitIo {
            socks_addr,
            circuit,
            reactor_tx,
        }
    }

    /// Run one full SOCKS exchange and return the socket plus reply.
    async fn exchange(
        &self,
        cmd: SocksCmd,
        host: &str,
        port: u16,
    ) -> Result<(TcpStream, SocksReply), SocksIoError> {
        // A fresh connection per operation: the kernel assigns a unique
        // source port, which is the correlation key.  SO_REUSEADDR
        // stays off.
        let mut stream = TcpStream::connect(self.socks_addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                SocksIoError::ProxyRefused
            } else {
                SocksIoError::from_io(e)
            }
        })?;
        let local_port = stream.local_addr().map_err(SocksIoError::Io)?.port();

        stream
            .write_all(&socks::method_selection_msg())
            .await
            .map_err(SocksIoError::from_io)?;
        let mut method = [0_u8; 2];
        stream
            .read_exact(&mut method)
            .await
            .map_err(SocksIoError::from_io)?;
        socks::check_method_reply(&method)?;

        // Announce the pairing before the request bytes go out: the
        // client emits its stream event while processing the request,
        // and the circuit half must already be on its way.
        debug!(
            "Socket {} connected to circuit {}.",
            local_port, self.circuit
        );
        if self
            .reactor_tx
            .send(WorkerMsg::Attach {
                circuit: self.circuit.clone(),
                port: local_port,
            })
            .is_err()
        {
            return Err(SocksIoError::ConnectionLost);
        }

        stream
            .write_all(&socks::request_msg(cmd, host, port)?)
            .await
            .map_err(SocksIoError::from_io)?;

        let mut buf = Vec::with_capacity(32);
        let mut chunk = [0_u8; 32];
        loop {
            match socks::parse_reply(&buf) {
                Ok((reply, _)) => return Ok((stream, reply)),
                Err(socks::Error::Truncated) => {}
                Err(e) => return Err(e.into()),
            }
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(SocksIoError::from_io)?;
            if n == 0 {
                return Err(SocksIoError::Eof);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[async_trait]
impl CircuitIo for SocksCircuitIo {
    async fn resolve(&self, hostname: &str) -> Result<Ipv4Addr, SocksIoError> {
        let (_stream, reply) = self.exchange(SocksCmd::Resolve, hostname, 0).await?;
        if !reply.status.is_success() {
            return Err(SocksIoError::Rejected(reply.status));
        }
        match reply.addr {
            Some(IpAddr::V4(addr)) => Ok(addr),
            _ => Err(SocksIoError::NoAddress),
        }
    }

    async fn connect(&self, hostname: &str, port: u16) -> Result<TcpStream, SocksIoError> {
        let (stream, reply) = self.exchange(SocksCmd::Connect, hostname, port).await?;
        if !reply.status.is_success() {
            return Err(SocksIoError::Rejected(reply.status));
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tokio::net::TcpListener;

    /// A one-shot SOCKS server that answers every resolve with `reply`.
    async fn fake_socks(listener: TcpListener, reply: Vec<u8>) {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut greeting = [0_u8; 3];
        sock.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [5, 1, 0]);
        sock.write_all(&[5, 0]).await.unwrap();
        // Read the request header + hostname.
        let mut head = [0_u8; 5];
        sock.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], 5);
        let mut rest = vec![0_u8; usize::from(head[4]) + 2];
        sock.read_exact(&mut rest).await.unwrap();
        sock.write_all(&reply).await.unwrap();
    }

    fn success_reply(addr: [u8; 4]) -> Vec<u8> {
        let mut reply = vec![5, 0, 0, 1];
        reply.extend_from_slice(&addr);
        reply.extend_from_slice(&[0, 0]);
        reply
    }

    #[tokio::test]
    async fn resolve_announces_port_then_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(fake_socks(listener, success_reply([64, 65, 4, 1])));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let io = SocksCircuitIo::new(addr, CircuitId::new("9"), tx);
        let resolved = io.resolve("example.com").await.unwrap();
        assert_eq!(resolved, Ipv4Addr::new(64, 65, 4, 1));

        match rx.recv().await.unwrap() {
            WorkerMsg::Attach { circuit, port } => {
                assert_eq!(circuit.as_str(), "9");
                assert_ne!(port, 0);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_resolve_maps_to_token() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut reply = success_reply([0, 0, 0, 0]);
        reply[1] = 4; // host unreachable: the lookup failed
        let server = tokio::spawn(fake_socks(listener, reply));

        let (tx, _rx) = mpsc::unbounded_channel();
        let io = SocksCircuitIo::new(addr, CircuitId::new("9"), tx);
        let err = io.resolve("example.com").await.unwrap_err();
        assert_eq!(err.status(), ProbeStatus::DnsFail);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_proxy_maps_to_token() {
        // Bind then drop, so the port is (very likely) unoccupied.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, _rx) = mpsc::unbounded_channel();
        let io = SocksCircuitIo::new(addr, CircuitId::new("9"), tx);
        let err = io.resolve("example.com").await.unwrap_err();
        assert_eq!(err.status(), ProbeStatus::TorConnectionRefused);
    }
}
