//! Launch and bootstrap the Tor client the scanner drives.
//!
//! The client gets auto-assigned SOCKS and control ports, which we
//! learn by watching its startup log stream; bootstrap is considered
//! good enough at 75% (the consensus and descriptors are in by then,
//! and the scanner builds every circuit itself anyway).
//!
//! `__DisablePredictedCircuits` is deliberately not passed here: with
//! it set at launch, the client will not finish bootstrapping when the
//! data directory already exists.  The orchestrator sets it over the
//! control port once we are connected.

use crate::err::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long we give the client to reach the bootstrap threshold.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(90);

/// The bootstrap percentage we wait for.
const BOOTSTRAP_THRESHOLD: u32 = 75;

/// A listener the client can announce in its log.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Listener {
    /// The SOCKS listener.
    Socks,
    /// The control listener.
    Control,
}

/// A running, bootstrapped Tor client.
///
/// The process is killed when this handle drops.
pub struct TorProcess {
    /// The child process.
    #[allow(dead_code)] // held for kill-on-drop
    child: Child,
    /// The auto-assigned SOCKS port.
    socks_port: u16,
    /// The auto-assigned control port.
    control_port: u16,
}

impl TorProcess {
    /// Launch a client over `tor_dir` and wait for it to bootstrap.
    pub async fn launch(tor_dir: &Path) -> Result<TorProcess> {
        info!(
            "Attempting to invoke Tor process in directory {:?}.  This might take a while.",
            tor_dir
        );
        let mut child = Command::new("tor")
            .arg("--ignore-missing-torrc")
            .args(["--SOCKSPort", "auto"])
            .args(["--ControlPort", "auto"])
            .args(["--DataDirectory"])
            .arg(tor_dir)
            .args(["--CookieAuthentication", "1"])
            .args(["--LearnCircuitBuildTimeout", "0"])
            .args(["--CircuitBuildTimeout", "20"])
            .args(["--__LeaveStreamsUnattached", "1"])
            .args(["--FetchHidServDescriptors", "0"])
            .args(["--UseMicroDescriptors", "0"])
            .args(["--PathsNeededToBuildCircuits", "0.95"])
            .args(["--Log", "notice stdout"])
            .stdout(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Launch(format!("could not spawn tor: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Launch("tor child has no stdout".to_owned()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut socks_port = None;
        let mut control_port = None;
        let bootstrap = async {
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| Error::Launch(format!("error reading tor log: {}", e)))?
            {
                debug!("tor: {}", line);
                if let Some((listener, port)) = parse_listener_line(&line) {
                    match listener {
                        Listener::Socks => socks_port = Some(port),
                        Listener::Control => control_port = Some(port),
                    }
                }
                if let Some(percent) = parse_bootstrap_line(&line) {
                    if percent >= BOOTSTRAP_THRESHOLD {
                        return Ok(());
                    }
                }
            }
            Err(Error::Launch(
                "tor exited before finishing bootstrap".to_owned(),
            ))
        };
        tokio::time::timeout(BOOTSTRAP_TIMEOUT, bootstrap)
            .await
            .map_err(|_| {
                Error::Launch(format!(
                    "bootstrap did not reach {}% within {:?}",
                    BOOTSTRAP_THRESHOLD, BOOTSTRAP_TIMEOUT
                ))
            })??;

        let socks_port = socks_port
            .ok_or_else(|| Error::Launch("tor never announced its SOCKS port".to_owned()))?;
        let control_port = control_port
            .ok_or_else(|| Error::Launch("tor never announced its control port".to_owned()))?;

        // Keep draining the log so the child never blocks on a full
        // pipe; surface warnings.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                if line.contains("[warn]") || line.contains("[err]") {
                    warn!("tor: {}", line);
                } else {
                    debug!("tor: {}", line);
                }
            }
        });

        info!(
            "Successfully started Tor process (socks port {}, control port {}).",
            socks_port, control_port
        );
        Ok(TorProcess {
            child,
            socks_port,
            control_port,
        })
    }

    /// The client's SOCKS address.
    pub fn socks_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.socks_port))
    }

    /// The client's control address.
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.control_port))
    }
}

/// Extract an announced listener port from a log line.
///
/// Both phrasings the client has used over the years are accepted:
///
/// ```text
/// ... Socks listener listening on port 42421.
/// ... Opened Socks listener connection (ready) on 127.0.0.1:42421
/// ```
fn parse_listener_line(line: &str) -> Option<(Listener, u16)> {
    let listener = if line.contains("Socks listener") {
        Listener::Socks
    } else if line.contains("Control listener") {
        Listener::Control
    } else {
        return None;
    };
    let last = line.split_ascii_whitespace().last()?;
    let last = last.trim_end_matches('.');
    let port = last.rsplit(':').next()?.parse().ok()?;
    Some((listener, port))
}

/// Extract the percentage from a bootstrap progress line.
fn parse_bootstrap_line(line: &str) -> Option<u32> {
    let (_, rest) = line.split_once("Bootstrapped ")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}
