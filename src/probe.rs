//! Liveness confirmation for a freshly created forward: a single loopback
//! TCP connect, closed immediately, no data exchanged.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::Error;

const PROBE_DEADLINE: Duration = Duration::from_secs(1);

/// Attempt a loopback connect to `127.0.0.1:<port>` with a 1-second
/// deadline. Returns `Ok(())` iff the connect succeeds; the stream is
/// dropped (and thus closed) immediately.
pub async fn probe(port: u16) -> Result<(), Error> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    match timeout(PROBE_DEADLINE, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(Error::Probe(e)),
        Err(_) => Err(Error::Probe(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "loopback probe timed out",
        ))),
    }
}
