use std::fmt;
use std::io;

/// The closed error taxonomy for the whole crate.
///
/// Only [`Error::Input`] variants are meant to propagate out of
/// [`crate::manager::Manager::run`]; every other variant is produced by a
/// component, absorbed into a [`crate::state::State`] transition, logged, and
/// never panics the process.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A malformed host reference, unsupported scheme, invalid port, or
    /// unparseable log-level selector. Fatal at startup.
    Input(String),

    /// The control channel could not be spawned, the control socket never
    /// appeared, or the circuit breaker is open.
    ControlChannel(String),

    /// A forward could not be created. `retryable` distinguishes port-in-use
    /// (retried by the reconciler) from a generic remote-side failure.
    Forward { message: String, retryable: bool },

    /// The loopback probe dial timed out or was refused.
    Probe(io::Error),

    /// The remote event stream produced a bad line or the subprocess exited.
    EventStream(String),

    /// An I/O failure that doesn't fit a more specific variant (state file,
    /// status socket, subprocess spawn).
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Input(msg) => write!(f, "invalid input: {msg}"),
            Error::ControlChannel(msg) => write!(f, "control channel error: {msg}"),
            Error::Forward { message, .. } => write!(f, "forward request failed: {message}"),
            Error::Probe(_) => write!(f, "loopback probe failed"),
            Error::EventStream(msg) => write!(f, "event stream error: {msg}"),
            Error::Io(_) => write!(f, "i/o error"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Probe(e) | Error::Io(e) => Some(e),
            Error::Input(_)
            | Error::ControlChannel(_)
            | Error::Forward { .. }
            | Error::EventStream(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl Error {
    /// True if the message matches one of the documented port-in-use
    /// substrings from the remote shell client or the remote runtime.
    pub fn is_port_in_use(message: &str) -> bool {
        const NEEDLES: &[&str] = &[
            "address already in use",
            "cannot listen to port",
            "remote port forwarding failed",
            "bind: address already in use",
            "bind [",
        ];
        let lower = message.to_ascii_lowercase();
        NEEDLES.iter().any(|needle| lower.contains(needle))
    }

    /// True if the message matches one of the documented "forward already
    /// gone" substrings that make a cancel non-fatal.
    pub fn is_forward_already_gone(message: &str) -> bool {
        const NEEDLES: &[&str] = &["No such", "not found", "does not exist"];
        NEEDLES.iter().any(|needle| message.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_in_use_matches_documented_substrings() {
        assert!(Error::is_port_in_use(
            "channel_setup_fwd_listener: cannot listen to port: 18080"
        ));
        assert!(Error::is_port_in_use(
            "bind [127.0.0.1]:18080: Address already in use"
        ));
        assert!(Error::is_port_in_use("remote port forwarding failed"));
        assert!(!Error::is_port_in_use("Permission denied (publickey)"));
    }

    #[test]
    fn forward_already_gone_matches_documented_substrings() {
        assert!(Error::is_forward_already_gone(
            "cancel-tcpip-forward: No such forward"
        ));
        assert!(Error::is_forward_already_gone("port mapping not found"));
        assert!(!Error::is_forward_already_gone("Connection refused"));
    }

    #[test]
    fn display_and_source_are_sane() {
        let e = Error::Io(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(!format!("{e}").is_empty());
        assert!(std::error::Error::source(&e).is_some());

        let e = Error::Input("missing host".into());
        assert!(std::error::Error::source(&e).is_none());
    }
}
