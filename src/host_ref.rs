//! Parses and validates `ssh://user@host[:port]` destination strings, and
//! derives the deterministic control-socket path for a given reference.

use std::fmt;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::error::Error;

const SCHEME: &str = "ssh";
const SOCKET_PREFIX: &str = "portbridge";

/// An immutable, validated `scheme://user@host[:port]` reference.
///
/// `raw` is retained verbatim (not just its parsed fields) because
/// [`HostReference::control_path`] hashes over the exact input text: a
/// trailing `/` or an added port must change the derived socket path even if
/// two inputs would otherwise parse to equivalent fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReference {
    user: String,
    host: String,
    bracketed: bool,
    port: Option<u16>,
    raw: String,
}

impl HostReference {
    /// Parse a `ssh://user@host[:port]` string.
    ///
    /// Rejects: a missing/wrong scheme, an empty body after the scheme, a
    /// missing user, mismatched brackets, bracket content followed by a
    /// non-colon character, and an unbracketed host containing more than one
    /// colon (ambiguous with a bare IPv6 literal).
    pub fn parse(text: &str) -> Result<Self, Error> {
        let prefix = format!("{SCHEME}://");
        let body = text.strip_prefix(&prefix).ok_or_else(|| {
            Error::Input(format!("expected a `{SCHEME}://` destination, got `{text}`"))
        })?;

        if body.is_empty() {
            return Err(Error::Input("empty body after scheme".into()));
        }

        let at = body
            .find('@')
            .ok_or_else(|| Error::Input(format!("missing `user@` in `{text}`")))?;
        let user = &body[..at];
        let host_port = &body[at + 1..];

        if user.is_empty() {
            return Err(Error::Input("empty user before `@`".into()));
        }
        if host_port.is_empty() {
            return Err(Error::Input("empty host after `@`".into()));
        }

        let (host, bracketed, port) = if let Some(rest) = host_port.strip_prefix('[') {
            let close = rest
                .find(']')
                .ok_or_else(|| Error::Input(format!("mismatched brackets in `{text}`")))?;
            let host = &rest[..close];
            if host.is_empty() {
                return Err(Error::Input("empty bracketed host".into()));
            }
            let after = &rest[close + 1..];
            let port = if after.is_empty() {
                None
            } else if let Some(port_str) = after.strip_prefix(':') {
                Some(parse_port(port_str, text)?)
            } else {
                return Err(Error::Input(format!(
                    "bracket content followed by a non-colon character in `{text}`"
                )));
            };
            (host.to_string(), true, port)
        } else {
            let colons = host_port.matches(':').count();
            match colons {
                0 => (host_port.to_string(), false, None),
                1 => {
                    let idx = host_port.find(':').expect("checked above");
                    let host = &host_port[..idx];
                    let port_str = &host_port[idx + 1..];
                    if host.is_empty() {
                        return Err(Error::Input("empty host before `:port`".into()));
                    }
                    (host.to_string(), false, Some(parse_port(port_str, text)?))
                }
                _ => {
                    return Err(Error::Input(format!(
                        "ambiguous IPv6-looking host `{host_port}` must be bracketed"
                    )));
                }
            }
        };

        Ok(HostReference {
            user: user.to_string(),
            host,
            bracketed,
            port,
            raw: text.to_string(),
        })
    }

    /// The `user` component.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The `host` component, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The optional explicit port.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The `user@host` (or `user@[host]`) form used on the ssh command line.
    /// Never includes the port; the port is passed separately via `-p`.
    pub fn user_at_host(&self) -> String {
        if self.bracketed {
            format!("{}@[{}]", self.user, self.host)
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }

    /// Derive the deterministic control-socket path for this reference.
    ///
    /// Hashes the exact, normalized input text so that two processes
    /// pointed at the same destination compute the same path, while any
    /// textual difference (trailing slash, explicit default port) changes
    /// it.
    pub fn control_path(&self) -> PathBuf {
        socket_path(SOCKET_PREFIX, "sock", &self.raw)
    }
}

impl fmt::Display for HostReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}://{}", self.raw.trim_start_matches("ssh://"))
    }
}

fn parse_port(s: &str, whole: &str) -> Result<u16, Error> {
    s.parse::<u16>()
        .map_err(|_| Error::Input(format!("invalid port `{s}` in `{whole}`")))
        .and_then(|p| {
            if p == 0 {
                Err(Error::Input(format!("port 0 is invalid in `{whole}`")))
            } else {
                Ok(p)
            }
        })
}

/// Hash `text` and render a `<prefix>-<hex8>.<ext>` path in the system temp
/// directory. Shared by the control channel (the ssh `ControlPath`) and the
/// status interface (socket/state-file naming), which use different prefixes
/// and extensions over the same deterministic-hash discipline.
pub(crate) fn socket_path(prefix: &str, ext: &str, text: &str) -> PathBuf {
    let digest = Sha256::digest(text.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        hex.push_str(&format!("{byte:02x}"));
    }
    std::env::temp_dir().join(format!("{prefix}-{hex}.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_host() {
        let r = HostReference::parse("ssh://me@example.com").unwrap();
        assert_eq!(r.user(), "me");
        assert_eq!(r.host(), "example.com");
        assert_eq!(r.port(), None);
        assert_eq!(r.user_at_host(), "me@example.com");
    }

    #[test]
    fn parses_host_with_port() {
        let r = HostReference::parse("ssh://me@example.com:2222").unwrap();
        assert_eq!(r.host(), "example.com");
        assert_eq!(r.port(), Some(2222));
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let r = HostReference::parse("ssh://me@[::1]:2222").unwrap();
        assert_eq!(r.host(), "::1");
        assert_eq!(r.port(), Some(2222));
        assert_eq!(r.user_at_host(), "me@[::1]");
    }

    #[test]
    fn parses_bracketed_ipv6_without_port() {
        let r = HostReference::parse("ssh://me@[2001:db8::1]").unwrap();
        assert_eq!(r.host(), "2001:db8::1");
        assert_eq!(r.port(), None);
    }

    #[test]
    fn rejects_wrong_scheme() {
        assert!(HostReference::parse("http://me@example.com").is_err());
    }

    #[test]
    fn rejects_empty_body() {
        assert!(HostReference::parse("ssh://").is_err());
    }

    #[test]
    fn rejects_missing_user() {
        assert!(HostReference::parse("ssh://example.com").is_err());
    }

    #[test]
    fn rejects_mismatched_brackets() {
        assert!(HostReference::parse("ssh://me@[::1").is_err());
    }

    #[test]
    fn rejects_bracket_followed_by_non_colon() {
        assert!(HostReference::parse("ssh://me@[::1]x").is_err());
    }

    #[test]
    fn rejects_unbracketed_ambiguous_ipv6() {
        assert!(HostReference::parse("ssh://me@2001:db8::1").is_err());
    }

    #[test]
    fn rejects_invalid_port() {
        assert!(HostReference::parse("ssh://me@example.com:0").is_err());
        assert!(HostReference::parse("ssh://me@example.com:notaport").is_err());
    }

    #[test]
    fn control_path_is_deterministic_and_sensitive_to_input_text() {
        let a = HostReference::parse("ssh://me@example.com").unwrap();
        let b = HostReference::parse("ssh://me@example.com").unwrap();
        assert_eq!(a.control_path(), b.control_path());

        let c = HostReference::parse("ssh://me@example.com:22").unwrap();
        assert_ne!(a.control_path(), c.control_path());

        let d = HostReference::parse("ssh://me@example.com/").unwrap_err();
        // trailing slash is not a valid host character in this grammar, but
        // prove the hash differs whenever the raw text differs, which is
        // the property that matters:
        let _ = d;
        let e_text = "ssh://me@example.com:2222";
        let e = HostReference::parse(e_text).unwrap();
        assert_ne!(a.control_path(), e.control_path());
    }
}
