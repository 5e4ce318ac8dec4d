//! Builds the argument vector for a single shell-client invocation against
//! an already-running control master: `-O check`, `-O forward`, `-O cancel`,
//! or a one-shot remote command.
//!
//! This builder never interpolates a shell; every argument is pushed as a
//! separate, literal token (mirroring how [`tokio::process::Command`] itself
//! treats arguments). Callers are responsible for providing already-escaped
//! tokens when the token will itself be interpreted by a *remote* shell.

use std::ffi::OsStr;
use std::path::Path;

use crate::escape;

/// The four control operations the control channel ever issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Check,
    Exit,
    Forward,
    Cancel,
}

impl ControlOp {
    fn as_str(self) -> &'static str {
        match self {
            ControlOp::Check => "check",
            ControlOp::Exit => "exit",
            ControlOp::Forward => "forward",
            ControlOp::Cancel => "cancel",
        }
    }
}

/// Render a local-forward spec: `127.0.0.1:<local>:localhost:<remote>`.
///
/// The remote side is always named `localhost` (rather than the dialed
/// host) so that the remote resolver can honor local overrides (e.g.
/// `/etc/hosts` on the remote end) instead of re-resolving the original
/// destination string.
pub fn forward_spec(local_port: u16, remote_port: u16) -> String {
    format!("127.0.0.1:{local_port}:localhost:{remote_port}")
}

/// Builds one shell-client argument vector with a fixed ordering discipline:
/// `-S <control-path>`, optional `-p <port>`, optional `-O <op>`, optional
/// `-L <forward-spec>`, caller-supplied extra flags, `user@host`, and
/// optionally a trailing remote command.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    control_path: std::path::PathBuf,
    port: Option<u16>,
    op: Option<ControlOp>,
    forward: Option<String>,
    extra: Vec<String>,
    user_at_host: String,
    remote_command: Vec<String>,
}

impl CommandBuilder {
    /// Start a builder for a given control socket and `user@host` target.
    pub fn new(control_path: impl AsRef<Path>, user_at_host: impl Into<String>) -> Self {
        Self {
            control_path: control_path.as_ref().to_path_buf(),
            port: None,
            op: None,
            forward: None,
            extra: Vec::new(),
            user_at_host: user_at_host.into(),
            remote_command: Vec::new(),
        }
    }

    /// Set `-p <port>`.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set `-O <op>`.
    pub fn op(mut self, op: ControlOp) -> Self {
        self.op = Some(op);
        self
    }

    /// Set `-L <spec>`.
    pub fn forward(mut self, spec: impl Into<String>) -> Self {
        self.forward = Some(spec.into());
        self
    }

    /// Append a caller-supplied extra flag token (e.g. `-o`, `BatchMode=yes`,
    /// or `-i <identity-file>`). Pushed verbatim, in order, after the fixed
    /// positional options and before `user@host`.
    pub fn extra_arg(mut self, token: impl Into<String>) -> Self {
        self.extra.push(token.into());
        self
    }

    /// Append the literal tokens of a trailing remote command. When
    /// non-empty, these are appended after `user@host` and executed by the
    /// remote login shell.
    pub fn remote_command(mut self, tokens: impl IntoIterator<Item = String>) -> Self {
        self.remote_command.extend(tokens);
        self
    }

    /// Render the final, ordered argument vector.
    pub fn build(self) -> Vec<String> {
        let mut args = Vec::with_capacity(8 + self.extra.len() + self.remote_command.len());
        args.push("-S".to_string());
        args.push(self.control_path.to_string_lossy().into_owned());

        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }

        if let Some(op) = self.op {
            args.push("-O".to_string());
            args.push(op.as_str().to_string());
        }

        if let Some(spec) = self.forward {
            args.push("-L".to_string());
            args.push(spec);
        }

        args.extend(self.extra);
        args.push(self.user_at_host);
        // ssh joins the trailing argv with spaces and hands it to the
        // remote login shell as one string; escape each token so it
        // survives that re-parse intact.
        args.extend(
            self.remote_command
                .into_iter()
                .map(|token| escape::escape(OsStr::new(&token)).to_string_lossy().into_owned()),
        );
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_spec_uses_localhost_on_remote_side() {
        assert_eq!(forward_spec(18080, 80), "127.0.0.1:18080:localhost:80");
    }

    #[test]
    fn check_op_has_fixed_order() {
        let args = CommandBuilder::new("/tmp/ctl.sock", "me@example.com")
            .op(ControlOp::Check)
            .build();
        assert_eq!(
            args,
            vec!["-S", "/tmp/ctl.sock", "-O", "check", "me@example.com"]
        );
    }

    #[test]
    fn forward_op_includes_port_and_spec_in_order() {
        let args = CommandBuilder::new("/tmp/ctl.sock", "me@example.com")
            .port(2222)
            .op(ControlOp::Forward)
            .forward(forward_spec(18080, 80))
            .extra_arg("-o")
            .extra_arg("BatchMode=yes")
            .build();
        assert_eq!(
            args,
            vec![
                "-S",
                "/tmp/ctl.sock",
                "-p",
                "2222",
                "-O",
                "forward",
                "-L",
                "127.0.0.1:18080:localhost:80",
                "-o",
                "BatchMode=yes",
                "me@example.com",
            ]
        );
    }

    #[test]
    fn remote_command_trails_user_at_host() {
        let args = CommandBuilder::new("/tmp/ctl.sock", "me@example.com")
            .remote_command(["docker".to_string(), "ps".to_string()])
            .build();
        assert_eq!(
            args,
            vec!["-S", "/tmp/ctl.sock", "me@example.com", "docker", "ps"]
        );
    }

    #[test]
    fn no_op_no_forward_omits_those_flags() {
        let args = CommandBuilder::new("/tmp/ctl.sock", "me@example.com").build();
        assert_eq!(args, vec!["-S", "/tmp/ctl.sock", "me@example.com"]);
    }
}
