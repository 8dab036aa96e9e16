//! SSH tunnel plumbing.
//!
//! Keypair generation for new machines, the readiness probe used while a
//! machine boots, and running commands over the tunnel.

use crate::error::{Error, Result};
use crate::machine::SshCoordinates;
use serde::Serialize;
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

/// Private key file name inside a machine directory.
pub const IDENTITY_FILENAME: &str = "id_ed25519";

/// Result of a command run over the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshOutput {
    /// Exit status of the remote command (or of ssh itself).
    pub status: i32,
    /// Stdout followed by stderr.
    pub output: String,
}

impl SshOutput {
    /// Check if the command succeeded.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Generate an ed25519 keypair at `identity` (public key at `.pub`).
pub fn generate_keypair(keygen_binary: &str, identity: &Path, comment: &str) -> Result<()> {
    tracing::debug!(identity = %identity.display(), "generating ssh keypair");

    let output = Command::new(keygen_binary)
        .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
        .arg(identity)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::allocation(format!("failed to run {}: {}", keygen_binary, e)))?;

    if !output.status.success() {
        return Err(Error::allocation(format!(
            "{} failed: {}",
            keygen_binary,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    if !identity.is_file() {
        return Err(Error::allocation(format!(
            "{} did not create {}",
            keygen_binary,
            identity.display()
        )));
    }
    Ok(())
}

/// Pick a free localhost port not in `taken`.
pub fn allocate_port(taken: &[u16]) -> Result<u16> {
    for _ in 0..16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .map_err(|e| Error::allocation(format!("failed to allocate tunnel port: {}", e)))?;
        let port = listener.local_addr()?.port();
        if !taken.contains(&port) {
            return Ok(port);
        }
    }
    Err(Error::allocation("no free tunnel port"))
}

/// Check whether an SSH server answers on localhost `port`.
///
/// Forwarded ports accept connections before the guest's sshd is up, so
/// only a protocol banner counts as ready.
pub fn probe_banner(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut stream = match TcpStream::connect_timeout(&addr, timeout) {
        Ok(s) => s,
        Err(e) => {
            tracing::trace!(port, error = %e, "tunnel connect failed");
            return false;
        }
    };
    if stream.set_read_timeout(Some(timeout)).is_err() {
        return false;
    }

    let mut buf = [0u8; 4];
    match stream.read_exact(&mut buf) {
        Ok(()) => &buf == b"SSH-",
        Err(e) => {
            tracing::trace!(port, error = %e, "no ssh banner yet");
            false
        }
    }
}

/// Run `command` in the machine over ssh.
///
/// An empty command opens an interactive session attached to the
/// caller's terminal; its output is not captured.
pub fn run(ssh_binary: &str, coords: &SshCoordinates, command: &[String]) -> Result<SshOutput> {
    let mut cmd = Command::new(ssh_binary);
    cmd.arg("-i")
        .arg(&coords.identity_path)
        .args(["-p", &coords.port.to_string()])
        .args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "IdentitiesOnly=yes",
            "-o",
            "LogLevel=ERROR",
        ])
        .arg(format!("{}@localhost", coords.user));

    if command.is_empty() {
        let status = cmd
            .status()
            .map_err(|e| Error::command_failed(ssh_binary, e.to_string()))?;
        return Ok(SshOutput {
            status: status.code().unwrap_or(255),
            output: String::new(),
        });
    }

    cmd.arg("--").args(command).stdin(Stdio::null());
    let output = cmd
        .output()
        .map_err(|e| Error::command_failed(ssh_binary, e.to_string()))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(SshOutput {
        status: output.status.code().unwrap_or(255),
        output: combined,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_probe_banner_requires_ssh_greeting() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = stream.unwrap();
                let _ = stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n");
            }
        });

        assert!(probe_banner(port, Duration::from_secs(2)));
    }

    #[test]
    fn test_probe_banner_rejects_silent_listener() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = stream.unwrap();
                let _ = stream.write_all(b"HTTP");
            }
        });

        assert!(!probe_banner(port, Duration::from_millis(500)));
    }

    #[test]
    fn test_probe_banner_closed_port() {
        let port = allocate_port(&[]).unwrap();
        assert!(!probe_banner(port, Duration::from_millis(200)));
    }

    #[test]
    fn test_allocate_port_avoids_taken() {
        let first = allocate_port(&[]).unwrap();
        let second = allocate_port(&[first]).unwrap();
        assert_ne!(first, second);
        assert!(second > 0);
    }

    #[test]
    fn test_keygen_failure_is_allocation_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = generate_keypair(
            "/nonexistent/ssh-keygen",
            &dir.path().join(IDENTITY_FILENAME),
            "vm1",
        )
        .unwrap_err();
        assert!(matches!(err, Error::ResourceAllocation(_)));
    }

    #[test]
    fn test_run_captures_status_and_output() {
        // `sh -c` stands in for ssh: it receives the same argv and we only
        // care that output and status flow back.
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-ssh");
        std::fs::write(
            &fake,
            "#!/bin/sh\nwhile [ \"$1\" != \"--\" ]; do shift; done\nshift\necho \"ran: $*\"\necho oops >&2\nexit 3\n",
        )
        .unwrap();
        make_executable(&fake);

        let coords = SshCoordinates {
            identity_path: dir.path().join("id"),
            port: 2222,
            user: "core".into(),
        };
        let out = run(
            fake.to_str().unwrap(),
            &coords,
            &["uname".to_string(), "-a".to_string()],
        )
        .unwrap();

        assert_eq!(out.status, 3);
        assert!(!out.success());
        assert!(out.output.contains("ran: uname -a"));
        assert!(out.output.contains("oops"));
    }

    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }
}
