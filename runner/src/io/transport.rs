//! Remote transport for fanout dispatch.
//!
//! [`Transport`] covers the preflight probes (resolution, reachability, auth
//! availability) and the remote execution itself. [`SshTransport`] runs
//! `ssh` in batch mode through the bounded process helper.

use std::fs::File;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::process::Command;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::types::AuthMode;
use crate::io::config::HostConfig;
use crate::io::process::run_command_with_timeout;

const REMOTE_OUTPUT_LIMIT: usize = 256 * 1024;

/// Exit status `ssh` uses for its own (connection/auth) errors.
pub const SSH_CONNECTION_ERROR: i32 = 255;

const AUTH_FAILURE_MARKERS: &[&str] = &[
    "permission denied",
    "host key verification failed",
    "too many authentication failures",
    "no supported authentication methods",
    "authentication failed",
];

/// What happened when the remote command was executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteExecution {
    pub exit_code: Option<i32>,
    /// Signal that terminated the local transport process, if any.
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

pub trait Transport: Sync {
    /// Resolve the host to socket addresses.
    fn resolve(&self, host: &HostConfig) -> Result<Vec<SocketAddr>>;

    /// Succeeds when any of the host's addresses accepts a connection within `timeout`.
    fn reachable(&self, host: &HostConfig, addrs: &[SocketAddr], timeout: Duration)
    -> Result<()>;

    /// Succeeds when the host's auth mode can be satisfied locally.
    fn auth_available(&self, host: &HostConfig) -> Result<()>;

    fn execute(
        &self,
        host: &HostConfig,
        remote_args: &[String],
        timeout: Duration,
    ) -> Result<RemoteExecution>;
}

/// True when transport stderr indicates an authentication rejection.
pub fn is_auth_failure(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    AUTH_FAILURE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// `ssh` in batch mode; never prompts.
#[derive(Debug, Clone)]
pub struct SshTransport {
    pub connect_timeout: Duration,
    pub remote_bin: String,
}

impl SshTransport {
    fn command(&self, host: &HostConfig, remote_args: &[String]) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            ))
            .arg("-p")
            .arg(host.port.to_string());
        if host.auth_mode == Some(AuthMode::Key)
            && let Some(identity) = &host.identity_file
        {
            cmd.arg("-i")
                .arg(identity)
                .arg("-o")
                .arg("IdentitiesOnly=yes");
        }
        cmd.arg(format!("{}@{}", host.user, host.hostname));
        cmd.arg("--");
        cmd.arg(remote_command_line(&self.remote_bin, remote_args));
        cmd
    }
}

/// Quote the remote invocation for the remote shell.
pub fn remote_command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

impl Transport for SshTransport {
    fn resolve(&self, host: &HostConfig) -> Result<Vec<SocketAddr>> {
        let target = (host.hostname.clone(), host.port);
        let addrs: Vec<SocketAddr> = bounded(&host.hostname, self.connect_timeout, move || {
            target
                .to_socket_addrs()
                .map(|addrs| addrs.collect::<Vec<_>>())
        })?
        .with_context(|| format!("resolve {}", host.hostname))?;
        if addrs.is_empty() {
            return Err(anyhow!("{} resolved to no addresses", host.hostname));
        }
        Ok(addrs)
    }

    fn reachable(
        &self,
        _host: &HostConfig,
        addrs: &[SocketAddr],
        timeout: Duration,
    ) -> Result<()> {
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(_) => return Ok(()),
                Err(err) => last_err = Some(format!("{addr}: {err}")),
            }
        }
        Err(anyhow!(
            "unreachable: {}",
            last_err.unwrap_or_else(|| "no addresses".to_string())
        ))
    }

    fn auth_available(&self, host: &HostConfig) -> Result<()> {
        match host.auth_mode {
            None => Err(anyhow!("no auth mode configured for {}", host.name)),
            Some(AuthMode::Key) => {
                let identity = host
                    .identity_file
                    .as_ref()
                    .ok_or_else(|| anyhow!("auth_mode=key requires identity_file"))?;
                File::open(identity)
                    .map(|_| ())
                    .with_context(|| format!("identity file {}", identity.display()))
            }
            Some(AuthMode::Agent) => {
                let sock = std::env::var_os("SSH_AUTH_SOCK")
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| anyhow!("SSH_AUTH_SOCK is not set"))?;
                if std::path::Path::new(&sock).exists() {
                    Ok(())
                } else {
                    Err(anyhow!("ssh agent socket {} missing", sock.to_string_lossy()))
                }
            }
        }
    }

    #[instrument(skip_all, fields(host = %host.name))]
    fn execute(
        &self,
        host: &HostConfig,
        remote_args: &[String],
        timeout: Duration,
    ) -> Result<RemoteExecution> {
        use std::os::unix::process::ExitStatusExt;
        let cmd = self.command(host, remote_args);
        debug!("running remote command");
        let output = run_command_with_timeout(cmd, None, timeout, REMOTE_OUTPUT_LIMIT)
            .context("run ssh")?;
        Ok(RemoteExecution {
            exit_code: if output.timed_out {
                None
            } else {
                output.status.code()
            },
            signal: if output.timed_out {
                None
            } else {
                output.status.signal()
            },
            timed_out: output.timed_out,
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
        })
    }
}

/// Run a blocking lookup on a worker thread and give up after `timeout`.
///
/// A lookup that times out keeps running detached; its result is dropped.
fn bounded<T, F>(subject: &str, timeout: Duration, lookup: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("resolve-{subject}"))
        .spawn(move || {
            let _ = tx.send(lookup());
        })
        .context("spawn resolver thread")?;
    match rx.recv_timeout(timeout) {
        Ok(value) => Ok(value),
        Err(RecvTimeoutError::Timeout) => Err(anyhow!(
            "resolving {subject} timed out after {}s",
            timeout.as_secs_f64()
        )),
        Err(RecvTimeoutError::Disconnected) => {
            Err(anyhow!("resolver for {subject} exited without a result"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn host(auth_mode: Option<AuthMode>) -> HostConfig {
        HostConfig {
            name: "build-1".to_string(),
            hostname: "127.0.0.1".to_string(),
            user: "ci".to_string(),
            auth_mode,
            port: 2222,
            identity_file: Some(PathBuf::from("/keys/id_ed25519")),
        }
    }

    fn ssh() -> SshTransport {
        SshTransport {
            connect_timeout: Duration::from_secs(7),
            remote_bin: "jobrunner".to_string(),
        }
    }

    #[test]
    fn ssh_command_is_batch_mode_with_identity() {
        let cmd = ssh().command(
            &host(Some(AuthMode::Key)),
            &["status".to_string(), "--task".to_string(), "T 1".to_string()],
        );
        let args: Vec<String> = cmd
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=7",
                "-p",
                "2222",
                "-i",
                "/keys/id_ed25519",
                "-o",
                "IdentitiesOnly=yes",
                "ci@127.0.0.1",
                "--",
                "jobrunner status --task 'T 1'",
            ]
        );
    }

    #[test]
    fn agent_mode_does_not_pass_identity() {
        let cmd = ssh().command(&host(Some(AuthMode::Agent)), &[]);
        assert!(!cmd.get_args().any(|arg| arg == "-i"));
    }

    #[test]
    fn quotes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("--json"), "--json");
    }

    #[test]
    fn detects_auth_failures() {
        assert!(is_auth_failure("ci@host: Permission denied (publickey).\r\n"));
        assert!(!is_auth_failure("ssh: connect to host x port 22: Connection refused"));
    }

    #[test]
    fn missing_auth_mode_is_unavailable() {
        assert!(ssh().auth_available(&host(None)).is_err());
    }

    #[test]
    fn unreadable_identity_is_unavailable() {
        let err = ssh()
            .auth_available(&host(Some(AuthMode::Key)))
            .expect_err("missing key");
        assert!(err.to_string().contains("identity file"));
    }

    #[test]
    fn literal_address_resolves() {
        let addrs = ssh().resolve(&host(None)).expect("resolve");
        assert_eq!(addrs, vec!["127.0.0.1:2222".parse::<SocketAddr>().expect("addr")]);
    }

    #[test]
    fn slow_lookup_is_abandoned_at_the_timeout() {
        let started = std::time::Instant::now();
        let err = bounded("slow.example", Duration::from_millis(100), || {
            thread::sleep(Duration::from_secs(5));
        })
        .expect_err("timed out");
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn closed_local_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let host = host(None);
        assert!(ssh().reachable(&host, &[addr], Duration::from_secs(1)).is_ok());
        drop(listener);
        assert!(
            ssh()
                .reachable(&host, &[addr], Duration::from_millis(500))
                .is_err()
        );
    }
}
