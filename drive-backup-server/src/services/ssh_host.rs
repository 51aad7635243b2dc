use crate::config::{SshAuth, SshConfig};
use async_trait::async_trait;
use backup_rotation::{ByteStream, HostAccess, HostError, PermissionReport};
use bytes::Bytes;
use futures_util::stream;
use ssh2::{Channel, Session};
use std::io::{self, Read};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT_MS: u32 = 10_000;
const READ_CHUNK: usize = 64 * 1024;
/// Chunks buffered between the SSH reader and the upload.
const STREAM_BUFFER: usize = 16;
const PROBE_FILE: &str = ".drive-backup-probe";
/// Stderr kept for error messages; the rest is read and discarded.
const STDERR_LIMIT: usize = 16 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The snapshotted host, reached over SSH with a read-only account.
pub struct SshHost {
    config: SshConfig,
}

impl SshHost {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

struct CommandOutput {
    status: i32,
    stdout: String,
}

fn ssh_error(e: ssh2::Error) -> HostError {
    HostError::Ssh(e.to_string())
}

fn join_error(e: tokio::task::JoinError) -> HostError {
    HostError::Io(io::Error::other(e))
}

fn connect(config: &SshConfig) -> Result<Session, HostError> {
    let addr = format!("{}:{}", config.host, config.port);
    let tcp = TcpStream::connect(&addr).map_err(|e| HostError::Connection(format!("{addr}: {e}")))?;

    let mut session = Session::new().map_err(ssh_error)?;
    session.set_timeout(CONNECT_TIMEOUT_MS);
    session.set_tcp_stream(tcp);
    session.handshake().map_err(ssh_error)?;

    match &config.auth {
        SshAuth::Password(password) => session.userauth_password(&config.user, password),
        SshAuth::KeyFile(path) => session.userauth_pubkey_file(&config.user, None, path, None),
    }
    .map_err(|e| HostError::Authentication(e.to_string()))?;

    if !session.authenticated() {
        return Err(HostError::Authentication(format!("{} was not accepted by {addr}", config.user)));
    }
    Ok(session)
}

fn exec(session: &Session, command: &str) -> Result<CommandOutput, HostError> {
    let mut channel = session.channel_session().map_err(ssh_error)?;
    channel.exec(command).map_err(ssh_error)?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    channel.wait_close().map_err(ssh_error)?;
    let status = channel.exit_status().map_err(ssh_error)?;
    Ok(CommandOutput { status, stdout })
}

/// Single-quote a value for a POSIX shell.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Build the command that writes a gzip'd tarball of `path` to stdout,
/// archiving the last component relative to its parent.
pub(crate) fn tar_command(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "tar -czf - -C '/' '.'".to_string();
    }

    let path = Path::new(trimmed);
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => format!(
            "tar -czf - -C {} {}",
            shell_quote(&parent.to_string_lossy()),
            shell_quote(&name.to_string_lossy())
        ),
        _ => format!("tar -czf - {}", shell_quote(trimmed)),
    }
}

/// Whether `groups` output lists sudo or wheel.
pub(crate) fn has_sudo_group(groups: &str) -> bool {
    groups
        .split(|c: char| c.is_whitespace() || c == ':')
        .any(|g| g == "sudo" || g == "wheel")
}

/// How a finished tar run is reported.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TarOutcome {
    Clean,
    /// Exit 1: some files changed while being read; the archive is usable
    Warning(String),
    Failed(String),
}

pub(crate) fn tar_outcome(command: &str, status: i32, stderr: &str) -> TarOutcome {
    match status {
        0 => TarOutcome::Clean,
        1 => TarOutcome::Warning(format!("`{command}` reported changed files: {}", stderr.trim())),
        _ => TarOutcome::Failed(format!("`{command}` exited with status {status}: {}", stderr.trim())),
    }
}

/// Append to the kept stderr, dropping anything past `STDERR_LIMIT`.
pub(crate) fn keep_stderr(kept: &mut Vec<u8>, chunk: &[u8]) {
    let room = STDERR_LIMIT.saturating_sub(kept.len());
    kept.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

/// Copy stdout into the stream until EOF, then report the exit status.
///
/// The session runs non-blocking so stderr is drained alongside stdout;
/// unread stderr would otherwise fill the shared channel window and stall
/// the transfer.
fn pump(session: Session, mut channel: Channel, command: String, tx: mpsc::Sender<io::Result<Bytes>>, cancel: CancellationToken) {
    session.set_blocking(false);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut stderr = Vec::new();

    loop {
        if cancel.is_cancelled() {
            session.set_blocking(true);
            let _ = channel.close();
            let _ = tx.blocking_send(Err(io::Error::new(io::ErrorKind::Interrupted, "snapshot cancelled")));
            return;
        }

        let mut progressed = false;
        let mut finished = false;
        match channel.read(&mut buf) {
            Ok(0) => finished = channel.eof(),
            Ok(n) => {
                progressed = true;
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    tracing::debug!("Snapshot consumer went away, closing channel");
                    session.set_blocking(true);
                    let _ = channel.close();
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }

        match channel.stderr().read(&mut buf) {
            Ok(n) if n > 0 => {
                keep_stderr(&mut stderr, &buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::debug!(error = %e, "Failed to read snapshot stderr"),
        }

        if finished {
            break;
        }
        if !progressed {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    session.set_blocking(true);
    let mut rest = Vec::new();
    let _ = channel.stderr().take(STDERR_LIMIT as u64).read_to_end(&mut rest);
    keep_stderr(&mut stderr, &rest);

    let stderr = String::from_utf8_lossy(&stderr);
    let outcome = match channel.wait_close().and_then(|_| channel.exit_status()) {
        Ok(status) => tar_outcome(&command, status, &stderr),
        Err(e) => TarOutcome::Failed(e.to_string()),
    };
    match outcome {
        TarOutcome::Clean => {}
        TarOutcome::Warning(message) => tracing::warn!("{}", message),
        TarOutcome::Failed(message) => {
            let _ = tx.blocking_send(Err(io::Error::other(message)));
        }
    }
}

#[async_trait]
impl HostAccess for SshHost {
    async fn capture_snapshot(&self, path: &str, cancel: &CancellationToken) -> Result<ByteStream, HostError> {
        if cancel.is_cancelled() {
            return Err(HostError::Cancelled);
        }

        let command = tar_command(path);
        let config = self.config.clone();
        let exec_command = command.clone();
        let (session, channel) = tokio::task::spawn_blocking(move || {
            let session = connect(&config)?;
            // Large trees can go quiet for longer than the connect timeout.
            session.set_timeout(0);
            let mut channel = session.channel_session().map_err(ssh_error)?;
            channel.exec(&exec_command).map_err(ssh_error)?;
            Ok::<_, HostError>((session, channel))
        })
        .await
        .map_err(join_error)??;

        tracing::info!(host = %self.config.host, command = %command, "Streaming snapshot");
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || pump(session, channel, command, tx, cancel));

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn probe_permissions(&self) -> Result<PermissionReport, HostError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let session = connect(&config)?;
            let touch = exec(&session, &format!("touch {PROBE_FILE}"))?;
            let can_write = touch.status == 0;
            let can_delete = can_write && exec(&session, &format!("rm {PROBE_FILE}"))?.status == 0;
            let groups = exec(&session, "groups")?;
            Ok::<_, HostError>(PermissionReport {
                can_write,
                can_delete,
                has_sudo: has_sudo_group(&groups.stdout),
            })
        })
        .await
        .map_err(join_error)?
    }
}

/// Refuse to run against an account that can modify the host.
pub async fn verify_read_only(host: &dyn HostAccess) -> anyhow::Result<()> {
    let report = host.probe_permissions().await?;
    if report.has_sudo {
        tracing::warn!("Backup account is in the sudo group, consider removing it");
    }
    if !report.is_read_only() {
        anyhow::bail!(
            "Backup account has write access (write: {}, delete: {}); use a read-only account",
            report.can_write,
            report.can_delete
        );
    }
    tracing::info!("Host account is read-only");
    Ok(())
}
