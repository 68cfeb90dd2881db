// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

//! SSH session management.
//!
//! One deployment worker owns exactly one session to its host: a bounded-
//! retry TCP dial, a handshake with a ceiling, a known-hosts verification
//! with trust-on-first-use prompting, key or agent authentication, and then a
//! serialized stream of remote commands plus SFTP uploads into the host's
//! transfer buffer.
//!
//! Remote commands run under `sudo` unless told otherwise, with the sudo
//! password written to stdin and a per-command timeout. libssh2 cannot
//! deliver a signal to the remote process, so an expired timeout closes the
//! channel instead and surfaces as [`Error::CommandTimeout`], distinguishable
//! from ordinary command failure.

use crate::{utils::sh_quote, vault::SecretPrompt, Error, Result};

use ssh2::{
    CheckResult, HashType, HostKeyType, KnownHostFileKind, KnownHostKeyFormat, OpenFlags,
    OpenType, Session,
};
use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    thread::sleep,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// TCP dial attempts before an endpoint is declared unreachable.
const DIAL_ATTEMPTS: u32 = 3;

/// Pause between dial attempts on an unreachable host.
const DIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Ceiling on TCP connect and SSH handshake.
const HANDSHAKE_TIMEOUT_MS: u32 = 30_000;

/// Ceiling on a single SFTP upload.
const TRANSFER_TIMEOUT_MS: u32 = 90_000;

// libssh2's LIBSSH2_ERROR_TIMEOUT.
const RAW_TIMEOUT_CODE: i32 = -9;

/// Decision of the trust-on-first-use prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// Trust this key and append it to known_hosts.
    Add,

    /// Trust this key and every further unknown key this run.
    AddAll,

    /// Do not trust the key; the host fails, the run continues.
    Skip,

    /// Abort the whole run.
    Abort,
}

/// Collaborator deciding whether to trust an unknown host key.
pub trait HostKeyPrompt: Send + Sync {
    /// Decide what to do with an unknown host key.
    ///
    /// # Errors
    ///
    /// Will fail if the prompt cannot be shown or the operator cancels it.
    fn decide(&self, host: &str, fingerprint: &str) -> Result<TrustDecision>;
}

/// Known-hosts handling shared by every worker of a run.
pub struct TrustSettings<'run> {
    /// Path to the known_hosts file consulted and appended to.
    pub known_hosts_path: &'run Path,

    /// Serializes appends to the known_hosts file.
    pub file_lock: &'run Mutex<()>,

    /// Sticky flag set once the operator answered "add all".
    pub trust_all: &'run AtomicBool,

    /// Prompt collaborator for unknown keys.
    pub prompt: &'run dyn HostKeyPrompt,
}

/// What one worker needs to open its session.
pub struct ConnectOptions<'run> {
    /// Logical host name, used in diagnostics and journal records.
    pub host: &'run str,

    /// Socket expression to dial, `host:port` with IPv6 brackets.
    pub endpoint: &'run str,

    /// Login user.
    pub user: &'run str,

    /// Private key path; agent authentication is used when absent.
    pub identity_file: Option<&'run Path>,

    /// Prompt collaborator for key passphrases.
    pub secrets: &'run dyn SecretPrompt,
}

/// Open SSH session to one host.
pub struct RemoteSession {
    session: Session,
    host: String,
}

impl RemoteSession {
    /// Connect, verify the host key, and authenticate.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Dial`] if the endpoint stays unreachable after
    ///   retries.
    /// - Return [`Error::HostKeyMismatch`] if the presented key conflicts
    ///   with known_hosts.
    /// - Return [`Error::HostKeyRejected`] or [`Error::HostKeyAborted`] per
    ///   the trust prompt's decision.
    /// - Return [`Error::AuthFailed`] if no authentication method succeeds.
    #[instrument(skip_all, fields(host = opts.host), level = "debug")]
    pub fn connect(opts: &ConnectOptions<'_>, trust: &TrustSettings<'_>) -> Result<Self> {
        let (hostname, port) = split_endpoint(opts.endpoint)?;
        let addr = opts
            .endpoint
            .to_socket_addrs()
            .map_err(|source| Error::Dial { endpoint: opts.endpoint.into(), source })?
            .next()
            .ok_or_else(|| Error::BadEndpoint { endpoint: opts.endpoint.into() })?;

        let stream = dial(addr, opts.endpoint)?;
        let mut session = Session::new()?;
        session.set_tcp_stream(stream);
        session.set_timeout(HANDSHAKE_TIMEOUT_MS);
        session.handshake()?;
        debug!("Handshake with {} complete", opts.endpoint);

        verify_host_key(&session, opts.host, &hostname, port, trust)?;
        authenticate(&session, opts)?;
        info!("Session to {}@{} established", opts.user, opts.endpoint);

        Ok(Self { session, host: opts.host.into() })
    }

    /// Logical host name this session belongs to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Run one remote command and collect its stdout.
    ///
    /// The command is prefixed with `sudo` (unless disabled), `-S` when a
    /// password is supplied, and `-u <run_as>` when not running as root. The
    /// password (possibly empty) is written to stdin, which is then closed.
    /// `[sudo] password for` noise on stderr is not treated as failure.
    ///
    /// # Errors
    ///
    /// - Return [`Error::CommandTimeout`] if the timeout expired and the
    ///   channel was closed.
    /// - Return [`Error::CommandFailed`] if the command exited non-zero.
    pub fn run_command(
        &self,
        command: &str,
        run_as: &str,
        disable_sudo: bool,
        password: Option<&str>,
        timeout_secs: u64,
    ) -> Result<String> {
        let full = build_command_line(command, run_as, disable_sudo, password.is_some());
        debug!("Run on {}: {full}", self.host);
        self.session.set_timeout(u32::try_from(timeout_secs.saturating_mul(1000)).unwrap_or(u32::MAX));

        match self.exec(&full, password) {
            Err(Error::Ssh(error)) if is_ssh_timeout(&error) => {
                warn!("Command on {} timed out after {timeout_secs}s", self.host);
                Err(Error::CommandTimeout { command: full, seconds: timeout_secs })
            }
            Err(Error::Io(error)) if error.kind() == ErrorKind::TimedOut => {
                warn!("Command on {} timed out after {timeout_secs}s", self.host);
                Err(Error::CommandTimeout { command: full, seconds: timeout_secs })
            }
            other => other,
        }
    }

    fn exec(&self, full: &str, password: Option<&str>) -> Result<String> {
        let mut channel = self.session.channel_session()?;
        channel.exec(full)?;

        channel.write_all(password.unwrap_or("").as_bytes())?;
        channel.write_all(b"\n")?;
        channel.send_eof()?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;

        channel.wait_close()?;
        let status = channel.exit_status()?;
        let stderr = filter_sudo_noise(&stderr);

        if status != 0 {
            return Err(Error::CommandFailed {
                command: full.into(),
                stderr: if stderr.is_empty() { format!("exit status {status}") } else { stderr },
            });
        }

        if !stderr.is_empty() {
            debug!("Command on {} wrote to stderr: {stderr}", self.host);
        }

        Ok(stdout.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Upload bytes to a remote path over SFTP.
    ///
    /// # Errors
    ///
    /// - Return [`Error::UploadDenied`] if the remote side refuses the path.
    /// - Return [`Error::Ssh`] or [`Error::Io`] for transport failures.
    pub fn upload(&self, bytes: &[u8], remote_path: &str) -> Result<()> {
        debug!("Upload {} bytes to {}:{remote_path}", bytes.len(), self.host);
        self.session.set_timeout(TRANSFER_TIMEOUT_MS);

        let sftp = self.session.sftp()?;
        let mut file = sftp
            .open_mode(
                Path::new(remote_path),
                OpenFlags::WRITE | OpenFlags::TRUNCATE | OpenFlags::CREATE,
                0o600,
                OpenType::File,
            )
            .map_err(|error| map_upload_error(error, remote_path))?;

        file.write_all(bytes).map_err(|error| {
            if error.to_string().to_lowercase().contains("permission denied") {
                Error::UploadDenied { path: remote_path.into() }
            } else {
                error.into()
            }
        })?;

        Ok(())
    }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RemoteSession {{ host: {:?} }}", self.host)
    }
}

fn dial(addr: SocketAddr, endpoint: &str) -> Result<TcpStream> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match TcpStream::connect_timeout(&addr, Duration::from_millis(HANDSHAKE_TIMEOUT_MS.into()))
        {
            Ok(stream) => return Ok(stream),
            Err(error)
                if error.kind() == ErrorKind::HostUnreachable && attempt < DIAL_ATTEMPTS =>
            {
                debug!("No route to {endpoint}, retrying in {DIAL_BACKOFF:?}");
                sleep(DIAL_BACKOFF);
            }
            Err(source) => return Err(Error::Dial { endpoint: endpoint.into(), source }),
        }
    }
}

fn verify_host_key(
    session: &Session,
    host: &str,
    hostname: &str,
    port: u16,
    trust: &TrustSettings<'_>,
) -> Result<()> {
    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| Error::HostKeyUnavailable { host: host.into() })?;

    let mut known_hosts = session.known_hosts()?;
    if trust.known_hosts_path.exists() {
        known_hosts.read_file(trust.known_hosts_path, KnownHostFileKind::OpenSSH)?;
    }

    match known_hosts.check_port(hostname, port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(Error::HostKeyMismatch { host: host.into() }),
        CheckResult::NotFound | CheckResult::Failure => {
            let fingerprint = session
                .host_key_hash(HashType::Sha256)
                .map(hex::encode)
                .unwrap_or_default();

            let decision = if trust.trust_all.load(Ordering::Relaxed) {
                TrustDecision::Add
            } else {
                trust.prompt.decide(host, &fingerprint)?
            };

            match decision {
                TrustDecision::Abort => Err(Error::HostKeyAborted),
                TrustDecision::Skip => Err(Error::HostKeyRejected { host: host.into() }),
                TrustDecision::AddAll => {
                    trust.trust_all.store(true, Ordering::Relaxed);
                    append_known_host(session, trust, hostname, port, key, key_type)
                }
                TrustDecision::Add => {
                    append_known_host(session, trust, hostname, port, key, key_type)
                }
            }
        }
    }
}

// Re-reads the file under the lock so concurrent workers cannot drop each
// other's freshly trusted entries.
fn append_known_host(
    session: &Session,
    trust: &TrustSettings<'_>,
    hostname: &str,
    port: u16,
    key: &[u8],
    key_type: HostKeyType,
) -> Result<()> {
    let _guard = trust.file_lock.lock().unwrap();

    let mut known_hosts = session.known_hosts()?;
    if trust.known_hosts_path.exists() {
        known_hosts.read_file(trust.known_hosts_path, KnownHostFileKind::OpenSSH)?;
    }

    let name =
        if port == 22 { hostname.to_string() } else { format!("[{hostname}]:{port}") };
    known_hosts.add(&name, key, "added by cfgpush", key_format(key_type))?;
    known_hosts.write_file(trust.known_hosts_path, KnownHostFileKind::OpenSSH)?;
    info!("Added {name} to {:?}", trust.known_hosts_path);

    Ok(())
}

fn key_format(key_type: HostKeyType) -> KnownHostKeyFormat {
    match key_type {
        HostKeyType::Rsa => KnownHostKeyFormat::SshRsa,
        HostKeyType::Dss => KnownHostKeyFormat::SshDss,
        HostKeyType::Ecdsa256 => KnownHostKeyFormat::Ecdsa256,
        HostKeyType::Ecdsa384 => KnownHostKeyFormat::Ecdsa384,
        HostKeyType::Ecdsa521 => KnownHostKeyFormat::Ecdsa521,
        HostKeyType::Ed25519 => KnownHostKeyFormat::Ed25519,
        HostKeyType::Unknown => KnownHostKeyFormat::Unknown,
    }
}

fn authenticate(session: &Session, opts: &ConnectOptions<'_>) -> Result<()> {
    match opts.identity_file {
        Some(identity) => {
            // Unencrypted keys go through directly; encrypted ones earn one
            // passphrase prompt.
            if session.userauth_pubkey_file(opts.user, None, identity, None).is_err() {
                let passphrase =
                    opts.secrets.secret(&format!("passphrase for {}", identity.display()))?;
                session.userauth_pubkey_file(opts.user, None, identity, Some(&passphrase))?;
            }
        }
        None => {
            session.userauth_agent(opts.user)?;
        }
    }

    if !session.authenticated() {
        return Err(Error::AuthFailed { user: opts.user.into(), host: opts.host.into() });
    }

    Ok(())
}

fn is_ssh_timeout(error: &ssh2::Error) -> bool {
    matches!(error.code(), ssh2::ErrorCode::Session(RAW_TIMEOUT_CODE))
}

fn map_upload_error(error: ssh2::Error, remote_path: &str) -> Error {
    // SSH_FX_PERMISSION_DENIED
    if matches!(error.code(), ssh2::ErrorCode::SFTP(3))
        || error.message().to_lowercase().contains("permission denied")
    {
        Error::UploadDenied { path: remote_path.into() }
    } else {
        error.into()
    }
}

fn filter_sudo_noise(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| !line.contains("[sudo] password for"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Split an endpoint socket expression into hostname and port.
///
/// # Errors
///
/// - Return [`Error::BadEndpoint`] if the expression has no valid port or
///   unbalanced IPv6 brackets.
pub fn split_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let bad = || Error::BadEndpoint { endpoint: endpoint.into() };

    if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(bad)?;
        let port = rest.strip_prefix(':').ok_or_else(bad)?.parse().map_err(|_| bad())?;
        return Ok((host.into(), port));
    }

    let (host, port) = endpoint.rsplit_once(':').ok_or_else(bad)?;
    let port = port.parse().map_err(|_| bad())?;

    Ok((host.into(), port))
}

// Prefix: `sudo ` (dropped when disabled), `-S ` when a password will arrive
// on stdin, `-u <run_as>` when not running as root. The command itself runs
// under `sh -c` so operator-authored command strings keep their shell syntax
// (`&&`, pipes, redirection) instead of degrading to argv of the first word.
pub(crate) fn build_command_line(
    command: &str,
    run_as: &str,
    disable_sudo: bool,
    with_password: bool,
) -> String {
    let mut line = String::new();
    if !disable_sudo {
        line.push_str("sudo ");
        if with_password {
            line.push_str("-S ");
        }
        if run_as != "root" {
            line.push_str("-u ");
            line.push_str(run_as);
            line.push(' ');
        }
    }
    line.push_str("sh -c ");
    line.push_str(&sh_quote(command));

    line
}
