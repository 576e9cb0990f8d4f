//! ssh-agent lifecycle
//!
//! Spawns a dedicated `ssh-agent` process for the run, parses its startup
//! output for the socket address and pid, injects the configured private key,
//! and terminates the process at shutdown. Also provides [`AgentSigner`], the
//! Send-safe [`Signer`] wrapper sessions use to delegate signing to the agent
//! at dial time.
//!
//! On Windows a pre-existing agent (the OpenSSH Authentication Agent service,
//! reachable via `SSH_AUTH_SOCK` or the well-known named pipe) is probed
//! before spawning a new process, to avoid proliferating agents. An agent we
//! did not spawn is never terminated.

use std::future::Future;

use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::{ssh_key, PrivateKey};
use russh::{AgentAuthError, CryptoVec, Signer};
use tokio::process::Command;
use tracing::{debug, info};

use super::error::SshError;

/// Type-erased agent connection, usable on both Unix sockets and named pipes.
pub type AgentConnection = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// A running authentication agent.
///
/// `pid` is `None` when the agent pre-existed this run (Windows probe); such
/// agents are left alone at shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentProcess {
    pub pid: Option<u32>,
    pub socket: String,
}

impl AgentProcess {
    /// Terminate the agent if this run owns it. Failures are reported so the
    /// caller can log them; a lingering agent is a leak, not a hazard.
    pub fn terminate(&self) -> Result<(), SshError> {
        match self.pid {
            Some(pid) => terminate(pid),
            None => {
                debug!("Pre-existing agent, leaving it running");
                Ok(())
            }
        }
    }
}

/// Send-safe wrapper around [`AgentClient`] implementing [`Signer`].
///
/// russh's built-in `impl Signer for AgentClient` borrows a local `PublicKey`
/// across an `.await` inside `authenticate_publickey_with`, which the compiler
/// cannot prove `Send` through RPITIT (rust-lang/rust#100013). Sessions run in
/// spawned tasks that must be `Send`, so the key is cloned to an owned value
/// before the async block.
pub struct AgentSigner<'a> {
    pub agent: &'a mut AgentConnection,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Connect to an agent socket address.
///
/// On Unix the address is a Unix domain socket path. On Windows it may be
/// either the OpenSSH named pipe or a socket path (Git for Windows agents).
pub async fn connect_agent(socket: &str) -> Result<AgentConnection, SshError> {
    #[cfg(unix)]
    {
        let agent = AgentClient::connect_uds(socket)
            .await
            .map_err(|e| SshError::AgentConnect(format!("{socket}: {e}")))?;
        Ok(agent.dynamic())
    }

    #[cfg(windows)]
    {
        if socket.starts_with(r"\\.\pipe\") {
            let agent = AgentClient::connect_named_pipe(socket)
                .await
                .map_err(|e| SshError::AgentConnect(format!("{socket}: {e}")))?;
            Ok(agent.dynamic())
        } else {
            let agent = AgentClient::connect_uds(socket)
                .await
                .map_err(|e| SshError::AgentConnect(format!("{socket}: {e}")))?;
            Ok(agent.dynamic())
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = socket;
        Err(SshError::AgentConnect(
            "ssh-agent is not supported on this platform".into(),
        ))
    }
}

/// Start an authentication agent for this run.
///
/// Launches `ssh-agent -s`, extracts `SSH_AUTH_SOCK` and `SSH_AGENT_PID` from
/// its output, and verifies the socket is reachable. On Windows an existing
/// agent is probed first; probe failure falls through to spawning.
pub async fn spawn_agent() -> Result<AgentProcess, SshError> {
    #[cfg(windows)]
    if let Some(existing) = probe_existing_agent().await {
        return Ok(existing);
    }

    let output = Command::new("ssh-agent")
        .arg("-s")
        .output()
        .await
        .map_err(|e| SshError::Spawn(e.to_string()))?;

    if !output.status.success() {
        return Err(SshError::Spawn(format!(
            "ssh-agent exited with {}",
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let (socket, pid) = parse_agent_output(&stdout)?;

    // Reachability check; a socket we cannot dial is useless to every session.
    connect_agent(&socket).await?;

    info!("Started ssh-agent (pid {pid}) at {socket}");
    Ok(AgentProcess {
        pid: Some(pid),
        socket,
    })
}

/// Probe for an agent that was already running before this process started.
#[cfg(windows)]
async fn probe_existing_agent() -> Option<AgentProcess> {
    const OPENSSH_PIPE: &str = r"\\.\pipe\openssh-ssh-agent";

    let candidates = match std::env::var("SSH_AUTH_SOCK") {
        Ok(sock) if !sock.is_empty() => vec![sock, OPENSSH_PIPE.to_string()],
        _ => vec![OPENSSH_PIPE.to_string()],
    };

    for socket in candidates {
        if connect_agent(&socket).await.is_ok() {
            info!("Reusing existing ssh-agent at {socket}");
            return Some(AgentProcess { pid: None, socket });
        }
        debug!("No agent reachable at {socket}");
    }
    None
}

/// Extract the socket address and pid from `ssh-agent -s` startup output.
///
/// The output is a series of shell assignments; the value ends at the first
/// `;`:
///
/// ```text
/// SSH_AUTH_SOCK=/tmp/ssh-XXXX/agent.123; export SSH_AUTH_SOCK;
/// SSH_AGENT_PID=124; export SSH_AGENT_PID;
/// ```
pub fn parse_agent_output(output: &str) -> Result<(String, u32), SshError> {
    let mut socket: Option<String> = None;
    let mut pid_raw: Option<&str> = None;

    for line in output.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("SSH_AUTH_SOCK=") {
            let value = value.split(';').next().unwrap_or("").trim();
            if !value.is_empty() {
                socket = Some(value.to_string());
            }
        } else if let Some(value) = line.strip_prefix("SSH_AGENT_PID=") {
            let value = value.split(';').next().unwrap_or("").trim();
            if !value.is_empty() {
                pid_raw = Some(value);
            }
        }
    }

    let socket = socket.ok_or(SshError::AgentParse("missing SSH_AUTH_SOCK"))?;
    let pid_raw = pid_raw.ok_or(SshError::AgentParse("missing SSH_AGENT_PID"))?;
    let pid = pid_raw
        .parse()
        .map_err(|_| SshError::AgentParse("non-numeric SSH_AGENT_PID"))?;
    Ok((socket, pid))
}

/// Register a private key with the agent.
///
/// The key has already been read and decrypted by the authentication
/// provider; this only performs the agent-protocol add.
pub async fn add_key(agent: &AgentProcess, key: &PrivateKey) -> Result<(), SshError> {
    let mut conn = connect_agent(&agent.socket).await?;
    conn.add_identity(key, &[])
        .await
        .map_err(|e| SshError::Key(format!("failed to add key to agent: {e}")))?;
    info!("Added key to ssh-agent at {}", agent.socket);
    Ok(())
}

/// Kill an agent process by pid.
#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<(), SshError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).map_err(|e| SshError::Terminate {
        pid,
        reason: e.to_string(),
    })
}

/// Kill an agent process by pid.
///
/// Terminates by process handle first; if opening or terminating the handle
/// fails, falls back to the `taskkill` utility.
#[cfg(windows)]
pub fn terminate(pid: u32) -> Result<(), SshError> {
    match terminate_by_handle(pid) {
        Ok(()) => Ok(()),
        Err(reason) => {
            debug!("Handle-based terminate of pid {pid} failed ({reason}), trying taskkill");
            terminate_with_taskkill(pid)
        }
    }
}

#[cfg(windows)]
fn terminate_by_handle(pid: u32) -> Result<(), String> {
    use windows_sys::Win32::Foundation::{CloseHandle, GetLastError};
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    // SAFETY: `handle` is checked for null before use and closed on every
    // path after.
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Err(format!("OpenProcess error {}", GetLastError()));
        }
        let ok = TerminateProcess(handle, 0);
        let err = GetLastError();
        CloseHandle(handle);
        if ok == 0 {
            return Err(format!("TerminateProcess error {err}"));
        }
    }
    Ok(())
}

#[cfg(windows)]
fn terminate_with_taskkill(pid: u32) -> Result<(), SshError> {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .status()
        .map_err(|e| SshError::Terminate {
            pid,
            reason: e.to_string(),
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(SshError::Terminate {
            pid,
            reason: format!("taskkill exited with {status}"),
        })
    }
}

#[cfg(not(any(unix, windows)))]
pub fn terminate(pid: u32) -> Result<(), SshError> {
    Err(SshError::Terminate {
        pid,
        reason: "process termination not supported on this platform".into(),
    })
}
