//! Remote transport over the system OpenSSH client
//!
//! Windows instances run the OpenSSH server. Rather than speaking SSH
//! ourselves, each operation spawns `ssh`/`scp` with batch-mode options, so a
//! "session" is the validated address/credential pair.
//!
//! Host keys are not verified (`StrictHostKeyChecking=no`, no known-hosts
//! file). Instances are replaced and re-imaged under the same addresses, and
//! nothing distributes their host keys to the operator. Authentication rests
//! on the operator's private key alone, so a host impersonating an instance
//! on the network path would receive the node payload and, once approved, the
//! node client identity of that instance. Deployments that need more must
//! restrict the network path between the operator and its instances.

use crate::cluster_trait::RemoteTransport;
use crate::error::ClientError;
use crate::models::{CommandOutput, Credentials, Session};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Exit code `ssh` uses for its own (connection) failures
const SSH_CONNECTION_FAILURE: i32 = 255;

/// OpenSSH based [`RemoteTransport`]
#[derive(Debug, Clone)]
pub struct SshTransport {
    connect_timeout: Duration,
}

impl SshTransport {
    /// Create a transport using the given connection timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn common_args(&self, credentials: &Credentials) -> Vec<String> {
        vec![
            "-i".to_string(),
            credentials.private_key_path.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ]
    }

    async fn ssh(&self, address: &str, credentials: &Credentials, command: &str) -> Result<CommandOutput, ClientError> {
        let output = Command::new("ssh")
            .args(self.common_args(credentials))
            .arg(format!("{}@{}", credentials.username, address))
            .arg(command)
            .output()
            .await?;
        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if result.exit_code == SSH_CONNECTION_FAILURE {
            return Err(ClientError::Connection(format!(
                "{}: {}",
                address,
                result.stderr.trim()
            )));
        }
        Ok(result)
    }

    /// Log in and run nothing; any failure is a connection failure
    async fn check_login(&self, address: &str, credentials: &Credentials) -> Result<(), ClientError> {
        let login = self.ssh(address, credentials, "exit 0").await?;
        if !login.success() {
            return Err(ClientError::Connection(format!(
                "{}: login check exited with {}",
                address, login.exit_code
            )));
        }
        Ok(())
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait::async_trait]
impl RemoteTransport for SshTransport {
    async fn connect(&self, address: &str, credentials: &Credentials) -> Result<Session, ClientError> {
        debug!("Opening SSH session to {}@{}", credentials.username, address);
        self.check_login(address, credentials).await?;
        Ok(Session {
            id: uuid::Uuid::new_v4().to_string(),
            address: address.to_string(),
            credentials: credentials.clone(),
        })
    }

    async fn copy_file(&self, session: &Session, src: &Path, dst: &str) -> Result<(), ClientError> {
        debug!("Copying {} to {}:{}", src.display(), session.address, dst);
        let output = Command::new("scp")
            .args(self.common_args(&session.credentials))
            .arg(src)
            .arg(format!(
                "{}@{}:{}",
                session.credentials.username, session.address, dst
            ))
            .output()
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        // scp exits 1 for every failure; a failed login says the host is the problem
        self.check_login(&session.address, &session.credentials).await?;
        Err(ClientError::Command(format!(
            "scp {} -> {}: {}",
            src.display(),
            dst,
            stderr.trim()
        )))
    }

    async fn run_command(&self, session: &Session, command: &str) -> Result<CommandOutput, ClientError> {
        self.ssh(&session.address, &session.credentials, command).await
    }
}
