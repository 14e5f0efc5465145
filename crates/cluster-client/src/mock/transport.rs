//! In-memory Windows hosts behind a [`RemoteTransport`]

use crate::cluster_trait::RemoteTransport;
use crate::error::ClientError;
use crate::models::*;
use crate::windows::HostCommand;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// State of one simulated host
#[derive(Debug, Default, Clone)]
pub(crate) struct MockHost {
    pub(crate) files: HashMap<String, Vec<u8>>,
    pub(crate) services: HashMap<String, bool>,
    pub(crate) reachable: bool,
    pub(crate) refuse_connects: u32,
    pub(crate) corrupt_copies: u32,
    pub(crate) connects: u32,
    pub(crate) copies: u32,
    pub(crate) commands: Vec<String>,
    pub(crate) active: u32,
    pub(crate) max_active: u32,
}

/// Mock transport for testing
///
/// Each address maps to a simulated host with a file system and a service
/// table. Unknown addresses refuse connections, like an instance that has
/// disappeared.
#[derive(Clone, Default)]
pub struct MockTransport {
    pub(crate) hosts: Arc<Mutex<HashMap<String, MockHost>>>,
    pub(crate) latency: Arc<Mutex<Option<Duration>>>,
}

impl MockTransport {
    /// Create a mock transport with no hosts
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reachable, empty host (for test setup)
    pub fn add_host(&self, address: &str) {
        self.hosts.lock().unwrap().insert(
            address.to_string(),
            MockHost {
                reachable: true,
                ..Default::default()
            },
        );
    }

    /// Make a host refuse (or accept) all connections
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if let Some(host) = self.hosts.lock().unwrap().get_mut(address) {
            host.reachable = reachable;
        }
    }

    /// Refuse the next `count` connection attempts to a host
    pub fn refuse_next_connects(&self, address: &str, count: u32) {
        if let Some(host) = self.hosts.lock().unwrap().get_mut(address) {
            host.refuse_connects = count;
        }
    }

    /// Corrupt the next `count` file copies to a host
    pub fn corrupt_next_copies(&self, address: &str, count: u32) {
        if let Some(host) = self.hosts.lock().unwrap().get_mut(address) {
            host.corrupt_copies = count;
        }
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Contents of a file on a host
    pub fn file(&self, address: &str, path: &str) -> Option<Vec<u8>> {
        self.hosts
            .lock()
            .unwrap()
            .get(address)
            .and_then(|h| h.files.get(path).cloned())
    }

    /// Place a file on a host (for test setup)
    pub fn put_file(&self, address: &str, path: &str, contents: &[u8]) {
        if let Some(host) = self.hosts.lock().unwrap().get_mut(address) {
            host.files.insert(path.to_string(), contents.to_vec());
        }
    }

    /// Whether a service is installed and running on a host
    pub fn service_running(&self, address: &str, name: &str) -> bool {
        self.hosts
            .lock()
            .unwrap()
            .get(address)
            .and_then(|h| h.services.get(name).copied())
            .unwrap_or(false)
    }

    /// Number of successful connections to a host
    pub fn connect_count(&self, address: &str) -> u32 {
        self.hosts.lock().unwrap().get(address).map_or(0, |h| h.connects)
    }

    /// Number of file copies to a host
    pub fn copy_count(&self, address: &str) -> u32 {
        self.hosts.lock().unwrap().get(address).map_or(0, |h| h.copies)
    }

    /// Commands run on a host, in order
    pub fn commands(&self, address: &str) -> Vec<String> {
        self.hosts
            .lock()
            .unwrap()
            .get(address)
            .map(|h| h.commands.clone())
            .unwrap_or_default()
    }

    /// Highest number of operations that were in flight against a host at once
    pub fn max_concurrent_operations(&self, address: &str) -> u32 {
        self.hosts.lock().unwrap().get(address).map_or(0, |h| h.max_active)
    }

    /// Addresses of all hosts
    pub fn addresses(&self) -> HashSet<String> {
        self.hosts.lock().unwrap().keys().cloned().collect()
    }

    fn begin(&self, address: &str) -> Result<(), ClientError> {
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts
            .get_mut(address)
            .filter(|h| h.reachable)
            .ok_or_else(|| ClientError::Connection(format!("{address}: connection refused")))?;
        host.active += 1;
        host.max_active = host.max_active.max(host.active);
        Ok(())
    }

    fn end(&self, address: &str) {
        if let Some(host) = self.hosts.lock().unwrap().get_mut(address) {
            host.active = host.active.saturating_sub(1);
        }
    }

    async fn delay(&self) {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn execute(&self, address: &str, line: &str) -> Result<CommandOutput, ClientError> {
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts
            .get_mut(address)
            .ok_or_else(|| ClientError::Connection(format!("{address}: connection reset")))?;
        host.commands.push(line.to_string());

        let Some(command) = HostCommand::parse(line) else {
            return Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("unrecognized command: {line}"),
            });
        };
        let output = match command {
            HostCommand::FileHash { path } => CommandOutput::ok(
                host.files
                    .get(&path)
                    .map(|c| hex::encode_upper(Sha256::digest(c)))
                    .unwrap_or_default(),
            ),
            HostCommand::ReadFile { path } => {
                use base64::Engine;
                CommandOutput::ok(
                    host.files
                        .get(&path)
                        .map(|c| base64::engine::general_purpose::STANDARD.encode(c))
                        .unwrap_or_default(),
                )
            }
            HostCommand::WriteFile { path, contents } => {
                host.files.insert(path, contents);
                CommandOutput::ok("")
            }
            HostCommand::RemoveFile { path } => {
                host.files.remove(&path);
                CommandOutput::ok("")
            }
            HostCommand::EnsureDirectory { .. } => CommandOutput::ok(""),
            HostCommand::ServiceStatus { name } => CommandOutput::ok(match host.services.get(&name) {
                Some(true) => "Running",
                Some(false) => "Stopped",
                None => "",
            }),
            HostCommand::CreateService { name, .. } => {
                host.services.entry(name).or_insert(false);
                CommandOutput::ok("")
            }
            HostCommand::StartService { name } => match host.services.get_mut(&name) {
                Some(running) => {
                    *running = true;
                    CommandOutput::ok("")
                }
                None => CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("Cannot find any service with service name '{name}'"),
                },
            },
            HostCommand::StopService { name } => {
                if let Some(running) = host.services.get_mut(&name) {
                    *running = false;
                }
                CommandOutput::ok("")
            }
        };
        Ok(output)
    }
}

#[async_trait::async_trait]
impl RemoteTransport for MockTransport {
    async fn connect(&self, address: &str, credentials: &Credentials) -> Result<Session, ClientError> {
        {
            let mut hosts = self.hosts.lock().unwrap();
            let host = hosts
                .get_mut(address)
                .filter(|h| h.reachable)
                .ok_or_else(|| ClientError::Connection(format!("{address}: connection refused")))?;
            if host.refuse_connects > 0 {
                host.refuse_connects -= 1;
                return Err(ClientError::Connection(format!("{address}: connection refused")));
            }
        }
        self.begin(address)?;
        self.delay().await;
        self.end(address);
        if let Some(host) = self.hosts.lock().unwrap().get_mut(address) {
            host.connects += 1;
        }
        Ok(Session {
            id: uuid::Uuid::new_v4().to_string(),
            address: address.to_string(),
            credentials: credentials.clone(),
        })
    }

    async fn copy_file(&self, session: &Session, src: &Path, dst: &str) -> Result<(), ClientError> {
        let mut contents = std::fs::read(src)?;
        self.begin(&session.address)?;
        self.delay().await;
        self.end(&session.address);
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts
            .get_mut(&session.address)
            .ok_or_else(|| ClientError::Connection(format!("{}: connection reset", session.address)))?;
        if host.corrupt_copies > 0 {
            host.corrupt_copies -= 1;
            contents.truncate(contents.len() / 2);
        }
        host.copies += 1;
        host.files.insert(dst.to_string(), contents);
        Ok(())
    }

    async fn run_command(&self, session: &Session, command: &str) -> Result<CommandOutput, ClientError> {
        self.begin(&session.address)?;
        self.delay().await;
        self.end(&session.address);
        self.execute(&session.address, command)
    }
}
