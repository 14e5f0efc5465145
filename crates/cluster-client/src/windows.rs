//! Typed PowerShell commands run on Windows instances
//!
//! Every remote effect the operator performs is one of these commands, so
//! checks ("is the file already there with this hash?", "is the service
//! running?") and effects are built the same way and can be interpreted by
//! the mock host.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const PREFIX: &str = "powershell.exe -NonInteractive -NoProfile -Command ";

/// A command understood by the operator's Windows hosts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    /// Print the upper-case SHA-256 of a file, or nothing if it does not exist
    FileHash { path: String },
    /// Print a file's contents as base64, or nothing if it does not exist
    ReadFile { path: String },
    /// Write bytes to a file, replacing it
    WriteFile { path: String, contents: Vec<u8> },
    /// Delete a file if present
    RemoveFile { path: String },
    /// Create a directory (and parents) if missing
    EnsureDirectory { path: String },
    /// Print the service status ("Running", "Stopped"), or nothing if not installed
    ServiceStatus { name: String },
    /// Register a service if missing
    CreateService { name: String, binary_path: String },
    /// Start a service
    StartService { name: String },
    /// Stop a service if running
    StopService { name: String },
}

impl HostCommand {
    /// Render as a command line for the remote shell
    pub fn to_command_line(&self) -> String {
        let script = match self {
            HostCommand::FileHash { path } => format!(
                "if (Test-Path '{path}') {{ (Get-FileHash -Algorithm SHA256 -Path '{path}').Hash }}"
            ),
            HostCommand::ReadFile { path } => format!(
                "if (Test-Path '{path}') {{ [Convert]::ToBase64String([IO.File]::ReadAllBytes('{path}')) }}"
            ),
            HostCommand::WriteFile { path, contents } => format!(
                "[IO.File]::WriteAllBytes('{path}', [Convert]::FromBase64String('{}'))",
                STANDARD.encode(contents)
            ),
            HostCommand::RemoveFile { path } => {
                format!("Remove-Item -Force -ErrorAction SilentlyContinue -Path '{path}'")
            }
            HostCommand::EnsureDirectory { path } => {
                format!("New-Item -ItemType Directory -Force -Path '{path}' | Out-Null")
            }
            HostCommand::ServiceStatus { name } => {
                format!("(Get-Service -Name '{name}' -ErrorAction SilentlyContinue).Status")
            }
            HostCommand::CreateService { name, binary_path } => format!(
                "if (-not (Get-Service -Name '{name}' -ErrorAction SilentlyContinue)) {{ New-Service -Name '{name}' -BinaryPathName '{binary_path}' -StartupType Automatic | Out-Null }}"
            ),
            HostCommand::StartService { name } => format!("Start-Service -Name '{name}'"),
            HostCommand::StopService { name } => {
                format!("Stop-Service -Force -ErrorAction SilentlyContinue -Name '{name}'")
            }
        };
        format!("{PREFIX}\"{script}\"")
    }

    /// Parse a command line produced by [`HostCommand::to_command_line`]
    pub fn parse(line: &str) -> Option<Self> {
        let script = line.strip_prefix(PREFIX)?.strip_prefix('"')?.strip_suffix('"')?;
        let quoted: Vec<&str> = script.split('\'').skip(1).step_by(2).collect();
        let first = || quoted.first().map(|s| (*s).to_string());

        if script.contains("Get-FileHash") {
            Some(HostCommand::FileHash { path: first()? })
        } else if script.contains("ToBase64String") {
            Some(HostCommand::ReadFile { path: first()? })
        } else if script.contains("WriteAllBytes") {
            let contents = STANDARD.decode(quoted.get(1)?).ok()?;
            Some(HostCommand::WriteFile { path: first()?, contents })
        } else if script.starts_with("Remove-Item") {
            Some(HostCommand::RemoveFile { path: first()? })
        } else if script.starts_with("New-Item") {
            Some(HostCommand::EnsureDirectory { path: first()? })
        } else if script.contains("New-Service") {
            Some(HostCommand::CreateService {
                name: first()?,
                binary_path: quoted.get(2)?.to_string(),
            })
        } else if script.contains(").Status") {
            Some(HostCommand::ServiceStatus { name: first()? })
        } else if script.starts_with("Start-Service") {
            Some(HostCommand::StartService { name: first()? })
        } else if script.starts_with("Stop-Service") {
            Some(HostCommand::StopService { name: first()? })
        } else {
            None
        }
    }
}
