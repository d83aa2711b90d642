use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

use log::debug;
use thiserror::Error;

/// Variable under which the discovered endpoint address is published.
pub const ENDPOINT_KEY: &str = "CLOUDCONTROLIP";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to update {path}: {source}")]
    Profile {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to run {command}: {source}")]
    Command {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command} exited with {status}")]
    CommandStatus { command: String, status: String },
}

/// Key/value persistence for the endpoint address. Platform-specific
/// implementations are selected at startup; the protocol core never touches
/// this surface.
pub trait EndpointStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// The store for the running platform.
pub fn default_store() -> Box<dyn EndpointStore> {
    #[cfg(windows)]
    {
        Box::new(MachineEnvStore)
    }
    #[cfg(not(windows))]
    {
        Box::new(ProfileStore::system())
    }
}

/// Persists exports in a shell profile so the value is visible to all users.
/// Any previous export of the same key is dropped before the fresh line is
/// appended.
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn system() -> Self {
        Self::at("/etc/profile")
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn export_prefix(key: &str) -> String {
        format!("export {key}=")
    }
}

impl EndpointStore for ProfileStore {
    fn get(&self, key: &str) -> Option<String> {
        if let Ok(value) = env::var(key) {
            return Some(value);
        }

        let prefix = Self::export_prefix(key);
        let contents = fs::read_to_string(&self.path).ok()?;
        contents
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix(&prefix))
            .map(|value| value.to_string())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(StoreError::Profile {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };

        let prefix = Self::export_prefix(key);
        let mut rewritten = String::with_capacity(contents.len());
        for line in contents.lines().filter(|line| !line.starts_with(&prefix)) {
            rewritten.push_str(line);
            rewritten.push('\n');
        }
        rewritten.push_str(&prefix);
        rewritten.push_str(value);
        rewritten.push('\n');

        debug!("writing {key} to {}", self.path.display());
        fs::write(&self.path, rewritten).map_err(|source| StoreError::Profile {
            path: self.path.display().to_string(),
            source,
        })
    }
}

/// Machine-wide environment variables via `SETX /M`.
#[cfg(windows)]
pub struct MachineEnvStore;

#[cfg(windows)]
impl EndpointStore for MachineEnvStore {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        run_checked("setx", &[key, value, "/M"])
    }
}

/// Registry value `HKLM\Software\CloudControl\CloudControlIp`, matching the
/// location boot-time tooling reads.
#[cfg(windows)]
pub struct RegistryStore;

#[cfg(windows)]
const REGISTRY_KEY: &str = r"HKLM\Software\CloudControl";
#[cfg(windows)]
const REGISTRY_VALUE: &str = "CloudControlIp";

#[cfg(windows)]
impl EndpointStore for RegistryStore {
    fn get(&self, _key: &str) -> Option<String> {
        use std::process::Command;

        let output = Command::new("reg")
            .args(["query", REGISTRY_KEY, "/v", REGISTRY_VALUE])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .find(|line| line.contains(REGISTRY_VALUE))
            .and_then(|line| line.split_whitespace().last())
            .map(|value| value.to_string())
    }

    fn set(&self, _key: &str, value: &str) -> Result<(), StoreError> {
        run_checked(
            "reg",
            &[
                "add",
                REGISTRY_KEY,
                "/v",
                REGISTRY_VALUE,
                "/t",
                "REG_SZ",
                "/d",
                value,
                "/f",
            ],
        )
    }
}

#[cfg(windows)]
fn run_checked(command: &str, args: &[&str]) -> Result<(), StoreError> {
    use std::process::Command;

    let output = Command::new(command)
        .args(args)
        .output()
        .map_err(|source| StoreError::Command {
            command: command.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(StoreError::CommandStatus {
            command: command.to_string(),
            status: output.status.to_string(),
        });
    }
    Ok(())
}
