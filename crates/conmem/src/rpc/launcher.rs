//! Starting the surrogate process.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::info;

use crate::config::TransportConfig;
use crate::error::{Error, Result};

/// A running surrogate
pub trait SurrogateProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Request termination without waiting for the process to exit
    fn kill(&mut self) -> Result<()>;
}

#[async_trait]
pub trait SurrogateLauncher: Send + Sync {
    /// Start a surrogate that will listen on loopback `port`
    async fn launch(&self, port: u16) -> Result<Box<dyn SurrogateProcess>>;
}

/// Spawns the configured executable with the port as its final argument
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }
}

#[async_trait]
impl SurrogateLauncher for ProcessLauncher {
    async fn launch(&self, port: u16) -> Result<Box<dyn SurrogateProcess>> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::LaunchFailed(format!("{}: {}", self.program.display(), e)))?;

        info!(
            "Started surrogate {} (pid {:?}) on port {}",
            self.program.display(),
            child.id(),
            port
        );
        Ok(Box::new(ChildProcess(child)))
    }
}

struct ChildProcess(Child);

impl SurrogateProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    fn kill(&mut self) -> Result<()> {
        match self.0.start_kill() {
            Ok(()) => Ok(()),
            // already reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
