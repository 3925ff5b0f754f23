//! Copying files to and from instances with `scp` or `rsync`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{NimbusError, Result};
use crate::instance::Instance;
use crate::palette::Palette;
use crate::paths::resolve_under;
use crate::shell::Printer;

/// Replaced with each instance's name in the destination path.
pub const INSTANCE_PLACEHOLDER: &str = "{instance}";

/// Local paths that aren't absolute live under this directory of the config dir.
pub const FILES_DIR: &str = "files";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local to remote.
    Push,
    /// Remote to local.
    Pull,
}

/// One side of a copy, as the transfer tool should see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub source: String,
    pub dest: String,
}

/// Connection details for one instance.
#[derive(Debug, Clone)]
pub struct Target {
    pub user: String,
    pub address: String,
    pub port: u16,
    pub ssh_key: PathBuf,
}

impl Target {
    fn remote(&self, path: &str) -> String {
        format!("{}@{}:{}", self.user, self.address, path)
    }
}

/// A program that copies files over ssh.
pub trait TransferTool: Send + Sync {
    fn program(&self) -> &str;

    /// Full argument list for copying `endpoints.source` to `endpoints.dest`.
    fn args(&self, target: &Target, endpoints: &Endpoints) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Scp;

impl TransferTool for Scp {
    fn program(&self) -> &str {
        "scp"
    }

    fn args(&self, target: &Target, endpoints: &Endpoints) -> Vec<String> {
        vec![
            "-r".to_string(),
            "-i".to_string(),
            target.ssh_key.display().to_string(),
            "-P".to_string(),
            target.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            endpoints.source.clone(),
            endpoints.dest.clone(),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Rsync;

impl TransferTool for Rsync {
    fn program(&self) -> &str {
        "rsync"
    }

    fn args(&self, target: &Target, endpoints: &Endpoints) -> Vec<String> {
        vec![
            "-e".to_string(),
            format!(
                "ssh -p {} -i {} -o StrictHostKeyChecking=no",
                target.port,
                target.ssh_key.display()
            ),
            "-varuzP".to_string(),
            "--delete".to_string(),
            "--ignore-errors".to_string(),
            endpoints.source.clone(),
            endpoints.dest.clone(),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: Direction,
    pub source: String,
    /// May contain `INSTANCE_PLACEHOLDER`.
    pub dest: String,
    pub user: Option<String>,
}

pub struct Transfer {
    tool: Box<dyn TransferTool>,
    config_dir: PathBuf,
}

impl Transfer {
    pub fn new(tool: Box<dyn TransferTool>, config_dir: PathBuf) -> Self {
        Self { tool, config_dir }
    }

    fn local(&self, path: &str) -> PathBuf {
        resolve_under(&self.config_dir.join(FILES_DIR), path)
    }

    /// Source and destination for `instance`, with the placeholder filled in.
    pub fn endpoints(
        &self,
        instance: &Instance,
        target: &Target,
        request: &TransferRequest,
    ) -> Endpoints {
        let dest = request.dest.replace(INSTANCE_PLACEHOLDER, &instance.name);
        match request.direction {
            Direction::Push => Endpoints {
                source: self.local(&request.source).display().to_string(),
                dest: target.remote(&dest),
            },
            Direction::Pull => Endpoints {
                source: target.remote(&request.source),
                dest: self.local(&dest).display().to_string(),
            },
        }
    }

    fn target(&self, instance: &Instance, request: &TransferRequest) -> Target {
        Target {
            user: request.user.clone().unwrap_or_else(|| instance.user.clone()),
            address: instance.address.clone(),
            port: instance.port,
            ssh_key: instance.key_path(&self.config_dir),
        }
    }

    /// Copies to or from each instance in turn. Stops at the first failed copy.
    pub async fn run(&self, instances: &[Instance], request: &TransferRequest) -> Result<()> {
        let mut palette = Palette::new();
        for instance in instances {
            let printer = Printer::new(instance, palette.allocate());
            let target = self.target(instance, request);
            let endpoints = self.endpoints(instance, &target, request);

            if request.direction == Direction::Pull {
                if let Some(parent) = Path::new(&endpoints.dest).parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }

            printer.line(&format!(
                "=== {} {} -> {} ===",
                self.tool.program(),
                endpoints.source,
                endpoints.dest
            ));
            let status = Command::new(self.tool.program())
                .args(self.tool.args(&target, &endpoints))
                .stdin(Stdio::null())
                .status()
                .await?;
            if !status.success() {
                let status = match status.code() {
                    Some(code) => format!("exit code {}", code),
                    None => "killed by signal".to_string(),
                };
                printer.notice(&format!("Transfer failed ({}).", status));
                return Err(NimbusError::Transfer {
                    instance: instance.name.clone(),
                    status,
                });
            }
            printer.line("=== done ===");
        }
        Ok(())
    }
}
