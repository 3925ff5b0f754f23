//! Configuration for Nimbus.
//!
//! Holds clap structs for command line arguments and flags. Persistent configuration
//! (inventory, variables, scripts) lives in the config directory; see `paths`.

use std::collections::BTreeMap;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::dispatcher::Mode;
use crate::executor::ExecOptions;
use crate::instance::ALL;
use crate::provider::droplet::{ImageRef, ResourceRef};
use crate::transfer::{Direction, Rsync, Scp, TransferRequest, TransferTool};

#[derive(Parser)]
#[command(version, author, about = "Run commands across a fleet and provision it on the cloud")]
pub struct Config {
    /// Log more (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    pub fn log_level(&self) -> log::LevelFilter {
        if self.quiet {
            return log::LevelFilter::Error;
        }
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Run commands or script files on an instance, a cluster, or all
    Run(RunArgs),
    /// Copy a local file or directory to instances
    Push(TransferArgs),
    /// Copy a file or directory from instances to the local machine
    Pull(TransferArgs),
    /// Show or edit the inventory
    Instances {
        #[command(subcommand)]
        action: Option<InstancesAction>,
    },
    /// Create a droplet and add it to a cluster
    Create(CreateArgs),
    /// Power on droplets
    PowerOn(TargetArgs),
    /// Shut droplets down
    Shutdown(TargetArgs),
    /// Reboot droplets
    Reboot(TargetArgs),
    /// Shut a droplet down and snapshot it
    Snapshot {
        /// Instance name
        instance: String,
        /// Name of the new snapshot
        name: String,
    },
    /// Rebuild droplets from an image
    Rebuild {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        image: ImageArgs,
    },
    /// Shut droplets down and resize them
    Resize {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        size: SizeArgs,
        /// Don't power the droplet back on afterwards
        #[arg(long)]
        skip_boot: bool,
    },
    /// Destroy droplets and remove them from the inventory
    Destroy(TargetArgs),
    /// List provider resources
    List {
        #[arg(value_enum)]
        kind: ResourceKind,
    },
}

#[derive(Args)]
pub struct TargetArgs {
    /// Instance name, cluster name, or `all`
    pub target: String,
}

#[derive(Args)]
pub struct RunArgs {
    /// Instance name, cluster name, or `all`
    pub target: String,

    /// Inline commands or script files, run in order
    #[arg(required = true)]
    pub commands: Vec<String>,

    /// Run on all instances at once instead of one after another
    #[arg(long, short)]
    pub parallel: bool,

    /// Keep going when a command fails
    #[arg(long, short = 'c')]
    pub continue_on_error: bool,

    /// Environment variable for the remote commands (KEY=VALUE, repeatable)
    #[arg(long, short, value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Log in as this user on every instance
    #[arg(long)]
    pub user: Option<String>,

    /// Private key for every instance
    #[arg(long)]
    pub ssh_key: Option<String>,

    /// Remote interpreter for commands and scripts
    #[arg(long, default_value = "bash")]
    pub shell: String,

    /// Attempts per command when the connection fails
    #[arg(long, default_value = "3")]
    pub max_attempts: u32,
}

impl RunArgs {
    pub fn mode(&self) -> Mode {
        if self.parallel {
            Mode::Parallel
        } else {
            Mode::Sequential
        }
    }

    pub fn options(&self) -> ExecOptions {
        ExecOptions {
            continue_on_error: self.continue_on_error,
            env: self.env.iter().cloned().collect::<BTreeMap<_, _>>(),
            user: self.user.clone(),
            ssh_key: self.ssh_key.clone(),
            shell: self.shell.clone(),
        }
    }
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[derive(Args)]
pub struct TransferArgs {
    /// Instance name, cluster name, or `all`
    pub target: String,

    /// Local paths are relative to `<config>/files` unless absolute
    pub source: String,

    /// `{instance}` is replaced with each instance's name
    pub dest: String,

    /// Use rsync instead of scp
    #[arg(long)]
    pub rsync: bool,

    /// Log in as this user on every instance
    #[arg(long)]
    pub user: Option<String>,
}

impl TransferArgs {
    pub fn tool(&self) -> Box<dyn TransferTool> {
        if self.rsync {
            Box::new(Rsync)
        } else {
            Box::new(Scp)
        }
    }

    pub fn request(&self, direction: Direction) -> TransferRequest {
        TransferRequest {
            direction,
            source: self.source.clone(),
            dest: self.dest.clone(),
            user: self.user.clone(),
        }
    }
}

#[derive(Subcommand)]
pub enum InstancesAction {
    /// List instances of a cluster, or of every cluster
    List {
        #[arg(default_value = ALL)]
        target: String,
    },
    /// Add an existing machine to a cluster
    Add {
        name: String,
        address: String,
        #[arg(long, default_value = "default")]
        cluster: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        ssh_key: Option<String>,
    },
    /// Remove an instance from the inventory
    Remove { name: String },
}

#[derive(Args)]
#[group(multiple = false)]
pub struct ImageArgs {
    #[arg(long)]
    pub image_id: Option<u64>,
    #[arg(long)]
    pub image_slug: Option<String>,
    #[arg(long)]
    pub image_name: Option<String>,
}

impl ImageArgs {
    pub fn image(&self) -> Option<ImageRef> {
        if let Some(id) = self.image_id {
            Some(ImageRef::Id(id))
        } else if let Some(slug) = &self.image_slug {
            Some(ImageRef::Slug(slug.clone()))
        } else {
            self.image_name.clone().map(ImageRef::Name)
        }
    }
}

#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct SizeArgs {
    #[arg(long)]
    pub size_id: Option<u64>,
    #[arg(long)]
    pub size_slug: Option<String>,
}

impl SizeArgs {
    pub fn size(&self) -> Option<ResourceRef> {
        resource(self.size_id, &self.size_slug)
    }
}

fn resource(id: Option<u64>, slug: &Option<String>) -> Option<ResourceRef> {
    match (id, slug) {
        (Some(id), _) => Some(ResourceRef::Id(id)),
        (None, Some(slug)) => Some(ResourceRef::Slug(slug.clone())),
        (None, None) => None,
    }
}

#[derive(Args)]
pub struct CreateArgs {
    /// Name of the new instance
    pub name: String,

    #[arg(long, default_value = "default")]
    pub cluster: String,

    #[command(flatten)]
    pub image: ImageArgs,

    #[arg(long, conflicts_with = "size_slug")]
    pub size_id: Option<u64>,
    #[arg(long)]
    pub size_slug: Option<String>,

    #[arg(long, conflicts_with = "region_slug")]
    pub region_id: Option<u64>,
    #[arg(long)]
    pub region_slug: Option<String>,

    /// Public key to authorize on the droplet
    #[arg(long, default_value = "nimbus.key.pub")]
    pub ssh_pub_key: String,

    /// Private key recorded for the instance
    #[arg(long)]
    pub ssh_key: Option<String>,

    #[arg(long)]
    pub ssh_port: Option<u16>,

    #[arg(long)]
    pub backups_enabled: bool,

    #[arg(long)]
    pub private_networking: bool,
}

impl CreateArgs {
    pub fn size(&self) -> Option<ResourceRef> {
        resource(self.size_id, &self.size_slug)
    }

    pub fn region(&self) -> Option<ResourceRef> {
        resource(self.region_id, &self.region_slug)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResourceKind {
    Keys,
    Images,
    Snapshots,
    Sizes,
    Regions,
    Droplets,
}
