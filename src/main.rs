use std::sync::Arc;

use clap::Parser;
use colored::Colorize;

use nimbus_ssh::config::{Command, Config, InstancesAction, ResourceKind, TransferArgs};
use nimbus_ssh::dispatcher::{CommandDispatcher, CommandRequest};
use nimbus_ssh::error::{NimbusError, Result};
use nimbus_ssh::executor::RemoteExecutor;
use nimbus_ssh::instance::{Instance, InstanceResolver, Inventory};
use nimbus_ssh::paths::{self, CLUSTERS_FILE, VARIABLES_FILE};
use nimbus_ssh::provider::droplet::CreateOptions;
use nimbus_ssh::provider::{HttpProviderClient, Provisioner};
use nimbus_ssh::retry::RetryPolicy;
use nimbus_ssh::script::ScriptLookup;
use nimbus_ssh::shell::SshShell;
use nimbus_ssh::sync::InputRelay;
use nimbus_ssh::transfer::{Direction, Transfer};
use nimbus_ssh::variables::Variables;

#[tokio::main]
async fn main() {
    let cli = Config::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level())
        .format_timestamp(None)
        .init();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(NimbusError::Cancelled) => {
            eprintln!("[nimbus] {}", "Cancelled.".red());
            130
        }
        Err(error) => {
            eprintln!("[nimbus] {}", error.to_string().red());
            1
        }
    };
    // The stdin relay may still be blocked on a read.
    std::process::exit(code);
}

async fn run(cli: Config) -> Result<()> {
    let config_dir = paths::config_dir()?;
    let mut inventory = Inventory::load(config_dir.join(CLUSTERS_FILE))?;

    match cli.command {
        Command::Run(args) => {
            let targets = inventory.resolve(&args.target)?;
            let lookup = ScriptLookup::new(
                std::env::current_dir()?,
                &config_dir,
                paths::bundled_scripts_dir(),
            );
            let policy = RetryPolicy {
                max_attempts: args.max_attempts.max(1),
                ..RetryPolicy::default()
            };
            let executor = RemoteExecutor::new(Arc::new(SshShell::new()), lookup, config_dir)
                .with_policy(policy)
                .with_input(InputRelay::from_stdin());
            let dispatcher = CommandDispatcher::new(Arc::new(executor));

            let cancellation = dispatcher.cancellation();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("[nimbus] Interrupted, cancelling remaining instances.");
                    cancellation.cancel();
                }
            });

            let report = dispatcher
                .run(CommandRequest {
                    targets,
                    mode: args.mode(),
                    options: args.options(),
                    commands: args.commands,
                })
                .await?;
            log::info!("{} attempts made", report.attempts);
            if !report.failures.is_empty() {
                eprintln!("[nimbus] Some commands failed:");
                for failure in &report.failures {
                    eprintln!("[nimbus]   {}", failure.to_string().red());
                }
            }
            Ok(())
        }
        Command::Push(args) => transfer(&args, Direction::Push, &inventory, config_dir).await,
        Command::Pull(args) => transfer(&args, Direction::Pull, &inventory, config_dir).await,
        Command::Instances { action } => instances(action, &mut inventory),
        command => provision(command, &mut inventory, &config_dir).await,
    }
}

async fn transfer(
    args: &TransferArgs,
    direction: Direction,
    inventory: &Inventory,
    config_dir: std::path::PathBuf,
) -> Result<()> {
    let targets = inventory.resolve(&args.target)?;
    Transfer::new(args.tool(), config_dir)
        .run(&targets, &args.request(direction))
        .await
}

fn instances(action: Option<InstancesAction>, inventory: &mut Inventory) -> Result<()> {
    match action.unwrap_or(InstancesAction::List {
        target: nimbus_ssh::instance::ALL.to_string(),
    }) {
        InstancesAction::List { target } => {
            let selected = inventory.resolve(&target)?;
            for (cluster, instances) in inventory.clusters() {
                let members: Vec<&Instance> = instances
                    .iter()
                    .filter(|instance| selected.contains(instance))
                    .collect();
                if members.is_empty() {
                    continue;
                }
                println!("{}", cluster.bold());
                for instance in members {
                    println!(
                        "  {} {}@{}:{}",
                        instance.name, instance.user, instance.address, instance.port
                    );
                }
            }
            Ok(())
        }
        InstancesAction::Add {
            name,
            address,
            cluster,
            user,
            port,
            ssh_key,
        } => {
            let mut instance = Instance::new(name, address);
            if let Some(user) = user {
                instance.user = user;
            }
            if let Some(port) = port {
                instance.port = port;
            }
            if let Some(ssh_key) = ssh_key {
                instance.ssh_key = ssh_key;
            }
            eprintln!("[nimbus] Adding {} to cluster {}.", instance, cluster);
            inventory.add_instance(&cluster, instance);
            inventory.save()
        }
        InstancesAction::Remove { name } => {
            let removed = inventory.remove_instance(&name)?;
            eprintln!("[nimbus] Removed {}.", removed);
            inventory.save()
        }
    }
}

async fn provision(
    command: Command,
    inventory: &mut Inventory,
    config_dir: &std::path::Path,
) -> Result<()> {
    let variables = Variables::load(config_dir.join(VARIABLES_FILE))?;
    let client = HttpProviderClient::from_variables(&variables)?;
    let provisioner = Provisioner::new(Arc::new(client));

    match command {
        Command::Create(args) => {
            let options = CreateOptions {
                size: args.size(),
                region: args.region(),
                image: args.image.image(),
                ssh_pub_key: args.ssh_pub_key.clone(),
                ssh_key: args.ssh_key.clone(),
                ssh_port: args.ssh_port,
                backups_enabled: args.backups_enabled,
                private_networking: args.private_networking,
                ..CreateOptions::new(args.name.clone(), args.cluster.clone())
            };
            provisioner.create(&options, inventory, config_dir).await?;
        }
        Command::PowerOn(args) => {
            for instance in inventory.resolve(&args.target)? {
                provisioner.power_on(&instance, inventory).await?;
            }
        }
        Command::Shutdown(args) => {
            for instance in inventory.resolve(&args.target)? {
                provisioner.shutdown(&instance, inventory).await?;
            }
        }
        Command::Reboot(args) => {
            for instance in inventory.resolve(&args.target)? {
                provisioner.reboot(&instance, inventory).await?;
            }
        }
        Command::Snapshot { instance, name } => {
            for instance in inventory.resolve(&instance)? {
                provisioner.snapshot(&instance, &name, inventory).await?;
            }
        }
        Command::Rebuild { target, image } => {
            let image = image.image().ok_or_else(|| {
                NimbusError::Config(
                    "One of --image-id, --image-slug or --image-name is required.".into(),
                )
            })?;
            for instance in inventory.resolve(&target.target)? {
                provisioner.rebuild(&instance, &image, inventory).await?;
            }
        }
        Command::Resize {
            target,
            size,
            skip_boot,
        } => {
            let size = size
                .size()
                .ok_or_else(|| NimbusError::Config("A size is required.".into()))?;
            for instance in inventory.resolve(&target.target)? {
                provisioner
                    .resize(&instance, &size, skip_boot, inventory)
                    .await?;
            }
        }
        Command::Destroy(args) => {
            for instance in inventory.resolve(&args.target)? {
                provisioner.destroy(&instance, inventory).await?;
            }
        }
        Command::List { kind } => list(&provisioner, kind).await?,
        Command::Run(_) | Command::Push(_) | Command::Pull(_) | Command::Instances { .. } => {}
    }
    Ok(())
}

async fn list(provisioner: &Provisioner, kind: ResourceKind) -> Result<()> {
    match kind {
        ResourceKind::Keys => {
            for key in provisioner.keys().await? {
                println!("{:>10}  {}", key.id, key.name);
            }
        }
        ResourceKind::Images | ResourceKind::Snapshots => {
            let images = if kind == ResourceKind::Images {
                provisioner.images().await?
            } else {
                provisioner.snapshots().await?
            };
            for image in images {
                println!(
                    "{:>10}  {:<24} {}",
                    image.id,
                    image.slug.as_deref().unwrap_or("-"),
                    image.name
                );
            }
        }
        ResourceKind::Sizes | ResourceKind::Regions => {
            let resources = if kind == ResourceKind::Sizes {
                provisioner.sizes().await?
            } else {
                provisioner.regions().await?
            };
            for resource in resources {
                println!(
                    "{:>10}  {:<12} {}",
                    resource.id,
                    resource.slug.as_deref().unwrap_or("-"),
                    resource.name
                );
            }
        }
        ResourceKind::Droplets => {
            for droplet in provisioner.droplets().await? {
                println!(
                    "{:>10}  {:<24} {:<16} {}",
                    droplet.id,
                    droplet.name,
                    droplet.ip_address.as_deref().unwrap_or("-"),
                    droplet.status.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}
