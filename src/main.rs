// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for the bless boot configuration tool.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for the bless boot configuration tool.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context as _, Result};
use bless::accessor::MetadataStore;
use bless::codec::{network, VariableStore};
use bless::config::BlessConfig;
use bless::discovery::booter_information;
use bless::host::{HostSnapshot, NvramVariableStore, ProcMountTable, ProcessRunner, SnapshotHost};
use bless::info;
use bless::mount::{CommandRunner, MountTable};
use bless::{BlessError, BootTarget, Context};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::LevelFilter;
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(author = "Lukas Bower", version, about = "Boot device and bless record tool")]
struct Cli {
    /// JSON host description supplying the device registry and volume metadata.
    #[arg(long, value_name = "FILE", global = true)]
    snapshot: Option<PathBuf>,

    /// TOML configuration file (defaults to $BLESS_CONFIG).
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Emit debug diagnostics.
    #[arg(long, short, default_value_t = false, global = true)]
    verbose: bool,

    /// Only report errors.
    #[arg(long, short, default_value_t = false, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Use the live mount table, mount helpers and nvram instead of the snapshot's.
    #[arg(long, default_value_t = false, global = true)]
    system_helpers: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Describe the bless record of a volume, or the current boot volume.
    Info(InfoArgs),
    /// List the partitions and volumes involved in booting a device.
    Booters(BootersArgs),
    /// Persist a new firmware boot target.
    Setboot(SetbootArgs),
    /// Bless system folders on a mounted volume.
    BlessFolder(BlessFolderArgs),
}

#[derive(Debug, Args)]
struct InfoArgs {
    /// Mount point or path on the volume; the current boot volume when omitted.
    #[arg(value_name = "MOUNT")]
    mount: Option<PathBuf>,
    /// Print only the current boot device.
    #[arg(long, default_value_t = false)]
    getboot: bool,
    /// Emit JSON.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Args)]
struct BootersArgs {
    /// BSD name of the device.
    #[arg(value_name = "DEVICE")]
    device: String,
    /// Emit JSON.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Args)]
struct SetbootArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Boot the device through the legacy (non-native) path.
    #[arg(long, default_value_t = false)]
    legacy: bool,
    /// Loader path on the device.
    #[arg(long, value_name = "PATH")]
    file: Option<String>,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct TargetArgs {
    /// Device to boot.
    #[arg(long, value_name = "DEV")]
    device: Option<String>,
    /// Mount point of the volume to boot.
    #[arg(long, value_name = "DIR")]
    mount: Option<PathBuf>,
    /// Network boot server, `<bsdp|pxe>://<interface>@<host>[/<path>]`.
    #[arg(long, value_name = "URL")]
    netboot: Option<String>,
}

#[derive(Debug, Args)]
struct BlessFolderArgs {
    /// System folder to bless.
    #[arg(value_name = "FOLDER")]
    folder: PathBuf,
    /// Classic system folder on the same volume.
    #[arg(long, value_name = "FOLDER")]
    folder9: Option<PathBuf>,
    /// Point word 0 at the system folder even when a classic folder is given.
    #[arg(long, default_value_t = false)]
    use_x: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("bless: {err:#}");
            let code = err
                .downcast_ref::<BlessError>()
                .map_or(1, BlessError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else if quiet {
        LevelFilter::Error
    } else {
        LevelFilter::Warn
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn run(cli: Cli) -> Result<()> {
    let config = BlessConfig::resolve(cli.config.as_deref())?;
    let snapshot_path = cli
        .snapshot
        .clone()
        .ok_or_else(|| anyhow!("--snapshot is required to describe the device registry"))?;
    let host = HostSnapshot::load(&snapshot_path)
        .with_context(|| format!("loading host snapshot {}", snapshot_path.display()))?
        .into_host()?;

    let live_mounts = ProcMountTable::default();
    let live_runner = ProcessRunner;
    let live_variables = NvramVariableStore::new(&config.nvram_helper);
    let mounter = host.mounter();
    let mounts: &dyn MountTable = if cli.system_helpers {
        &live_mounts
    } else {
        &host.mounts
    };
    let runner: &dyn CommandRunner = if cli.system_helpers {
        &live_runner
    } else {
        &mounter
    };
    let variables: &dyn VariableStore = if cli.system_helpers {
        &live_variables
    } else {
        &host.variables
    };
    let metadata = host.metadata(mounts);
    let ctx = Context {
        registry: &host.registry,
        mounts,
        runner,
        metadata: &metadata as &dyn MetadataStore,
        variables,
        config: &config,
    };

    let mutated = match cli.command {
        Command::Info(args) => run_info(&ctx, &args).map(|()| false),
        Command::Booters(args) => run_booters(&ctx, &args).map(|()| false),
        Command::Setboot(args) => run_setboot(&ctx, args).map(|()| true),
        Command::BlessFolder(args) => run_bless_folder(&ctx, &args).map(|()| true),
    }?;
    if mutated && !cli.system_helpers {
        save_snapshot(&host, &snapshot_path)?;
    }
    Ok(())
}

fn save_snapshot(host: &SnapshotHost, path: &Path) -> Result<()> {
    host.snapshot()?
        .save(path)
        .with_context(|| format!("writing host snapshot {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_info(ctx: &Context<'_>, args: &InfoArgs) -> Result<()> {
    let mountpoint = match (&args.mount, args.getboot) {
        (Some(mount), false) => mount.clone(),
        (_, true) => {
            let report = info::current_boot_target(ctx)?;
            match &report.target {
                BootTarget::Network { .. } => println!("{}", report.target),
                target => println!("/dev/{}", target.device().unwrap_or_default()),
            }
            return Ok(());
        }
        (None, false) => info::current_boot_mountpoint(ctx)?,
    };
    let report = info::volume_report(ctx, &mountpoint)?;
    if args.json {
        print_json(&report)
    } else {
        print!("{}", info::render_text(&report));
        Ok(())
    }
}

fn run_booters(ctx: &Context<'_>, args: &BootersArgs) -> Result<()> {
    let booters = booter_information(ctx.registry, ctx.config, &args.device)?;
    if args.json {
        return print_json(&booters);
    }
    let sections = [
        ("Data Partitions", &booters.data_partitions),
        ("Auxiliary Partitions", &booters.auxiliary_partitions),
        ("System Partitions", &booters.system_partitions),
        ("Preboot Volumes", &booters.preboot_volumes),
    ];
    for (label, devices) in sections {
        println!("{label}:");
        for device in devices {
            println!("\t{device}");
        }
    }
    Ok(())
}

fn run_setboot(ctx: &Context<'_>, args: SetbootArgs) -> Result<()> {
    let device = match (args.target.device, args.target.mount, args.target.netboot) {
        (_, _, Some(url)) => {
            let target = parse_netboot(&url)?;
            let boot_string = info::set_boot_target(ctx, &target)?;
            println!("{boot_string}");
            return Ok(());
        }
        (Some(device), _, _) => device,
        (None, Some(mount), None) => info::device_for_mount(ctx, &mount)?,
        (None, None, None) => return Err(anyhow!("no boot target given")),
    };
    let target = if args.legacy {
        BootTarget::Legacy { device }
    } else {
        BootTarget::Disk {
            device,
            path: args.file,
        }
    };
    let boot_string = info::set_boot_target(ctx, &target)?;
    println!("{boot_string}");
    Ok(())
}

fn parse_netboot(url: &str) -> Result<BootTarget> {
    network::parse_target(url).ok_or_else(|| {
        BlessError::InvalidArgument(format!(
            "{url} is not <bsdp|pxe>://<interface>@<host>[/<path>]"
        ))
        .into()
    })
}

fn run_bless_folder(ctx: &Context<'_>, args: &BlessFolderArgs) -> Result<()> {
    let outcome = info::bless_folder(ctx, &args.folder, args.folder9.as_deref(), args.use_x)?;
    print_json(&outcome)
}
