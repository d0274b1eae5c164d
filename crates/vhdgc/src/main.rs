//! VHD garbage collector (vhdgc).
//!
//! Runs garbage collection and coalescing on one SR, or queries and
//! controls an instance already running on it.
//!
//! # Usage
//!
//! ```text
//! vhdgc --sr <UUID> [OPTIONS] <COMMAND>
//!
//! Commands:
//!   gc                   Collect garbage and coalesce until done
//!   gc-force             Stop any running GC, then collect garbage once
//!   abort                Stop the running GC
//!   state                Whether a GC is running
//!   coalesce-leaf        Atomic step of a live leaf-coalesce
//!   should-preempt       Whether the coalesce in progress is wasted
//!   coalesceable-leaves  Which of the given VDIs can be leaf-coalesced
//!   tree                 Print the VDI trees
//!   list                 Print a table of VDIs
//! ```

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand, ValueEnum};
use tabled::{Table, Tabled};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vhdgc::tree::format_size;
use vhdgc::vdi::Backing;
use vhdgc::{Engine, GcConfig, Services, Storage};
use vhdgc_core::cmd::{LvmTools, VhdUtil};
use vhdgc_core::ipc::FileAbortFlag;
use vhdgc_core::journal::MmapJournal;
use vhdgc_core::local::LocalControlPlane;
use vhdgc_core::lock::FileLockManager;
use vhdgc_core::refcount::FileRefCounter;
use vhdgc_proto::defaults::DEFAULT_SR_MOUNT_DIR;
use vhdgc_proto::GcResult;

/// VHD garbage collector.
///
/// Deletes unreferenced hidden VHDs and shortens VHD chains by
/// coalescing in file and LVM storage repositories.
#[derive(Parser)]
#[command(name = "vhdgc", version, about = "VHD garbage collector")]
struct Cli {
    /// SR uuid
    #[arg(long)]
    sr: String,

    /// SR storage type
    #[arg(long, value_enum, default_value_t = SrType::Lvhd)]
    sr_type: SrType,

    /// Directory of a file SR (default: <sr mount dir>/<sr uuid>)
    #[arg(long)]
    path: Option<PathBuf>,

    /// YAML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log file (default from configuration)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log to stderr instead of the log file
    #[arg(long)]
    log_stderr: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SrType {
    File,
    Lvhd,
}

impl SrType {
    fn as_str(&self) -> &'static str {
        match self {
            SrType::File => "file",
            SrType::Lvhd => "lvhd",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Collect garbage and coalesce until there is nothing left to do
    Gc {
        /// Detach from the terminal and run in the background
        #[arg(short = 'b', long)]
        background: bool,
        /// Report what would be done without changing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Stop any running GC, then make one garbage-collection pass
    GcForce {
        /// Continue even if some VHDs cannot be read
        #[arg(short = 'f', long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Stop the GC running on the SR and wait for it to exit
    Abort,
    /// Print whether a GC is running on the SR
    State,
    /// Atomic step of a live leaf-coalesce, run with the leaf paused
    CoalesceLeaf {
        /// Leaf VDI uuid
        #[arg(long)]
        vdi: String,
    },
    /// Print whether the coalesce in progress should be preempted
    ShouldPreempt,
    /// Print which of the given VDIs can be leaf-coalesced
    CoalesceableLeaves {
        #[arg(value_name = "VDI", required = true)]
        vdis: Vec<String>,
    },
    /// Print the VDI trees of the SR
    Tree,
    /// Print a table of the VDIs of the SR
    List,
}

#[derive(Tabled)]
struct VdiRow {
    #[tabled(rename = "UUID")]
    uuid: String,
    #[tabled(rename = "Parent")]
    parent: String,
    #[tabled(rename = "Virtual")]
    size_virt: String,
    #[tabled(rename = "Physical")]
    size_phys: String,
    #[tabled(rename = "Volume")]
    size_lv: String,
    #[tabled(rename = "Hidden")]
    hidden: bool,
    #[tabled(rename = "Flags")]
    flags: String,
}

fn main() {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => GcConfig::from_path(path),
        None => Ok(GcConfig::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vhdgc: {}", e);
            process::exit(e.exit_code());
        }
    };

    // Forking a running tokio runtime is unsound, so detach first.
    if let Commands::Gc { background: true, .. } = cli.command {
        if let Err(e) = nix::unistd::daemon(false, false) {
            eprintln!("vhdgc: failed to detach: {}", e);
            process::exit(1);
        }
    }

    init_logging(&cli, &config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            process::exit(1);
        }
    };
    let code = runtime.block_on(run(cli, config));
    process::exit(code);
}

fn init_logging(cli: &Cli, config: &GcConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if cli.log_stderr {
        builder.with_writer(std::io::stderr).init();
        return;
    }
    let path = cli.log_file.as_ref().unwrap_or(&config.log_file);
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => builder.with_ansi(false).with_writer(Mutex::new(file)).init(),
        Err(e) => {
            eprintln!("vhdgc: cannot open log file {}: {}", path.display(), e);
            builder.with_writer(std::io::stderr).init();
        }
    }
}

async fn run(cli: Cli, config: GcConfig) -> i32 {
    let engine = match build_engine(&cli, config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("failed to set up SR {}: {}", cli.sr, e);
            eprintln!("vhdgc: {}", e);
            return e.exit_code();
        }
    };

    match execute(&engine, cli.command).await {
        Ok(()) => 0,
        Err(e) if e.is_abort() => {
            info!("{}: aborted", cli.sr);
            e.exit_code()
        }
        Err(e) => {
            error!("{}: {}", cli.sr, e);
            eprintln!("vhdgc: {}", e);
            e.exit_code()
        }
    }
}

fn build_engine(cli: &Cli, config: GcConfig) -> GcResult<Engine> {
    let sr = cli.sr.as_str();

    let journal_path = config.journal_path(sr);
    if let Some(dir) = journal_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let journal = MmapJournal::open(&journal_path, config.journal_size)?;

    let vhd = Arc::new(VhdUtil::default());
    let storage = match cli.sr_type {
        SrType::File => Storage::File {
            path: cli
                .path
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SR_MOUNT_DIR).join(sr)),
            vhd,
        },
        SrType::Lvhd => Storage::Lvhd {
            lv: Arc::new(LvmTools::default()),
            vhd,
            refcount: Arc::new(FileRefCounter::new(config.refcount_dir())),
        },
    };

    // The helper is this binary again, pointed at the same storage.
    let mut helper = config.atomic_op_helper.clone();
    helper.extend(["--sr-type".to_string(), cli.sr_type.as_str().to_string()]);
    if let Some(path) = &cli.path {
        helper.extend(["--path".to_string(), path.display().to_string()]);
    }
    if let Some(path) = &cli.config {
        helper.extend(["--config".to_string(), path.display().to_string()]);
    }

    let services = Services {
        control: Arc::new(LocalControlPlane::new(config.local_control_path(), sr, helper)),
        journal: Arc::new(journal),
        locks: Arc::new(FileLockManager::new(config.lock_dir())),
        abort: Arc::new(FileAbortFlag::new(config.flag_dir())),
        storage,
    };
    Ok(Engine::new(sr, services, Arc::new(config)))
}

async fn execute(engine: &Engine, command: Commands) -> GcResult<()> {
    match command {
        Commands::Gc { background, dry_run } => {
            let res = engine.gc(dry_run).await;
            if background {
                // Nobody is waiting on the exit status.
                if let Err(e) = &res {
                    error!("gc: background run on {} failed: {}", engine.sr_uuid(), e);
                }
                return Ok(());
            }
            res
        }
        Commands::GcForce { force, dry_run } => engine.gc_force(force, dry_run).await,
        Commands::Abort => engine.abort().await,
        Commands::State => {
            let running = engine.get_state()?;
            println!("{}", if running { "running" } else { "idle" });
            Ok(())
        }
        Commands::CoalesceLeaf { vdi } => engine.coalesce_leaf_atomic(&vdi).await,
        Commands::ShouldPreempt => {
            println!("{}", engine.should_preempt().await?);
            Ok(())
        }
        Commands::CoalesceableLeaves { vdis } => {
            for uuid in engine.get_coalesceable_leaves(&vdis).await? {
                println!("{}", uuid);
            }
            Ok(())
        }
        Commands::Tree => {
            let sr = engine.inspect().await?;
            for line in sr.tree_lines() {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::List => {
            let sr = engine.inspect().await?;
            let rows: Vec<VdiRow> = sr
                .vdis
                .values()
                .map(|v| {
                    let mut flags = Vec::new();
                    if v.scan_error {
                        flags.push("unreadable");
                    }
                    let size_lv = match &v.backing {
                        Backing::Lvm(lv) => {
                            if lv.raw {
                                flags.push("raw");
                            }
                            if lv.active {
                                flags.push("active");
                            }
                            if lv.readonly {
                                flags.push("ro");
                            }
                            format_size(lv.size_lv)
                        }
                        Backing::File => "-".to_string(),
                    };
                    VdiRow {
                        uuid: v.uuid.clone(),
                        parent: v.parent.clone().unwrap_or_else(|| "-".to_string()),
                        size_virt: format_size(v.size_virt),
                        size_phys: v.size_vhd.map(format_size).unwrap_or_else(|| "?".to_string()),
                        size_lv,
                        hidden: v.hidden,
                        flags: flags.join(","),
                    }
                })
                .collect();
            println!("{}", Table::new(&rows));
            Ok(())
        }
    }
}
