//! cbench — deploy, run and supervise benchmark runs across a node pool.
//!
//! # Usage
//!
//! ```text
//! cbench alloc 8
//! cbench exec --nodes 4 -- 'hostname; uptime'
//! cbench copy data.bin 'remote:/tmp/'
//! cbench sim run --binary-dir ../build/cmake
//! cbench build fullbuild
//! cbench local --duration 60s
//! cbench wrap --grace 90s --kill 120s -- ../build/cmake/cbr --id=1
//! ```
//!
//! The process exit code is the summary code of the command: 0 on success,
//! non-zero when any node or process failed.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use cbench_core::DEFAULT_CLUSTER_FILE;
use cbench_sim::DEFAULT_SETTINGS_FILE;

mod commands;

#[derive(Parser)]
#[command(
    name = "cbench",
    about = "Cluster benchmark deployer",
    version,
    propagate_version = true
)]
struct Cli {
    /// Cluster file (node pool, gateway, paths).
    #[arg(long, global = true, default_value = DEFAULT_CLUSTER_FILE)]
    cluster: PathBuf,

    /// Simulation settings file.
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_FILE)]
    settings: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the deployment for a number of slots.
    Alloc {
        slots: usize,
        /// Fail instead of reusing nodes.
        #[arg(long)]
        no_repeat: bool,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Run a command on deployment nodes, streaming prefixed output.
    ///
    /// The command may use {host}, {user}, {index} and {node}.
    Exec {
        /// Number of deployment slots (default: every pool node once).
        #[arg(short, long)]
        nodes: Option<usize>,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Copy files to or from every node. The last spec is the destination;
    /// prefix remote paths with `remote:`.
    Copy {
        #[arg(short, long)]
        nodes: Option<usize>,
        #[arg(required = true, num_args = 2..)]
        specs: Vec<String>,
    },
    /// Cluster simulation runs.
    Sim {
        #[arg(value_enum, default_value_t = SimAction::Run)]
        action: SimAction,
        /// Directory holding the engine binaries for local analysis.
        #[arg(long, default_value = "../build/cmake")]
        binary_dir: PathBuf,
        /// Where address tables, traces and analysis output go.
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
        /// Also run the message latency pass.
        #[arg(long)]
        message_latency: bool,
    },
    /// Checkout, build and profile on every pool node.
    ///
    /// Commands: destroy, checkout, update, dependencies, build [type]
    /// [timestamp|no-timestamp], clean, profile [binary], oprofile [binary],
    /// fullbuild, patchset_create, patchset_apply, patchset_revert, deploy.
    Build {
        #[arg(required = true, value_name = "COMMAND")]
        steps: Vec<String>,
        /// Where profiles are copied back to and patch files are written.
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
        /// Local checkout to create patchsets from (default: found upwards
        /// from the current directory).
        #[arg(long)]
        source_dir: Option<PathBuf>,
    },
    /// Run a multi-server space on this machine.
    Local {
        /// Block this long, then shut the servers down.
        #[arg(long, value_parser = parse_duration_arg)]
        duration: Option<Duration>,
        #[arg(long, default_value_t = 2)]
        nservers: usize,
        #[arg(long, default_value_t = 0)]
        cseg_servers: usize,
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(long, default_value = ".")]
        binary_dir: PathBuf,
        #[arg(long, value_parser = parse_duration_arg, default_value = "5s")]
        stagger: Duration,
        #[arg(long)]
        space_config: Option<PathBuf>,
        #[arg(long)]
        cseg_config: Option<PathBuf>,
        #[arg(long)]
        pinto_config: Option<PathBuf>,
    },
    /// Run one process under supervision and exit with its status.
    Wrap {
        /// Send the graceful signal after this long.
        #[arg(long, value_parser = parse_duration_arg)]
        grace: Option<Duration>,
        /// Force kill after this long.
        #[arg(long, value_parser = parse_duration_arg)]
        kill: Option<Duration>,
        /// Resolve the program relative to this directory.
        #[arg(long)]
        binary_dir: Option<PathBuf>,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SimAction {
    Run,
    Vis,
    Clean,
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    cbench_core::parse_duration(s).ok_or_else(|| format!("invalid duration: {s}"))
}

fn init_tracing(verbose: bool, format: LogFormat) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format)?;

    let code = match cli.command {
        Commands::Alloc {
            slots,
            no_repeat,
            format,
        } => commands::alloc::alloc(&cli.cluster, slots, !no_repeat, &format)?,
        Commands::Exec { nodes, command } => {
            commands::remote::exec(&cli.cluster, nodes, &command.join(" ")).await?
        }
        Commands::Copy { nodes, specs } => {
            commands::remote::copy(&cli.cluster, nodes, &specs).await?
        }
        Commands::Sim {
            action,
            binary_dir,
            workdir,
            message_latency,
        } => {
            let opts = commands::sim::SimOptions {
                binary_dir,
                workdir,
                message_latency,
            };
            match action {
                SimAction::Run => commands::sim::run(&cli.cluster, &cli.settings, opts).await?,
                SimAction::Vis => commands::sim::vis(&cli.cluster, &cli.settings, opts).await?,
                SimAction::Clean => commands::sim::clean(&opts)?,
            }
        }
        Commands::Build {
            steps,
            workdir,
            source_dir,
        } => commands::build::build(&cli.cluster, &steps, workdir, source_dir).await?,
        Commands::Local {
            duration,
            nservers,
            cseg_servers,
            host,
            binary_dir,
            stagger,
            space_config,
            cseg_config,
            pinto_config,
        } => {
            let cluster = cbench_sim::LocalCluster {
                nservers,
                cseg_servers,
                host,
                binary_dir,
                stagger,
                space_config,
                cseg_config,
                pinto_config,
                ..Default::default()
            };
            commands::local::local(cluster, duration).await?
        }
        Commands::Wrap {
            grace,
            kill,
            binary_dir,
            command,
        } => commands::wrap::wrap(binary_dir, &command, grace, kill).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
