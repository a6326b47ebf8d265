use std::path::PathBuf;

use clap::{Parser, Subcommand};

use millstone::job::RunMode;
use taskmill::common::config::{ExecutorConfig, SupervisorConfig, TaskFrameworkConfig};
use taskmill::common::setup::setup_logging;
use taskmill::common::utils::network::get_hostname;
use taskmill::executor::runtime::run_executor;
use taskmill::server::bootstrap::start_server;
use taskmill::supervisor::agent::run_supervisor;

#[derive(Parser)]
#[command(author, version, about)]
struct RootOptions {
    /// Enables debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Runs the control plane
    Server(ServerOpts),
    /// Runs a supervisor agent that starts executors on this machine
    Supervisor(SupervisorOpts),
    /// Runs a single job, configured by the environment set up by a supervisor
    Executor,
}

#[derive(Parser)]
struct ServerOpts {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the port of the HTTP API
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Parser)]
struct SupervisorOpts {
    #[arg(long, default_value_t = 9000)]
    port: u16,

    /// Advertised hostname, defaults to the hostname of this machine
    #[arg(long)]
    hostname: Option<String>,

    /// Directory with executor and job logs
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Directory logs of finished jobs are copied into
    #[arg(long)]
    log_upload_dir: Option<PathBuf>,

    #[arg(long, default_value = "process", value_parser = parse_run_mode)]
    run_mode: RunMode,

    /// Executors only answer result pulls instead of pushing results
    #[arg(long)]
    disable_report: bool,
}

fn parse_run_mode(value: &str) -> Result<RunMode, String> {
    value.parse().map_err(|error: millstone::Error| error.to_string())
}

async fn command_server(opts: ServerOpts) -> anyhow::Result<()> {
    let mut config = TaskFrameworkConfig::load(opts.config.as_deref())?;
    if let Some(port) = opts.port {
        config.listen_port = port;
    }
    start_server(config).await
}

async fn command_supervisor(opts: SupervisorOpts) -> anyhow::Result<()> {
    let config = SupervisorConfig {
        listen_port: opts.port,
        hostname: get_hostname(opts.hostname),
        log_dir: std::path::absolute(&opts.log_dir)?,
        executor_program: std::env::current_exe()?,
        log_upload_dir: opts.log_upload_dir,
        run_mode: opts.run_mode,
        report_enabled: !opts.disable_report,
    };
    run_supervisor(config).await
}

async fn command_executor() -> anyhow::Result<()> {
    run_executor(ExecutorConfig::from_env()?).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = RootOptions::parse();
    setup_logging(opts.debug);

    let result = match opts.subcmd {
        SubCommand::Server(opts) => command_server(opts).await,
        SubCommand::Supervisor(opts) => command_supervisor(opts).await,
        SubCommand::Executor => command_executor().await,
    };

    if let Err(e) = result {
        log::error!("{e:?}");
        std::process::exit(1);
    }

    Ok(())
}
