use clap::{Parser, Subcommand};
use tracing::error;

use sner_core::config::AppConfig;
use sner_core::errors::SnerError;
use sner_core::netutils::{enumerate_network, range_to_cidrs};

mod app;
mod shutdown;

#[derive(Parser)]
#[command(name = "sner", version, about = "distributed network reconnaissance platform")]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the central server
    Server,

    /// Run the scanning agent
    Agent {
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        apikey: Option<String>,
        /// Specific queue selector
        #[arg(long)]
        queue: Option<String>,
        /// Agent capability tags
        #[arg(long, num_args = 1..)]
        caps: Vec<String>,
        /// Process a single assignment and exit
        #[arg(long)]
        oneshot: bool,
    },

    /// Planner management
    Planner {
        #[command(subcommand)]
        command: PlannerCommand,
    },

    /// Scheduler management
    Scheduler {
        #[command(subcommand)]
        command: SchedulerCommand,
    },
}

#[derive(Subcommand)]
enum PlannerCommand {
    /// Run the planner loop
    Run {
        /// Single pass over all pipelines and exit
        #[arg(long)]
        oneshot: bool,
    },
}

#[derive(Subcommand)]
enum SchedulerCommand {
    /// Add targets to a queue
    QueueEnqueue {
        queue: String,
        targets: Vec<String>,
        /// Read additional targets from a file, one per line
        #[arg(long)]
        file: Option<String>,
    },

    /// Flush all targets from a queue
    QueueFlush { queue: String },

    /// Delete all jobs of a queue
    QueuePrune { queue: String },

    /// Enumerate ip address ranges
    Enumips {
        targets: Vec<String>,
        #[arg(long)]
        file: Option<String>,
    },

    /// Convert an address range to a series of cidrs
    Rangetocidr { start: String, end: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    sner_core::logging::init(cli.debug);

    if let Err(err) = run(cli).await {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Server => app::run_server(config).await,

        Command::Agent {
            server,
            apikey,
            queue,
            caps,
            oneshot,
        } => {
            if let Some(server) = server {
                config.agent.server = server;
            }
            if let Some(apikey) = apikey {
                config.agent.apikey = apikey;
            }
            if queue.is_some() {
                config.agent.queue = queue;
            }
            if !caps.is_empty() {
                config.agent.caps = caps;
            }
            if oneshot {
                config.agent.oneshot = true;
            }
            let retval = app::run_agent(config).await?;
            if retval != 0 {
                std::process::exit(retval);
            }
            Ok(())
        }

        Command::Planner {
            command: PlannerCommand::Run { oneshot },
        } => app::run_planner(config, oneshot).await,

        Command::Scheduler { command } => run_scheduler_command(config, command).await,
    }
}

async fn run_scheduler_command(config: AppConfig, command: SchedulerCommand) -> anyhow::Result<()> {
    match command {
        SchedulerCommand::QueueEnqueue {
            queue,
            targets,
            file,
        } => {
            let ctx = app::build_context(&config).await?;
            let queue = ctx.scheduler.queue_by_ident(&queue).await?;
            let targets = with_file_lines(targets, file.as_deref())?;
            let enqueued = ctx.scheduler.enqueue(&queue, targets).await?;
            println!("enqueued {enqueued} targets");
            Ok(())
        }

        SchedulerCommand::QueueFlush { queue } => {
            let ctx = app::build_context(&config).await?;
            let queue = ctx.scheduler.queue_by_ident(&queue).await?;
            ctx.scheduler.queue_flush(&queue).await?;
            Ok(())
        }

        SchedulerCommand::QueuePrune { queue } => {
            let ctx = app::build_context(&config).await?;
            let queue = ctx.scheduler.queue_by_ident(&queue).await?;
            ctx.scheduler.queue_prune(&queue).await?;
            Ok(())
        }

        SchedulerCommand::Enumips { targets, file } => {
            for target in with_file_lines(targets, file.as_deref())? {
                for address in enumerate_network(&target)? {
                    println!("{address}");
                }
            }
            Ok(())
        }

        SchedulerCommand::Rangetocidr { start, end } => {
            for cidr in range_to_cidrs(&start, &end)? {
                println!("{cidr}");
            }
            Ok(())
        }
    }
}

fn with_file_lines(mut targets: Vec<String>, file: Option<&str>) -> Result<Vec<String>, SnerError> {
    if let Some(path) = file {
        let content = std::fs::read_to_string(path)?;
        targets.extend(content.lines().map(str::to_string));
    }
    Ok(targets)
}
