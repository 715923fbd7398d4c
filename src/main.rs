use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

#[derive(Parser)]
#[command(
    name = "recnet",
    version,
    about = "Recurrent subnetwork engine: build, partition and run step loops"
)]
struct Cli {
    /// Log construction and loop progress (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the template and report diagnostics
    Check(cli::check::CheckArgs),
    /// Print which layers run before, inside and after the loop
    Partition(cli::partition::PartitionArgs),
    /// Run the plan on zero inputs and print output shapes
    Run(cli::run::RunArgs),
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Check(args) => cli::check::cmd_check(args),
        Command::Partition(args) => cli::partition::cmd_partition(args),
        Command::Run(args) => cli::run::cmd_run(args),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "recnet=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
