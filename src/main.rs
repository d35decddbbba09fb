use std::path::PathBuf;

use clap::{Parser, Subcommand};

use docflow::config::Config;
use docflow::orchestration::DispatcherConfig;
use docflow::plan_file::PlanFile;
use docflow::Result;

/// docflow - quality-gated, rate-limited document workflow engine
#[derive(Parser, Debug)]
#[command(name = "docflow")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    DOCFLOW_DEBUG=1     Enable debug logging (alternative to --debug)\n    RUST_LOG            Override the log filter")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.docflow/docflow.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file to use instead of ~/.docflow/docflow.toml
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate a plan file and print its execution order
    Validate {
        /// Path to the plan TOML file
        plan: PathBuf,
    },

    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    docflow::log::init(cli.debug);
    if docflow::log::is_debug() {
        if let Some(path) = docflow::log::log_path() {
            eprintln!("debug logging to {}", path.display());
        }
    }

    match cli.command {
        Command::Validate { plan } => run_validate(&plan),
        Command::Config { action } => match action {
            ConfigAction::Show => run_config_show(cli.config.as_deref()),
            ConfigAction::Init { force } => run_config_init(cli.config.as_deref(), force),
        },
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn run_validate(path: &std::path::Path) -> Result<()> {
    let plan = PlanFile::load(path)?;
    match plan.validate() {
        Ok(summary) => {
            println!("Plan OK: {}", path.display());
            println!();
            println!("Sequential ({}):", summary.sequential.len());
            for (i, id) in summary.sequential.iter().enumerate() {
                println!("  {}. {}", i + 1, id);
            }
            println!();
            println!(
                "Parallel ({}, {} dependencies):",
                summary.parallel_order.len(),
                summary.dependency_count
            );
            for (i, id) in summary.parallel_order.iter().enumerate() {
                println!("  {}. {}", i + 1, id);
            }
            Ok(())
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "plan rejected");
            eprintln!("Plan invalid: {}", err);
            Err(err)
        }
    }
}

fn run_config_show(path: Option<&std::path::Path>) -> Result<()> {
    let config = load_config(path)?;
    print!("{}", toml::to_string_pretty(&config)?);

    let dispatcher = DispatcherConfig::from(&config);
    println!();
    println!(
        "# effective limit: {} calls per {}s",
        dispatcher.effective_limit(),
        dispatcher.window.as_secs()
    );
    Ok(())
}

fn run_config_init(path: Option<&std::path::Path>, force: bool) -> Result<()> {
    let target = match path {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };
    if target.exists() && !force {
        println!("Config already exists: {} (use --force to overwrite)", target.display());
        return Ok(());
    }
    if let Some(dir) = target.parent() {
        std::fs::create_dir_all(dir)?;
    }
    Config::default().save_to(&target)?;
    println!("Wrote default config to {}", target.display());
    Ok(())
}
