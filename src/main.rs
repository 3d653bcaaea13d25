use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use swarm_ide::agents::Priority;
use swarm_ide::providers::ProviderKind;
use swarm_ide::{logging, Mode, SwarmConfig};

#[derive(Debug, Parser)]
#[command(name = "swarm-ide", version, about = "Route code generation and debugging tasks to local LLM agents")]
struct Cli {
    /// Config file (default: ~/.config/swarm-ide/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model provider: ollama, openai-compatible or offline
    #[arg(long)]
    provider: Option<ProviderKind>,

    /// Base URL of the model server
    #[arg(long)]
    base_url: Option<String>,

    /// Model name
    #[arg(long)]
    model: Option<String>,

    /// History file, or :memory: to keep nothing
    #[arg(long)]
    history: Option<PathBuf>,

    /// Priority of submitted tasks: low, normal, high or critical
    #[arg(long)]
    priority: Option<Priority>,

    /// Run one command and exit
    #[arg(long, short = 'e')]
    exec: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// More logging (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn load_config(&self) -> Result<SwarmConfig> {
        let mut config = match &self.config {
            Some(path) => SwarmConfig::load_from(path)?,
            None => SwarmConfig::load()?,
        };
        config.apply_env();

        if let Some(provider) = self.provider {
            config.model.provider = provider;
        }
        if let Some(url) = &self.base_url {
            config.model.base_url = url.clone();
        }
        if let Some(model) = &self.model {
            config.model.model = model.clone();
        }
        if let Some(path) = &self.history {
            config.history.path = path.clone();
        }
        if let Some(priority) = self.priority {
            config.orchestrator.default_priority = priority;
        }
        Ok(config)
    }

    fn mode(&self) -> Mode {
        match &self.exec {
            Some(command) => Mode::Exec(command.clone()),
            None if std::io::stdin().is_terminal() => Mode::Interactive,
            None => Mode::Lines,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = logging::init(cli.verbose, cli.log_file.as_deref())?;

    let config = cli.load_config()?;
    let ok = swarm_ide::run(config, cli.mode()).await?;

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
