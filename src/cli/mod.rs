//! CLI argument parsing and command dispatch

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use llm_loadgen_core::dispatch::{DispatcherBuilder, EndConditionMode};
use llm_loadgen_core::{LoadConfig, OutputFormat, StatsAggregator};
use llm_loadgen_vendors::{ChatCompletionsExecutor, EndpointConfig, RetryPolicy, DEFAULT_API_VERSION};

#[derive(Parser, Debug)]
#[command(name = "loadgen")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a load generation test against a chat-completions deployment
    Load(LoadArgs),
    /// Validate a load configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// Base endpoint URL, e.g. https://myaccount.openai.azure.com
    pub endpoint: String,

    /// Deployment name
    #[arg(short = 'e', long)]
    pub deployment: String,

    /// TOML load configuration; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Environment variable holding the API key
    #[arg(long, default_value = "OPENAI_API_KEY")]
    pub api_key_env: String,

    /// API version
    #[arg(long, default_value = DEFAULT_API_VERSION)]
    pub api_version: String,

    /// Number of parallel clients [default: 20]
    #[arg(short = 'c', long)]
    pub clients: Option<usize>,

    /// Number of requests to send [default: until killed]
    #[arg(short = 'n', long)]
    pub requests: Option<u64>,

    /// Run duration in seconds [default: until killed]
    #[arg(short = 'd', long)]
    pub duration: Option<u64>,

    /// Whether both --requests and --duration must be reached (and) or either (or) [default: or]
    #[arg(long)]
    pub run_end_condition_mode: Option<EndConditionMode>,

    /// Request rate in requests per minute [default: as fast as possible]
    #[arg(short = 'r', long)]
    pub rate: Option<f64>,

    /// Statistics sliding window in seconds [default: 60]
    #[arg(short = 'w', long)]
    pub aggregation_window: Option<u64>,

    /// Seconds between statistics snapshots [default: 5]
    #[arg(long)]
    pub dump_interval: Option<u64>,

    /// Requested max_tokens per response
    #[arg(short = 'm', long)]
    pub max_tokens: Option<u32>,

    /// Prompt sent with every request
    #[arg(long)]
    pub prompt: Option<String>,

    /// Prompt token estimate used when responses carry no usage block
    #[arg(long)]
    pub context_tokens: Option<u64>,

    /// Snapshot output format (human or jsonl) [default: human]
    #[arg(short = 'f', long)]
    pub output_format: Option<OutputFormat>,

    /// Retry strategy (none or exponential)
    #[arg(short = 't', long, default_value = "none")]
    pub retry: RetryPolicy,
}

/// Effective arguments as logged at run start
#[derive(Serialize)]
struct LoggedArgs<'a> {
    #[serde(flatten)]
    endpoint: &'a EndpointConfig,
    #[serde(flatten)]
    load: &'a LoadConfig,
}

impl LoadArgs {
    /// Load configuration: file values (or defaults) overridden by flags, validated
    pub fn load_config(&self) -> Result<LoadConfig> {
        let mut config = match &self.config {
            Some(path) => read_config(path)?,
            None => LoadConfig::default(),
        };

        if let Some(clients) = self.clients {
            config.clients = clients;
        }
        if let Some(requests) = self.requests {
            config.requests = Some(requests);
        }
        if let Some(secs) = self.duration {
            config.duration = Some(Duration::from_secs(secs));
        }
        if let Some(mode) = self.run_end_condition_mode {
            config.run_end_condition_mode = mode;
        }
        if let Some(rate) = self.rate {
            config.rate = Some(rate);
        }
        if let Some(secs) = self.aggregation_window {
            config.aggregation_window = Duration::from_secs(secs);
        }
        if let Some(secs) = self.dump_interval {
            config.dump_interval = Duration::from_secs(secs);
        }
        if let Some(format) = self.output_format {
            config.output_format = format;
        }
        if let Some(max_tokens) = self.max_tokens {
            config.expected_gen_tokens = Some(u64::from(max_tokens));
        }

        config.validate().context("invalid load configuration")?;
        Ok(config)
    }

    /// Endpoint configuration, with the API key read from `--api-key-env`
    pub fn endpoint_config(&self) -> Result<EndpointConfig> {
        let api_key = std::env::var(&self.api_key_env).with_context(|| {
            format!("API key environment variable {} is not set", self.api_key_env)
        })?;
        if api_key.trim().is_empty() {
            bail!("API key environment variable {} is empty", self.api_key_env);
        }

        let mut config = EndpointConfig::new(&self.endpoint, &self.deployment)
            .with_api_key(api_key)
            .with_api_version(&self.api_version)
            .with_retry(self.retry);
        if let Some(prompt) = &self.prompt {
            config = config.with_prompt(prompt);
        }
        if let Some(max_tokens) = self.max_tokens {
            config = config.with_max_tokens(max_tokens);
        }
        if let Some(tokens) = self.context_tokens {
            config = config.with_context_tokens(tokens);
        }

        config.validate().context("invalid endpoint configuration")?;
        Ok(config)
    }
}

fn read_config(path: &Path) -> Result<LoadConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Execute the parsed command
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Load(args) => run_load(args).await,
        Commands::Validate { config } => {
            let config = read_config(&config)?;
            config.validate().context("invalid load configuration")?;
            tracing::info!("Configuration is valid: {}", serde_json::to_string(&config)?);
            Ok(())
        }
    }
}

async fn run_load(args: LoadArgs) -> Result<()> {
    let config = args.load_config()?;
    let endpoint = args.endpoint_config()?;

    let logged = LoggedArgs {
        endpoint: &endpoint,
        load: &config,
    };
    tracing::info!("Load test args: {}", serde_json::to_string(&logged)?);

    let executor = Arc::new(ChatCompletionsExecutor::new(&endpoint)?);
    let session = ChatCompletionsExecutor::session(&endpoint, config.clients)
        .context("failed to create HTTP session")?;

    let aggregator = Arc::new(StatsAggregator::new(config.aggregator_config()));
    let handle = Arc::clone(&aggregator)
        .start()
        .context("failed to start stats aggregator")?;

    let raw_stats = Arc::clone(&aggregator);
    let dispatcher = DispatcherBuilder::new()
        .config(&config)
        .executor(executor)
        .aggregator(Arc::clone(&aggregator))
        .session(session)
        .on_finish(move || {
            raw_stats.dump_raw_call_stats();
        })
        .build()?;

    let result = dispatcher.run().await;

    // Final snapshot covers the tail of the run
    tokio::task::spawn_blocking(move || handle.stop())
        .await
        .context("stats aggregator shutdown failed")?;

    let summary = result?;
    tracing::info!(
        calls_made = summary.calls_made,
        elapsed_secs = summary.elapsed.as_secs_f64(),
        rpm = summary.requests_per_minute(),
        terminated = summary.terminated,
        "Load test finished"
    );
    Ok(())
}
