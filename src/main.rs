use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use gram_gateway::agents::{AgentExecutor, AgentsService, InMemoryToolsetRepository, OpenRouterClient};
use gram_gateway::background::{
    register_all, register_schedules, workflows, Activities, LocalWorkflowEngine, WorkflowEngine,
};
use gram_gateway::cache::InMemoryCache;
use gram_gateway::encryption::EncryptionClient;
use gram_gateway::environments::{EnvironmentEntries, InMemoryEnvironmentRepository};
use gram_gateway::gateway::{BufferedResponseWriter, CallContext, ToolProxy};
use gram_gateway::metrics::{HttpLogAttributes, NoopToolMetrics, TracingLogClient};
use gram_gateway::startup::{display_startup_banner, init_logging, StartupLogger};
use gram_gateway::toolconfig::{CaseInsensitiveEnv, ToolCallEnv, ToolCallPlan};
use gram_gateway::GatewayConfig;

/// Seed for the development encryption key when none is configured
const DEV_ENCRYPTION_SEED: &str = "gram-gateway-dev";

const LOG_CHANNEL_CAPACITY: usize = 1024;

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = gram_gateway::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background worker: workflows, schedules and agent responses
    Worker,
    /// Execute one tool call from a YAML call plan and print the response
    Call {
        /// Tool call plan (YAML)
        #[arg(long)]
        descriptor: PathBuf,
        /// JSON request body
        #[arg(long, default_value = "{}")]
        body: String,
        /// System environment entry, repeatable
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// User-supplied configuration entry, repeatable
        #[arg(long = "user-env", value_name = "KEY=VALUE")]
        user_env: Vec<String>,
    },
    /// Load and validate the configuration
    Config {
        /// Only validate instead of printing the effective configuration
        #[arg(long)]
        check: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Worker => run_worker(config).await,
        Commands::Call {
            descriptor,
            body,
            env,
            user_env,
        } => run_call(config, descriptor, body, env, user_env).await,
        Commands::Config { check } => {
            if check {
                println!("configuration {} is valid", cli.config.display());
            } else {
                println!("{}", serde_yaml::to_string(&config)?);
            }
            Ok(())
        }
    }
}

fn build_proxy(config: &GatewayConfig) -> Result<ToolProxy> {
    let policy = Arc::new(config.guardian.build_policy()?);
    let proxy = ToolProxy::from_config(
        config,
        policy,
        Arc::new(InMemoryCache::new()),
        Arc::new(NoopToolMetrics),
        Arc::new(TracingLogClient::spawn(LOG_CHANNEL_CAPACITY)),
    )?;
    Ok(proxy)
}

async fn run_worker(config: GatewayConfig) -> Result<()> {
    display_startup_banner(gram_gateway::VERSION);

    let engine = LocalWorkflowEngine::new();
    let proxy = build_proxy(&config)?;

    let encryption = EncryptionClient::from_config(&config.encryption, DEV_ENCRYPTION_SEED)?;
    let environments = EnvironmentEntries::new(Arc::new(InMemoryEnvironmentRepository::new()), encryption);
    let toolsets = Arc::new(InMemoryToolsetRepository::new());

    let completion = Arc::new(OpenRouterClient::from_config(&config.agents)?);
    let executor = AgentExecutor::new(completion, &config.agents);
    let service = Arc::new(AgentsService::new(
        executor,
        proxy,
        environments,
        toolsets,
        Arc::new(engine.clone()) as Arc<dyn WorkflowEngine>,
        &config.agents,
        &config.workflows.task_queue,
    ));

    let activities = Activities::noop().with_agents(service);
    register_all(&engine, &activities, &config.workflows);
    register_schedules(&engine, &config.workflows).await?;

    let schedules: Vec<String> = workflows::schedules(&config.workflows)?
        .into_iter()
        .map(|spec| spec.id)
        .collect();
    StartupLogger::display_startup_info(&config, &engine.registered_workflows(), &schedules);

    info!("✅ Worker running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("🛑 Shutting down worker");
    engine.shutdown();
    Ok(())
}

fn parse_env_pairs(pairs: &[String]) -> Result<CaseInsensitiveEnv> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .with_context(|| format!("invalid environment entry '{}', expected KEY=VALUE", pair))
        })
        .collect()
}

async fn run_call(
    config: GatewayConfig,
    descriptor: PathBuf,
    body: String,
    env: Vec<String>,
    user_env: Vec<String>,
) -> Result<()> {
    let content = std::fs::read_to_string(&descriptor)
        .with_context(|| format!("failed to read call plan {}", descriptor.display()))?;
    let plan: ToolCallPlan = serde_yaml::from_str(&content)?;
    plan.validate()?;

    let proxy = build_proxy(&config)?;
    let call_env = ToolCallEnv::new(parse_env_pairs(&env)?, parse_env_pairs(&user_env)?);

    let cancel = CancellationToken::new();
    let ctx = CallContext::new(cancel.clone());
    let mut writer = BufferedResponseWriter::new();
    let mut attrs = HttpLogAttributes::new();

    let call = proxy.do_call(&mut writer, body.as_bytes(), call_env, &plan, &mut attrs, &ctx);
    tokio::select! {
        result = call => {
            if let Err(e) = result {
                error!(tool = %plan.descriptor.name, error = %e, "tool call failed");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            anyhow::bail!("tool call cancelled");
        }
    }

    let (status, headers, body) = writer.into_parts();
    println!("{}", status);
    for (name, value) in headers.iter() {
        println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
    }
    println!();
    println!("{}", String::from_utf8_lossy(&body));
    Ok(())
}
