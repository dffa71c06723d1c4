use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokenlane::config::Config;
use tokenlane::llm::{ChatOutput, ChatRequest, TaskResult};
use tokenlane::scheduler::{Manager, TaskSpec};

mod cli;

use cli::Cli;
use cli::commands::Commands;

fn setup_logging(default_filter: &str) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tokenlane")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("tokenlane.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn build_request(config: &Config, prompt: &str, system: Option<&str>, max_tokens: Option<u32>) -> ChatRequest {
    let system = system.unwrap_or(&config.defaults.system_prompt);
    ChatRequest::new(system)
        .with_user_message(prompt)
        .with_max_tokens(max_tokens.unwrap_or(config.defaults.max_tokens))
        .with_temperature(config.defaults.temperature)
}

fn print_output(output: &ChatOutput) {
    match (output.content(), output.function_call()) {
        (Some(text), _) => println!("{}", text),
        (None, Some(call)) => println!("{} {}({})", "function_call:".cyan(), call.name, call.arguments),
        (None, None) => println!("{}", "(empty completion)".yellow()),
    }
}

async fn handle_ask(
    manager: &Arc<Manager>,
    config: &Config,
    request: AskRequest<'_>,
    verbose: bool,
) -> Result<()> {
    let payload = build_request(config, request.prompt, request.system, request.max_tokens);
    let spec = match request.demand {
        Some(demand) => TaskSpec::new(payload, request.models.iter().cloned(), demand),
        None => TaskSpec::estimated(payload, request.models.iter().cloned()),
    }
    .with_attempt(request.attempt);

    info!("Submitting prompt with demand {} to {:?}", spec.token_demand, spec.eligible_models);
    let handle = manager.submit(spec).context("Failed to submit prompt")?;
    let result: TaskResult = handle.await;

    match result {
        Ok(output) => {
            print_output(&output);
            if verbose {
                println!(
                    "{} prompt={} completion={} total={}",
                    "usage:".green(),
                    output.usage.prompt_tokens,
                    output.usage.completion_tokens,
                    output.usage.total_tokens
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "Error:".red(), e);
            Err(eyre!(e))
        }
    }
}

struct AskRequest<'a> {
    prompt: &'a str,
    models: &'a [String],
    system: Option<&'a str>,
    max_tokens: Option<u32>,
    demand: Option<u64>,
    attempt: u32,
}

async fn handle_batch(
    manager: &Arc<Manager>,
    config: &Config,
    file: &Path,
    models: &[String],
    max_tokens: Option<u32>,
) -> Result<()> {
    let content = fs::read_to_string(file).context(format!("Failed to read {}", file.display()))?;
    let prompts: Vec<&str> = content.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    info!("Submitting {} prompts from {}", prompts.len(), file.display());

    let mut handles = Vec::with_capacity(prompts.len());
    for prompt in &prompts {
        let payload = build_request(config, prompt, None, max_tokens);
        handles.push(
            manager
                .submit(TaskSpec::estimated(payload, models.iter().cloned()))
                .context("Failed to submit prompt")?,
        );
    }

    let results = futures::future::join_all(handles).await;
    let mut failed = 0;
    for (index, result) in results.iter().enumerate() {
        println!("{}", format!("[{}]", index + 1).bold());
        match result {
            Ok(output) => print_output(output),
            Err(e) => {
                failed += 1;
                println!("{} {}", "Error:".red(), e);
            }
        }
    }

    if failed > 0 {
        return Err(eyre!("{} of {} prompts failed", failed, results.len()));
    }
    Ok(())
}

fn handle_workers(config: &Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    for endpoint in &config.endpoints {
        println!("{} {}", endpoint.name.green().bold(), endpoint.url);
        println!("  models:      {}", endpoint.models.join(", "));
        println!("  concurrency: {}", endpoint.concurrency);
        println!("  tokens/min:  {}", endpoint.tokens_per_minute);
        if let Some(rpm) = endpoint.requests_per_minute {
            println!("  requests/min: {}", rpm);
        }
    }
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    if let Commands::Workers = &cli.command {
        return handle_workers(config);
    }

    let manager = config.build_manager().context("Failed to build scheduler")?;
    let outcome = match &cli.command {
        Commands::Ask {
            prompt,
            models,
            system,
            max_tokens,
            demand,
            attempt,
        } => {
            let request = AskRequest {
                prompt,
                models,
                system: system.as_deref(),
                max_tokens: *max_tokens,
                demand: *demand,
                attempt: *attempt,
            };
            handle_ask(&manager, config, request, cli.is_verbose()).await
        }
        Commands::Batch {
            file,
            models,
            max_tokens,
        } => handle_batch(&manager, config, file, models, *max_tokens).await,
        Commands::Workers => Ok(()),
    };

    manager.stop();
    let stats = manager.stats();
    info!(
        "Scheduler stopped: submitted={} dispatched={} settled={} polls={}",
        stats.submitted, stats.dispatched, stats.settled, stats.polls
    );
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration; it carries the log level
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(config.log_filter()).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
