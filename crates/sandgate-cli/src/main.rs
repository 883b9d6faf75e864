use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use sandgate_core::config::ConfigLoader;
use sandgate_core::orchestrator::{job_id_for, JobSpec};
use sandgate_core::{
    DockerScheduler, ExecutionRequest, GenerationParams, HeavyExecutor, HttpCodeGenerator,
    JobOrchestrator, PipelineError, PipelineResponse, RequestPipeline, SandgateConfig,
    SecureExecutor,
};

#[derive(Parser)]
#[clap(name = "sandgate", about = "Validate, route and run generated Python code")]
struct Cli {
    /// Configuration file; built-in defaults are used when it does not exist
    #[clap(long, short, default_value = "sandgate.yaml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace); overrides the config file
    #[clap(long)]
    log_level: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Statically check a program and print the validation result
    Validate {
        /// Python source file, or `-` for stdin
        file: PathBuf,
    },
    /// Print the tier a program would run on and why
    Classify {
        /// Python source file, or `-` for stdin
        file: PathBuf,
    },
    /// Validate, classify and execute a program
    Run {
        /// Python source file, or `-` for stdin
        file: PathBuf,
        #[clap(flatten)]
        request: RequestArgs,
    },
    /// Generate a program from a natural-language query and execute it
    Generate {
        query: String,
        #[clap(flatten)]
        request: RequestArgs,
        /// Print the generated program instead of the full response
        #[clap(long)]
        code_only: bool,
    },
    /// Print the Kubernetes Job a heavy-tier run of the program would submit
    RenderJob {
        /// Python source file, or `-` for stdin
        file: PathBuf,
        #[clap(long)]
        request_id: Option<String>,
    },
}

#[derive(clap::Args)]
struct RequestArgs {
    #[clap(long)]
    request_id: Option<String>,
    /// Execution timeout in seconds
    #[clap(long)]
    timeout: Option<u64>,
    #[clap(long)]
    max_retries: Option<u32>,
}

impl RequestArgs {
    /// Limits are left to the pipeline, which applies the configured ones.
    fn into_request(self, code: String) -> ExecutionRequest {
        let mut request = ExecutionRequest::new(code);
        if let Some(request_id) = self.request_id {
            request = request.with_request_id(request_id);
        }
        if let Some(timeout) = self.timeout {
            request = request.with_timeout_seconds(timeout);
        }
        if let Some(max_retries) = self.max_retries {
            request = request.with_max_retries(max_retries);
        }
        request
    }

    fn into_params(self) -> GenerationParams {
        GenerationParams {
            request_id: self.request_id,
            timeout_seconds: self.timeout,
            max_retries: self.max_retries,
            resource_limits: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = ConfigLoader::from_file_or_default(&cli.config)
        .await
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level_filter = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    log::debug!("loaded configuration from {}", cli.config.display());

    match cli.command {
        Command::Validate { file } => {
            let code = read_source(&file).await?;
            let validator = sandgate_core::Validator::new(&config.validator);
            let validation = validator.validate(&code);
            print_json(&validation)?;
            Ok(if validation.is_valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Classify { file } => {
            let code = read_source(&file).await?;
            let classifier = sandgate_core::Classifier::new(&config.classifier);
            print_json(&classifier.explain(&code))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { file, request } => {
            let code = read_source(&file).await?;
            let request = request.into_request(code);
            let (pipeline, orchestrator) = build_pipeline(&config, false)?;
            let cancel = cancel_on_ctrl_c();

            let outcome = pipeline.execute(&request, &cancel).await;
            orchestrator.shutdown().await;
            report(outcome, false)
        }
        Command::Generate {
            query,
            request,
            code_only,
        } => {
            let params = request.into_params();
            let (pipeline, orchestrator) = build_pipeline(&config, true)?;
            let cancel = cancel_on_ctrl_c();

            let outcome = pipeline.generate_and_execute(&query, params, &cancel).await;
            orchestrator.shutdown().await;
            report(outcome, code_only)
        }
        Command::RenderJob { file, request_id } => {
            let code = read_source(&file).await?;
            let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let spec = JobSpec::build(
                &job_id_for(&request_id),
                &request_id,
                &code,
                &config.limits,
                &config.orchestrator,
            )?;
            print_json(&spec.to_kubernetes_manifest())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_pipeline(
    config: &SandgateConfig,
    with_generator: bool,
) -> Result<(RequestPipeline, JobOrchestrator)> {
    let lightweight = Arc::new(SecureExecutor::new(&config.executor)?);
    let scheduler = Arc::new(DockerScheduler::connect()?);
    let orchestrator = JobOrchestrator::new(scheduler, config.orchestrator.clone());
    let heavy = Arc::new(HeavyExecutor::new(orchestrator.clone()));

    let mut pipeline = RequestPipeline::new(config, lightweight, heavy);
    if with_generator {
        let generator_config = config
            .generator
            .as_ref()
            .context("the `generator` section is required to generate code")?;
        let generator = HttpCodeGenerator::from_config(generator_config)?;
        pipeline = pipeline.with_generator(Arc::new(generator));
    }

    Ok((pipeline, orchestrator))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, cancelling");
            token.cancel();
        }
    });
    cancel
}

fn report(outcome: Result<PipelineResponse, PipelineError>, code_only: bool) -> Result<ExitCode> {
    match outcome {
        Ok(response) => {
            if code_only {
                println!("{}", response.generated_code.as_deref().unwrap_or_default());
            } else {
                print_json(&response)?;
            }
            Ok(if response.result.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Err(e) => {
            if let PipelineError::Validation { validation, .. } = &e {
                print_json(validation)?;
            }
            eprintln!("request {}: {}", e.request_id(), e.public_message());
            Ok(ExitCode::from(2))
        }
    }
}

async fn read_source(file: &PathBuf) -> Result<String> {
    if file.as_os_str() == "-" {
        let mut code = String::new();
        tokio::io::stdin()
            .read_to_string(&mut code)
            .await
            .context("failed to read program from stdin")?;
        return Ok(code);
    }
    tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
