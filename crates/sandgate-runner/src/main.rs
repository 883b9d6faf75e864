use anyhow::{Context, Result};
use log::LevelFilter;
use std::process::ExitCode;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use sandgate_core::notify::{CompletionNotifier, FileResultSink, LogNotifier, WebhookNotifier};
use sandgate_core::orchestrator::{exit_code_for, run_unit, runner_exit, RunnerEnv};
use sandgate_core::{ExecutorConfig, NetworkIsolation, SecureExecutor};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            log::error!("runner failed before executing: {:#}", e);
            runner_exit::FATAL
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn run() -> Result<i64> {
    let env = load_env(|name| std::env::var(name).ok())?;

    // The unit's container already owns the network policy; the runner
    // needs egress to deliver the notification.
    let executor = SecureExecutor::new(&ExecutorConfig {
        network_isolation: NetworkIsolation::Disabled,
        ..ExecutorConfig::default()
    })
    .context("failed to prepare the sandbox")?;
    let sink = FileResultSink::new(&env.result_dir);
    let notifier = notifier_for(&env)?;

    let cancel = CancellationToken::new();
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install the SIGTERM handler")?;
    let token = cancel.clone();
    tokio::spawn(async move {
        if terminate.recv().await.is_some() {
            log::warn!("termination requested, stopping the program");
            token.cancel();
        }
    });

    let result = run_unit(&env, &executor, &sink, notifier.as_ref(), &cancel).await;
    Ok(exit_code_for(&result))
}

fn load_env(lookup: impl Fn(&str) -> Option<String>) -> Result<RunnerEnv> {
    RunnerEnv::from_lookup(lookup).context("unit environment is incomplete")
}

fn notifier_for(env: &RunnerEnv) -> Result<Box<dyn CompletionNotifier>> {
    Ok(match &env.notify_url {
        Some(url) => Box::new(
            WebhookNotifier::new(url.clone())
                .with_context(|| format!("failed to build the notifier for {}", url))?,
        ),
        None => Box::new(LogNotifier),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_missing_code_is_reported_with_context() {
        let err = load_env(lookup(&[("REQUEST_ID", "req-1")])).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.starts_with("unit environment is incomplete"));
        assert!(message.contains("CODE"));
    }

    #[test]
    fn test_notifier_follows_the_env() {
        let env = load_env(lookup(&[
            ("CODE", "print(1)"),
            ("REQUEST_ID", "req-1"),
            ("NOTIFY_URL", "http://127.0.0.1:9/done"),
        ]))
        .unwrap();
        assert!(notifier_for(&env).is_ok());

        let quiet = load_env(lookup(&[("CODE", "print(1)"), ("REQUEST_ID", "req-1")])).unwrap();
        assert_eq!(quiet.notify_url, None);
        assert!(notifier_for(&quiet).is_ok());
    }
}
