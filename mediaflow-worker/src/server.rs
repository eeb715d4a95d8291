// Copyright 2024-2025 Mediaflow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use mediaflow_common::config::ConfigOutcome;
use mediaflow_common::tracing::init_tracing_with_default_env_filter;
use mediaflow_worker::config::{make_config_loader, WorkerConfig};
use mediaflow_worker::metrics;
use mediaflow_worker::run::WorkerRunLoop;
use mediaflow_worker::services::Services;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn main() -> ExitCode {
    match make_config_loader().load_or_dump_config() {
        ConfigOutcome::Dumped => ExitCode::SUCCESS,
        ConfigOutcome::Invalid(err) => {
            eprintln!("Invalid configuration: {err}");
            ExitCode::from(1)
        }
        ConfigOutcome::Loaded(config) => {
            init_tracing_with_default_env_filter(&config.tracing);
            let _prometheus = metrics::register_all();

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("failed to build tokio runtime");
            match runtime.block_on(async_main(&config)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!("Worker failed to start: {err}");
                    ExitCode::from(2)
                }
            }
        }
    }
}

async fn async_main(config: &WorkerConfig) -> Result<(), String> {
    let services = Services::new(config).await?;

    let consumer_id = format!(
        "{}-{}",
        gethostname(),
        std::process::id()
    );
    info!("Starting mediaflow worker {consumer_id}");

    let run_loop = WorkerRunLoop::new(
        services.queue.clone(),
        services.runner.clone(),
        config.consumer.clone(),
        consumer_id,
    );

    let shutdown = CancellationToken::new();
    let loop_shutdown = shutdown.clone();
    let run = tokio::spawn(async move { run_loop.run(loop_shutdown).await });

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| format!("failed to listen for shutdown signal: {err}"))?;
    info!("Shutdown requested");
    shutdown.cancel();
    let _ = run.await;
    Ok(())
}

fn gethostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string())
}
