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
use mediaflow_gateway::api;
use mediaflow_gateway::config::{make_config_loader, GatewayConfig};
use mediaflow_gateway::metrics;
use mediaflow_gateway::service::Services;
use poem::endpoint::PrometheusExporter;
use poem::listener::TcpListener;
use poem::middleware::Cors;
use poem::EndpointExt;
use prometheus::Registry;
use std::process::ExitCode;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn main() -> ExitCode {
    if std::env::args().any(|arg| arg == "--dump-openapi-yaml") {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("failed to build tokio runtime");
        return match runtime.block_on(dump_openapi_yaml()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("{err}");
                ExitCode::from(2)
            }
        };
    }

    match make_config_loader().load_or_dump_config() {
        ConfigOutcome::Dumped => ExitCode::SUCCESS,
        ConfigOutcome::Invalid(err) => {
            eprintln!("Invalid configuration: {err}");
            ExitCode::from(1)
        }
        ConfigOutcome::Loaded(config) => {
            init_tracing_with_default_env_filter(&config.tracing);
            let prometheus = metrics::register_all();

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("failed to build tokio runtime");
            match runtime.block_on(async_main(&config, prometheus)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!("Gateway failed to start: {err}");
                    ExitCode::from(2)
                }
            }
        }
    }
}

async fn dump_openapi_yaml() -> Result<(), String> {
    let config = GatewayConfig::default();
    let services = Services::new(&config)
        .await
        .map_err(|err| format!("Services - init error: {err}"))?;
    let open_api_service = api::make_open_api_service(&services);
    println!("{}", open_api_service.spec_yaml());
    Ok(())
}

async fn async_main(config: &GatewayConfig, prometheus_registry: Registry) -> Result<(), String> {
    let http_port = config.http_port;
    info!("Starting mediaflow gateway on port {http_port}");

    let services = Services::new(config).await?;

    let shutdown = CancellationToken::new();
    let monitor_handle = services.monitor.start(shutdown.clone());

    let cors = Cors::new()
        .allow_origin_regex(&config.cors_origin_regex)
        .allow_credentials(true);

    let app = api::combined_routes(&services)
        .nest("/metrics", PrometheusExporter::new(prometheus_registry))
        .with(cors);

    let server = poem::Server::new(TcpListener::bind(format!("0.0.0.0:{http_port}"))).run(app);

    select! {
        result = server => {
            result.map_err(|err| format!("HTTP server failed: {err}"))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    shutdown.cancel();
    let _ = monitor_handle.await;
    Ok(())
}
