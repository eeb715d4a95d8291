use crate::service::Services;
use poem::Route;
use poem_openapi::{OpenApiService, Tags};

pub mod files;
pub mod healthcheck;
pub mod monitoring;
pub mod task;

#[derive(Tags)]
enum ApiTags {
    Task,
    File,
    Monitoring,
    HealthCheck,
}

pub fn combined_routes(services: &Services) -> Route {
    let api_service = make_open_api_service(services);

    let ui = api_service.swagger_ui();
    let spec = api_service.spec_endpoint_yaml();

    Route::new()
        .nest("/", api_service)
        .nest("/docs", ui)
        .nest("/specs", spec)
}

type ApiServices = (
    task::TaskApi,
    files::FileApi,
    monitoring::MonitoringApi,
    healthcheck::HealthcheckApi,
);

pub fn make_open_api_service(services: &Services) -> OpenApiService<ApiServices, ()> {
    OpenApiService::new(
        (
            task::TaskApi::new(services.task_service.clone()),
            files::FileApi::new(services.file_service.clone()),
            monitoring::MonitoringApi::new(
                services.lock_service.clone(),
                services.heartbeat_service.clone(),
                services.queue.clone(),
            ),
            healthcheck::HealthcheckApi,
        ),
        "Mediaflow API",
        "1.0",
    )
}
