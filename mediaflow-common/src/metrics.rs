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

pub mod api {
    use lazy_static::lazy_static;
    use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};
    use std::time::Instant;
    use tracing::Span;

    lazy_static! {
        static ref HTTP_API_REQUESTS: CounterVec = register_counter_vec!(
            "http_api_requests_total",
            "Number of HTTP API requests by endpoint and result",
            &["api", "result"]
        )
        .unwrap();
        static ref HTTP_API_SECONDS: HistogramVec = register_histogram_vec!(
            "http_api_request_seconds",
            "HTTP API request handling time by endpoint",
            &["api"]
        )
        .unwrap();
    }

    /// Stable error label attached to API error metrics and log records.
    pub trait TraceErrorKind {
        fn trace_error_kind(&self) -> &'static str;
    }

    /// Per-request recording handle created by `recorded_http_api_request!`.
    pub struct RecordedHttpApiRequest {
        pub span: Span,
        api_name: &'static str,
        start: Instant,
    }

    impl RecordedHttpApiRequest {
        pub fn new(api_name: &'static str, span: Span) -> Self {
            RecordedHttpApiRequest {
                span,
                api_name,
                start: Instant::now(),
            }
        }

        /// Observe the outcome and pass the response through unchanged.
        pub fn result<T, E: TraceErrorKind>(self, result: Result<T, E>) -> Result<T, E> {
            let elapsed = self.start.elapsed();
            HTTP_API_SECONDS
                .with_label_values(&[self.api_name])
                .observe(elapsed.as_secs_f64());
            match &result {
                Ok(_) => {
                    HTTP_API_REQUESTS
                        .with_label_values(&[self.api_name, "ok"])
                        .inc();
                }
                Err(error) => {
                    HTTP_API_REQUESTS
                        .with_label_values(&[self.api_name, error.trace_error_kind()])
                        .inc();
                }
            }
            result
        }
    }

    /// Force metric registration at service startup.
    pub fn register_all() {
        lazy_static::initialize(&HTTP_API_REQUESTS);
        lazy_static::initialize(&HTTP_API_SECONDS);
    }
}

/// Open a span for one HTTP API request and return the recording handle.
///
/// ```ignore
/// let record = recorded_http_api_request!("create_task", task_id = task_id.to_string());
/// let response = handle().instrument(record.span.clone()).await;
/// record.result(response)
/// ```
#[macro_export]
macro_rules! recorded_http_api_request {
    ($api:expr $(, $field:ident = $value:expr)* $(,)?) => {{
        let span = ::tracing::info_span!(
            "http_api_request",
            api = $api
            $(, $field = ::tracing::field::debug(&$value))*
        );
        $crate::metrics::api::RecordedHttpApiRequest::new($api, span)
    }};
}
