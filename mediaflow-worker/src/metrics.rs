use lazy_static::lazy_static;
use mediaflow_common::node::NodeName;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, Registry};

lazy_static! {
    static ref NODE_EXECUTIONS: CounterVec = register_counter_vec!(
        "worker_node_executions_total",
        "Node executions by node name and result",
        &["node", "result"]
    )
    .unwrap();
    static ref NODE_EXECUTION_SECONDS: HistogramVec = register_histogram_vec!(
        "worker_node_execution_seconds",
        "Node core execution time by node name",
        &["node"]
    )
    .unwrap();
}

pub fn observe_execution(node: &NodeName, result: &str, duration_seconds: f64) {
    NODE_EXECUTIONS
        .with_label_values(&[node.as_str(), result])
        .inc();
    NODE_EXECUTION_SECONDS
        .with_label_values(&[node.as_str()])
        .observe(duration_seconds);
}

pub fn register_all() -> Registry {
    lazy_static::initialize(&NODE_EXECUTIONS);
    lazy_static::initialize(&NODE_EXECUTION_SECONDS);
    prometheus::default_registry().clone()
}
