use lazy_static::lazy_static;
use prometheus::{register_int_counter, IntCounter, Registry};

lazy_static! {
    pub static ref TASKS_DISPATCHED: IntCounter = register_int_counter!(
        "gateway_tasks_dispatched_total",
        "Number of task dispatches enqueued by the gateway"
    )
    .unwrap();
    pub static ref CACHE_HITS: IntCounter = register_int_counter!(
        "gateway_cache_hits_total",
        "Number of task submissions answered from a prior successful stage"
    )
    .unwrap();
}

pub fn register_all() -> Registry {
    mediaflow_common::metrics::api::register_all();
    lazy_static::initialize(&TASKS_DISPATCHED);
    lazy_static::initialize(&CACHE_HITS);
    prometheus::default_registry().clone()
}
