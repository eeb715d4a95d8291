use crate::config::ConsumerConfig;
use crate::executor::NodeRunner;
use mediaflow_common::node::{NodeName, ALL_NODE_NAMES};
use mediaflow_service_base::queue::TaskQueue;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// One consumer task per enabled node topic, all sharing a bounded
/// execution-slot pool. A dispatch is acked only after its execution
/// finished, so a dying worker leaves the payload on its processing list.
pub struct WorkerRunLoop {
    queue: Arc<dyn TaskQueue>,
    runner: Arc<NodeRunner>,
    config: ConsumerConfig,
    consumer_id: String,
}

impl WorkerRunLoop {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        runner: Arc<NodeRunner>,
        config: ConsumerConfig,
        consumer_id: String,
    ) -> Self {
        WorkerRunLoop {
            queue,
            runner,
            config,
            consumer_id,
        }
    }

    fn enabled_nodes(&self) -> Vec<NodeName> {
        if self.config.enabled_nodes.is_empty() {
            return ALL_NODE_NAMES.to_vec();
        }
        let mut nodes = Vec::new();
        for name in &self.config.enabled_nodes {
            match NodeName::from_str(name) {
                Ok(node) => nodes.push(node),
                Err(_) => warn!("Ignoring unknown node in consumer config: {name}"),
            }
        }
        nodes
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let nodes = self.enabled_nodes();
        info!(
            "Worker {} consuming {} node topics",
            self.consumer_id,
            nodes.len()
        );

        let slots = Arc::new(Semaphore::new(self.config.max_concurrent_executions.max(1)));
        let mut consumers = JoinSet::new();

        for node in nodes {
            let queue = self.queue.clone();
            let runner = self.runner.clone();
            let slots = slots.clone();
            let shutdown = shutdown.clone();
            let consumer_id = self.consumer_id.clone();
            let poll_timeout = self.config.poll_timeout;

            consumers.spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    let delivery = tokio::select! {
                        delivery = queue.dequeue(&node, &consumer_id, poll_timeout) => delivery,
                        _ = shutdown.cancelled() => break,
                    };
                    let delivery = match delivery {
                        Ok(Some(delivery)) => delivery,
                        Ok(None) => continue,
                        Err(err) => {
                            error!("Dequeue on {node} failed: {err}");
                            tokio::time::sleep(poll_timeout).await;
                            continue;
                        }
                    };

                    let permit = match slots.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    info!(
                        "Worker {consumer_id} picked up {} for task {}",
                        delivery.dispatch.task_name, delivery.dispatch.task_id
                    );
                    runner.run(&delivery.dispatch).await;
                    if let Err(err) = queue.ack(&delivery).await {
                        warn!("Failed to ack dispatch: {err}");
                    }
                    drop(permit);
                }
            });
        }

        while consumers.join_next().await.is_some() {}
        info!("Worker {} stopped", self.consumer_id);
    }
}
