use std::sync::Arc;

use crate::client::HttpClient;
use crate::metrics::MetricsAggregator;
use crate::observer::AttackObserver;
use crate::workflow::ChatWorkflow;
use crate::VuCommand;

/// Run workflow iterations until told to exit or, if `iterations` is non-zero, until that
/// many iterations completed.
///
/// An in-flight iteration always runs to completion: the exit command is only checked
/// between iterations.
pub(crate) async fn vu_main(
    vu_number: usize,
    workflow: Arc<ChatWorkflow>,
    client: Arc<dyn HttpClient>,
    aggregator: MetricsAggregator,
    observer: Arc<dyn AttackObserver>,
    iterations: usize,
    thread_receiver: flume::Receiver<VuCommand>,
) {
    info!("launching vu {} running {} flow...", vu_number, workflow.flow());

    let mut completed = 0;
    loop {
        if received_exit(&thread_receiver) {
            break;
        }

        let result = workflow
            .run_iteration(client.as_ref(), &aggregator)
            .await;
        aggregator.complete_iteration();
        completed += 1;
        trace!(
            "vu {} iteration {} ended {:?} in {:.2} ms",
            vu_number,
            completed,
            result.state,
            result.end_to_end_ms
        );
        observer.on_iteration_complete(vu_number, &result);

        if iterations > 0 && completed >= iterations {
            debug!("vu {} completed {} iterations", vu_number, completed);
            break;
        }

        // Give the scheduler a chance to run even if the client never yields.
        tokio::task::yield_now().await;
    }

    info!("exiting vu {} after {} iterations...", vu_number, completed);
}

// Determine if the scheduler has sent a VuCommand::Exit message.
fn received_exit(thread_receiver: &flume::Receiver<VuCommand>) -> bool {
    while let Ok(command) = thread_receiver.try_recv() {
        match command {
            VuCommand::Exit => return true,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{StepRequest, StepResponse};
    use crate::config::{TestConfig, TestDataSet};
    use crate::metrics::END_TO_END_DURATION;
    use crate::workflow::{FlowKind, WorkflowResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct OkClient;

    #[async_trait]
    impl HttpClient for OkClient {
        async fn send(&self, _request: StepRequest) -> StepResponse {
            StepResponse {
                status: 200,
                body: "{}".to_string(),
                latency: Duration::from_millis(1),
                error: None,
            }
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        completed: AtomicUsize,
    }
    impl AttackObserver for CountingObserver {
        fn on_iteration_complete(&self, _vu_number: usize, result: &WorkflowResult) {
            assert!(result.chat_succeeded);
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn workflow() -> Arc<ChatWorkflow> {
        let test_config = TestConfig {
            base_url: "http://example.com".to_string(),
            ..Default::default()
        };
        let test_data = TestDataSet::new(vec!["hello".to_string()]).unwrap();
        Arc::new(ChatWorkflow::new(FlowKind::Guest, &test_config, Some(Arc::new(test_data))).unwrap())
    }

    #[tokio::test]
    async fn stops_after_iteration_cap() {
        let aggregator = MetricsAggregator::new();
        let observer = Arc::new(CountingObserver::default());
        let (_sender, receiver) = flume::unbounded();

        vu_main(
            1,
            workflow(),
            Arc::new(OkClient),
            aggregator.clone(),
            observer.clone(),
            3,
            receiver,
        )
        .await;

        assert_eq!(aggregator.iterations(), 3);
        assert_eq!(observer.completed.load(Ordering::SeqCst), 3);
        assert_eq!(
            aggregator.finalize().trend(END_TO_END_DURATION).unwrap().count,
            3
        );
    }

    #[tokio::test]
    async fn exits_on_command() {
        let aggregator = MetricsAggregator::new();
        let (sender, receiver) = flume::unbounded();

        let user = tokio::spawn(vu_main(
            1,
            workflow(),
            Arc::new(OkClient),
            aggregator.clone(),
            Arc::new(CountingObserver::default()),
            0,
            receiver,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        sender.send(VuCommand::Exit).unwrap();
        user.await.unwrap();

        // Every started iteration finished and recorded its end to end duration.
        let iterations = aggregator.iterations();
        assert!(iterations > 0);
        assert_eq!(
            aggregator.finalize().trend(END_TO_END_DURATION).unwrap().count,
            iterations
        );
    }

    #[test]
    fn exit_is_drained() {
        let (sender, receiver) = flume::unbounded();
        assert!(!received_exit(&receiver));
        sender.send(VuCommand::Exit).unwrap();
        assert!(received_exit(&receiver));
        assert!(!received_exit(&receiver));
    }
}
