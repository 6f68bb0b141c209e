use serde_json::{Value, json};
use sluice_client::{Client, SubmitError};
use sluice_core::DagValidationError;
use sluice_core::model::{ExecutionStatus, NodeSpec, NodeStatus, NodeUpdate, WorkflowDefinition};
use sluice_core::retry::RetryPolicy;
use sluice_orchestrator::{Orchestrator, OrchestratorConfig};
use sluice_protocol::{TASKS_STREAM, WORKER_GROUP};
use sluice_reaper::{Reaper, ReaperConfig};
use sluice_state::{
    DefinitionStore, DlqStore, MemoryDefinitionStore, MemoryDlqStore, MemoryStore, StateStore,
};
use sluice_worker::{HandlerError, TaskHandler, Worker, WorkerConfig, handler};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

struct Stack {
    state: Arc<MemoryStore>,
    definitions: Arc<MemoryDefinitionStore>,
    dlq: Arc<MemoryDlqStore>,
    client: Client,
    shutdown: watch::Sender<bool>,
}

impl Stack {
    fn new() -> Self {
        let state = Arc::new(MemoryStore::new());
        let definitions = Arc::new(MemoryDefinitionStore::new());
        let dlq = Arc::new(MemoryDlqStore::new());
        let client = Client::new(
            Arc::clone(&state) as Arc<dyn StateStore>,
            Arc::clone(&definitions) as Arc<dyn DefinitionStore>,
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            state,
            definitions,
            dlq,
            client,
            shutdown,
        }
    }

    fn start_orchestrator(&self) {
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&self.state) as Arc<dyn StateStore>,
            Arc::clone(&self.definitions) as Arc<dyn DefinitionStore>,
            OrchestratorConfig {
                block: Duration::from_millis(20),
                housekeeping_interval: Duration::from_millis(100),
                completion_reclaim_idle: Duration::from_millis(500),
                ..OrchestratorConfig::default()
            },
        ));
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { orchestrator.run(shutdown).await });
    }

    fn start_worker(&self, config: WorkerConfig, register: impl FnOnce(&mut Worker)) {
        let mut worker = Worker::new(
            Arc::clone(&self.state) as Arc<dyn StateStore>,
            Arc::clone(&self.definitions) as Arc<dyn DefinitionStore>,
            Arc::clone(&self.dlq) as Arc<dyn DlqStore>,
            WorkerConfig {
                block: Duration::from_millis(20),
                ..config
            },
        );
        register(&mut worker);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { worker.run(shutdown).await });
    }

    fn start_reaper(&self, min_idle: Duration) {
        let reaper = Reaper::new(
            Arc::clone(&self.state) as Arc<dyn StateStore>,
            Arc::clone(&self.dlq) as Arc<dyn DlqStore>,
            ReaperConfig {
                check_interval: Duration::from_millis(25),
                min_idle,
                ..ReaperConfig::default()
            },
        );
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { reaper.run(shutdown).await });
    }

    async fn wait_for_terminal(&self, execution_id: Uuid) -> ExecutionStatus {
        for _ in 0..400 {
            let execution = self
                .state
                .execution_get(execution_id)
                .await
                .expect("execution get")
                .expect("execution exists");
            if execution.status.is_terminal() {
                return execution.status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("execution {execution_id} did not reach a terminal status in time");
    }

    fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

fn node(id: &str, handler_name: &str, config: Value, deps: &[&str]) -> NodeSpec {
    NodeSpec {
        id: id.to_string(),
        handler: handler_name.to_string(),
        config,
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        condition: None,
    }
}

fn echo() -> TaskHandler {
    handler(|config| async move { Ok(config) })
}

fn fast_retry(max_retries: u32) -> WorkerConfig {
    WorkerConfig {
        max_retries,
        retry: RetryPolicy {
            base_ms: 2,
            cap_ms: 10,
            jitter_ms: 1,
        },
        ..WorkerConfig::default()
    }
}

#[tokio::test]
async fn linear_chain_completes_with_echoed_outputs() {
    let stack = Stack::new();
    stack.start_orchestrator();
    stack.start_worker(WorkerConfig::default(), |worker| {
        worker.registry_mut().register("echo", echo());
    });

    let definition = WorkflowDefinition::new(
        "linear",
        vec![
            node("a", "echo", json!({"v": 1}), &[]),
            node("b", "echo", json!({"v": 2}), &["a"]),
            node("c", "echo", json!({"v": 3}), &["b"]),
        ],
    );
    let execution_id = stack
        .client
        .submit(&definition, None)
        .await
        .expect("submit");
    stack
        .client
        .trigger(execution_id, None)
        .await
        .expect("trigger");

    assert_eq!(
        stack.wait_for_terminal(execution_id).await,
        ExecutionStatus::Completed
    );

    let outputs = stack.client.outputs(execution_id).await.expect("outputs");
    assert_eq!(outputs["a"], json!({"v": 1}));
    assert_eq!(outputs["b"], json!({"v": 2}));
    assert_eq!(outputs["c"], json!({"v": 3}));

    let terminal = stack
        .definitions
        .load_terminal(execution_id)
        .await
        .expect("terminal load")
        .expect("terminal recorded");
    assert_eq!(terminal.final_status, ExecutionStatus::Completed);
    stack.stop();
}

#[tokio::test]
async fn cyclic_definition_is_rejected_without_side_effects() {
    let stack = Stack::new();
    let definition = WorkflowDefinition::new(
        "cyclic",
        vec![node("a", "echo", json!({}), &["b"]), node("b", "echo", json!({}), &["a"])],
    );

    let err = stack
        .client
        .submit(&definition, None)
        .await
        .expect_err("cycle must be rejected");
    assert!(matches!(
        err,
        SubmitError::Validation(DagValidationError::CycleDetected(_))
    ));

    assert!(
        stack
            .definitions
            .list_workflows()
            .await
            .expect("list")
            .is_empty(),
        "nothing may be persisted for a rejected submission"
    );
    assert!(
        stack
            .state
            .execution_list_running()
            .await
            .expect("list running")
            .is_empty()
    );
}

#[tokio::test]
async fn fan_out_fan_in_runs_join_once_with_typed_templates() {
    let stack = Stack::new();
    stack.start_orchestrator();

    let join_runs = Arc::new(AtomicUsize::new(0));
    let join_counter = Arc::clone(&join_runs);
    stack.start_worker(WorkerConfig::default(), move |worker| {
        worker.registry_mut().register("echo", echo());
        worker
            .registry_mut()
            .register("produce-10", handler(|_| async { Ok(json!({"v": 10})) }));
        worker
            .registry_mut()
            .register("produce-20", handler(|_| async { Ok(json!({"v": 20})) }));
        worker.registry_mut().register(
            "join",
            handler(move |config| {
                let join_counter = Arc::clone(&join_counter);
                async move {
                    join_counter.fetch_add(1, Ordering::SeqCst);
                    Ok(config)
                }
            }),
        );
    });

    let definition = WorkflowDefinition::new(
        "diamond",
        vec![
            node("a", "echo", json!({"seed": true}), &[]),
            node("b", "produce-10", json!({}), &["a"]),
            node("c", "produce-20", json!({}), &["a"]),
            node(
                "d",
                "join",
                json!({"from_b": "{{b.v}}", "from_c": "{{c.v}}"}),
                &["b", "c"],
            ),
        ],
    );
    let execution_id = stack
        .client
        .submit(&definition, None)
        .await
        .expect("submit");
    stack
        .client
        .trigger(execution_id, None)
        .await
        .expect("trigger");

    assert_eq!(
        stack.wait_for_terminal(execution_id).await,
        ExecutionStatus::Completed
    );
    assert_eq!(join_runs.load(Ordering::SeqCst), 1, "join must run exactly once");

    let outputs = stack.client.outputs(execution_id).await.expect("outputs");
    assert_eq!(
        outputs["d"],
        json!({"from_b": 10, "from_c": 20}),
        "scalar substitution must carry raw JSON types"
    );
    stack.stop();
}

#[tokio::test]
async fn crashed_worker_attempt_is_reclaimed_and_finished() {
    let stack = Stack::new();
    stack.start_orchestrator();

    let definition =
        WorkflowDefinition::new("single", vec![node("only", "echo", json!({"v": 1}), &[])]);
    let execution_id = stack
        .client
        .submit(&definition, None)
        .await
        .expect("submit");
    stack
        .client
        .trigger(execution_id, None)
        .await
        .expect("trigger");

    // Play a worker that dies after claiming the task and marking the
    // node Running, without acknowledging or publishing anything.
    let mut claimed = Vec::new();
    for _ in 0..200 {
        claimed = stack
            .state
            .stream_consume(
                TASKS_STREAM,
                WORKER_GROUP,
                "doomed-worker",
                1,
                Duration::from_millis(20),
            )
            .await
            .expect("consume");
        if !claimed.is_empty() {
            break;
        }
    }
    assert_eq!(claimed.len(), 1, "task was not dispatched");
    assert!(
        stack
            .state
            .node_cas(
                execution_id,
                "only",
                NodeStatus::Pending,
                NodeStatus::Running,
                NodeUpdate::started(chrono::Utc::now()),
            )
            .await
            .expect("cas"),
    );

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    stack.start_worker(WorkerConfig::default(), move |worker| {
        worker.registry_mut().register(
            "echo",
            handler(move |config| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(config)
                }
            }),
        );
    });
    stack.start_reaper(Duration::from_millis(50));

    assert_eq!(
        stack.wait_for_terminal(execution_id).await,
        ExecutionStatus::Completed
    );
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let outputs = stack.client.outputs(execution_id).await.expect("outputs");
    assert_eq!(outputs["only"], json!({"v": 1}));
    stack.stop();
}

#[tokio::test]
async fn poison_handler_exhausts_retries_into_the_dlq() {
    let stack = Stack::new();
    stack.start_orchestrator();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    stack.start_worker(fast_retry(4), move |worker| {
        worker.registry_mut().register(
            "poison",
            handler(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::Connection("connection refused".to_string()))
                }
            }),
        );
    });

    let definition =
        WorkflowDefinition::new("poisoned", vec![node("only", "poison", json!({}), &[])]);
    let execution_id = stack
        .client
        .submit(&definition, None)
        .await
        .expect("submit");
    stack
        .client
        .trigger(execution_id, None)
        .await
        .expect("trigger");

    assert_eq!(
        stack.wait_for_terminal(execution_id).await,
        ExecutionStatus::Failed
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 5, "initial attempt plus four retries");

    let entries = stack.dlq.list(10).await.expect("dlq list");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].retry_count, 4);
    assert_eq!(
        entries[0].error.category,
        sluice_core::model::ErrorCategory::Connection
    );

    let snapshot = stack.client.status(execution_id).await.expect("status");
    assert_eq!(snapshot.nodes[0].status, NodeStatus::Failed);
    stack.stop();
}

#[tokio::test]
async fn cancellation_between_nodes_stops_the_frontier() {
    let stack = Stack::new();
    stack.start_orchestrator();

    let (a_started_tx, mut a_started_rx) = tokio::sync::mpsc::unbounded_channel();
    let b_runs = Arc::new(AtomicUsize::new(0));
    let b_counter = Arc::clone(&b_runs);
    stack.start_worker(WorkerConfig::default(), move |worker| {
        worker.registry_mut().register(
            "first",
            handler(move |config| {
                let a_started_tx = a_started_tx.clone();
                async move {
                    let _ = a_started_tx.send(());
                    // Give the cancel time to land before finishing.
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok(config)
                }
            }),
        );
        worker.registry_mut().register(
            "second",
            handler(move |config| {
                let b_counter = Arc::clone(&b_counter);
                async move {
                    b_counter.fetch_add(1, Ordering::SeqCst);
                    Ok(config)
                }
            }),
        );
    });

    let definition = WorkflowDefinition::new(
        "two-step",
        vec![
            node("a", "first", json!({}), &[]),
            node("b", "second", json!({}), &["a"]),
        ],
    );
    let execution_id = stack
        .client
        .submit(&definition, None)
        .await
        .expect("submit");
    stack
        .client
        .trigger(execution_id, None)
        .await
        .expect("trigger");

    a_started_rx.recv().await.expect("first node started");
    stack.client.cancel(execution_id).await.expect("cancel");

    assert_eq!(
        stack.wait_for_terminal(execution_id).await,
        ExecutionStatus::Cancelled
    );

    // Let any stray dispatch surface before asserting.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(b_runs.load(Ordering::SeqCst), 0, "b must never run");
    let snapshot = stack.client.status(execution_id).await.expect("status");
    let b_snapshot = snapshot
        .nodes
        .iter()
        .find(|node| node.node_id == "b")
        .expect("b in snapshot");
    assert_eq!(b_snapshot.status, NodeStatus::Waiting);
    stack.stop();
}
