//! Integration tests for the staged ingestion pipeline.
//!
//! Drives the full path an object takes through the lake — route, Stage A,
//! batch accumulation, Stage B submit and poll — against the in-memory
//! service implementations.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use floe::config::{DatasetConfig, NamingConfig, PathLayout};
use floe::error::TransformError;
use floe::peh::{MemoryPehStore, PehClient, PehState};
use floe::pipeline::stage_b::{PollOutcome, StageBInput};
use floe::pipeline::{BatchAccumulator, ObjectEvent, Router, StageAOrchestrator, StageBOrchestrator};
use floe::services::catalog::{MemoryCatalog, MetadataCatalog, ObjectStage};
use floe::services::crawler::{MemoryCrawler, SchemaCrawler};
use floe::services::queue::{MemoryQueue, OrderedQueue};
use floe::services::storage::ObjectStorage;
use floe::services::workflow::MemoryWorkflow;
use floe::transform::{
    JobRun, StageAContext, StageATransform, StageBContext, StageBTransform, TransformDispatch,
    TransformRegistry,
};

const STAGE_BUCKET: &str = "acme-lake-dev-stage";
const RAW_BUCKET: &str = "acme-lake-dev-raw";

/// Light transform that copies the landed object into the pre-stage area.
struct CopyLightTransform;

#[async_trait]
impl StageATransform for CopyLightTransform {
    async fn transform_object(
        &self,
        ctx: &StageAContext<'_>,
    ) -> Result<Vec<String>, TransformError> {
        let bytes = ctx
            .storage
            .get(ctx.key)
            .await
            .map_err(|e| TransformError::Execution {
                message: e.to_string(),
            })?;
        let file_name = ctx.key.rsplit('/').next().unwrap_or("object");
        let out_key = format!(
            "pre-stage/{}/{}/{}.csv",
            ctx.team,
            ctx.dataset,
            file_name.trim_end_matches(".json")
        );
        ctx.storage
            .put(&out_key, bytes)
            .await
            .map_err(|e| TransformError::Execution {
                message: e.to_string(),
            })?;
        Ok(vec![out_key])
    }
}

/// Light transform that violates the non-empty contract.
struct EmptyLightTransform;

#[async_trait]
impl StageATransform for EmptyLightTransform {
    async fn transform_object(
        &self,
        _ctx: &StageAContext<'_>,
    ) -> Result<Vec<String>, TransformError> {
        Ok(vec![])
    }
}

/// Heavy transform whose job reports a scripted sequence of statuses.
///
/// On SUCCEEDED it writes two output objects under the processed-keys
/// path, mimicking an external batch job landing its results.
struct ScriptedHeavyTransform {
    statuses: Mutex<VecDeque<&'static str>>,
}

impl ScriptedHeavyTransform {
    fn new(statuses: &[&'static str]) -> Self {
        Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
        }
    }

    fn processed_keys_path(team: &str, dataset: &str) -> String {
        format!("post-stage/{team}/{dataset}")
    }
}

#[async_trait]
impl StageBTransform for ScriptedHeavyTransform {
    async fn start_job(&self, ctx: &StageBContext<'_>) -> Result<Value, TransformError> {
        Ok(json!({
            "processedKeysPath": Self::processed_keys_path(ctx.team, ctx.dataset),
            "jobDetails": {"jobStatus": "RUNNING", "jobRunId": "jr-1"}
        }))
    }

    async fn check_job(
        &self,
        ctx: &StageBContext<'_>,
        job: &JobRun,
    ) -> Result<Value, TransformError> {
        let status = self
            .statuses
            .lock()
            .await
            .pop_front()
            .unwrap_or("SUCCEEDED");
        if status == "SUCCEEDED" {
            for part in ["part-0.parquet", "part-1.parquet"] {
                let key = format!("{}/{part}", job.processed_keys_path);
                ctx.storage
                    .put(&key, Bytes::from("output"))
                    .await
                    .map_err(|e| TransformError::Execution {
                        message: e.to_string(),
                    })?;
            }
        }
        Ok(json!({
            "processedKeysPath": &job.processed_keys_path,
            "jobDetails": {"jobStatus": status, "jobRunId": "jr-1"}
        }))
    }
}

/// Everything a test needs to drive the pipeline end to end.
struct Harness {
    naming: NamingConfig,
    catalog: Arc<MemoryCatalog>,
    queue: Arc<MemoryQueue>,
    peh_store: Arc<MemoryPehStore>,
    workflow: Arc<MemoryWorkflow>,
    crawler: Arc<MemoryCrawler>,
    storage: ObjectStorage,
    router: Router,
    stage_a: StageAOrchestrator,
    stage_b: StageBOrchestrator,
    accumulator: BatchAccumulator,
    _scratch: tempfile::TempDir,
}

async fn harness_with(
    dataset: DatasetConfig,
    stage_a: Arc<dyn StageATransform>,
    stage_b: Arc<dyn StageBTransform>,
) -> Harness {
    let naming = NamingConfig {
        prefix: "floe".to_string(),
        org: "acme".to_string(),
        app: "lake".to_string(),
        env: "dev".to_string(),
    };
    let stage_a_name = dataset.stage_a_transform.clone();
    let stage_b_name = dataset.stage_b_transform.clone();

    let catalog = Arc::new(MemoryCatalog::from_datasets(std::slice::from_ref(&dataset)).await);
    let queue = Arc::new(MemoryQueue::new());
    let peh_store = Arc::new(MemoryPehStore::new());
    let workflow = Arc::new(MemoryWorkflow::new());
    let crawler = Arc::new(MemoryCrawler::new());
    let storage = ObjectStorage::memory();
    let scratch = tempfile::tempdir().unwrap();

    let mut registry = TransformRegistry::new();
    registry.register_stage_a(&stage_a_name, stage_a);
    registry.register_stage_b(&stage_b_name, stage_b);
    let dispatch = Arc::new(TransformDispatch::new(
        Arc::new(registry),
        catalog.clone() as Arc<dyn MetadataCatalog>,
    ));

    let peh = PehClient::new(peh_store.clone());
    let router = Router::new(
        catalog.clone(),
        queue.clone(),
        naming.clone(),
        PathLayout::MultiBucket,
    );
    let stage_a_orchestrator = StageAOrchestrator::new(
        dispatch.clone(),
        catalog.clone(),
        queue.clone(),
        peh.clone(),
        storage.clone(),
        naming.clone(),
        STAGE_BUCKET.to_string(),
        scratch.path().to_path_buf(),
    );
    let stage_b_orchestrator = StageBOrchestrator::new(
        dispatch,
        catalog.clone(),
        queue.clone(),
        crawler.clone(),
        peh.clone(),
        storage.clone(),
        naming.clone(),
        scratch.path().to_path_buf(),
    );
    let accumulator = BatchAccumulator::new(
        catalog.clone(),
        queue.clone(),
        workflow.clone(),
        naming.clone(),
        STAGE_BUCKET.to_string(),
    );

    Harness {
        naming,
        catalog,
        queue,
        peh_store,
        workflow,
        crawler,
        storage,
        router,
        stage_a: stage_a_orchestrator,
        stage_b: stage_b_orchestrator,
        accumulator,
        _scratch: scratch,
    }
}

fn meteorites(min: usize, max: usize) -> DatasetConfig {
    DatasetConfig {
        team: "engineering".to_string(),
        dataset: "meteorites".to_string(),
        pipeline: "main".to_string(),
        min_items_process: min,
        max_items_process: max,
        stage_a_transform: "light".to_string(),
        stage_b_transform: "heavy".to_string(),
    }
}

fn landed_event(key: &str) -> ObjectEvent {
    ObjectEvent {
        bucket: RAW_BUCKET.to_string(),
        key: key.to_string(),
        size: 256,
        landing_time: Utc::now(),
        stage: ObjectStage::Raw,
    }
}

mod end_to_end {
    use super::*;

    #[tokio::test]
    async fn test_object_flows_through_both_stages() {
        let h = harness_with(
            meteorites(1, 10),
            Arc::new(CopyLightTransform),
            Arc::new(ScriptedHeavyTransform::new(&["RUNNING", "SUCCEEDED"])),
        )
        .await;

        let key = "engineering/meteorites/2026-08/landing.json";
        h.storage
            .put(key, Bytes::from("{\"id\": 1}"))
            .await
            .unwrap();

        // Route the landed object onto the ingress queue
        h.router.route_batch(&[landed_event(key)]).await.unwrap();
        let queue_a = h.naming.stage_a_queue("engineering", "main");
        let received = h.queue.receive_messages(&queue_a, 1).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].group, "engineering-meteorites");

        // Stage A: transform, catalog pre-stage, forward one key
        let message = serde_json::from_str(&received[0].body).unwrap();
        let keys = h.stage_a.run(&message).await.unwrap();
        assert_eq!(keys.len(), 1);
        h.queue.delete_message(&queue_a, &received[0].receipt).await.unwrap();

        let record = h.catalog.object_record(STAGE_BUCKET, &keys[0]).await.unwrap();
        assert_eq!(record.stage, ObjectStage::PreStage);
        assert_eq!(h.peh_store.running_count().await, 0);

        // Accumulator: min=1, so the batch triggers immediately
        let triggered = h
            .accumulator
            .run("engineering", "main", "meteorites")
            .await
            .unwrap();
        assert_eq!(triggered, Some(1));
        let started = h.workflow.started().await;
        assert_eq!(started.len(), 1);
        assert_eq!(
            started[0].workflow,
            h.naming.stage_b_workflow("engineering", "main")
        );
        assert_eq!(started[0].payload["statusCode"], 200);

        // Stage B submit: job comes back RUNNING, execution stays open
        let input: StageBInput =
            serde_json::from_value(started[0].payload["body"].clone()).unwrap();
        assert_eq!(input.keys_to_process, keys);
        let job = h.stage_b.submit(&input).await.unwrap();
        assert_eq!(h.peh_store.running_count().await, 1);

        // First poll: still RUNNING, nothing terminal, no crawl
        let outcome = h.stage_b.poll(&job).await.unwrap();
        let job = match outcome {
            PollOutcome::Running(next) => next,
            other => panic!("expected Running, got {other:?}"),
        };
        assert_eq!(h.peh_store.running_count().await, 1);
        let crawler_name = h.naming.crawler("engineering", "meteorites");
        assert_eq!(h.crawler.start_count(&crawler_name).await, 0);

        // Second poll: SUCCEEDED — catalog post-stage, one crawl, success
        let outcome = h.stage_b.poll(&job).await.unwrap();
        let processed = match outcome {
            PollOutcome::Completed { processed_keys } => processed_keys,
            other => panic!("expected Completed, got {other:?}"),
        };
        assert_eq!(processed.len(), 2);
        for key in &processed {
            let record = h.catalog.object_record(STAGE_BUCKET, key).await.unwrap();
            assert_eq!(record.stage, ObjectStage::PostStage);
        }
        assert_eq!(h.crawler.start_count(&crawler_name).await, 1);
        assert_eq!(h.peh_store.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_crawl_already_running_is_success() {
        let h = harness_with(
            meteorites(1, 10),
            Arc::new(CopyLightTransform),
            Arc::new(ScriptedHeavyTransform::new(&["SUCCEEDED"])),
        )
        .await;

        // A crawl left running from a previous batch must not fail this one
        let crawler_name = h.naming.crawler("engineering", "meteorites");
        h.crawler.start_crawl(&crawler_name).await.unwrap();

        let input = StageBInput {
            bucket: STAGE_BUCKET.to_string(),
            keys_to_process: vec!["pre-stage/engineering/meteorites/a.csv".to_string()],
            team: "engineering".to_string(),
            pipeline: "main".to_string(),
            dataset: "meteorites".to_string(),
        };
        let job = h.stage_b.submit(&input).await.unwrap();
        let outcome = h.stage_b.poll(&job).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Completed { .. }));
        assert_eq!(h.peh_store.running_count().await, 0);
    }
}

mod stage_a_failures {
    use super::*;

    #[tokio::test]
    async fn test_empty_transform_result_fails_execution() {
        let h = harness_with(
            meteorites(1, 10),
            Arc::new(EmptyLightTransform),
            Arc::new(ScriptedHeavyTransform::new(&[])),
        )
        .await;

        let message = floe::pipeline::RoutedMessage {
            bucket: RAW_BUCKET.to_string(),
            key: "engineering/meteorites/2026-08/landing.json".to_string(),
            stage: ObjectStage::Raw,
            size: 256,
            landing_time: Utc::now(),
            team: "engineering".to_string(),
            dataset: "meteorites".to_string(),
            pipeline: "main".to_string(),
            partition: Some("2026-08".to_string()),
        };

        let err = h.stage_a.run(&message).await.unwrap_err();
        assert!(err.is_invalid_transform_result());

        // No metadata written, nothing forwarded, no dangling execution
        assert_eq!(h.catalog.object_count().await, 0);
        let queue_b = h.naming.stage_b_queue("engineering", "meteorites");
        assert_eq!(h.queue.visible_len(&queue_b).await, 0);
        assert_eq!(h.peh_store.running_count().await, 0);

        let records = h.peh_store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, PehState::Failed);
        let comment = records[0].comment.clone().unwrap();
        assert!(comment.starts_with("Pre-Stage Process Error:"), "{comment}");
    }
}

mod accumulator {
    use super::*;

    async fn seed_queue(h: &Harness, keys: &[&str]) {
        let queue_b = h.naming.stage_b_queue("engineering", "meteorites");
        for (i, key) in keys.iter().enumerate() {
            h.queue
                .send_message(&queue_b, key, "engineering-meteorites", &format!("d{i}"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_below_minimum_is_no_action() {
        let h = harness_with(
            meteorites(3, 10),
            Arc::new(CopyLightTransform),
            Arc::new(ScriptedHeavyTransform::new(&[])),
        )
        .await;
        seed_queue(&h, &["k1", "k2"]).await;

        let triggered = h
            .accumulator
            .run("engineering", "main", "meteorites")
            .await
            .unwrap();
        assert_eq!(triggered, None);

        // Messages stay visible and no workflow was started
        let queue_b = h.naming.stage_b_queue("engineering", "meteorites");
        assert_eq!(h.queue.visible_len(&queue_b).await, 2);
        assert!(h.workflow.started().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_deliveries_are_deduplicated() {
        let h = harness_with(
            meteorites(1, 10),
            Arc::new(CopyLightTransform),
            Arc::new(ScriptedHeavyTransform::new(&[])),
        )
        .await;
        // Same key delivered twice (distinct dedup ids simulate redelivery)
        seed_queue(&h, &["k1", "k1", "k2"]).await;

        let triggered = h
            .accumulator
            .run("engineering", "main", "meteorites")
            .await
            .unwrap();
        assert_eq!(triggered, Some(2));

        let started = h.workflow.started().await;
        let keys: Vec<String> =
            serde_json::from_value(started[0].payload["body"]["keysToProcess"].clone()).unwrap();
        assert_eq!(keys, ["k1", "k2"]);
    }

    #[tokio::test]
    async fn test_window_never_exceeds_maximum() {
        let h = harness_with(
            meteorites(2, 4),
            Arc::new(CopyLightTransform),
            Arc::new(ScriptedHeavyTransform::new(&[])),
        )
        .await;
        seed_queue(&h, &["k1", "k2", "k3", "k4", "k5", "k6"]).await;

        let triggered = h
            .accumulator
            .run("engineering", "main", "meteorites")
            .await
            .unwrap();
        assert_eq!(triggered, Some(4));

        let queue_b = h.naming.stage_b_queue("engineering", "meteorites");
        assert_eq!(h.queue.visible_len(&queue_b).await, 2);
    }

    #[tokio::test]
    async fn test_trigger_failure_dead_letters_drained_keys() {
        let h = harness_with(
            meteorites(1, 10),
            Arc::new(CopyLightTransform),
            Arc::new(ScriptedHeavyTransform::new(&[])),
        )
        .await;
        seed_queue(&h, &["k1", "k2"]).await;
        h.workflow.fail_with("execution service unavailable").await;

        let err = h
            .accumulator
            .run("engineering", "main", "meteorites")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            floe::PipelineError::DownstreamTrigger { .. }
        ));

        // Drained keys were redirected to the dead-letter path, not lost
        let dlq_b = h.naming.stage_b_dlq("engineering", "meteorites");
        let dead = h.queue.receive_messages(&dlq_b, 10).await.unwrap();
        let mut bodies: Vec<_> = dead.iter().map(|m| m.body.as_str()).collect();
        bodies.sort_unstable();
        assert_eq!(bodies, ["k1", "k2"]);
        assert!(dead.iter().all(|m| m.group == "failed"));
    }
}

mod stage_b_failures {
    use super::*;

    #[tokio::test]
    async fn test_failed_job_ends_execution_exactly_once() {
        let h = harness_with(
            meteorites(1, 10),
            Arc::new(CopyLightTransform),
            Arc::new(ScriptedHeavyTransform::new(&["RUNNING", "FAILED"])),
        )
        .await;

        let input = StageBInput {
            bucket: STAGE_BUCKET.to_string(),
            keys_to_process: vec!["pre-stage/engineering/meteorites/a.csv".to_string()],
            team: "engineering".to_string(),
            pipeline: "main".to_string(),
            dataset: "meteorites".to_string(),
        };
        let job = h.stage_b.submit(&input).await.unwrap();

        let outcome = h.stage_b.poll(&job).await.unwrap();
        let job = match outcome {
            PollOutcome::Running(next) => next,
            other => panic!("expected Running, got {other:?}"),
        };

        let err = h.stage_b.poll(&job).await.unwrap_err();
        assert!(err.is_job_failed());

        let records = h.peh_store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, PehState::Failed);
        let comment = records[0].comment.clone().unwrap();
        assert!(comment.starts_with("Post-Stage Check Error:"), "{comment}");
        assert_eq!(h.peh_store.running_count().await, 0);

        // No crawl was triggered for the failed batch
        let crawler_name = h.naming.crawler("engineering", "meteorites");
        assert_eq!(h.crawler.start_count(&crawler_name).await, 0);
    }

    #[tokio::test]
    async fn test_dead_letter_carries_original_payload() {
        let h = harness_with(
            meteorites(1, 10),
            Arc::new(CopyLightTransform),
            Arc::new(ScriptedHeavyTransform::new(&[])),
        )
        .await;

        let payload = json!({
            "statusCode": 200,
            "body": {"bucket": STAGE_BUCKET, "keysToProcess": ["k1"],
                     "team": "engineering", "pipeline": "main", "dataset": "meteorites"}
        });
        h.stage_b
            .dead_letter("engineering", "meteorites", &payload)
            .await
            .unwrap();

        let dlq_b = h.naming.stage_b_dlq("engineering", "meteorites");
        let dead = h.queue.receive_messages(&dlq_b, 1).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].group, "failed");
        let body: Value = serde_json::from_str(&dead[0].body).unwrap();
        assert_eq!(body, payload);
    }
}
