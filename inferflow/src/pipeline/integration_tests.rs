//! End-to-end runs of the pipeline over the in-memory engine.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::Broker;
use crate::core::{Event, EventType, JobId, JobStatus, JobSubmitted, Payload, Stage};
use crate::errors::{ErrorKind, HandlerError};
use crate::lifecycle::NotificationKind;
use crate::retry::RetryConfig;
use crate::testing::{
    assert_not_notified, assert_notified_in_order, assert_notified_once, assert_notified_times,
    assert_stage_notified_times, compensation_log, fast_config, RecordingCompensator,
    ScriptedExecutor, TestHarness,
};

async fn wait_for_status(harness: &TestHarness, job_id: JobId, status: JobStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(view) = harness.jobs.get_job_status(job_id).await {
                if view.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {job_id} never reached {status}"));
}

async fn wait_for_dead_letters(harness: &TestHarness, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.broker.dead_letters().await.unwrap().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_concurrent_jobs_complete_exactly_once() {
    let harness = TestHarness::builder().fill_succeeding().build().unwrap();
    let handle = harness.start();

    let mut job_ids = Vec::new();
    for i in 0..100 {
        job_ids.push(harness.jobs.submit_default(format!("question {i}")).await.unwrap());
    }
    for job_id in &job_ids {
        let view = harness.wait(*job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.stage, Some(Stage::Generate));
    }

    assert_eq!(harness.sink.count(NotificationKind::JobCompleted), 100);
    for job_id in &job_ids {
        assert_notified_once(&harness.sink, *job_id, NotificationKind::JobCompleted);
        assert_notified_in_order(
            &harness.sink,
            *job_id,
            &[
                NotificationKind::JobCreated,
                NotificationKind::StageCompleted,
                NotificationKind::StageCompleted,
                NotificationKind::StageCompleted,
                NotificationKind::JobCompleted,
            ],
        );
    }

    let output = harness.jobs.get_result(job_ids[7]).await.unwrap().unwrap();
    assert_eq!(output["stage"], "generate");
    assert_eq!(output["input"]["input"]["input"]["prompt"], "question 7");

    handle.shutdown().await.unwrap();
    assert!(harness.broker.dead_letters().await.unwrap().is_empty());
    assert_eq!(harness.broker.unacked_count(), 0);
    assert_eq!(harness.store.lock_count(), 0);
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_success() {
    let rerank = Arc::new(ScriptedExecutor::failing_transient(Stage::Rerank, 2));
    let harness = TestHarness::builder()
        .executor(rerank.clone())
        .fill_succeeding()
        .build()
        .unwrap();
    let handle = harness.start();

    let job_id = harness.jobs.submit_default("retry me").await.unwrap();
    assert_eq!(harness.wait(job_id).await.unwrap().status, JobStatus::Completed);

    assert_eq!(rerank.calls(), 3);
    let job = harness.jobs.get_job(job_id).await.unwrap();
    assert_eq!(job.attempts_for(Stage::Rerank), 3);
    assert_eq!(job.attempts_for(Stage::Retrieve), 1);
    assert_eq!(harness.sink.count(NotificationKind::RetryScheduled), 2);
    assert_not_notified(&harness.sink, job_id, NotificationKind::DeadLettered);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_once_and_fail_job() {
    let rerank = Arc::new(ScriptedExecutor::always_failing(
        Stage::Rerank,
        HandlerError::transient("reranker timeout"),
    ));
    let log = compensation_log();
    let config = fast_config();
    let retry = config.retry.clone().with_max_attempts(3);
    let harness = TestHarness::builder()
        .config(config.with_retry(retry))
        .executor(rerank.clone())
        .fill_succeeding()
        .compensator(Arc::new(RecordingCompensator::new(Stage::Retrieve, log.clone())))
        .build()
        .unwrap();
    let handle = harness.start();

    let job_id = harness.jobs.submit_default("doomed").await.unwrap();
    let view = harness.wait(job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Failed);

    assert_eq!(rerank.calls(), 3);
    let dead = harness.jobs.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].error_kind, ErrorKind::Transient);
    assert_eq!(dead[0].stage(), Some(Stage::Rerank));
    assert_eq!(dead[0].job_id(), Some(job_id));

    assert_eq!(*log.lock(), vec![(job_id, Stage::Retrieve)]);
    assert_notified_once(&harness.sink, job_id, NotificationKind::DeadLettered);
    assert_notified_in_order(
        &harness.sink,
        job_id,
        &[
            NotificationKind::DeadLettered,
            NotificationKind::CompensationStarted,
            NotificationKind::StageCompensated,
            NotificationKind::JobFailed,
        ],
    );
    assert!(view.error.unwrap().contains("reranker timeout"));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_permanent_failure_compensates_in_reverse_order() {
    let generate = Arc::new(ScriptedExecutor::always_failing(
        Stage::Generate,
        HandlerError::permanent("prompt rejected by model"),
    ));
    let log = compensation_log();
    let harness = TestHarness::builder()
        .executor(generate.clone())
        .fill_succeeding()
        .compensator(Arc::new(RecordingCompensator::new(Stage::Retrieve, log.clone())))
        .compensator(Arc::new(RecordingCompensator::new(Stage::Rerank, log.clone())))
        .build()
        .unwrap();
    let handle = harness.start();

    let job_id = harness.jobs.submit_default("unsafe prompt").await.unwrap();
    assert_eq!(harness.wait(job_id).await.unwrap().status, JobStatus::Failed);

    assert_eq!(generate.calls(), 1);
    assert_eq!(
        *log.lock(),
        vec![(job_id, Stage::Rerank), (job_id, Stage::Retrieve)]
    );
    let job = harness.jobs.get_job(job_id).await.unwrap();
    assert_eq!(job.compensated_stages, vec![Stage::Rerank, Stage::Retrieve]);
    assert!(job.pending_result.is_none());
    assert_eq!(harness.jobs.get_result(job_id).await.unwrap(), None);
    assert_notified_once(&harness.sink, job_id, NotificationKind::JobFailed);
    assert_not_notified(&harness.sink, job_id, NotificationKind::JobCompleted);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failing_compensator_still_fails_job() {
    let generate = Arc::new(ScriptedExecutor::always_failing(
        Stage::Generate,
        HandlerError::permanent("model offline"),
    ));
    let log = compensation_log();
    let harness = TestHarness::builder()
        .executor(generate)
        .fill_succeeding()
        .compensator(Arc::new(RecordingCompensator::failing(
            Stage::Rerank,
            log.clone(),
            HandlerError::transient("cache unreachable"),
        )))
        .compensator(Arc::new(RecordingCompensator::new(Stage::Retrieve, log.clone())))
        .build()
        .unwrap();
    let handle = harness.start();

    let job_id = harness.jobs.submit_default("prompt").await.unwrap();
    assert_eq!(harness.wait(job_id).await.unwrap().status, JobStatus::Failed);

    assert_eq!(
        *log.lock(),
        vec![(job_id, Stage::Rerank), (job_id, Stage::Retrieve)]
    );
    let job = harness.jobs.get_job(job_id).await.unwrap();
    assert_eq!(job.compensated_stages, vec![Stage::Retrieve]);
    assert_notified_once(&harness.sink, job_id, NotificationKind::CompensationFailed);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_mid_stage_discards_result() {
    let retrieve = Arc::new(
        ScriptedExecutor::succeeding(Stage::Retrieve).with_delay(Duration::from_millis(200)),
    );
    let rerank = Arc::new(ScriptedExecutor::succeeding(Stage::Rerank));
    let harness = TestHarness::builder()
        .executor(retrieve.clone())
        .executor(rerank.clone())
        .fill_succeeding()
        .build()
        .unwrap();
    let handle = harness.start();

    let job_id = harness.jobs.submit_default("never mind").await.unwrap();
    wait_for_status(&harness, job_id, JobStatus::InProgress).await;
    assert!(harness.jobs.cancel(job_id, "user request").await.unwrap());

    let view = harness.wait(job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Cancelled);
    assert!(view.cancel_requested);

    assert_eq!(retrieve.calls(), 1);
    assert_eq!(rerank.calls(), 0);
    let job = harness.jobs.get_job(job_id).await.unwrap();
    assert!(job.completed_stages.is_empty());
    assert!(job.pending_result.is_none());
    assert_notified_once(&harness.sink, job_id, NotificationKind::ResultDiscarded);
    assert_notified_once(&harness.sink, job_id, NotificationKind::JobCancelled);
    assert_not_notified(&harness.sink, job_id, NotificationKind::StageCompleted);

    assert!(!harness.jobs.cancel(job_id, "again").await.unwrap());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_finished_job_is_noop() {
    let harness = TestHarness::builder().fill_succeeding().build().unwrap();
    let handle = harness.start();

    let job_id = harness.jobs.submit_default("quick").await.unwrap();
    assert_eq!(harness.wait(job_id).await.unwrap().status, JobStatus::Completed);
    assert!(!harness.jobs.cancel(job_id, "too late").await.unwrap());
    assert_eq!(
        harness.jobs.get_job_status(job_id).await.unwrap().status,
        JobStatus::Completed
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_schema_mismatch_is_dead_lettered_without_creating_job() {
    let harness = TestHarness::builder().fill_succeeding().build().unwrap();
    let handle = harness.start();

    let job_id = JobId::new();
    let event = Event::from_body(
        job_id,
        &JobSubmitted {
            prompt: "from the future".to_string(),
            stages: Stage::ALL.to_vec(),
        },
    )
    .unwrap()
    .with_schema_version(99);
    let bytes = serde_json::to_vec(&event).unwrap();
    harness
        .broker
        .publish_raw(EventType::JobSubmitted, bytes.clone())
        .await
        .unwrap();

    wait_for_dead_letters(&harness, 1).await;
    let dead = harness.jobs.dead_letters().await.unwrap();
    assert_eq!(dead[0].error_kind, ErrorKind::SchemaMismatch);
    assert_eq!(dead[0].raw.as_deref(), Some(bytes.as_slice()));
    assert!(dead[0].event.is_none());

    handle.shutdown().await.unwrap();
    assert!(harness.store.is_empty());
    assert_eq!(harness.broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_duplicate_deliveries_are_harmless() {
    let retrieve = Arc::new(ScriptedExecutor::succeeding(Stage::Retrieve));
    let harness = TestHarness::builder()
        .executor(retrieve.clone())
        .fill_succeeding()
        .build()
        .unwrap();
    let handle = harness.start();

    let prompt = "same thing twice".to_string();
    let submitted = Event::from_body(
        JobId::new(),
        &JobSubmitted {
            prompt: prompt.clone(),
            stages: Stage::ALL.to_vec(),
        },
    )
    .unwrap();
    let job_id = submitted.job_id;
    harness.broker.publish(&submitted).await.unwrap();
    assert_eq!(harness.wait(job_id).await.unwrap().status, JobStatus::Completed);

    // Replay the submission and every step.
    harness.broker.publish(&submitted).await.unwrap();
    let stage_input = Payload::inline(serde_json::json!({ "prompt": prompt }));
    harness
        .broker
        .publish(&Event::stage_data(EventType::StageReady, job_id, Stage::Retrieve, stage_input.clone()))
        .await
        .unwrap();
    harness
        .broker
        .publish(&Event::stage_data(EventType::InferenceCompleted, job_id, Stage::Generate, stage_input))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await.unwrap();

    assert_eq!(retrieve.calls(), 1);
    assert_notified_once(&harness.sink, job_id, NotificationKind::JobCreated);
    assert_notified_once(&harness.sink, job_id, NotificationKind::JobCompleted);
    assert_eq!(
        harness.jobs.get_job_status(job_id).await.unwrap().status,
        JobStatus::Completed
    );
    assert!(harness.jobs.dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unacked_delivery_is_redelivered_after_restart() {
    let retrieve = Arc::new(
        ScriptedExecutor::succeeding(Stage::Retrieve).with_delay(Duration::from_millis(300)),
    );
    let harness = TestHarness::builder()
        .config(fast_config().with_shutdown_grace_ms(20))
        .executor(retrieve.clone())
        .fill_succeeding()
        .build()
        .unwrap();

    let handle = harness.start();
    let job_id = harness.jobs.submit_default("survive a crash").await.unwrap();
    wait_for_status(&harness, job_id, JobStatus::InProgress).await;
    handle.shutdown().await.unwrap();
    assert_eq!(harness.broker.unacked_count(), 1);

    let handle = harness.start();
    assert_eq!(harness.broker.redeliver_unacked(), 1);
    assert_eq!(harness.wait(job_id).await.unwrap().status, JobStatus::Completed);

    assert_eq!(retrieve.calls(), 2);
    let job = harness.jobs.get_job(job_id).await.unwrap();
    assert_eq!(job.attempts_for(Stage::Retrieve), 2);
    // The redelivered retrieve does not announce its stage again.
    assert_stage_notified_times(
        &harness.sink,
        job_id,
        Stage::Retrieve,
        NotificationKind::StageStarted,
        1,
    );
    assert_notified_times(&harness.sink, job_id, NotificationKind::StageStarted, 3);
    assert_notified_once(&harness.sink, job_id, NotificationKind::JobCompleted);

    handle.shutdown().await.unwrap();
    assert_eq!(harness.broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_fewer_slots_than_workers_still_completes_jobs() {
    let harness = TestHarness::builder()
        .config(fast_config().with_capacity(1).with_workers(2))
        .fill_succeeding()
        .build()
        .unwrap();
    let handle = harness.start();

    for i in 0..3 {
        let job_id = harness.jobs.submit_default(format!("one slot {i}")).await.unwrap();
        assert_eq!(harness.wait(job_id).await.unwrap().status, JobStatus::Completed);
    }
    let mut job_ids = Vec::new();
    for i in 0..10 {
        job_ids.push(harness.jobs.submit_default(format!("burst {i}")).await.unwrap());
    }
    for job_id in job_ids {
        assert_eq!(harness.wait(job_id).await.unwrap().status, JobStatus::Completed);
    }

    handle.shutdown().await.unwrap();
    assert_eq!(harness.broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_large_outputs_travel_by_reference() {
    let documents = "lorem ipsum ".repeat(1_000);
    let retrieve = Arc::new(
        ScriptedExecutor::succeeding(Stage::Retrieve)
            .with_output(serde_json::json!({ "documents": documents })),
    );
    let harness = TestHarness::builder()
        .config(fast_config().with_inline_limit_bytes(512))
        .executor(retrieve)
        .fill_succeeding()
        .build()
        .unwrap();
    let handle = harness.start();

    let job_id = harness.jobs.submit_default("long context").await.unwrap();
    assert_eq!(harness.wait(job_id).await.unwrap().status, JobStatus::Completed);

    // Retrieve, rerank and generate outputs all exceed the limit.
    assert_eq!(harness.objects.len(), 3);
    let job = harness.jobs.get_job(job_id).await.unwrap();
    assert!(job.pending_result.unwrap().payload.is_reference());

    let output = harness.jobs.get_result(job_id).await.unwrap().unwrap();
    assert_eq!(output["input"]["input"]["documents"], documents.as_str());
    let offloaded = harness
        .sink
        .of_kind(NotificationKind::StageCompleted)
        .iter()
        .filter(|n| n.detail.as_ref().is_some_and(|d| d["offloaded"] == true))
        .count();
    assert_eq!(offloaded, 3);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_submit_rejects_unsupported_pipelines() {
    let harness = TestHarness::builder()
        .executor(Arc::new(ScriptedExecutor::succeeding(Stage::Generate)))
        .build()
        .unwrap();

    assert!(harness.jobs.submit("p", vec![Stage::Generate, Stage::Retrieve]).await.is_err());
    assert!(harness.jobs.submit("p", vec![Stage::Retrieve, Stage::Generate]).await.is_err());
    assert!(harness.jobs.submit("p", Vec::new()).await.is_err());
    assert!(harness.jobs.submit("p", vec![Stage::Generate]).await.is_ok());
}

#[tokio::test]
async fn test_generate_only_pipeline() {
    let harness = TestHarness::builder().fill_succeeding().build().unwrap();
    let handle = harness.start();

    let job_id = harness.jobs.submit("just answer", vec![Stage::Generate]).await.unwrap();
    assert_eq!(harness.wait(job_id).await.unwrap().status, JobStatus::Completed);
    let output = harness.jobs.get_result(job_id).await.unwrap().unwrap();
    assert_eq!(output["input"]["prompt"], "just answer");

    handle.shutdown().await.unwrap();
}

#[test]
fn test_fast_config_is_valid() {
    let config = fast_config();
    assert!(config.validate().is_ok());
    assert_eq!(config.retry.max_attempts, RetryConfig::default().max_attempts);
}
