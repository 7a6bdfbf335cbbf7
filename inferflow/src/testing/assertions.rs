//! Assertions over collected lifecycle notifications.

use crate::core::{JobId, Stage};
use crate::lifecycle::{CollectingEventSink, NotificationKind};

/// Asserts that `kind` was emitted for the job exactly `times` times.
pub fn assert_notified_times(sink: &CollectingEventSink, job_id: JobId, kind: NotificationKind, times: usize) {
    let seen = sink
        .for_job(job_id)
        .iter()
        .filter(|n| n.kind == kind)
        .count();
    assert_eq!(
        seen, times,
        "Expected {kind} {times} time(s) for job {job_id}, saw {seen}"
    );
}

/// Asserts that `kind` was emitted for one stage of the job exactly `times`
/// times.
pub fn assert_stage_notified_times(
    sink: &CollectingEventSink,
    job_id: JobId,
    stage: Stage,
    kind: NotificationKind,
    times: usize,
) {
    let seen = sink
        .for_job(job_id)
        .iter()
        .filter(|n| n.kind == kind && n.stage == Some(stage))
        .count();
    assert_eq!(
        seen, times,
        "Expected {kind} for stage {stage} {times} time(s) for job {job_id}, saw {seen}"
    );
}

/// Asserts that `kind` was emitted for the job exactly once.
pub fn assert_notified_once(sink: &CollectingEventSink, job_id: JobId, kind: NotificationKind) {
    assert_notified_times(sink, job_id, kind, 1);
}

/// Asserts that `kind` was never emitted for the job.
pub fn assert_not_notified(sink: &CollectingEventSink, job_id: JobId, kind: NotificationKind) {
    assert_notified_times(sink, job_id, kind, 0);
}

/// Asserts that `expected` appears, in order, among the job's
/// notifications. Other notifications may be interleaved.
pub fn assert_notified_in_order(sink: &CollectingEventSink, job_id: JobId, expected: &[NotificationKind]) {
    let kinds: Vec<NotificationKind> = sink.for_job(job_id).iter().map(|n| n.kind).collect();
    let mut remaining = kinds.iter();
    for kind in expected {
        assert!(
            remaining.any(|k| k == kind),
            "Expected {expected:?} in order for job {job_id}, got {kinds:?}"
        );
    }
}
