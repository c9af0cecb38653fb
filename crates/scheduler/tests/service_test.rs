use std::path::Path;
use std::sync::Arc;

use sner_core::config::ServerConfig;
use sner_core::errors::SnerError;
use sner_core::models::{Excl, ExclFamily};
use sner_scheduler::{JobOutputOutcome, SchedulerService};
use sner_testing_utils::{MockDb, MockSchedulerLock, QueueBuilder};

fn make_service(
    db: &Arc<MockDb>,
    var_dir: &Path,
    hot_level: i64,
    lock: Arc<MockSchedulerLock>,
) -> SchedulerService {
    let config = ServerConfig {
        var_dir: var_dir.to_path_buf(),
        heatmap_hot_level: hot_level,
        heatmap_gc_probability: 0.0,
        timeout_assign_ms: 50,
        timeout_output_ms: 50,
        ..Default::default()
    };
    SchedulerService::new(
        &config,
        Arc::new(db.queues()),
        Arc::new(db.targets()),
        Arc::new(db.jobs()),
        Arc::new(db.excls()),
        lock,
    )
}

fn service(db: &Arc<MockDb>, var_dir: &Path, hot_level: i64) -> SchedulerService {
    make_service(db, var_dir, hot_level, Arc::new(MockSchedulerLock::new()))
}

#[tokio::test]
async fn basic_assign_and_output() {
    let db = MockDb::new();
    let tmp = tempfile::tempdir().unwrap();
    let service = service(&db, tmp.path(), 0);

    let queue = db.add_queue(QueueBuilder::new("q1").group_size(2).build());
    let targets: Vec<String> = (1..=4).map(|i| format!("target-{i}")).collect();
    assert_eq!(service.enqueue(&queue, targets).await.unwrap(), 4);
    assert_eq!(db.target_count(), 4);

    let assignment = service.job_assign(None, &[]).await.unwrap().unwrap();
    assert_eq!(assignment.targets.len(), 2);
    assert_eq!(assignment.config["module"], "dummy");
    // two targets remain enqueued, two moved into the job
    assert_eq!(db.target_count(), 2);
    assert_eq!(db.job_count(), 1);

    let outcome = service
        .job_output(assignment.id, 0, b"zip-payload")
        .await
        .unwrap();
    assert_eq!(outcome, JobOutputOutcome::Success);

    let output_path = tmp
        .path()
        .join("scheduler")
        .join(format!("queue-{}", queue.id))
        .join(assignment.id.to_string());
    assert_eq!(std::fs::read(&output_path).unwrap(), b"zip-payload");

    // repeated upload is silently discarded
    let outcome = service
        .job_output(assignment.id, 0, b"other")
        .await
        .unwrap();
    assert_eq!(outcome, JobOutputOutcome::Discard);
    assert_eq!(std::fs::read(&output_path).unwrap(), b"zip-payload");

    // unknown job id is discarded as well
    let outcome = service
        .job_output(uuid::Uuid::new_v4(), 0, b"data")
        .await
        .unwrap();
    assert_eq!(outcome, JobOutputOutcome::Discard);
}

#[tokio::test]
async fn no_work_on_empty_scheduler() {
    let db = MockDb::new();
    let tmp = tempfile::tempdir().unwrap();
    let service = service(&db, tmp.path(), 0);

    assert!(service.job_assign(None, &[]).await.unwrap().is_none());

    // inactive queue yields no work either
    let queue = db.add_queue(QueueBuilder::new("inactive").active(false).build());
    service
        .enqueue(&queue, vec!["target".to_string()])
        .await
        .unwrap();
    assert!(service.job_assign(None, &[]).await.unwrap().is_none());
}

#[tokio::test]
async fn hot_bucket_skipping() {
    let db = MockDb::new();
    let tmp = tempfile::tempdir().unwrap();
    let service = service(&db, tmp.path(), 1);

    // group_size would allow both targets at once, the hot bucket does not
    let queue = db.add_queue(QueueBuilder::new("q1").group_size(2).build());
    service
        .enqueue(
            &queue,
            vec!["127.0.0.1".to_string(), "127.0.0.2".to_string()],
        )
        .await
        .unwrap();
    // same /24 bucket, single readynet row
    assert_eq!(db.readynet_count(), 1);

    let first = service.job_assign(None, &[]).await.unwrap().unwrap();
    assert_eq!(first.targets.len(), 1);
    assert_eq!(service.heatmap_total().await, 1);
    // bucket went hot, readynet removed
    assert_eq!(db.readynet_count(), 0);

    // remaining target is rate-limited away
    assert!(service.job_assign(None, &[]).await.unwrap().is_none());

    // output cools the bucket and restores the readynet
    service.job_output(first.id, 0, b"output").await.unwrap();
    assert_eq!(service.heatmap_total().await, 0);
    assert_eq!(db.readynet_count(), 1);

    let second = service.job_assign(None, &[]).await.unwrap().unwrap();
    assert_eq!(second.targets.len(), 1);
    assert_ne!(first.targets[0], second.targets[0]);
}

#[tokio::test]
async fn caps_and_priority_selection() {
    let db = MockDb::new();
    let tmp = tempfile::tempdir().unwrap();
    let service = service(&db, tmp.path(), 0);

    let q1 = db.add_queue(QueueBuilder::new("q1").priority(20).build());
    let q2 = db.add_queue(QueueBuilder::new("q2").priority(10).reqs(&["req1"]).build());
    let q3 = db.add_queue(
        QueueBuilder::new("q3")
            .priority(10)
            .reqs(&["req1", "req2"])
            .build(),
    );
    let q4 = db.add_queue(
        QueueBuilder::new("q4")
            .priority(30)
            .reqs(&["req1", "req2"])
            .build(),
    );
    for (queue, target) in [(&q1, "t1"), (&q2, "t2"), (&q3, "t3"), (&q4, "t4")] {
        service
            .enqueue(queue, vec![target.to_string()])
            .await
            .unwrap();
    }

    // q4 requires req2 which the agent does not offer; q1 wins on priority
    let assignment = service
        .job_assign(None, &["req1".to_string()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(assignment.targets, vec!["t1".to_string()]);

    // q1 is drained now; explicit queue restriction yields no work
    assert!(service
        .job_assign(Some("q1"), &["req1".to_string()])
        .await
        .unwrap()
        .is_none());

    // full caps: q4 has the top priority
    let assignment = service
        .job_assign(
            None,
            &["req1".to_string(), "req2".to_string(), "req3".to_string()],
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(assignment.targets, vec!["t4".to_string()]);
}

#[tokio::test]
async fn exclusion_at_assignment_time() {
    let db = MockDb::new();
    let tmp = tempfile::tempdir().unwrap();
    let service = service(&db, tmp.path(), 0);

    let queue = db.add_queue(QueueBuilder::new("q1").build());
    service
        .enqueue(&queue, vec!["127.66.66.0".to_string()])
        .await
        .unwrap();

    // exclusion added after the target was enqueued still applies
    db.add_excl(Excl {
        id: 0,
        family: ExclFamily::Network,
        value: "127.66.66.0/26".to_string(),
        comment: None,
    });

    assert!(service.job_assign(None, &[]).await.unwrap().is_none());
    // the excluded target is gone without any job or heatmap effect
    assert_eq!(db.target_count(), 0);
    assert_eq!(db.job_count(), 0);
    assert_eq!(service.heatmap_total().await, 0);
}

#[tokio::test]
async fn enqueue_normalizes_and_deduplicates() {
    let db = MockDb::new();
    let tmp = tempfile::tempdir().unwrap();
    let service = service(&db, tmp.path(), 0);

    let queue = db.add_queue(QueueBuilder::new("q1").build());
    let inserted = service
        .enqueue(
            &queue,
            vec![
                "  t1  ".to_string(),
                "t1".to_string(),
                "".to_string(),
                "   ".to_string(),
                "t2".to_string(),
            ],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    // re-enqueue of existing targets is a no-op
    let inserted = service
        .enqueue(&queue, vec!["t1".to_string(), "t3".to_string()])
        .await
        .unwrap();
    assert_eq!(inserted, 1);
    assert_eq!(db.target_count(), 3);
}

#[tokio::test]
async fn no_target_handed_out_twice() {
    let db = MockDb::new();
    let tmp = tempfile::tempdir().unwrap();
    let service = service(&db, tmp.path(), 0);

    let queue = db.add_queue(QueueBuilder::new("q1").group_size(3).build());
    let targets: Vec<String> = (0..30).map(|i| format!("10.0.{i}.1")).collect();
    service.enqueue(&queue, targets).await.unwrap();

    let mut seen = std::collections::HashSet::new();
    while let Some(assignment) = service.job_assign(None, &[]).await.unwrap() {
        for target in assignment.targets {
            assert!(seen.insert(target), "target assigned twice");
        }
    }
    assert_eq!(seen.len(), 30);
    assert_eq!(db.target_count(), 0);
}

#[tokio::test]
async fn heatmap_matches_running_jobs() {
    let db = MockDb::new();
    let tmp = tempfile::tempdir().unwrap();
    let service = service(&db, tmp.path(), 0);

    let queue = db.add_queue(QueueBuilder::new("q1").group_size(2).build());
    let targets: Vec<String> = (0..6).map(|i| format!("10.1.{i}.1")).collect();
    service.enqueue(&queue, targets).await.unwrap();

    let a1 = service.job_assign(None, &[]).await.unwrap().unwrap();
    let a2 = service.job_assign(None, &[]).await.unwrap().unwrap();
    let a3 = service.job_assign(None, &[]).await.unwrap().unwrap();
    assert_eq!(
        service.heatmap_total().await,
        (a1.targets.len() + a2.targets.len() + a3.targets.len()) as i64
    );

    service.job_output(a2.id, 0, b"data").await.unwrap();
    assert_eq!(
        service.heatmap_total().await,
        (a1.targets.len() + a3.targets.len()) as i64
    );

    service.job_output(a1.id, 1, b"data").await.unwrap();
    service.job_output(a3.id, 0, b"data").await.unwrap();
    assert_eq!(service.heatmap_total().await, 0);
}

#[tokio::test]
async fn busy_lock_degrades_gracefully() {
    let db = MockDb::new();
    let tmp = tempfile::tempdir().unwrap();
    let lock = Arc::new(MockSchedulerLock::new());
    let service = make_service(&db, tmp.path(), 0, Arc::clone(&lock));

    let queue = db.add_queue(QueueBuilder::new("q1").build());
    service
        .enqueue(&queue, vec!["target".to_string()])
        .await
        .unwrap();

    let blocker = lock.block();

    // assign degrades to nowork
    assert!(service.job_assign(None, &[]).await.unwrap().is_none());
    // output surfaces Busy for the 429 mapping
    let err = service
        .job_output(uuid::Uuid::new_v4(), 0, b"data")
        .await
        .unwrap_err();
    assert!(matches!(err, SnerError::Busy));

    drop(blocker);
    assert!(service.job_assign(None, &[]).await.unwrap().is_some());
}

#[tokio::test]
async fn job_admin_lifecycle() {
    let db = MockDb::new();
    let tmp = tempfile::tempdir().unwrap();
    let service = service(&db, tmp.path(), 1);

    let queue = db.add_queue(QueueBuilder::new("q1").build());
    service
        .enqueue(&queue, vec!["127.0.0.1".to_string()])
        .await
        .unwrap();

    let assignment = service.job_assign(None, &[]).await.unwrap().unwrap();

    // running job cannot be deleted or repeated
    assert!(matches!(
        service.job_delete(assignment.id).await,
        Err(SnerError::Operator(_))
    ));
    assert!(matches!(
        service.job_repeat(assignment.id).await,
        Err(SnerError::Operator(_))
    ));

    // reconcile force-fails it and cools the heatmap
    service.job_reconcile(assignment.id).await.unwrap();
    assert_eq!(service.heatmap_total().await, 0);
    // reconciled targets are NOT re-enqueued
    assert_eq!(db.target_count(), 0);

    // reconcile of a finished job is refused
    assert!(matches!(
        service.job_reconcile(assignment.id).await,
        Err(SnerError::Operator(_))
    ));

    // repeat re-enqueues the assignment targets and deletes the job
    service.job_repeat(assignment.id).await.unwrap();
    assert_eq!(db.target_count(), 1);
    assert_eq!(db.job_count(), 0);
}

#[tokio::test]
async fn queue_admin_lifecycle() {
    let db = MockDb::new();
    let tmp = tempfile::tempdir().unwrap();
    let service = service(&db, tmp.path(), 0);

    let queue = db.add_queue(QueueBuilder::new("q1").build());
    service
        .enqueue(&queue, vec!["t1".to_string(), "t2".to_string()])
        .await
        .unwrap();

    let assignment = service.job_assign(None, &[]).await.unwrap().unwrap();
    service.job_output(assignment.id, 0, b"data").await.unwrap();

    // queue with jobs cannot be deleted
    assert!(matches!(
        service.queue_delete(&queue).await,
        Err(SnerError::Operator(_))
    ));

    service.queue_flush(&queue).await.unwrap();
    assert_eq!(db.target_count(), 0);
    assert_eq!(db.readynet_count(), 0);

    service.queue_prune(&queue).await.unwrap();
    assert_eq!(db.job_count(), 0);

    service.queue_delete(&queue).await.unwrap();
    assert!(service.queue_by_ident("q1").await.is_err());
}

#[tokio::test]
async fn queue_by_ident_resolves_id_and_name() {
    let db = MockDb::new();
    let tmp = tempfile::tempdir().unwrap();
    let service = service(&db, tmp.path(), 0);

    let queue = db.add_queue(QueueBuilder::new("q1").build());
    assert_eq!(service.queue_by_ident("q1").await.unwrap().id, queue.id);
    assert_eq!(
        service
            .queue_by_ident(&queue.id.to_string())
            .await
            .unwrap()
            .name,
        "q1"
    );
    assert!(service.queue_by_ident("nope").await.is_err());
}

#[tokio::test]
async fn heatmap_restored_after_restart() {
    let db = MockDb::new();
    let tmp = tempfile::tempdir().unwrap();
    let service = service(&db, tmp.path(), 1);

    let queue = db.add_queue(QueueBuilder::new("q1").build());
    service
        .enqueue(
            &queue,
            vec!["127.0.0.1".to_string(), "127.0.0.2".to_string()],
        )
        .await
        .unwrap();
    let assignment = service.job_assign(None, &[]).await.unwrap().unwrap();
    assert_eq!(service.heatmap_total().await, 1);

    // crash: fresh service over the same database, empty heatmap dir
    let tmp2 = tempfile::tempdir().unwrap();
    let restarted = service_restart(&db, tmp2.path());
    assert_eq!(restarted.heatmap_total().await, 0);

    restarted.restore_heatmap().await.unwrap();
    assert_eq!(restarted.heatmap_total().await, 1);
    // hot bucket readynet dropped again
    assert_eq!(db.readynet_count(), 0);

    // and the world keeps turning: output cools, assignment resumes
    restarted
        .job_output(assignment.id, 0, b"data")
        .await
        .unwrap();
    assert!(restarted.job_assign(None, &[]).await.unwrap().is_some());
}

fn service_restart(db: &Arc<MockDb>, var_dir: &Path) -> SchedulerService {
    service(db, var_dir, 1)
}

#[tokio::test]
async fn heatmap_persists_across_graceful_restart() {
    let db = MockDb::new();
    let tmp = tempfile::tempdir().unwrap();

    {
        let service = service(&db, tmp.path(), 1);
        let queue = db.add_queue(QueueBuilder::new("q1").build());
        service
            .enqueue(&queue, vec!["127.0.0.1".to_string()])
            .await
            .unwrap();
        service.job_assign(None, &[]).await.unwrap().unwrap();
        service.save_heatmap().await.unwrap();
    }

    let service = service(&db, tmp.path(), 1);
    assert_eq!(service.heatmap_total().await, 1);
}
