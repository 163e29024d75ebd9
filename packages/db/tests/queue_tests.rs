#![allow(clippy::disallowed_methods)]

mod common;

use std::collections::HashSet;
use std::error::Error;
use std::time::Duration;

use db::repositories::STALLED_ERROR;
use queue_core::{JobOptions, JobStatus, QueueError, ReportOutcome};

use common::{payload_with_message, setup_queue};

const LOCK: Duration = Duration::from_secs(30);

#[tokio::test]
async fn enqueue_persists_waiting_job() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;

    let id = queue
        .enqueue("email-notification", payload_with_message("hi"), &JobOptions::default())
        .await?;

    let job = queue.get_job(id).await?.ok_or("job missing")?;
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.name, "email-notification");
    assert_eq!(job.payload["msg"], "hi");
    Ok(())
}

#[tokio::test]
async fn enqueue_rejects_invalid_options() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    let err = queue
        .enqueue("email-notification", payload_with_message("x"), &JobOptions::default().with_max_attempts(0))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidOptions(_)));
    Ok(())
}

#[tokio::test]
async fn list_returns_enqueue_order_with_paging() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            queue
                .enqueue("email-notification", payload_with_message(&i.to_string()), &JobOptions::default())
                .await?,
        );
    }

    let all = queue.list_jobs(&[JobStatus::Waiting], 0, 10).await?;
    assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), ids);

    let page = queue.list_jobs(&[JobStatus::Waiting], 1, 2).await?;
    assert_eq!(page.iter().map(|j| j.id).collect::<Vec<_>>(), ids[1..3].to_vec());

    assert!(queue.list_jobs(&[JobStatus::Failed], 0, 10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn counts_include_every_requested_status() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    queue
        .enqueue("email-notification", payload_with_message("a"), &JobOptions::default())
        .await?;
    queue
        .enqueue("email-notification", payload_with_message("b"), &JobOptions::default())
        .await?;
    queue.claim("worker-1", LOCK).await?.ok_or("nothing claimed")?;

    let counts = queue.get_counts(&[]).await?;
    assert_eq!(counts.get(JobStatus::Waiting), 1);
    assert_eq!(counts.get(JobStatus::Active), 1);
    assert!(counts.contains(JobStatus::Completed));
    assert_eq!(counts.get(JobStatus::Failed), 0);

    let only_failed = queue.get_counts(&[JobStatus::Failed]).await?;
    assert!(!only_failed.contains(JobStatus::Waiting));
    Ok(())
}

#[tokio::test]
async fn queues_sharing_a_store_are_isolated() -> Result<(), Box<dyn Error>> {
    let email = setup_queue("email").await?;
    let sms = db::Queue::new(email.broker().clone(), "sms");

    email
        .enqueue("email-notification", payload_with_message("a"), &JobOptions::default())
        .await?;

    assert_eq!(sms.get_counts(&[JobStatus::Waiting]).await?.get(JobStatus::Waiting), 0);
    assert!(sms.claim("worker-1", LOCK).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn claim_marks_active_and_counts_attempt() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    let id = queue
        .enqueue("email-notification", payload_with_message("a"), &JobOptions::default())
        .await?;

    let job = queue.claim("worker-1", LOCK).await?.ok_or("nothing claimed")?;
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.lock.as_ref().map(|l| l.worker_id.as_str()), Some("worker-1"));

    let stored = queue.get_job(id).await?.ok_or("job missing")?;
    assert_eq!(stored.status, JobStatus::Active);
    assert_eq!(stored.lock_token(), job.lock_token());

    assert!(queue.claim("worker-2", LOCK).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn delayed_job_is_not_claimed_early() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    queue
        .enqueue("email-notification", payload_with_message("later"), &JobOptions::default().with_delay_ms(300))
        .await?;

    assert!(queue.claim("worker-1", LOCK).await?.is_none());
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(queue.claim("worker-1", LOCK).await?.is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_share_a_job() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    for i in 0..20 {
        queue
            .enqueue("email-notification", payload_with_message(&i.to_string()), &JobOptions::default())
            .await?;
    }

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let worker_id = format!("worker-{}", worker);
            let mut claimed = Vec::new();
            loop {
                match queue.claim(&worker_id, LOCK).await? {
                    Some(job) => claimed.push(job.id),
                    None => {
                        let waiting = queue.get_counts(&[JobStatus::Waiting]).await?;
                        if waiting.get(JobStatus::Waiting) == 0 {
                            break;
                        }
                    }
                }
            }
            Ok::<_, QueueError>(claimed)
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await?? {
            assert!(seen.insert(id), "job {} claimed twice", id);
        }
    }
    assert_eq!(seen.len(), 20);
    assert_eq!(queue.get_counts(&[JobStatus::Active]).await?.get(JobStatus::Active), 20);
    Ok(())
}

#[tokio::test]
async fn completion_removes_job_by_default() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    let id = queue
        .enqueue("email-notification", payload_with_message("a"), &JobOptions::default())
        .await?;
    let job = queue.claim("worker-1", LOCK).await?.ok_or("nothing claimed")?;

    let outcome = queue.complete(&job, Some(100)).await?;
    assert_eq!(outcome, ReportOutcome::Completed { removed: true });
    assert!(queue.get_job(id).await?.is_none());
    assert_eq!(queue.get_counts(&[]).await?.total(), 0);
    Ok(())
}

#[tokio::test]
async fn retained_completions_are_pruned_oldest_first() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    let options = JobOptions::default().with_remove_on_complete(false);
    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(
            queue
                .enqueue("email-notification", payload_with_message(&i.to_string()), &options)
                .await?,
        );
    }

    for _ in 0..4 {
        let job = queue.claim("worker-1", LOCK).await?.ok_or("nothing claimed")?;
        let outcome = queue.complete(&job, Some(2)).await?;
        assert_eq!(outcome, ReportOutcome::Completed { removed: false });
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let kept = queue.list_jobs(&[JobStatus::Completed], 0, 10).await?;
    assert_eq!(kept.iter().map(|j| j.id).collect::<Vec<_>>(), ids[2..].to_vec());
    assert!(kept.iter().all(|j| j.attempts == 1 && j.finished_at.is_some()));
    Ok(())
}

#[tokio::test]
async fn failure_reschedules_with_backoff() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    let options = JobOptions::default().with_backoff_base_ms(200);
    let id = queue
        .enqueue("email-notification", payload_with_message("a"), &options)
        .await?;

    let job = queue.claim("worker-1", LOCK).await?.ok_or("nothing claimed")?;
    let outcome = queue.fail(&job, "smtp timeout", Some(100)).await?;
    let ReportOutcome::Retrying { attempts, delay, .. } = outcome else {
        return Err(format!("unexpected outcome {:?}", outcome).into());
    };
    assert_eq!(attempts, 1);
    assert_eq!(delay, Duration::from_millis(200));

    let stored = queue.get_job(id).await?.ok_or("job missing")?;
    assert_eq!(stored.status, JobStatus::Waiting);
    assert_eq!(stored.error.as_deref(), Some("smtp timeout"));
    assert!(stored.lock.is_none());

    assert!(queue.claim("worker-1", LOCK).await?.is_none());
    tokio::time::sleep(Duration::from_millis(250)).await;

    let retry = queue.claim("worker-1", LOCK).await?.ok_or("retry not claimable")?;
    assert_eq!(retry.attempts, 2);
    let outcome = queue.fail(&retry, "smtp timeout", Some(100)).await?;
    assert!(matches!(outcome, ReportOutcome::Retrying { delay, .. } if delay == Duration::from_millis(400)));
    Ok(())
}

#[tokio::test]
async fn exhausted_failures_are_retained_up_to_bound() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    let options = JobOptions::default().with_max_attempts(1);
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            queue
                .enqueue("email-notification", payload_with_message(&i.to_string()), &options)
                .await?,
        );
    }

    for _ in 0..3 {
        let job = queue.claim("worker-1", LOCK).await?.ok_or("nothing claimed")?;
        let outcome = queue.fail(&job, "bounced", Some(2)).await?;
        assert_eq!(outcome, ReportOutcome::Failed { attempts: 1 });
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let failed = queue.list_jobs(&[JobStatus::Failed], 0, 10).await?;
    assert_eq!(failed.iter().map(|j| j.id).collect::<Vec<_>>(), ids[1..].to_vec());
    assert!(failed.iter().all(|j| j.attempts == j.max_attempts));
    assert!(queue.claim("worker-1", LOCK).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn guarded_purge_refuses_while_active() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    for i in 0..3 {
        queue
            .enqueue("email-notification", payload_with_message(&i.to_string()), &JobOptions::default())
            .await?;
    }
    queue.claim("worker-1", LOCK).await?.ok_or("nothing claimed")?;
    let before = queue.get_counts(&[]).await?;

    let err = queue.purge(false).await.unwrap_err();
    assert_eq!(err, QueueError::PurgeConflict { active: 1 });
    assert_eq!(queue.get_counts(&[]).await?, before);
    Ok(())
}

#[tokio::test]
async fn guarded_purge_succeeds_when_idle() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    queue
        .enqueue("email-notification", payload_with_message("a"), &JobOptions::default())
        .await?;

    queue.purge(false).await?;
    assert_eq!(queue.get_counts(&[]).await?.total(), 0);
    Ok(())
}

#[tokio::test]
async fn forced_purge_turns_late_reports_into_no_ops() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    for i in 0..2 {
        queue
            .enqueue("email-notification", payload_with_message(&i.to_string()), &JobOptions::default())
            .await?;
    }
    let first = queue.claim("worker-1", LOCK).await?.ok_or("nothing claimed")?;
    let second = queue.claim("worker-2", LOCK).await?.ok_or("nothing claimed")?;

    queue.purge(true).await?;
    let counts = queue.get_counts(&[]).await?;
    assert!(counts.iter().all(|(_, count)| count == 0));

    assert_eq!(queue.complete(&first, Some(100)).await?, ReportOutcome::Missing);
    assert_eq!(queue.fail(&second, "late", Some(100)).await?, ReportOutcome::Missing);
    assert_eq!(queue.get_counts(&[]).await?.total(), 0);
    Ok(())
}

#[tokio::test]
async fn expired_locks_are_recovered_as_failed_attempts() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    let id = queue
        .enqueue("email-notification", payload_with_message("a"), &JobOptions::default())
        .await?;
    let job = queue
        .claim("worker-1", Duration::from_millis(200))
        .await?
        .ok_or("nothing claimed")?;

    assert!(queue.recover_stalled(Some(100)).await?.is_empty());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let recovered = queue.recover_stalled(Some(100)).await?;
    assert_eq!(recovered.len(), 1);
    assert!(recovered[0].1.will_retry());

    let stored = queue.get_job(id).await?.ok_or("job missing")?;
    assert_eq!(stored.status, JobStatus::Waiting);
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.error.as_deref(), Some(STALLED_ERROR));

    // The slot that lost the lock cannot report over the recovered state.
    assert_eq!(queue.complete(&job, Some(100)).await?, ReportOutcome::Missing);
    assert!(!queue.extend_lock(&job, LOCK).await?);
    Ok(())
}

#[tokio::test]
async fn lock_extension_keeps_job_owned() -> Result<(), Box<dyn Error>> {
    let queue = setup_queue("email").await?;
    queue
        .enqueue("email-notification", payload_with_message("a"), &JobOptions::default())
        .await?;
    let job = queue
        .claim("worker-1", Duration::from_millis(200))
        .await?
        .ok_or("nothing claimed")?;

    assert!(queue.extend_lock(&job, LOCK).await?);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(queue.recover_stalled(Some(100)).await?.is_empty());
    assert_eq!(queue.complete(&job, Some(100)).await?, ReportOutcome::Completed { removed: true });
    Ok(())
}
