//! Scheduler admission: one in-flight session per tier, skipped ticks,
//! merged manual triggers, bounded shutdown drain.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use warden::db;
use warden::hub::SessionHub;
use warden::scheduler::{Scheduler, TriggerRequest};
use warden::sessions::{SessionRepo, SessionStatus};
use warden::supervisor::{SessionSupervisor, SupervisorConfig, WorkerSpec};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

async fn build(
    dir: &TempDir,
    script_body: &str,
) -> (SessionRepo, Arc<SessionSupervisor>) {
    let url = format!("sqlite:{}/warden-test.db", dir.path().display());
    let pool = db::connect(&url).await.unwrap();
    let repo = SessionRepo::new(pool);
    let script = write_script(dir.path(), "worker.sh", script_body);
    let spec = WorkerSpec {
        binary: script.to_string_lossy().to_string(),
        model: "worker-standard".into(),
        escalation_model: "worker-large".into(),
        prompt_path: "prompts/ops.md".into(),
        allowed_tools: vec!["Bash".into()],
        state_dir: dir.path().join("state").to_string_lossy().to_string(),
        results_dir: dir.path().join("results").to_string_lossy().to_string(),
        dry_run: true,
    };
    let supervisor = Arc::new(SessionSupervisor::new(
        repo.clone(),
        Arc::new(SessionHub::new(200)),
        spec,
        SupervisorConfig {
            logs_dir: dir.path().join("logs"),
            session_timeout: Duration::from_secs(20),
            term_grace: Duration::from_secs(2),
        },
    ));
    (repo, supervisor)
}

async fn wait_for<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn busy_ticks_are_skipped_never_stacked() {
    let dir = TempDir::new().unwrap();
    // Worker outlives several ticks.
    let (repo, supervisor) = build(&dir, "sleep 1").await;

    let cancel = CancellationToken::new();
    let (_trigger_tx, trigger_rx) = mpsc::channel(8);
    let scheduler = Scheduler::new(
        supervisor,
        Duration::from_millis(100),
        trigger_rx,
        cancel.clone(),
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    // Several tick periods pass while the first session is still running.
    tokio::time::sleep(Duration::from_millis(550)).await;
    let sessions = repo.list_recent(10).await.unwrap();
    assert_eq!(sessions.len(), 1, "busy ticks must not create sessions");
    assert_eq!(repo.count_running(1).await.unwrap(), 1);

    cancel.cancel();
    scheduler_task.await.unwrap();

    // Drain terminated the worker; nothing is left running.
    assert_eq!(repo.count_running(1).await.unwrap(), 0);
    let session = &repo.list_recent(10).await.unwrap()[0];
    assert_eq!(session.status, SessionStatus::Canceled);
}

#[tokio::test]
async fn manual_trigger_starts_a_session_between_ticks() {
    let dir = TempDir::new().unwrap();
    let (repo, supervisor) = build(&dir, "exit 0").await;

    let cancel = CancellationToken::new();
    let (trigger_tx, trigger_rx) = mpsc::channel(8);
    let scheduler = Scheduler::new(
        supervisor,
        Duration::from_secs(3600), // timer never fires within the test
        trigger_rx,
        cancel.clone(),
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    trigger_tx
        .send(TriggerRequest {
            tier: 2,
            parent_id: Some(7),
        })
        .await
        .unwrap();

    let repo_poll = repo.clone();
    wait_for(move || {
        let repo = repo_poll.clone();
        async move {
            matches!(
                repo.list_recent(10).await.unwrap().first(),
                Some(s) if s.status == SessionStatus::Completed
            )
        }
    })
    .await;

    let session = &repo.list_recent(10).await.unwrap()[0];
    assert_eq!(session.tier, 2);
    assert_eq!(session.parent_id, Some(7));
    assert_eq!(session.model, "worker-large");

    cancel.cancel();
    scheduler_task.await.unwrap();
}

#[tokio::test]
async fn trigger_for_busy_tier_is_skipped() {
    let dir = TempDir::new().unwrap();
    let (repo, supervisor) = build(&dir, "sleep 1").await;

    let cancel = CancellationToken::new();
    let (trigger_tx, trigger_rx) = mpsc::channel(8);
    let scheduler = Scheduler::new(
        supervisor,
        Duration::from_secs(3600),
        trigger_rx,
        cancel.clone(),
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    for _ in 0..3 {
        trigger_tx
            .send(TriggerRequest {
                tier: 1,
                parent_id: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let repo_poll = repo.clone();
    wait_for(move || {
        let repo = repo_poll.clone();
        async move { !repo.list_recent(10).await.unwrap().is_empty() }
    })
    .await;
    assert_eq!(repo.list_recent(10).await.unwrap().len(), 1);

    cancel.cancel();
    scheduler_task.await.unwrap();
}
