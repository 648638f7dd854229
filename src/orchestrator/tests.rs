use super::*;
use crate::db::{DownloadJob, NewJob, TaskSearch};
use crate::error::TaskError;
use crate::test_helpers::{
    FetchMode, StubFetcher, TestContext, create_test_context, create_test_context_with_fetcher,
};
use crate::types::{JobId, TaskId, TaskProgress, TaskStatus};
use std::path::PathBuf;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

async fn stub_context(mode: FetchMode) -> (TestContext, Arc<StubFetcher>) {
    stub_context_with(StubFetcher::new(mode)).await
}

async fn stub_context_with(fetcher: StubFetcher) -> (TestContext, Arc<StubFetcher>) {
    let fetcher = Arc::new(fetcher);
    let tc = create_test_context_with_fetcher(fetcher.clone()).await;
    tc.catalog
        .add_song("1", "A", &["B"], "http://x/f.flac", 4, "flac");
    (tc, fetcher)
}

async fn manual_job(tc: &TestContext, tweak: impl FnOnce(&mut NewJob)) -> DownloadJob {
    let mut job = NewJob::manual("manual", tc.storage_path().to_string_lossy());
    tweak(&mut job);
    tc.ctx.orchestrator.create_job(&job).await.unwrap()
}

async fn wait_for_status(orchestrator: &DownloadOrchestrator, task_id: TaskId, status: TaskStatus) {
    for _ in 0..200 {
        let task = orchestrator.get_task(task_id).await.unwrap().unwrap();
        if task.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached {}", task_id, status);
}

fn audio() -> FetchMode {
    FetchMode::Write(b"fLaC".to_vec())
}

#[tokio::test]
async fn concurrent_submissions_create_one_task_and_one_run() {
    let (tc, fetcher) =
        stub_context_with(StubFetcher::slow(audio(), Duration::from_millis(100))).await;
    let job = manual_job(&tc, |_| {}).await;
    let orchestrator = &tc.ctx.orchestrator;

    let submissions = (0..5).map(|_| orchestrator.submit_download("1", job.id, None));
    let ids = futures::future::join_all(submissions).await;
    let ids: Vec<TaskId> = ids.into_iter().map(|r| r.unwrap()).collect();
    assert!(ids.iter().all(|id| *id == ids[0]));

    // A later sequential submission is also a no-op
    assert_eq!(orchestrator.submit_download("1", job.id, None).await.unwrap(), ids[0]);

    let task = orchestrator.wait_for_task(ids[0], WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(fetcher.calls(), 1);

    let page = orchestrator
        .search_tasks(&TaskSearch {
            job_id: Some(job.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn completion_follows_job_configuration() {
    let (tc, _) = stub_context(audio()).await;
    tc.catalog.set_lyrics("1", "[00:00.00]la");
    let job = manual_job(&tc, |j| {
        j.embed_cover = false;
        j.embed_lyrics = true;
        j.embed_metadata = false;
    })
    .await;

    let task_id = tc.ctx.orchestrator.submit_download("1", job.id, None).await.unwrap();
    let task = tc.ctx.orchestrator.wait_for_task(task_id, WAIT).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(
        task.progress(),
        TaskProgress::MUSIC_DOWNLOADED | TaskProgress::LYRICS_COMPLETED | TaskProgress::FILE_FINALIZED
    );
    assert_eq!(task.music_title.as_deref(), Some("A"));
    assert_eq!(task.music_artist.as_deref(), Some("B"));
    assert_eq!(
        task.file_path.map(PathBuf::from),
        Some(tc.storage_path().join("B - A.flac"))
    );
}

#[tokio::test]
async fn cancelling_a_running_task_is_terminal() {
    let (tc, _) = stub_context(FetchMode::Hang).await;
    let job = manual_job(&tc, |_| {}).await;
    let orchestrator = &tc.ctx.orchestrator;

    let task_id = orchestrator.submit_download("1", job.id, None).await.unwrap();
    wait_for_status(orchestrator, task_id, TaskStatus::Downloading).await;
    assert_eq!(orchestrator.list_active_tasks().await.unwrap().len(), 1);

    assert!(orchestrator.cancel_task(task_id).await.unwrap());

    let task = orchestrator.wait_for_task(task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.completed_at.is_some());
    assert!(orchestrator.list_active_tasks().await.unwrap().is_empty());
    assert!(tc.ctx.caches.is_empty().await);

    // Nothing left to cancel
    assert!(!orchestrator.cancel_task(task_id).await.unwrap());
}

#[tokio::test]
async fn cancelling_a_completed_task_fails() {
    let (tc, _) = stub_context(audio()).await;
    let job = manual_job(&tc, |_| {}).await;
    let orchestrator = &tc.ctx.orchestrator;

    let task_id = orchestrator.submit_download("1", job.id, None).await.unwrap();
    orchestrator.wait_for_task(task_id, WAIT).await.unwrap();

    assert!(!orchestrator.cancel_task(task_id).await.unwrap());
    assert!(!orchestrator.cancel_task(TaskId(9999)).await.unwrap());
    let task = orchestrator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn end_to_end_download_lands_under_the_template_name() {
    let server = MockServer::start().await;
    let audio: Vec<u8> = (0..2_000_000u32).map(|i| (i % 253) as u8).collect();
    Mock::given(method("GET"))
        .and(path("/f.flac"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(audio.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let tc = create_test_context().await;
    tc.catalog.add_song(
        "12345",
        "A",
        &["B"],
        &format!("{}/f.flac", server.uri()),
        2_000_000,
        "flac",
    );
    let job = manual_job(&tc, |j| {
        j.target_quality = "lossless".to_string();
        j.filename_template = "{artist} - {title}".to_string();
    })
    .await;

    let task_id = tc
        .ctx
        .orchestrator
        .submit_download("12345", job.id, None)
        .await
        .unwrap();
    let task = tc.ctx.orchestrator.wait_for_task(task_id, WAIT).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error_message);
    assert!(
        task.progress()
            .contains(TaskProgress::MUSIC_DOWNLOADED | TaskProgress::FILE_FINALIZED)
    );
    let final_path = tc.storage_path().join("B - A.flac");
    assert_eq!(task.file_path.map(PathBuf::from), Some(final_path.clone()));
    assert_eq!(std::fs::read(&final_path).unwrap(), audio);
    assert_eq!(task.file_size, Some(2_000_000));
}

#[tokio::test]
async fn preparation_failure_marks_task_failed() {
    let (tc, fetcher) = stub_context(FetchMode::Forbidden).await;
    let job = manual_job(&tc, |_| {}).await;
    let mut events = tc.ctx.orchestrator.subscribe();

    // Not in the catalog
    let task_id = tc.ctx.orchestrator.submit_download("404", job.id, None).await.unwrap();
    let task = tc.ctx.orchestrator.wait_for_task(task_id, WAIT).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.as_deref().unwrap().starts_with("Preparation failed:"));
    assert_eq!(fetcher.calls(), 0);

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        failed |= matches!(event, Event::TaskFailed { task_id: id, .. } if id == task_id);
    }
    assert!(failed);
}

#[tokio::test]
async fn lifecycle_events_are_broadcast() {
    let (tc, _) = stub_context(audio()).await;
    let job = manual_job(&tc, |_| {}).await;
    let mut events = tc.ctx.orchestrator.subscribe();

    let task_id = tc.ctx.orchestrator.submit_download("1", job.id, None).await.unwrap();
    tc.ctx.orchestrator.wait_for_task(task_id, WAIT).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen[0], Event::TaskQueued { task_id: id, job_id, .. } if id == task_id && job_id == job.id));
    assert!(seen.iter().any(|e| matches!(e, Event::TaskStarted { .. })));
    assert!(matches!(
        seen.last(),
        Some(Event::TaskCompleted { path: Some(_), .. })
    ));
}

#[tokio::test]
async fn restart_failed_tasks_reruns_them() {
    let (tc, fetcher) = stub_context(FetchMode::Fail).await;
    tc.catalog
        .add_song("2", "C", &["D"], "http://x/g.flac", 4, "flac");
    let job = manual_job(&tc, |_| {}).await;
    let orchestrator = &tc.ctx.orchestrator;

    let ids = orchestrator
        .submit_batch_download(job.id, &["1".to_string(), "2".to_string()])
        .await
        .unwrap();
    for &id in &ids {
        let task = orchestrator.wait_for_task(id, WAIT).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }
    let job_row = orchestrator.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job_row.total_tasks, 2);
    assert_eq!(job_row.failed_tasks, 2);

    fetcher.set_mode(audio());
    let restarted = orchestrator.restart_failed_tasks(job.id).await.unwrap();
    assert_eq!(restarted, ids);

    for &id in &ids {
        let task = orchestrator.wait_for_task(id, WAIT).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error_message.is_none());
    }
    assert_eq!(fetcher.calls(), 4);
}

#[tokio::test]
async fn batch_submission_skips_failures() {
    let (tc, _) = stub_context(audio()).await;
    let job = manual_job(&tc, |_| {}).await;

    let ids = tc
        .ctx
        .orchestrator
        .submit_batch_download(JobId(job.id.get() + 100), &["1".to_string()])
        .await;
    // Unknown job: every submission fails, and so does the counter update target
    assert!(ids.map(|ids| ids.is_empty()).unwrap_or(true));

    let ids = tc
        .ctx
        .orchestrator
        .submit_batch_download(job.id, &["1".to_string(), "1".to_string()])
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], ids[1]);
}

#[tokio::test]
async fn quality_upgrade_replaces_the_task() {
    let (tc, fetcher) = stub_context(audio()).await;
    let job = manual_job(&tc, |_| {}).await;
    let orchestrator = &tc.ctx.orchestrator;

    let old_id = orchestrator.submit_download("1", job.id, None).await.unwrap();
    orchestrator.wait_for_task(old_id, WAIT).await.unwrap();

    let new_id = orchestrator
        .upgrade_task_quality(job.id, "1", "hires")
        .await
        .unwrap();

    assert_ne!(new_id, old_id);
    assert!(orchestrator.get_task(old_id).await.unwrap().is_none());
    let task = orchestrator.wait_for_task(new_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn reset_refuses_running_tasks() {
    let (tc, _) = stub_context(FetchMode::Hang).await;
    let job = manual_job(&tc, |_| {}).await;
    let orchestrator = &tc.ctx.orchestrator;

    let task_id = orchestrator.submit_download("1", job.id, None).await.unwrap();
    wait_for_status(orchestrator, task_id, TaskStatus::Downloading).await;

    let result = orchestrator.reset_task(task_id).await;
    assert!(matches!(
        result,
        Err(Error::Task(TaskError::InvalidState { .. }))
    ));

    orchestrator.cancel_task(task_id).await.unwrap();
    orchestrator.wait_for_task(task_id, WAIT).await.unwrap();
    assert!(orchestrator.reset_task(task_id).await.unwrap());
    let task = orchestrator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.progress_flags, 0);
}

#[tokio::test]
async fn stats_merge_registry_and_database() {
    let (tc, _) = stub_context(FetchMode::Hang).await;
    tc.catalog
        .add_song("2", "C", &["D"], "http://x/g.flac", 4, "flac");
    let job = manual_job(&tc, |_| {}).await;
    let orchestrator = &tc.ctx.orchestrator;

    let running = orchestrator.submit_download("1", job.id, None).await.unwrap();
    let pending_row = orchestrator.submit_download("2", job.id, None).await.unwrap();
    wait_for_status(orchestrator, running, TaskStatus::Downloading).await;
    wait_for_status(orchestrator, pending_row, TaskStatus::Downloading).await;
    orchestrator.cancel_task(pending_row).await.unwrap();
    orchestrator.wait_for_task(pending_row, WAIT).await.unwrap();

    let stats = orchestrator.get_stats().await.unwrap();
    assert_eq!(stats.active_tasks, 1);
    assert_eq!(stats.active_task_ids, vec![running]);
    assert_eq!(stats.total_tasks, 2);
    assert_eq!(stats.by_status.get(&TaskStatus::Cancelled), Some(&1));
    assert_eq!(stats.by_status.get(&TaskStatus::Downloading), Some(&1));
    assert_eq!(
        (stats.max_concurrent_downloads, stats.max_threads_per_download),
        (1, 1)
    );
}

#[tokio::test]
async fn concurrency_settings_reach_the_downloader() {
    let tc = create_test_context().await;
    tc.ctx.orchestrator.update_concurrency_settings(6, 2);

    let stats = tc.ctx.orchestrator.get_stats().await.unwrap();
    assert_eq!(stats.max_concurrent_downloads, 6);
    assert_eq!(stats.max_threads_per_download, 2);
}

#[tokio::test]
async fn delete_job_stops_its_runs() {
    let (tc, _) = stub_context(FetchMode::Hang).await;
    let job = manual_job(&tc, |_| {}).await;
    let orchestrator = &tc.ctx.orchestrator;

    let task_id = orchestrator.submit_download("1", job.id, None).await.unwrap();
    wait_for_status(orchestrator, task_id, TaskStatus::Downloading).await;

    assert!(orchestrator.delete_job(job.id).await.unwrap());
    assert!(orchestrator.get_job(job.id).await.unwrap().is_none());
    assert!(orchestrator.get_task(task_id).await.unwrap().is_none());

    for _ in 0..100 {
        if orchestrator.get_stats().await.unwrap().active_tasks == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run of deleted job still registered");
}

#[tokio::test]
async fn resume_picks_up_unfinished_rows() {
    let (tc, fetcher) = stub_context(audio()).await;
    let job = manual_job(&tc, |_| {}).await;
    let (task, _) = tc
        .ctx
        .db
        .insert_task_if_absent(&crate::db::NewTask {
            job_id: job.id,
            music_id: "1".to_string(),
            music_title: None,
            music_artist: None,
            music_album: None,
            quality: "lossless".to_string(),
        })
        .await
        .unwrap();

    let resumed = tc.ctx.orchestrator.resume_unfinished_tasks().await.unwrap();
    assert_eq!(resumed, vec![task.id]);

    let task = tc.ctx.orchestrator.wait_for_task(task.id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn shutdown_stops_runs_and_refuses_submissions() {
    let (tc, _) = stub_context(FetchMode::Hang).await;
    let job = manual_job(&tc, |_| {}).await;
    let orchestrator = &tc.ctx.orchestrator;

    let task_id = orchestrator.submit_download("1", job.id, None).await.unwrap();
    wait_for_status(orchestrator, task_id, TaskStatus::Downloading).await;

    orchestrator.shutdown().await.unwrap();

    // Left resumable
    let task = orchestrator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Downloading);
    assert_eq!(orchestrator.get_stats().await.unwrap().active_tasks, 0);
    assert!(matches!(
        orchestrator.wait_for_task(task_id, WAIT).await,
        Err(Error::ShuttingDown)
    ));
    assert!(matches!(
        orchestrator.submit_download("2", job.id, None).await,
        Err(Error::ShuttingDown)
    ));
}

#[tokio::test]
async fn wait_for_task_times_out() {
    let (tc, _) = stub_context(FetchMode::Hang).await;
    let job = manual_job(&tc, |_| {}).await;

    let task_id = tc.ctx.orchestrator.submit_download("1", job.id, None).await.unwrap();
    let result = tc
        .ctx
        .orchestrator
        .wait_for_task(task_id, Some(Duration::from_millis(100)))
        .await;

    assert!(matches!(
        result,
        Err(Error::Task(TaskError::Timeout { .. }))
    ));
    tc.ctx.orchestrator.cancel_task(task_id).await.unwrap();
}

#[tokio::test]
async fn rerun_and_upgrade_replace_their_own_output() {
    let (tc, _) = stub_context(audio()).await;
    let job = manual_job(&tc, |j| {
        j.embed_cover = false;
        j.embed_lyrics = false;
    })
    .await;
    let orchestrator = &tc.ctx.orchestrator;
    let final_path = tc.storage_path().join("B - A.flac");
    let renamed = tc.storage_path().join("B - A (1).flac");

    let task_id = orchestrator.submit_download("1", job.id, None).await.unwrap();
    let task = orchestrator.wait_for_task(task_id, WAIT).await.unwrap();
    assert_eq!(task.file_path.map(PathBuf::from), Some(final_path.clone()));

    assert!(orchestrator.rerun_task(task_id).await.unwrap());
    let task = orchestrator.wait_for_task(task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.file_path.map(PathBuf::from), Some(final_path.clone()));
    assert!(!renamed.exists());

    let new_id = orchestrator
        .upgrade_task_quality(job.id, "1", "hires")
        .await
        .unwrap();
    let task = orchestrator.wait_for_task(new_id, WAIT).await.unwrap();
    assert_eq!(task.file_path.map(PathBuf::from), Some(final_path.clone()));
    assert!(final_path.exists());
    assert!(!renamed.exists());
}

#[tokio::test]
async fn unrelated_files_in_the_way_are_still_renamed() {
    let (tc, _) = stub_context(audio()).await;
    let job = manual_job(&tc, |j| {
        j.embed_cover = false;
        j.embed_lyrics = false;
    })
    .await;
    std::fs::write(tc.storage_path().join("B - A.flac"), b"someone else's").unwrap();

    let task_id = tc.ctx.orchestrator.submit_download("1", job.id, None).await.unwrap();
    let task = tc.ctx.orchestrator.wait_for_task(task_id, WAIT).await.unwrap();

    assert_eq!(
        task.file_path.map(PathBuf::from),
        Some(tc.storage_path().join("B - A (1).flac"))
    );
    assert_eq!(
        std::fs::read(tc.storage_path().join("B - A.flac")).unwrap(),
        b"someone else's"
    );
}
