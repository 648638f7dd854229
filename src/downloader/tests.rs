use super::*;
use crate::db::{Database, DownloadInfo, NewJob, NewTask};
use crate::types::TaskId;
use crate::test_helpers::{StubCatalog, test_config};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    downloader: AudioDownloader,
    db: Arc<Database>,
    catalog: Arc<StubCatalog>,
    caches: Arc<TaskCacheRegistry>,
    config: Config,
    task_id: TaskId,
    dest: PathBuf,
    _dir: TempDir,
}

/// Downloader with one task for music id "1" served from `url` with `size` bytes
async fn fixture(url: &str, size: u64, tweak: impl FnOnce(&mut Config)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);

    let db = Arc::new(
        Database::new(&config.persistence.database_path)
            .await
            .unwrap(),
    );
    let job = db
        .insert_job(&NewJob::manual("m", dir.path().to_string_lossy()))
        .await
        .unwrap();
    let (task, _) = db
        .insert_task_if_absent(&NewTask {
            job_id: job.id,
            music_id: "1".to_string(),
            music_title: None,
            music_artist: None,
            music_album: None,
            quality: "lossless".to_string(),
        })
        .await
        .unwrap();

    let dest = config
        .download
        .download_dir
        .join(format!("{}-B - A.flac", task.id));
    db.update_task_download_info(
        task.id,
        &DownloadInfo {
            quality: "lossless".to_string(),
            file_path: dest.to_string_lossy().into_owned(),
            file_name: dest.file_name().unwrap().to_string_lossy().into_owned(),
            file_format: "flac".to_string(),
            file_size: Some(size as i64),
        },
    )
    .await
    .unwrap();

    let catalog = Arc::new(StubCatalog::default());
    catalog.add_song("1", "A", &["B"], url, size, "flac");
    let caches = Arc::new(TaskCacheRegistry::new(catalog.clone()));
    let http = build_http_client(&config.download).unwrap();
    let downloader = AudioDownloader::new(&config, caches.clone(), http);

    Fixture {
        downloader,
        db,
        catalog,
        caches,
        config,
        task_id: task.id,
        dest,
        _dir: dir,
    }
}

impl Fixture {
    async fn run(&self) -> Result<PathBuf> {
        let task = self.db.get_task(self.task_id).await.unwrap().unwrap();
        self.downloader.download(&task).await
    }
}

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn segmented(config: &mut Config) {
    config.download.segment_threshold = 10;
    config.download.min_segment_size = 10;
    config.download.max_threads_per_download = 3;
}

#[tokio::test]
async fn small_file_is_fetched_in_one_request() {
    let server = MockServer::start().await;
    let audio = body(2_000);
    Mock::given(method("GET"))
        .and(path("/f.flac"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(audio.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let f = fixture(&format!("{}/f.flac", server.uri()), 2_000, |_| {}).await;
    let written = f.run().await.unwrap();

    assert_eq!(written, f.dest);
    assert_eq!(std::fs::read(&f.dest).unwrap(), audio);
    assert_eq!(f.catalog.play_url_calls("1"), 1);
}

#[tokio::test]
async fn large_file_is_fetched_in_ranges_and_merged() {
    let server = MockServer::start().await;
    let audio = body(30);
    for (start, end) in [(0usize, 9usize), (10, 19), (20, 29)] {
        Mock::given(method("GET"))
            .and(path("/big.flac"))
            .and(header("range", format!("bytes={}-{}", start, end).as_str()))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(audio[start..=end].to_vec()))
            .expect(1)
            .mount(&server)
            .await;
    }

    let f = fixture(&format!("{}/big.flac", server.uri()), 30, segmented).await;
    f.run().await.unwrap();

    assert_eq!(std::fs::read(&f.dest).unwrap(), audio);
    let cache = segments::cache_dir(&f.config.download.download_dir, f.task_id);
    assert!(!cache.exists(), "part files should be cleaned up");
}

#[tokio::test]
async fn complete_segment_on_disk_is_not_requested_again() {
    let server = MockServer::start().await;
    let audio = body(30);

    Mock::given(method("GET"))
        .and(header("range", "bytes=0-9"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(audio[0..10].to_vec()))
        .expect(0)
        .mount(&server)
        .await;
    for (start, end) in [(10usize, 19usize), (20, 29)] {
        Mock::given(method("GET"))
            .and(header("range", format!("bytes={}-{}", start, end).as_str()))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(audio[start..=end].to_vec()))
            .expect(1)
            .mount(&server)
            .await;
    }

    let f = fixture(&format!("{}/big.flac", server.uri()), 30, segmented).await;

    // Left behind by an interrupted run
    let cache = segments::cache_dir(&f.config.download.download_dir, f.task_id);
    std::fs::create_dir_all(&cache).unwrap();
    std::fs::write(
        segments::part_path(&cache, f.task_id, segments::Segment { start: 0, end: 9 }),
        &audio[0..10],
    )
    .unwrap();

    f.run().await.unwrap();
    assert_eq!(std::fs::read(&f.dest).unwrap(), audio);
}

#[tokio::test]
async fn parts_from_an_earlier_plan_are_discarded() {
    let server = MockServer::start().await;
    let audio = body(30);
    for (start, end) in [(0usize, 9usize), (10, 19), (20, 29)] {
        Mock::given(method("GET"))
            .and(header("range", format!("bytes={}-{}", start, end).as_str()))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(audio[start..=end].to_vec()))
            .expect(1)
            .mount(&server)
            .await;
    }

    let f = fixture(&format!("{}/big.flac", server.uri()), 30, segmented).await;

    // Written while the download ran with two threads
    let cache = segments::cache_dir(&f.config.download.download_dir, f.task_id);
    std::fs::create_dir_all(&cache).unwrap();
    let stale = segments::part_path(&cache, f.task_id, segments::Segment { start: 0, end: 14 });
    std::fs::write(&stale, &audio[0..15]).unwrap();

    f.run().await.unwrap();

    assert_eq!(std::fs::read(&f.dest).unwrap(), audio);
    assert!(!stale.exists());
    assert!(!cache.exists());
}

#[tokio::test]
async fn truncated_segment_is_refetched() {
    let server = MockServer::start().await;
    let audio = body(30);
    for (start, end) in [(0usize, 9usize), (10, 19), (20, 29)] {
        Mock::given(method("GET"))
            .and(header("range", format!("bytes={}-{}", start, end).as_str()))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(audio[start..=end].to_vec()))
            .expect(1)
            .mount(&server)
            .await;
    }

    let f = fixture(&format!("{}/big.flac", server.uri()), 30, segmented).await;
    let cache = segments::cache_dir(&f.config.download.download_dir, f.task_id);
    std::fs::create_dir_all(&cache).unwrap();
    std::fs::write(
        segments::part_path(&cache, f.task_id, segments::Segment { start: 0, end: 9 }),
        &audio[0..4],
    )
    .unwrap();

    f.run().await.unwrap();
    assert_eq!(std::fs::read(&f.dest).unwrap(), audio);
}

#[tokio::test]
async fn expired_url_is_refreshed_and_retried() {
    let server = MockServer::start().await;
    let audio = body(500);
    Mock::given(method("GET"))
        .and(path("/old.flac"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new.flac"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(audio.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let f = fixture(&format!("{}/old.flac", server.uri()), 500, |_| {}).await;

    // Resolve the stale URL into the cache, then let the catalog hand out a new one
    let cache = f.caches.get_or_create(f.task_id, "1").await;
    cache.ensure_play_url("lossless", false).await.unwrap();
    f.catalog
        .set_play_url_target("1", &format!("{}/new.flac", server.uri()));

    f.run().await.unwrap();

    assert_eq!(std::fs::read(&f.dest).unwrap(), audio);
    assert_eq!(f.catalog.play_url_calls("1"), 2);
}

#[tokio::test]
async fn url_that_keeps_expiring_fails_with_url_expired() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let f = fixture(&format!("{}/f.flac", server.uri()), 500, |c| {
        c.download.max_url_refreshes = 2;
    })
    .await;

    let result = f.run().await;

    assert!(matches!(result, Err(Error::UrlExpired { task_id }) if task_id == f.task_id.get()));
    // Initial resolve plus two refreshes
    assert_eq!(f.catalog.play_url_calls("1"), 3);
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3, "403 is not retried with backoff");
}

#[tokio::test]
async fn server_errors_are_retried_with_backoff() {
    let server = MockServer::start().await;
    let audio = body(100);
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(audio.clone()))
        .mount(&server)
        .await;

    let f = fixture(&format!("{}/f.flac", server.uri()), 100, |_| {}).await;
    f.run().await.unwrap();

    assert_eq!(std::fs::read(&f.dest).unwrap(), audio);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn persistent_server_error_fails_after_capped_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let f = fixture(&format!("{}/f.flac", server.uri()), 100, |_| {}).await;
    let result = f.run().await;

    assert!(matches!(result, Err(Error::HttpStatus { status: 500, .. })));
    // max_attempts = 2 retries in the test config
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn concurrency_can_be_changed_live() {
    let f = fixture("http://127.0.0.1:9/unused", 1, |_| {}).await;
    assert_eq!(f.downloader.concurrency(), (3, 4));

    f.downloader.set_concurrency(5, 2);
    assert_eq!(f.downloader.concurrency(), (5, 2));

    f.downloader.set_concurrency(1, 0);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(f.downloader.concurrency(), (1, 1));
}

#[tokio::test]
async fn task_without_temp_path_is_rejected() {
    let f = fixture("http://127.0.0.1:9/unused", 1, |_| {}).await;
    let mut task = f.db.get_task(f.task_id).await.unwrap().unwrap();
    task.file_path = None;

    let result = f.downloader.download(&task).await;
    assert!(matches!(
        result,
        Err(Error::Task(TaskError::MissingField {
            field: "file_path",
            ..
        }))
    ));
}
