use crate::db::*;
use tempfile::NamedTempFile;


/// Open a fresh database; keep the returned file alive for the test's duration.
async fn open_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}

fn new_task(job_id: crate::types::JobId, music_id: &str) -> NewTask {
    NewTask {
        job_id,
        music_id: music_id.to_string(),
        music_title: None,
        music_artist: None,
        music_album: None,
        quality: "lossless".to_string(),
    }
}
