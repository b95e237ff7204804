use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use crate::protocol::{FileEntry, IndexPhase, StorageError, StorageResult};

use super::cache::{Clock, ManualClock, SystemClock};
use super::config::{Mount, StorageConfig};
use super::index::{IndexStore, SearchQuery};
use super::thumbnail::Thumbnailer;
use super::StorageService;

struct FakeThumbnailer;

#[async_trait]
impl Thumbnailer for FakeThumbnailer {
    async fn thumbnail(&self, _real_path: &Path) -> StorageResult<Vec<u8>> {
        Ok(vec![0xFF, 0xD8, 0xFF])
    }
}

/// A storage named `ssd` rooted at `<temp>/disk`
fn setup() -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("disk");
    std::fs::create_dir(&root).unwrap();
    (temp, root)
}

fn service_with_clock(root: &Path, clock: Arc<dyn Clock>) -> StorageService {
    let config = StorageConfig {
        mounts: vec![Mount {
            name: "ssd".to_string(),
            root: root.to_path_buf(),
        }],
        ..Default::default()
    };
    let index = IndexStore::open_in_memory(config.filter.hidden_prefixes.clone()).unwrap();
    StorageService::with_parts(config, index, clock, Arc::new(FakeThumbnailer))
}

fn service_for(root: &Path) -> StorageService {
    service_with_clock(root, Arc::new(SystemClock))
}

/// Reindex `ssd` and wait until no walk is running
async fn index_now(service: &StorageService) {
    service.scheduler().reindex_storage("ssd").await.unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while service.index_status()[0].phase == IndexPhase::Indexing {
        assert!(std::time::Instant::now() < deadline, "index never settled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn names(files: &[FileEntry]) -> Vec<String> {
    let mut names: Vec<String> = files.iter().map(|f| f.name.clone()).collect();
    names.sort();
    names
}

fn entry(path: &str, modified: i64) -> FileEntry {
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    FileEntry {
        extension: super::path_utils::extension_of(&name),
        name,
        path: path.to_string(),
        is_directory: false,
        size: 10,
        modified,
        item_count: 0,
        mode: None,
    }
}

#[tokio::test]
async fn test_parent_traversal_is_rejected() {
    let (_temp, root) = setup();
    let service = service_for(&root);

    for attempt in ["..", "../..", "a/../../etc", "../disk2"] {
        match service.list("ssd", attempt, false, false).await {
            Err(StorageError::PathEscape { storage, .. }) => assert_eq!(storage, "ssd"),
            other => panic!("expected PathEscape for {}, got: {:?}", attempt, other),
        }
    }
}

#[tokio::test]
async fn test_absolute_and_encoded_paths_stay_inside_root() {
    let (_temp, root) = setup();
    let service = service_for(&root);

    let real = service.real_path("ssd", "/etc/passwd").unwrap();
    assert_eq!(real, root.join("etc/passwd"));

    // percent-encoded dots are a literal file name, not a parent segment
    let real = service.real_path("ssd", "%2e%2e/%2e%2e/secret").unwrap();
    assert!(real.starts_with(&root));
    assert!(matches!(
        service.stat("ssd", "%2e%2e/secret").await,
        Err(StorageError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_unknown_storage_and_case_insensitive_lookup() {
    let (_temp, root) = setup();
    write(&root, "a.txt", "a");
    let service = service_for(&root);

    assert!(matches!(
        service.list("nope", "", false, false).await,
        Err(StorageError::StorageNotFound { .. })
    ));
    assert!(matches!(
        service.list("", "", false, false).await,
        Err(StorageError::ValidationError { .. })
    ));
    assert_eq!(service.list("SSD", "", false, false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_list_matches_directory_contents() {
    let (_temp, root) = setup();
    write(&root, "a.txt", "hello");
    write(&root, "b.jpg", "jpegdata");
    write(&root, "docs/one.pdf", "1");
    write(&root, "docs/two.pdf", "2");
    write(&root, ".secret", "s");
    let service = service_for(&root);

    let files = service.list("ssd", "", false, false).await.unwrap();
    assert_eq!(names(&files), vec!["a.txt", "b.jpg", "docs"]);

    for file in &files {
        let metadata = std::fs::metadata(root.join(&file.path)).unwrap();
        assert_eq!(file.is_directory, metadata.is_dir());
        if file.is_directory {
            assert_eq!(file.item_count, 2);
            assert_eq!(file.extension, "");
        } else {
            assert_eq!(file.size, metadata.len());
        }
    }
    let jpg = files.iter().find(|f| f.name == "b.jpg").unwrap();
    assert_eq!(jpg.extension, "jpg");
    assert_eq!(jpg.path, "b.jpg");

    let with_hidden = service.list("ssd", "", true, false).await.unwrap();
    assert_eq!(with_hidden.len(), 4);

    let nested = service.list("ssd", "docs", false, false).await.unwrap();
    assert_eq!(names(&nested), vec!["one.pdf", "two.pdf"]);
    assert!(nested.iter().all(|f| f.path.starts_with("docs/")));
}

#[tokio::test]
async fn test_list_errors_for_missing_path_and_file() {
    let (_temp, root) = setup();
    write(&root, "a.txt", "a");
    let service = service_for(&root);

    assert!(matches!(
        service.list("ssd", "missing", false, false).await,
        Err(StorageError::NotFound { .. })
    ));
    assert!(matches!(
        service.list("ssd", "a.txt", false, false).await,
        Err(StorageError::NotADirectory { .. })
    ));
}

#[tokio::test]
async fn test_recursive_walk_prunes_hidden_and_junk() {
    let (_temp, root) = setup();
    write(&root, "photos/a.jpg", "a");
    write(&root, "photos/.thumbs/a.jpg", "t");
    write(&root, ".git/config", "c");
    write(&root, "node_modules/lib/index.jpg", "x");
    write(&root, "code/main.rs", "fn main() {}");
    write(&root, "code/README", "r");
    write(&root, "Thumbs.db", "t");
    write(&root, "notes.md", "n");
    let service = service_for(&root);

    let files = service.list("ssd", "ignored", false, true).await.unwrap();
    let mut paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
    paths.sort();
    assert_eq!(paths, vec!["code", "notes.md", "photos", "photos/a.jpg"]);

    // child counts cover everything on disk, not just what the walk kept
    let photos = files.iter().find(|f| f.path == "photos").unwrap();
    assert_eq!(photos.item_count, 2);
    let code = files.iter().find(|f| f.path == "code").unwrap();
    assert_eq!(code.item_count, 2);

    let top = service.list("ssd", "", false, false).await.unwrap();
    let listed = top.iter().find(|f| f.path == "photos").unwrap();
    assert_eq!(listed.item_count, photos.item_count);

    let everything = service.list("ssd", "", true, true).await.unwrap();
    assert!(everything.iter().any(|f| f.path == ".git/config"));
    assert!(everything.iter().any(|f| f.path == "photos/.thumbs/a.jpg"));
    // junk stays out even when hidden entries are shown
    assert!(everything.iter().all(|f| f.path != "code/main.rs"));
}

#[tokio::test]
async fn test_cache_serves_until_ttl_or_mutation() {
    let (_temp, root) = setup();
    write(&root, "a.txt", "a");
    let clock = Arc::new(ManualClock::new());
    let service = service_with_clock(&root, clock.clone());

    assert_eq!(service.list("ssd", "", false, false).await.unwrap().len(), 1);

    // a change behind the service's back is invisible within the TTL
    write(&root, "b.txt", "b");
    assert_eq!(service.list("ssd", "", false, false).await.unwrap().len(), 1);
    clock.advance(Duration::from_secs(61));
    assert_eq!(service.list("ssd", "", false, false).await.unwrap().len(), 2);

    // a mutation through the service is visible immediately
    service.create_folder("ssd", "new").await.unwrap();
    let files = service.list("ssd", "", false, false).await.unwrap();
    assert_eq!(names(&files), vec!["a.txt", "b.txt", "new"]);
}

#[tokio::test]
async fn test_mutation_invalidates_every_listing_of_the_storage() {
    let (_temp, root) = setup();
    write(&root, "docs/a.txt", "a");
    let service = service_for(&root);

    service.list("ssd", "", false, false).await.unwrap();
    service.list("ssd", "docs", false, false).await.unwrap();
    service.list("ssd", "", false, true).await.unwrap();
    assert_eq!(service.cache().len(), 3);

    service.delete("ssd", "docs/a.txt").await.unwrap();
    assert!(service.cache().is_empty());
    assert!(service.list("ssd", "docs", false, false).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_upload_overwrites_and_creates_parents() {
    let (_temp, root) = setup();
    let service = service_for(&root);

    let mut body: &[u8] = b"first version";
    let written = service.upload("ssd", "a/b/file.txt", &mut body).await.unwrap();
    assert_eq!(written, 13);

    let mut body: &[u8] = b"v2";
    service.upload("ssd", "a/b/file.txt", &mut body).await.unwrap();
    assert_eq!(std::fs::read_to_string(root.join("a/b/file.txt")).unwrap(), "v2");

    let mut body: &[u8] = b"x";
    assert!(matches!(
        service.upload("ssd", "a", &mut body).await,
        Err(StorageError::ValidationError { .. })
    ));
}

#[tokio::test]
async fn test_upload_under_a_file_is_rejected() {
    let (_temp, root) = setup();
    write(&root, "plain.txt", "p");
    let service = service_for(&root);

    let mut body: &[u8] = b"x";
    assert!(matches!(
        service.upload("ssd", "plain.txt/child.txt", &mut body).await,
        Err(StorageError::NotADirectory { .. })
    ));
}

#[tokio::test]
async fn test_delete_is_idempotent_and_protects_root() {
    let (_temp, root) = setup();
    write(&root, "dir/inner/a.txt", "a");
    let service = service_for(&root);

    service.delete("ssd", "dir").await.unwrap();
    assert!(!root.join("dir").exists());
    service.delete("ssd", "dir").await.unwrap();

    assert!(matches!(
        service.delete("ssd", "/").await,
        Err(StorageError::ValidationError { .. })
    ));
    assert!(root.exists());
}

#[tokio::test]
async fn test_rename_and_copy() {
    let (_temp, root) = setup();
    write(&root, "album/a.jpg", "a");
    write(&root, "album/sub/b.jpg", "b");
    let service = service_for(&root);

    service.copy("ssd", "album", "backup").await.unwrap();
    assert_eq!(std::fs::read_to_string(root.join("backup/a.jpg")).unwrap(), "a");
    assert_eq!(std::fs::read_to_string(root.join("backup/sub/b.jpg")).unwrap(), "b");

    assert!(matches!(
        service.copy("ssd", "album", "album/inner").await,
        Err(StorageError::ValidationError { .. })
    ));

    service.rename("ssd", "backup", "archive").await.unwrap();
    assert!(!root.join("backup").exists());
    assert!(root.join("archive/sub/b.jpg").exists());

    assert!(matches!(
        service.rename("ssd", "missing", "other").await,
        Err(StorageError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_copy_onto_itself_is_rejected() {
    let (_temp, root) = setup();
    write(&root, "keep.txt", "precious data");
    write(&root, "album/a.jpg", "a");
    let service = service_for(&root);

    for target in ["keep.txt", "./keep.txt", "album/../keep.txt"] {
        assert!(matches!(
            service.copy("ssd", "keep.txt", target).await,
            Err(StorageError::ValidationError { .. })
        ));
    }
    assert!(matches!(
        service.copy("ssd", "album", "album/.").await,
        Err(StorageError::ValidationError { .. })
    ));
    assert_eq!(std::fs::read_to_string(root.join("keep.txt")).unwrap(), "precious data");
    assert_eq!(std::fs::read_to_string(root.join("album/a.jpg")).unwrap(), "a");
}

#[cfg(unix)]
#[tokio::test]
async fn test_copy_onto_a_hard_link_is_rejected() {
    let (_temp, root) = setup();
    write(&root, "keep.txt", "precious data");
    std::fs::hard_link(root.join("keep.txt"), root.join("link.txt")).unwrap();
    let service = service_for(&root);

    assert!(matches!(
        service.copy("ssd", "keep.txt", "link.txt").await,
        Err(StorageError::ValidationError { .. })
    ));
    assert_eq!(std::fs::read_to_string(root.join("keep.txt")).unwrap(), "precious data");
}

#[tokio::test]
async fn test_duplicate_picks_free_copy_names() {
    let (_temp, root) = setup();
    write(&root, "docs/report.txt", "r");
    write(&root, "archive.tar.gz", "z");
    let service = service_for(&root);

    assert_eq!(
        service.duplicate("ssd", "docs/report.txt").await.unwrap(),
        "docs/report_copy.txt"
    );
    assert_eq!(
        service.duplicate("ssd", "docs/report.txt").await.unwrap(),
        "docs/report_copy_1.txt"
    );
    assert_eq!(
        service.duplicate("ssd", "archive.tar.gz").await.unwrap(),
        "archive.tar_copy.gz"
    );
    assert_eq!(std::fs::read_to_string(root.join("docs/report_copy_1.txt")).unwrap(), "r");
}

#[tokio::test]
async fn test_open_file_and_is_directory() {
    let (_temp, root) = setup();
    write(&root, "notes.txt", "hello");
    write(&root, "plain.unknownext", "just some text");
    std::fs::create_dir(root.join("folder")).unwrap();
    let service = service_for(&root);

    let opened = service.open_file("ssd", "notes.txt").await.unwrap();
    assert_eq!(opened.size, 5);
    assert_eq!(opened.content_type, "text/plain");
    assert_eq!(opened.real_path, root.join("notes.txt"));

    let sniffed = service.open_file("ssd", "plain.unknownext").await.unwrap();
    assert_eq!(sniffed.content_type, "text/plain");

    assert!(service.is_directory("ssd", "folder").await.unwrap());
    assert!(!service.is_directory("ssd", "notes.txt").await.unwrap());
    assert!(matches!(
        service.is_directory("ssd", "missing").await,
        Err(StorageError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_thumbnail_only_for_videos() {
    let (_temp, root) = setup();
    write(&root, "clip.mp4", "not really a video");
    let service = service_for(&root);

    assert_eq!(
        service.thumbnail("ssd", "clip.mp4").await.unwrap(),
        vec![0xFF, 0xD8, 0xFF]
    );
    assert!(matches!(
        service.thumbnail("ssd", "clip.txt").await,
        Err(StorageError::ValidationError { .. })
    ));
}

#[tokio::test]
async fn test_search_counts_every_visible_file() {
    let (_temp, root) = setup();
    write(&root, "a.jpg", "a");
    write(&root, "b.PNG", "b");
    write(&root, "docs/c.pdf", "c");
    write(&root, "docs/deep/d.mp4", "d");
    write(&root, ".hidden/e.jpg", "e");
    write(&root, "build/f.jpg", "f");
    write(&root, "src/main.rs", "g");
    let service = service_for(&root);
    index_now(&service).await;

    let walked = service.list("ssd", "", false, true).await.unwrap();
    let visible_files = walked.iter().filter(|f| !f.is_directory).count() as u64;

    let page = service.search("ssd", &[], 0, 0, 0).await.unwrap();
    assert!(page.files.is_empty());
    assert_eq!(page.total, visible_files);
    assert_eq!(page.total, 4);

    let images = service
        .search("ssd", &["jpg".to_string(), ".png".to_string()], 50, 0, 0)
        .await
        .unwrap();
    assert_eq!(images.total, 2);
    assert_eq!(names(&images.files), vec!["a.jpg", "b.PNG"]);
    assert!(images.files.iter().all(|f| !f.is_directory));
}

#[tokio::test]
async fn test_search_pagination() {
    let (_temp, root) = setup();
    for i in 0..25 {
        write(&root, &format!("photos/img_{:02}.jpg", i), "x");
    }
    write(&root, "photos/clip.mp4", "v");
    let service = service_for(&root);
    index_now(&service).await;

    let jpg = vec!["jpg".to_string()];
    let page = service.search("ssd", &jpg, 10, 10, 0).await.unwrap();
    assert_eq!(page.files.len(), 10);
    assert_eq!(page.total, 25);

    let last = service.search("ssd", &["JPG".to_string()], 10, 20, 0).await.unwrap();
    assert_eq!(last.files.len(), 5);

    let beyond = service.search("ssd", &jpg, 10, 40, 0).await.unwrap();
    assert!(beyond.files.is_empty());
    assert_eq!(beyond.total, 25);

    // offset without a limit returns the rest
    let rest = service.search("ssd", &jpg, 0, 20, 0).await.unwrap();
    assert_eq!(rest.files.len(), 5);
}

#[tokio::test]
async fn test_reindex_is_idempotent() {
    let (_temp, root) = setup();
    write(&root, "a.jpg", "a");
    write(&root, "docs/b.pdf", "b");
    let service = service_for(&root);

    index_now(&service).await;
    let first = service.search("ssd", &[], 100, 0, 0).await.unwrap();
    index_now(&service).await;
    let second = service.search("ssd", &[], 100, 0, 0).await.unwrap();

    assert_eq!(first.total, 2);
    assert_eq!(first.total, second.total);
    assert_eq!(first.files, second.files);

    let status = &service.index_status()[0];
    assert_eq!(status.phase, IndexPhase::Fresh);
    assert_eq!(status.last_count, Some(3));
}

#[tokio::test]
async fn test_index_follows_mutations() {
    let (_temp, root) = setup();
    write(&root, "a.jpg", "a");
    let service = service_for(&root);
    index_now(&service).await;

    let mut body: &[u8] = b"new";
    service.upload("ssd", "b.jpg", &mut body).await.unwrap();
    index_now(&service).await;
    assert_eq!(service.search("ssd", &[], 0, 0, 0).await.unwrap().total, 2);

    service.delete("ssd", "a.jpg").await.unwrap();
    index_now(&service).await;
    let page = service.search("ssd", &[], 10, 0, 0).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.files[0].path, "b.jpg");
}

#[tokio::test]
async fn test_stats_groups_sum_to_total() {
    let (_temp, root) = setup();
    write(&root, "a.jpg", "a");
    write(&root, "b.png", "b");
    write(&root, "c.pdf", "c");
    write(&root, "d.mp3", "d");
    write(&root, "e.zip", "e");
    let service = service_for(&root);
    index_now(&service).await;

    let mut groups = BTreeMap::new();
    groups.insert("images".to_string(), vec!["jpg".to_string(), "png".to_string()]);
    groups.insert("documents".to_string(), vec!["pdf".to_string()]);
    groups.insert("empty".to_string(), Vec::new());
    groups.insert("others".to_string(), Vec::new());

    let counts = service.stats("ssd", groups).await.unwrap();
    assert_eq!(counts["images"], 2);
    assert_eq!(counts["documents"], 1);
    assert_eq!(counts["empty"], 0);
    assert_eq!(counts["others"], 2);

    let total = service.search("ssd", &[], 0, 0, 0).await.unwrap().total;
    assert_eq!(counts.values().sum::<u64>(), total);
}

#[tokio::test]
async fn test_reindex_request_validates_storage() {
    let (_temp, root) = setup();
    let service = service_for(&root);

    assert!(matches!(
        service.reindex(Some("nope")),
        Err(StorageError::StorageNotFound { .. })
    ));
    service.reindex(Some("SSD")).unwrap();
    service.reindex(None).unwrap();
}

#[test]
fn test_index_day_window() {
    let index = IndexStore::open_in_memory(vec!['.']).unwrap();
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let day = 24 * 60 * 60 * 1000;
    let now_ms = now.timestamp_millis();
    index
        .rebuild(
            "ssd",
            &[
                entry("today.jpg", now_ms - 1000),
                entry("last_week.jpg", now_ms - 6 * day),
                entry("last_month.jpg", now_ms - 30 * day),
            ],
        )
        .unwrap();

    let query = SearchQuery {
        storage: "ssd".to_string(),
        days: 7,
        limit: 10,
        ..Default::default()
    };
    let page = index.search_at(&query, now).unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.files[0].name, "today.jpg");
    assert_eq!(page.files[1].name, "last_week.jpg");
}

#[test]
fn test_index_recent_orders_newest_first() {
    let index = IndexStore::open_in_memory(vec!['.']).unwrap();
    index
        .rebuild(
            "ssd",
            &[
                entry("old.txt", 1_000),
                entry("new.txt", 3_000),
                entry("mid.txt", 2_000),
                entry(".hidden.txt", 4_000),
            ],
        )
        .unwrap();

    let recent = index.recent("ssd", 2, 0).unwrap();
    let paths: Vec<&str> = recent.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["new.txt", "mid.txt"]);

    let next = index.recent("ssd", 2, 2).unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].path, "old.txt");

    assert!(index.recent("ssd", 0, 0).unwrap().is_empty());
    assert!(index.recent("other", 10, 0).unwrap().is_empty());
}

#[test]
fn test_index_rebuild_replaces_only_its_storage() {
    let index = IndexStore::open_in_memory(vec!['.']).unwrap();
    index.rebuild("ssd", &[entry("a.jpg", 1), entry("b.jpg", 2)]).unwrap();
    index.rebuild("hdd", &[entry("c.jpg", 3)]).unwrap();

    let stats = index.rebuild("ssd", &[entry("d.jpg", 4)]).unwrap();
    assert_eq!(stats.inserted, 1);
    assert_eq!(stats.skipped, 0);
    assert_eq!(index.row_count("ssd").unwrap(), 1);
    assert_eq!(index.row_count("hdd").unwrap(), 1);

    let mut huge = entry("huge.bin", 5);
    huge.size = u64::MAX;
    let stats = index.rebuild("ssd", &[huge, entry("e.jpg", 6)]).unwrap();
    assert_eq!(stats.inserted, 1);
    assert_eq!(stats.skipped, 1);
}

#[test]
fn test_index_persists_across_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("index.db");
    {
        let index = IndexStore::open(&path, vec!['.']).unwrap();
        index.rebuild("ssd", &[entry("a.jpg", 1)]).unwrap();
    }
    let index = IndexStore::open(&path, vec!['.']).unwrap();
    assert_eq!(index.row_count("ssd").unwrap(), 1);
}

#[test]
fn test_aborted_rebuild_keeps_previous_rows() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("index.db");
    let index = IndexStore::open(&path, vec!['.']).unwrap();
    index.rebuild("ssd", &[entry("a.jpg", 1), entry("b.jpg", 2)]).unwrap();

    // a trigger that makes SQLite abandon the whole transaction mid-rebuild
    let other = rusqlite::Connection::open(&path).unwrap();
    other
        .execute_batch(
            "CREATE TRIGGER abort_rebuild BEFORE INSERT ON files
             WHEN NEW.name = 'poison.jpg'
             BEGIN SELECT RAISE(ROLLBACK, 'disk went away'); END;",
        )
        .unwrap();
    drop(other);

    let result = index.rebuild(
        "ssd",
        &[entry("new.jpg", 3), entry("poison.jpg", 4), entry("after.jpg", 5)],
    );
    assert!(matches!(result, Err(StorageError::IndexUnavailable { .. })));

    assert_eq!(index.row_count("ssd").unwrap(), 2);
    let recent = index.recent("ssd", 10, 0).unwrap();
    assert_eq!(names(&recent), vec!["a.jpg", "b.jpg"]);
}
