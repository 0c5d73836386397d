use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use upload_stager::staging::paths::MARKER_FILE;
use upload_stager::staging::{
    BinaryPart, CommitCoordinator, CommitError, FieldInput, FileId, IdGenerator, IngestResolver,
    ItemSource, StageError, StagedRef, StagingStore, UploadItem,
};

struct Harness {
    _dir: tempfile::TempDir,
    ids: Arc<IdGenerator>,
    store: Arc<StagingStore>,
    ingest: IngestResolver,
    commits: CommitCoordinator,
    uploads: std::path::PathBuf,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StagingStore::open(dir.path().join("tmp")).unwrap());
    let ids = Arc::new(IdGenerator::new());
    Harness {
        ingest: IngestResolver::new(Arc::clone(&ids), Arc::clone(&store)),
        commits: CommitCoordinator::new(Arc::clone(&store)),
        uploads: dir.path().join("uploads"),
        _dir: dir,
        ids,
        store,
    }
}

fn bytes_item(h: &Harness, name: &str, data: &[u8]) -> UploadItem {
    UploadItem::from_bytes(
        h.ids.next(),
        name,
        "text/plain",
        Bytes::copy_from_slice(data),
    )
}

fn encoded(name: &str, data: &[u8]) -> String {
    serde_json::json!({
        "id": "client-side-id",
        "name": name,
        "type": "text/plain",
        "size": data.len(),
        "data": STANDARD.encode(data),
    })
    .to_string()
}

fn entry_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// ============================================================================
// StagingStore
// ============================================================================

#[test]
fn test_stage_and_retrieve() {
    let h = harness();
    let item = bytes_item(&h, "hello.txt", b"hello world");
    let id = item.id().clone();

    let staged = h.store.stage(item).unwrap();
    assert_eq!(staged.id, id);
    assert_eq!(staged.name, "hello.txt");
    assert_eq!(staged.size, 11);

    let blob = h.store.retrieve(&id).unwrap().expect("file should be staged");
    assert_eq!(blob.name, "hello.txt");
    assert_eq!(blob.length, 11);
    assert_eq!(blob.content, Bytes::from_static(b"hello world"));
    assert_eq!(blob.mime_type, "text/plain");
}

#[test]
fn test_staged_entry_layout() {
    let h = harness();
    let item = bytes_item(&h, "report.pdf", b"%PDF-1.4");
    let id = item.id().clone();
    h.store.stage(item).unwrap();

    let dir = h.store.root().join(id.as_str());
    assert_eq!(entry_files(&dir), vec![MARKER_FILE.to_string(), "report.pdf".to_string()]);
}

#[test]
fn test_stage_empty_file() {
    let h = harness();
    let item = bytes_item(&h, "empty.bin", b"");
    let id = item.id().clone();
    h.store.stage(item).unwrap();

    let blob = h.store.retrieve(&id).unwrap().unwrap();
    assert_eq!(blob.length, 0);
    assert!(blob.content.is_empty());
}

#[test]
fn test_stage_large_file() {
    let h = harness();
    let data: Vec<u8> = (0..6 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let item = bytes_item(&h, "large.bin", &data);
    let id = item.id().clone();
    h.store.stage(item).unwrap();

    let blob = h.store.retrieve(&id).unwrap().unwrap();
    assert_eq!(blob.length, data.len() as u64);
    assert_eq!(blob.content.as_ref(), data.as_slice());
}

#[test]
fn test_stage_from_temp_upload_renames_it() {
    let h = harness();
    let mut spool = h.store.incoming().unwrap();
    spool.write_all(b"spooled bytes").unwrap();
    let temp_path = spool.into_temp_path();
    let spool_path = temp_path.to_path_buf();

    let item = UploadItem::new(
        h.ids.next(),
        ItemSource::TempFile(temp_path),
        "upload.txt",
        13,
        "text/plain",
    );
    let id = item.id().clone();
    h.store.stage(item).unwrap();

    assert!(!spool_path.exists());
    let blob = h.store.retrieve(&id).unwrap().unwrap();
    assert_eq!(blob.content, Bytes::from_static(b"spooled bytes"));
}

#[test]
fn test_stage_from_existing_file_leaves_source() {
    let h = harness();
    let source = h._dir.path().join("source.txt");
    fs::write(&source, b"copy me").unwrap();

    let item = UploadItem::new(
        h.ids.next(),
        ItemSource::File(source.clone()),
        "copied.txt",
        7,
        "text/plain",
    );
    let id = item.id().clone();
    h.store.stage(item).unwrap();

    assert!(source.exists());
    let blob = h.store.retrieve(&id).unwrap().unwrap();
    assert_eq!(blob.content, Bytes::from_static(b"copy me"));
}

#[test]
fn test_stage_size_mismatch_leaves_nothing_behind() {
    let h = harness();
    let item = UploadItem::new(
        h.ids.next(),
        ItemSource::Bytes(Bytes::from_static(b"short")),
        "truncated.txt",
        100,
        "text/plain",
    );
    let id = item.id().clone();

    let err = h.store.stage(item).unwrap_err();
    assert!(matches!(err, StageError::Io(_)));
    assert!(!h.store.contains(&id));
}

#[test]
fn test_stage_traversal_name_is_confined() {
    let h = harness();
    let item = bytes_item(&h, "../../escape.txt", b"nope");
    let id = item.id().clone();
    h.store.stage(item).unwrap();

    let dir = h.store.root().join(id.as_str());
    assert!(dir.join("escape.txt").is_file());
    assert!(!h._dir.path().join("escape.txt").exists());
}

#[test]
fn test_stage_rejects_unusable_name() {
    let h = harness();
    let item = bytes_item(&h, "..", b"data");
    let id = item.id().clone();

    assert!(matches!(h.store.stage(item), Err(StageError::Validation(_))));
    assert!(!h.store.contains(&id));
}

#[test]
fn test_stage_rejects_reserved_names() {
    let h = harness();
    let marker = h.store.root().join(MARKER_FILE);
    let marker_before = fs::read(&marker).unwrap();

    for name in [".htaccess", "nested/.HTACCESS", ".part-x.txt"] {
        let item = bytes_item(&h, name, b"Options +ExecCGI");
        let id = item.id().clone();

        assert!(
            matches!(h.store.stage(item), Err(StageError::Validation(_))),
            "name {name:?}"
        );
        assert!(!h.store.contains(&id));
    }
    assert_eq!(fs::read(&marker).unwrap(), marker_before);
}

#[test]
fn test_stage_twice_with_same_id_is_rejected() {
    let h = harness();
    let id = h.ids.next();
    let first = UploadItem::from_bytes(id.clone(), "a.txt", "text/plain", Bytes::from("a"));
    let second = UploadItem::from_bytes(id.clone(), "b.txt", "text/plain", Bytes::from("b"));

    h.store.stage(first).unwrap();
    assert!(matches!(h.store.stage(second), Err(StageError::AlreadyStaged(_))));

    let dir = h.store.root().join(id.as_str());
    assert_eq!(entry_files(&dir), vec![MARKER_FILE.to_string(), "a.txt".to_string()]);
}

#[test]
fn test_retrieve_unknown_id() {
    let h = harness();
    assert!(h.store.retrieve(&h.ids.next()).unwrap().is_none());
}

#[test]
fn test_stage_delete_retrieve() {
    let h = harness();
    let item = bytes_item(&h, "gone.txt", b"bye");
    let id = item.id().clone();
    h.store.stage(item).unwrap();

    h.store.delete(&id);
    assert!(!h.store.contains(&id));
    assert!(h.store.retrieve(&id).unwrap().is_none());
}

#[test]
fn test_delete_never_staged_is_noop() {
    let h = harness();
    let id = h.ids.next();
    h.store.delete(&id);
    h.store.delete(&id);
    assert!(!h.store.contains(&id));
}

#[cfg(unix)]
#[test]
fn test_staged_file_is_not_executable() {
    use std::os::unix::fs::PermissionsExt;

    let h = harness();
    let item = bytes_item(&h, "script.sh", b"#!/bin/sh\necho hi\n");
    let id = item.id().clone();
    h.store.stage(item).unwrap();

    let path = h.store.staged_file(&id).unwrap().unwrap();
    let mode = fs::metadata(path).unwrap().permissions().mode();
    assert_eq!(mode & 0o111, 0);
}

// ============================================================================
// UploadItem
// ============================================================================

#[test]
fn test_rename_keeps_extension() {
    let h = harness();
    let mut item = bytes_item(&h, "photo.jpeg", b"x");
    item.rename("avatar", None);
    assert_eq!(item.file_name().unwrap(), "avatar.jpeg");

    item.rename("avatar", Some("png"));
    assert_eq!(item.file_name().unwrap(), "avatar.png");

    let mut bare = bytes_item(&h, "README", b"x");
    bare.rename("notes", None);
    assert_eq!(bare.file_name().unwrap(), "notes");
}

#[test]
fn test_renamed_item_is_staged_under_new_name() {
    let h = harness();
    let mut item = bytes_item(&h, "dir/original.txt", b"renamed");
    item.rename("final", None);
    let id = item.id().clone();
    h.store.stage(item).unwrap();

    let blob = h.store.retrieve(&id).unwrap().unwrap();
    assert_eq!(blob.name, "final.txt");
}

// ============================================================================
// IngestResolver
// ============================================================================

#[test]
fn test_resolve_skips_malformed_inline_payloads() {
    let h = harness();
    let inputs = vec![
        FieldInput::from_text(encoded("one.txt", b"first")),
        FieldInput::from_text("{not json".to_string()),
        FieldInput::from_text(encoded("two.txt", b"second")),
    ];

    let results = h.ingest.resolve_field(inputs);
    assert_eq!(results.len(), 2);

    let names: Vec<String> = results
        .iter()
        .map(|r| match r.as_ref().unwrap() {
            StagedRef::Staged(item) => item.name.clone(),
            other => panic!("unexpected entry {other:?}"),
        })
        .collect();
    assert_eq!(names, vec!["one.txt", "two.txt"]);

    for result in &results {
        assert!(h.store.contains(result.as_ref().unwrap().id()));
    }
}

#[test]
fn test_resolve_skips_invalid_base64() {
    let h = harness();
    let bad = serde_json::json!({"name": "bad.txt", "type": "text/plain", "data": "***"}).to_string();
    let results = h.ingest.resolve_field(vec![FieldInput::from_text(bad)]);
    assert!(results.is_empty());
}

#[test]
fn test_resolve_decodes_inline_content() {
    let h = harness();
    let results = h
        .ingest
        .resolve_field(vec![FieldInput::from_text(encoded("note.txt", b"inline data"))]);

    let id = results[0].as_ref().unwrap().id().clone();
    let blob = h.store.retrieve(&id).unwrap().unwrap();
    assert_eq!(blob.name, "note.txt");
    assert_eq!(blob.content, Bytes::from_static(b"inline data"));
}

#[test]
fn test_resolve_orders_inline_binary_then_references() {
    let h = harness();

    let existing = bytes_item(&h, "earlier.txt", b"earlier");
    let existing_id = existing.id().clone();
    h.store.stage(existing).unwrap();

    let inputs = vec![
        FieldInput::StagedReference(existing_id.clone()),
        FieldInput::BinaryPart(BinaryPart {
            source: ItemSource::Bytes(Bytes::from_static(b"binary")),
            name: "part.bin".to_string(),
            size: 6,
            mime_type: "application/octet-stream".to_string(),
        }),
        FieldInput::from_text(encoded("inline.txt", b"inline")),
    ];

    let results: Vec<StagedRef> = h
        .ingest
        .resolve_field(inputs)
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(results.len(), 3);

    match &results[0] {
        StagedRef::Staged(item) => assert_eq!(item.name, "inline.txt"),
        other => panic!("expected inline item first, got {other:?}"),
    }
    match &results[1] {
        StagedRef::Staged(item) => assert_eq!(item.name, "part.bin"),
        other => panic!("expected binary item second, got {other:?}"),
    }
    match &results[2] {
        StagedRef::Existing { id } => assert_eq!(id, &existing_id),
        other => panic!("expected reference last, got {other:?}"),
    }
}

#[test]
fn test_text_values_are_classified_once() {
    let h = harness();
    let id = h.ids.next();
    assert!(matches!(
        FieldInput::from_text(id.to_string()),
        FieldInput::StagedReference(ref parsed) if parsed == &id
    ));
    assert!(matches!(
        FieldInput::from_text("hello".to_string()),
        FieldInput::InlinePayload(_)
    ));
}

#[test]
fn test_resolve_reports_staging_failures_per_item() {
    let h = harness();
    let inputs = vec![
        FieldInput::BinaryPart(BinaryPart {
            source: ItemSource::Bytes(Bytes::from_static(b"ok")),
            name: "ok.txt".to_string(),
            size: 2,
            mime_type: "text/plain".to_string(),
        }),
        FieldInput::BinaryPart(BinaryPart {
            source: ItemSource::Bytes(Bytes::from_static(b"bad")),
            name: "/".to_string(),
            size: 3,
            mime_type: "text/plain".to_string(),
        }),
    ];

    let results = h.ingest.resolve_field(inputs);
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(StageError::Validation(_))));
}

// ============================================================================
// CommitCoordinator
// ============================================================================

#[test]
fn test_commit_moves_file_and_clears_staging() {
    let h = harness();
    let item = bytes_item(&h, "doc.txt", b"committed!");
    let id = item.id().clone();
    h.store.stage(item).unwrap();

    let report = h.commits.commit(&[id.clone()], &h.uploads);
    assert!(report.all_succeeded());
    assert_eq!(report.results[0].file_name().as_deref(), Some("doc.txt"));

    assert_eq!(fs::read(h.uploads.join("doc.txt")).unwrap(), b"committed!");
    assert!(!h.store.contains(&id));
    // Permanent storage gets no marker.
    assert!(!h.uploads.join(MARKER_FILE).exists());
}

#[test]
fn test_commit_partial_failure_cleans_up_both() {
    let h = harness();
    let a = bytes_item(&h, "a.txt", b"aaaa");
    let b = bytes_item(&h, "b.txt", b"bbbb");
    let (a_id, b_id) = (a.id().clone(), b.id().clone());
    h.store.stage(a).unwrap();
    h.store.stage(b).unwrap();

    // A directory squatting on b.txt makes the move for B fail.
    let blocker = h.uploads.join("b.txt");
    fs::create_dir_all(&blocker).unwrap();
    fs::write(blocker.join("keep"), b"occupied").unwrap();

    let report = h.commits.commit(&[a_id.clone(), b_id.clone()], &h.uploads);
    assert!(report.results[0].is_success());
    assert!(matches!(report.results[1].outcome, Err(CommitError::AlreadyExists(_))));
    assert!(report.is_partial_failure());

    assert_eq!(fs::read(h.uploads.join("a.txt")).unwrap(), b"aaaa");
    assert!(!h.store.contains(&a_id));
    assert!(!h.store.contains(&b_id));
}

#[test]
fn test_commit_same_name_twice_keeps_first() {
    let h = harness();
    let first = bytes_item(&h, "photo.jpg", b"first");
    let second = bytes_item(&h, "holiday/photo.jpg", b"second");
    let (first_id, second_id) = (first.id().clone(), second.id().clone());
    h.store.stage(first).unwrap();
    h.store.stage(second).unwrap();

    let report = h.commits.commit(&[first_id.clone(), second_id.clone()], &h.uploads);
    assert!(report.results[0].is_success());
    assert!(matches!(
        report.results[1].outcome,
        Err(CommitError::AlreadyExists(ref path)) if path == &h.uploads.join("photo.jpg")
    ));
    assert!(report.is_partial_failure());

    assert_eq!(fs::read(h.uploads.join("photo.jpg")).unwrap(), b"first");
    assert!(!h.store.contains(&first_id));
    assert!(!h.store.contains(&second_id));
}

#[test]
fn test_commit_does_not_replace_existing_upload() {
    let h = harness();
    fs::create_dir_all(&h.uploads).unwrap();
    fs::write(h.uploads.join("notes.txt"), b"original").unwrap();

    let item = bytes_item(&h, "notes.txt", b"replacement");
    let id = item.id().clone();
    h.store.stage(item).unwrap();

    let report = h.commits.commit(&[id], &h.uploads);
    assert!(!report.all_succeeded());
    assert_eq!(fs::read(h.uploads.join("notes.txt")).unwrap(), b"original");
}

#[test]
fn test_commit_unknown_id_fails_without_aborting_batch() {
    let h = harness();
    let missing = h.ids.next();
    let item = bytes_item(&h, "present.txt", b"here");
    let present = item.id().clone();
    h.store.stage(item).unwrap();

    let report = h.commits.commit(&[missing.clone(), present.clone()], &h.uploads);
    assert!(matches!(
        report.results[0].outcome,
        Err(CommitError::NotFound(ref id)) if id == &missing
    ));
    assert!(report.results[1].is_success());
    assert!(h.uploads.join("present.txt").is_file());
}

#[test]
fn test_staged_then_committed_id_cannot_be_restored() {
    let h = harness();
    let item = bytes_item(&h, "once.txt", b"once");
    let id = item.id().clone();
    h.store.stage(item).unwrap();

    h.commits.commit(&[id.clone()], &h.uploads);
    assert!(h.store.retrieve(&id).unwrap().is_none());

    let again = h.commits.commit(&[id], &h.uploads);
    assert!(!again.results[0].is_success());
}

#[test]
fn test_load_committed_file() {
    let h = harness();
    let item = bytes_item(&h, "kept.txt", b"kept");
    let id = item.id().clone();
    h.store.stage(item).unwrap();
    h.commits.commit(&[id], &h.uploads);

    let blob = CommitCoordinator::load(&h.uploads, "../uploads/kept.txt")
        .unwrap()
        .expect("committed file should load");
    assert_eq!(blob.name, "kept.txt");
    assert_eq!(blob.content, Bytes::from_static(b"kept"));

    assert!(CommitCoordinator::load(&h.uploads, "missing.txt").unwrap().is_none());
}

#[test]
fn test_end_to_end_traversal_name() {
    let h = harness();
    let data = b"0123456789";
    let item = bytes_item(&h, "a/../b.txt", data);
    let id = item.id().clone();
    h.store.stage(item).unwrap();

    let dir = h.store.root().join(id.as_str());
    assert!(dir.join("b.txt").is_file());
    assert!(!dir.join("a").exists());

    let report = h.commits.commit(&[id.clone()], &h.uploads);
    assert!(report.all_succeeded());
    assert_eq!(fs::read(h.uploads.join("b.txt")).unwrap(), data);
    assert!(!dir.exists());
}

#[test]
fn test_file_id_round_trip_through_text() {
    let h = harness();
    let id = h.ids.next();
    let parsed: FileId = id.to_string().parse().unwrap();
    assert_eq!(parsed, id);
}

#[test]
fn test_remote_file_stages_like_inline_payload() {
    let h = harness();
    let remote = upload_stager::fetch::RemoteFile {
        name: "cat.jpg".to_string(),
        content: Bytes::from_static(b"\xff\xd8\xff"),
        content_type: Some("image/jpeg".to_string()),
    };

    let staged = h.ingest.stage(remote.into_upload_item(h.ingest.next_id())).unwrap();
    let blob = h.store.retrieve(staged.id()).unwrap().unwrap();
    assert_eq!(blob.name, "cat.jpg");
    assert_eq!(blob.mime_type, "image/jpeg");
    assert_eq!(blob.length, 3);
}
