#[path = "../src/backup.rs"]
mod backup;

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn seed_sqlite(path: &Path, label: &str) {
    let conn = rusqlite::Connection::open(path).expect("open sqlite");
    conn.execute_batch("CREATE TABLE IF NOT EXISTS marker(label TEXT NOT NULL)")
        .expect("create marker table");
    conn.execute("INSERT INTO marker(label) VALUES(?)", [label])
        .expect("insert marker");
}

fn read_marker(path: &Path) -> String {
    let conn = rusqlite::Connection::open(path).expect("open sqlite");
    conn.query_row("SELECT label FROM marker", [], |r| r.get(0))
        .expect("read marker")
}

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = temp_dir("academy-backup-src");
    let workspace2 = temp_dir("academy-backup-dst");
    let out_dir = temp_dir("academy-backup-out");

    let db_src = workspace.join("academy.sqlite3");
    seed_sqlite(&db_src, "term one");
    let bytes = std::fs::read(&db_src).expect("read source db");

    let bundle_path = out_dir.join("workspace.academy-backup.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(export.entry_count, 3);
    assert_eq!(export.db_sha256.len(), 64);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("manifest json");
    assert_eq!(
        manifest.get("format").and_then(|v| v.as_str()),
        Some(backup::BUNDLE_FORMAT_V1)
    );
    assert_eq!(
        manifest.get("dbSha256").and_then(|v| v.as_str()),
        Some(export.db_sha256.as_str())
    );
    archive
        .by_name("db/academy.sqlite3")
        .expect("database entry in bundle");
    archive
        .by_name("meta/workspace.json")
        .expect("workspace metadata entry in bundle");

    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT_V1);
    assert_eq!(import.db_sha256, export.db_sha256);

    let db_dst = workspace2.join("academy.sqlite3");
    let restored = std::fs::read(&db_dst).expect("read restored db");
    assert_eq!(restored, bytes);
    assert_eq!(read_marker(&db_dst), "term one");
    assert!(!workspace2.join("academy.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn tampered_bundle_is_rejected_and_existing_db_kept() {
    let out_dir = temp_dir("academy-backup-tamper");
    let workspace = temp_dir("academy-backup-tamper-dst");
    std::fs::write(workspace.join("academy.sqlite3"), b"keep-me").expect("seed existing db");

    let bundle_path = out_dir.join("tampered.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        zip.start_file("manifest.json", opts).expect("manifest");
        zip.write_all(
            serde_json::json!({
                "format": backup::BUNDLE_FORMAT_V1,
                "version": 1,
                "dbSha256": "0000000000000000000000000000000000000000000000000000000000000000",
            })
            .to_string()
            .as_bytes(),
        )
        .expect("write manifest");
        zip.start_file("db/academy.sqlite3", opts).expect("db entry");
        zip.write_all(b"not-what-the-manifest-says")
            .expect("write db");
        zip.finish().expect("finish zip");
    }

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("checksum mismatch must fail");
    assert!(err.to_string().contains("checksum mismatch"), "{}", err);
    let kept = std::fs::read(workspace.join("academy.sqlite3")).expect("read kept db");
    assert_eq!(kept, b"keep-me");
    assert!(!workspace.join("academy.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn foreign_bundle_format_is_rejected() {
    let out_dir = temp_dir("academy-backup-foreign");
    let workspace = temp_dir("academy-backup-foreign-dst");

    let bundle_path = out_dir.join("foreign.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        zip.start_file("manifest.json", zip::write::FileOptions::default())
            .expect("manifest");
        zip.write_all(br#"{"format":"gradebook-workspace-v9"}"#)
            .expect("write manifest");
        zip.finish().expect("finish zip");
    }

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("foreign format must fail");
    assert!(err.to_string().contains("unsupported bundle format"), "{}", err);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn legacy_sqlite_import_is_supported() {
    let out_dir = temp_dir("academy-backup-legacy");
    let workspace = temp_dir("academy-backup-legacy-dst");

    let legacy_file = out_dir.join("legacy.sqlite3");
    seed_sqlite(&legacy_file, "old copy");
    let bytes = std::fs::read(&legacy_file).expect("read legacy sqlite file");

    let import =
        backup::import_workspace_bundle(&legacy_file, &workspace).expect("import legacy sqlite");
    assert_eq!(import.bundle_format_detected, backup::LEGACY_SQLITE_FORMAT);

    let restored = std::fs::read(workspace.join("academy.sqlite3")).expect("read restored sqlite");
    assert_eq!(restored, bytes);
    assert_eq!(read_marker(&workspace.join("academy.sqlite3")), "old copy");

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn non_database_file_is_rejected_and_existing_db_kept() {
    let out_dir = temp_dir("academy-backup-junk");
    let workspace = temp_dir("academy-backup-junk-dst");
    seed_sqlite(&workspace.join("academy.sqlite3"), "live data");

    let junk = out_dir.join("notes.txt");
    std::fs::write(&junk, b"this is not a backup, just some notes").expect("write junk");
    let err = backup::import_workspace_bundle(&junk, &workspace).expect_err("junk must fail");
    assert!(err.to_string().contains("not a SQLite database"), "{}", err);

    // Right header, garbage after it.
    let truncated = out_dir.join("truncated.sqlite3");
    let mut bytes = b"SQLite format 3\0".to_vec();
    bytes.extend_from_slice(&[0xFF; 84]);
    std::fs::write(&truncated, &bytes).expect("write truncated");
    backup::import_workspace_bundle(&truncated, &workspace).expect_err("truncated must fail");

    assert_eq!(read_marker(&workspace.join("academy.sqlite3")), "live data");
    assert!(!workspace.join("academy.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bundle_without_checksum_still_needs_a_database() {
    let out_dir = temp_dir("academy-backup-nosha");
    let workspace = temp_dir("academy-backup-nosha-dst");
    seed_sqlite(&workspace.join("academy.sqlite3"), "live data");

    let bundle_path = out_dir.join("nosha.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        zip.start_file("manifest.json", opts).expect("manifest");
        zip.write_all(
            serde_json::json!({ "format": backup::BUNDLE_FORMAT_V1, "version": 1 })
                .to_string()
                .as_bytes(),
        )
        .expect("write manifest");
        zip.start_file("db/academy.sqlite3", opts).expect("db entry");
        zip.write_all(b"plain text where a database should be")
            .expect("write db");
        zip.finish().expect("finish zip");
    }

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("non-database entry must fail");
    assert!(err.to_string().contains("not a SQLite database"), "{}", err);
    assert_eq!(read_marker(&workspace.join("academy.sqlite3")), "live data");
    assert!(!workspace.join("academy.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}
