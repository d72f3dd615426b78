//! Unit tests for the filesystem helpers.

use super::*;
use std::io::{Read, Write};

use rstest::{fixture, rstest};
use tempfile::TempDir;

#[fixture]
fn temp_dir() -> TempDir {
    TempDir::new().expect("create temp dir")
}

fn utf8(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp path")
}

#[rstest]
#[case(TileNameSuffixMode::None, "out/tile_1_0/city.jsonl")]
#[case(TileNameSuffixMode::SameAsPath, "out/tile_1_0/city_1_0.jsonl")]
fn tile_paths_follow_the_name_mode(#[case] mode: TileNameSuffixMode, #[case] expected: &str) {
    let path = tile_output_path(Utf8Path::new("out/city.jsonl"), "tile", "1_0", mode);
    assert_eq!(path.as_str(), expected);
}

#[rstest]
fn tile_paths_without_parent_stay_relative() {
    let path = tile_output_path(
        Utf8Path::new("city.gml"),
        "part",
        "0_0",
        TileNameSuffixMode::None,
    );
    assert_eq!(path.as_str(), "part_0_0/city.gml");
}

#[rstest]
fn payload_folder_sits_beside_the_output() {
    let folder = payload_folder(Utf8Path::new("out/city.jsonl"), "appearance");
    assert_eq!(folder.as_str(), "out/appearance");
}

#[rstest]
fn create_output_file_creates_missing_folders(temp_dir: TempDir) {
    let path = utf8(&temp_dir).join("a/b/out.jsonl");
    let mut file = create_output_file(&path).expect("create output");
    file.write_all(b"hello").expect("write");
    assert!(file_is_file(&path).expect("inspect"));
}

#[rstest]
fn check_writable_rejects_directories(temp_dir: TempDir) {
    let root = utf8(&temp_dir);
    ensure_dir(&root.join("taken")).expect("create folder");
    let err = check_writable(&root.join("taken")).expect_err("directory target");
    assert!(err.to_string().contains("is a directory"));
}

#[rstest]
fn check_writable_accepts_new_files(temp_dir: TempDir) {
    let path = utf8(&temp_dir).join("nested/out.jsonl");
    check_writable(&path).expect("writable");
    assert!(!file_is_file(&path).expect("inspect"));
}

#[rstest]
fn append_mode_keeps_previous_lines(temp_dir: TempDir) {
    let path = utf8(&temp_dir).join("import.log");
    for line in ["first\n", "second\n"] {
        let (opened, mut file) = open_import_log(&path, ImportLogMode::Append).expect("open log");
        assert_eq!(opened, path);
        file.write_all(line.as_bytes()).expect("write");
    }
    let mut contents = String::new();
    open_utf8_file(&path)
        .expect("reopen")
        .read_to_string(&mut contents)
        .expect("read");
    assert_eq!(contents, "first\nsecond\n");
}

#[rstest]
fn truncate_mode_replaces_previous_lines(temp_dir: TempDir) {
    let path = utf8(&temp_dir).join("import.log");
    for line in ["first\n", "second\n"] {
        let (_, mut file) = open_import_log(&path, ImportLogMode::Truncate).expect("open log");
        file.write_all(line.as_bytes()).expect("write");
    }
    let mut contents = String::new();
    open_utf8_file(&path)
        .expect("reopen")
        .read_to_string(&mut contents)
        .expect("read");
    assert_eq!(contents, "second\n");
}

#[rstest]
fn unique_mode_never_reuses_a_file(temp_dir: TempDir) {
    let path = utf8(&temp_dir).join("import.log");
    let (first, _) = open_import_log(&path, ImportLogMode::Unique).expect("first log");
    let (second, _) = open_import_log(&path, ImportLogMode::Unique).expect("second log");
    assert_ne!(first, second);
    assert!(first.as_str().ends_with(".log"));
    assert!(
        first
            .file_name()
            .is_some_and(|name| name.starts_with("import_"))
    );
}
