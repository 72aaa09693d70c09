//! Small filesystem helpers shared by the stores.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Timestamp usable inside file names: RFC 3339 UTC with microseconds, with
/// `:` and `.` replaced by `-` (`2025-07-29T02-41-35-676065Z`).
pub fn file_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
        .replace([':', '.'], "-")
}

/// Serialize `value` to pretty JSON with a trailing newline and write it
/// atomically (temp file + rename).
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Write `contents` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = tmp_sibling(path)?;
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("path missing file name {}", path.display()))?;
    let mut tmp_name = name.to_os_string();
    tmp_name.push(".tmp");
    Ok(path.with_file_name(tmp_name))
}

/// Copy `src` into `dst` recursively, creating `dst`.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(anyhow!("missing directory {}", src.display()));
    }
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry.context("read entry")?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if entry.file_type().context("read file type")?.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else {
            fs::copy(&path, &target).with_context(|| format!("copy {}", path.display()))?;
        }
    }
    Ok(())
}

/// Delete `dst` (if present) and replace it with a copy of `src`.
pub fn replace_dir(src: &Path, dst: &Path) -> Result<()> {
    remove_dir_if_exists(dst)?;
    copy_dir_recursive(src, dst)
}

pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_timestamp_has_no_colons_or_dots() {
        let at = Utc
            .with_ymd_and_hms(2025, 7, 29, 2, 41, 35)
            .single()
            .expect("valid date");
        assert_eq!(file_timestamp(at), "2025-07-29T02-41-35-000000Z");
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("record.v1.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).expect("write");

        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "{\n  \"a\": 1\n}\n");
        assert!(!temp.path().join("nested").join("record.v1.json.tmp").exists());
        let value: serde_json::Value = read_json(&path).expect("read json");
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn replace_dir_mirrors_source_exactly() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("sub")).expect("mkdir");
        fs::write(src.join("sub").join("a.txt"), "a").expect("write");
        fs::create_dir_all(&dst).expect("mkdir");
        fs::write(dst.join("stale.txt"), "old").expect("write");

        replace_dir(&src, &dst).expect("replace");
        assert_eq!(
            fs::read_to_string(dst.join("sub").join("a.txt")).expect("read"),
            "a"
        );
        assert!(!dst.join("stale.txt").exists());
    }

    #[test]
    fn copy_missing_source_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(copy_dir_recursive(&temp.path().join("nope"), &temp.path().join("dst")).is_err());
    }
}
