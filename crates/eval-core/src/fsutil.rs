use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes to a sibling temp file, fsyncs it and renames it over `path`, so
/// readers observe either the old or the new content and never a torn file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Appends one JSON document as a single line and forces it to stable storage
/// before returning. The line is assembled up front and handed to one
/// `write_all`, so concurrent appenders never interleave partial lines. A
/// torn final line left by a killed writer is terminated first so the new
/// line stays parseable.
pub fn append_json_line<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    let mut line = Vec::new();
    if ends_mid_line(&mut file)? {
        line.push(b'\n');
    }
    serde_json::to_writer(&mut line, value)?;
    line.push(b'\n');
    file.write_all(&line)?;
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

fn ends_mid_line(file: &mut fs::File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

pub fn safe_name(text: &str) -> String {
    let mut out = String::new();
    let mut in_space = false;
    for ch in text.trim().chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let truncated: String = out.chars().take(200).collect();
    match truncated.as_str() {
        "" | "." | ".." => "unnamed".to_string(),
        _ => truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn temp_root(label: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "evalrun_fsutil_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    #[test]
    fn safe_name_normalizes_labels() {
        assert_eq!(safe_name("Qwen/Qwen3 8B"), "Qwen_Qwen3_8B");
        assert_eq!(safe_name("  gpt-4o.mini  "), "gpt-4o.mini");
        assert_eq!(safe_name("a \t b"), "a_b");
        assert_eq!(safe_name(""), "unnamed");
        assert_eq!(safe_name(".."), "unnamed");
        assert_eq!(safe_name(&"x".repeat(300)).len(), 200);
    }

    #[test]
    fn atomic_write_replaces_content_without_leftovers() {
        let root = temp_root("atomic");
        let path = root.join("meta.json");
        atomic_write_json_pretty(&path, &json!({"v": 1})).expect("first write");
        atomic_write_json_pretty(&path, &json!({"v": 2})).expect("second write");
        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("parse");
        assert_eq!(value["v"], 2);
        let entries: Vec<_> = fs::read_dir(&root).expect("list").collect();
        assert_eq!(entries.len(), 1, "temp file must be renamed away");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn append_json_line_writes_one_line_per_call() {
        let root = temp_root("append");
        let path = root.join("nested").join("log.jsonl");
        append_json_line(&path, &json!({"n": 1})).expect("append");
        append_json_line(&path, &json!({"n": 2})).expect("append");
        let text = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec![r#"{"n":1}"#, r#"{"n":2}"#]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn append_after_torn_tail_starts_a_fresh_line() {
        let root = temp_root("torn");
        let path = root.join("log.jsonl");
        fs::write(&path, b"{\"n\":1}\n{\"n\":2,\"par").expect("seed");
        append_json_line(&path, &json!({"n": 3})).expect("append");
        let text = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec![r#"{"n":1}"#, r#"{"n":2,"par"#, r#"{"n":3}"#]);
        assert!(text.ends_with('\n'));
        let _ = fs::remove_dir_all(root);
    }
}
