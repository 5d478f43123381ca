// =============================================================================
// Atomic State Store (C2) — crash-safe JSON snapshots for runner state,
// protections, heartbeat, and the kill-switch flag.
// =============================================================================
//
// A single generic read/write pair reused by every call site in §4.2; the
// store itself carries no domain knowledge of what it's persisting.
// =============================================================================

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

/// Read JSON from `path`, tolerating a missing or corrupt file by returning
/// `default` instead of propagating the error.
pub fn read_json<T: DeserializeOwned>(path: &Path, default: T) -> T {
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state file corrupt — using default");
                default
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "state file missing — using default");
            default
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "state file unreadable — using default");
            default
        }
    }
}

/// Write `value` to `path` with crash-safe replace semantics: serialize to a
/// sibling `.tmp` file, fsync it, then atomically rename over the target.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating state dir {}", parent.display()))?;
    }

    let tmp_path = path.with_extension(tmp_extension(path));
    let body = serde_json::to_string_pretty(value).context("serializing state snapshot")?;

    {
        let mut file = File::create(&tmp_path).with_context(|| format!("creating {}", tmp_path.display()))?;
        file.write_all(body.as_bytes())
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        file.sync_all().with_context(|| format!("fsyncing {}", tmp_path.display()))?;
    }

    fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {} -> {}", tmp_path.display(), path.display()))?;
    debug!(path = %path.display(), "state snapshot written atomically");
    Ok(())
}

fn tmp_extension(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile_like_dir as tempdir;

    // A minimal ad-hoc temp-dir helper so this module doesn't need a
    // `tempfile` dependency just for three tests.
    mod tempfile_like_dir {
        use std::path::PathBuf;

        pub struct Dir(pub PathBuf);

        impl Dir {
            pub fn new(label: &str) -> Self {
                let mut p = std::env::temp_dir();
                p.push(format!("execution-core-test-{label}-{}", std::process::id()));
                let _ = std::fs::remove_dir_all(&p);
                std::fs::create_dir_all(&p).unwrap();
                Dir(p)
            }

            pub fn path(&self) -> &std::path::Path {
                &self.0
            }
        }

        impl Drop for Dir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq, Default)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn round_trips_a_value() {
        let dir = tempdir::Dir::new("roundtrip");
        let path = dir.path().join("sample.json");
        let value = Sample { a: 7, b: "hi".to_string() };
        write_json(&path, &value).unwrap();
        let read_back: Sample = read_json(&path, Sample::default());
        assert_eq!(read_back, value);
    }

    #[test]
    fn missing_file_returns_default() {
        let dir = tempdir::Dir::new("missing");
        let path = dir.path().join("does_not_exist.json");
        let read_back: Sample = read_json(&path, Sample { a: 99, b: "fallback".into() });
        assert_eq!(read_back, Sample { a: 99, b: "fallback".into() });
    }

    #[test]
    fn corrupt_file_returns_default_instead_of_panicking() {
        let dir = tempdir::Dir::new("corrupt");
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let read_back: Sample = read_json(&path, Sample::default());
        assert_eq!(read_back, Sample::default());
    }

    #[test]
    fn no_tmp_file_left_behind_after_write() {
        let dir = tempdir::Dir::new("notmp");
        let path = dir.path().join("sample.json");
        write_json(&path, &Sample { a: 1, b: "x".into() }).unwrap();
        assert!(!dir.path().join("sample.json.tmp").exists());
        assert!(path.exists());
    }
}
