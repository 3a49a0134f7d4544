//! Case directory discovery.
//!
//! Walks the ingestion root with `walkdir` (sorted by file name, so the
//! order is stable across runs). Every directory holding a `manifest.json`
//! is one [`CaseUnit`]; its `*.html` files are the snapshots. Directories
//! whose relative path matches an `exclude_globs` pattern are not entered.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use case_index_core::manifest::{manifest_fields, resolve_group_id, MANIFEST_FILE};
use case_index_core::models::CaseUnit;

/// What traversal found in one manifest directory.
#[derive(Debug)]
pub enum Discovered {
    Unit(CaseUnit),
    /// Manifest unreadable or not a JSON object; the directory is skipped.
    Skipped { manifest: PathBuf, reason: String },
}

fn normalize_path(p: &Path) -> String {
    p.to_string_lossy().replace('\\', "/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid exclude glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

fn is_html(name: &str) -> bool {
    name.to_lowercase().ends_with(".html")
}

fn list_html_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list case directory: {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if is_html(&name) {
            files.push(name);
        }
    }
    files.sort();
    Ok(files)
}

/// Read one case directory. `Ok(Discovered::Skipped)` for a bad manifest.
pub fn load_case_dir(root: &Path, dir: &Path) -> Result<Discovered> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let rel = dir.strip_prefix(root).unwrap_or(dir);
    let rel_dir = match normalize_path(rel) {
        s if s.is_empty() => ".".to_string(),
        s => s,
    };

    let parsed = std::fs::read_to_string(&manifest_path)
        .map_err(|e| e.to_string())
        .and_then(|s| serde_json::from_str::<Value>(&s).map_err(|e| e.to_string()));
    let manifest = match parsed {
        Ok(v @ Value::Object(_)) => v,
        Ok(_) => {
            return Ok(Discovered::Skipped {
                manifest: manifest_path,
                reason: "manifest is not a JSON object".to_string(),
            })
        }
        Err(reason) => {
            return Ok(Discovered::Skipped {
                manifest: manifest_path,
                reason,
            })
        }
    };

    let html_files = match list_html_files(dir) {
        Ok(files) => files,
        Err(e) => {
            return Ok(Discovered::Skipped {
                manifest: manifest_path,
                reason: format!("{:#}", e),
            })
        }
    };

    Ok(Discovered::Unit(CaseUnit {
        group_id: resolve_group_id(&manifest, &rel_dir),
        manifest_path: normalize_path(&manifest_path),
        rel_dir,
        manifest: manifest_fields(&manifest),
        html_files,
    }))
}

/// Walk `root` and hand every discovery to `emit` in path order.
/// `emit` returning `Break` stops the walk.
pub fn walk_cases<F>(root: &Path, exclude_globs: &[String], mut emit: F) -> Result<()>
where
    F: FnMut(Discovered) -> ControlFlow<()>,
{
    if !root.is_dir() {
        bail!("Ingest root is not a directory: {}", root.display());
    }
    let exclude_set = build_globset(exclude_globs)?;

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            if !e.file_type().is_dir() {
                return true;
            }
            let rel = e.path().strip_prefix(root).unwrap_or(e.path());
            rel.as_os_str().is_empty() || !exclude_set.is_match(normalize_path(rel))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                tracing::warn!(%path, error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_dir() || !entry.path().join(MANIFEST_FILE).is_file() {
            continue;
        }
        let found = load_case_dir(root, entry.path())?;
        if emit(found).is_break() {
            break;
        }
    }
    Ok(())
}

/// All valid case units under `root`; bad manifests are logged and skipped.
pub fn scan_cases(root: &Path, exclude_globs: &[String]) -> Result<Vec<CaseUnit>> {
    let mut units = Vec::new();
    walk_cases(root, exclude_globs, |found| {
        match found {
            Discovered::Unit(u) => units.push(u),
            Discovered::Skipped { manifest, reason } => {
                tracing::warn!(manifest = %manifest.display(), %reason, "skipping case directory");
            }
        }
        ControlFlow::Continue(())
    })?;
    Ok(units)
}

/// Run the walk on the blocking pool, streaming discoveries through a
/// bounded channel. Dropping the receiver stops the walk.
pub fn spawn_traversal(
    root: PathBuf,
    exclude_globs: Vec<String>,
    capacity: usize,
) -> (mpsc::Receiver<Discovered>, tokio::task::JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::task::spawn_blocking(move || {
        walk_cases(&root, &exclude_globs, |found| match tx.blocking_send(found) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        })
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn case(root: &Path, rel: &str, manifest: &str, html: &[&str]) {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
        for name in html {
            fs::write(dir.join(name), "<table></table>").unwrap();
        }
    }

    #[test]
    fn finds_case_directories_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        case(tmp.path(), "2020/02/01/b", r#"{"ID": "b"}"#, &["x.HTML", "notes.txt"]);
        case(tmp.path(), "2020/01/31/a", r#"{"hashed_id": "a", "court_id": 5}"#, &["01-01-2020.00:00:00.html"]);
        fs::create_dir_all(tmp.path().join("2020/03/empty")).unwrap();

        let units = scan_cases(tmp.path(), &[]).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].group_id, "a");
        assert_eq!(units[0].rel_dir, "2020/01/31/a");
        assert_eq!(units[0].manifest.court_code.as_deref(), Some("5"));
        assert!(units[0].manifest_path.ends_with("2020/01/31/a/manifest.json"));
        assert_eq!(units[1].html_files, vec!["x.HTML".to_string()]);
    }

    #[test]
    fn invalid_manifest_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        case(tmp.path(), "2020/01/01/bad", "{not json", &["a.html"]);
        case(tmp.path(), "2020/01/01/list", "[1, 2]", &["a.html"]);
        case(tmp.path(), "2020/01/01/good", "{}", &["a.html"]);

        let mut skipped = 0;
        let mut units = Vec::new();
        walk_cases(tmp.path(), &[], |d| {
            match d {
                Discovered::Unit(u) => units.push(u),
                Discovered::Skipped { .. } => skipped += 1,
            }
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(skipped, 2);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].group_id, "2020/01/01/good");
    }

    #[test]
    fn exclude_globs_prune_directories() {
        let tmp = tempfile::tempdir().unwrap();
        case(tmp.path(), "2020/01/01/a", "{}", &[]);
        case(tmp.path(), "tmp/old/b", "{}", &[]);
        let units = scan_cases(tmp.path(), &["tmp".to_string()]).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].rel_dir, "2020/01/01/a");
    }

    #[test]
    fn vanished_directory_does_not_stop_the_walk() {
        let tmp = tempfile::tempdir().unwrap();
        case(tmp.path(), "a", "{}", &["1.html"]);
        case(tmp.path(), "b/inner", "{}", &["1.html"]);
        case(tmp.path(), "c", "{}", &["1.html"]);

        let mut seen = Vec::new();
        let result = walk_cases(tmp.path(), &[], |d| {
            if let Discovered::Unit(u) = d {
                if u.rel_dir == "a" {
                    fs::remove_dir_all(tmp.path().join("b")).unwrap();
                }
                seen.push(u.rel_dir);
            }
            ControlFlow::Continue(())
        });
        assert!(result.is_ok());
        assert_eq!(seen, vec!["a".to_string(), "c".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        case(tmp.path(), "2020/01/01/a", "{}", &["1.html"]);
        case(tmp.path(), "2020/01/02/locked", "{}", &["1.html"]);
        case(tmp.path(), "2020/01/03/c", "{}", &["1.html"]);
        let locked = tmp.path().join("2020/01/02");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        let readable_anyway = fs::read_dir(&locked).is_ok();

        let units = scan_cases(tmp.path(), &[]);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let rel: Vec<String> = units.unwrap().into_iter().map(|u| u.rel_dir).collect();
        if readable_anyway {
            assert_eq!(rel.len(), 3);
        } else {
            assert_eq!(rel, vec!["2020/01/01/a".to_string(), "2020/01/03/c".to_string()]);
        }
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(scan_cases(&tmp.path().join("nope"), &[]).is_err());
    }
}
