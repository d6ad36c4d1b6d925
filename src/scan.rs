//! Document discovery on the local filesystem.
//!
//! Walks `[scan].root` and keeps the files worth indexing: allowed extension,
//! include/exclude globs, a size window, and a "valuable" keyword somewhere
//! in the relative path (lease, insurance, invoice, ...). Output is sorted by
//! relative path.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::ScanConfig;
use crate::extract::content_type_for;
use crate::models::SourceFile;

const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/~$*",
    "**/.DS_Store",
    "**/Thumbs.db",
    "**/.Trash*/**",
];

pub fn scan_files(scan: &ScanConfig) -> Result<Vec<SourceFile>> {
    let root = &scan.root;
    if !root.exists() {
        bail!("Scan root does not exist: {}", root.display());
    }

    let include_set = build_globset(&scan.include_globs)?;
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(scan.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let extensions: Vec<String> = scan
        .extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect();
    let keywords: Vec<String> = scan.keywords.iter().map(|k| k.to_lowercase()).collect();

    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(scan.follow_symlinks) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable path");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !extensions.iter().any(|e| *e == ext) {
            continue;
        }
        let content_type = match content_type_for(path) {
            Some(ct) => ct,
            None => {
                tracing::debug!(path = %rel_str, "no extractor for extension");
                continue;
            }
        };

        let size_bytes = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                tracing::warn!(path = %rel_str, error = %e, "cannot stat file");
                continue;
            }
        };
        if size_bytes < scan.min_size_bytes || size_bytes > scan.max_size_bytes {
            tracing::debug!(path = %rel_str, size_bytes, "outside size window");
            continue;
        }

        if !is_valuable(&rel_str, &keywords) {
            continue;
        }

        files.push(SourceFile {
            path: path.to_path_buf(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            relative_path: rel_str,
            size_bytes,
            content_type: content_type.to_string(),
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// True when the path mentions one of the (lowercased) keywords, or when no
/// keywords are configured.
fn is_valuable(relative_path: &str, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return true;
    }
    let lower = relative_path.to_lowercase();
    keywords.iter().any(|k| lower.contains(k.as_str()))
}

/// SHA-256 of a file's content, hex encoded.
pub fn file_hash(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn scan_config(root: &Path) -> ScanConfig {
        let cfg: crate::config::Config = toml::from_str(&format!(
            "[db]\npath = \"x.sqlite\"\n[scan]\nroot = \"{}\"\nmin_size_bytes = 1000\n",
            root.display()
        ))
        .unwrap();
        cfg.scan.unwrap()
    }

    fn write(dir: &Path, rel: &str, len: usize) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![b'x'; len]).unwrap();
    }

    #[test]
    fn keeps_only_valuable_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "Gare 28/Bail_Dupont.pdf", 2000);
        write(root, "Gare 28/Assurances/police_2023.pdf", 2000);
        write(root, "Gare 28/photo_facade.pdf", 2000);
        write(root, "Gare 28/bail_court.pdf", 10);
        write(root, "Gare 28/bail_notes.txt", 2000);
        write(root, "Gare 28/bail_ancien.doc", 2000);
        write(root, ".git/bail.pdf", 2000);

        let files = scan_files(&scan_config(root)).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(
            names,
            vec!["Gare 28/Assurances/police_2023.pdf", "Gare 28/Bail_Dupont.pdf"]
        );
        assert_eq!(files[1].file_name, "Bail_Dupont.pdf");
        assert_eq!(files[1].content_type, crate::extract::MIME_PDF);
    }

    #[test]
    fn empty_keyword_list_keeps_everything() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "photo.pdf", 2000);
        let mut cfg = scan_config(tmp.path());
        cfg.keywords.clear();
        assert_eq!(scan_files(&cfg).unwrap().len(), 1);
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let cfg = scan_config(&tmp.path().join("nope"));
        assert!(scan_files(&cfg).is_err());
    }

    #[test]
    fn hash_is_content_based() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.pdf"), b"same").unwrap();
        fs::write(tmp.path().join("b.pdf"), b"same").unwrap();
        fs::write(tmp.path().join("c.pdf"), b"other").unwrap();
        let a = file_hash(&tmp.path().join("a.pdf")).unwrap();
        assert_eq!(a, file_hash(&tmp.path().join("b.pdf")).unwrap());
        assert_ne!(a, file_hash(&tmp.path().join("c.pdf")).unwrap());
        assert_eq!(a.len(), 64);
    }
}
