use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

fn has_image_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
        })
        .unwrap_or(false)
}

/// Collect importable files under each input path.
///
/// Files named directly are taken as-is; directories are walked recursively,
/// skipping hidden entries. Output is sorted and free of repeats.
pub fn collect_import_paths(inputs: &[PathBuf], extensions: &[String]) -> Vec<PathBuf> {
    let mut found = Vec::new();

    for input in inputs {
        if input.is_file() {
            found.push(input.clone());
            continue;
        }

        let walker = WalkDir::new(input)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_hidden(e));

        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    if has_image_extension(entry.path(), extensions) {
                        found.push(entry.into_path());
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable entry"),
            }
        }
    }

    found.sort();
    found.dedup();
    found
}
