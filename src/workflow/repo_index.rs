//! Repository file index

use ignore::WalkBuilder;
use std::path::Path;

/// Walk `root` honouring .gitignore and hidden-file rules, listing files
///
/// `extensions` filters by extension (no dot); empty keeps everything.
pub fn build_repo_index(
    root: &Path,
    label: &str,
    extensions: &[String],
    max_files: usize,
) -> Result<String, ignore::Error> {
    let mut files = Vec::new();
    for entry in WalkBuilder::new(root).require_git(false).build() {
        let entry = entry?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        if !extensions.is_empty() {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
                continue;
            }
        }
        let relative = path.strip_prefix(root).unwrap_or(path);
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        files.push((relative.display().to_string(), size));
    }
    files.sort();

    let total = files.len();
    files.truncate(max_files);

    let mut out = format!("# Repository index: {}\n# {} files", label, total);
    if total > max_files {
        out.push_str(&format!(" (showing first {})", max_files));
    }
    out.push_str("\n\n");
    for (path, size) in files {
        out.push_str(&format!("{} ({} bytes)\n", path, size));
    }
    Ok(out)
}
