// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Discovery of solution and project roots.

use ignore::WalkBuilder;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// How deep below a root to look for project files.
pub const PROJECT_SCAN_DEPTH: usize = 4;

/// File extensions that mark a directory as a project root.
const PROJECT_EXTENSIONS: &[&str] = &["sln", "csproj", "csx"];

/// File names that mark a directory as a project root.
const PROJECT_FILES: &[&str] = &["project.json"];

/// Whether `path` names a solution, project or script file.
#[must_use]
pub fn is_project_file(path: &Path) -> bool {
    let by_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| PROJECT_EXTENSIONS.iter().any(|p| ext.eq_ignore_ascii_case(p)));
    let by_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| PROJECT_FILES.contains(&name));
    by_extension || by_name
}

/// Directories under `root` that contain a project file, sorted and without
/// duplicates. Ignore files and hidden directories are respected.
#[must_use]
pub fn discover_projects(root: &Path) -> Vec<PathBuf> {
    let walker = WalkBuilder::new(root)
        .max_depth(Some(PROJECT_SCAN_DEPTH))
        .git_ignore(true)
        .hidden(true)
        .build();

    let mut found = BTreeSet::new();
    for entry in walker.flatten() {
        let path = entry.path();
        if entry.file_type().is_some_and(|t| t.is_file())
            && is_project_file(path)
            && let Some(parent) = path.parent()
        {
            found.insert(parent.to_path_buf());
        }
    }

    debug!("Discovered {} project roots under {}", found.len(), root.display());
    found.into_iter().collect()
}

/// Project roots to hand the server: `explicit` when given, otherwise the
/// projects found under `cwd`, otherwise `cwd` itself.
#[must_use]
pub fn project_roots(explicit: &[PathBuf], cwd: &Path) -> Vec<PathBuf> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }
    let discovered = discover_projects(cwd);
    if discovered.is_empty() {
        vec![cwd.to_path_buf()]
    } else {
        discovered
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn test_is_project_file() {
        assert!(is_project_file(Path::new("/src/App.sln")));
        assert!(is_project_file(Path::new("/src/App/App.csproj")));
        assert!(is_project_file(Path::new("/src/App/App.CSPROJ")));
        assert!(is_project_file(Path::new("/src/script.csx")));
        assert!(is_project_file(Path::new("/src/web/project.json")));
        assert!(!is_project_file(Path::new("/src/App/Program.cs")));
        assert!(!is_project_file(Path::new("/src/package.json")));
    }

    #[test]
    fn test_discover_sorted_and_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("Zeta/Zeta.csproj"));
        touch(&root.join("Alpha/Alpha.csproj"));
        touch(&root.join("Alpha/Alpha.Tests.csproj"));
        touch(&root.join("App.sln"));
        touch(&root.join("Alpha/Program.cs"));

        let projects = discover_projects(root);

        assert_eq!(
            projects,
            vec![
                root.to_path_buf(),
                root.join("Alpha"),
                root.join("Zeta"),
            ]
        );
    }

    #[test]
    fn test_discover_skips_hidden_and_deep() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join(".cache/Hidden.csproj"));
        touch(&root.join("a/b/c/d/e/Deep.csproj"));

        assert!(discover_projects(root).is_empty());
    }

    #[test]
    fn test_project_roots_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        assert_eq!(project_roots(&[], root), vec![root.to_path_buf()]);

        let explicit = vec![PathBuf::from("/elsewhere")];
        assert_eq!(project_roots(&explicit, root), explicit);

        touch(&root.join("Web/Web.csproj"));
        assert_eq!(project_roots(&[], root), vec![root.join("Web")]);
    }
}
