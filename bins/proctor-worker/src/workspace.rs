//! Per-job scratch directories.
//!
//! Every job gets a fresh `proctor-*` directory under the scratch root holding
//! the submitted files plus any scaffold the toolchain needs. The directory is
//! removed when the [`Workspace`] drops; [`sweep_orphans`] clears whatever a
//! crashed worker left behind.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::ExecError;

pub const WORKSPACE_PREFIX: &str = "proctor-";

#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    submitted: Vec<String>,
    _tempdir: TempDir,
}

impl Workspace {
    /// Write `files` into a new directory under `scratch_root`.
    ///
    /// All names are validated before anything touches the disk.
    pub fn materialize(scratch_root: &Path, files: &BTreeMap<String, String>) -> Result<Self, ExecError> {
        for name in files.keys() {
            validate_filename(name)?;
        }

        fs::create_dir_all(scratch_root)?;
        let tempdir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(scratch_root)?;

        let workspace = Self {
            root: tempdir.path().to_path_buf(),
            submitted: files.keys().cloned().collect(),
            _tempdir: tempdir,
        };
        for (name, content) in files {
            workspace.write(name, content)?;
        }

        debug!(root = %workspace.root.display(), files = files.len(), "Workspace materialized");
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of the files the job submitted, sorted. Scaffold files are excluded.
    pub fn submitted(&self) -> &[String] {
        &self.submitted
    }

    pub fn submitted_with_extension(&self, extension: &str) -> Vec<String> {
        self.submitted
            .iter()
            .filter(|name| Path::new(name).extension().is_some_and(|ext| ext == extension))
            .cloned()
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.root.join(name).exists()
    }

    /// Write a scaffold file unless the submission already provides one.
    /// Returns whether the file was written.
    pub fn inject_if_absent(&self, name: &str, content: &str) -> io::Result<bool> {
        if self.contains(name) {
            return Ok(false);
        }
        self.write(name, content)?;
        Ok(true)
    }

    pub fn read(&self, name: &str) -> io::Result<String> {
        fs::read_to_string(self.root.join(name))
    }

    /// Current contents of every submitted file.
    pub fn read_submitted(&self) -> io::Result<BTreeMap<String, String>> {
        self.submitted
            .iter()
            .map(|name| Ok((name.clone(), self.read(name)?)))
            .collect()
    }

    fn write(&self, name: &str, content: &str) -> io::Result<()> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)
    }
}

/// Reject names that could escape the workspace.
pub fn validate_filename(name: &str) -> Result<(), ExecError> {
    if name.trim().is_empty() {
        return Err(ExecError::InvalidSubmission("empty file name".to_string()));
    }
    for component in Path::new(name).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(ExecError::InvalidSubmission(format!("file name {:?} escapes the workspace", name)));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ExecError::InvalidSubmission(format!("file name {:?} is absolute", name)));
            }
        }
    }
    Ok(())
}

/// Remove `proctor-*` directories left under `scratch_root` by a previous run.
/// Only call before the pool starts; live workspaces share the prefix.
pub fn sweep_orphans(scratch_root: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(scratch_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let is_orphan = entry.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX)
            && entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_orphan {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove orphaned workspace"),
        }
    }

    if removed > 0 {
        info!(removed, root = %scratch_root.display(), "Swept orphaned workspaces");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_materialize_writes_nested_files() {
        let scratch = tempfile::tempdir().unwrap();
        let ws = Workspace::materialize(
            scratch.path(),
            &files(&[("main.go", "package main\n"), ("pkg/util.go", "package pkg\n")]),
        )
        .unwrap();

        assert!(ws.root().starts_with(scratch.path()));
        assert_eq!(ws.read("pkg/util.go").unwrap(), "package pkg\n");
        assert_eq!(ws.submitted(), ["main.go", "pkg/util.go"]);
        assert_eq!(ws.submitted_with_extension("go").len(), 2);
        assert!(ws.submitted_with_extension("py").is_empty());
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let scratch = tempfile::tempdir().unwrap();
        let ws = Workspace::materialize(scratch.path(), &files(&[("a.py", "x = 1\n")])).unwrap();
        let root = ws.root().to_path_buf();
        assert!(root.exists());
        drop(ws);
        assert!(!root.exists());
    }

    #[test]
    fn test_inject_if_absent_keeps_submitted_file() {
        let scratch = tempfile::tempdir().unwrap();
        let ws = Workspace::materialize(scratch.path(), &files(&[("go.mod", "module mine\n")])).unwrap();

        assert!(!ws.inject_if_absent("go.mod", "module submission\n").unwrap());
        assert_eq!(ws.read("go.mod").unwrap(), "module mine\n");

        assert!(ws.inject_if_absent("extra.txt", "hi").unwrap());
        assert!(ws.contains("extra.txt"));
        // Scaffold files are not part of the submission.
        assert_eq!(ws.read_submitted().unwrap(), files(&[("go.mod", "module mine\n")]));
    }

    #[test]
    fn test_rejects_escaping_names() {
        let scratch = tempfile::tempdir().unwrap();
        for bad in ["../evil.py", "/etc/passwd", "", "  ", "a/../../b.py"] {
            let err = Workspace::materialize(scratch.path(), &files(&[(bad, "")])).unwrap_err();
            assert!(matches!(err, ExecError::InvalidSubmission(_)), "accepted {:?}", bad);
        }
        // Nothing was created for rejected submissions.
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_sweep_orphans_only_touches_prefixed_dirs() {
        let scratch = tempfile::tempdir().unwrap();
        fs::create_dir(scratch.path().join("proctor-old1")).unwrap();
        fs::create_dir(scratch.path().join("proctor-old2")).unwrap();
        fs::create_dir(scratch.path().join("keep-me")).unwrap();
        fs::write(scratch.path().join("proctor-file"), "").unwrap();

        assert_eq!(sweep_orphans(scratch.path()).unwrap(), 2);
        assert!(scratch.path().join("keep-me").exists());
        assert!(scratch.path().join("proctor-file").exists());

        assert_eq!(sweep_orphans(&scratch.path().join("missing")).unwrap(), 0);
    }
}
