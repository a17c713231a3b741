use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;

use crate::command::Language;

const COMPLETION_MARKER: &str = ".complete";

/// Content-addressed store of prebuilt dependency trees, shared by every
/// session of a language. Entries live at
/// `<root>/<language>/<sha256(manifest)>/tree` and count as present only
/// once the completion marker exists next to the tree; the marker is written
/// last during populate, so a crash mid-copy can never be read as a hit.
/// Concurrent populates of one key race harmlessly: the same manifest
/// produces the same tree.
#[derive(Debug, Clone)]
pub struct DependencyCache {
    root: PathBuf,
}

impl DependencyCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn key(manifest: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(manifest.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Returns the path of the cached tree, or `None` when either the tree
    /// or its completion marker is missing.
    pub async fn lookup(&self, language: Language, manifest: &str) -> Option<PathBuf> {
        let entry = self.entry_dir(language, manifest);
        let tree = entry.join("tree");
        let marker = entry.join(COMPLETION_MARKER);
        let tree_ok = fs::try_exists(&tree).await.unwrap_or(false);
        let marker_ok = fs::try_exists(&marker).await.unwrap_or(false);
        (tree_ok && marker_ok).then_some(tree)
    }

    /// Copies a freshly installed tree into the cache and commits it by
    /// writing the marker after the copy has finished. Callers treat a
    /// failure as a degraded future hit rate, never as a failed run.
    pub async fn populate(
        &self,
        language: Language,
        manifest: &str,
        source_tree: &Path,
    ) -> anyhow::Result<()> {
        let entry = self.entry_dir(language, manifest);
        let tree = entry.join("tree");
        fs::create_dir_all(&tree).await?;
        copy_tree(source_tree, &tree).await?;
        fs::write(entry.join(COMPLETION_MARKER), b"ok\n").await?;
        Ok(())
    }

    fn entry_dir(&self, language: Language, manifest: &str) -> PathBuf {
        self.root.join(language.as_str()).join(Self::key(manifest))
    }
}

/// Recursive directory copy. Symlinks are not carried across the cache
/// boundary.
pub(crate) fn copy_tree<'a>(
    src: &'a Path,
    dst: &'a Path,
) -> futures::future::BoxFuture<'a, std::io::Result<()>> {
    Box::pin(async move {
        fs::create_dir_all(dst).await?;
        let mut entries = fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let kind = entry.file_type().await?;
            let target = dst.join(entry.file_name());
            if kind.is_dir() {
                copy_tree(&entry.path(), &target).await?;
            } else if kind.is_file() {
                fs::copy(entry.path(), &target).await?;
            }
        }
        Ok(())
    })
}
