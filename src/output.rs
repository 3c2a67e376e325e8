use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::Context;

/// Positional writer for the assembled download. Verified pieces land at
/// `piece_index * piece_len`; non-overlapping `write_at` calls need no
/// external locking.
#[derive(Debug)]
pub struct OutputFile {
    file: File,
    path: PathBuf,
}

impl OutputFile {
    /// Create the output file inside `dir` under the advisory name from
    /// the metainfo. Names that try to escape the directory are refused.
    pub fn create(dir: &Path, name: &str) -> anyhow::Result<Self> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            anyhow::bail!("refusing suspicious output file name {name:?}");
        }
        let path = dir.join(name);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create output file {}", path.display()))?;
        Ok(Self { file, path })
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlink the (incomplete) file from disk. The open handle stays
    /// valid until dropped, as usual on unix.
    pub fn remove(&self) -> std::io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}
