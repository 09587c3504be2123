// src/sys/files.rs

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};
use tokio::fs;

use crate::config::ValetConfig;
use crate::error::{ValetError, ValetResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Ownership-aware file access.
///
/// Valet usually runs under sudo, so everything it writes into the developer's
/// home has to be handed back to them; `*_as_user` variants do that.
#[derive(Clone, Debug)]
pub struct Filesystem {
    owner: Option<Owner>,
}

impl Filesystem {
    pub fn new(owner: Option<Owner>) -> Self {
        Self { owner }
    }

    pub fn for_config(config: &ValetConfig) -> Self {
        let owner = match (config.uid, config.gid) {
            (Some(uid), Some(gid)) => Some(Owner { uid, gid }),
            _ => None,
        };
        Self::new(owner)
    }

    pub async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn is_dir(&self, path: &Path) -> bool {
        fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
    }

    pub async fn is_symlink(&self, path: &Path) -> bool {
        fs::symlink_metadata(path)
            .await
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }

    pub async fn read(&self, path: &Path) -> ValetResult<String> {
        fs::read_to_string(path)
            .await
            .map_err(|e| ValetError::io(path, e))
    }

    /// Writes through a hidden sibling temp file and renames it into place, so a
    /// crash never leaves a half-written config behind. Directory scans (and
    /// nginx's `include`) skip the dotfile.
    pub async fn write(&self, path: &Path, contents: &str) -> ValetResult<()> {
        let tmp_path = temp_path(path)?;
        fs::write(&tmp_path, contents)
            .await
            .map_err(|e| ValetError::io(&tmp_path, e))?;

        if let Err(e) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ValetError::io(path, e));
        }
        Ok(())
    }

    pub async fn write_as_user(&self, path: &Path, contents: &str) -> ValetResult<()> {
        self.write(path, contents).await?;
        self.chown(path)
    }

    /// Removes a file; a file that is already gone is not an error.
    pub async fn remove(&self, path: &Path) -> ValetResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ValetError::io(path, e)),
        }
    }

    /// Creates a system directory, leaving ownership with the invoking account.
    pub async fn ensure_dir(&self, path: &Path) -> ValetResult<()> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| ValetError::io(path, e))
    }

    pub async fn ensure_dir_as_user(&self, path: &Path) -> ValetResult<()> {
        if self.is_dir(path).await {
            return Ok(());
        }
        self.ensure_dir(path).await?;
        self.chown(path)
    }

    /// Points `link` at `target`, replacing whatever `link` was before.
    pub async fn symlink_as_user(&self, target: &Path, link: &Path) -> ValetResult<()> {
        if self.is_symlink(link).await || self.exists(link).await {
            self.remove(link).await?;
        }
        fs::symlink(target, link)
            .await
            .map_err(|e| ValetError::io(link, e))?;

        if let Some(owner) = self.owner {
            std::os::unix::fs::lchown(link, Some(owner.uid), Some(owner.gid))
                .map_err(|e| ValetError::io(link, e))?;
        }
        Ok(())
    }

    pub async fn read_link(&self, path: &Path) -> ValetResult<PathBuf> {
        fs::read_link(path)
            .await
            .map_err(|e| ValetError::io(path, e))
    }

    /// Entry names of a directory, sorted. A missing directory lists as empty.
    pub async fn list_dir(&self, path: &Path) -> ValetResult<Vec<String>> {
        let mut entries = match fs::read_dir(path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ValetError::io(path, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ValetError::io(path, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn chown(&self, path: &Path) -> ValetResult<()> {
        let Some(owner) = self.owner else {
            return Ok(());
        };
        nix::unistd::chown(
            path,
            Some(Uid::from_raw(owner.uid)),
            Some(Gid::from_raw(owner.gid)),
        )
        .map_err(|e| ValetError::io(path, e.into()))
    }
}

fn temp_path(path: &Path) -> ValetResult<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| ValetError::InvalidInput(format!("{} is not a file path", path.display())))?;
    Ok(path.with_file_name(format!(".{}.tmp", name.to_string_lossy())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_replaces_contents_without_leaving_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = Filesystem::new(None);
        let path = dir.path().join("blog.test");

        files.write(&path, "first").await.unwrap();
        files.write(&path, "second").await.unwrap();

        assert_eq!(files.read(&path).await.unwrap(), "second");
        assert_eq!(files.list_dir(dir.path()).await.unwrap(), vec!["blog.test"]);
    }

    #[test]
    fn temp_file_is_a_hidden_sibling() {
        let tmp = temp_path(Path::new("/home/dev/.valet/Nginx/blog.test")).unwrap();
        assert_eq!(tmp, PathBuf::from("/home/dev/.valet/Nginx/.blog.test.tmp"));
        assert!(temp_path(Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn remove_of_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let files = Filesystem::new(None);
        assert!(files.remove(&dir.path().join("absent")).await.is_ok());
    }

    #[tokio::test]
    async fn list_dir_of_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let files = Filesystem::new(None);
        assert!(files.list_dir(&dir.path().join("nope")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn symlink_is_repointed() {
        let dir = tempfile::tempdir().unwrap();
        let files = Filesystem::new(None);
        let link = dir.path().join("valet.sock");

        files.symlink_as_user(&dir.path().join("valet74.sock"), &link).await.unwrap();
        files.symlink_as_user(&dir.path().join("valet81.sock"), &link).await.unwrap();

        assert!(files.is_symlink(&link).await);
        assert_eq!(files.read_link(&link).await.unwrap(), dir.path().join("valet81.sock"));
    }
}
