//! State-directory layout.
//!
//! Every path the daemon touches on disk is derived here, so the on-disk
//! contract lives in one place:
//!
//! ```text
//! <state_dir>/
//!   daemon.yaml           # daemon config
//!   server.crt, server.key
//!   cluster.crt, cluster.key
//!   truststore/<member>.crt
//!   database/             # owned by the replicated store
//!   recovery.tar.gz       # present only after offline recovery
//!   control.socket
//! ```

use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::errors::{Error, Result};

/// Handle to the daemon's state directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Open (creating if necessary) the state directory rooted at `root`.
    ///
    /// The root and the truststore/database subdirectories are created with
    /// mode 0700; key material written through [`StateDir::write_sensitive`]
    /// gets 0600.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [root.clone(), root.join("truststore"), root.join("database")] {
            fs::create_dir_all(&dir)?;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn daemon_config(&self) -> PathBuf {
        self.root.join("daemon.yaml")
    }

    pub fn server_cert(&self) -> PathBuf {
        self.root.join("server.crt")
    }

    pub fn server_key(&self) -> PathBuf {
        self.root.join("server.key")
    }

    pub fn cluster_cert(&self) -> PathBuf {
        self.root.join("cluster.crt")
    }

    pub fn cluster_key(&self) -> PathBuf {
        self.root.join("cluster.key")
    }

    pub fn truststore_dir(&self) -> PathBuf {
        self.root.join("truststore")
    }

    pub fn database_dir(&self) -> PathBuf {
        self.root.join("database")
    }

    /// Serialized state machine of the replicated store.
    pub fn database_state(&self) -> PathBuf {
        self.database_dir().join("state.json")
    }

    /// Raft membership view, rewritten on every membership change and read
    /// back at startup and by offline recovery.
    pub fn raft_members(&self) -> PathBuf {
        self.database_dir().join("raft_members.yaml")
    }

    pub fn recovery_tarball(&self) -> PathBuf {
        self.root.join("recovery.tar.gz")
    }

    pub fn control_socket(&self) -> PathBuf {
        self.root.join("control.socket")
    }

    /// Keypair paths for an additional named listener.
    pub fn listener_cert(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.crt", name))
    }

    pub fn listener_key(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.key", name))
    }

    /// Atomically replace `path` with `contents`.
    ///
    /// Writes a sibling temp file, fsyncs it, then renames over the target so
    /// a crash never leaves a half-written file.
    pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
        let tmp = tmp_sibling(path)?;
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(contents)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Like [`StateDir::write_atomic`] but the file is created 0600.
    pub fn write_sensitive(path: &Path, contents: &[u8]) -> Result<()> {
        let tmp = tmp_sibling(path)?;
        {
            let mut f = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&tmp)?;
            f.write_all(contents)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn tmp_sibling(path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Fatal(format!("path has no parent: {}", path.display())))?;
    let name = path
        .file_name()
        .ok_or_else(|| Error::Fatal(format!("path has no file name: {}", path.display())))?;
    let mut tmp = name.to_os_string();
    tmp.push(".tmp");
    let tmp = parent.join(tmp);
    // A stale temp file from a crashed writer must not fail create_new.
    let _ = fs::remove_file(&tmp);
    Ok(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_layout() {
        let tmp = tempdir().unwrap();
        let dir = StateDir::create(tmp.path().join("state")).unwrap();
        assert!(dir.truststore_dir().is_dir());
        assert!(dir.database_dir().is_dir());
        assert_eq!(
            dir.control_socket(),
            tmp.path().join("state").join("control.socket")
        );
    }

    #[test]
    fn root_permissions_are_private() {
        let tmp = tempdir().unwrap();
        let dir = StateDir::create(tmp.path().join("state")).unwrap();
        let mode = fs::metadata(dir.root()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn atomic_write_replaces() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("f.txt");
        StateDir::write_atomic(&path, b"one").unwrap();
        StateDir::write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!tmp.path().join("f.txt.tmp").exists());
    }

    #[test]
    fn sensitive_write_is_owner_only() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("server.key");
        StateDir::write_sensitive(&path, b"secret").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn sensitive_write_overwrites_existing() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("cluster.key");
        StateDir::write_sensitive(&path, b"old").unwrap();
        StateDir::write_sensitive(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }
}
