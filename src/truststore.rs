//! File-backed peer truststore.
//!
//! One `truststore/<member>.crt` per trusted member. The file is a normal
//! PEM certificate preceded by comment lines carrying the entry's name and
//! address, so a single file round-trips the whole `(name, address,
//! certificate)` triple and stays readable by standard PEM tooling.
//!
//! The truststore is a projection of the replicated member table — the
//! leader rewrites it on every heartbeat and the only write path is
//! [`Truststore::replace_all`]. Entries are never merged or added locally.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use rustls::pki_types::CertificateDer;
use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::state_dir::StateDir;
use crate::tls;

/// A single trusted peer.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustEntry {
    pub name: String,
    pub address: String,
    pub certificate: String,
}

impl TrustEntry {
    fn to_file(&self) -> String {
        format!(
            "# microcluster truststore entry\n# name: {}\n# address: {}\n{}",
            self.name, self.address, self.certificate
        )
    }

    fn from_file(name: &str, raw: &str) -> Result<Self> {
        let address = raw
            .lines()
            .find_map(|l| l.strip_prefix("# address: "))
            .unwrap_or_default()
            .trim()
            .to_string();
        let begin = raw
            .find("-----BEGIN")
            .ok_or_else(|| Error::Fatal(format!("truststore entry {} has no certificate", name)))?;
        Ok(Self {
            name: name.to_string(),
            address,
            certificate: raw[begin..].to_string(),
        })
    }
}

/// In-memory truststore backed by a directory of PEM files.
#[derive(Debug)]
pub struct Truststore {
    dir: PathBuf,
    entries: RwLock<BTreeMap<String, TrustEntry>>,
}

impl Truststore {
    /// Load every entry under the state directory's truststore dir.
    ///
    /// Unparseable files are skipped with a warning rather than failing the
    /// whole load; the next heartbeat rewrite repairs them.
    pub fn load(dir: &StateDir) -> Result<Self> {
        let dir = dir.truststore_dir();
        let mut entries = BTreeMap::new();
        for item in fs::read_dir(&dir)? {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("crt") {
                continue;
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            let raw = fs::read_to_string(&path)?;
            match TrustEntry::from_file(&name, &raw) {
                Ok(entry) => {
                    entries.insert(name, entry);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping unreadable truststore entry");
                }
            }
        }
        Ok(Self {
            dir,
            entries: RwLock::new(entries),
        })
    }

    /// Replace the entire truststore, on disk and in memory.
    ///
    /// Each entry is written to a temp file, fsynced, and renamed into place;
    /// files for members no longer present are deleted afterwards. Readers
    /// never observe a partial mix of old and new entries in memory because
    /// the map is swapped under the write lock in one step.
    pub fn replace_all(&self, new_entries: Vec<TrustEntry>) -> Result<()> {
        let mut map = BTreeMap::new();
        for entry in new_entries {
            // Validate before persisting; a bad certificate must not land on disk.
            tls::certs_from_pem(&entry.certificate)?;
            map.insert(entry.name.clone(), entry);
        }

        let mut guard = self
            .entries
            .write()
            .map_err(|_| Error::Fatal("truststore lock poisoned".into()))?;

        for entry in map.values() {
            let path = self.dir.join(format!("{}.crt", entry.name));
            StateDir::write_atomic(&path, entry.to_file().as_bytes())?;
        }
        for item in fs::read_dir(&self.dir)? {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("crt") {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if !map.contains_key(stem) {
                debug!(member = %stem, "Pruning obsolete truststore entry");
                fs::remove_file(&path)?;
            }
        }

        *guard = map;
        Ok(())
    }

    /// All current entries, sorted by member name.
    pub fn entries(&self) -> Vec<TrustEntry> {
        self.entries
            .read()
            .map(|g| g.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<TrustEntry> {
        self.entries.read().ok()?.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The DER certificate set, used as the peer client's trust anchors.
    pub fn trusted_certs(&self) -> Vec<CertificateDer<'static>> {
        let mut certs = Vec::new();
        for entry in self.entries() {
            if let Ok(mut parsed) = tls::certs_from_pem(&entry.certificate) {
                certs.append(&mut parsed);
            }
        }
        certs
    }

    /// Authenticate an inbound peer certificate.
    ///
    /// The certificate's DNS SAN names the member; the presented DER must
    /// byte-match the stored entry for that name.
    pub fn authenticate(&self, der: &[u8]) -> Result<String> {
        let name = tls::dns_san(der)?
            .ok_or_else(|| Error::Untrusted("peer certificate has no DNS SAN".into()))?;
        let entry = self
            .get(&name)
            .ok_or_else(|| Error::Untrusted(format!("no truststore entry for {:?}", name)))?;
        let stored = tls::certs_from_pem(&entry.certificate)?;
        if stored.iter().any(|c| c.as_ref() == der) {
            Ok(name)
        } else {
            Err(Error::Untrusted(format!(
                "certificate mismatch for {:?}",
                name
            )))
        }
    }
}
