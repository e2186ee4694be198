//! Known hosts management for SSH host key verification
//!
//! Entries follow the OpenSSH layout: `[host]:port keytype base64key`, or a
//! bare host when the port is 22. New entries are only ever appended.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// Host not in known_hosts (first connection)
    Unknown { fingerprint: String },
    /// Key changed from known_hosts entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// How unknown hosts are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Unknown hosts are rejected. Used for every regular connection.
    Strict,
    /// Unknown hosts are appended to the store and accepted (trust grab).
    Lenient,
    /// No verification at all
    Insecure,
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

pub struct KnownHostsStore {
    /// host pattern -> keys (supports multiple key types per host)
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// Open the store at `path`, creating an empty file if it does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SshError> {
        let path = path.into();
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };

        if let Err(e) = store.load() {
            debug!("Known hosts file {:?} not readable ({}), creating it", store.path, e);
            store.create_empty()?;
            store.load()?;
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create_empty(&self) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(())
    }

    /// Load known_hosts file
    fn load(&self) -> Result<(), SshError> {
        let file = fs::File::open(&self.path)?;

        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        hosts.clear();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                debug!("Skipping malformed known_hosts line: {}", line);
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // hashed hostnames (|1|...) are not supported
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(hostname.to_lowercase())
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        debug!(
            "Loaded {} known host entries ({} unique hosts) from {:?}",
            entry_count,
            hosts.len(),
            self.path
        );
        Ok(())
    }

    /// Create lookup key for host:port
    pub fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        fingerprint_bytes(&key.public_key_bytes())
    }

    /// Verify a host's public key
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();
        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        if entries
            .iter()
            .any(|e| e.key_type == actual_key_type && e.key_data == actual_key_b64)
        {
            debug!(
                "Host key verified for {} (type: {})",
                lookup_key, actual_key_type
            );
            return HostKeyVerification::Verified;
        }

        // A stored key of the same type is the most useful one to report
        let expected = entries
            .iter()
            .find(|e| e.key_type == actual_key_type)
            .or_else(|| entries.first());
        let expected_fingerprint = expected
            .map(|e| compute_fingerprint_from_b64(&e.key_data))
            .unwrap_or_else(|| "unknown".to_string());

        warn!(
            "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
            lookup_key, actual_key_type, expected_fingerprint, fingerprint
        );
        HostKeyVerification::Changed {
            expected_fingerprint,
            actual_fingerprint: fingerprint,
        }
    }

    /// Add a new host key to known_hosts
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        let key_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().as_str().to_string();

        self.append_to_file(&lookup_key, &key_type, &key_b64)?;

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key_type.clone(),
                key_data: key_b64,
            });

        info!(
            "Added host key for {} (type: {}) to {:?}",
            lookup_key, key_type, self.path
        );
        Ok(())
    }

    fn append_to_file(&self, host: &str, key_type: &str, key_b64: &str) -> Result<(), SshError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        // single write so concurrent readers never see a partial line
        let line = format!("{} {} {}\n", host, key_type, key_b64);
        file.write_all(line.as_bytes())?;

        Ok(())
    }
}

/// Applies a [`HostKeyPolicy`] against the known_hosts file at `path`
#[derive(Debug, Clone)]
pub struct HostKeyVerifier {
    policy: HostKeyPolicy,
    path: PathBuf,
}

impl HostKeyVerifier {
    pub fn new(policy: HostKeyPolicy, path: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            path: path.into(),
        }
    }

    pub fn policy(&self) -> HostKeyPolicy {
        self.policy
    }

    pub fn with_policy(&self, policy: HostKeyPolicy) -> Self {
        Self {
            policy,
            path: self.path.clone(),
        }
    }

    /// Accept or reject the key presented by `host:port`
    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        if self.policy == HostKeyPolicy::Insecure {
            debug!("Skipping host key verification for {}:{}", host, port);
            return Ok(());
        }

        // reopened on every check so entries added by other processes are seen
        let store = KnownHostsStore::open(&self.path)?;
        match store.verify(host, port, key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", host, port);
                Ok(())
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => Err(SshError::HostKeyChanged {
                host: KnownHostsStore::make_key(host, port),
                expected: expected_fingerprint,
                actual: actual_fingerprint,
            }),
            HostKeyVerification::Unknown { fingerprint } => match self.policy {
                HostKeyPolicy::Lenient => {
                    info!(
                        "Trusting new host {}:{} (fingerprint: {})",
                        host, port, fingerprint
                    );
                    store.add_host(host, port, key)
                }
                _ => {
                    warn!(
                        "Unknown host key for {}:{} (fingerprint: {}), rejecting",
                        host, port, fingerprint
                    );
                    Err(SshError::HostKeyUnknown {
                        host: KnownHostsStore::make_key(host, port),
                        fingerprint,
                    })
                }
            },
        }
    }
}

fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Compute fingerprint from stored base64 key
fn compute_fingerprint_from_b64(stored_b64: &str) -> String {
    match BASE64.decode(stored_b64) {
        Ok(bytes) => fingerprint_bytes(&bytes),
        Err(_) => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::Algorithm;
    use russh::keys::PrivateKey;
    use tempfile::tempdir;

    fn random_key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    #[test]
    fn test_make_key() {
        assert_eq!(KnownHostsStore::make_key("github.com", 22), "github.com");
        assert_eq!(
            KnownHostsStore::make_key("Server.com", 2222),
            "[server.com]:2222"
        );
        assert_eq!(KnownHostsStore::make_key("10.0.0.1", 22), "10.0.0.1");
    }

    #[test]
    fn test_missing_file_is_created() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("known_hosts");
        let store = KnownHostsStore::open(&path).unwrap();
        assert!(path.exists());
        assert!(matches!(
            store.verify("example.com", 22, &random_key()),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[test]
    fn test_add_then_verify() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        let key = random_key();

        let store = KnownHostsStore::open(&path).unwrap();
        store.add_host("127.0.0.1", 2222, &key).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("[127.0.0.1]:2222 ssh-ed25519 "));

        // fresh store reads the appended line back
        let store = KnownHostsStore::open(&path).unwrap();
        assert_eq!(
            store.verify("127.0.0.1", 2222, &key),
            HostKeyVerification::Verified
        );
        // same host on another port is a different entry
        assert!(matches!(
            store.verify("127.0.0.1", 22, &key),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[test]
    fn test_changed_key() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        let store = KnownHostsStore::open(&path).unwrap();
        let stored = random_key();
        store.add_host("example.com", 22, &stored).unwrap();

        match store.verify("example.com", 22, &random_key()) {
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                assert_eq!(expected_fingerprint, KnownHostsStore::fingerprint(&stored));
                assert_ne!(expected_fingerprint, actual_fingerprint);
            }
            other => panic!("expected Changed, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        let key = random_key();
        let line = format!(
            "# comment\ngarbage\n\nalias,example.com {} {}\n",
            key.algorithm().as_str(),
            BASE64.encode(key.public_key_bytes())
        );
        fs::write(&path, line).unwrap();

        let store = KnownHostsStore::open(&path).unwrap();
        assert_eq!(
            store.verify("example.com", 22, &key),
            HostKeyVerification::Verified
        );
        assert_eq!(store.verify("ALIAS", 22, &key), HostKeyVerification::Verified);
    }

    #[test]
    fn test_verifier_policies() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        let key = random_key();

        let insecure = HostKeyVerifier::new(HostKeyPolicy::Insecure, &path);
        assert!(insecure.check("h", 2200, &key).is_ok());
        assert!(!path.exists());

        let strict = HostKeyVerifier::new(HostKeyPolicy::Strict, &path);
        assert!(matches!(
            strict.check("h", 2200, &key),
            Err(SshError::HostKeyUnknown { .. })
        ));

        let lenient = strict.with_policy(HostKeyPolicy::Lenient);
        lenient.check("h", 2200, &key).unwrap();
        // now trusted even in strict mode
        strict.check("h", 2200, &key).unwrap();

        // a different key is never auto-trusted, not even in lenient mode
        let other = random_key();
        assert!(matches!(
            lenient.check("h", 2200, &other),
            Err(SshError::HostKeyChanged { .. })
        ));
        assert!(matches!(
            strict.check("h", 2200, &other),
            Err(SshError::HostKeyChanged { .. })
        ));
    }
}
