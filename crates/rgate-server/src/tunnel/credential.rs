//! Credential references for SSH tunnels.
//!
//! Tunnels and sessions only ever carry a credential *id*; the secret itself
//! stays in the [`CredentialStore`] loaded from config.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// How a credential authenticates.
#[derive(Clone)]
pub enum CredentialSecret {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for CredentialSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSecret::Password(_) => f.write_str("Password(<redacted>)"),
            CredentialSecret::KeyFile { path, .. } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .finish_non_exhaustive(),
        }
    }
}

/// A named SSH login.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub username: String,
    pub secret: CredentialSecret,
}

/// Credentials indexed by id.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    entries: HashMap<String, Credential>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, credential: Credential) {
        self.entries.insert(credential.id.clone(), credential);
    }

    pub fn get(&self, id: &str) -> Option<&Credential> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_passwords() {
        let cred = Credential {
            id: "bastion".into(),
            username: "ops".into(),
            secret: CredentialSecret::Password("hunter2".into()),
        };
        let shown = format!("{cred:?}");
        assert!(shown.contains("bastion"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn store_lookup() {
        let mut store = CredentialStore::new();
        assert!(store.is_empty());
        store.insert(Credential {
            id: "a".into(),
            username: "root".into(),
            secret: CredentialSecret::KeyFile {
                path: "/tmp/id_ed25519".into(),
                passphrase: None,
            },
        });
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").map(|c| c.username.as_str()), Some("root"));
        assert!(store.get("b").is_none());
    }
}
