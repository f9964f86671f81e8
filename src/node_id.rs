//! Node identity: a long-term keypair persisted at `data/<namespace>/keyfile`
//! (§6), generated on first run. The public key's string form is the
//! `origin` identifier carried on every [`crate::message::RoutingEntry`]
//! this node announces (§3, §10.4), and seeds the libp2p wire manager's
//! `PeerId`.

use std::path::{Path, PathBuf};

use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, Error)]
pub enum NodeIdError {
    #[error("failed to read keyfile {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write keyfile {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("keyfile {0:?} does not hold a 32-byte key")]
    Malformed(PathBuf),
}

/// This node's long-term identity: an X25519 keypair plus its string form,
/// used both as the routing-protocol `origin` and as the seed for the
/// libp2p wire manager's identity.
pub struct NodeIdentity {
    secret: StaticSecret,
    public: PublicKey,
    id: String,
}

impl NodeIdentity {
    /// Loads the keyfile for `namespace`, generating and persisting a fresh
    /// one on first run (§10.4). Mirrors the teacher's own pattern of
    /// deriving a stable on-disk path from a namespace string.
    pub fn load_or_generate(namespace: &str) -> Result<Self, NodeIdError> {
        let path = keyfile_path(namespace);
        if let Some(secret) = try_read(&path)? {
            return Ok(Self::from_secret(secret));
        }
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let secret = StaticSecret::from(bytes);
        write_keyfile(&path, &bytes)?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        let id = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(public.as_bytes());
        Self { secret, public, id }
    }

    /// The string form of this node's public key, used as `origin` in every
    /// routing entry this node announces.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_key(&self) -> &StaticSecret {
        &self.secret
    }

    /// Derives a libp2p [`identity::Keypair`](libp2p::identity::Keypair)
    /// from the same 32-byte seed, so the `PeerId` the P2P wire manager
    /// advertises is reproducible from this node's persisted identity
    /// rather than a second, unrelated random key (§10.4).
    pub fn libp2p_keypair(&self) -> libp2p::identity::Keypair {
        let mut seed = self.secret.to_bytes();
        libp2p::identity::Keypair::ed25519_from_bytes(&mut seed)
            .expect("ed25519 keypair from a 32-byte seed always succeeds")
    }
}

fn keyfile_path(namespace: &str) -> PathBuf {
    Path::new("data").join(namespace).join("keyfile")
}

fn try_read(path: &Path) -> Result<Option<StaticSecret>, NodeIdError> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| NodeIdError::Malformed(path.to_path_buf()))?;
            Ok(Some(StaticSecret::from(arr)))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(NodeIdError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_keyfile(path: &Path, bytes: &[u8; 32]) -> Result<(), NodeIdError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| NodeIdError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, bytes).map_err(|source| NodeIdError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            let _ = std::fs::set_permissions(path, perms);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_reloads_the_same_identity() {
        let dir = tempfile_dir();
        let namespace = dir.to_str().unwrap();
        let first = NodeIdentity::load_or_generate(namespace).unwrap();
        let second = NodeIdentity::load_or_generate(namespace).unwrap();
        assert_eq!(first.id(), second.id());
        std::fs::remove_dir_all(Path::new("data").join(namespace)).ok();
    }

    fn tempfile_dir() -> PathBuf {
        PathBuf::from(format!("test-ns-{}", std::process::id()))
    }
}
