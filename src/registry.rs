use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::{
    chain::Address,
    signer::ThresholdSigner,
    storage::{KeyStore, StorageError},
};

/// Represents an error when changing the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to persist signer for keep {keep}: {source}")]
    Persist {
        keep: Address,
        #[source]
        source: StorageError,
    },
    #[error("failed to archive signer for keep {keep}: {source}")]
    Archive {
        keep: Address,
        #[source]
        source: StorageError,
    },
    #[error("failed to list persisted signers: {0}")]
    Load(#[source] StorageError),
}

/// The signers of every keep this operator is a member of.
///
/// Changes are persisted before they become visible in memory, so a failed
/// write leaves the registry as it was.
pub struct KeepsRegistry {
    store: Arc<dyn KeyStore>,
    signers: RwLock<HashMap<Address, Vec<Arc<ThresholdSigner>>>>,
}

impl KeepsRegistry {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            signers: RwLock::new(HashMap::new()),
        }
    }

    /// Load every persisted signer, skipping the ones which can't be decoded.
    ///
    /// Returns the number of signers loaded.
    pub fn load_existing_keeps(&self) -> Result<usize, RegistryError> {
        let records = self.store.list().map_err(RegistryError::Load)?;
        let mut loaded = 0;
        let mut signers = self.signers.write();
        for record in records {
            let signer = match ThresholdSigner::from_bytes(&record.data) {
                Ok(signer) => signer,
                Err(e) => {
                    warn!(keep = %record.keep, error = %e, "skipping unreadable signer");
                    continue;
                }
            };
            if signer.keep_address() != record.keep {
                warn!(
                    keep = %record.keep,
                    found = %signer.keep_address(),
                    "skipping signer stored under the wrong keep"
                );
                continue;
            }
            signers.insert(record.keep, vec![Arc::new(signer)]);
            loaded += 1;
        }
        info!(count = loaded, "loaded existing keeps");
        Ok(loaded)
    }

    /// Persist a signer, then make it the signer of its keep.
    pub fn register_signer(
        &self,
        keep: Address,
        signer: Arc<ThresholdSigner>,
    ) -> Result<(), RegistryError> {
        let mut signers = self.signers.write();
        self.store
            .save(keep, &signer.to_bytes())
            .map_err(|source| RegistryError::Persist { keep, source })?;
        signers.insert(keep, vec![signer]);
        Ok(())
    }

    /// Archive the signers of a keep, then forget them.
    ///
    /// Unregistering an unknown keep does nothing.
    pub fn unregister_keep(&self, keep: Address) -> Result<(), RegistryError> {
        let mut signers = self.signers.write();
        if !signers.contains_key(&keep) {
            return Ok(());
        }
        self.store
            .delete(keep)
            .map_err(|source| RegistryError::Archive { keep, source })?;
        signers.remove(&keep);
        Ok(())
    }

    /// Call `f` for each keep present right now.
    ///
    /// `f` runs on a snapshot, so it may itself change the registry.
    pub fn for_each_keep(&self, mut f: impl FnMut(Address, &[Arc<ThresholdSigner>])) {
        let snapshot: Vec<(Address, Vec<Arc<ThresholdSigner>>)> = self
            .signers
            .read()
            .iter()
            .map(|(keep, signers)| (*keep, signers.clone()))
            .collect();
        for (keep, signers) in snapshot {
            f(keep, &signers);
        }
    }

    pub fn contains(&self, keep: Address) -> bool {
        self.signers.read().contains_key(&keep)
    }

    pub fn signers(&self, keep: Address) -> Vec<Arc<ThresholdSigner>> {
        self.signers.read().get(&keep).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.signers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
