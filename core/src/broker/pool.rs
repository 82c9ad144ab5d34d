use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use rand::seq::SliceRandom;

use crate::broker::{
    error::{BrokerError, BrokerErrorKind},
    types::{Credential, CredentialId, CredentialStatus, Provider},
};

type Bucket = RwLock<Vec<Arc<Credential>>>;

/// Live set of upstream credentials, one locked bucket per provider.
///
/// Writers replace whole `Arc<Credential>` values, so a reader holding the read lock sees
/// either the previous or the next version of a credential, never a mix. Callers that
/// already selected a credential keep their `Arc` after it is replaced or removed.
/// Writers are serialized by `writer`; readers only take bucket locks.
pub struct CredentialPool {
    buckets: HashMap<Provider, Bucket>,
    writer: Mutex<()>,
}

#[derive(Debug, Clone, Default)]
pub struct SelectionHint {
    pub exclude: HashSet<CredentialId>,
}

impl SelectionHint {
    pub fn excluding(credential_id: impl Into<String>) -> Self {
        let mut exclude = HashSet::new();
        exclude.insert(credential_id.into());
        Self { exclude }
    }
}

impl Default for CredentialPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialPool {
    pub fn new() -> Self {
        Self {
            buckets: Provider::ALL
                .into_iter()
                .map(|provider| (provider, RwLock::new(Vec::new())))
                .collect(),
            writer: Mutex::new(()),
        }
    }

    pub fn from_credentials(
        credentials: impl IntoIterator<Item = Credential>,
    ) -> Result<Self, BrokerError> {
        let pool = Self::new();
        for credential in credentials {
            pool.put(credential)?;
        }
        Ok(pool)
    }

    /// Insert or fully replace the credential with the same id.
    pub fn put(&self, credential: Credential) -> Result<(), BrokerError> {
        credential.check()?;

        let provider = credential.provider;
        let credential = Arc::new(credential);
        let _writer = self.lock_writer();

        for other in Provider::ALL.into_iter().filter(|p| *p != provider) {
            self.write_bucket(other)
                .retain(|existing| existing.id != credential.id);
        }

        let mut bucket = self.write_bucket(provider);
        match bucket
            .iter()
            .position(|existing| existing.id == credential.id)
        {
            Some(index) => bucket[index] = Arc::clone(&credential),
            None => bucket.push(Arc::clone(&credential)),
        }
        drop(bucket);

        tracing::info!(
            target: "broker",
            credential_id = %credential.id,
            provider = %provider,
            key_fingerprint = %credential.fingerprint(),
            status = ?credential.status,
            models = credential.models.len(),
            "credential_put"
        );
        Ok(())
    }

    pub fn remove(&self, credential_id: &str) -> Option<Arc<Credential>> {
        let _writer = self.lock_writer();
        for provider in Provider::ALL {
            let mut bucket = self.write_bucket(provider);
            if let Some(index) = bucket.iter().position(|c| c.id == credential_id) {
                let removed = bucket.remove(index);
                drop(bucket);
                tracing::info!(
                    target: "broker",
                    credential_id = %credential_id,
                    provider = %provider,
                    "credential_removed"
                );
                return Some(removed);
            }
        }
        None
    }

    pub fn get(&self, credential_id: &str) -> Option<Arc<Credential>> {
        Provider::ALL.into_iter().find_map(|provider| {
            self.read_bucket(provider)
                .iter()
                .find(|c| c.id == credential_id)
                .cloned()
        })
    }

    /// Replace only the status of an existing credential. Returns the new version, or
    /// `None` when the credential no longer exists.
    pub fn set_status(
        &self,
        credential_id: &str,
        status: CredentialStatus,
    ) -> Option<Arc<Credential>> {
        let _writer = self.lock_writer();
        let current = self.get(credential_id)?;
        self.replace_status(&current, status)
    }

    /// Like [`set_status`](Self::set_status), but only while `expected` is still the
    /// current version. Returns `None` if the credential was replaced or removed since.
    pub fn set_status_if(
        &self,
        expected: &Arc<Credential>,
        status: CredentialStatus,
    ) -> Option<Arc<Credential>> {
        let _writer = self.lock_writer();
        self.replace_status(expected, status)
    }

    fn replace_status(
        &self,
        expected: &Arc<Credential>,
        status: CredentialStatus,
    ) -> Option<Arc<Credential>> {
        let mut bucket = self.write_bucket(expected.provider);
        let slot = bucket.iter_mut().find(|c| Arc::ptr_eq(c, expected))?;
        if slot.status == status {
            return Some(Arc::clone(slot));
        }
        let updated = Arc::new((**slot).clone().with_status(status));
        *slot = Arc::clone(&updated);
        Some(updated)
    }

    pub fn select(
        &self,
        provider: Provider,
        model: &str,
        hint: &SelectionHint,
    ) -> Result<Arc<Credential>, BrokerError> {
        let bucket = self.read_bucket(provider);
        let eligible = bucket
            .iter()
            .filter(|c| c.status.is_enabled() && c.serves(model) && !hint.exclude.contains(&c.id))
            .collect::<Vec<_>>();

        eligible
            .choose(&mut rand::thread_rng())
            .map(|c| Arc::clone(c))
            .ok_or_else(|| {
                BrokerError::new(
                    BrokerErrorKind::NoEligibleCredential,
                    format!(
                        "no enabled {} credential serves model '{}'",
                        provider, model
                    ),
                )
            })
    }

    pub fn snapshot(&self, provider: Provider) -> Vec<Arc<Credential>> {
        self.read_bucket(provider).clone()
    }

    pub fn len(&self, provider: Provider) -> usize {
        self.read_bucket(provider).len()
    }

    pub fn is_empty(&self) -> bool {
        Provider::ALL
            .into_iter()
            .all(|provider| self.read_bucket(provider).is_empty())
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_bucket(&self, provider: Provider) -> RwLockReadGuard<'_, Vec<Arc<Credential>>> {
        self.buckets[&provider]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_bucket(&self, provider: Provider) -> RwLockWriteGuard<'_, Vec<Arc<Credential>>> {
        self.buckets[&provider]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
