//! In-memory gallery of canonical embeddings, backed by an [`IdentityStore`].
//!
//! Readers take an `Arc` snapshot and scan it without holding any lock.
//! Writers hold the write lock across the storage write and the snapshot
//! swap, so a reader sees either the state before a write or after it.

use crate::store::{IdentityStore, StoreError};
use crate::types::{GalleryEntry, Identity, IdentityDraft, IdentityId, IdentitySummary};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("embedding has {actual} dimensions, gallery expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding contains non-finite values")]
    NonFiniteEmbedding,
    #[error("display name must not be empty")]
    EmptyName,
    #[error("no identity named {0:?}")]
    NameNotFound(String),
    #[error("no identity with id {0}")]
    IdNotFound(IdentityId),
    #[error("gallery lock poisoned")]
    Poisoned,
    #[error("storage: {0}")]
    Store(#[from] StoreError),
}

impl GalleryError {
    /// Validation failures reject a single `add` and leave the gallery untouched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            GalleryError::DimensionMismatch { .. }
                | GalleryError::NonFiniteEmbedding
                | GalleryError::EmptyName
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GalleryError::NameNotFound(_) | GalleryError::IdNotFound(_))
    }
}

pub struct EmbeddingGallery {
    store: Arc<dyn IdentityStore>,
    dimension: usize,
    snapshot: RwLock<Arc<[GalleryEntry]>>,
}

impl EmbeddingGallery {
    /// Load every stored embedding. Entries whose dimension differs from
    /// `dimension` are left out of the snapshot and logged; they stay in
    /// storage until removed.
    pub fn load(store: Arc<dyn IdentityStore>, dimension: usize) -> Result<Self, GalleryError> {
        let entries: Vec<GalleryEntry> = store
            .embeddings()?
            .into_iter()
            .filter(|entry| {
                let ok = entry.embedding.dim() == dimension;
                if !ok {
                    tracing::warn!(
                        id = %entry.id,
                        name = %entry.name,
                        expected = dimension,
                        actual = entry.embedding.dim(),
                        "ignoring stored embedding with wrong dimension"
                    );
                }
                ok
            })
            .collect();

        tracing::info!(identities = entries.len(), dimension, "gallery loaded");

        Ok(Self {
            store,
            dimension,
            snapshot: RwLock::new(entries.into()),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Validate and persist a new identity, then publish it to readers.
    pub fn add(&self, draft: IdentityDraft) -> Result<IdentityId, GalleryError> {
        if draft.name.trim().is_empty() {
            return Err(GalleryError::EmptyName);
        }
        if draft.embedding.dim() != self.dimension {
            return Err(GalleryError::DimensionMismatch {
                expected: self.dimension,
                actual: draft.embedding.dim(),
            });
        }
        if !draft.embedding.is_finite() {
            return Err(GalleryError::NonFiniteEmbedding);
        }

        let mut snapshot = self.snapshot.write().map_err(|_| GalleryError::Poisoned)?;
        let id = self.store.insert(&draft)?;

        let mut entries = snapshot.to_vec();
        entries.push(GalleryEntry {
            id,
            name: draft.name.clone(),
            embedding: draft.embedding,
        });
        *snapshot = entries.into();

        tracing::info!(id = %id, name = %draft.name, "identity enrolled");
        Ok(id)
    }

    /// Current snapshot of every enrolled `(id, name, embedding)`.
    pub fn all(&self) -> Arc<[GalleryEntry]> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full record, read fresh from storage.
    pub fn lookup(&self, id: IdentityId) -> Result<Identity, GalleryError> {
        self.store.fetch(id)?.ok_or(GalleryError::IdNotFound(id))
    }

    /// Listing of every identity with its visit state.
    pub fn summaries(&self) -> Result<Vec<IdentitySummary>, GalleryError> {
        Ok(self.store.summaries()?)
    }

    /// Remove every identity carrying this display name.
    pub fn remove(&self, name: &str) -> Result<Vec<IdentityId>, GalleryError> {
        let mut snapshot = self.snapshot.write().map_err(|_| GalleryError::Poisoned)?;
        let removed = self.store.delete_by_name(name)?;
        if removed.is_empty() {
            return Err(GalleryError::NameNotFound(name.to_string()));
        }

        let entries: Vec<GalleryEntry> = snapshot
            .iter()
            .filter(|entry| !removed.contains(&entry.id))
            .cloned()
            .collect();
        *snapshot = entries.into();

        tracing::info!(name, removed = removed.len(), "identity removed");
        Ok(removed)
    }
}
