//! Object-store backed model artifact store.
//!
//! Each model owns two objects under `artifacts/{model_id}/`: the encoded
//! classifier (`model`) and a pretty JSON copy of its metadata (`metadata`).
//! An update writes its objects under `staged/` first; the staged metadata is
//! written last and marks the staging as complete.

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path as ObjectStorePath;
use object_store::{ObjectStore, ObjectStoreExt};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::models::ModelMetadata;

/// Top-level namespace of all artifacts.
pub const NAMESPACE: &str = "artifacts";

const MODEL_OBJECT: &str = "model";
const METADATA_OBJECT: &str = "metadata";
const STAGING: &str = "staged";

/// Artifact store over any [`ObjectStore`] backend.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    store: Arc<dyn ObjectStore>,
}

impl ArtifactStore {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn prefix(model_id: &str) -> ObjectStorePath {
        ObjectStorePath::from(format!("{NAMESPACE}/{model_id}"))
    }

    fn model_path(model_id: &str) -> ObjectStorePath {
        Self::prefix(model_id).child(MODEL_OBJECT)
    }

    fn metadata_path(model_id: &str) -> ObjectStorePath {
        Self::prefix(model_id).child(METADATA_OBJECT)
    }

    fn staging_prefix(model_id: &str) -> ObjectStorePath {
        Self::prefix(model_id).child(STAGING)
    }

    /// Writes the classifier blob and metadata, replacing any prior objects.
    ///
    /// Returns the key of the blob.
    ///
    /// # Errors
    ///
    /// Returns an error if either write fails.
    pub async fn upload(
        &self,
        model_id: &str,
        blob: Bytes,
        metadata: &ModelMetadata,
    ) -> Result<String> {
        let key = self.put_model(model_id, blob).await?;
        self.put_metadata(model_id, metadata).await?;
        info!(model_id, key = %key, "Uploaded model artifact");
        Ok(key)
    }

    /// Writes the classifier blob alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn put_model(&self, model_id: &str, blob: Bytes) -> Result<String> {
        let path = Self::model_path(model_id);
        let size = blob.len();
        self.store.put(&path, blob.into()).await?;
        debug!(model_id, size, "Stored model blob");
        Ok(path.to_string())
    }

    /// Replaces the metadata copy.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    pub async fn put_metadata(&self, model_id: &str, metadata: &ModelMetadata) -> Result<()> {
        let body = serde_json::to_vec_pretty(metadata)?;
        self.store
            .put(&Self::metadata_path(model_id), Bytes::from(body).into())
            .await?;
        Ok(())
    }

    /// Reads the classifier blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails for a reason other than a
    /// missing object.
    pub async fn download(&self, model_id: &str) -> Result<Option<Bytes>> {
        self.read(&Self::model_path(model_id)).await
    }

    /// Reads the metadata copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the stored JSON is invalid.
    pub async fn get_metadata(&self, model_id: &str) -> Result<Option<ModelMetadata>> {
        match self.read(&Self::metadata_path(model_id)).await? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }

    /// Replaces the blob and/or merges a metadata patch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no metadata exists for the id, or
    /// [`StoreError::Schema`] if the patch does not fit the metadata.
    pub async fn update(
        &self,
        model_id: &str,
        blob: Option<Bytes>,
        patch: Option<&Map<String, Value>>,
    ) -> Result<String> {
        let current = self
            .get_metadata(model_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(model_id.to_string()))?;

        let merged = match patch {
            Some(patch) => Some(current.merged(patch)?),
            None => None,
        };

        let key = match blob {
            Some(blob) => self.put_model(model_id, blob).await?,
            None => Self::model_path(model_id).to_string(),
        };
        if let Some(metadata) = merged {
            self.put_metadata(model_id, &metadata).await?;
        }

        debug!(model_id, "Updated model artifact");
        Ok(key)
    }

    /// Writes the objects of a pending update to the staging area.
    ///
    /// The blob is written first and the metadata last, so a staging with
    /// metadata is complete.
    ///
    /// # Errors
    ///
    /// Returns an error if either write fails.
    pub async fn stage(&self, model_id: &str, blob: Option<Bytes>, metadata: &ModelMetadata) -> Result<()> {
        let staging = Self::staging_prefix(model_id);
        if let Some(blob) = blob {
            self.store.put(&staging.child(MODEL_OBJECT), blob.into()).await?;
        }
        let body = serde_json::to_vec_pretty(metadata)?;
        self.store
            .put(&staging.child(METADATA_OBJECT), Bytes::from(body).into())
            .await?;
        debug!(model_id, "Staged model artifact");
        Ok(())
    }

    /// Returns true when a complete staging exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails for a reason other than a
    /// missing object.
    pub async fn is_staged(&self, model_id: &str) -> Result<bool> {
        let marker = Self::staging_prefix(model_id).child(METADATA_OBJECT);
        match self.store.head(&marker).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Copies a complete staging over the live objects.
    ///
    /// The staging is left in place; remove it with
    /// [`ArtifactStore::discard_staged`] once the record is committed.
    /// Promoting twice is harmless. Returns the key of the blob.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no complete staging exists.
    pub async fn promote(&self, model_id: &str) -> Result<String> {
        if !self.is_staged(model_id).await? {
            return Err(StoreError::NotFound(model_id.to_string()));
        }

        let staging = Self::staging_prefix(model_id);
        let model = Self::model_path(model_id);
        match self.store.copy(&staging.child(MODEL_OBJECT), &model).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(error) => return Err(error.into()),
        }
        self.store
            .copy(&staging.child(METADATA_OBJECT), &Self::metadata_path(model_id))
            .await?;

        info!(model_id, key = %model, "Promoted staged model artifact");
        Ok(model.to_string())
    }

    /// Removes whatever is staged. Returns false if nothing was.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing or a delete fails.
    pub async fn discard_staged(&self, model_id: &str) -> Result<bool> {
        let staging = Self::staging_prefix(model_id);
        let objects: Vec<_> = self.store.list(Some(&staging)).try_collect().await?;
        for object in &objects {
            match self.store.delete(&object.location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(!objects.is_empty())
    }

    /// Removes every object under the model's prefix.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if nothing is stored for the id.
    pub async fn delete(&self, model_id: &str) -> Result<bool> {
        let prefix = Self::prefix(model_id);
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        if objects.is_empty() {
            return Err(StoreError::NotFound(model_id.to_string()));
        }

        for object in &objects {
            match self.store.delete(&object.location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(error) => return Err(error.into()),
            }
        }

        info!(model_id, objects = objects.len(), "Deleted model artifact");
        Ok(true)
    }

    /// Lists the ids that have at least one stored object.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    pub async fn list(&self) -> Result<Vec<String>> {
        let namespace = ObjectStorePath::from(NAMESPACE);
        let listing = self.store.list_with_delimiter(Some(&namespace)).await?;
        let mut ids: Vec<String> = listing
            .common_prefixes
            .iter()
            .filter_map(|prefix| prefix.filename().map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Returns true when the classifier blob exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails for a reason other than a
    /// missing object.
    pub async fn exists(&self, model_id: &str) -> Result<bool> {
        match self.store.head(&Self::model_path(model_id)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Checks that the backend answers a listing.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable.
    pub async fn health_check(&self) -> Result<()> {
        let namespace = ObjectStorePath::from(NAMESPACE);
        self.store.list_with_delimiter(Some(&namespace)).await?;
        Ok(())
    }

    async fn read(&self, path: &ObjectStorePath) -> Result<Option<Bytes>> {
        match self.store.get(path).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}
