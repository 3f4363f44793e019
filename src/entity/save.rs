//! Network operations on a single entity.

use super::Entity;
use crate::cache::PendingDelivery;
use crate::codec::{self, PointerEncoder, PointerEncoding};
use crate::core::{Result, SyncError, Value, codes};
use crate::deep_save::deep_save;
use crate::ops::OperationSet;
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tracing::{Instrument, Level, event, info_span};

impl Entity {
    /// Saves this entity and every dirty entity or file it references.
    pub async fn save(&self) -> Result<()> {
        deep_save(self.client().clone(), Value::Entity(self.clone())).await
    }

    /// Replaces the confirmed state with the server's copy. Pending edits
    /// stay applied on top.
    pub async fn fetch(&self) -> Result<()> {
        let entity = self.clone();
        let span = info_span!("sync.fetch", class = %self.inner.class_name);
        self.task_queue()
            .enqueue(move |prior| async move {
                prior.await;
                let class_name = entity.class_name();
                let object_id = entity.object_id().ok_or_else(|| {
                    SyncError::server(
                        codes::MISSING_OBJECT_ID,
                        format!("Cannot fetch an unsaved '{}'", class_name),
                    )
                })?;
                let client = entity.client().clone();
                let document = client
                    .transport
                    .execute(&codec::fetch_command(&class_name, &object_id))
                    .await?;
                let state = client
                    .codec
                    .decode_state(&document, &class_name, true, &client.factory())?;
                entity.merge_from_server(state);
                event!(Level::DEBUG, %object_id, "entity fetched");
                entity.mirror_persist().await;
                Ok(())
            })
            .instrument(span)
            .await
    }

    pub async fn fetch_if_needed(&self) -> Result<()> {
        if self.is_data_available() {
            return Ok(());
        }
        self.fetch().await
    }

    /// Deletes the entity on the server. An entity that was never saved has
    /// nothing to delete and succeeds immediately.
    pub async fn delete(&self) -> Result<()> {
        self.begin_delete();
        let entity = self.clone();
        let span = info_span!("sync.delete", class = %self.inner.class_name);
        self.task_queue()
            .enqueue(move |prior| async move {
                prior.await;
                if entity.object_id().is_none() {
                    entity.handle_delete_result(false);
                    return Ok(());
                }
                let result = match codec::delete_command(&entity, PointerEncoding::ObjectIdOnly) {
                    Ok(command) => entity
                        .client()
                        .transport
                        .execute(&command)
                        .await
                        .map(|_| ()),
                    Err(err) => Err(err),
                };
                entity.handle_delete_result(result.is_ok());
                if result.is_ok() {
                    entity.mirror_delete().await;
                }
                result
            })
            .instrument(span)
            .await
    }

    /// Hands the current edits to the durable command cache.
    ///
    /// Resolves once the command is on disk. The returned [`PendingDelivery`]
    /// completes when the server has answered, as long as this process is
    /// still running; after a restart the command is still delivered but
    /// nobody observes the outcome.
    pub async fn save_later(&self) -> Result<PendingDelivery<()>> {
        let client = self.client().clone();
        let operations = self.start_save_later();

        let mut pointers = PointerEncoder::new(PointerEncoding::AllowLocalId);
        let queued = match codec::save_command(client.codec.as_ref(), self, &operations, &mut pointers) {
            Ok(command) => client.cache.enqueue(command).await,
            Err(err) => Err(err),
        };
        let delivery = match queued {
            Ok(delivery) => delivery,
            Err(err) => {
                self.handle_save_result(None, &operations)?;
                return Err(err);
            }
        };
        self.mirror_persist().await;

        let entity = self.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = entity.finish_save_later(delivery.await, &operations).await;
            let _ = tx.send(outcome);
        });
        Ok(PendingDelivery::new(rx))
    }

    async fn finish_save_later(&self, delivered: Result<JsonValue>, operations: &OperationSet) -> Result<()> {
        let client = self.client().clone();
        let decoded = delivered.and_then(|document| {
            client
                .codec
                .decode_state(&document, &self.inner.class_name, false, &client.factory())
        });
        match decoded {
            Ok(state) => {
                self.handle_save_result(Some(state), operations)?;
                self.mirror_persist().await;
                Ok(())
            }
            Err(err) => {
                event!(Level::WARN, class = %self.inner.class_name, error = %err, "queued save failed");
                self.handle_save_result(None, operations)?;
                Err(err)
            }
        }
    }

    /// Queues a durable delete. See [`Entity::save_later`] for delivery
    /// semantics.
    pub async fn delete_later(&self) -> Result<PendingDelivery<()>> {
        let client = self.client().clone();
        let command = codec::delete_command(self, PointerEncoding::AllowLocalId)?;
        self.begin_delete();
        let delivery = match client.cache.enqueue(command).await {
            Ok(delivery) => delivery,
            Err(err) => {
                self.handle_delete_result(false);
                return Err(err);
            }
        };

        let entity = self.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = delivery.await.map(|_| ());
            entity.handle_delete_result(result.is_ok());
            if result.is_ok() {
                entity.mirror_delete().await;
            }
            let _ = tx.send(result);
        });
        Ok(PendingDelivery::new(rx))
    }

    /// Loads the local mirror's copy, if there is a mirror and it has one.
    pub async fn fetch_from_mirror(&self) -> Result<bool> {
        let Some(mirror) = self.client().mirror.clone() else {
            return Ok(false);
        };
        match mirror.fetch_local_copy(self).await? {
            Some(state) => {
                self.merge_from_server(state);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Brings the mirror up to date after a save or fetch. Moves a copy kept
    /// under the local id to the server id first.
    pub(crate) async fn mirror_persist(&self) {
        let Some(mirror) = self.client().mirror.clone() else {
            return;
        };
        if let (Some(local_id), Some(object_id)) = (self.existing_local_id(), self.object_id()) {
            if let Err(err) = mirror.reassign_identity(self, &local_id, &object_id).await {
                event!(Level::WARN, %object_id, error = %err, "mirror identity update failed");
            }
        }
        if let Err(err) = mirror.persist(self).await {
            event!(Level::WARN, class = %self.inner.class_name, error = %err, "mirror persist failed");
        }
    }

    pub(crate) async fn mirror_delete(&self) {
        let Some(mirror) = self.client().mirror.clone() else {
            return;
        };
        if let Err(err) = mirror.delete(self).await {
            event!(Level::WARN, class = %self.inner.class_name, error = %err, "mirror delete failed");
        }
    }
}
