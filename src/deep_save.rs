//! Saving an entity graph: attachments and dirty entities reachable from a
//! root, ordered so every reference is written after its target has a server
//! id.

use crate::client::ClientCore;
use crate::codec::{self, PointerEncoder, PointerEncoding};
use crate::core::{FileRef, Result, SyncError, Value};
use crate::entity::Entity;
use crate::ops::OperationSet;
use crate::state::EntityState;
use crate::task_queue::TaskQueue;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, event, info_span};

/// Walks `value` and collects every dirty entity and unsaved file it reaches,
/// dependencies first.
///
/// `seen` stops the walk at entities already on the current path. `seen_new`
/// holds the id-less entities met since the last entity with a server id;
/// reaching one of them again means none of them can ever be saved first.
pub fn collect_dirty_children(
    value: &Value,
    entities: &mut Vec<Entity>,
    files: &mut Vec<FileRef>,
    seen: &HashSet<u64>,
    seen_new: &HashSet<u64>,
) -> Result<()> {
    match value {
        Value::List(items) => {
            for item in items {
                collect_dirty_children(item, entities, files, seen, seen_new)?;
            }
        }
        Value::Map(map) => {
            for item in map.values() {
                collect_dirty_children(item, entities, files, seen, seen_new)?;
            }
        }
        Value::File(file) => {
            if file.is_dirty() && !files.iter().any(|known| known.same_file(file)) {
                files.push(file.clone());
            }
        }
        Value::Entity(entity) => {
            let sequence = entity.sequence();
            let seen_new = if entity.object_id().is_some() {
                HashSet::new()
            } else {
                if seen_new.contains(&sequence) {
                    return Err(SyncError::CircularDependency(format!(
                        "'{}' is part of a cycle of unsaved entities",
                        entity.class_name()
                    )));
                }
                let mut next = seen_new.clone();
                next.insert(sequence);
                next
            };
            if seen.contains(&sequence) {
                return Ok(());
            }
            let mut seen = seen.clone();
            seen.insert(sequence);

            for child in entity.estimated_data().values() {
                collect_dirty_children(child, entities, files, &seen, &seen_new)?;
            }
            if entity.is_dirty_self() && !entities.iter().any(|known| known.sequence() == sequence) {
                entities.push(entity.clone());
            }
        }
        // Relation targets are not saved through the owner.
        _ => {}
    }
    Ok(())
}

/// True when every entity the value references already has a server id and
/// every file has been uploaded.
pub fn can_be_serialized(value: &Value) -> bool {
    match value {
        Value::List(items) => items.iter().all(can_be_serialized),
        Value::Map(map) => map.values().all(can_be_serialized),
        Value::File(file) => file.url().is_some(),
        Value::Entity(entity) => entity.object_id().is_some(),
        _ => true,
    }
}

fn entity_can_be_serialized(entity: &Entity) -> bool {
    entity.estimated_data().values().all(can_be_serialized)
}

pub(crate) async fn deep_save(client: Arc<ClientCore>, root: Value) -> Result<()> {
    let mut entities = Vec::new();
    let mut files = Vec::new();
    collect_dirty_children(&root, &mut entities, &mut files, &HashSet::new(), &HashSet::new())?;
    if entities.is_empty() && files.is_empty() {
        return Ok(());
    }

    let span = info_span!("sync.save", entities = entities.len(), files = files.len());
    async move {
        let mut independent: Vec<JoinHandle<Result<()>>> = files
            .into_iter()
            .map(|file| {
                let transport = client.transport.clone();
                tokio::spawn(async move { file.save(transport).await })
            })
            .collect();

        let mut remaining = entities;
        while !remaining.is_empty() {
            let mut principals = Vec::new();
            let mut ready = Vec::new();
            let mut waiting = Vec::new();
            for entity in remaining {
                if !entity_can_be_serialized(&entity) {
                    waiting.push(entity);
                } else if entity.is_principal() && entity.object_id().is_none() {
                    principals.push(entity);
                } else {
                    ready.push(entity);
                }
            }

            if ready.is_empty() && principals.is_empty() {
                if independent.is_empty() {
                    return Err(SyncError::Inconsistent(format!(
                        "{} entities can never be serialized",
                        waiting.len()
                    )));
                }
                join_waves(&mut independent).await?;
                remaining = waiting;
                continue;
            }

            for principal in principals {
                independent.push(tokio::spawn(save_wave(client.clone(), vec![principal])));
            }
            if !ready.is_empty() {
                save_wave(client.clone(), ready).await?;
            }
            remaining = waiting;
        }

        join_waves(&mut independent).await
    }
    .instrument(span)
    .await
}

/// Awaits every spawned wave and reports the first failure.
async fn join_waves(waves: &mut Vec<JoinHandle<Result<()>>>) -> Result<()> {
    let mut first_error = None;
    for wave in waves.drain(..) {
        let outcome = match wave.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => Err(SyncError::Cancelled),
            Err(err) => Err(SyncError::Inconsistent(format!("save wave failed: {}", err))),
        };
        if let Err(err) = outcome {
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Saves `entities` as one batched request, admitted to every entity's
/// queue at once. Each entity's edits are captured at admission; the
/// commands are encoded only once earlier operations on those entities
/// have finished.
pub(crate) async fn save_wave(client: Arc<ClientCore>, entities: Vec<Entity>) -> Result<()> {
    let entities: Vec<Entity> = entities
        .into_iter()
        .filter(|entity| entity.object_id().is_none() || entity.has_changes())
        .collect();
    if entities.is_empty() {
        return Ok(());
    }

    let span = info_span!("sync.save.wave", size = entities.len());
    let admitted = {
        let queues: Vec<(u64, &TaskQueue)> = entities
            .iter()
            .map(|entity| (entity.sequence(), entity.task_queue()))
            .collect();
        let wave = entities.clone();
        TaskQueue::enqueue_joint(&queues, move |prior| {
            let generations: Vec<(Entity, OperationSet)> = wave
                .into_iter()
                .map(|entity| {
                    let operations = entity.start_save();
                    (entity, operations)
                })
                .collect();
            async move {
                prior.await;
                send_generations(client, generations).await
            }
        })
    };
    admitted.instrument(span).await
}

async fn send_generations(
    client: Arc<ClientCore>,
    generations: Vec<(Entity, OperationSet)>,
) -> Result<()> {
    let mut first_error = None;
    let mut commands = Vec::with_capacity(generations.len());
    let mut sent = Vec::with_capacity(generations.len());
    for (entity, operations) in generations {
        let mut pointers = PointerEncoder::new(PointerEncoding::ObjectIdOnly);
        match codec::save_command(client.codec.as_ref(), &entity, &operations, &mut pointers) {
            Ok(command) => {
                commands.push(command);
                sent.push((entity, operations));
            }
            Err(err) => {
                settle(&entity, None, &operations, &mut first_error);
                first_error.get_or_insert(err);
            }
        }
    }

    let results = client.batcher.submit(commands).await;
    let factory = client.factory();
    for ((entity, operations), result) in sent.into_iter().zip(results) {
        let decoded = result.and_then(|document| {
            client
                .codec
                .decode_state(&document, &entity.class_name(), false, &factory)
        });
        match decoded {
            Ok(state) => {
                if settle(&entity, Some(state), &operations, &mut first_error) {
                    entity.mirror_persist().await;
                }
            }
            Err(err) => {
                event!(
                    Level::DEBUG,
                    class = %entity.class_name(),
                    error = %err,
                    "save failed, edits kept for the next attempt"
                );
                settle(&entity, None, &operations, &mut first_error);
                first_error.get_or_insert(err);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn settle(
    entity: &Entity,
    result: Option<EntityState>,
    operations: &OperationSet,
    first_error: &mut Option<SyncError>,
) -> bool {
    match entity.handle_save_result(result, operations) {
        Ok(()) => true,
        Err(err) => {
            first_error.get_or_insert(err);
            false
        }
    }
}

/// Deletes `entities` as one batched request. Entities that were never
/// saved have nothing to delete and succeed without a request.
pub(crate) async fn delete_wave(client: Arc<ClientCore>, entities: Vec<Entity>) -> Result<()> {
    if entities.is_empty() {
        return Ok(());
    }
    let span = info_span!("sync.delete.wave", size = entities.len());
    let admitted = {
        let queues: Vec<(u64, &TaskQueue)> = entities
            .iter()
            .map(|entity| (entity.sequence(), entity.task_queue()))
            .collect();
        let wave = entities.clone();
        TaskQueue::enqueue_joint(&queues, move |prior| {
            for entity in &wave {
                entity.begin_delete();
            }
            async move {
                prior.await;
                send_deletes(client, wave).await
            }
        })
    };
    admitted.instrument(span).await
}

async fn send_deletes(client: Arc<ClientCore>, entities: Vec<Entity>) -> Result<()> {
    let mut commands = Vec::new();
    let mut targets = Vec::new();
    for entity in entities {
        if entity.object_id().is_none() {
            entity.handle_delete_result(false);
            continue;
        }
        match codec::delete_command(&entity, PointerEncoding::ObjectIdOnly) {
            Ok(command) => {
                commands.push(command);
                targets.push(entity);
            }
            Err(err) => {
                entity.handle_delete_result(false);
                return Err(err);
            }
        }
    }

    let mut first_error = None;
    let results = client.batcher.submit(commands).await;
    for (entity, result) in targets.into_iter().zip(results) {
        entity.handle_delete_result(result.is_ok());
        match result {
            Ok(_) => entity.mirror_delete().await,
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}
