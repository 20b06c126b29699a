use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::{
    cache::{CommitHook, KeysetCache},
    capability::CapabilityTable,
    engine::{CryptoEngine, MaterialName},
    error::{KeysetError, KeysetResult},
    events::{EventSink, LifecycleEvent, LifecycleEventKind},
    gateway::OperationGateway,
    models::{
        KeysetId, KeysetMetadata, KeysetMetadataDefinition, KeysetPage, KeysetQuery, KeysetState,
        normalize_description, normalize_tags,
    },
    namespaces::NamespaceDirectory,
    state::{self, Transition},
    store::KeysetStore,
};

/// Orchestrates keyset lifecycle changes across the metadata store and the crypto engine.
///
/// Each mutation runs its precondition check and write inside one unit of work.
/// Commit hooks run synchronously after the commit, then the lifecycle event is
/// published. Events are never published for work that was rolled back.
pub struct KeysetManager<S, C, E>
where
    S: KeysetStore + ?Sized,
    C: CryptoEngine + ?Sized,
    E: EventSink + ?Sized,
{
    store: Arc<S>,
    engine: Arc<C>,
    events: Arc<E>,
    namespaces: Arc<dyn NamespaceDirectory>,
    hooks: Vec<Arc<dyn CommitHook>>,
    cache: Option<Arc<KeysetCache>>,
}

impl<S, C, E> KeysetManager<S, C, E>
where
    S: KeysetStore + ?Sized,
    C: CryptoEngine + ?Sized,
    E: EventSink + ?Sized,
{
    /// Fails if the capability table does not cover every algorithm.
    pub fn new(
        store: Arc<S>,
        engine: Arc<C>,
        events: Arc<E>,
        namespaces: Arc<dyn NamespaceDirectory>,
    ) -> KeysetResult<Self> {
        CapabilityTable::global().validate()?;
        Ok(Self {
            store,
            engine,
            events,
            namespaces,
            hooks: Vec::new(),
            cache: None,
        })
    }

    /// Serve `get` from `cache`; the cache is invalidated on every commit.
    pub fn with_cache(mut self, cache: Arc<KeysetCache>) -> Self {
        self.hooks.push(cache.clone());
        self.cache = Some(cache);
        self
    }

    pub fn with_commit_hook(mut self, hook: Arc<dyn CommitHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn namespaces(&self) -> &Arc<dyn NamespaceDirectory> {
        &self.namespaces
    }

    pub fn find(&self, query: &KeysetQuery) -> KeysetResult<KeysetPage> {
        self.store.find(query)
    }

    pub fn get(&self, id: &KeysetId) -> KeysetResult<KeysetMetadata> {
        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(id)
        {
            return Ok(hit);
        }
        let generation = self.cache.as_ref().map(|cache| cache.generation());
        let metadata = self
            .store
            .get(id)?
            .ok_or_else(|| KeysetError::not_found(id))?;
        if let (Some(cache), Some(generation)) = (&self.cache, generation) {
            cache.put_if_unchanged(metadata.clone(), generation);
        }
        Ok(metadata)
    }

    /// Like [`Self::get`], but a keyset owned by another namespace is reported as not found.
    pub fn get_in(&self, namespace: &str, id: &KeysetId) -> KeysetResult<KeysetMetadata> {
        let metadata = self.get(id)?;
        if metadata.namespace != namespace {
            return Err(KeysetError::not_found(id));
        }
        Ok(metadata)
    }

    pub fn create(&self, definition: KeysetMetadataDefinition) -> KeysetResult<KeysetMetadata> {
        let namespace = definition.namespace();
        let name = definition.name();
        CapabilityTable::global().family(definition.algorithm())?;
        if !self.namespaces.exists(namespace)? {
            return Err(KeysetError::NamespaceNotFound(namespace.to_string()));
        }

        let mut uow = self.store.begin()?;
        if uow.name_taken(namespace, name)? {
            warn!(namespace, name, "keyset name already in use");
            return Err(KeysetError::AlreadyExists {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        let material = MaterialName::derive(namespace, name);
        self.engine
            .create_keyset(&material, definition.algorithm())?;

        let metadata = KeysetMetadata::from_definition(&definition, OffsetDateTime::now_utc());
        if let Err(err) = uow.insert(&metadata).and_then(|()| uow.commit()) {
            error!(
                namespace,
                name,
                error = %err,
                "key material created but keyset metadata was not persisted"
            );
            return Err(KeysetError::OrphanedMaterial {
                namespace: namespace.to_string(),
                name: name.to_string(),
                reason: err.to_string(),
            });
        }

        info!(
            keyset = %metadata.id,
            namespace,
            algorithm = %metadata.algorithm,
            "created keyset"
        );
        self.committed(&metadata, Some(LifecycleEventKind::Created))?;
        Ok(metadata)
    }

    /// Replace description and tags wholesale. Only active keysets may be updated.
    pub fn update(
        &self,
        id: &KeysetId,
        description: Option<String>,
        tags: Vec<String>,
    ) -> KeysetResult<KeysetMetadata> {
        let description = normalize_description(description)?;
        let tags = normalize_tags(tags)?;

        let mut uow = self.store.begin()?;
        let mut metadata = uow
            .get_for_update(id)?
            .ok_or_else(|| KeysetError::not_found(id))?;
        ensure_active(&metadata)?;

        metadata.description = description;
        metadata.tags = tags;
        metadata.updated_at = OffsetDateTime::now_utc();
        uow.update(&metadata)?;
        uow.commit()?;

        debug!(keyset = %metadata.id, "updated keyset metadata");
        self.committed(&metadata, None)?;
        Ok(metadata)
    }

    pub fn transition(&self, id: &KeysetId, target: KeysetState) -> KeysetResult<KeysetMetadata> {
        state::validate_target(target)?;

        let mut uow = self.store.begin()?;
        let mut metadata = uow
            .get_for_update(id)?
            .ok_or_else(|| KeysetError::not_found(id))?;
        let from = metadata.state;

        let event = match state::evaluate(*id, from, target).inspect_err(|err| {
            warn!(keyset = %id, %from, to = %target, error = %err, "rejected keyset transition");
        })? {
            Transition::NoOp => {
                debug!(keyset = %id, state = %from, "transition target equals current state");
                return Ok(metadata);
            }
            Transition::Apply { to, event } => {
                metadata.state = to;
                metadata.destroyed_at = None;
                metadata.updated_at = OffsetDateTime::now_utc();
                event
            }
        };
        uow.update(&metadata)?;
        uow.commit()?;

        info!(keyset = %id, %from, to = %metadata.state, "keyset transitioned");
        self.committed(&metadata, Some(event))?;
        Ok(metadata)
    }

    /// Add a new primary key version. Earlier versions stay available for decrypt and verify.
    pub fn rotate(&self, id: &KeysetId) -> KeysetResult<KeysetMetadata> {
        let mut uow = self.store.begin()?;
        let mut metadata = uow
            .get_for_update(id)?
            .ok_or_else(|| KeysetError::not_found(id))?;
        ensure_active(&metadata)?;

        let material = MaterialName::derive(&metadata.namespace, &metadata.name);
        let version = self.engine.rotate(&material)?;
        let now = OffsetDateTime::now_utc();
        metadata.last_rotated_at = Some(now);
        metadata.updated_at = now;
        uow.update(&metadata)?;
        uow.commit()?;

        info!(keyset = %id, version, "rotated keyset");
        self.committed(&metadata, Some(LifecycleEventKind::Rotated))?;
        Ok(metadata)
    }

    /// Remove the keyset and irreversibly destroy its material, whatever its state.
    ///
    /// Material is destroyed before the row removal commits. If the commit then
    /// fails the row survives and the call can be retried.
    pub fn delete(&self, id: &KeysetId) -> KeysetResult<()> {
        self.delete_if(id, |_| true).map(|_| ())
    }

    /// Delete only if `predicate` holds for the row as locked by the unit of work.
    ///
    /// Returns `Ok(false)` and leaves everything untouched when the predicate
    /// rejects the current row, so a state change committed after the caller
    /// last read the keyset is always honoured.
    pub fn delete_if<F>(&self, id: &KeysetId, predicate: F) -> KeysetResult<bool>
    where
        F: FnOnce(&KeysetMetadata) -> bool,
    {
        let mut uow = self.store.begin()?;
        let metadata = uow
            .get_for_update(id)?
            .ok_or_else(|| KeysetError::not_found(id))?;
        if !predicate(&metadata) {
            debug!(keyset = %id, state = %metadata.state, "delete precondition no longer holds");
            return Ok(false);
        }
        uow.delete(id)?;

        let material = MaterialName::derive(&metadata.namespace, &metadata.name);
        self.engine.destroy(&material)?;
        uow.commit().inspect_err(|err| {
            error!(keyset = %id, error = %err, "key material destroyed but keyset row was not removed");
        })?;

        info!(keyset = %id, namespace = %metadata.namespace, state = %metadata.state, "deleted keyset");
        self.committed(&metadata, Some(LifecycleEventKind::Destroyed))?;
        Ok(true)
    }

    /// Number of key versions the engine retains for this keyset.
    pub fn version_count(&self, id: &KeysetId) -> KeysetResult<usize> {
        let metadata = self.get(id)?;
        self.engine
            .version_count(&MaterialName::derive(&metadata.namespace, &metadata.name))
    }

    /// Bind an operation gateway to an active keyset. Always reads the store.
    pub fn operations(&self, id: &KeysetId) -> KeysetResult<OperationGateway<C>> {
        let metadata = self
            .store
            .get(id)?
            .ok_or_else(|| KeysetError::not_found(id))?;
        ensure_active(&metadata)?;
        Ok(OperationGateway::new(metadata, self.engine.clone()))
    }

    /// Like [`Self::operations`]; ownership is checked before state so a foreign
    /// keyset reports not found rather than inactive.
    pub fn operations_in(
        &self,
        namespace: &str,
        id: &KeysetId,
    ) -> KeysetResult<OperationGateway<C>> {
        let metadata = self
            .store
            .get(id)?
            .filter(|metadata| metadata.namespace == namespace)
            .ok_or_else(|| KeysetError::not_found(id))?;
        ensure_active(&metadata)?;
        Ok(OperationGateway::new(metadata, self.engine.clone()))
    }

    fn committed(
        &self,
        metadata: &KeysetMetadata,
        kind: Option<LifecycleEventKind>,
    ) -> KeysetResult<()> {
        for hook in &self.hooks {
            hook.on_commit(&metadata.id);
        }
        let Some(kind) = kind else {
            return Ok(());
        };
        let event = LifecycleEvent::new(kind, metadata.id, metadata.namespace.clone());
        self.events.publish(&event).inspect_err(|err| {
            error!(keyset = %metadata.id, event = %kind, error = %err, "failed to publish lifecycle event");
        })?;
        metrics::counter!("keyset_lifecycle_events_total", "kind" => kind.as_str()).increment(1);
        Ok(())
    }
}

fn ensure_active(metadata: &KeysetMetadata) -> KeysetResult<()> {
    if metadata.is_active() {
        return Ok(());
    }
    warn!(keyset = %metadata.id, state = %metadata.state, "keyset is not active");
    Err(KeysetError::KeysetInactive {
        id: metadata.id,
        state: metadata.state,
    })
}
