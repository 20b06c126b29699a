//! Keyset metadata persistence.
//!
//! Reads go through [`KeysetStore::get`] and [`KeysetStore::find`]. Every mutation
//! goes through a [`UnitOfWork`]: the precondition read and the write happen
//! inside one transaction, and dropping the unit without calling
//! [`UnitOfWork::commit`] rolls it back.

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};

use crate::{
    error::{KeysetError, KeysetResult},
    models::{KeysetId, KeysetMetadata, KeysetPage, KeysetQuery, KeysetSort},
};

pub trait KeysetStore: Send + Sync {
    fn get(&self, id: &KeysetId) -> KeysetResult<Option<KeysetMetadata>>;
    fn find(&self, query: &KeysetQuery) -> KeysetResult<KeysetPage>;
    /// Open a transaction. Concurrent units against the same store serialize.
    fn begin(&self) -> KeysetResult<Box<dyn UnitOfWork + '_>>;
}

pub trait UnitOfWork {
    fn get_for_update(&mut self, id: &KeysetId) -> KeysetResult<Option<KeysetMetadata>>;
    fn name_taken(&mut self, namespace: &str, name: &str) -> KeysetResult<bool>;
    fn insert(&mut self, metadata: &KeysetMetadata) -> KeysetResult<()>;
    fn update(&mut self, metadata: &KeysetMetadata) -> KeysetResult<()>;
    fn delete(&mut self, id: &KeysetId) -> KeysetResult<()>;
    fn commit(self: Box<Self>) -> KeysetResult<()>;
}

/// Filter, order and slice a set of rows according to `query`.
pub(crate) fn search<'a, I>(rows: I, query: &KeysetQuery) -> KeysetPage
where
    I: IntoIterator<Item = &'a KeysetMetadata>,
{
    let mut matched: Vec<&KeysetMetadata> = rows
        .into_iter()
        .filter(|row| query.criteria.matches(row) && query.matches_term(row))
        .collect();

    match query.sort {
        KeysetSort::Created => {
            matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
        }
        KeysetSort::NameAsc => matched.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id))),
        KeysetSort::NameDesc => matched.sort_by(|a, b| b.name.cmp(&a.name).then(a.id.cmp(&b.id))),
    }

    let total = matched.len();
    let items = matched
        .into_iter()
        .skip(query.offset())
        .take(query.effective_per_page() as usize)
        .cloned()
        .collect();
    KeysetPage::new(items, total, query)
}

/// In-memory store for tests and ephemeral deployments. A unit of work holds the
/// store lock for its whole lifetime, so transactions are fully serialized.
#[derive(Default)]
pub struct MemoryKeysetStore {
    rows: Mutex<HashMap<KeysetId, KeysetMetadata>>,
}

impl MemoryKeysetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeysetStore for MemoryKeysetStore {
    fn get(&self, id: &KeysetId) -> KeysetResult<Option<KeysetMetadata>> {
        Ok(self.rows.lock().get(id).cloned())
    }

    fn find(&self, query: &KeysetQuery) -> KeysetResult<KeysetPage> {
        let rows = self.rows.lock();
        Ok(search(rows.values(), query))
    }

    fn begin(&self) -> KeysetResult<Box<dyn UnitOfWork + '_>> {
        Ok(Box::new(MemoryUnitOfWork {
            rows: self.rows.lock(),
            staged: HashMap::new(),
        }))
    }
}

struct MemoryUnitOfWork<'a> {
    rows: MutexGuard<'a, HashMap<KeysetId, KeysetMetadata>>,
    /// `None` marks a staged delete.
    staged: HashMap<KeysetId, Option<KeysetMetadata>>,
}

impl MemoryUnitOfWork<'_> {
    fn current(&self, id: &KeysetId) -> Option<&KeysetMetadata> {
        match self.staged.get(id) {
            Some(staged) => staged.as_ref(),
            None => self.rows.get(id),
        }
    }

    fn visible_rows(&self) -> impl Iterator<Item = &KeysetMetadata> {
        let committed = self
            .rows
            .values()
            .filter(|row| !self.staged.contains_key(&row.id));
        let staged = self.staged.values().filter_map(Option::as_ref);
        committed.chain(staged)
    }
}

impl UnitOfWork for MemoryUnitOfWork<'_> {
    fn get_for_update(&mut self, id: &KeysetId) -> KeysetResult<Option<KeysetMetadata>> {
        Ok(self.current(id).cloned())
    }

    fn name_taken(&mut self, namespace: &str, name: &str) -> KeysetResult<bool> {
        Ok(self
            .visible_rows()
            .any(|row| row.namespace == namespace && row.name == name))
    }

    fn insert(&mut self, metadata: &KeysetMetadata) -> KeysetResult<()> {
        if self.current(&metadata.id).is_some() {
            return Err(KeysetError::storage(format!(
                "keyset {} already stored",
                metadata.id
            )));
        }
        if self.name_taken(&metadata.namespace, &metadata.name)? {
            return Err(KeysetError::AlreadyExists {
                namespace: metadata.namespace.clone(),
                name: metadata.name.clone(),
            });
        }
        self.staged.insert(metadata.id, Some(metadata.clone()));
        Ok(())
    }

    fn update(&mut self, metadata: &KeysetMetadata) -> KeysetResult<()> {
        if self.current(&metadata.id).is_none() {
            return Err(KeysetError::not_found(&metadata.id));
        }
        self.staged.insert(metadata.id, Some(metadata.clone()));
        Ok(())
    }

    fn delete(&mut self, id: &KeysetId) -> KeysetResult<()> {
        if self.current(id).is_none() {
            return Err(KeysetError::not_found(id));
        }
        self.staged.insert(*id, None);
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> KeysetResult<()> {
        let staged = std::mem::take(&mut self.staged);
        for (id, row) in staged {
            match row {
                Some(row) => {
                    self.rows.insert(id, row);
                }
                None => {
                    self.rows.remove(&id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KeysetAlgorithm, KeysetMetadataDefinition, KeysetState};
    use time::{Duration, OffsetDateTime};

    fn metadata(namespace: &str, name: &str, offset_secs: i64) -> KeysetMetadata {
        let def = KeysetMetadataDefinition::new(
            namespace,
            KeysetAlgorithm::Aes256Gcm,
            name,
            Some(format!("{name} description")),
            Vec::new(),
            None,
        )
        .unwrap();
        KeysetMetadata::from_definition(
            &def,
            OffsetDateTime::UNIX_EPOCH + Duration::seconds(offset_secs),
        )
    }

    fn seeded() -> MemoryKeysetStore {
        let store = MemoryKeysetStore::new();
        let mut uow = store.begin().unwrap();
        uow.insert(&metadata("a", "charlie", 3)).unwrap();
        uow.insert(&metadata("a", "alpha", 1)).unwrap();
        uow.insert(&metadata("a", "bravo", 2)).unwrap();
        uow.insert(&metadata("b", "alpha", 4)).unwrap();
        uow.commit().unwrap();
        store
    }

    #[test]
    fn dropped_unit_of_work_rolls_back() {
        let store = MemoryKeysetStore::new();
        {
            let mut uow = store.begin().unwrap();
            uow.insert(&metadata("a", "ghost", 0)).unwrap();
        }
        assert!(store.is_empty());
    }

    #[test]
    fn duplicate_name_in_namespace_is_rejected() {
        let store = seeded();
        let mut uow = store.begin().unwrap();
        assert!(uow.name_taken("a", "alpha").unwrap());
        assert!(!uow.name_taken("c", "alpha").unwrap());
        assert!(matches!(
            uow.insert(&metadata("a", "alpha", 9)),
            Err(KeysetError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn staged_delete_hides_row_within_transaction() {
        let store = seeded();
        let page = store.find(&KeysetQuery::in_namespace("b")).unwrap();
        let id = page.items[0].id;
        let mut uow = store.begin().unwrap();
        uow.delete(&id).unwrap();
        assert!(uow.get_for_update(&id).unwrap().is_none());
        assert!(!uow.name_taken("b", "alpha").unwrap());
        uow.commit().unwrap();
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn find_filters_sorts_and_pages() {
        let store = seeded();
        let mut query = KeysetQuery::in_namespace("a");
        query.sort = KeysetSort::NameAsc;
        query.per_page = 2;
        let page = store.find(&query).unwrap();
        assert_eq!(page.total, 3);
        assert!(page.has_more);
        let names: Vec<_> = page.items.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "bravo"]);

        query.page = 2;
        let page = store.find(&query).unwrap();
        assert!(!page.has_more);
        assert_eq!(page.items[0].name, "charlie");
    }

    #[test]
    fn default_sort_is_creation_order() {
        let store = seeded();
        let page = store.find(&KeysetQuery::in_namespace("a")).unwrap();
        let names: Vec<_> = page.items.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "bravo", "charlie"]);
    }

    #[test]
    fn find_by_state_and_term() {
        let store = seeded();
        let mut query = KeysetQuery::default();
        query.criteria.state = Some(KeysetState::Active);
        query.term = Some("ALPHA".into());
        let page = store.find(&query).unwrap();
        assert_eq!(page.total, 2);

        query.criteria.state = Some(KeysetState::Inactive);
        assert_eq!(store.find(&query).unwrap().total, 0);
    }
}
