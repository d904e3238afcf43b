//! Relationship collections and the cache that hands them out.
//!
//! # Invariants
//! - At most one collection object exists per `(instance, field)` key while
//!   the entry is cached; every handle clone sees the same members.
//! - Membership is a set keyed by `Entity::member_key`.
//! - Removed members that were persisted are stashed until the next commit so
//!   reconciliation can detach or delete them without re-reading storage.

use crate::model::entity::{Entity, InstanceKey};
use crate::model::value::Value;
use crate::tracking::diff::{diff_members, membership_value, CollectionDiff};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use std::rc::Rc;

/// Shared handle to one materialized collection.
pub type CollectionHandle = Rc<RefCell<RelationCollection>>;

#[derive(Debug, Clone)]
pub struct RelationCollection {
    field: String,
    members: Vec<Entity>,
    removed: Vec<Entity>,
}

impl RelationCollection {
    pub fn new(field: impl Into<String>, members: Vec<Entity>) -> Self {
        Self {
            field: field.into(),
            members,
            removed: Vec::new(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn members(&self) -> &[Entity] {
        &self.members
    }

    pub fn members_mut(&mut self) -> &mut [Entity] {
        &mut self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, entity: &Entity) -> bool {
        let key = entity.member_key();
        self.members.iter().any(|member| member.member_key() == key)
    }

    /// Adds a member; returns `false` when it is already present.
    pub fn add(&mut self, entity: Entity) -> bool {
        if self.contains(&entity) {
            return false;
        }
        let key = entity.member_key();
        self.removed.retain(|stashed| stashed.member_key() != key);
        self.members.push(entity);
        true
    }

    /// Removes a member by identity and returns it.
    pub fn remove(&mut self, entity: &Entity) -> Option<Entity> {
        let key = entity.member_key();
        let index = self
            .members
            .iter()
            .position(|member| member.member_key() == key)?;
        let removed = self.members.remove(index);
        if removed.is_stored() {
            self.removed.push(removed.clone());
        }
        Some(removed)
    }

    /// Keys of every current member, persisted or not.
    pub fn member_keys(&self) -> BTreeSet<String> {
        self.members.iter().map(Entity::member_key).collect()
    }

    /// Keys of the members that are persisted.
    pub fn persisted_keys(&self) -> BTreeSet<String> {
        self.members
            .iter()
            .filter(|member| member.is_stored())
            .map(Entity::member_key)
            .collect()
    }

    /// Comparison string of the persisted members only.
    pub fn persisted_membership(&self) -> Value {
        membership_value(self.persisted_keys())
    }

    pub fn changes(&self, baseline: &BTreeSet<String>) -> CollectionDiff {
        diff_members(&self.member_keys(), baseline)
    }

    /// Members present now but absent from `baseline`.
    pub fn added<'a>(&'a self, baseline: &BTreeSet<String>) -> Vec<&'a Entity> {
        self.members
            .iter()
            .filter(|member| !baseline.contains(&member.member_key()))
            .collect()
    }

    /// Keys in `baseline` that are no longer members.
    pub fn deleted(&self, baseline: &BTreeSet<String>) -> BTreeSet<String> {
        self.changes(baseline).removed
    }

    /// Takes a stashed removed member out of the collection.
    pub(crate) fn take_removed(&mut self, key: &str) -> Option<Entity> {
        let index = self
            .removed
            .iter()
            .position(|stashed| stashed.member_key() == key)?;
        Some(self.removed.remove(index))
    }

    pub(crate) fn clear_removed(&mut self) {
        self.removed.clear();
    }
}

/// Cache key: instance identity plus field name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationKey {
    pub instance: InstanceKey,
    pub field: String,
}

impl RelationKey {
    pub fn new(instance: InstanceKey, field: impl Into<String>) -> Self {
        Self {
            instance,
            field: field.into(),
        }
    }
}

impl Display for RelationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.instance, self.field)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelationshipCache {
    entries: HashMap<RelationKey, CollectionHandle>,
}

impl RelationshipCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RelationKey) -> Option<CollectionHandle> {
        self.entries.get(key).cloned()
    }

    pub fn set(&mut self, key: RelationKey, collection: CollectionHandle) {
        self.entries.insert(key, collection);
    }

    pub fn remove(&mut self, key: &RelationKey) -> Option<CollectionHandle> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &RelationKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Drops every entry of one instance; returns how many were evicted.
    pub fn evict_instance(&mut self, instance: &InstanceKey) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| &key.instance != instance);
        before - self.entries.len()
    }

    /// Moves every entry of `from` under `to`, keeping the same objects.
    pub fn rekey(&mut self, from: &InstanceKey, to: &InstanceKey) {
        let moved: Vec<RelationKey> = self
            .entries
            .keys()
            .filter(|key| &key.instance == from)
            .cloned()
            .collect();
        for key in moved {
            if let Some(handle) = self.entries.remove(&key) {
                self.entries
                    .insert(RelationKey::new(to.clone(), key.field), handle);
            }
        }
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
    use crate::model::schema::{EntitySchema, ScalarType};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use uuid::Uuid;

    fn schema() -> Arc<EntitySchema> {
        Arc::new(
            EntitySchema::builder("tags")
                .scalar("label", ScalarType::Text)
                .build()
                .unwrap(),
        )
    }

    fn stored(schema: &Arc<EntitySchema>) -> Entity {
        Entity::loaded(Arc::clone(schema), Uuid::new_v4(), BTreeMap::new())
    }

    #[test]
    fn add_and_remove_track_membership_and_stash() {
        let schema = schema();
        let kept = stored(&schema);
        let dropped = stored(&schema);
        let mut collection = RelationCollection::new("tags", vec![kept.clone(), dropped.clone()]);
        let baseline = collection.member_keys();

        assert!(!collection.add(kept.clone()));
        let fresh = Entity::new(&schema);
        assert!(collection.add(fresh.clone()));
        assert!(collection.remove(&dropped).is_some());

        let diff = collection.changes(&baseline);
        assert_eq!(diff.added, BTreeSet::from([fresh.member_key()]));
        assert_eq!(diff.removed, BTreeSet::from([dropped.member_key()]));
        assert_eq!(collection.added(&baseline).len(), 1);
        assert!(collection.take_removed(&dropped.member_key()).is_some());
        assert_eq!(
            collection.persisted_membership(),
            Value::Text(kept.member_key())
        );
    }

    #[test]
    fn re_adding_a_removed_member_clears_the_stash() {
        let schema = schema();
        let member = stored(&schema);
        let mut collection = RelationCollection::new("tags", vec![member.clone()]);
        collection.remove(&member);
        collection.add(member.clone());
        assert!(collection.take_removed(&member.member_key()).is_none());
    }

    #[test]
    fn cache_returns_same_object_and_supports_rekey_and_eviction() {
        let mut cache = RelationshipCache::new();
        let transient = InstanceKey::Transient(42);
        let key = RelationKey::new(transient.clone(), "tags");
        let handle: CollectionHandle = Rc::new(RefCell::new(RelationCollection::new("tags", vec![])));
        cache.set(key.clone(), Rc::clone(&handle));

        let fetched = cache.get(&key).unwrap();
        assert!(Rc::ptr_eq(&fetched, &handle));

        let stored_key = InstanceKey::Stored {
            table: "books".to_string(),
            id: Uuid::new_v4(),
        };
        cache.rekey(&transient, &stored_key);
        assert!(!cache.contains(&key));
        let moved = cache.get(&RelationKey::new(stored_key.clone(), "tags")).unwrap();
        assert!(Rc::ptr_eq(&moved, &handle));

        assert_eq!(cache.evict_instance(&stored_key), 1);
        assert!(cache.is_empty());
    }
}
