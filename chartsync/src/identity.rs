use crate::{
    error::IdentityError,
    id::{IdKind, ObjectId, PaneScope, generate_id},
};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use tracing::debug;

type ScopeEntries<T> = FnvHashMap<ObjectId, T>;

/// Maps `(scope, id)` pairs to the objects they currently name.
///
/// Identifiers are unique within a [`PaneScope`] only; the same id in two panes names two
/// unrelated objects. All scopes sit behind one lock, so every mutation (including a
/// cross-scope [`rescope`](Self::rescope)) is observed by resolvers as a single step.
#[derive(Debug)]
pub struct IdentityRegistry<T> {
    scopes: RwLock<FnvHashMap<PaneScope, ScopeEntries<T>>>,
}

impl<T> Default for IdentityRegistry<T> {
    fn default() -> Self {
        Self {
            scopes: RwLock::new(FnvHashMap::default()),
        }
    }
}

impl<T> IdentityRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an empty scope for a newly created pane.
    pub fn open_scope(&self, scope: PaneScope) -> Result<(), IdentityError> {
        let mut scopes = self.scopes.write();
        if scopes.contains_key(&scope) {
            return Err(IdentityError::ScopeExists(scope));
        }
        scopes.insert(scope, FnvHashMap::default());
        Ok(())
    }

    /// Close a scope, retiring every entry it still holds.
    pub fn close_scope(&self, scope: &PaneScope) -> Result<Vec<(ObjectId, T)>, IdentityError> {
        let entries = self
            .scopes
            .write()
            .remove(scope)
            .ok_or_else(|| IdentityError::UnknownScope(scope.clone()))?;

        debug!(%scope, retired = entries.len(), "closed identity scope");
        Ok(entries.into_iter().collect())
    }

    pub fn has_scope(&self, scope: &PaneScope) -> bool {
        self.scopes.read().contains_key(scope)
    }

    /// Register `value` under a freshly generated id, unique within `scope`.
    pub fn allocate(
        &self,
        scope: &PaneScope,
        kind: IdKind,
        value: T,
    ) -> Result<ObjectId, IdentityError> {
        let mut scopes = self.scopes.write();
        let entries = scopes
            .get_mut(scope)
            .ok_or_else(|| IdentityError::UnknownScope(scope.clone()))?;

        let id = ObjectId(generate_id(kind, |candidate| {
            entries.contains_key(&ObjectId::from(candidate))
        }));
        entries.insert(id.clone(), value);
        Ok(id)
    }

    /// Register `value` under a caller supplied id.
    pub fn affix(&self, scope: &PaneScope, id: ObjectId, value: T) -> Result<(), IdentityError> {
        let mut scopes = self.scopes.write();
        let entries = scopes
            .get_mut(scope)
            .ok_or_else(|| IdentityError::UnknownScope(scope.clone()))?;

        if entries.contains_key(&id) {
            return Err(IdentityError::Occupied {
                scope: scope.clone(),
                id,
            });
        }
        entries.insert(id, value);
        Ok(())
    }

    /// Apply `f` to the live object named by `(scope, id)`.
    pub fn update<R>(
        &self,
        scope: &PaneScope,
        id: &ObjectId,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, IdentityError> {
        let mut scopes = self.scopes.write();
        scopes
            .get_mut(scope)
            .and_then(|entries| entries.get_mut(id))
            .map(f)
            .ok_or_else(|| unknown(scope, id))
    }

    /// Remove an entry. Retiring an id twice fails the second time.
    pub fn retire(&self, scope: &PaneScope, id: &ObjectId) -> Result<T, IdentityError> {
        self.scopes
            .write()
            .get_mut(scope)
            .and_then(|entries| entries.remove(id))
            .ok_or_else(|| unknown(scope, id))
    }

    /// Atomically retire `(old_scope, old_id)` and register the same object under a new id
    /// in `new_scope`, returning the new id.
    ///
    /// No resolver can observe the object in neither scope or in both.
    pub fn rescope(
        &self,
        old_scope: &PaneScope,
        old_id: &ObjectId,
        new_scope: &PaneScope,
        kind: IdKind,
    ) -> Result<ObjectId, IdentityError> {
        let mut scopes = self.scopes.write();

        if !scopes.contains_key(new_scope) {
            return Err(IdentityError::UnknownScope(new_scope.clone()));
        }

        let value = scopes
            .get_mut(old_scope)
            .and_then(|entries| entries.remove(old_id))
            .ok_or_else(|| unknown(old_scope, old_id))?;

        let entries = scopes
            .get_mut(new_scope)
            .ok_or_else(|| IdentityError::UnknownScope(new_scope.clone()))?;

        let new_id = ObjectId(generate_id(kind, |candidate| {
            entries.contains_key(&ObjectId::from(candidate))
        }));
        entries.insert(new_id.clone(), value);

        debug!(from = %old_scope, %old_id, to = %new_scope, %new_id, "rescoped identity");
        Ok(new_id)
    }

    pub fn contains(&self, scope: &PaneScope, id: &ObjectId) -> bool {
        self.scopes
            .read()
            .get(scope)
            .is_some_and(|entries| entries.contains_key(id))
    }

    /// Ids currently registered in `scope`, sorted.
    pub fn ids(&self, scope: &PaneScope) -> Result<Vec<ObjectId>, IdentityError> {
        let scopes = self.scopes.read();
        let entries = scopes
            .get(scope)
            .ok_or_else(|| IdentityError::UnknownScope(scope.clone()))?;

        let mut ids: Vec<_> = entries.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Locate every `(scope, id)` whose object matches `predicate`, under a single read.
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Vec<(PaneScope, ObjectId)> {
        self.scopes
            .read()
            .iter()
            .flat_map(|(scope, entries)| {
                entries
                    .iter()
                    .filter(|(_, value)| predicate(value))
                    .map(move |(id, _)| (scope.clone(), id.clone()))
            })
            .collect()
    }
}

impl<T: Clone> IdentityRegistry<T> {
    /// Resolve `(scope, id)` to the object it currently names.
    ///
    /// Fails with [`IdentityError::UnknownIdentity`] whether the id never existed or was
    /// already retired.
    pub fn resolve(&self, scope: &PaneScope, id: &ObjectId) -> Result<T, IdentityError> {
        self.scopes
            .read()
            .get(scope)
            .and_then(|entries| entries.get(id))
            .cloned()
            .ok_or_else(|| unknown(scope, id))
    }
}

fn unknown(scope: &PaneScope, id: &ObjectId) -> IdentityError {
    IdentityError::UnknownIdentity {
        scope: scope.clone(),
        id: id.clone(),
    }
}
