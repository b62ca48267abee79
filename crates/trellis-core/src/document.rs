//! The document: object table plus change dispatch.
//!
//! A [`Document`] owns every object, routes property writes through the
//! installed [`DocumentHook`]s and fans notifications out through its
//! [`DocumentSignals`]. Editing is single threaded and synchronous; every
//! handler runs to completion before the write that triggered it returns.
//!
//! # Change pipeline
//!
//! [`Document::set_property_as`] performs, in order:
//!
//! 1. type check, plus lock check for [`ChangeOrigin::User`] writes
//! 2. same-value short circuit (nothing is emitted)
//! 3. `property_changing` on every hook; any error vetoes the write
//! 4. store
//! 5. the `property_changed` signal
//! 6. `property_changed` on every hook (skipped while restoring)
//! 7. `watched_changed` for every [`Watch`] on the changed object
//!
//! Hooks are stateless. Extension state lives on the objects themselves (see
//! [`ObjectRegistry::set_extension`]), so a hook can freely write back into
//! the document from inside a handler. Reentrancy guards are flags in that
//! state.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::error::{CoreError, CoreResult};
use crate::object::{ObjectData, ObjectError, ObjectId, ObjectRegistry};
use crate::params::LinkParams;
use crate::property::{LinkScope, PropertyCell, PropertyError, PropertyStatus, PropertyValue};
use crate::signal::{ConnectionId, Signal};

/// Pseudo-property reported when the membership of a group changes.
pub const GROUP_PROPERTY: &str = "Group";
/// Pseudo-property reported when an object's label changes.
pub const LABEL_PROPERTY: &str = "Label";

/// Where a change came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    /// An interactive or scripted edit.
    User,
    /// A value relayed from another object by a synchronizer.
    Relay,
    /// A value computed by an extension.
    Internal,
    /// A value loaded while restoring a snapshot.
    Restore,
    /// A value replayed by undo/redo.
    Transaction,
}

/// Describes one property change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyChange {
    pub object: ObjectId,
    pub name: String,
    pub origin: ChangeOrigin,
}

impl PropertyChange {
    pub fn new(object: ObjectId, name: impl Into<String>, origin: ChangeOrigin) -> Self {
        Self {
            object,
            name: name.into(),
            origin,
        }
    }
}

/// One renamed path reported through [`DocumentSignals::paths_renamed`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathRename {
    /// Object owning the rewritten reference.
    pub object: ObjectId,
    /// Property holding the reference.
    pub property: String,
    /// Old `Object.sub.path` text.
    pub old: String,
    /// New `Object.sub.path` text.
    pub new: String,
}

/// A subscription of one object to the changes of another.
///
/// Watches are owned by a hook (matched against [`DocumentHook::name`]) and
/// carry a topic so a hook can keep several independent subscriptions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Watch {
    pub watched: ObjectId,
    pub subscriber: ObjectId,
    pub owner: &'static str,
    pub topic: &'static str,
}

/// Extension entry points invoked by the document.
///
/// Every method has a no-op default. Hooks are called for every object, so
/// implementations check for their own extension state first.
pub trait DocumentHook: Send + Sync {
    /// Name used to route [`Watch`]es back to this hook.
    fn name(&self) -> &'static str;

    /// Validate a pending write. Returning an error rejects it and leaves
    /// the stored value untouched.
    fn property_changing(
        &self,
        _doc: &Document,
        _change: &PropertyChange,
        _value: &PropertyValue,
    ) -> CoreResult<()> {
        Ok(())
    }

    /// React to a stored change on the object itself.
    fn property_changed(&self, _doc: &mut Document, _change: &PropertyChange) -> CoreResult<()> {
        Ok(())
    }

    /// React to a change on a watched object.
    fn watched_changed(
        &self,
        _doc: &mut Document,
        _watch: &Watch,
        _change: &PropertyChange,
    ) -> CoreResult<()> {
        Ok(())
    }

    /// Clear every piece of state that refers to `object`, which is about
    /// to be removed.
    fn object_removing(&self, _doc: &mut Document, _object: ObjectId) -> CoreResult<()> {
        Ok(())
    }

    /// Rebuild extension state from stored properties after a restore or a
    /// duplication.
    fn object_loaded(&self, _doc: &mut Document, _object: ObjectId) -> CoreResult<()> {
        Ok(())
    }

    /// Recompute pass for `object`.
    fn execute(&self, _doc: &mut Document, _object: ObjectId) -> CoreResult<()> {
        Ok(())
    }
}

/// Document level notifications.
#[derive(Debug, Default)]
pub struct DocumentSignals {
    pub property_changed: Signal<PropertyChange>,
    pub label_changed: Signal<(ObjectId, String)>,
    pub object_removing: Signal<ObjectId>,
    pub paths_renamed: Signal<Vec<PathRename>>,
}

/// Serialized form of a document: objects, membership and property tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    objects: ObjectRegistry,
}

/// A document holding objects and the hooks that drive their extensions.
pub struct Document {
    registry: ObjectRegistry,
    hooks: Vec<Arc<dyn DocumentHook>>,
    watches: SlotMap<ConnectionId, Watch>,
    signals: DocumentSignals,
    params: LinkParams,
    restoring: bool,
    transacting: bool,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self::with_params(LinkParams::default())
    }

    /// Create an empty document using the given preferences.
    pub fn with_params(params: LinkParams) -> Self {
        Self {
            registry: ObjectRegistry::new(),
            hooks: Vec::new(),
            watches: SlotMap::with_key(),
            signals: DocumentSignals::default(),
            params,
            restoring: false,
            transacting: false,
        }
    }

    /// Build a document from a snapshot without any hooks installed.
    pub fn from_snapshot(snapshot: DocumentSnapshot, params: LinkParams) -> CoreResult<Self> {
        let mut doc = Self::with_params(params);
        doc.restore(snapshot)?;
        Ok(doc)
    }

    pub fn params(&self) -> &LinkParams {
        &self.params
    }

    pub fn signals(&self) -> &DocumentSignals {
        &self.signals
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// Install a hook. A hook with the same name replaces the previous one.
    pub fn install_hook(&mut self, hook: Arc<dyn DocumentHook>) {
        let name = hook.name();
        self.hooks.retain(|h| h.name() != name);
        tracing::debug!(target: "trellis_core::document", hook = name, "installed hook");
        self.hooks.push(hook);
    }

    pub fn has_hook(&self, name: &str) -> bool {
        self.hooks.iter().any(|h| h.name() == name)
    }

    // -----------------------------------------------------------------
    // Lifecycle flags
    // -----------------------------------------------------------------

    /// Whether a snapshot is currently being loaded.
    pub fn is_restoring(&self) -> bool {
        self.restoring
    }

    /// Whether undo/redo is replaying changes.
    pub fn is_transacting(&self) -> bool {
        self.transacting
    }

    /// Mark the start or end of an undo/redo replay.
    pub fn set_transacting(&mut self, transacting: bool) {
        self.transacting = transacting;
    }

    /// Run `f` as an undo/redo replay.
    pub fn with_transaction<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = std::mem::replace(&mut self.transacting, true);
        let result = f(self);
        self.transacting = previous;
        result
    }

    // -----------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------

    /// Add a new root object.
    pub fn add_object(&mut self, type_name: &str, name_hint: &str) -> ObjectId {
        self.registry.register(type_name, name_hint)
    }

    /// Add a new plain group.
    pub fn add_group(&mut self, name_hint: &str) -> ObjectId {
        self.registry.register_group("App::DocumentObjectGroup", name_hint)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.registry.contains(id)
    }

    pub fn object(&self, id: ObjectId) -> CoreResult<&ObjectData> {
        Ok(self.registry.get(id)?)
    }

    pub fn name(&self, id: ObjectId) -> CoreResult<&str> {
        Ok(self.registry.name(id)?)
    }

    pub fn label(&self, id: ObjectId) -> CoreResult<&str> {
        Ok(self.registry.label(id)?)
    }

    pub fn find_by_name(&self, name: &str) -> Option<ObjectId> {
        self.registry.find_by_name(name)
    }

    pub fn find_by_label(&self, label: &str) -> Option<ObjectId> {
        self.registry.find_by_label(label)
    }

    pub fn set_copyable(&mut self, id: ObjectId, copyable: bool) -> CoreResult<()> {
        Ok(self.registry.set_copyable(id, copyable)?)
    }

    /// Change the user label of an object.
    ///
    /// Emits `label_changed` and notifies watchers with a
    /// [`LABEL_PROPERTY`] change when the label actually changed.
    pub fn set_label(&mut self, id: ObjectId, label: impl Into<String>) -> CoreResult<bool> {
        let label = label.into();
        if !self.registry.set_label(id, label.clone())? {
            return Ok(false);
        }
        self.signals.label_changed.emit((id, label));
        self.dispatch(PropertyChange::new(id, LABEL_PROPERTY, ChangeOrigin::User))?;
        Ok(true)
    }

    /// Remove an object and all its members.
    ///
    /// Hooks see every removed id (members first) before anything is
    /// dropped, so extension state can be cleared while the objects still
    /// resolve. Removing an id that is already gone is a no-op.
    #[tracing::instrument(skip(self), target = "trellis_core::document", level = "debug")]
    pub fn remove_object(&mut self, id: ObjectId) -> CoreResult<()> {
        if !self.registry.contains(id) {
            return Ok(());
        }
        let mut doomed = self.registry.collect_descendants(id)?;
        doomed.push(id);
        let parent = self.registry.parent(id)?;

        for &object in &doomed {
            if !self.registry.contains(object) {
                continue;
            }
            for hook in self.hooks.clone() {
                hook.object_removing(self, object)?;
            }
            self.signals.object_removing.emit(object);
        }

        if !self.registry.contains(id) {
            // A hook already removed it as part of its own cleanup.
            self.drop_dangling_watches();
            return Ok(());
        }
        let removed = self.registry.destroy(id)?;
        self.drop_dangling_watches();
        tracing::debug!(target: "trellis_core::document", removed = removed.len(), "removed objects");

        if let Some(parent) = parent
            && self.registry.contains(parent)
        {
            self.dispatch(PropertyChange::new(parent, GROUP_PROPERTY, ChangeOrigin::Internal))?;
        }
        Ok(())
    }

    fn drop_dangling_watches(&mut self) {
        let registry = &self.registry;
        self.watches
            .retain(|_, w| registry.contains(w.watched) && registry.contains(w.subscriber));
    }

    // -----------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------

    /// Make `member` a member of `group`, at `index` or appended.
    pub fn add_to_group(
        &mut self,
        group: ObjectId,
        member: ObjectId,
        index: Option<usize>,
    ) -> CoreResult<()> {
        let old_parent = self.registry.parent(member)?;
        self.registry.set_parent(member, Some(group), index)?;
        if let Some(old) = old_parent
            && old != group
        {
            self.dispatch(PropertyChange::new(old, GROUP_PROPERTY, ChangeOrigin::User))?;
        }
        self.dispatch(PropertyChange::new(group, GROUP_PROPERTY, ChangeOrigin::User))
    }

    /// Detach `member` from its group, making it a root object.
    pub fn remove_from_group(&mut self, member: ObjectId) -> CoreResult<()> {
        let Some(old) = self.registry.parent(member)? else {
            return Ok(());
        };
        self.registry.set_parent(member, None, None)?;
        self.dispatch(PropertyChange::new(old, GROUP_PROPERTY, ChangeOrigin::User))
    }

    /// Members of a group, in order.
    pub fn members(&self, group: ObjectId) -> CoreResult<&[ObjectId]> {
        Ok(self.registry.children(group)?)
    }

    pub fn group_of(&self, id: ObjectId) -> CoreResult<Option<ObjectId>> {
        Ok(self.registry.parent(id)?)
    }

    // -----------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------

    pub fn add_property(
        &mut self,
        id: ObjectId,
        name: impl Into<String>,
        cell: PropertyCell,
    ) -> CoreResult<()> {
        Ok(self.registry.add_property(id, name, cell)?)
    }

    /// Add a property unless it already exists. Returns whether it was added.
    pub fn ensure_property(
        &mut self,
        id: ObjectId,
        name: &str,
        cell: impl FnOnce() -> PropertyCell,
    ) -> CoreResult<bool> {
        if self.has_property(id, name) {
            return Ok(false);
        }
        self.registry.add_property(id, name, cell())?;
        Ok(true)
    }

    pub fn remove_property(&mut self, id: ObjectId, name: &str) -> CoreResult<Option<PropertyCell>> {
        Ok(self.registry.remove_property(id, name)?)
    }

    pub fn has_property(&self, id: ObjectId, name: &str) -> bool {
        self.registry
            .get(id)
            .is_ok_and(|data| data.property(name).is_some())
    }

    pub fn property_cell(&self, id: ObjectId, name: &str) -> CoreResult<&PropertyCell> {
        self.registry
            .get(id)?
            .property(name)
            .ok_or_else(|| PropertyError::NotFound { name: name.to_string() }.into())
    }

    pub fn property(&self, id: ObjectId, name: &str) -> CoreResult<&PropertyValue> {
        self.property_cell(id, name).map(PropertyCell::value)
    }

    /// Edit the status bits of a property. Status edits do not notify.
    pub fn set_property_status(
        &mut self,
        id: ObjectId,
        name: &str,
        edit: impl FnOnce(&mut PropertyStatus),
    ) -> CoreResult<()> {
        let cell = self
            .registry
            .get_mut(id)?
            .property_mut(name)
            .ok_or_else(|| PropertyError::NotFound { name: name.to_string() })?;
        edit(&mut cell.status);
        Ok(())
    }

    /// Write a property as a user edit.
    pub fn set_property(&mut self, id: ObjectId, name: &str, value: PropertyValue) -> CoreResult<bool> {
        self.set_property_as(id, name, value, ChangeOrigin::User)
    }

    /// Write a property on behalf of `origin`.
    ///
    /// Returns `Ok(false)` when the value was already equal. See the module
    /// docs for the notification order.
    #[tracing::instrument(skip(self, value), target = "trellis_core::document", level = "trace")]
    pub fn set_property_as(
        &mut self,
        id: ObjectId,
        name: &str,
        value: PropertyValue,
        origin: ChangeOrigin,
    ) -> CoreResult<bool> {
        let cell = self.property_cell(id, name)?;
        if origin == ChangeOrigin::User {
            cell.check_write(name, &value)?;
        } else if cell.kind() != value.kind() {
            return Err(PropertyError::TypeMismatch {
                name: name.to_string(),
                expected: cell.kind().name(),
                got: value.kind().name(),
            }
            .into());
        }
        if *cell.value() == value {
            return Ok(false);
        }

        let change = PropertyChange::new(id, name, origin);
        if !self.restoring {
            for hook in &self.hooks {
                hook.property_changing(self, &change, &value)?;
            }
        }

        self.registry
            .get_mut(id)?
            .property_mut(name)
            .ok_or_else(|| PropertyError::NotFound { name: name.to_string() })?
            .replace(value);
        tracing::trace!(target: "trellis_core::property", object = ?id, name, ?origin, "property changed");

        self.signals.property_changed.emit(change.clone());
        self.dispatch(change)?;
        Ok(true)
    }

    /// Run hook and watch handlers for a change that has already been stored.
    fn dispatch(&mut self, change: PropertyChange) -> CoreResult<()> {
        if self.restoring {
            return Ok(());
        }
        for hook in self.hooks.clone() {
            if !self.registry.contains(change.object) {
                return Ok(());
            }
            hook.property_changed(self, &change)?;
        }

        let pending: Vec<ConnectionId> = self
            .watches
            .iter()
            .filter(|(_, w)| w.watched == change.object)
            .map(|(id, _)| id)
            .collect();
        for watch_id in pending {
            let Some(watch) = self.watches.get(watch_id).cloned() else {
                continue;
            };
            if !self.registry.contains(watch.subscriber) {
                continue;
            }
            if let Some(hook) = self.hooks.iter().find(|h| h.name() == watch.owner).cloned() {
                hook.watched_changed(self, &watch, &change)?;
            }
        }
        Ok(())
    }

    /// Objects referenced through structural (non-hidden) link properties.
    pub fn dependencies(&self, id: ObjectId) -> CoreResult<Vec<ObjectId>> {
        let data = self.registry.get(id)?;
        let mut out = Vec::new();
        for (_, cell) in data.properties() {
            if cell.status.scope == LinkScope::Hidden {
                continue;
            }
            for dep in cell.value().referenced_objects() {
                if dep != id && self.registry.contains(dep) && !out.contains(&dep) {
                    out.push(dep);
                }
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Extensions
    // -----------------------------------------------------------------

    pub fn set_extension<T: Any + Send + Sync>(&mut self, id: ObjectId, state: T) -> CoreResult<()> {
        Ok(self.registry.set_extension(id, state)?)
    }

    pub fn extension<T: Any>(&self, id: ObjectId) -> Option<&T> {
        self.registry.extension::<T>(id).ok().flatten()
    }

    pub fn extension_mut<T: Any>(&mut self, id: ObjectId) -> Option<&mut T> {
        self.registry.extension_mut::<T>(id).ok().flatten()
    }

    /// Borrow extension state, failing when the object lacks it.
    pub fn require_extension<T: Any>(&self, id: ObjectId) -> CoreResult<&T> {
        self.registry.extension::<T>(id)?.ok_or_else(|| {
            ObjectError::MissingExtension {
                extension: std::any::type_name::<T>(),
            }
            .into()
        })
    }

    /// Mutable variant of [`require_extension`](Self::require_extension).
    pub fn require_extension_mut<T: Any>(&mut self, id: ObjectId) -> CoreResult<&mut T> {
        self.registry.extension_mut::<T>(id)?.ok_or_else(|| {
            ObjectError::MissingExtension {
                extension: std::any::type_name::<T>(),
            }
            .into()
        })
    }

    pub fn remove_extension<T: Any>(&mut self, id: ObjectId) -> Option<Box<T>> {
        self.registry.remove_extension::<T>(id).ok().flatten()
    }

    pub fn has_extension<T: Any>(&self, id: ObjectId) -> bool {
        self.registry.has_extension::<T>(id)
    }

    // -----------------------------------------------------------------
    // Watches
    // -----------------------------------------------------------------

    /// Subscribe `subscriber` to changes of `watched`. Changes are delivered
    /// to the hook named `owner`.
    pub fn watch(
        &mut self,
        watched: ObjectId,
        subscriber: ObjectId,
        owner: &'static str,
        topic: &'static str,
    ) -> ConnectionId {
        self.watches.insert(Watch {
            watched,
            subscriber,
            owner,
            topic,
        })
    }

    pub fn unwatch(&mut self, id: ConnectionId) -> bool {
        self.watches.remove(id).is_some()
    }

    pub fn is_watching(&self, id: ConnectionId) -> bool {
        self.watches.contains_key(id)
    }

    /// Watches held by a subscriber.
    pub fn watches_of(&self, subscriber: ObjectId) -> Vec<(ConnectionId, Watch)> {
        self.watches
            .iter()
            .filter(|(_, w)| w.subscriber == subscriber)
            .map(|(id, w)| (id, w.clone()))
            .collect()
    }

    // -----------------------------------------------------------------
    // Recompute
    // -----------------------------------------------------------------

    /// Recompute one object. Any hook failure becomes
    /// [`CoreError::Recompute`].
    pub fn recompute(&mut self, id: ObjectId) -> CoreResult<()> {
        self.registry.get(id)?;
        for hook in self.hooks.clone() {
            hook.execute(self, id).map_err(|err| match err {
                CoreError::Recompute { .. } => err,
                other => CoreError::Recompute {
                    object: id,
                    message: other.to_string(),
                },
            })?;
        }
        Ok(())
    }

    /// Recompute every object, dependencies first.
    pub fn recompute_all(&mut self) -> CoreResult<()> {
        for id in self.dependency_order()? {
            if self.registry.contains(id) {
                self.recompute(id)?;
            }
        }
        Ok(())
    }

    /// All objects ordered so that each follows its dependencies. Cycles are
    /// broken arbitrarily.
    pub fn dependency_order(&self) -> CoreResult<Vec<ObjectId>> {
        fn visit(
            doc: &Document,
            id: ObjectId,
            seen: &mut HashSet<ObjectId>,
            out: &mut Vec<ObjectId>,
        ) -> CoreResult<()> {
            if !seen.insert(id) {
                return Ok(());
            }
            for dep in doc.dependencies(id)? {
                visit(doc, dep, seen, out)?;
            }
            out.push(id);
            Ok(())
        }

        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(self.registry.object_count());
        for id in self.registry.ids().collect::<Vec<_>>() {
            visit(self, id, &mut seen, &mut out)?;
        }
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Duplication and snapshots
    // -----------------------------------------------------------------

    /// Deep copy an object and its members.
    ///
    /// References between copied objects are rewired to the copies. The copy
    /// is a root object; extension state is rebuilt through the hooks'
    /// `object_loaded`.
    pub fn duplicate_object(&mut self, id: ObjectId) -> CoreResult<ObjectId> {
        let mut originals = vec![id];
        originals.extend(self.registry.depth_first_preorder(id)?);
        for &original in &originals {
            if !self.registry.get(original)?.is_copyable() {
                return Err(ObjectError::NotCopyable.into());
            }
        }

        let mut map: HashMap<ObjectId, ObjectId> = HashMap::new();
        for &original in &originals {
            let data = self.registry.get(original)?.clone();
            let copy = self.registry.register(data.type_name(), data.name());
            self.registry.set_label(copy, data.label().to_string())?;
            self.registry.set_group(copy, data.is_group())?;
            for (name, cell) in data.properties() {
                self.registry.add_property(copy, name, cell.clone())?;
            }
            map.insert(original, copy);
        }

        for &original in &originals {
            let copy = map[&original];
            if original != id
                && let Some(parent) = self.registry.parent(original)?
                && let Some(&parent_copy) = map.get(&parent)
            {
                self.registry.set_parent(copy, Some(parent_copy), None)?;
            }
            let data = self.registry.get_mut(copy)?;
            let names: Vec<String> = data.properties().map(|(n, _)| n.to_string()).collect();
            for name in names {
                if let Some(cell) = data.property_mut(&name) {
                    cell.value_mut()
                        .remap_objects(|target| map.get(&target).copied().unwrap_or(target));
                }
            }
        }

        let copies: Vec<ObjectId> = originals.iter().map(|o| map[o]).collect();
        for &copy in &copies {
            for hook in self.hooks.clone() {
                hook.object_loaded(self, copy)?;
            }
        }
        let copy = map[&id];
        tracing::debug!(target: "trellis_core::document", source = ?id, ?copy, count = copies.len(), "duplicated object");
        Ok(copy)
    }

    /// Capture the persistent state of the document.
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            objects: self.registry.clone(),
        }
    }

    /// Replace the document content with a snapshot.
    ///
    /// Watches are dropped. Property changes made by hooks while the
    /// restoring flag is set do not run change handlers.
    pub fn restore(&mut self, snapshot: DocumentSnapshot) -> CoreResult<()> {
        self.registry = snapshot.objects;
        self.watches.clear();
        self.restoring = true;
        let result = self.load_all();
        self.restoring = false;
        result?;
        tracing::debug!(target: "trellis_core::document", objects = self.registry.object_count(), "restored document");
        Ok(())
    }

    fn load_all(&mut self) -> CoreResult<()> {
        for id in self.registry.ids().collect::<Vec<_>>() {
            for hook in self.hooks.clone() {
                if self.registry.contains(id) {
                    hook.object_loaded(self, id)?;
                }
            }
        }
        Ok(())
    }

    /// Report renamed reference paths to expression/automation layers.
    pub fn emit_renames(&self, renames: Vec<PathRename>) {
        if !renames.is_empty() {
            self.signals.paths_renamed.emit(renames);
        }
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("objects", &self.registry.object_count())
            .field("hooks", &self.hooks.iter().map(|h| h.name()).collect::<Vec<_>>())
            .field("watches", &self.watches.len())
            .field("restoring", &self.restoring)
            .field("transacting", &self.transacting)
            .finish()
    }
}

static_assertions::assert_impl_all!(Document: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        changed: Mutex<Vec<(ObjectId, String, ChangeOrigin)>>,
        watched: Mutex<Vec<(&'static str, String)>>,
        removing: Mutex<Vec<ObjectId>>,
    }

    impl DocumentHook for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn property_changing(
            &self,
            _doc: &Document,
            change: &PropertyChange,
            value: &PropertyValue,
        ) -> CoreResult<()> {
            if change.name == "Count" && value.as_int().is_some_and(|v| v < 0) {
                return Err(CoreError::Config("negative".into()));
            }
            Ok(())
        }

        fn property_changed(&self, _doc: &mut Document, change: &PropertyChange) -> CoreResult<()> {
            self.changed
                .lock()
                .push((change.object, change.name.clone(), change.origin));
            Ok(())
        }

        fn watched_changed(
            &self,
            _doc: &mut Document,
            watch: &Watch,
            change: &PropertyChange,
        ) -> CoreResult<()> {
            self.watched.lock().push((watch.topic, change.name.clone()));
            Ok(())
        }

        fn object_removing(&self, doc: &mut Document, object: ObjectId) -> CoreResult<()> {
            assert!(doc.contains(object));
            self.removing.lock().push(object);
            Ok(())
        }
    }

    fn doc_with_recorder() -> (Document, Arc<Recorder>) {
        let mut doc = Document::new();
        let recorder = Arc::new(Recorder::default());
        doc.install_hook(recorder.clone());
        (doc, recorder)
    }

    #[test]
    fn test_set_property_notifies_once() {
        let (mut doc, recorder) = doc_with_recorder();
        let obj = doc.add_object("App::Feature", "Feature");
        doc.add_property(obj, "Count", PropertyCell::new(PropertyValue::Int(1)))
            .unwrap();

        assert!(doc.set_property(obj, "Count", PropertyValue::Int(2)).unwrap());
        assert!(!doc.set_property(obj, "Count", PropertyValue::Int(2)).unwrap());
        assert_eq!(recorder.changed.lock().len(), 1);
        assert_eq!(doc.property(obj, "Count").unwrap(), &PropertyValue::Int(2));
    }

    #[test]
    fn test_veto_leaves_value_unchanged() {
        let (mut doc, recorder) = doc_with_recorder();
        let obj = doc.add_object("App::Feature", "Feature");
        doc.add_property(obj, "Count", PropertyCell::new(PropertyValue::Int(1)))
            .unwrap();

        assert!(doc.set_property(obj, "Count", PropertyValue::Int(-1)).is_err());
        assert_eq!(doc.property(obj, "Count").unwrap(), &PropertyValue::Int(1));
        assert!(recorder.changed.lock().is_empty());
    }

    #[test]
    fn test_lock_applies_to_user_writes_only() {
        let (mut doc, _) = doc_with_recorder();
        let obj = doc.add_object("App::Feature", "Feature");
        doc.add_property(obj, "Scale", PropertyCell::new(PropertyValue::Float(1.0)))
            .unwrap();
        doc.set_property_status(obj, "Scale", |s| s.lock = crate::property::EditLock::ReadOnly)
            .unwrap();

        assert!(matches!(
            doc.set_property(obj, "Scale", PropertyValue::Float(2.0)),
            Err(CoreError::Property(PropertyError::ReadOnly { .. }))
        ));
        assert!(doc
            .set_property_as(obj, "Scale", PropertyValue::Float(2.0), ChangeOrigin::Internal)
            .unwrap());
    }

    #[test]
    fn test_watch_delivery_and_removal() {
        let (mut doc, recorder) = doc_with_recorder();
        let source = doc.add_object("App::Feature", "Source");
        let observer = doc.add_object("App::Feature", "Observer");
        doc.add_property(source, "Length", PropertyCell::new(PropertyValue::Float(1.0)))
            .unwrap();
        let watch = doc.watch(source, observer, "recorder", "source");

        doc.set_property(source, "Length", PropertyValue::Float(3.0))
            .unwrap();
        assert_eq!(*recorder.watched.lock(), vec![("source", "Length".to_string())]);

        doc.remove_object(observer).unwrap();
        assert!(!doc.is_watching(watch));
        assert_eq!(*recorder.removing.lock(), vec![observer]);
    }

    #[test]
    fn test_group_membership_notifies_group() {
        let (mut doc, recorder) = doc_with_recorder();
        let group = doc.add_group("Group");
        let member = doc.add_object("Part::Box", "Box");
        doc.add_to_group(group, member, None).unwrap();
        assert_eq!(doc.members(group).unwrap(), &[member]);
        assert!(recorder
            .changed
            .lock()
            .iter()
            .any(|(id, name, _)| *id == group && name == GROUP_PROPERTY));

        doc.remove_object(group).unwrap();
        assert!(!doc.contains(member));
        assert_eq!(*recorder.removing.lock(), vec![member, group]);
    }

    #[test]
    fn test_label_change_signal() {
        let (mut doc, _) = doc_with_recorder();
        let obj = doc.add_object("App::Feature", "Feature");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        doc.signals().label_changed.connect(move |(_, label)| {
            seen_clone.lock().push(label.clone());
        });

        assert!(doc.set_label(obj, "Bracket").unwrap());
        assert!(!doc.set_label(obj, "Bracket").unwrap());
        assert_eq!(*seen.lock(), vec!["Bracket".to_string()]);
        assert_eq!(doc.find_by_label("Bracket"), Some(obj));
    }

    #[test]
    fn test_duplicate_rewires_internal_links() {
        let mut doc = Document::new();
        let group = doc.add_group("Group");
        let a = doc.add_object("Part::Box", "Box");
        let b = doc.add_object("Part::Feature", "Ref");
        doc.add_to_group(group, a, None).unwrap();
        doc.add_to_group(group, b, None).unwrap();
        doc.add_property(b, "Target", PropertyCell::new(PropertyValue::Link(Some(a))))
            .unwrap();

        let copy = doc.duplicate_object(group).unwrap();
        let members = doc.members(copy).unwrap().to_vec();
        assert_eq!(members.len(), 2);
        assert_eq!(
            doc.property(members[1], "Target").unwrap().as_link(),
            Some(members[0])
        );
        assert!(doc.object(copy).unwrap().is_group());
    }

    #[test]
    fn test_duplicate_not_copyable() {
        let mut doc = Document::new();
        let obj = doc.add_object("Part::Imported", "Import");
        doc.set_copyable(obj, false).unwrap();
        assert!(matches!(
            doc.duplicate_object(obj),
            Err(CoreError::Object(ObjectError::NotCopyable))
        ));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut doc = Document::new();
        let group = doc.add_group("Group");
        let member = doc.add_object("Part::Box", "Box");
        doc.add_to_group(group, member, None).unwrap();
        doc.add_property(member, "Length", PropertyCell::new(PropertyValue::Float(4.0)))
            .unwrap();
        doc.set_label(member, "Cube").unwrap();

        let json = serde_json::to_string(&doc.snapshot()).unwrap();
        let snapshot: DocumentSnapshot = serde_json::from_str(&json).unwrap();
        let restored = Document::from_snapshot(snapshot, LinkParams::default()).unwrap();

        assert_eq!(restored.members(group).unwrap(), &[member]);
        assert_eq!(restored.label(member).unwrap(), "Cube");
        assert_eq!(
            restored.property(member, "Length").unwrap(),
            &PropertyValue::Float(4.0)
        );
        assert!(!restored.is_restoring());
    }

    #[test]
    fn test_dependency_order() {
        let mut doc = Document::new();
        let top = doc.add_object("App::Link", "Link");
        let base = doc.add_object("Part::Box", "Box");
        doc.add_property(top, "LinkedObject", PropertyCell::new(PropertyValue::Link(Some(base))))
            .unwrap();
        let order = doc.dependency_order().unwrap();
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(base) < pos(top));
    }

    #[test]
    fn test_transaction_flag_scoped() {
        let mut doc = Document::new();
        let inside = doc.with_transaction(|d| d.is_transacting());
        assert!(inside);
        assert!(!doc.is_transacting());
    }
}
