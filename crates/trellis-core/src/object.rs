//! Document object table.
//!
//! Provides the storage behind a [`Document`](crate::Document):
//! - Stable generational identifiers via arena-based storage
//! - Unique internal names plus free-form user labels
//! - Group membership (parent/children) with cascading removal
//! - Per-object property tables and type-erased extension state
//!
//! # Key Types
//!
//! - [`ObjectId`] - Unique stable identifier for each object
//! - [`ObjectRegistry`] - The arena managing all objects of one document
//! - [`ObjectData`] - The record stored per object

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};

use crate::property::{PropertyCell, PropertyError};

new_key_type! {
    /// A unique identifier for an object in a document.
    ///
    /// `ObjectId`s are generational: once the object is removed, the id never
    /// resolves again, even if the slot is reused. Extensions rely on this to
    /// detect dangling references without scrubbing them eagerly.
    pub struct ObjectId;
}

impl ObjectId {
    /// Convert the ObjectId to a raw u64 value.
    #[inline]
    pub fn as_raw(self) -> u64 {
        use slotmap::Key;
        self.data().as_ffi()
    }

    /// Create an ObjectId from a raw u64 value.
    ///
    /// This does not check that the id exists in any document.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self::from(slotmap::KeyData::from_ffi(raw))
    }
}

/// Errors that can occur during object operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectError {
    /// The object ID is invalid or has been removed.
    InvalidObjectId,
    /// Attempted to put a group inside itself or one of its members.
    CircularGroup,
    /// The object type does not support duplication.
    NotCopyable,
    /// The object has no state block for the requested extension.
    MissingExtension {
        /// Type name of the missing extension.
        extension: &'static str,
    },
    /// A property-level failure.
    Property(PropertyError),
}

impl fmt::Display for ObjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidObjectId => write!(f, "Invalid or removed object ID"),
            Self::CircularGroup => {
                write!(f, "Cannot place a group inside itself or one of its members")
            }
            Self::NotCopyable => write!(f, "Object does not support duplication"),
            Self::MissingExtension { extension } => {
                write!(f, "Object has no '{extension}' extension")
            }
            Self::Property(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ObjectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Property(err) => Some(err),
            _ => None,
        }
    }
}

impl From<PropertyError> for ObjectError {
    fn from(err: PropertyError) -> Self {
        Self::Property(err)
    }
}

/// Result type for object operations.
pub type ObjectResult<T> = std::result::Result<T, ObjectError>;

type ExtensionStore = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

/// The record stored in the registry for each object.
#[derive(Serialize, Deserialize)]
pub struct ObjectData {
    /// Unique internal name.
    name: String,
    /// User visible label.
    label: String,
    /// Type name of the object (for example `App::Link`).
    type_name: String,
    /// Whether this object is a plain group whose members may be flattened.
    is_group: bool,
    /// Whether the object supports duplication.
    copyable: bool,
    /// Owning group (if any).
    parent: Option<ObjectId>,
    /// Owned members, in order.
    children: Vec<ObjectId>,
    /// Property table.
    properties: BTreeMap<String, PropertyCell>,
    /// Extension state, one block per extension type. Not serialized;
    /// rebuilt on restore.
    #[serde(skip)]
    extensions: ExtensionStore,
}

impl ObjectData {
    fn new(name: String, type_name: String) -> Self {
        Self {
            label: name.clone(),
            name,
            type_name,
            is_group: false,
            copyable: true,
            parent: None,
            children: Vec::new(),
            properties: BTreeMap::new(),
            extensions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_group(&self) -> bool {
        self.is_group
    }

    pub fn is_copyable(&self) -> bool {
        self.copyable
    }

    pub fn parent(&self) -> Option<ObjectId> {
        self.parent
    }

    pub fn children(&self) -> &[ObjectId] {
        &self.children
    }

    pub fn property(&self, name: &str) -> Option<&PropertyCell> {
        self.properties.get(name)
    }

    pub(crate) fn property_mut(&mut self, name: &str) -> Option<&mut PropertyCell> {
        self.properties.get_mut(name)
    }

    /// Iterate over property names and cells in name order.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &PropertyCell)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Clone for ObjectData {
    /// Copies the persistent record. Extension state is not cloned.
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            label: self.label.clone(),
            type_name: self.type_name.clone(),
            is_group: self.is_group,
            copyable: self.copyable,
            parent: self.parent,
            children: self.children.clone(),
            properties: self.properties.clone(),
            extensions: HashMap::new(),
        }
    }
}

impl fmt::Debug for ObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectData")
            .field("name", &self.name)
            .field("label", &self.label)
            .field("type_name", &self.type_name)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

/// The arena that manages all objects of one document and their group
/// relationships.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ObjectRegistry {
    objects: SlotMap<ObjectId, ObjectData>,
}

impl ObjectRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            objects: SlotMap::with_key(),
        }
    }

    /// Register a new object and return its ID.
    ///
    /// The internal name is derived from `name_hint`, with a numeric suffix
    /// (`Link`, `Link001`, `Link002`, ...) when the hint is already taken.
    pub fn register(&mut self, type_name: &str, name_hint: &str) -> ObjectId {
        let name = self.unique_name(name_hint);
        let id = self
            .objects
            .insert(ObjectData::new(name, type_name.to_string()));
        tracing::trace!(target: "trellis_core::object", ?id, type_name, "registered object");
        id
    }

    /// Register a plain group object.
    pub fn register_group(&mut self, type_name: &str, name_hint: &str) -> ObjectId {
        let mut data = ObjectData::new(self.unique_name(name_hint), type_name.to_string());
        data.is_group = true;
        let id = self.objects.insert(data);
        tracing::trace!(target: "trellis_core::object", ?id, type_name, "registered group");
        id
    }

    fn unique_name(&self, hint: &str) -> String {
        let base = if hint.is_empty() { "Object" } else { hint };
        if self.find_by_name(base).is_none() {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{base}{n:03}"))
            .find(|candidate| self.find_by_name(candidate).is_none())
            .unwrap_or_else(|| base.to_string())
    }

    /// Remove an object and all its members from the registry.
    ///
    /// Returns the removed ids, members before their group.
    pub fn destroy(&mut self, id: ObjectId) -> ObjectResult<Vec<ObjectId>> {
        let mut removed = self.collect_descendants(id)?;
        tracing::trace!(target: "trellis_core::object", ?id, descendant_count = removed.len(), "destroying object tree");

        if let Some(parent_id) = self.objects.get(id).and_then(|d| d.parent)
            && let Some(parent_data) = self.objects.get_mut(parent_id)
        {
            parent_data.children.retain(|&child| child != id);
        }

        for &child_id in &removed {
            self.objects.remove(child_id);
        }
        self.objects.remove(id);
        removed.push(id);
        Ok(removed)
    }

    /// Collect all descendant IDs in depth-first order (members before groups).
    pub fn collect_descendants(&self, id: ObjectId) -> ObjectResult<Vec<ObjectId>> {
        let mut result = Vec::new();
        self.collect_descendants_recursive(id, &mut result)?;
        Ok(result)
    }

    fn collect_descendants_recursive(
        &self,
        id: ObjectId,
        result: &mut Vec<ObjectId>,
    ) -> ObjectResult<()> {
        let data = self.objects.get(id).ok_or(ObjectError::InvalidObjectId)?;
        for &child_id in &data.children {
            self.collect_descendants_recursive(child_id, result)?;
            result.push(child_id);
        }
        Ok(())
    }

    /// Check if an object exists.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn get(&self, id: ObjectId) -> ObjectResult<&ObjectData> {
        self.objects.get(id).ok_or(ObjectError::InvalidObjectId)
    }

    pub(crate) fn get_mut(&mut self, id: ObjectId) -> ObjectResult<&mut ObjectData> {
        self.objects.get_mut(id).ok_or(ObjectError::InvalidObjectId)
    }

    /// Mark an object as a plain group (or clear the flag).
    pub fn set_group(&mut self, id: ObjectId, is_group: bool) -> ObjectResult<()> {
        self.get_mut(id).map(|d| d.is_group = is_group)
    }

    /// Allow or forbid duplicating an object.
    pub fn set_copyable(&mut self, id: ObjectId, copyable: bool) -> ObjectResult<()> {
        self.get_mut(id).map(|d| d.copyable = copyable)
    }

    /// Set the owning group of an object.
    ///
    /// Passing `None` makes the object a root object. Inserting at `index`
    /// keeps member order meaningful; `None` appends.
    pub fn set_parent(
        &mut self,
        id: ObjectId,
        new_parent: Option<ObjectId>,
        index: Option<usize>,
    ) -> ObjectResult<()> {
        if !self.objects.contains_key(id) {
            return Err(ObjectError::InvalidObjectId);
        }

        if let Some(parent_id) = new_parent {
            if !self.objects.contains_key(parent_id) {
                return Err(ObjectError::InvalidObjectId);
            }
            if self.is_ancestor_of(id, parent_id) {
                return Err(ObjectError::CircularGroup);
            }
        }

        let old_parent = self.objects.get(id).and_then(|d| d.parent);
        if let Some(old_parent_id) = old_parent
            && let Some(parent_data) = self.objects.get_mut(old_parent_id)
        {
            parent_data.children.retain(|&child| child != id);
        }

        if let Some(data) = self.objects.get_mut(id) {
            data.parent = new_parent;
        }

        if let Some(parent_id) = new_parent
            && let Some(parent_data) = self.objects.get_mut(parent_id)
        {
            let at = index.unwrap_or(parent_data.children.len()).min(parent_data.children.len());
            parent_data.children.insert(at, id);
        }

        Ok(())
    }

    /// Check if `potential_ancestor` is `id` or one of its owning groups.
    pub fn is_ancestor_of(&self, potential_ancestor: ObjectId, id: ObjectId) -> bool {
        let mut current = Some(id);
        while let Some(current_id) = current {
            if current_id == potential_ancestor {
                return true;
            }
            current = self.objects.get(current_id).and_then(|d| d.parent);
        }
        false
    }

    pub fn parent(&self, id: ObjectId) -> ObjectResult<Option<ObjectId>> {
        self.get(id).map(|d| d.parent)
    }

    pub fn children(&self, id: ObjectId) -> ObjectResult<&[ObjectId]> {
        self.get(id).map(|d| d.children.as_slice())
    }

    pub fn name(&self, id: ObjectId) -> ObjectResult<&str> {
        self.get(id).map(|d| d.name.as_str())
    }

    pub fn label(&self, id: ObjectId) -> ObjectResult<&str> {
        self.get(id).map(|d| d.label.as_str())
    }

    pub(crate) fn set_label(&mut self, id: ObjectId, label: String) -> ObjectResult<bool> {
        let data = self.get_mut(id)?;
        if data.label == label {
            return Ok(false);
        }
        data.label = label;
        Ok(true)
    }

    /// Find an object by its internal name.
    pub fn find_by_name(&self, name: &str) -> Option<ObjectId> {
        self.objects
            .iter()
            .find(|(_, data)| data.name == name)
            .map(|(id, _)| id)
    }

    /// Find the first object carrying a label.
    pub fn find_by_label(&self, label: &str) -> Option<ObjectId> {
        self.objects
            .iter()
            .find(|(_, data)| data.label == label)
            .map(|(id, _)| id)
    }

    /// Get all owning groups, nearest first.
    pub fn ancestors(&self, id: ObjectId) -> ObjectResult<Vec<ObjectId>> {
        let mut result = Vec::new();
        let mut current = self.parent(id)?;
        while let Some(parent_id) = current {
            result.push(parent_id);
            current = self.objects.get(parent_id).and_then(|d| d.parent);
        }
        Ok(result)
    }

    /// Members in depth-first pre-order (groups before their members),
    /// excluding `id` itself.
    pub fn depth_first_preorder(&self, id: ObjectId) -> ObjectResult<Vec<ObjectId>> {
        let mut result = Vec::new();
        self.preorder_recursive(id, &mut result)?;
        Ok(result)
    }

    fn preorder_recursive(&self, id: ObjectId, result: &mut Vec<ObjectId>) -> ObjectResult<()> {
        for &child_id in self.children(id)? {
            result.push(child_id);
            self.preorder_recursive(child_id, result)?;
        }
        Ok(())
    }

    /// Add a property cell to an object.
    pub fn add_property(
        &mut self,
        id: ObjectId,
        name: impl Into<String>,
        cell: PropertyCell,
    ) -> ObjectResult<()> {
        let name = name.into();
        let data = self.get_mut(id)?;
        if data.properties.contains_key(&name) {
            return Err(PropertyError::AlreadyExists { name }.into());
        }
        data.properties.insert(name, cell);
        Ok(())
    }

    /// Remove a property cell from an object.
    pub fn remove_property(&mut self, id: ObjectId, name: &str) -> ObjectResult<Option<PropertyCell>> {
        Ok(self.get_mut(id)?.properties.remove(name))
    }

    /// Store extension state on an object, replacing any previous block of
    /// the same type.
    pub fn set_extension<T: Any + Send + Sync>(&mut self, id: ObjectId, state: T) -> ObjectResult<()> {
        self.get_mut(id)?
            .extensions
            .insert(TypeId::of::<T>(), Box::new(state));
        Ok(())
    }

    /// Borrow extension state.
    pub fn extension<T: Any>(&self, id: ObjectId) -> ObjectResult<Option<&T>> {
        Ok(self
            .get(id)?
            .extensions
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>()))
    }

    /// Mutably borrow extension state.
    pub fn extension_mut<T: Any>(&mut self, id: ObjectId) -> ObjectResult<Option<&mut T>> {
        Ok(self
            .get_mut(id)?
            .extensions
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.downcast_mut::<T>()))
    }

    /// Remove extension state.
    pub fn remove_extension<T: Any>(&mut self, id: ObjectId) -> ObjectResult<Option<Box<T>>> {
        Ok(self
            .get_mut(id)?
            .extensions
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok()))
    }

    /// Whether an object carries a given extension.
    pub fn has_extension<T: Any>(&self, id: ObjectId) -> bool {
        self.objects
            .get(id)
            .is_some_and(|d| d.extensions.contains_key(&TypeId::of::<T>()))
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Iterate over all object ids.
    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys()
    }

    /// Iterate over all root objects (objects without an owning group).
    pub fn root_objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects
            .iter()
            .filter(|(_, data)| data.parent.is_none())
            .map(|(id, _)| id)
    }
}

impl fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("object_count", &self.objects.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyValue;

    #[test]
    fn test_unique_names() {
        let mut reg = ObjectRegistry::new();
        let a = reg.register("App::Link", "Link");
        let b = reg.register("App::Link", "Link");
        let c = reg.register("App::Link", "Link");
        assert_eq!(reg.name(a).unwrap(), "Link");
        assert_eq!(reg.name(b).unwrap(), "Link001");
        assert_eq!(reg.name(c).unwrap(), "Link002");
        assert_eq!(reg.label(b).unwrap(), "Link001");
    }

    #[test]
    fn test_register_group() {
        let mut reg = ObjectRegistry::new();
        let group = reg.register_group("App::DocumentObjectGroup", "Group");
        let plain = reg.register("Part::Box", "Box");
        assert!(reg.get(group).unwrap().is_group());
        assert!(!reg.get(plain).unwrap().is_group());
        assert_eq!(reg.name(group).unwrap(), "Group");
    }

    #[test]
    fn test_destroy_cascades_and_ids_go_stale() {
        let mut reg = ObjectRegistry::new();
        let group = reg.register("App::Group", "Group");
        let member = reg.register("Part::Box", "Box");
        reg.set_parent(member, Some(group), None).unwrap();

        let removed = reg.destroy(group).unwrap();
        assert_eq!(removed, vec![member, group]);
        assert!(!reg.contains(member));

        let reused = reg.register("Part::Box", "Box");
        assert_ne!(reused, member);
        assert!(reg.get(member).is_err());
    }

    #[test]
    fn test_circular_group_rejected() {
        let mut reg = ObjectRegistry::new();
        let outer = reg.register("App::Group", "Group");
        let inner = reg.register("App::Group", "Group");
        reg.set_parent(inner, Some(outer), None).unwrap();
        assert_eq!(
            reg.set_parent(outer, Some(inner), None),
            Err(ObjectError::CircularGroup)
        );
        assert_eq!(reg.set_parent(outer, Some(outer), None), Err(ObjectError::CircularGroup));
    }

    #[test]
    fn test_preorder_and_ancestors() {
        let mut reg = ObjectRegistry::new();
        let root = reg.register("App::Group", "Group");
        let sub = reg.register("App::Group", "Group");
        let a = reg.register("Part::Box", "Box");
        let b = reg.register("Part::Box", "Box");
        reg.set_parent(sub, Some(root), None).unwrap();
        reg.set_parent(a, Some(sub), None).unwrap();
        reg.set_parent(b, Some(root), Some(0)).unwrap();

        assert_eq!(reg.depth_first_preorder(root).unwrap(), vec![b, sub, a]);
        assert_eq!(reg.ancestors(a).unwrap(), vec![sub, root]);
    }

    #[test]
    fn test_extension_store() {
        struct Marker(u32);
        let mut reg = ObjectRegistry::new();
        let id = reg.register("App::Link", "Link");
        assert!(!reg.has_extension::<Marker>(id));
        reg.set_extension(id, Marker(7)).unwrap();
        reg.extension_mut::<Marker>(id).unwrap().unwrap().0 += 1;
        assert_eq!(reg.extension::<Marker>(id).unwrap().unwrap().0, 8);
        assert_eq!(reg.remove_extension::<Marker>(id).unwrap().unwrap().0, 8);
        assert!(!reg.has_extension::<Marker>(id));
    }

    #[test]
    fn test_duplicate_property_rejected() {
        let mut reg = ObjectRegistry::new();
        let id = reg.register("App::Link", "Link");
        reg.add_property(id, "Scale", PropertyCell::new(PropertyValue::Float(1.0)))
            .unwrap();
        assert!(matches!(
            reg.add_property(id, "Scale", PropertyCell::new(PropertyValue::Float(1.0))),
            Err(ObjectError::Property(PropertyError::AlreadyExists { .. }))
        ));
    }
}
