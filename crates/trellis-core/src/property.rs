//! Typed property cells for document objects.
//!
//! Every document object owns a table of named [`PropertyCell`]s. A cell holds
//! one [`PropertyValue`] from a closed set of kinds plus its status: edit lock,
//! visibility, link scope and whether the property participates in
//! copy-on-change cloning.
//!
//! Writes go through the document so that change notification, type checking
//! and lock checking always happen. This module only defines the storage.
//!
//! [`Property<T>`] is the plain lock-protected value cell with change
//! detection. Extensions use it for caches that must be refreshed from behind
//! a shared reference.

use std::collections::BTreeMap;
use std::fmt;

use glam::DVec3;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::object::ObjectId;
use crate::placement::{Matrix, Placement};

/// A reactive value cell that tracks changes.
///
/// `set()` compares the new value with the current one and reports whether
/// the value actually changed.
///
/// # Example
///
/// ```
/// use trellis_core::Property;
///
/// let prop = Property::new(42);
/// assert!(!prop.set(42));
/// assert!(prop.set(100));
/// assert_eq!(prop.get(), 100);
/// ```
pub struct Property<T> {
    value: RwLock<T>,
}

impl<T: Clone> Property<T> {
    /// Create a new property with an initial value.
    pub fn new(value: T) -> Self {
        Self {
            value: RwLock::new(value),
        }
    }

    /// Get the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Access the value through a closure without cloning.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        f(&self.value.read())
    }

    /// Mutate the value in place without change detection.
    pub fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        f(&mut self.value.write())
    }

    /// Set the value without change detection.
    pub fn set_silent(&self, value: T) {
        *self.value.write() = value;
    }
}

impl<T: Clone + PartialEq> Property<T> {
    /// Set the value, returning `true` if the value changed.
    pub fn set(&self, value: T) -> bool {
        let mut current = self.value.write();
        if *current != value {
            *current = value;
            true
        } else {
            false
        }
    }

    /// Set the value, returning the old value if it changed.
    pub fn replace(&self, value: T) -> Option<T> {
        let mut current = self.value.write();
        if *current != value {
            Some(std::mem::replace(&mut *current, value))
        } else {
            None
        }
    }
}

impl<T: Clone> Clone for Property<T> {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl<T: Clone + Default> Default for Property<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property").field("value", &self.get()).finish()
    }
}

/// An RGBA color, components in `0.0..=1.0`.
pub type Color = [f32; 4];

/// A reference to one object plus optional sub-element paths.
///
/// Duplicated sub-element paths are legal and refer to the same geometry twice.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkSub {
    /// Referenced object, `None` for an empty link.
    pub object: Option<ObjectId>,
    /// Sub-element paths inside the referenced object.
    pub subs: Vec<String>,
}

impl LinkSub {
    /// An empty reference.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A whole-object reference.
    pub fn object(object: ObjectId) -> Self {
        Self {
            object: Some(object),
            subs: Vec::new(),
        }
    }

    /// A reference to sub-elements of an object.
    pub fn with_subs<I, S>(object: ObjectId, subs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            object: Some(object),
            subs: subs.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether this reference points at nothing.
    pub fn is_empty(&self) -> bool {
        self.object.is_none()
    }
}

/// The kind of a [`PropertyValue`], used for type checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    Bool,
    Int,
    Float,
    String,
    Enum,
    Vector,
    Placement,
    Matrix,
    Link,
    LinkSub,
    LinkSubList,
    LinkList,
    StringList,
    BoolList,
    VectorList,
    MatrixList,
    PlacementList,
    ColorMap,
}

impl PropertyKind {
    /// Human readable kind name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "Bool",
            Self::Int => "Int",
            Self::Float => "Float",
            Self::String => "String",
            Self::Enum => "Enum",
            Self::Vector => "Vector",
            Self::Placement => "Placement",
            Self::Matrix => "Matrix",
            Self::Link => "Link",
            Self::LinkSub => "LinkSub",
            Self::LinkSubList => "LinkSubList",
            Self::LinkList => "LinkList",
            Self::StringList => "StringList",
            Self::BoolList => "BoolList",
            Self::VectorList => "VectorList",
            Self::MatrixList => "MatrixList",
            Self::PlacementList => "PlacementList",
            Self::ColorMap => "ColorMap",
        }
    }
}

/// A typed property value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// An enumeration stored by its symbolic name.
    Enum(String),
    Vector(DVec3),
    Placement(Placement),
    Matrix(Matrix),
    Link(Option<ObjectId>),
    LinkSub(LinkSub),
    LinkSubList(Vec<LinkSub>),
    LinkList(Vec<ObjectId>),
    StringList(Vec<String>),
    BoolList(Vec<bool>),
    VectorList(Vec<DVec3>),
    MatrixList(Vec<Matrix>),
    PlacementList(Vec<Placement>),
    /// Element key (index or sub-element name) to color override.
    ColorMap(BTreeMap<String, Color>),
}

impl PropertyValue {
    /// The kind of this value.
    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::Bool(_) => PropertyKind::Bool,
            Self::Int(_) => PropertyKind::Int,
            Self::Float(_) => PropertyKind::Float,
            Self::String(_) => PropertyKind::String,
            Self::Enum(_) => PropertyKind::Enum,
            Self::Vector(_) => PropertyKind::Vector,
            Self::Placement(_) => PropertyKind::Placement,
            Self::Matrix(_) => PropertyKind::Matrix,
            Self::Link(_) => PropertyKind::Link,
            Self::LinkSub(_) => PropertyKind::LinkSub,
            Self::LinkSubList(_) => PropertyKind::LinkSubList,
            Self::LinkList(_) => PropertyKind::LinkList,
            Self::StringList(_) => PropertyKind::StringList,
            Self::BoolList(_) => PropertyKind::BoolList,
            Self::VectorList(_) => PropertyKind::VectorList,
            Self::MatrixList(_) => PropertyKind::MatrixList,
            Self::PlacementList(_) => PropertyKind::PlacementList,
            Self::ColorMap(_) => PropertyKind::ColorMap,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// String or enum name.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) | Self::Enum(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<DVec3> {
        match self {
            Self::Vector(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_placement(&self) -> Option<Placement> {
        match self {
            Self::Placement(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_matrix(&self) -> Option<Matrix> {
        match self {
            Self::Matrix(v) => Some(*v),
            _ => None,
        }
    }

    /// Target of a `Link` or `LinkSub` value.
    pub fn as_link(&self) -> Option<ObjectId> {
        match self {
            Self::Link(v) => *v,
            Self::LinkSub(v) => v.object,
            _ => None,
        }
    }

    pub fn as_link_sub(&self) -> Option<&LinkSub> {
        match self {
            Self::LinkSub(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_link_sub_list(&self) -> Option<&[LinkSub]> {
        match self {
            Self::LinkSubList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_link_list(&self) -> Option<&[ObjectId]> {
        match self {
            Self::LinkList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Self::StringList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool_list(&self) -> Option<&[bool]> {
        match self {
            Self::BoolList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_vector_list(&self) -> Option<&[DVec3]> {
        match self {
            Self::VectorList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_matrix_list(&self) -> Option<&[Matrix]> {
        match self {
            Self::MatrixList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_placement_list(&self) -> Option<&[Placement]> {
        match self {
            Self::PlacementList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_color_map(&self) -> Option<&BTreeMap<String, Color>> {
        match self {
            Self::ColorMap(v) => Some(v),
            _ => None,
        }
    }

    /// Rewrite every referenced object id through `map`.
    pub fn remap_objects(&mut self, map: impl Fn(ObjectId) -> ObjectId) {
        match self {
            Self::Link(Some(id)) => *id = map(*id),
            Self::LinkSub(link) => link.object = link.object.map(&map),
            Self::LinkSubList(links) => {
                for link in links {
                    link.object = link.object.map(&map);
                }
            }
            Self::LinkList(ids) => {
                for id in ids {
                    *id = map(*id);
                }
            }
            _ => {}
        }
    }

    /// Every object this value references, in order.
    pub fn referenced_objects(&self) -> Vec<ObjectId> {
        match self {
            Self::Link(Some(id)) => vec![*id],
            Self::LinkSub(link) => link.object.into_iter().collect(),
            Self::LinkSubList(links) => links.iter().filter_map(|l| l.object).collect(),
            Self::LinkList(ids) => ids.clone(),
            _ => Vec::new(),
        }
    }
}

/// Which parts of a property the user may edit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditLock {
    /// Fully editable.
    #[default]
    Editable,
    /// Read-only; only the owning extension writes the value.
    ReadOnly,
    /// Placement whose position is driven externally: only the rotation may change.
    RotationOnly,
}

/// How a link-valued property counts towards the dependency graph.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkScope {
    /// A structural dependency.
    #[default]
    Global,
    /// A dependency on an owned child.
    Child,
    /// Out of band; never a structural dependency.
    Hidden,
}

/// Status bits attached to a property cell.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyStatus {
    pub lock: EditLock,
    pub hidden: bool,
    pub scope: LinkScope,
    /// Participates in copy-on-change cloning.
    pub copy_on_change: bool,
}

/// A named, typed property slot owned by a document object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyCell {
    value: PropertyValue,
    pub status: PropertyStatus,
    pub group: String,
    pub doc: String,
}

impl PropertyCell {
    /// Create a cell holding an initial value.
    pub fn new(value: PropertyValue) -> Self {
        Self {
            value,
            status: PropertyStatus::default(),
            group: String::new(),
            doc: String::new(),
        }
    }

    /// Builder: set the group name.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Builder: set the documentation string.
    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    /// Builder: hide the property.
    pub fn hidden(mut self) -> Self {
        self.status.hidden = true;
        self
    }

    /// Builder: set the link scope.
    pub fn with_scope(mut self, scope: LinkScope) -> Self {
        self.status.scope = scope;
        self
    }

    /// Builder: mark for copy-on-change tracking.
    pub fn copy_on_change(mut self) -> Self {
        self.status.copy_on_change = true;
        self
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    pub(crate) fn value_mut(&mut self) -> &mut PropertyValue {
        &mut self.value
    }

    pub fn kind(&self) -> PropertyKind {
        self.value.kind()
    }

    /// Check whether `value` may replace the current value.
    pub fn check_write(&self, name: &str, value: &PropertyValue) -> Result<(), PropertyError> {
        if value.kind() != self.kind() {
            return Err(PropertyError::TypeMismatch {
                name: name.to_string(),
                expected: self.kind().name(),
                got: value.kind().name(),
            });
        }
        match self.status.lock {
            EditLock::Editable => Ok(()),
            EditLock::ReadOnly => Err(PropertyError::ReadOnly {
                name: name.to_string(),
            }),
            EditLock::RotationOnly => match (&self.value, value) {
                (PropertyValue::Placement(old), PropertyValue::Placement(new))
                    if old.position == new.position =>
                {
                    Ok(())
                }
                _ => Err(PropertyError::ReadOnly {
                    name: name.to_string(),
                }),
            },
        }
    }

    /// Replace the value without any checks, returning the previous one if it changed.
    pub(crate) fn replace(&mut self, value: PropertyValue) -> Option<PropertyValue> {
        if self.value != value {
            Some(std::mem::replace(&mut self.value, value))
        } else {
            None
        }
    }
}

/// Error types for property operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyError {
    /// The property was not found.
    NotFound {
        /// The name of the property that was not found.
        name: String,
    },
    /// The property already exists on the object.
    AlreadyExists {
        /// The duplicated property name.
        name: String,
    },
    /// The property type did not match.
    TypeMismatch {
        /// The property being written.
        name: String,
        /// The expected kind name.
        expected: &'static str,
        /// The kind that was provided.
        got: &'static str,
    },
    /// The property is read-only and cannot be modified.
    ReadOnly {
        /// The name of the read-only property.
        name: String,
    },
}

impl fmt::Display for PropertyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { name } => write!(f, "Property '{name}' not found"),
            Self::AlreadyExists { name } => write!(f, "Property '{name}' already exists"),
            Self::TypeMismatch {
                name,
                expected,
                got,
            } => {
                write!(f, "Property '{name}' type mismatch: expected {expected}, got {got}")
            }
            Self::ReadOnly { name } => write!(f, "Property '{name}' is read-only"),
        }
    }
}

impl std::error::Error for PropertyError {}
