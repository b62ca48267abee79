//! Geometry kernel contract.
//!
//! The attachment engine never computes boundary representations itself. It
//! asks a [`GeometryKernel`] to resolve `(object, sub-element)` references
//! into simple [`ElementGeometry`] descriptors in document coordinates.
//!
//! [`MemoryKernel`] is a table-driven kernel: elements are registered per
//! object in local coordinates and moved by the object's `Placement`. It is
//! enough to drive attachments for scripted construction and for tests.

use std::collections::HashMap;

use glam::DVec3;
use parking_lot::RwLock;
use trellis_core::{Document, ObjectId, Placement};

use crate::error::KernelError;

/// A resolved geometric element, in document coordinates.
#[derive(Clone, Debug, PartialEq)]
pub enum ElementGeometry {
    /// A vertex.
    Point(DVec3),
    /// A straight edge or datum line.
    Line { origin: DVec3, direction: DVec3 },
    /// A planar face or datum plane.
    Plane {
        origin: DVec3,
        normal: DVec3,
        x_axis: DVec3,
    },
    /// A curved edge approximated by a polyline.
    Curve(Vec<DVec3>),
    /// A whole object: its coordinate system.
    Frame(Placement),
}

impl ElementGeometry {
    /// Transform local geometry by `placement`.
    pub fn transformed(&self, placement: &Placement) -> Self {
        match self {
            Self::Point(p) => Self::Point(placement.transform_point(*p)),
            Self::Line { origin, direction } => Self::Line {
                origin: placement.transform_point(*origin),
                direction: placement.transform_vector(*direction),
            },
            Self::Plane {
                origin,
                normal,
                x_axis,
            } => Self::Plane {
                origin: placement.transform_point(*origin),
                normal: placement.transform_vector(*normal),
                x_axis: placement.transform_vector(*x_axis),
            },
            Self::Curve(points) => {
                Self::Curve(points.iter().map(|p| placement.transform_point(*p)).collect())
            }
            Self::Frame(frame) => Self::Frame(*placement * *frame),
        }
    }

    /// A representative point of the element.
    pub fn anchor(&self) -> Option<DVec3> {
        match self {
            Self::Point(p) => Some(*p),
            Self::Line { origin, .. } | Self::Plane { origin, .. } => Some(*origin),
            Self::Curve(points) => points.first().copied(),
            Self::Frame(frame) => Some(frame.position),
        }
    }
}

/// Result of resolving one reference.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedElement {
    pub geometry: ElementGeometry,
    /// Set when the kernel knows the element under a new name after a
    /// topological change. The caller rewrites its reference.
    pub renamed: Option<String>,
}

/// Resolves sub-element references to geometry.
pub trait GeometryKernel: Send + Sync {
    /// Resolve `subname` of `object`. An empty sub-name resolves to the
    /// object's own frame.
    fn resolve(
        &self,
        doc: &Document,
        object: ObjectId,
        subname: &str,
    ) -> Result<ResolvedElement, KernelError>;
}

/// Global placement of an object: its `Placement` property, or identity.
pub fn object_placement(doc: &Document, object: ObjectId) -> Placement {
    doc.property(object, "Placement")
        .ok()
        .and_then(|v| v.as_placement())
        .unwrap_or_default()
}

#[derive(Default)]
struct MemoryTables {
    elements: HashMap<(ObjectId, String), ElementGeometry>,
    renames: HashMap<(ObjectId, String), String>,
    failures: HashMap<ObjectId, String>,
}

/// A table-driven in-memory kernel.
#[derive(Default)]
pub struct MemoryKernel {
    tables: RwLock<MemoryTables>,
}

impl MemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an element in the object's local coordinates.
    pub fn add_element(&self, object: ObjectId, name: impl Into<String>, geometry: ElementGeometry) {
        self.tables
            .write()
            .elements
            .insert((object, name.into()), geometry);
    }

    /// Remove an element.
    pub fn remove_element(&self, object: ObjectId, name: &str) {
        self.tables.write().elements.remove(&(object, name.to_string()));
    }

    /// Record that `old` is now known as `new`. The geometry moves with it.
    pub fn rename_element(&self, object: ObjectId, old: &str, new: &str) {
        let mut tables = self.tables.write();
        if let Some(geometry) = tables.elements.remove(&(object, old.to_string())) {
            tables.elements.insert((object, new.to_string()), geometry);
        }
        tables
            .renames
            .insert((object, old.to_string()), new.to_string());
    }

    /// Make every query against `object` fail, or clear the failure.
    pub fn set_failure(&self, object: ObjectId, message: Option<&str>) {
        let mut tables = self.tables.write();
        match message {
            Some(message) => {
                tables.failures.insert(object, message.to_string());
            }
            None => {
                tables.failures.remove(&object);
            }
        }
    }
}

impl GeometryKernel for MemoryKernel {
    fn resolve(
        &self,
        doc: &Document,
        object: ObjectId,
        subname: &str,
    ) -> Result<ResolvedElement, KernelError> {
        if !doc.contains(object) {
            return Err(KernelError::SubElementNotFound(subname.to_string()));
        }
        let tables = self.tables.read();
        if let Some(message) = tables.failures.get(&object) {
            return Err(KernelError::Failed(message.clone()));
        }

        let placement = object_placement(doc, object);
        if subname.is_empty() {
            return Ok(ResolvedElement {
                geometry: ElementGeometry::Frame(placement),
                renamed: None,
            });
        }

        let renamed = tables.renames.get(&(object, subname.to_string())).cloned();
        let key = (object, renamed.clone().unwrap_or_else(|| subname.to_string()));
        let local = tables
            .elements
            .get(&key)
            .ok_or_else(|| KernelError::SubElementNotFound(subname.to_string()))?;
        Ok(ResolvedElement {
            geometry: local.transformed(&placement),
            renamed,
        })
    }
}

impl std::fmt::Debug for MemoryKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("MemoryKernel")
            .field("elements", &tables.elements.len())
            .field("renames", &tables.renames.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(MemoryKernel: Send, Sync);
