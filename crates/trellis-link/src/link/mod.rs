//! Link array extension.
//!
//! A link host presents one referenced object (or a list of objects) as an
//! array of virtual elements with independent placement, scale, visibility
//! and color. Hosts come in three shapes that differ only in which property
//! blocks they carry:
//!
//! - [`LinkShape::Single`]: `LinkedObject` plus transform
//! - [`LinkShape::Array`]: a single base link replicated `ElementCount` times
//! - [`LinkShape::Group`]: an `ElementList` of independent objects
//!
//! State that is not persisted (caches, guards, watches) lives in a
//! [`LinkExtension`] block on the host. Reads go through [`LinkRef`]
//! (`doc.link(host)`), writes through [`LinkMut`] (`doc.link_mut(host)`).
//! Reactions to property changes are driven by the hooks installed with
//! [`crate::install`].

mod elements;
mod group;
mod resolve;

use std::sync::Arc;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use trellis_core::{
    ChangeOrigin, ConnectionId, Document, LinkScope, LinkSub, Matrix, ObjectId, Placement,
    Property, PropertyCell, PropertyValue,
};

use crate::error::{LinkError, LinkResult};

pub use elements::{ElementState, NewLinkElements};
pub use group::LabelCache;
pub use resolve::SubObject;

pub(crate) use elements::{
    on_element_changed, on_host_changed as on_array_changed, sync_elements,
};
pub(crate) use group::{GROUP_TOPIC, LINK_HOOK, invalidate_child_cache, refresh_group_watches};
pub(crate) use resolve::check_link_cycle;

/// Type name of single links.
pub const LINK_TYPE: &str = "App::Link";
/// Type name of link groups.
pub const LINK_GROUP_TYPE: &str = "App::LinkGroup";
/// Type name of materialized array elements.
pub const LINK_ELEMENT_TYPE: &str = "App::LinkElement";

/// Property names used by link hosts.
pub mod props {
    pub const LINKED_OBJECT: &str = "LinkedObject";
    pub const LINK_PLACEMENT: &str = "LinkPlacement";
    pub const PLACEMENT: &str = "Placement";
    pub const LINK_TRANSFORM: &str = "LinkTransform";
    pub const SCALE: &str = "Scale";
    pub const SCALE_VECTOR: &str = "ScaleVector";
    pub const ELEMENT_COUNT: &str = "ElementCount";
    pub const PLACEMENT_LIST: &str = "PlacementList";
    pub const SCALE_LIST: &str = "ScaleList";
    pub const MATRIX_LIST: &str = "MatrixList";
    pub const VISIBILITY_LIST: &str = "VisibilityList";
    pub const SHOW_ELEMENT: &str = "ShowElement";
    pub const ELEMENT_LIST: &str = "ElementList";
    pub const COLORED_ELEMENTS: &str = "ColoredElements";
    pub const LINK_MODE: &str = "LinkMode";
    pub const FLATTEN_GROUP: &str = "FlattenGroup";
    pub const AUTO_LINK_LABEL: &str = "AutoLinkLabel";
}

/// Which property blocks a host carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkShape {
    Single,
    Array,
    Group,
}

impl LinkShape {
    /// Infer the shape from the properties present on an object.
    pub fn detect(doc: &Document, id: ObjectId) -> Option<Self> {
        if doc.has_property(id, props::ELEMENT_COUNT) {
            Some(Self::Array)
        } else if doc.has_property(id, props::LINKED_OBJECT) {
            Some(Self::Single)
        } else if doc.has_property(id, props::ELEMENT_LIST) {
            Some(Self::Group)
        } else {
            None
        }
    }
}

/// What happens to the elements of a link group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkMode {
    /// Elements are plain references.
    #[default]
    None,
    /// Removing the group removes its elements.
    AutoDelete,
    /// Objects added to the group are wrapped in links owned by the group.
    AutoLink,
    /// Like `AutoLink`; wrapper links are removed when their slot is cleared.
    AutoUnlink,
}

impl LinkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::AutoDelete => "AutoDelete",
            Self::AutoLink => "AutoLink",
            Self::AutoUnlink => "AutoUnlink",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "None" => Some(Self::None),
            "AutoDelete" => Some(Self::AutoDelete),
            "AutoLink" => Some(Self::AutoLink),
            "AutoUnlink" => Some(Self::AutoUnlink),
            _ => None,
        }
    }

    /// Whether new group elements are wrapped in owned links.
    pub fn wraps_elements(self) -> bool {
        matches!(self, Self::AutoLink | Self::AutoUnlink)
    }
}

/// Runtime state of a link host. Never serialized; rebuilt on load.
pub struct LinkExtension {
    shape: LinkShape,
    /// Host array when this object is a materialized array element.
    pub(crate) element_of: Option<ObjectId>,
    /// Element target was assigned explicitly and survives resyncs.
    pub(crate) custom_link: bool,
    /// Set while the host writes into its own element objects.
    pub(crate) syncing: bool,
    /// Flattened children of a linked plain group, `None` when stale.
    pub(crate) child_cache: Property<Option<Arc<Vec<ObjectId>>>>,
    pub(crate) group_watches: Vec<ConnectionId>,
    pub(crate) label_cache: Option<LabelCache>,
}

impl LinkExtension {
    pub fn new(shape: LinkShape) -> Self {
        Self {
            shape,
            element_of: None,
            custom_link: false,
            syncing: false,
            child_cache: Property::new(None),
            group_watches: Vec::new(),
            label_cache: None,
        }
    }

    pub fn shape(&self) -> LinkShape {
        self.shape
    }

    /// Host array of an element object.
    pub fn element_of(&self) -> Option<ObjectId> {
        self.element_of
    }
}

impl std::fmt::Debug for LinkExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkExtension")
            .field("shape", &self.shape)
            .field("element_of", &self.element_of)
            .field("custom_link", &self.custom_link)
            .field("group_watches", &self.group_watches.len())
            .finish()
    }
}

// ---------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------

fn cell(value: PropertyValue, doc: &str) -> PropertyCell {
    PropertyCell::new(value).with_group("Link").with_doc(doc)
}

fn add_transform_properties(doc: &mut Document, id: ObjectId) -> LinkResult<()> {
    let hide_scale_vector = doc.params().hide_scale_vector;
    doc.ensure_property(id, props::PLACEMENT, || {
        PropertyCell::new(PropertyValue::Placement(Placement::IDENTITY)).with_group("Base")
    })?;
    doc.ensure_property(id, props::LINK_PLACEMENT, || {
        cell(
            PropertyValue::Placement(Placement::IDENTITY),
            "Offset applied on top of the host placement when LinkTransform is on",
        )
    })?;
    doc.ensure_property(id, props::LINK_TRANSFORM, || {
        cell(PropertyValue::Bool(false), "Apply LinkPlacement in addition to Placement")
    })?;
    doc.ensure_property(id, props::SCALE, || cell(PropertyValue::Float(1.0), "Uniform scale"))?;
    doc.ensure_property(id, props::SCALE_VECTOR, || {
        let c = cell(PropertyValue::Vector(DVec3::ONE), "Non-uniform scale");
        if hide_scale_vector { c.hidden() } else { c }
    })?;
    Ok(())
}

fn add_single_properties(doc: &mut Document, id: ObjectId) -> LinkResult<()> {
    doc.ensure_property(id, props::LINKED_OBJECT, || {
        cell(PropertyValue::LinkSub(LinkSub::empty()), "Linked object")
    })?;
    add_transform_properties(doc, id)?;
    doc.ensure_property(id, props::FLATTEN_GROUP, || {
        cell(
            PropertyValue::Bool(true),
            "Present the members of a linked plain group as direct children",
        )
    })?;
    Ok(())
}

fn add_color_property(doc: &mut Document, id: ObjectId) -> LinkResult<()> {
    doc.ensure_property(id, props::COLORED_ELEMENTS, || {
        cell(PropertyValue::ColorMap(Default::default()), "Element color overrides")
            .hidden()
            .with_scope(LinkScope::Hidden)
    })?;
    Ok(())
}

fn add_array_properties(doc: &mut Document, id: ObjectId) -> LinkResult<()> {
    let show_element = doc.params().show_element;
    doc.ensure_property(id, props::ELEMENT_COUNT, || {
        cell(PropertyValue::Int(0), "Number of array elements")
    })?;
    doc.ensure_property(id, props::PLACEMENT_LIST, || {
        cell(PropertyValue::PlacementList(Vec::new()), "Per-element placements")
    })?;
    doc.ensure_property(id, props::SCALE_LIST, || {
        cell(PropertyValue::VectorList(Vec::new()), "Per-element scale")
    })?;
    doc.ensure_property(id, props::MATRIX_LIST, || {
        cell(PropertyValue::MatrixList(Vec::new()), "Per-element transform, supersedes scale")
            .hidden()
    })?;
    doc.ensure_property(id, props::SHOW_ELEMENT, || {
        cell(PropertyValue::Bool(show_element), "Materialize array elements as objects")
    })?;
    doc.ensure_property(id, props::AUTO_LINK_LABEL, || {
        cell(PropertyValue::Bool(false), "Derive element labels from the host label")
    })?;
    Ok(())
}

fn add_element_list_properties(doc: &mut Document, id: ObjectId) -> LinkResult<()> {
    doc.ensure_property(id, props::ELEMENT_LIST, || {
        cell(PropertyValue::LinkList(Vec::new()), "Element objects").with_scope(LinkScope::Child)
    })?;
    doc.ensure_property(id, props::VISIBILITY_LIST, || {
        cell(PropertyValue::BoolList(Vec::new()), "Per-element visibility").hidden()
    })?;
    Ok(())
}

/// Add the link extension to an existing object.
///
/// Missing properties are created with their defaults; existing ones are
/// kept, which is what a restored object needs.
pub fn add_link_extension(doc: &mut Document, id: ObjectId, shape: LinkShape) -> LinkResult<()> {
    match shape {
        LinkShape::Single => {
            add_single_properties(doc, id)?;
            add_color_property(doc, id)?;
            crate::copy_on_change::add_properties(doc, id)?;
        }
        LinkShape::Array => {
            add_single_properties(doc, id)?;
            add_element_list_properties(doc, id)?;
            add_array_properties(doc, id)?;
            add_color_property(doc, id)?;
            crate::copy_on_change::add_properties(doc, id)?;
        }
        LinkShape::Group => {
            add_element_list_properties(doc, id)?;
            doc.ensure_property(id, props::PLACEMENT, || {
                PropertyCell::new(PropertyValue::Placement(Placement::IDENTITY)).with_group("Base")
            })?;
            doc.ensure_property(id, props::LINK_MODE, || {
                cell(PropertyValue::Enum(LinkMode::None.as_str().into()), "Element ownership mode")
            })?;
            add_color_property(doc, id)?;
        }
    }
    if !doc.has_extension::<LinkExtension>(id) {
        doc.set_extension(id, LinkExtension::new(shape))?;
    }
    tracing::debug!(target: "trellis_link::link", object = ?id, ?shape, "added link extension");
    Ok(())
}

/// Create a single link, optionally pointing at `target`.
pub fn make_link(doc: &mut Document, name: &str, target: Option<ObjectId>) -> LinkResult<ObjectId> {
    let id = doc.add_object(LINK_TYPE, name);
    add_link_extension(doc, id, LinkShape::Single)?;
    if let Some(target) = target {
        place_at_target(doc, id, target)?;
        doc.link_mut(id)?.set_link(-1, Some(target), None, Vec::new())?;
    }
    Ok(id)
}

/// Create a link array of `count` elements referencing `target`.
pub fn make_link_array(
    doc: &mut Document,
    name: &str,
    target: Option<ObjectId>,
    count: usize,
) -> LinkResult<ObjectId> {
    let id = doc.add_object(LINK_TYPE, name);
    add_link_extension(doc, id, LinkShape::Array)?;
    if let Some(target) = target {
        doc.link_mut(id)?.set_link(-1, Some(target), None, Vec::new())?;
    }
    doc.link_mut(id)?.set_element_count(count)?;
    Ok(id)
}

/// Create an empty link group.
pub fn make_link_group(doc: &mut Document, name: &str) -> LinkResult<ObjectId> {
    let id = doc.add_object(LINK_GROUP_TYPE, name);
    add_link_extension(doc, id, LinkShape::Group)?;
    Ok(id)
}

fn place_at_target(doc: &mut Document, id: ObjectId, target: ObjectId) -> LinkResult<()> {
    if !doc.params().create_in_place {
        return Ok(());
    }
    if let Some(placement) = doc
        .property(target, props::PLACEMENT)
        .ok()
        .and_then(PropertyValue::as_placement)
    {
        doc.set_property_as(id, props::PLACEMENT, PropertyValue::Placement(placement), ChangeOrigin::Internal)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Property helpers
// ---------------------------------------------------------------------

pub(crate) fn value<'d>(doc: &'d Document, id: ObjectId, name: &str) -> Option<&'d PropertyValue> {
    doc.property(id, name).ok()
}

pub(crate) fn bool_prop(doc: &Document, id: ObjectId, name: &str, default: bool) -> bool {
    value(doc, id, name).and_then(PropertyValue::as_bool).unwrap_or(default)
}

pub(crate) fn placement_prop(doc: &Document, id: ObjectId, name: &str) -> Placement {
    value(doc, id, name)
        .and_then(PropertyValue::as_placement)
        .unwrap_or_default()
}

pub(crate) fn object_name(doc: &Document, id: ObjectId) -> String {
    doc.name(id).map(str::to_string).unwrap_or_else(|_| format!("{id:?}"))
}

// ---------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------

/// Read access to a link host.
#[derive(Clone, Copy)]
pub struct LinkRef<'a> {
    pub(crate) doc: &'a Document,
    pub(crate) host: ObjectId,
    pub(crate) ext: &'a LinkExtension,
}

/// Write access to a link host.
pub struct LinkMut<'a> {
    pub(crate) doc: &'a mut Document,
    pub(crate) host: ObjectId,
}

/// Link access on a [`Document`].
pub trait LinkDocumentExt {
    /// Read view of a link host. Fails with [`LinkError::NotALink`].
    fn link(&self, host: ObjectId) -> LinkResult<LinkRef<'_>>;
    /// Write view of a link host. Fails with [`LinkError::NotALink`].
    fn link_mut(&mut self, host: ObjectId) -> LinkResult<LinkMut<'_>>;
    /// Whether `id` carries the link extension.
    fn is_link(&self, id: ObjectId) -> bool;
}

impl LinkDocumentExt for Document {
    fn link(&self, host: ObjectId) -> LinkResult<LinkRef<'_>> {
        let ext = self
            .extension::<LinkExtension>(host)
            .ok_or_else(|| LinkError::NotALink {
                object: object_name(self, host),
            })?;
        Ok(LinkRef {
            doc: self,
            host,
            ext,
        })
    }

    fn link_mut(&mut self, host: ObjectId) -> LinkResult<LinkMut<'_>> {
        if !self.has_extension::<LinkExtension>(host) {
            return Err(LinkError::NotALink {
                object: object_name(self, host),
            });
        }
        Ok(LinkMut { doc: self, host })
    }

    fn is_link(&self, id: ObjectId) -> bool {
        self.has_extension::<LinkExtension>(id)
    }
}

impl<'a> LinkRef<'a> {
    pub fn host(&self) -> ObjectId {
        self.host
    }

    pub fn shape(&self) -> LinkShape {
        self.ext.shape
    }

    pub fn extension(&self) -> &'a LinkExtension {
        self.ext
    }

    /// The raw `LinkedObject` value.
    pub fn link_value(&self) -> LinkSub {
        value(self.doc, self.host, props::LINKED_OBJECT)
            .and_then(PropertyValue::as_link_sub)
            .cloned()
            .unwrap_or_default()
    }

    /// The linked object, `None` when empty or deleted.
    pub fn linked_object(&self) -> Option<ObjectId> {
        self.link_value()
            .object
            .filter(|&target| self.doc.contains(target))
    }

    /// Sub-element paths of the link.
    pub fn linked_subs(&self) -> Vec<String> {
        self.link_value().subs
    }

    /// Host placement.
    pub fn placement(&self) -> Placement {
        placement_prop(self.doc, self.host, props::PLACEMENT)
    }

    pub fn scale_vector(&self) -> DVec3 {
        value(self.doc, self.host, props::SCALE_VECTOR)
            .and_then(PropertyValue::as_vector)
            .unwrap_or(DVec3::ONE)
    }

    /// Transform of the host: optionally its placement, then `LinkPlacement`
    /// when `LinkTransform` is on, then the scale.
    pub fn transform(&self, with_placement: bool) -> Matrix {
        let mut matrix = if with_placement {
            self.placement().to_matrix()
        } else {
            Matrix::IDENTITY
        };
        if bool_prop(self.doc, self.host, props::LINK_TRANSFORM, false) {
            matrix *= placement_prop(self.doc, self.host, props::LINK_PLACEMENT).to_matrix();
        }
        matrix * trellis_core::placement::scale_matrix(self.scale_vector())
    }

    /// Whether the host flattens a linked plain group.
    pub fn is_flattening(&self) -> bool {
        self.ext.shape != LinkShape::Group
            && bool_prop(self.doc, self.host, props::FLATTEN_GROUP, true)
            && self
                .linked_object()
                .and_then(|target| self.doc.object(target).ok())
                .is_some_and(|data| data.is_group())
    }

    /// Group ownership mode (link groups only).
    pub fn link_mode(&self) -> LinkMode {
        value(self.doc, self.host, props::LINK_MODE)
            .and_then(PropertyValue::as_str)
            .and_then(LinkMode::parse)
            .unwrap_or_default()
    }
}

impl LinkMut<'_> {
    pub fn host(&self) -> ObjectId {
        self.host
    }

    /// Read view over the same host.
    pub fn as_ref(&self) -> LinkResult<LinkRef<'_>> {
        self.doc.link(self.host)
    }

    fn shape(&self) -> LinkResult<LinkShape> {
        Ok(self.as_ref()?.shape())
    }

    /// Assign what a slot refers to.
    ///
    /// `index == -1` sets the base link (`LinkedObject`). Non-negative
    /// indices address array slots: arrays have a fixed `ElementCount` and
    /// reject indices beyond it, link groups grow to fit. `subname` is
    /// prepended to `subs` when both are given.
    #[tracing::instrument(skip(self, subs), target = "trellis_link::link", level = "debug")]
    pub fn set_link(
        &mut self,
        index: i64,
        object: Option<ObjectId>,
        subname: Option<&str>,
        subs: Vec<String>,
    ) -> LinkResult<()> {
        let mut all_subs = Vec::with_capacity(subs.len() + 1);
        if let Some(subname) = subname.filter(|s| !s.is_empty()) {
            crate::subname::SubnamePath::parse(subname)?;
            all_subs.push(subname.to_string());
        }
        all_subs.extend(subs);
        let link = LinkSub {
            object,
            subs: if object.is_some() { all_subs } else { Vec::new() },
        };

        let shape = self.shape()?;
        match (index, shape) {
            (..-1, _) => Err(LinkError::InvalidIndex {
                index,
                count: self.as_ref()?.element_count(),
            }),
            (-1, LinkShape::Group) => Err(LinkError::InvalidIndex {
                index,
                count: self.as_ref()?.element_count(),
            }),
            (-1, _) => {
                self.doc
                    .set_property(self.host, props::LINKED_OBJECT, PropertyValue::LinkSub(link))?;
                Ok(())
            }
            (_, LinkShape::Single) => Err(LinkError::InvalidIndex { index, count: 0 }),
            (_, LinkShape::Array) => self.set_array_slot(index as usize, link),
            (_, LinkShape::Group) => self.set_group_slot(index as usize, object),
        }
    }

    /// Set `ElementCount` of an array.
    pub fn set_element_count(&mut self, count: usize) -> LinkResult<()> {
        if self.shape()? != LinkShape::Array {
            return Err(LinkError::InvalidIndex {
                index: count as i64,
                count: 0,
            });
        }
        let count = i64::try_from(count).map_err(|_| LinkError::InvalidIndex {
            index: i64::MAX,
            count: 0,
        })?;
        self.doc
            .set_property(self.host, props::ELEMENT_COUNT, PropertyValue::Int(count))?;
        Ok(())
    }

    /// Toggle element materialization of an array.
    pub fn set_show_element(&mut self, show: bool) -> LinkResult<()> {
        self.doc
            .set_property(self.host, props::SHOW_ELEMENT, PropertyValue::Bool(show))?;
        Ok(())
    }

    /// Set a uniform scale.
    pub fn set_scale(&mut self, scale: f64) -> LinkResult<()> {
        self.doc
            .set_property(self.host, props::SCALE, PropertyValue::Float(scale))?;
        Ok(())
    }

    /// Set the link group ownership mode.
    pub fn set_link_mode(&mut self, mode: LinkMode) -> LinkResult<()> {
        self.doc.set_property(
            self.host,
            props::LINK_MODE,
            PropertyValue::Enum(mode.as_str().to_string()),
        )?;
        Ok(())
    }
}
