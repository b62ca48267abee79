//! Per-element state of arrays and link groups, and materialization of array
//! elements as `App::LinkElement` objects.

use std::collections::BTreeMap;

use glam::DVec3;
use trellis_core::placement::{is_identity_matrix, scale_matrix};
use trellis_core::{
    ChangeOrigin, Color, Document, LABEL_PROPERTY, LinkSub, Matrix, ObjectId, Placement,
    PropertyCell, PropertyChange, PropertyValue, Signal,
};

use super::{
    LINK_ELEMENT_TYPE, LinkDocumentExt, LinkExtension, LinkMut, LinkRef, LinkShape,
    add_single_properties, bool_prop, check_link_cycle, make_link, object_name, placement_prop,
    props, value,
};
use crate::error::{LinkError, LinkResult};
use crate::subname;

/// Visibility flag of a materialized element object.
pub const VISIBILITY: &str = "Visibility";

/// Resolved state of one array slot.
#[derive(Clone, Debug, PartialEq)]
pub struct ElementState {
    pub index: usize,
    /// Element object, when materialized (arrays) or listed (groups).
    pub object: Option<ObjectId>,
    pub placement: Placement,
    pub scale: DVec3,
    /// Per-element matrix; supersedes `scale` when set.
    pub matrix: Option<Matrix>,
    pub visible: bool,
}

impl ElementState {
    fn default_at(index: usize) -> Self {
        Self {
            index,
            object: None,
            placement: Placement::IDENTITY,
            scale: DVec3::ONE,
            matrix: None,
            visible: true,
        }
    }

    /// Element transform relative to the host.
    pub fn transform(&self) -> Matrix {
        self.placement.to_matrix() * self.matrix.unwrap_or_else(|| scale_matrix(self.scale))
    }
}

/// Payload of the new-link-elements signal: element objects `start..end`
/// of `host` were just created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewLinkElements {
    pub host: ObjectId,
    pub start: usize,
    pub end: usize,
}

impl<'a> LinkRef<'a> {
    /// Number of slots: `ElementCount` for arrays, the element list length
    /// for groups, zero for single links.
    pub fn element_count(&self) -> usize {
        match self.ext.shape {
            LinkShape::Array => value(self.doc, self.host, props::ELEMENT_COUNT)
                .and_then(PropertyValue::as_int)
                .map_or(0, |count| usize::try_from(count).unwrap_or(0)),
            LinkShape::Group => self.element_list().len(),
            LinkShape::Single => 0,
        }
    }

    /// Raw `ElementList`, dead entries included.
    pub fn element_list(&self) -> &'a [ObjectId] {
        value(self.doc, self.host, props::ELEMENT_LIST)
            .and_then(PropertyValue::as_link_list)
            .unwrap_or(&[])
    }

    /// Element object at `index`, `None` when absent or deleted.
    pub fn element_object(&self, index: usize) -> Option<ObjectId> {
        self.element_list()
            .get(index)
            .copied()
            .filter(|&id| self.doc.contains(id))
    }

    pub fn placement_list(&self) -> &'a [Placement] {
        value(self.doc, self.host, props::PLACEMENT_LIST)
            .and_then(PropertyValue::as_placement_list)
            .unwrap_or(&[])
    }

    pub fn scale_list(&self) -> &'a [DVec3] {
        value(self.doc, self.host, props::SCALE_LIST)
            .and_then(PropertyValue::as_vector_list)
            .unwrap_or(&[])
    }

    pub fn matrix_list(&self) -> &'a [Matrix] {
        value(self.doc, self.host, props::MATRIX_LIST)
            .and_then(PropertyValue::as_matrix_list)
            .unwrap_or(&[])
    }

    pub fn visibility_list(&self) -> &'a [bool] {
        value(self.doc, self.host, props::VISIBILITY_LIST)
            .and_then(PropertyValue::as_bool_list)
            .unwrap_or(&[])
    }

    /// Resolve slot `index` using explicit overrides where present and
    /// defaults otherwise. Indices past the end yield the defaults.
    pub fn element(&self, index: usize) -> ElementState {
        let mut state = ElementState::default_at(index);
        if index >= self.element_count() {
            return state;
        }
        state.visible = self.is_element_visible_at(index);
        match self.ext.shape {
            LinkShape::Array => {
                state.object = self.element_object(index);
                if let Some(placement) = self.placement_list().get(index) {
                    state.placement = *placement;
                }
                if let Some(scale) = self.scale_list().get(index) {
                    state.scale = *scale;
                }
                state.matrix = self
                    .matrix_list()
                    .get(index)
                    .filter(|m| !is_identity_matrix(m))
                    .copied();
            }
            LinkShape::Group => {
                if let Some(object) = self.element_object(index) {
                    state.object = Some(object);
                    state.placement = placement_prop(self.doc, object, props::PLACEMENT);
                    state.scale = value(self.doc, object, props::SCALE_VECTOR)
                        .and_then(PropertyValue::as_vector)
                        .unwrap_or(DVec3::ONE);
                }
            }
            LinkShape::Single => {}
        }
        state
    }

    /// Every slot in index order.
    pub fn elements(&self) -> Vec<ElementState> {
        (0..self.element_count()).map(|i| self.element(i)).collect()
    }

    pub fn is_element_visible_at(&self, index: usize) -> bool {
        self.visibility_list().get(index).copied().unwrap_or(true)
    }

    /// Visibility of the slot addressed by `subname`. Unknown slots are
    /// visible.
    pub fn is_element_visible(&self, subname: &str) -> bool {
        self.element_index(subname)
            .is_none_or(|(index, _)| self.is_element_visible_at(index))
    }

    /// Color overrides keyed by index or sub-name.
    pub fn element_colors(&self) -> BTreeMap<String, Color> {
        value(self.doc, self.host, props::COLORED_ELEMENTS)
            .and_then(PropertyValue::as_color_map)
            .cloned()
            .unwrap_or_default()
    }

    pub fn element_color(&self, key: &str) -> Option<Color> {
        value(self.doc, self.host, props::COLORED_ELEMENTS)
            .and_then(PropertyValue::as_color_map)
            .and_then(|map| map.get(key).copied())
    }
}

impl LinkMut<'_> {
    pub(super) fn set_array_slot(&mut self, index: usize, link: LinkSub) -> LinkResult<()> {
        let (count, show) = {
            let this = self.as_ref()?;
            (
                this.element_count(),
                bool_prop(self.doc, self.host, props::SHOW_ELEMENT, true),
            )
        };
        if index >= count {
            return Err(LinkError::InvalidIndex {
                index: index as i64,
                count,
            });
        }
        if let Some(target) = link.object {
            check_link_cycle(self.doc, self.host, &[target])?;
        }
        if !show {
            self.doc.set_property_as(
                self.host,
                props::SHOW_ELEMENT,
                PropertyValue::Bool(true),
                ChangeOrigin::Internal,
            )?;
        }

        let (element, base) = {
            let this = self.as_ref()?;
            let element = this
                .element_object(index)
                .ok_or(LinkError::InvalidIndex {
                    index: index as i64,
                    count,
                })?;
            (element, this.link_value())
        };
        let custom = !link.is_empty();
        if let Some(ext) = self.doc.extension_mut::<LinkExtension>(element) {
            ext.custom_link = custom;
        }
        let target = if custom { link } else { base };
        self.doc.set_property_as(
            element,
            props::LINKED_OBJECT,
            PropertyValue::LinkSub(target),
            ChangeOrigin::Internal,
        )?;
        Ok(())
    }

    pub(super) fn set_group_slot(&mut self, index: usize, object: Option<ObjectId>) -> LinkResult<()> {
        let (mut list, mut visibility, mode) = {
            let this = self.as_ref()?;
            (
                this.element_list().to_vec(),
                this.visibility_list().to_vec(),
                this.link_mode(),
            )
        };

        let mut wrapper = None;
        let object = match object {
            Some(target) if mode.wraps_elements() => {
                let link = make_link(self.doc, "Link", Some(target))?;
                self.doc.add_to_group(self.host, link, None)?;
                wrapper = Some(link);
                Some(link)
            }
            other => other,
        };

        let released = match object {
            Some(object) if index >= list.len() => {
                list.push(object);
                None
            }
            Some(object) => Some(std::mem::replace(&mut list[index], object)),
            None if index < list.len() => {
                if index < visibility.len() {
                    visibility.remove(index);
                }
                Some(list.remove(index))
            }
            None => return Ok(()),
        };

        if let Err(err) = self.doc.set_property(
            self.host,
            props::ELEMENT_LIST,
            PropertyValue::LinkList(list),
        ) {
            if let Some(wrapper) = wrapper {
                self.doc.remove_object(wrapper)?;
            }
            return Err(err.into());
        }
        self.doc.set_property_as(
            self.host,
            props::VISIBILITY_LIST,
            PropertyValue::BoolList(visibility),
            ChangeOrigin::Internal,
        )?;

        if mode == super::LinkMode::AutoUnlink
            && let Some(old) = released
            && self.doc.contains(old)
            && self.doc.group_of(old)? == Some(self.host)
        {
            self.doc.remove_object(old)?;
        }
        Ok(())
    }

    /// Override the placement of slot `index`.
    pub fn set_element_placement(&mut self, index: usize, placement: Placement) -> LinkResult<()> {
        let this = self.as_ref()?;
        let count = this.element_count();
        if index >= count {
            return Err(LinkError::InvalidIndex {
                index: index as i64,
                count,
            });
        }
        match this.shape() {
            LinkShape::Array => {
                let mut list = this.placement_list().to_vec();
                if list.len() <= index {
                    list.resize(index + 1, Placement::IDENTITY);
                }
                list[index] = placement;
                self.doc.set_property(
                    self.host,
                    props::PLACEMENT_LIST,
                    PropertyValue::PlacementList(list),
                )?;
            }
            _ => {
                let object = this.element_object(index).ok_or(LinkError::InvalidIndex {
                    index: index as i64,
                    count,
                })?;
                self.doc.set_property(
                    object,
                    props::PLACEMENT,
                    PropertyValue::Placement(placement),
                )?;
            }
        }
        Ok(())
    }

    /// Override the scale of array slot `index`.
    pub fn set_element_scale(&mut self, index: usize, scale: DVec3) -> LinkResult<()> {
        let this = self.as_ref()?;
        let count = this.element_count();
        if this.shape() != LinkShape::Array || index >= count {
            return Err(LinkError::InvalidIndex {
                index: index as i64,
                count,
            });
        }
        let mut list = this.scale_list().to_vec();
        if list.len() <= index {
            list.resize(index + 1, DVec3::ONE);
        }
        list[index] = scale;
        self.doc
            .set_property(self.host, props::SCALE_LIST, PropertyValue::VectorList(list))?;
        Ok(())
    }

    /// Override the full transform of array slot `index`. An identity
    /// matrix falls back to the slot's scale.
    pub fn set_element_matrix(&mut self, index: usize, matrix: Matrix) -> LinkResult<()> {
        let this = self.as_ref()?;
        let count = this.element_count();
        if this.shape() != LinkShape::Array || index >= count {
            return Err(LinkError::InvalidIndex {
                index: index as i64,
                count,
            });
        }
        let mut list = this.matrix_list().to_vec();
        if list.len() <= index {
            list.resize(index + 1, Matrix::IDENTITY);
        }
        list[index] = matrix;
        self.doc
            .set_property(self.host, props::MATRIX_LIST, PropertyValue::MatrixList(list))?;
        Ok(())
    }

    /// Show or hide the slot addressed by `subname`.
    pub fn set_element_visible(&mut self, subname: &str, visible: bool) -> LinkResult<()> {
        let this = self.as_ref()?;
        let (index, _) = this
            .element_index(subname)
            .ok_or_else(|| LinkError::SubElementNotFound {
                subname: subname.to_string(),
            })?;
        if !self.doc.has_property(self.host, props::VISIBILITY_LIST) {
            return Err(LinkError::InvalidIndex {
                index: index as i64,
                count: this.element_count(),
            });
        }
        let mut list = this.visibility_list().to_vec();
        if index >= list.len() {
            if visible {
                return Ok(());
            }
            list.resize(index + 1, true);
        }
        list[index] = visible;
        self.doc
            .set_property(self.host, props::VISIBILITY_LIST, PropertyValue::BoolList(list))?;
        Ok(())
    }

    /// Set or clear a color override. `key` is an index (`"2"`) or a
    /// sub-name (`"2.Face1"`).
    pub fn set_element_color(&mut self, key: &str, color: Option<Color>) -> LinkResult<()> {
        let mut colors = self.as_ref()?.element_colors();
        match color {
            Some(color) => {
                colors.insert(key.to_string(), color);
            }
            None => {
                colors.remove(key);
            }
        }
        self.doc.set_property(
            self.host,
            props::COLORED_ELEMENTS,
            PropertyValue::ColorMap(colors),
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Change handling
// ---------------------------------------------------------------------

/// Returns the previous flag, `false` when `host` has no extension.
fn set_syncing(doc: &mut Document, host: ObjectId, syncing: bool) -> bool {
    doc.extension_mut::<LinkExtension>(host)
        .is_some_and(|ext| std::mem::replace(&mut ext.syncing, syncing))
}

fn with_syncing<R>(
    doc: &mut Document,
    host: ObjectId,
    f: impl FnOnce(&mut Document) -> LinkResult<R>,
) -> LinkResult<R> {
    let previous = set_syncing(doc, host, true);
    let result = f(doc);
    set_syncing(doc, host, previous);
    result
}

fn is_syncing(doc: &Document, host: ObjectId) -> bool {
    doc.extension::<LinkExtension>(host).is_some_and(|ext| ext.syncing)
}

/// React to a change of a host's own property.
pub(crate) fn on_host_changed(
    doc: &mut Document,
    host: ObjectId,
    change: &PropertyChange,
    new_elements: &Signal<NewLinkElements>,
) -> LinkResult<()> {
    let Some(ext) = doc.extension::<LinkExtension>(host) else {
        return Ok(());
    };
    let (shape, syncing) = (ext.shape, ext.syncing);

    match change.name.as_str() {
        props::SCALE => sync_scale_vector(doc, host)?,
        props::SCALE_VECTOR => sync_uniform_scale(doc, host)?,
        _ => {}
    }
    if shape != LinkShape::Array || syncing {
        return Ok(());
    }

    match change.name.as_str() {
        props::ELEMENT_COUNT => {
            with_syncing(doc, host, |doc| resize_lists(doc, host))?;
            sync_elements(doc, host, new_elements)
        }
        props::PLACEMENT_LIST
        | props::SCALE_LIST
        | props::MATRIX_LIST
        | props::VISIBILITY_LIST
        | props::SHOW_ELEMENT
        | props::LINKED_OBJECT
        | props::AUTO_LINK_LABEL
        | LABEL_PROPERTY => sync_elements(doc, host, new_elements),
        _ => Ok(()),
    }
}

fn sync_scale_vector(doc: &mut Document, id: ObjectId) -> LinkResult<()> {
    let Some(scale) = value(doc, id, props::SCALE).and_then(PropertyValue::as_float) else {
        return Ok(());
    };
    if doc.has_property(id, props::SCALE_VECTOR) {
        doc.set_property_as(
            id,
            props::SCALE_VECTOR,
            PropertyValue::Vector(DVec3::splat(scale)),
            ChangeOrigin::Internal,
        )?;
    }
    Ok(())
}

fn sync_uniform_scale(doc: &mut Document, id: ObjectId) -> LinkResult<()> {
    let Some(v) = value(doc, id, props::SCALE_VECTOR).and_then(PropertyValue::as_vector) else {
        return Ok(());
    };
    if v.x == v.y && v.y == v.z && doc.has_property(id, props::SCALE) {
        doc.set_property_as(id, props::SCALE, PropertyValue::Float(v.x), ChangeOrigin::Internal)?;
    }
    Ok(())
}

/// Fit the per-element lists to `ElementCount` and drop color overrides of
/// vanished slots.
fn resize_lists(doc: &mut Document, host: ObjectId) -> LinkResult<()> {
    let (count, placements, scales, matrices, visibility, colors) = {
        let link = doc.link(host)?;
        let count = link.element_count();

        let mut placements = link.placement_list().to_vec();
        placements.resize(count, Placement::IDENTITY);
        let mut scales = link.scale_list().to_vec();
        scales.resize(count, DVec3::ONE);
        let mut matrices = link.matrix_list().to_vec();
        matrices.truncate(count);
        let mut visibility = link.visibility_list().to_vec();
        visibility.truncate(count);
        let colors: BTreeMap<String, Color> = link
            .element_colors()
            .into_iter()
            .filter(|(key, _)| subname::get_array_index(key).is_none_or(|(i, _)| i < count))
            .collect();
        (count, placements, scales, matrices, visibility, colors)
    };

    let internal = ChangeOrigin::Internal;
    doc.set_property_as(host, props::PLACEMENT_LIST, PropertyValue::PlacementList(placements), internal)?;
    doc.set_property_as(host, props::SCALE_LIST, PropertyValue::VectorList(scales), internal)?;
    doc.set_property_as(host, props::MATRIX_LIST, PropertyValue::MatrixList(matrices), internal)?;
    doc.set_property_as(host, props::VISIBILITY_LIST, PropertyValue::BoolList(visibility), internal)?;
    doc.set_property_as(host, props::COLORED_ELEMENTS, PropertyValue::ColorMap(colors), internal)?;
    tracing::debug!(target: "trellis_link::link", object = ?host, count, "resized element lists");
    Ok(())
}

/// Bring the element objects of an array in line with its lists.
///
/// With `ShowElement` off every element object is removed. Otherwise one
/// element exists per slot, carrying the slot placement, scale and
/// visibility, and linking to the base object unless it was given its own
/// target.
pub(crate) fn sync_elements(
    doc: &mut Document,
    host: ObjectId,
    new_elements: &Signal<NewLinkElements>,
) -> LinkResult<()> {
    match doc.extension::<LinkExtension>(host) {
        Some(ext) if ext.shape == LinkShape::Array && !ext.syncing => {}
        _ => return Ok(()),
    }
    let created = with_syncing(doc, host, |doc| sync_elements_inner(doc, host))?;
    if let Some((start, end)) = created {
        tracing::debug!(target: "trellis_link::link", object = ?host, start, end, "created link elements");
        new_elements.emit(NewLinkElements { host, start, end });
    }
    Ok(())
}

fn sync_elements_inner(doc: &mut Document, host: ObjectId) -> LinkResult<Option<(usize, usize)>> {
    let (show, existing, base, states, host_name, label_base) = {
        let link = doc.link(host)?;
        let label_base = bool_prop(doc, host, props::AUTO_LINK_LABEL, false)
            .then(|| doc.label(host).map(str::to_string))
            .transpose()?;
        (
            bool_prop(doc, host, props::SHOW_ELEMENT, true),
            link.element_list().to_vec(),
            link.link_value(),
            link.elements(),
            object_name(doc, host),
            label_base,
        )
    };

    if !show {
        if existing.is_empty() {
            return Ok(None);
        }
        for element in existing {
            doc.remove_object(element)?;
        }
        doc.set_property_as(
            host,
            props::ELEMENT_LIST,
            PropertyValue::LinkList(Vec::new()),
            ChangeOrigin::Internal,
        )?;
        return Ok(None);
    }

    let mut created: Option<(usize, usize)> = None;
    let mut list = Vec::with_capacity(states.len());
    for index in 0..states.len() {
        let element = match existing.get(index).copied().filter(|&e| doc.contains(e)) {
            Some(element) => element,
            None => {
                let element = create_element(doc, host, &host_name, index)?;
                created = Some(match created {
                    Some((start, _)) => (start, index + 1),
                    None => (index, index + 1),
                });
                element
            }
        };
        list.push(element);
    }
    for &extra in existing.iter().skip(states.len()) {
        doc.remove_object(extra)?;
    }
    if existing != list {
        doc.set_property_as(
            host,
            props::ELEMENT_LIST,
            PropertyValue::LinkList(list.clone()),
            ChangeOrigin::Internal,
        )?;
    }

    for (state, &element) in states.iter().zip(&list) {
        let label = label_base
            .as_ref()
            .map(|base| subname::element_object_name(base, state.index));
        update_element(doc, element, state, &base, label)?;
    }
    Ok(created)
}

fn create_element(
    doc: &mut Document,
    host: ObjectId,
    host_name: &str,
    index: usize,
) -> LinkResult<ObjectId> {
    let element = doc.add_object(LINK_ELEMENT_TYPE, &subname::element_object_name(host_name, index));
    add_element_properties(doc, element)?;
    let mut ext = LinkExtension::new(LinkShape::Single);
    ext.element_of = Some(host);
    doc.set_extension(element, ext)?;
    doc.add_to_group(host, element, None)?;
    Ok(element)
}

pub(super) fn add_element_properties(doc: &mut Document, element: ObjectId) -> LinkResult<()> {
    add_single_properties(doc, element)?;
    doc.ensure_property(element, VISIBILITY, || {
        PropertyCell::new(PropertyValue::Bool(true)).with_group("Base")
    })?;
    Ok(())
}

fn update_element(
    doc: &mut Document,
    element: ObjectId,
    state: &ElementState,
    base: &LinkSub,
    label: Option<String>,
) -> LinkResult<()> {
    let internal = ChangeOrigin::Internal;
    doc.set_property_as(element, props::PLACEMENT, PropertyValue::Placement(state.placement), internal)?;
    doc.set_property_as(element, props::SCALE_VECTOR, PropertyValue::Vector(state.scale), internal)?;
    doc.set_property_as(element, VISIBILITY, PropertyValue::Bool(state.visible), internal)?;
    let custom = doc
        .extension::<LinkExtension>(element)
        .is_some_and(|ext| ext.custom_link);
    if !custom {
        doc.set_property_as(element, props::LINKED_OBJECT, PropertyValue::LinkSub(base.clone()), internal)?;
    }
    if let Some(label) = label {
        doc.set_label(element, label)?;
    }
    Ok(())
}

/// Write user edits of an element object back into the host lists.
pub(crate) fn on_element_changed(
    doc: &mut Document,
    host: ObjectId,
    element: ObjectId,
    change: &PropertyChange,
) -> LinkResult<()> {
    if change.origin != ChangeOrigin::User || is_syncing(doc, host) || !doc.contains(host) {
        return Ok(());
    }
    if change.name == props::LINKED_OBJECT {
        let custom = value(doc, element, props::LINKED_OBJECT)
            .and_then(PropertyValue::as_link_sub)
            .is_some_and(|link| !link.is_empty());
        if let Some(ext) = doc.extension_mut::<LinkExtension>(element) {
            ext.custom_link = custom;
        }
        return Ok(());
    }

    let link = doc.link(host)?;
    let Some(index) = link.element_list().iter().position(|&e| e == element) else {
        return Ok(());
    };
    let (name, new_value) = match change.name.as_str() {
        props::PLACEMENT => {
            let mut list = link.placement_list().to_vec();
            if list.len() <= index {
                list.resize(index + 1, Placement::IDENTITY);
            }
            list[index] = placement_prop(doc, element, props::PLACEMENT);
            (props::PLACEMENT_LIST, PropertyValue::PlacementList(list))
        }
        props::SCALE_VECTOR => {
            let mut list = link.scale_list().to_vec();
            if list.len() <= index {
                list.resize(index + 1, DVec3::ONE);
            }
            list[index] = value(doc, element, props::SCALE_VECTOR)
                .and_then(PropertyValue::as_vector)
                .unwrap_or(DVec3::ONE);
            (props::SCALE_LIST, PropertyValue::VectorList(list))
        }
        VISIBILITY => {
            let mut list = link.visibility_list().to_vec();
            if list.len() <= index {
                list.resize(index + 1, true);
            }
            list[index] = bool_prop(doc, element, VISIBILITY, true);
            (props::VISIBILITY_LIST, PropertyValue::BoolList(list))
        }
        _ => return Ok(()),
    };
    with_syncing(doc, host, |doc| {
        doc.set_property_as(host, name, new_value, ChangeOrigin::Internal)?;
        Ok(())
    })
}
