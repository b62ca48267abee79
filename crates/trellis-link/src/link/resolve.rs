//! Link resolution: cycle checks, link chains and sub-object lookup.

use std::collections::HashSet;

use trellis_core::{Document, Matrix, ObjectId};

use super::{LinkDocumentExt, LinkRef, LinkShape, object_name, placement_prop, props};
use crate::error::{LinkError, LinkResult};
use crate::subname::{self, SubnamePath};

/// An object reached through a sub-name.
#[derive(Clone, Debug, PartialEq)]
pub struct SubObject {
    pub object: ObjectId,
    /// Accumulated transform from the host's parent frame.
    pub matrix: Matrix,
    /// Trailing geometry element name, possibly empty.
    pub element: String,
}

/// Objects `id` refers to through links and group membership.
fn link_edges(doc: &Document, id: ObjectId) -> Vec<ObjectId> {
    let mut out = Vec::new();
    if let Ok(link) = doc.link(id) {
        out.extend(link.link_value().object);
        if link.shape() != LinkShape::Single {
            out.extend_from_slice(link.element_list());
        }
    }
    if doc.object(id).is_ok_and(|data| data.is_group())
        && let Ok(members) = doc.members(id)
    {
        out.extend_from_slice(members);
    }
    out
}

/// Reject a link assignment on `host` whose targets would lead back to it.
///
/// A cycle exists when a target is the host itself, when following the
/// target's own links reaches the host, or when the target is a plain group
/// containing the host.
pub(crate) fn check_link_cycle(doc: &Document, host: ObjectId, targets: &[ObjectId]) -> LinkResult<()> {
    for &target in targets {
        let mut visited = HashSet::new();
        let mut stack = vec![target];
        while let Some(current) = stack.pop() {
            if current == host {
                tracing::debug!(target: "trellis_link::link", object = ?host, target = ?target, "rejected circular link");
                return Err(LinkError::CircularLink {
                    object: object_name(doc, target),
                });
            }
            if !visited.insert(current) || !doc.contains(current) {
                continue;
            }
            stack.extend(link_edges(doc, current));
        }
    }
    Ok(())
}

/// Follow object segments of `subname` through plain-group members,
/// accumulating member placements.
fn walk_members(doc: &Document, mut object: ObjectId, subname: &str) -> (ObjectId, Matrix) {
    let mut matrix = Matrix::IDENTITY;
    let Ok(path) = SubnamePath::parse(subname) else {
        return (object, matrix);
    };
    for segment in path.objects {
        let Some(member) = member_by_segment(doc, object, segment) else {
            break;
        };
        matrix *= placement_prop(doc, member, props::PLACEMENT).to_matrix();
        object = member;
    }
    (object, matrix)
}

/// Member of `group` named by `segment`, either an object name or `$Label`.
pub(super) fn member_by_segment(doc: &Document, group: ObjectId, segment: &str) -> Option<ObjectId> {
    let members = doc.members(group).ok()?;
    match subname::label_segment(segment) {
        Some(label) => members
            .iter()
            .copied()
            .find(|&m| doc.label(m).is_ok_and(|l| l == label)),
        None => members
            .iter()
            .copied()
            .find(|&m| doc.name(m).is_ok_and(|n| n == segment)),
    }
}

impl<'a> LinkRef<'a> {
    /// Directly linked object, after following the object segments of the
    /// first sub-name.
    fn link_target(&self) -> Option<(ObjectId, Matrix)> {
        let target = self.linked_object()?;
        match self.linked_subs().first() {
            Some(sub) => Some(walk_members(self.doc, target, sub)),
            None => Some((target, Matrix::IDENTITY)),
        }
    }

    /// Resolve through chained links.
    ///
    /// Returns the final object and the transform accumulated on the way,
    /// host placement included. `None` when nothing is linked or the target
    /// was deleted.
    pub fn true_linked_object(&self, recurse: bool) -> LinkResult<Option<(ObjectId, Matrix)>> {
        self.true_linked_object_ex(recurse, 0, false)
    }

    /// [`true_linked_object`](Self::true_linked_object) with an explicit
    /// starting depth. With `no_element`, materialized array elements
    /// resolve to nothing.
    pub fn true_linked_object_ex(
        &self,
        recurse: bool,
        depth: usize,
        no_element: bool,
    ) -> LinkResult<Option<(ObjectId, Matrix)>> {
        if no_element && self.ext.element_of.is_some() {
            return Ok(None);
        }
        let max_depth = self.doc.params().max_link_depth;
        let Some((mut current, offset)) = self.link_target() else {
            return Ok(None);
        };
        let mut matrix = self.transform(true) * offset;
        let mut visited = HashSet::from([self.host]);
        let mut depth = depth + 1;
        if !visited.insert(current) {
            return Err(LinkError::CircularLink {
                object: object_name(self.doc, current),
            });
        }

        while recurse {
            let Ok(next_link) = self.doc.link(current) else {
                break;
            };
            if next_link.shape() == LinkShape::Group {
                break;
            }
            let Some((next, offset)) = next_link.link_target() else {
                break;
            };
            depth += 1;
            if depth > max_depth || !visited.insert(next) {
                tracing::warn!(target: "trellis_link::link", object = ?self.host, depth, "link chain does not terminate");
                return Err(LinkError::CircularLink {
                    object: object_name(self.doc, next),
                });
            }
            matrix = matrix * next_link.transform(false) * offset;
            current = next;
        }
        Ok(Some((current, matrix)))
    }

    /// The object this host stands for: the linked object (followed
    /// through chains when `recurse`), or `None` for link groups and empty
    /// links.
    pub fn extension_get_linked_object(&self, recurse: bool) -> LinkResult<Option<ObjectId>> {
        if self.ext.shape == LinkShape::Group {
            return Ok(None);
        }
        Ok(self.true_linked_object(recurse)?.map(|(object, _)| object))
    }

    /// Objects this host exposes as children to the dependency graph.
    ///
    /// Link groups expose their elements, arrays their materialized element
    /// objects, flattening links the linked group's members. With `filter`,
    /// objects whose owning group is itself in the list are dropped.
    /// Visibility never filters.
    pub fn linked_children(&self, filter: bool) -> Vec<ObjectId> {
        let all: Vec<ObjectId> = match self.ext.shape {
            LinkShape::Group => self.element_list().to_vec(),
            LinkShape::Array if !self.element_list().is_empty() => self.element_list().to_vec(),
            _ => self.flattened_children().to_vec(),
        };
        let live: Vec<ObjectId> = all.into_iter().filter(|&id| self.doc.contains(id)).collect();
        if !filter {
            return live;
        }
        live.iter()
            .copied()
            .filter(|&id| {
                self.doc
                    .group_of(id)
                    .ok()
                    .flatten()
                    .is_none_or(|group| !live.contains(&group))
            })
            .collect()
    }

    /// Sub-names of the objects directly addressable below this host.
    pub fn extension_get_sub_objects(&self) -> Vec<String> {
        match self.ext.shape {
            LinkShape::Array => (0..self.element_count()).map(|i| format!("{i}.")).collect(),
            LinkShape::Group => self
                .element_list()
                .iter()
                .filter(|&&id| self.doc.contains(id))
                .map(|&id| format!("{}.", object_name(self.doc, id)))
                .collect(),
            LinkShape::Single => {
                let Some(target) = self.linked_object() else {
                    return Vec::new();
                };
                match self.doc.link(target) {
                    Ok(inner) => inner.extension_get_sub_objects(),
                    Err(_) => self
                        .doc
                        .members(target)
                        .map(|members| {
                            members
                                .iter()
                                .map(|&m| format!("{}.", object_name(self.doc, m)))
                                .collect()
                        })
                        .unwrap_or_default(),
                }
            }
        }
    }

    /// Resolve `subname` to the object it addresses.
    ///
    /// `Ok(None)` means the path does not (currently) resolve: a deleted
    /// target, an unknown member or an index past the end. Malformed paths
    /// and link cycles are errors.
    pub fn extension_get_sub_object(&self, subname: &str) -> LinkResult<Option<SubObject>> {
        self.sub_object_at(subname, true, 0)
    }

    fn sub_object_at(
        &self,
        subname: &str,
        with_placement: bool,
        depth: usize,
    ) -> LinkResult<Option<SubObject>> {
        if depth > self.doc.params().max_link_depth {
            return Err(LinkError::CircularLink {
                object: object_name(self.doc, self.host),
            });
        }
        SubnamePath::parse(subname)?;
        let matrix = self.transform(with_placement);
        if subname.is_empty() {
            return Ok(Some(SubObject {
                object: self.host,
                matrix,
                element: String::new(),
            }));
        }

        match self.ext.shape {
            LinkShape::Array | LinkShape::Group => {
                let Some((index, rest)) = self.element_index(subname) else {
                    return Ok(None);
                };
                let state = self.element(index);
                let matrix = matrix * state.transform();
                let target = match self.ext.shape {
                    LinkShape::Array => state
                        .object
                        .and_then(|element| self.doc.link(element).ok()?.linked_object())
                        .or_else(|| self.linked_object()),
                    _ => state.object,
                };
                let Some(target) = target else {
                    return Ok(None);
                };
                descend(self.doc, target, rest, matrix, depth + 1)
            }
            LinkShape::Single => {
                let Some((target, offset)) = self.link_target() else {
                    return Ok(None);
                };
                let expanded = match self.element_index(subname) {
                    Some((index, rest)) => match self.element_name_from_index(index) {
                        Some(chain) => format!("{chain}{rest}"),
                        None => subname.to_string(),
                    },
                    None => self.expand_subname(subname)?,
                };
                descend(self.doc, target, &expanded, matrix * offset, depth + 1)
            }
        }
    }
}

/// Continue resolving `rest` below `object`.
fn descend(
    doc: &Document,
    object: ObjectId,
    rest: &str,
    matrix: Matrix,
    depth: usize,
) -> LinkResult<Option<SubObject>> {
    let path = SubnamePath::parse(rest)?;
    if path.objects.is_empty() {
        return Ok(Some(SubObject {
            object,
            matrix,
            element: rest.to_string(),
        }));
    }
    if let Ok(link) = doc.link(object) {
        return Ok(link
            .sub_object_at(rest, false, depth)?
            .map(|sub| SubObject {
                matrix: matrix * sub.matrix,
                ..sub
            }));
    }

    let head = path.objects[0];
    let Some(member) = member_by_segment(doc, object, head) else {
        return Ok(None);
    };
    let matrix = matrix * placement_prop(doc, member, props::PLACEMENT).to_matrix();
    descend(doc, member, &rest[head.len() + 1..], matrix, depth + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{make_link, make_link_array, make_link_group};
    use glam::DVec3;
    use std::sync::Arc;
    use trellis_core::{LinkSub, Placement, PropertyCell, PropertyValue};

    fn setup() -> (Document, ObjectId) {
        let mut doc = Document::new();
        crate::install(&mut doc, Arc::new(crate::kernel::MemoryKernel::new()));
        let cube = doc.add_object("Part::Box", "Box");
        (doc, cube)
    }

    #[test]
    fn test_chain_resolution_accumulates_transform() {
        let (mut doc, cube) = setup();
        let inner = make_link(&mut doc, "Inner", Some(cube)).unwrap();
        let outer = make_link(&mut doc, "Outer", Some(inner)).unwrap();
        doc.set_property(
            outer,
            props::PLACEMENT,
            PropertyValue::Placement(Placement::from_translation(DVec3::X)),
        )
        .unwrap();

        let view = doc.link(outer).unwrap();
        let (target, matrix) = view.true_linked_object(true).unwrap().unwrap();
        assert_eq!(target, cube);
        assert_eq!(matrix.transform_point3(DVec3::ZERO), DVec3::X);

        let (direct, _) = view.true_linked_object(false).unwrap().unwrap();
        assert_eq!(direct, inner);
        assert_eq!(view.extension_get_linked_object(true).unwrap(), Some(cube));
    }

    #[test]
    fn test_cycle_rejected_on_assignment() {
        let (mut doc, cube) = setup();
        let a = make_link(&mut doc, "A", Some(cube)).unwrap();
        let b = make_link(&mut doc, "B", Some(a)).unwrap();
        let err = doc
            .link_mut(a)
            .unwrap()
            .set_link(-1, Some(b), None, Vec::new())
            .unwrap_err();
        assert!(matches!(err, LinkError::CircularLink { .. }));
        // Unchanged after the veto.
        assert_eq!(doc.link(a).unwrap().linked_object(), Some(cube));

        let err = doc
            .link_mut(a)
            .unwrap()
            .set_link(-1, Some(a), None, Vec::new())
            .unwrap_err();
        assert!(matches!(err, LinkError::CircularLink { .. }));
    }

    #[test]
    fn test_cycle_through_containing_group() {
        let (mut doc, _) = setup();
        let group = doc.add_group("Group");
        let link = make_link(&mut doc, "Link", None).unwrap();
        doc.add_to_group(group, link, None).unwrap();
        let err = doc
            .link_mut(link)
            .unwrap()
            .set_link(-1, Some(group), None, Vec::new())
            .unwrap_err();
        assert!(matches!(err, LinkError::CircularLink { .. }));
    }

    #[test]
    fn test_depth_bound() {
        let mut doc = Document::with_params(trellis_core::LinkParams {
            max_link_depth: 3,
            ..Default::default()
        });
        crate::install(&mut doc, Arc::new(crate::kernel::MemoryKernel::new()));
        let cube = doc.add_object("Part::Box", "Box");
        let mut last = cube;
        for _ in 0..5 {
            last = make_link(&mut doc, "Link", Some(last)).unwrap();
        }
        let err = doc.link(last).unwrap().true_linked_object(true).unwrap_err();
        assert!(matches!(err, LinkError::CircularLink { .. }));
        assert!(doc.link(last).unwrap().true_linked_object(false).is_ok());
    }

    #[test]
    fn test_dangling_target_degrades_to_empty() {
        let (mut doc, cube) = setup();
        let link = make_link(&mut doc, "Link", Some(cube)).unwrap();
        doc.remove_object(cube).unwrap();
        let view = doc.link(link).unwrap();
        assert_eq!(view.linked_object(), None);
        assert_eq!(view.true_linked_object(true).unwrap(), None);
        assert_eq!(view.extension_get_sub_object("Face1").unwrap().map(|s| s.element), None);
    }

    #[test]
    fn test_sub_object_through_array() {
        let (mut doc, cube) = setup();
        let array = make_link_array(&mut doc, "Array", Some(cube), 3).unwrap();
        doc.link_mut(array)
            .unwrap()
            .set_element_placement(2, Placement::from_translation(DVec3::Y))
            .unwrap();

        let view = doc.link(array).unwrap();
        let sub = view.extension_get_sub_object("2.Face1").unwrap().unwrap();
        assert_eq!(sub.object, cube);
        assert_eq!(sub.element, "Face1");
        assert_eq!(sub.matrix.transform_point3(DVec3::ZERO), DVec3::Y);
        assert!(view.extension_get_sub_object("5.Face1").unwrap().is_none());
        assert_eq!(view.extension_get_sub_objects(), vec!["0.", "1.", "2."]);
        assert!(matches!(
            view.extension_get_sub_object("2..Face1"),
            Err(LinkError::InvalidSubname(_))
        ));
    }

    #[test]
    fn test_sub_object_through_flattened_group() {
        let (mut doc, cube) = setup();
        let parts = doc.add_group("Parts");
        let sub = doc.add_group("Sub");
        doc.add_to_group(parts, sub, None).unwrap();
        doc.add_to_group(sub, cube, None).unwrap();
        doc.add_property(
            cube,
            props::PLACEMENT,
            PropertyCell::new(PropertyValue::Placement(Placement::from_translation(DVec3::Z))),
        )
        .unwrap();
        let link = make_link(&mut doc, "Link", Some(parts)).unwrap();

        let view = doc.link(link).unwrap();
        let by_name = view.extension_get_sub_object("Box.Edge1").unwrap().unwrap();
        let by_chain = view.extension_get_sub_object("Sub.Box.Edge1").unwrap().unwrap();
        assert_eq!(by_name, by_chain);
        assert_eq!(by_name.object, cube);
        assert_eq!(by_name.matrix.transform_point3(DVec3::ZERO), DVec3::Z);
        assert_eq!(view.extension_get_sub_objects(), vec!["Sub."]);
    }

    #[test]
    fn test_linked_children_keep_hidden_elements() {
        let (mut doc, cube) = setup();
        let other = doc.add_object("Part::Cylinder", "Cylinder");
        let group = make_link_group(&mut doc, "LinkGroup").unwrap();
        let mut view = doc.link_mut(group).unwrap();
        view.set_link(0, Some(cube), None, Vec::new()).unwrap();
        view.set_link(1, Some(other), None, Vec::new()).unwrap();
        view.set_element_visible("1.", false).unwrap();

        let view = doc.link(group).unwrap();
        assert!(!view.is_element_visible("1."));
        assert_eq!(view.linked_children(true), vec![cube, other]);
    }

    #[test]
    fn test_linked_children_filter_nested_members() {
        let (mut doc, cube) = setup();
        let parts = doc.add_group("Parts");
        let sub = doc.add_group("Sub");
        doc.add_to_group(parts, sub, None).unwrap();
        doc.add_to_group(sub, cube, None).unwrap();
        let link = make_link(&mut doc, "Link", Some(parts)).unwrap();
        let view = doc.link(link).unwrap();
        assert_eq!(view.linked_children(false), vec![sub, cube]);
        assert_eq!(view.linked_children(true), vec![sub]);
    }

    #[test]
    fn test_link_with_sub_path_targets_member() {
        let (mut doc, cube) = setup();
        let parts = doc.add_group("Parts");
        doc.add_to_group(parts, cube, None).unwrap();
        let link = make_link(&mut doc, "Link", None).unwrap();
        doc.set_property(
            link,
            props::LINKED_OBJECT,
            PropertyValue::LinkSub(LinkSub::with_subs(parts, ["Box."])),
        )
        .unwrap();
        let (target, _) = doc.link(link).unwrap().true_linked_object(true).unwrap().unwrap();
        assert_eq!(target, cube);
    }
}
