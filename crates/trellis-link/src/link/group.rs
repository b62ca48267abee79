//! Plain-group flattening and element addressing.
//!
//! A single link or array whose target is a plain group may present the
//! group's members, nested groups included, as if they were its own direct
//! children. The flattened member list is cached on the host and dropped
//! whenever the membership of any group in the subtree changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use trellis_core::{ConnectionGuard, Document, ObjectId, Property};

use super::resolve::member_by_segment;
use super::{LinkDocumentExt, LinkExtension, LinkMut, LinkRef, LinkShape, object_name};
use crate::error::LinkResult;
use crate::subname::{self, SubnamePath};

/// Hook that owns the group watches.
pub(crate) const LINK_HOOK: &str = "link";
/// Watch topic for membership changes of flattened groups.
pub(crate) const GROUP_TOPIC: &str = "group";

/// Label to index lookup table for `$Label` addressing.
///
/// Any label change in the document marks the table stale; it is rebuilt
/// on the next lookup.
pub struct LabelCache {
    stale: Arc<AtomicBool>,
    map: Property<Option<HashMap<String, usize>>>,
    _labels: ConnectionGuard<(ObjectId, String)>,
}

impl LabelCache {
    fn new(doc: &Document) -> Self {
        let stale = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&stale);
        let guard = doc
            .signals()
            .label_changed
            .connect_scoped(move |_| flag.store(true, Ordering::Release));
        Self {
            stale,
            map: Property::new(None),
            _labels: guard,
        }
    }

    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire) || self.map.with(Option::is_none)
    }

    fn lookup(&self, doc: &Document, candidates: &[ObjectId], label: &str) -> Option<usize> {
        if self.stale.swap(false, Ordering::AcqRel) {
            self.map.set_silent(None);
        }
        if self.map.with(Option::is_none) {
            let mut map = HashMap::with_capacity(candidates.len());
            for (index, &id) in candidates.iter().enumerate() {
                if let Ok(label) = doc.label(id) {
                    map.entry(label.to_string()).or_insert(index);
                }
            }
            tracing::trace!(target: "trellis_link::link", entries = map.len(), "rebuilt label cache");
            self.map.set_silent(Some(map));
        }
        self.map
            .with(|map| map.as_ref().and_then(|map| map.get(label).copied()))
    }
}

/// Members of `group` in pre-order, descending into nested plain groups only.
fn flatten_members(doc: &Document, group: ObjectId, out: &mut Vec<ObjectId>) {
    let Ok(members) = doc.members(group) else {
        return;
    };
    for &member in members {
        out.push(member);
        if doc.object(member).is_ok_and(|data| data.is_group()) {
            flatten_members(doc, member, out);
        }
    }
}

fn is_plain_group(doc: &Document, id: ObjectId) -> bool {
    doc.object(id).is_ok_and(|data| data.is_group())
}

impl<'a> LinkRef<'a> {
    /// Flattened members of the linked plain group. Empty unless the host
    /// is flattening.
    pub fn flattened_children(&self) -> Arc<Vec<ObjectId>> {
        let Some(group) = self.linked_object().filter(|_| self.is_flattening()) else {
            return Arc::new(Vec::new());
        };
        if let Some(cached) = self.ext.child_cache.get() {
            return cached;
        }
        let mut members = Vec::new();
        flatten_members(self.doc, group, &mut members);
        let members = Arc::new(members);
        self.ext.child_cache.set_silent(Some(Arc::clone(&members)));
        members
    }

    /// Objects that can be addressed by index, name or label.
    fn addressable(&self) -> Vec<ObjectId> {
        match self.ext.shape {
            LinkShape::Array | LinkShape::Group => self.element_list().to_vec(),
            LinkShape::Single => self.flattened_children().to_vec(),
        }
    }

    fn addressable_count(&self, addressable: &[ObjectId]) -> usize {
        match self.ext.shape {
            LinkShape::Array => self.element_count(),
            _ => addressable.len(),
        }
    }

    fn index_of_label(&self, label: &str, candidates: &[ObjectId]) -> Option<usize> {
        match &self.ext.label_cache {
            Some(cache) => cache.lookup(self.doc, candidates, label),
            None => candidates
                .iter()
                .position(|&id| self.doc.label(id).is_ok_and(|l| l == label)),
        }
    }

    /// Resolve the first segment of `subname` to a slot index.
    ///
    /// Accepts a decimal index, `$Label`, the `<Host>_i<N>` element name or
    /// the internal name of an element object. Returns the index and the
    /// rest of the sub-name.
    pub fn element_index<'s>(&self, subname: &'s str) -> Option<(usize, &'s str)> {
        let candidates = self.addressable();
        let count = self.addressable_count(&candidates);
        if let Some((index, rest)) = subname::get_array_index(subname) {
            return (index < count).then_some((index, rest));
        }

        let (head, rest) = subname::split_first(subname)?;
        if self.ext.shape == LinkShape::Array
            && let Ok(host_name) = self.doc.name(self.host)
            && let Some(index) = subname::parse_element_name(host_name, head)
        {
            return (index < count).then_some((index, rest));
        }
        if let Some(label) = subname::label_segment(head) {
            return self.index_of_label(label, &candidates).map(|i| (i, rest));
        }
        candidates
            .iter()
            .position(|&id| self.doc.name(id).is_ok_and(|n| n == head))
            .map(|index| (index, rest))
    }

    /// Sub-name prefix addressing slot `index`: `"i."` for arrays, the
    /// element name for groups and the full group chain for flattened
    /// members.
    pub fn element_name_from_index(&self, index: usize) -> Option<String> {
        match self.ext.shape {
            LinkShape::Array => (index < self.element_count()).then(|| format!("{index}.")),
            LinkShape::Group => self
                .element_object(index)
                .map(|object| format!("{}.", object_name(self.doc, object))),
            LinkShape::Single => {
                let members = self.flattened_children();
                let object = *members.get(index)?;
                Some(self.member_chain(object))
            }
        }
    }

    /// `Group.Sub.Object.` path of a flattened member relative to the
    /// linked group.
    fn member_chain(&self, object: ObjectId) -> String {
        let root = self.linked_object();
        let mut names = vec![object_name(self.doc, object)];
        let ancestors = self.doc.registry().ancestors(object).unwrap_or_default();
        for ancestor in ancestors {
            if Some(ancestor) == root {
                break;
            }
            names.push(object_name(self.doc, ancestor));
        }
        names.reverse();
        let mut chain = names.join(".");
        chain.push('.');
        chain
    }

    fn split_array_prefix<'s>(&self, subname: &'s str) -> (&'s str, &'s str) {
        if self.ext.shape == LinkShape::Array
            && let Some((_, rest)) = subname::get_array_index(subname)
        {
            let prefix_len = subname.len() - rest.len();
            return subname.split_at(prefix_len);
        }
        ("", subname)
    }

    /// Strip the plain-group segments a flattening host hides from its
    /// callers: `SubGroup.Box.Face1` becomes `Box.Face1`. A leading array
    /// index is kept. Group segments may be given as `$Label`; they are
    /// dropped like named ones.
    pub fn flatten_subname(&self, subname: &str) -> LinkResult<String> {
        let path = SubnamePath::parse(subname)?;
        let Some(group) = self.linked_object().filter(|_| self.is_flattening()) else {
            return Ok(subname.to_string());
        };
        let (prefix, body) = self.split_array_prefix(subname);
        let objects = if prefix.is_empty() {
            path.objects
        } else {
            SubnamePath::parse(body)?.objects
        };

        let mut current = group;
        let mut consumed = 0;
        for pair in objects.windows(2) {
            let Some(member) = member_by_segment(self.doc, current, pair[0]) else {
                break;
            };
            if !is_plain_group(self.doc, member) || member_by_segment(self.doc, member, pair[1]).is_none() {
                break;
            }
            current = member;
            consumed += pair[0].len() + 1;
        }
        Ok(format!("{prefix}{}", &body[consumed..]))
    }

    /// Inverse of [`flatten_subname`](Self::flatten_subname): restore the
    /// group chain in front of a flattened member.
    ///
    /// The restored chain always uses object names, so a path whose group
    /// segments were spelled as `$Label` comes back with names instead.
    pub fn expand_subname(&self, subname: &str) -> LinkResult<String> {
        SubnamePath::parse(subname)?;
        if !self.is_flattening() {
            return Ok(subname.to_string());
        }
        let (prefix, body) = self.split_array_prefix(subname);
        let Some((head, rest)) = subname::split_first(body) else {
            return Ok(subname.to_string());
        };
        let members = self.flattened_children();
        let found = match subname::label_segment(head) {
            Some(label) => self.index_of_label(label, &members),
            None => members
                .iter()
                .position(|&id| self.doc.name(id).is_ok_and(|n| n == head)),
        };
        let Some(object) = found.map(|index| members[index]) else {
            return Ok(subname.to_string());
        };
        Ok(format!("{prefix}{}{rest}", self.member_chain(object)))
    }
}

impl LinkMut<'_> {
    /// Enable or disable the `$Label` lookup cache.
    pub fn cache_child_label(&mut self, enable: bool) -> LinkResult<()> {
        let cache = enable.then(|| LabelCache::new(self.doc));
        let ext = self.doc.require_extension_mut::<LinkExtension>(self.host)?;
        if enable && ext.label_cache.is_some() {
            return Ok(());
        }
        ext.label_cache = cache;
        Ok(())
    }
}

/// Drop the flattened child cache and the label table.
pub(crate) fn invalidate_child_cache(doc: &Document, host: ObjectId) {
    if let Some(ext) = doc.extension::<LinkExtension>(host) {
        ext.child_cache.set_silent(None);
        if let Some(cache) = &ext.label_cache {
            cache.invalidate();
        }
    }
}

/// Re-subscribe to the membership of every plain group in the linked
/// subtree and drop the caches.
pub(crate) fn refresh_group_watches(doc: &mut Document, host: ObjectId) -> LinkResult<()> {
    let Some(ext) = doc.extension_mut::<LinkExtension>(host) else {
        return Ok(());
    };
    let old = std::mem::take(&mut ext.group_watches);
    for id in old {
        doc.unwatch(id);
    }
    invalidate_child_cache(doc, host);

    let groups: Vec<ObjectId> = {
        let link = doc.link(host).ok();
        match link.and_then(|link| link.linked_object().filter(|_| link.is_flattening())) {
            Some(root) => {
                let mut members = Vec::new();
                flatten_members(doc, root, &mut members);
                std::iter::once(root)
                    .chain(members.into_iter().filter(|&m| is_plain_group(doc, m)))
                    .collect()
            }
            None => Vec::new(),
        }
    };
    let watches: Vec<_> = groups
        .iter()
        .map(|&group| doc.watch(group, host, LINK_HOOK, GROUP_TOPIC))
        .collect();
    tracing::trace!(target: "trellis_link::link", object = ?host, groups = watches.len(), "refreshed group watches");
    if let Some(ext) = doc.extension_mut::<LinkExtension>(host) {
        ext.group_watches = watches;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{make_link, make_link_array, props};
    use std::sync::Arc;
    use trellis_core::{ChangeOrigin, PropertyValue};

    /// Doc with `Parts { SubGroup { Box }, Cylinder }` linked by `Link`.
    fn nested() -> (Document, ObjectId, ObjectId, ObjectId) {
        let mut doc = Document::new();
        crate::install(&mut doc, Arc::new(crate::kernel::MemoryKernel::new()));
        let parts = doc.add_group("Parts");
        let sub = doc.add_group("SubGroup");
        let cube = doc.add_object("Part::Box", "Box");
        let cylinder = doc.add_object("Part::Cylinder", "Cylinder");
        doc.add_to_group(parts, sub, None).unwrap();
        doc.add_to_group(sub, cube, None).unwrap();
        doc.add_to_group(parts, cylinder, None).unwrap();
        let link = make_link(&mut doc, "Link", Some(parts)).unwrap();
        (doc, link, parts, cube)
    }

    #[test]
    fn test_flattened_children() {
        let (doc, link, _, cube) = nested();
        let link = doc.link(link).unwrap();
        assert!(link.is_flattening());
        let names: Vec<&str> = link
            .flattened_children()
            .iter()
            .map(|&id| doc.name(id).unwrap())
            .collect();
        assert_eq!(names, vec!["SubGroup", "Box", "Cylinder"]);
        assert_eq!(link.element_index("Box.Face1"), Some((1, "Face1")));
        assert_eq!(link.element_name_from_index(1).as_deref(), Some("SubGroup.Box."));
        assert_eq!(link.element_name_from_index(2).as_deref(), Some("Cylinder."));
        assert!(link.flattened_children().contains(&cube));
    }

    #[test]
    fn test_flatten_expand_round_trip() {
        let (doc, link, _, _) = nested();
        let link = doc.link(link).unwrap();
        for path in ["SubGroup.Box.Face1", "SubGroup.Box.", "Cylinder.Edge2", "SubGroup.", "Face3"] {
            let flat = link.flatten_subname(path).unwrap();
            assert_eq!(link.expand_subname(&flat).unwrap(), path, "via {flat}");
        }
        assert_eq!(link.flatten_subname("SubGroup.Box.Face1").unwrap(), "Box.Face1");
        assert!(link.flatten_subname("SubGroup..Face1").is_err());
    }

    #[test]
    fn test_flatten_accepts_label_segments() {
        let (mut doc, link, _, _) = nested();
        let sub = doc.find_by_name("SubGroup").unwrap();
        doc.set_label(sub, "Fasteners").unwrap();
        let link = doc.link(link).unwrap();
        let flat = link.flatten_subname("$Fasteners.Box.Face1").unwrap();
        assert_eq!(flat, "Box.Face1");
        assert_eq!(link.expand_subname(&flat).unwrap(), "SubGroup.Box.Face1");
        assert_eq!(link.flatten_subname("$Missing.Box.Face1").unwrap(), "$Missing.Box.Face1");
    }

    #[test]
    fn test_flatten_disabled_is_identity() {
        let (mut doc, link, _, _) = nested();
        doc.set_property(link, props::FLATTEN_GROUP, PropertyValue::Bool(false))
            .unwrap();
        let view = doc.link(link).unwrap();
        assert!(!view.is_flattening());
        assert!(view.flattened_children().is_empty());
        assert_eq!(view.flatten_subname("SubGroup.Box.Face1").unwrap(), "SubGroup.Box.Face1");
    }

    #[test]
    fn test_cache_tracks_membership() {
        let (mut doc, link, parts, _) = nested();
        assert_eq!(doc.link(link).unwrap().flattened_children().len(), 3);
        let sub = doc.find_by_name("SubGroup").unwrap();
        let cone = doc.add_object("Part::Cone", "Cone");
        doc.add_to_group(sub, cone, None).unwrap();
        assert_eq!(doc.link(link).unwrap().flattened_children().len(), 4);

        let nested_group = doc.add_group("Deeper");
        doc.add_to_group(sub, nested_group, None).unwrap();
        let sphere = doc.add_object("Part::Sphere", "Sphere");
        doc.add_to_group(nested_group, sphere, None).unwrap();
        let view = doc.link(link).unwrap();
        assert_eq!(view.element_name_from_index(
            view.element_index("Sphere.").unwrap().0
        ).as_deref(), Some("SubGroup.Deeper.Sphere."));

        doc.remove_object(parts).unwrap();
        assert!(doc.link(link).unwrap().flattened_children().is_empty());
    }

    #[test]
    fn test_label_addressing_with_cache() {
        let mut doc = Document::new();
        crate::install(&mut doc, Arc::new(crate::kernel::MemoryKernel::new()));
        let cube = doc.add_object("Part::Box", "Box");
        let array = make_link_array(&mut doc, "Array", Some(cube), 3).unwrap();
        let second = doc.link(array).unwrap().element_object(1).unwrap();
        doc.set_label(second, "Middle").unwrap();

        doc.link_mut(array).unwrap().cache_child_label(true).unwrap();
        assert_eq!(doc.link(array).unwrap().element_index("$Middle.Face1"), Some((1, "Face1")));

        doc.set_label(second, "Centre").unwrap();
        let view = doc.link(array).unwrap();
        assert!(view.extension().label_cache.as_ref().unwrap().is_stale());
        assert_eq!(view.element_index("$Middle.Face1"), None);
        assert_eq!(view.element_index("$Centre."), Some((1, "")));
    }

    #[test]
    fn test_array_element_addressing() {
        let mut doc = Document::new();
        crate::install(&mut doc, Arc::new(crate::kernel::MemoryKernel::new()));
        let cube = doc.add_object("Part::Box", "Box");
        let array = make_link_array(&mut doc, "Array", Some(cube), 3).unwrap();
        doc.set_property_as(array, props::SHOW_ELEMENT, PropertyValue::Bool(false), ChangeOrigin::User)
            .unwrap();
        let view = doc.link(array).unwrap();
        assert_eq!(view.element_index("2.Edge1"), Some((2, "Edge1")));
        assert_eq!(view.element_index("3.Edge1"), None);
        assert_eq!(view.element_index("Array_i1.Face2"), Some((1, "Face2")));
        assert_eq!(view.element_index("Face2"), None);
        assert_eq!(view.element_name_from_index(2).as_deref(), Some("2."));
        assert_eq!(view.element_name_from_index(3), None);
    }
}
