//! Document hooks routing change notifications into the extensions.
//!
//! Three hooks are installed per document, in this order:
//!
//! 1. [`LinkHook`]: link arrays, element objects and group flattening.
//! 2. [`CopyOnChangeHook`]: clone creation and relays. It runs after the
//!    link hook so that a retargeted link is already consistent.
//! 3. [`AttachHook`]: attachment positioning against a geometry kernel.

use std::sync::Arc;

use trellis_core::{
    CoreResult, Document, DocumentHook, ObjectId, PropertyChange, PropertyValue, Signal, Watch,
};

use crate::attach;
use crate::copy_on_change::{self, COPY_ON_CHANGE_HOOK};
use crate::error::{LinkError, LinkResult};
use crate::kernel::GeometryKernel;
use crate::link::{
    GROUP_TOPIC, LINK_ELEMENT_TYPE, LINK_HOOK, LinkDocumentExt, LinkExtension, LinkMode,
    LinkShape, NewLinkElements, add_link_extension, check_link_cycle, invalidate_child_cache,
    on_array_changed, on_element_changed, props, refresh_group_watches, sync_elements,
};

/// Link array, element and group handling.
#[derive(Debug, Default)]
pub struct LinkHook {
    new_elements: Signal<NewLinkElements>,
}

impl LinkHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emitted with `(host, start, end)` when array element objects are
    /// created.
    pub fn new_link_elements(&self) -> &Signal<NewLinkElements> {
        &self.new_elements
    }

    fn validate(&self, doc: &Document, change: &PropertyChange, value: &PropertyValue) -> LinkResult<()> {
        let Ok(link) = doc.link(change.object) else {
            return Ok(());
        };
        match change.name.as_str() {
            props::LINKED_OBJECT | props::ELEMENT_LIST => {
                check_link_cycle(doc, change.object, &value.referenced_objects())
            }
            props::ELEMENT_COUNT => match value.as_int() {
                Some(count) if count < 0 => Err(LinkError::InvalidIndex {
                    index: count,
                    count: link.element_count(),
                }),
                _ => Ok(()),
            },
            props::VISIBILITY_LIST => {
                let len = value.as_bool_list().map_or(0, <[bool]>::len);
                let count = link.element_count();
                if link.shape() != LinkShape::Single && len > count {
                    return Err(LinkError::InvalidIndex {
                        index: len as i64 - 1,
                        count,
                    });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn changed(&self, doc: &mut Document, change: &PropertyChange) -> LinkResult<()> {
        let host = change.object;
        let Some(ext) = doc.extension::<LinkExtension>(host) else {
            return Ok(());
        };
        if let Some(array) = ext.element_of() {
            on_element_changed(doc, array, host, change)?;
        }
        match change.name.as_str() {
            props::LINKED_OBJECT | props::FLATTEN_GROUP => refresh_group_watches(doc, host)?,
            props::ELEMENT_LIST => invalidate_child_cache(doc, host),
            _ => {}
        }
        on_array_changed(doc, host, change, &self.new_elements)
    }

    /// `AutoDelete` groups take their elements with them.
    fn removing(&self, doc: &mut Document, object: ObjectId) -> LinkResult<()> {
        let elements: Vec<ObjectId> = match doc.link(object) {
            Ok(link) if link.shape() == LinkShape::Group && link.link_mode() == LinkMode::AutoDelete => {
                link.element_list().to_vec()
            }
            _ => return Ok(()),
        };
        for element in elements {
            if doc.contains(element) && doc.group_of(element)? != Some(object) {
                tracing::debug!(target: "trellis_link::link", group = ?object, ?element, "auto-deleting group element");
                doc.remove_object(element)?;
            }
        }
        Ok(())
    }

    fn loaded(&self, doc: &mut Document, object: ObjectId) -> LinkResult<()> {
        let Some(shape) = LinkShape::detect(doc, object) else {
            return Ok(());
        };
        if doc.object(object)?.type_name() == LINK_ELEMENT_TYPE {
            let mut ext = LinkExtension::new(LinkShape::Single);
            if let Some(parent) = doc.group_of(object)?
                && LinkShape::detect(doc, parent) == Some(LinkShape::Array)
            {
                let own = doc.property(object, props::LINKED_OBJECT)?.as_link_sub().cloned();
                let base = doc.property(parent, props::LINKED_OBJECT)?.as_link_sub().cloned();
                ext.element_of = Some(parent);
                ext.custom_link = own != base;
            }
            doc.set_extension(object, ext)?;
        } else {
            add_link_extension(doc, object, shape)?;
        }
        refresh_group_watches(doc, object)
    }
}

impl DocumentHook for LinkHook {
    fn name(&self) -> &'static str {
        LINK_HOOK
    }

    fn property_changing(&self, doc: &Document, change: &PropertyChange, value: &PropertyValue) -> CoreResult<()> {
        Ok(self.validate(doc, change, value)?)
    }

    fn property_changed(&self, doc: &mut Document, change: &PropertyChange) -> CoreResult<()> {
        Ok(self.changed(doc, change)?)
    }

    fn watched_changed(&self, doc: &mut Document, watch: &Watch, _change: &PropertyChange) -> CoreResult<()> {
        if watch.topic == GROUP_TOPIC {
            refresh_group_watches(doc, watch.subscriber)?;
        }
        Ok(())
    }

    fn object_removing(&self, doc: &mut Document, object: ObjectId) -> CoreResult<()> {
        Ok(self.removing(doc, object)?)
    }

    fn object_loaded(&self, doc: &mut Document, object: ObjectId) -> CoreResult<()> {
        Ok(self.loaded(doc, object)?)
    }

    fn execute(&self, doc: &mut Document, object: ObjectId) -> CoreResult<()> {
        Ok(sync_elements(doc, object, &self.new_elements)?)
    }
}

/// Copy-on-change clone management.
#[derive(Debug, Default)]
pub struct CopyOnChangeHook;

impl DocumentHook for CopyOnChangeHook {
    fn name(&self) -> &'static str {
        COPY_ON_CHANGE_HOOK
    }

    fn property_changed(&self, doc: &mut Document, change: &PropertyChange) -> CoreResult<()> {
        Ok(copy_on_change::on_host_changed(doc, change.object, change)?)
    }

    fn watched_changed(&self, doc: &mut Document, watch: &Watch, change: &PropertyChange) -> CoreResult<()> {
        Ok(copy_on_change::on_watched_changed(doc, watch, change)?)
    }

    fn object_removing(&self, doc: &mut Document, object: ObjectId) -> CoreResult<()> {
        Ok(copy_on_change::on_object_removing(doc, object)?)
    }

    fn object_loaded(&self, doc: &mut Document, object: ObjectId) -> CoreResult<()> {
        Ok(copy_on_change::on_object_loaded(doc, object)?)
    }
}

/// Attachment positioning.
pub struct AttachHook {
    kernel: Arc<dyn GeometryKernel>,
}

impl AttachHook {
    pub fn new(kernel: Arc<dyn GeometryKernel>) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> &dyn GeometryKernel {
        self.kernel.as_ref()
    }
}

impl std::fmt::Debug for AttachHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachHook").finish_non_exhaustive()
    }
}

impl DocumentHook for AttachHook {
    fn name(&self) -> &'static str {
        "attach"
    }

    fn property_changing(&self, doc: &Document, change: &PropertyChange, value: &PropertyValue) -> CoreResult<()> {
        Ok(attach::check_change(doc, change, value)?)
    }

    fn property_changed(&self, doc: &mut Document, change: &PropertyChange) -> CoreResult<()> {
        Ok(attach::on_host_changed(doc, change.object, change, self.kernel())?)
    }

    fn object_removing(&self, doc: &mut Document, object: ObjectId) -> CoreResult<()> {
        Ok(attach::on_object_removing(doc, object)?)
    }

    fn object_loaded(&self, doc: &mut Document, object: ObjectId) -> CoreResult<()> {
        Ok(attach::on_object_loaded(doc, object, self.kernel())?)
    }

    fn execute(&self, doc: &mut Document, object: ObjectId) -> CoreResult<()> {
        Ok(attach::execute(doc, object, self.kernel())?)
    }
}

/// Handles to the installed hooks.
#[derive(Clone, Debug)]
pub struct Hooks {
    pub link: Arc<LinkHook>,
    pub copy_on_change: Arc<CopyOnChangeHook>,
    pub attach: Arc<AttachHook>,
}

/// Install the link, copy-on-change and attachment hooks on `doc`.
pub fn install(doc: &mut Document, kernel: Arc<dyn GeometryKernel>) -> Hooks {
    let hooks = Hooks {
        link: Arc::new(LinkHook::new()),
        copy_on_change: Arc::new(CopyOnChangeHook),
        attach: Arc::new(AttachHook::new(kernel)),
    };
    doc.install_hook(hooks.link.clone());
    doc.install_hook(hooks.copy_on_change.clone());
    doc.install_hook(hooks.attach.clone());
    tracing::debug!(target: "trellis_link::link", "installed link hooks");
    hooks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MemoryKernel;
    use crate::link::{make_link, make_link_array, make_link_group};

    fn document() -> (Document, Hooks) {
        let mut doc = Document::new();
        let hooks = install(&mut doc, Arc::new(MemoryKernel::new()));
        (doc, hooks)
    }

    #[test]
    fn test_install_registers_all_hooks() {
        let (doc, _) = document();
        assert!(doc.has_hook(LINK_HOOK));
        assert!(doc.has_hook(COPY_ON_CHANGE_HOOK));
        assert!(doc.has_hook("attach"));
    }

    #[test]
    fn test_negative_element_count_vetoed() {
        let (mut doc, _) = document();
        let array = make_link_array(&mut doc, "Array", None, 2).unwrap();
        let err = doc
            .set_property(array, props::ELEMENT_COUNT, PropertyValue::Int(-1))
            .unwrap_err();
        assert!(matches!(LinkError::from(err), LinkError::InvalidIndex { .. }));
        assert_eq!(doc.link(array).unwrap().element_count(), 2);
    }

    #[test]
    fn test_visibility_list_bounded_by_count() {
        let (mut doc, _) = document();
        let array = make_link_array(&mut doc, "Array", None, 2).unwrap();
        let err = doc
            .set_property(array, props::VISIBILITY_LIST, PropertyValue::BoolList(vec![true; 3]))
            .unwrap_err();
        assert!(matches!(LinkError::from(err), LinkError::InvalidIndex { .. }));
    }

    #[test]
    fn test_auto_delete_group_removes_elements() {
        let (mut doc, _) = document();
        let a = doc.add_object("Part::Box", "A");
        let b = doc.add_object("Part::Box", "B");
        let group = make_link_group(&mut doc, "Group").unwrap();
        let mut link = doc.link_mut(group).unwrap();
        link.set_link(0, Some(a), None, Vec::new()).unwrap();
        link.set_link(1, Some(b), None, Vec::new()).unwrap();
        link.set_link_mode(LinkMode::AutoDelete).unwrap();
        doc.remove_object(group).unwrap();
        assert!(!doc.contains(a));
        assert!(!doc.contains(b));
    }

    #[test]
    fn test_plain_group_keeps_elements() {
        let (mut doc, _) = document();
        let a = doc.add_object("Part::Box", "A");
        let group = make_link_group(&mut doc, "Group").unwrap();
        doc.link_mut(group)
            .unwrap()
            .set_link(0, Some(a), None, Vec::new())
            .unwrap();
        doc.remove_object(group).unwrap();
        assert!(doc.contains(a));
    }

    #[test]
    fn test_restore_rebuilds_extensions() {
        let (mut doc, _) = document();
        let target = doc.add_object("Part::Box", "Box");
        let single = make_link(&mut doc, "Link", Some(target)).unwrap();
        let array = make_link_array(&mut doc, "Array", Some(target), 2).unwrap();
        let snapshot = doc.snapshot();

        let (mut restored, _) = document();
        restored.restore(snapshot).unwrap();
        assert_eq!(restored.link(single).unwrap().shape(), LinkShape::Single);
        let link = restored.link(array).unwrap();
        assert_eq!(link.shape(), LinkShape::Array);
        let element = link.element_list()[1];
        let element_ext = restored.link(element).unwrap();
        assert_eq!(element_ext.extension().element_of(), Some(array));
        assert_eq!(element_ext.linked_object(), Some(target));
    }

    #[test]
    fn test_recompute_resyncs_elements() {
        let (mut doc, _) = document();
        let target = doc.add_object("Part::Box", "Box");
        let array = make_link_array(&mut doc, "Array", Some(target), 2).unwrap();
        let element = doc.link(array).unwrap().element_list()[0];
        doc.remove_object(element).unwrap();
        doc.recompute(array).unwrap();
        let list = doc.link(array).unwrap().element_list().to_vec();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|&e| doc.contains(e)));
    }
}
