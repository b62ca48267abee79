//! Copy-on-change for links.
//!
//! A link to a shared template object can expose the template's
//! configuration properties (those flagged `copy_on_change`) as its own.
//! The first user edit of such a mirrored property duplicates the template
//! into a private clone owned by the link, re-points the link at the clone
//! and applies the edit there. The template stays referenced through
//! `LinkCopyOnChangeSource`.
//!
//! Afterwards, depending on the mode:
//!
//! | mode       | clone on edit | relay source changes into clone |
//! |------------|---------------|---------------------------------|
//! | `Disabled` | no            | no                              |
//! | `Enabled`  | yes           | no                              |
//! | `Tracking` | yes           | yes, unless the property is touched |
//! | `Owned`    | yes           | no                              |
//!
//! A direct edit on the clone marks that one property touched, which
//! detaches it from further relaying. Switching to `Disabled` or re-pointing
//! the link elsewhere releases the clone.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use trellis_core::{
    ChangeOrigin, ConnectionId, Document, LinkSub, ObjectId, PropertyCell, PropertyChange,
    PropertyValue, Watch,
};

use crate::error::{LinkError, LinkResult};
use crate::link::{LinkDocumentExt, LinkExtension, LinkShape, object_name, props as link_props};

/// Hook that owns the copy-on-change watches.
pub(crate) const COPY_ON_CHANGE_HOOK: &str = "copy_on_change";
const SOURCE_TOPIC: &str = "source";
const CLONE_TOPIC: &str = "clone";

/// Property names.
pub mod props {
    pub const MODE: &str = "LinkCopyOnChange";
    pub const SOURCE: &str = "LinkCopyOnChangeSource";
    pub const TOUCHED: &str = "LinkCopyOnChangeTouched";
    pub const TOUCHED_LIST: &str = "LinkCopyOnChangeTouchedList";
    /// Property group of the mirrored configuration properties.
    pub const MIRROR_GROUP: &str = "CopyOnChange";
}

/// Copy-on-change behavior of a link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyOnChangeMode {
    #[default]
    Disabled,
    Enabled,
    Owned,
    Tracking,
}

impl CopyOnChangeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "Disabled",
            Self::Enabled => "Enabled",
            Self::Owned => "Owned",
            Self::Tracking => "Tracking",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Disabled" => Some(Self::Disabled),
            "Enabled" => Some(Self::Enabled),
            "Owned" => Some(Self::Owned),
            "Tracking" => Some(Self::Tracking),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        self != Self::Disabled
    }
}

/// Runtime state of the synchronizer on one link.
#[derive(Debug, Default)]
pub struct CopyOnChangeState {
    source: Option<ObjectId>,
    clone: Option<ObjectId>,
    touched: BTreeSet<String>,
    mirrored: Vec<String>,
    source_watch: Option<ConnectionId>,
    clone_watch: Option<ConnectionId>,
    /// Edits are not turned into clones while set.
    paused: bool,
    /// Set while values are relayed between source, clone and host.
    relaying: bool,
    /// Set while the link is re-pointed by the synchronizer itself.
    retargeting: bool,
}

impl CopyOnChangeState {
    pub fn source(&self) -> Option<ObjectId> {
        self.source
    }

    pub fn clone_object(&self) -> Option<ObjectId> {
        self.clone
    }

    pub fn is_touched(&self, name: &str) -> bool {
        self.touched.contains(name)
    }

    pub fn touched(&self) -> impl Iterator<Item = &str> {
        self.touched.iter().map(String::as_str)
    }

    pub fn mirrored(&self) -> &[String] {
        &self.mirrored
    }
}

pub(crate) fn add_properties(doc: &mut Document, id: ObjectId) -> LinkResult<()> {
    doc.ensure_property(id, props::MODE, || {
        PropertyCell::new(PropertyValue::Enum(CopyOnChangeMode::Disabled.as_str().into()))
            .with_group("Link")
            .with_doc("Clone the linked object when a configuration property changes")
    })?;
    doc.ensure_property(id, props::SOURCE, || {
        PropertyCell::new(PropertyValue::Link(None))
            .with_group("Link")
            .hidden()
            .with_scope(trellis_core::LinkScope::Hidden)
    })?;
    doc.ensure_property(id, props::TOUCHED, || {
        PropertyCell::new(PropertyValue::Bool(false)).with_group("Link").hidden()
    })?;
    doc.ensure_property(id, props::TOUCHED_LIST, || {
        PropertyCell::new(PropertyValue::StringList(Vec::new()))
            .with_group("Link")
            .hidden()
    })?;
    if !doc.has_extension::<CopyOnChangeState>(id) {
        doc.set_extension(id, CopyOnChangeState::default())?;
    }
    Ok(())
}

/// Current mode of a link; `Disabled` for objects without copy-on-change.
pub fn mode(doc: &Document, host: ObjectId) -> CopyOnChangeMode {
    doc.property(host, props::MODE)
        .ok()
        .and_then(PropertyValue::as_str)
        .and_then(CopyOnChangeMode::parse)
        .unwrap_or_default()
}

/// Change the mode as a user edit.
pub fn set_mode(doc: &mut Document, host: ObjectId, mode: CopyOnChangeMode) -> LinkResult<()> {
    doc.set_property(host, props::MODE, PropertyValue::Enum(mode.as_str().to_string()))?;
    Ok(())
}

/// Synchronizer state of a link.
pub fn state(doc: &Document, host: ObjectId) -> Option<&CopyOnChangeState> {
    doc.extension::<CopyOnChangeState>(host)
}

/// Run `f` with clone creation paused on `host`.
pub fn with_paused<R>(
    doc: &mut Document,
    host: ObjectId,
    f: impl FnOnce(&mut Document) -> R,
) -> R {
    with_flag(doc, host, |s| &mut s.paused, f)
}

/// Set a guard flag for the duration of `f`, restoring its previous value
/// afterwards so nested guards stay raised.
fn with_flag<R>(
    doc: &mut Document,
    host: ObjectId,
    field: fn(&mut CopyOnChangeState) -> &mut bool,
    f: impl FnOnce(&mut Document) -> R,
) -> R {
    let previous = set_flag(doc, host, field, true);
    let result = f(doc);
    set_flag(doc, host, field, previous);
    result
}

/// Returns the previous value, `false` when `host` has no state.
fn set_flag(
    doc: &mut Document,
    host: ObjectId,
    field: fn(&mut CopyOnChangeState) -> &mut bool,
    value: bool,
) -> bool {
    doc.extension_mut::<CopyOnChangeState>(host)
        .is_some_and(|state| std::mem::replace(field(state), value))
}

fn with_relaying<R>(
    doc: &mut Document,
    host: ObjectId,
    f: impl FnOnce(&mut Document) -> LinkResult<R>,
) -> LinkResult<R> {
    with_flag(doc, host, |s| &mut s.relaying, f)
}

fn with_retargeting<R>(
    doc: &mut Document,
    host: ObjectId,
    f: impl FnOnce(&mut Document) -> LinkResult<R>,
) -> LinkResult<R> {
    with_flag(doc, host, |s| &mut s.retargeting, f)
}

fn state_mut(doc: &mut Document, host: ObjectId) -> LinkResult<&mut CopyOnChangeState> {
    Ok(doc.require_extension_mut::<CopyOnChangeState>(host)?)
}

// ---------------------------------------------------------------------
// Setup and teardown
// ---------------------------------------------------------------------

/// Start mirroring the current link target, or refresh the subscriptions
/// of an existing clone for the current mode.
fn activate(doc: &mut Document, host: ObjectId) -> LinkResult<()> {
    let (source, clone) = {
        let state = state_mut(doc, host)?;
        (state.source, state.clone)
    };
    if clone.is_none() {
        let target = doc.link(host)?.linked_object();
        if target != source {
            state_mut(doc, host)?.source = target;
            doc.set_property_as(host, props::SOURCE, PropertyValue::Link(target), ChangeOrigin::Internal)?;
        }
        if let Some(target) = target {
            mirror_properties(doc, host, target)?;
        }
    }
    refresh_watches(doc, host)
}

/// Drop the clone and the mirrors. With `restore_link` the link points
/// back at the source.
fn release(doc: &mut Document, host: ObjectId, restore_link: bool) -> LinkResult<()> {
    let (source, clone, mirrored, watches) = {
        let state = state_mut(doc, host)?;
        (
            state.source.take(),
            state.clone.take(),
            std::mem::take(&mut state.mirrored),
            [state.source_watch.take(), state.clone_watch.take()],
        )
    };
    state_mut(doc, host)?.touched.clear();
    for id in watches.into_iter().flatten() {
        doc.unwatch(id);
    }

    if restore_link
        && clone.is_some()
        && let Some(source) = source.filter(|&s| doc.contains(s))
    {
        let subs = doc.link(host)?.linked_subs();
        with_retargeting(doc, host, |doc| {
            doc.set_property_as(
                host,
                link_props::LINKED_OBJECT,
                PropertyValue::LinkSub(LinkSub::with_subs(source, subs)),
                ChangeOrigin::Internal,
            )?;
            Ok(())
        })?;
    }
    if let Some(clone) = clone {
        doc.remove_object(clone)?;
    }
    for name in &mirrored {
        doc.remove_property(host, name)?;
    }

    let internal = ChangeOrigin::Internal;
    doc.set_property_as(host, props::SOURCE, PropertyValue::Link(None), internal)?;
    doc.set_property_as(host, props::TOUCHED, PropertyValue::Bool(false), internal)?;
    doc.set_property_as(host, props::TOUCHED_LIST, PropertyValue::StringList(Vec::new()), internal)?;
    tracing::debug!(target: "trellis_link::copy_on_change", object = ?host, ?clone, "released copy-on-change");
    Ok(())
}

/// Copy the copy-on-change properties of `from` onto the host.
fn mirror_properties(doc: &mut Document, host: ObjectId, from: ObjectId) -> LinkResult<()> {
    let source_cells: Vec<(String, PropertyCell)> = doc
        .object(from)?
        .properties()
        .filter(|(_, cell)| cell.status.copy_on_change)
        .map(|(name, cell)| (name.to_string(), cell.clone()))
        .collect();
    let mut mirrored = state_mut(doc, host)?.mirrored.clone();

    for stale in mirrored
        .iter()
        .filter(|name| !source_cells.iter().any(|(n, _)| n == *name))
    {
        doc.remove_property(host, stale)?;
    }
    mirrored.retain(|name| source_cells.iter().any(|(n, _)| n == name));

    for (name, cell) in source_cells {
        if mirrored.contains(&name) {
            let value = cell.value().clone();
            with_relaying(doc, host, |doc| {
                doc.set_property_as(host, &name, value, ChangeOrigin::Internal)?;
                Ok(())
            })?;
            continue;
        }
        if doc.has_property(host, &name) {
            tracing::debug!(target: "trellis_link::copy_on_change", object = ?host, name, "property name taken, not mirrored");
            continue;
        }
        let mut mirror = cell.with_group(props::MIRROR_GROUP);
        mirror.status.copy_on_change = false;
        mirror.status.hidden = false;
        doc.add_property(host, name.clone(), mirror)?;
        mirrored.push(name);
    }
    state_mut(doc, host)?.mirrored = mirrored;
    Ok(())
}

fn refresh_watches(doc: &mut Document, host: ObjectId) -> LinkResult<()> {
    let current_mode = mode(doc, host);
    let (old, source, clone) = {
        let state = state_mut(doc, host)?;
        (
            [state.source_watch.take(), state.clone_watch.take()],
            state.source,
            state.clone,
        )
    };
    for id in old.into_iter().flatten() {
        doc.unwatch(id);
    }
    if !current_mode.is_active() {
        return Ok(());
    }
    let source = source.filter(|&s| doc.contains(s));
    let clone = clone.filter(|&c| doc.contains(c));

    let watch_source = match clone {
        None => true,
        Some(_) => current_mode == CopyOnChangeMode::Tracking,
    };
    let source_watch = source
        .filter(|_| watch_source)
        .map(|s| doc.watch(s, host, COPY_ON_CHANGE_HOOK, SOURCE_TOPIC));
    let clone_watch = clone.map(|c| doc.watch(c, host, COPY_ON_CHANGE_HOOK, CLONE_TOPIC));
    let state = state_mut(doc, host)?;
    state.source_watch = source_watch;
    state.clone_watch = clone_watch;
    Ok(())
}

/// Duplicate the source into a clone owned by the host and point the link
/// at it. On failure the host falls back to a plain link.
fn create_clone(doc: &mut Document, host: ObjectId) -> LinkResult<ObjectId> {
    let source = state_mut(doc, host)?
        .source
        .filter(|&s| doc.contains(s))
        .ok_or_else(|| LinkError::CloneUnsupported {
            object: object_name(doc, host),
        })?;

    let clone = match doc.duplicate_object(source) {
        Ok(clone) => clone,
        Err(err) => {
            tracing::warn!(target: "trellis_link::copy_on_change", object = ?host, error = %err, "cannot clone linked object, falling back to plain link");
            doc.set_property_as(
                host,
                props::MODE,
                PropertyValue::Enum(CopyOnChangeMode::Disabled.as_str().into()),
                ChangeOrigin::Internal,
            )?;
            return Err(LinkError::CloneUnsupported {
                object: object_name(doc, source),
            });
        }
    };
    doc.add_to_group(host, clone, None)?;
    state_mut(doc, host)?.clone = Some(clone);

    let subs = doc.link(host)?.linked_subs();
    with_retargeting(doc, host, |doc| {
        doc.set_property_as(
            host,
            link_props::LINKED_OBJECT,
            PropertyValue::LinkSub(LinkSub::with_subs(clone, subs)),
            ChangeOrigin::Internal,
        )?;
        Ok(())
    })?;
    refresh_watches(doc, host)?;
    tracing::debug!(target: "trellis_link::copy_on_change", object = ?host, ?source, ?clone, "created copy-on-change clone");
    Ok(clone)
}

fn mark_touched(doc: &mut Document, host: ObjectId, name: &str) -> LinkResult<()> {
    let list: Vec<String> = {
        let state = state_mut(doc, host)?;
        if !state.touched.insert(name.to_string()) {
            return Ok(());
        }
        state.touched.iter().cloned().collect()
    };
    let internal = ChangeOrigin::Internal;
    doc.set_property_as(host, props::TOUCHED, PropertyValue::Bool(true), internal)?;
    doc.set_property_as(host, props::TOUCHED_LIST, PropertyValue::StringList(list), internal)?;
    Ok(())
}

fn copy_value(
    doc: &mut Document,
    host: ObjectId,
    from: ObjectId,
    to: ObjectId,
    name: &str,
    origin: ChangeOrigin,
) -> LinkResult<()> {
    let Ok(value) = doc.property(from, name).cloned() else {
        return Ok(());
    };
    if !doc.has_property(to, name) {
        return Ok(());
    }
    with_relaying(doc, host, |doc| {
        doc.set_property_as(to, name, value, origin)?;
        Ok(())
    })
}

// ---------------------------------------------------------------------
// Change handling
// ---------------------------------------------------------------------

/// React to a change of a link's own property.
pub(crate) fn on_host_changed(doc: &mut Document, host: ObjectId, change: &PropertyChange) -> LinkResult<()> {
    let Some(state) = doc.extension::<CopyOnChangeState>(host) else {
        return Ok(());
    };
    let (retargeting, relaying, paused, clone) =
        (state.retargeting, state.relaying, state.paused, state.clone);
    let is_mirror = state.mirrored.iter().any(|m| *m == change.name);

    match change.name.as_str() {
        props::MODE => {
            let current = mode(doc, host);
            tracing::debug!(target: "trellis_link::copy_on_change", object = ?host, mode = current.as_str(), "copy-on-change mode changed");
            if current.is_active() {
                activate(doc, host)?;
                if change.origin == ChangeOrigin::User && doc.params().copy_on_change_apply_to_all {
                    apply_to_all(doc, host, current)?;
                }
            } else {
                release(doc, host, true)?;
            }
            Ok(())
        }
        link_props::LINKED_OBJECT if !retargeting => {
            let target = doc.link(host)?.linked_object();
            if clone.is_some() && target == clone {
                return Ok(());
            }
            release(doc, host, false)?;
            if mode(doc, host).is_active() {
                activate(doc, host)?;
            }
            Ok(())
        }
        _ if is_mirror && change.origin == ChangeOrigin::User => {
            if relaying {
                return Err(LinkError::ReentrantChange {
                    object: object_name(doc, host),
                    property: change.name.clone(),
                });
            }
            if paused || !mode(doc, host).is_active() {
                return Ok(());
            }
            let clone = match clone.filter(|&c| doc.contains(c)) {
                Some(clone) => clone,
                None => create_clone(doc, host)?,
            };
            copy_value(doc, host, host, clone, &change.name, ChangeOrigin::Relay)?;
            mark_touched(doc, host, &change.name)
        }
        _ => Ok(()),
    }
}

/// React to a change on the source or the clone of a link.
pub(crate) fn on_watched_changed(doc: &mut Document, watch: &Watch, change: &PropertyChange) -> LinkResult<()> {
    let host = watch.subscriber;
    let Some(state) = doc.extension::<CopyOnChangeState>(host) else {
        return Ok(());
    };
    if state.relaying || !state.mirrored.iter().any(|m| *m == change.name) {
        return Ok(());
    }
    let (clone, touched) = (state.clone, state.is_touched(&change.name));

    match watch.topic {
        SOURCE_TOPIC => {
            if doc.is_transacting() {
                tracing::trace!(target: "trellis_link::copy_on_change", object = ?host, "relay suppressed during transaction");
                return Ok(());
            }
            let source = watch.watched;
            match clone {
                Some(clone) => {
                    if mode(doc, host) != CopyOnChangeMode::Tracking || touched {
                        return Ok(());
                    }
                    copy_value(doc, host, source, clone, &change.name, ChangeOrigin::Relay)?;
                    copy_value(doc, host, source, host, &change.name, ChangeOrigin::Internal)
                }
                None => copy_value(doc, host, source, host, &change.name, ChangeOrigin::Internal),
            }
        }
        CLONE_TOPIC => {
            if change.origin == ChangeOrigin::User {
                mark_touched(doc, host, &change.name)?;
            }
            copy_value(doc, host, watch.watched, host, &change.name, ChangeOrigin::Internal)
        }
        _ => Ok(()),
    }
}

/// Give every other disabled link to the same source the same mode.
fn apply_to_all(doc: &mut Document, host: ObjectId, current: CopyOnChangeMode) -> LinkResult<()> {
    let Some(source) = state(doc, host).and_then(CopyOnChangeState::source) else {
        return Ok(());
    };
    let peers: Vec<ObjectId> = doc
        .registry()
        .ids()
        .filter(|&id| id != host && doc.has_extension::<CopyOnChangeState>(id))
        .filter(|&id| mode(doc, id) == CopyOnChangeMode::Disabled)
        .filter(|&id| {
            doc.link(id).is_ok_and(|link| {
                link.shape() != LinkShape::Group
                    && link.extension().element_of().is_none()
                    && link.linked_object() == Some(source)
            })
        })
        .collect();
    for peer in peers {
        doc.set_property_as(
            peer,
            props::MODE,
            PropertyValue::Enum(current.as_str().to_string()),
            ChangeOrigin::Internal,
        )?;
    }
    Ok(())
}

/// Clear references to an object that is about to be removed.
pub(crate) fn on_object_removing(doc: &mut Document, object: ObjectId) -> LinkResult<()> {
    if let Some(state) = doc.extension_mut::<CopyOnChangeState>(object) {
        let watches = [state.source_watch.take(), state.clone_watch.take()];
        state.source = None;
        state.clone = None;
        for id in watches.into_iter().flatten() {
            doc.unwatch(id);
        }
        return Ok(());
    }

    let hosts: Vec<ObjectId> = doc
        .registry()
        .ids()
        .filter(|&id| {
            state(doc, id).is_some_and(|s| s.source == Some(object) || s.clone == Some(object))
        })
        .collect();
    for host in hosts {
        let (was_source, source, stale_watch) = {
            let state = state_mut(doc, host)?;
            let was_source = state.source == Some(object);
            let stale_watch = if was_source {
                state.source = None;
                state.source_watch.take()
            } else {
                state.clone = None;
                state.clone_watch.take()
            };
            (was_source, state.source, stale_watch)
        };
        if let Some(id) = stale_watch {
            doc.unwatch(id);
        }
        if was_source {
            doc.set_property_as(host, props::SOURCE, PropertyValue::Link(None), ChangeOrigin::Internal)?;
        } else if let Some(source) = source.filter(|&s| doc.contains(s)) {
            let subs = doc.link(host)?.linked_subs();
            with_retargeting(doc, host, |doc| {
                doc.set_property_as(
                    host,
                    link_props::LINKED_OBJECT,
                    PropertyValue::LinkSub(LinkSub::with_subs(source, subs)),
                    ChangeOrigin::Internal,
                )?;
                Ok(())
            })?;
            refresh_watches(doc, host)?;
        }
        tracing::debug!(target: "trellis_link::copy_on_change", object = ?host, removed = ?object, "cleared copy-on-change reference");
    }
    Ok(())
}

/// Rebuild the synchronizer state from stored properties.
pub(crate) fn on_object_loaded(doc: &mut Document, host: ObjectId) -> LinkResult<()> {
    if !doc.has_property(host, props::MODE) || !doc.has_extension::<LinkExtension>(host) {
        return Ok(());
    }
    let source = doc
        .property(host, props::SOURCE)
        .ok()
        .and_then(PropertyValue::as_link)
        .filter(|&s| doc.contains(s));
    let target = doc.link(host)?.linked_object();
    let clone = source.and(target).filter(|&t| Some(t) != source);
    let touched: BTreeSet<String> = doc
        .property(host, props::TOUCHED_LIST)
        .ok()
        .and_then(PropertyValue::as_string_list)
        .map(|list| list.iter().cloned().collect())
        .unwrap_or_default();
    let mirrored: Vec<String> = doc
        .object(host)?
        .properties()
        .filter(|(_, cell)| cell.group == props::MIRROR_GROUP)
        .map(|(name, _)| name.to_string())
        .collect();

    doc.set_extension(
        host,
        CopyOnChangeState {
            source,
            clone,
            touched,
            mirrored,
            ..Default::default()
        },
    )?;
    refresh_watches(doc, host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::make_link;
    use std::sync::Arc;

    fn template(doc: &mut Document) -> ObjectId {
        let bracket = doc.add_object("Part::Bracket", "Bracket");
        doc.add_property(
            bracket,
            "Width",
            PropertyCell::new(PropertyValue::Float(10.0)).copy_on_change(),
        )
        .unwrap();
        doc.add_property(
            bracket,
            "Height",
            PropertyCell::new(PropertyValue::Float(4.0)).copy_on_change(),
        )
        .unwrap();
        doc.add_property(bracket, "Material", PropertyCell::new(PropertyValue::String("Steel".into())))
            .unwrap();
        bracket
    }

    fn setup(mode: CopyOnChangeMode) -> (Document, ObjectId, ObjectId) {
        let mut doc = Document::new();
        crate::install(&mut doc, Arc::new(crate::kernel::MemoryKernel::new()));
        let source = template(&mut doc);
        let link = make_link(&mut doc, "Link", Some(source)).unwrap();
        set_mode(&mut doc, link, mode).unwrap();
        (doc, source, link)
    }

    fn float(doc: &Document, id: ObjectId, name: &str) -> f64 {
        doc.property(id, name).unwrap().as_float().unwrap()
    }

    #[test]
    fn test_mode_names() {
        for mode in [
            CopyOnChangeMode::Disabled,
            CopyOnChangeMode::Enabled,
            CopyOnChangeMode::Owned,
            CopyOnChangeMode::Tracking,
        ] {
            assert_eq!(CopyOnChangeMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(CopyOnChangeMode::parse("Sometimes"), None);
    }

    #[test]
    fn test_enable_mirrors_tracked_properties() {
        let (doc, source, link) = setup(CopyOnChangeMode::Enabled);
        let state = state(&doc, link).unwrap();
        assert_eq!(state.source(), Some(source));
        assert_eq!(state.clone_object(), None);
        assert_eq!(state.mirrored(), ["Height".to_string(), "Width".to_string()]);
        assert_eq!(float(&doc, link, "Width"), 10.0);
        assert!(!doc.has_property(link, "Material"));
        assert_eq!(
            doc.property(link, props::SOURCE).unwrap().as_link(),
            Some(source)
        );
    }

    #[test]
    fn test_first_edit_clones_and_repoints() {
        let (mut doc, source, link) = setup(CopyOnChangeMode::Enabled);
        doc.set_property(link, "Width", PropertyValue::Float(12.0)).unwrap();

        let clone = state(&doc, link).unwrap().clone_object().unwrap();
        assert_ne!(clone, source);
        assert_eq!(doc.link(link).unwrap().linked_object(), Some(clone));
        assert_eq!(doc.group_of(clone).unwrap(), Some(link));
        assert_eq!(float(&doc, clone, "Width"), 12.0);
        assert_eq!(float(&doc, source, "Width"), 10.0);
        assert!(state(&doc, link).unwrap().is_touched("Width"));
        assert_eq!(doc.property(link, props::TOUCHED).unwrap().as_bool(), Some(true));

        // A second edit reuses the clone.
        doc.set_property(link, "Height", PropertyValue::Float(5.0)).unwrap();
        assert_eq!(state(&doc, link).unwrap().clone_object(), Some(clone));
        assert_eq!(doc.registry().object_count(), 3);
    }

    #[test]
    fn test_tracking_relays_untouched_properties() {
        let (mut doc, source, link) = setup(CopyOnChangeMode::Tracking);
        doc.set_property(link, "Width", PropertyValue::Float(12.0)).unwrap();
        let clone = state(&doc, link).unwrap().clone_object().unwrap();

        doc.set_property(source, "Height", PropertyValue::Float(6.0)).unwrap();
        assert_eq!(float(&doc, clone, "Height"), 6.0);
        assert_eq!(float(&doc, link, "Height"), 6.0);

        doc.set_property(source, "Width", PropertyValue::Float(20.0)).unwrap();
        assert_eq!(float(&doc, clone, "Width"), 12.0);
    }

    #[test]
    fn test_direct_clone_edit_touches_single_property() {
        let (mut doc, source, link) = setup(CopyOnChangeMode::Tracking);
        doc.set_property(link, "Width", PropertyValue::Float(12.0)).unwrap();
        let clone = state(&doc, link).unwrap().clone_object().unwrap();

        doc.set_property(clone, "Height", PropertyValue::Float(1.0)).unwrap();
        assert!(state(&doc, link).unwrap().is_touched("Height"));
        assert_eq!(float(&doc, link, "Height"), 1.0);

        doc.set_property(source, "Height", PropertyValue::Float(9.0)).unwrap();
        assert_eq!(float(&doc, clone, "Height"), 1.0);
    }

    #[test]
    fn test_enabled_does_not_relay() {
        let (mut doc, source, link) = setup(CopyOnChangeMode::Enabled);
        doc.set_property(link, "Width", PropertyValue::Float(12.0)).unwrap();
        let clone = state(&doc, link).unwrap().clone_object().unwrap();
        doc.set_property(source, "Height", PropertyValue::Float(6.0)).unwrap();
        assert_eq!(float(&doc, clone, "Height"), 4.0);
    }

    #[test]
    fn test_relay_suppressed_during_transaction() {
        let (mut doc, source, link) = setup(CopyOnChangeMode::Tracking);
        doc.set_property(link, "Width", PropertyValue::Float(12.0)).unwrap();
        let clone = state(&doc, link).unwrap().clone_object().unwrap();
        doc.with_transaction(|doc| {
            doc.set_property_as(source, "Height", PropertyValue::Float(6.0), ChangeOrigin::Transaction)
                .unwrap();
        });
        assert_eq!(float(&doc, clone, "Height"), 4.0);
    }

    #[test]
    fn test_disable_releases_clone() {
        let (mut doc, source, link) = setup(CopyOnChangeMode::Enabled);
        doc.set_property(link, "Width", PropertyValue::Float(12.0)).unwrap();
        let clone = state(&doc, link).unwrap().clone_object().unwrap();

        set_mode(&mut doc, link, CopyOnChangeMode::Disabled).unwrap();
        assert!(!doc.contains(clone));
        assert_eq!(doc.link(link).unwrap().linked_object(), Some(source));
        assert!(!doc.has_property(link, "Width"));
        assert!(doc.watches_of(link).iter().all(|(_, w)| w.owner != COPY_ON_CHANGE_HOOK));
        assert_eq!(doc.property(link, props::SOURCE).unwrap().as_link(), None);
    }

    #[test]
    fn test_retarget_tears_down() {
        let (mut doc, _, link) = setup(CopyOnChangeMode::Enabled);
        doc.set_property(link, "Width", PropertyValue::Float(12.0)).unwrap();
        let clone = state(&doc, link).unwrap().clone_object().unwrap();

        let other = template(&mut doc);
        doc.link_mut(link)
            .unwrap()
            .set_link(-1, Some(other), None, Vec::new())
            .unwrap();
        assert!(!doc.contains(clone));
        let state = state(&doc, link).unwrap();
        assert_eq!(state.source(), Some(other));
        assert_eq!(state.clone_object(), None);
        assert_eq!(float(&doc, link, "Width"), 10.0);
    }

    #[test]
    fn test_clone_failure_falls_back() {
        let (mut doc, source, link) = setup(CopyOnChangeMode::Enabled);
        doc.set_copyable(source, false).unwrap();
        let err = doc.set_property(link, "Width", PropertyValue::Float(12.0)).unwrap_err();
        assert!(matches!(
            LinkError::from(err),
            LinkError::CloneUnsupported { .. }
        ));
        assert_eq!(mode(&doc, link), CopyOnChangeMode::Disabled);
        assert_eq!(doc.link(link).unwrap().linked_object(), Some(source));
        assert!(!doc.has_property(link, "Width"));
    }

    #[test]
    fn test_paused_edits_do_not_clone() {
        let (mut doc, _, link) = setup(CopyOnChangeMode::Enabled);
        with_paused(&mut doc, link, |doc| {
            doc.set_property(link, "Width", PropertyValue::Float(12.0)).unwrap();
        });
        assert_eq!(state(&doc, link).unwrap().clone_object(), None);
    }

    #[test]
    fn test_nested_pause_keeps_outer_guard() {
        let (mut doc, _, link) = setup(CopyOnChangeMode::Enabled);
        with_paused(&mut doc, link, |doc| {
            with_paused(doc, link, |_| ());
            assert!(state(doc, link).unwrap().paused);
            doc.set_property(link, "Width", PropertyValue::Float(12.0)).unwrap();
        });
        assert!(!state(&doc, link).unwrap().paused);
        assert_eq!(state(&doc, link).unwrap().clone_object(), None);
    }

    #[test]
    fn test_apply_to_all_peers() {
        let (mut doc, source, first) = setup(CopyOnChangeMode::Disabled);
        let second = make_link(&mut doc, "Link", Some(source)).unwrap();
        set_mode(&mut doc, first, CopyOnChangeMode::Tracking).unwrap();
        assert_eq!(mode(&doc, second), CopyOnChangeMode::Tracking);
        assert!(doc.has_property(second, "Width"));
    }

    #[test]
    fn test_removing_source_clears_back_reference() {
        let (mut doc, source, link) = setup(CopyOnChangeMode::Enabled);
        doc.set_property(link, "Width", PropertyValue::Float(12.0)).unwrap();
        doc.remove_object(source).unwrap();
        let state = state(&doc, link).unwrap();
        assert_eq!(state.source(), None);
        assert!(state.clone_object().is_some());
        assert_eq!(doc.property(link, props::SOURCE).unwrap().as_link(), None);
    }
}
