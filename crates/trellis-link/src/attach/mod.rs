//! Attachment extension.
//!
//! An attachable object computes its `Placement` from up to four geometric
//! references and a [`MapMode`], using the strategy named by its
//! `AttacherType`. The result is post-processed by `MapReversed` and
//! `AttachmentOffset`. An optional *base* attachment (`BaseAttacherType`,
//! `BaseAttachment`, ...) is resolved first and acts as the parent frame of
//! the primary one.
//!
//! # States
//!
//! ```text
//!              position_by_support
//! Deactivated ─────────────────────► Active ◄──┐
//!      ▲                               │        │ references completed
//!      │ MapMode = Deactivated         ▼        │
//!      └──────────────────────────── Failed ────┘
//! ```
//!
//! While `Active` the placement is read-only, except that `Translate`
//! leaves the rotation editable. Switching back to `Deactivated` keeps the
//! last computed placement.

mod engine;
mod mode;

use serde::{Deserialize, Serialize};
use trellis_core::{
    ChangeOrigin, Document, EditLock, LinkScope, LinkSub, ObjectId, Placement, PropertyCell,
    PropertyChange, PropertyValue,
};

pub use engine::{AttachEngine, Attached, MAX_REFERENCES, Reference, references_from_links};
pub use mode::{EngineKind, MapMode};

use crate::error::{AttachError, AttachResult};
use crate::kernel::GeometryKernel;
use crate::rename::{self, SubElementRename};

/// Property names.
pub mod props {
    pub const ATTACHER_TYPE: &str = "AttacherType";
    pub const ATTACHMENT_SUPPORT: &str = "AttachmentSupport";
    /// Legacy alias of `AttachmentSupport`.
    pub const SUPPORT: &str = "Support";
    pub const MAP_MODE: &str = "MapMode";
    pub const MAP_REVERSED: &str = "MapReversed";
    pub const MAP_PATH_PARAMETER: &str = "MapPathParameter";
    pub const ATTACHMENT_OFFSET: &str = "AttachmentOffset";
    pub const BASE_ATTACHER_TYPE: &str = "BaseAttacherType";
    pub const BASE_ATTACHMENT: &str = "BaseAttachment";
    pub const BASE_MAP_MODE: &str = "BaseMapMode";
    pub const BASE_MAP_REVERSED: &str = "BaseMapReversed";
    pub const BASE_MAP_PATH_PARAMETER: &str = "BaseMapPathParameter";
    pub const PLACEMENT: &str = "Placement";
    /// Name of `AttachmentOffset` in old documents.
    pub const LEGACY_OFFSET: &str = "superPlacement";
}

const GROUP: &str = "Attachment";

/// Outcome of the last placement computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachState {
    /// No computation is attempted.
    Deactivated,
    /// The last computation succeeded.
    Active,
    /// The references did not determine a placement.
    Failed,
}

/// Which of the two attachments of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachRole {
    Primary,
    Base,
}

struct RoleProps {
    attacher_type: &'static str,
    support: &'static str,
    mode: &'static str,
    reversed: &'static str,
    path_parameter: &'static str,
}

impl AttachRole {
    fn props(self) -> RoleProps {
        match self {
            Self::Primary => RoleProps {
                attacher_type: props::ATTACHER_TYPE,
                support: props::ATTACHMENT_SUPPORT,
                mode: props::MAP_MODE,
                reversed: props::MAP_REVERSED,
                path_parameter: props::MAP_PATH_PARAMETER,
            },
            Self::Base => RoleProps {
                attacher_type: props::BASE_ATTACHER_TYPE,
                support: props::BASE_ATTACHMENT,
                mode: props::BASE_MAP_MODE,
                reversed: props::BASE_MAP_REVERSED,
                path_parameter: props::BASE_MAP_PATH_PARAMETER,
            },
        }
    }
}

/// Per-object attachment state.
#[derive(Debug, Default)]
pub struct AttachExtension {
    kind: Option<EngineKind>,
    base_kind: Option<EngineKind>,
    /// `None` until the placement has been computed.
    active: Option<bool>,
    /// Set while `Support` and `AttachmentSupport` are mirrored.
    syncing_support: bool,
    /// Set while the placement is being computed and written.
    updating: bool,
}

impl AttachExtension {
    pub fn kind(&self, role: AttachRole) -> Option<EngineKind> {
        match role {
            AttachRole::Primary => self.kind,
            AttachRole::Base => self.base_kind,
        }
    }

    fn set_kind(&mut self, role: AttachRole, kind: Option<EngineKind>) {
        match role {
            AttachRole::Primary => self.kind = kind,
            AttachRole::Base => self.base_kind = kind,
        }
    }
}

fn cell(value: PropertyValue, doc: &str) -> PropertyCell {
    PropertyCell::new(value).with_group(GROUP).with_doc(doc)
}

fn add_role_properties(doc: &mut Document, id: ObjectId, role: AttachRole, kind: Option<EngineKind>) -> AttachResult<()> {
    let p = role.props();
    let type_name = kind.map(EngineKind::type_name).unwrap_or_default();
    doc.ensure_property(id, p.attacher_type, || {
        cell(PropertyValue::String(type_name.to_string()), "Class name of the attach engine")
    })?;
    doc.ensure_property(id, p.support, || {
        cell(PropertyValue::LinkSubList(Vec::new()), "Geometric references to attach to")
    })?;
    doc.ensure_property(id, p.mode, || {
        cell(PropertyValue::Enum(MapMode::Deactivated.as_str().into()), "Attachment mode")
    })?;
    doc.ensure_property(id, p.reversed, || {
        cell(PropertyValue::Bool(false), "Flip the Z axis of the attached placement")
    })?;
    doc.ensure_property(id, p.path_parameter, || {
        cell(PropertyValue::Float(0.0), "Position along the path edge, 0 to 1")
    })?;
    if role == AttachRole::Base {
        hide_base_support(doc, id)?;
    }
    Ok(())
}

/// Base references are never structural dependencies.
fn hide_base_support(doc: &mut Document, id: ObjectId) -> AttachResult<()> {
    if doc.has_property(id, props::BASE_ATTACHMENT) {
        doc.set_property_status(id, props::BASE_ATTACHMENT, |status| {
            status.scope = LinkScope::Hidden;
        })?;
    }
    Ok(())
}

/// Make `id` attachable with the given engine.
pub fn add_attach_extension(doc: &mut Document, id: ObjectId, kind: EngineKind) -> AttachResult<()> {
    doc.ensure_property(id, props::PLACEMENT, || {
        PropertyCell::new(PropertyValue::Placement(Placement::IDENTITY)).with_group("Base")
    })?;
    add_role_properties(doc, id, AttachRole::Primary, Some(kind))?;
    doc.ensure_property(id, props::SUPPORT, || {
        cell(PropertyValue::LinkSubList(Vec::new()), "Alias of AttachmentSupport").hidden()
    })?;
    doc.ensure_property(id, props::ATTACHMENT_OFFSET, || {
        cell(
            PropertyValue::Placement(Placement::IDENTITY),
            "Extra placement applied in the attached frame",
        )
    })?;
    if !doc.has_extension::<AttachExtension>(id) {
        doc.set_extension(
            id,
            AttachExtension {
                kind: Some(kind),
                ..Default::default()
            },
        )?;
    }
    update_property_status(doc, id)
}

/// Remove the attachment. The placement becomes freely editable and keeps
/// its last value.
pub fn remove_attach_extension(doc: &mut Document, id: ObjectId) -> AttachResult<()> {
    if doc.remove_extension::<AttachExtension>(id).is_none() {
        return Ok(());
    }
    for role in [AttachRole::Primary, AttachRole::Base] {
        let p = role.props();
        for name in [p.attacher_type, p.support, p.mode, p.reversed, p.path_parameter] {
            doc.remove_property(id, name)?;
        }
    }
    doc.remove_property(id, props::SUPPORT)?;
    doc.remove_property(id, props::ATTACHMENT_OFFSET)?;
    if doc.has_property(id, props::PLACEMENT) {
        doc.set_property_status(id, props::PLACEMENT, |s| s.lock = EditLock::Editable)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------

/// Read access to an attachable object.
#[derive(Clone, Copy)]
pub struct AttachRef<'a> {
    doc: &'a Document,
    host: ObjectId,
    ext: &'a AttachExtension,
}

/// Write access to an attachable object.
pub struct AttachMut<'a> {
    doc: &'a mut Document,
    host: ObjectId,
}

/// Attachment entry points on [`Document`].
pub trait AttachDocumentExt {
    fn attachment(&self, id: ObjectId) -> AttachResult<AttachRef<'_>>;
    fn attachment_mut(&mut self, id: ObjectId) -> AttachResult<AttachMut<'_>>;
    fn is_attachable(&self, id: ObjectId) -> bool;
}

impl AttachDocumentExt for Document {
    fn attachment(&self, id: ObjectId) -> AttachResult<AttachRef<'_>> {
        let ext = self.require_extension::<AttachExtension>(id)?;
        Ok(AttachRef {
            doc: self,
            host: id,
            ext,
        })
    }

    fn attachment_mut(&mut self, id: ObjectId) -> AttachResult<AttachMut<'_>> {
        self.require_extension::<AttachExtension>(id)?;
        Ok(AttachMut { doc: self, host: id })
    }

    fn is_attachable(&self, id: ObjectId) -> bool {
        self.has_extension::<AttachExtension>(id)
    }
}

impl<'a> AttachRef<'a> {
    pub fn host(&self) -> ObjectId {
        self.host
    }

    pub fn engine_kind(&self, role: AttachRole) -> Option<EngineKind> {
        self.ext.kind(role)
    }

    pub fn map_mode(&self, role: AttachRole) -> MapMode {
        self.doc
            .property(self.host, role.props().mode)
            .ok()
            .and_then(PropertyValue::as_str)
            .and_then(MapMode::parse)
            .unwrap_or_default()
    }

    pub fn support(&self, role: AttachRole) -> &'a [LinkSub] {
        self.doc
            .property(self.host, role.props().support)
            .ok()
            .and_then(PropertyValue::as_link_sub_list)
            .unwrap_or_default()
    }

    pub fn references(&self, role: AttachRole) -> Vec<Reference> {
        references_from_links(self.support(role))
    }

    pub fn reversed(&self, role: AttachRole) -> bool {
        self.doc
            .property(self.host, role.props().reversed)
            .ok()
            .and_then(PropertyValue::as_bool)
            .unwrap_or(false)
    }

    pub fn path_parameter(&self, role: AttachRole) -> f64 {
        self.doc
            .property(self.host, role.props().path_parameter)
            .ok()
            .and_then(PropertyValue::as_float)
            .unwrap_or(0.0)
    }

    pub fn offset(&self) -> Placement {
        placement(self.doc, self.host, props::ATTACHMENT_OFFSET)
    }

    pub fn placement(&self) -> Placement {
        placement(self.doc, self.host, props::PLACEMENT)
    }

    /// Cached outcome of the last computation. A mode that was never
    /// computed reports `Failed` until the next positioning.
    pub fn state(&self) -> AttachState {
        if self.ext.kind.is_none() || self.map_mode(AttachRole::Primary) == MapMode::Deactivated {
            return AttachState::Deactivated;
        }
        match self.ext.active {
            Some(true) => AttachState::Active,
            _ => AttachState::Failed,
        }
    }

    /// Whether the placement has been computed since the last change.
    pub fn is_computed(&self) -> bool {
        self.ext.active.is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.state() == AttachState::Active
    }

    /// Configured engine for one role.
    pub fn engine(&self, role: AttachRole) -> AttachResult<AttachEngine> {
        let kind = self.ext.kind(role).ok_or(AttachError::NoEngine)?;
        let mut engine = AttachEngine::new(kind);
        engine.mode = self.map_mode(role);
        engine.references = self.references(role);
        engine.reversed = self.reversed(role);
        engine.path_parameter = self.path_parameter(role);
        if role == AttachRole::Primary {
            engine.offset = self.offset();
        }
        Ok(engine)
    }

    /// Placement of the base attachment, identity when none is active.
    pub fn base_placement(&self, kernel: &dyn GeometryKernel) -> AttachResult<Attached> {
        let active = self.ext.base_kind.is_some()
            && self.map_mode(AttachRole::Base) != MapMode::Deactivated;
        if !active {
            return Ok(Attached {
                placement: Placement::IDENTITY,
                renames: Vec::new(),
            });
        }
        self.engine(AttachRole::Base)?
            .calculate(self.doc, kernel, Placement::IDENTITY)
    }

    /// Compute the placement without writing it.
    ///
    /// Returns the primary result and the renames reported while resolving
    /// the base attachment.
    pub fn calculate(&self, kernel: &dyn GeometryKernel) -> AttachResult<(Attached, Vec<SubElementRename>)> {
        let base = self.base_placement(kernel)?;
        let mut engine = self.engine(AttachRole::Primary)?;
        engine.offset = engine.offset * base.placement.inverse();
        let attached = engine.calculate(self.doc, kernel, self.placement())?;
        Ok((attached, base.renames))
    }
}

impl AttachMut<'_> {
    pub fn host(&self) -> ObjectId {
        self.host
    }

    pub fn as_ref(&self) -> AttachResult<AttachRef<'_>> {
        self.doc.attachment(self.host)
    }

    fn write(&mut self, name: &str, value: PropertyValue) -> AttachResult<()> {
        self.doc.set_property(self.host, name, value)?;
        Ok(())
    }

    /// Select the engine by type name; an empty name clears it.
    pub fn set_attacher_type(&mut self, type_name: &str) -> AttachResult<()> {
        self.write(props::ATTACHER_TYPE, PropertyValue::String(type_name.to_string()))
    }

    /// Select the base engine, adding the base properties on first use.
    pub fn set_base_attacher_type(&mut self, type_name: &str) -> AttachResult<()> {
        add_role_properties(self.doc, self.host, AttachRole::Base, None)?;
        self.write(props::BASE_ATTACHER_TYPE, PropertyValue::String(type_name.to_string()))
    }

    pub fn set_map_mode(&mut self, mode: MapMode) -> AttachResult<()> {
        self.set_role_mode(AttachRole::Primary, mode)
    }

    pub fn set_role_mode(&mut self, role: AttachRole, mode: MapMode) -> AttachResult<()> {
        self.write(role.props().mode, PropertyValue::Enum(mode.as_str().to_string()))
    }

    pub fn set_references(&mut self, references: Vec<LinkSub>) -> AttachResult<()> {
        self.set_role_references(AttachRole::Primary, references)
    }

    pub fn set_role_references(&mut self, role: AttachRole, references: Vec<LinkSub>) -> AttachResult<()> {
        self.write(role.props().support, PropertyValue::LinkSubList(references))
    }

    pub fn set_reversed(&mut self, reversed: bool) -> AttachResult<()> {
        self.write(props::MAP_REVERSED, PropertyValue::Bool(reversed))
    }

    pub fn set_path_parameter(&mut self, parameter: f64) -> AttachResult<()> {
        self.write(props::MAP_PATH_PARAMETER, PropertyValue::Float(parameter))
    }

    pub fn set_offset(&mut self, offset: Placement) -> AttachResult<()> {
        self.write(props::ATTACHMENT_OFFSET, PropertyValue::Placement(offset))
    }

    /// Compute and store the placement.
    ///
    /// Returns whether the object is attached. References that do not yet
    /// determine a placement and kernel failures leave the object in the
    /// `Failed` state and return `Ok(false)`.
    #[tracing::instrument(skip(self, kernel), fields(object = ?self.host), target = "trellis_link::attach", level = "debug")]
    pub fn position_by_support(&mut self, kernel: &dyn GeometryKernel) -> AttachResult<bool> {
        if self.as_ref()?.engine_kind(AttachRole::Primary).is_none() {
            return Err(AttachError::NoEngine);
        }
        position_by_support(self.doc, self.host, kernel, false)
    }
}

fn placement(doc: &Document, id: ObjectId, name: &str) -> Placement {
    doc.property(id, name)
        .ok()
        .and_then(PropertyValue::as_placement)
        .unwrap_or_default()
}

fn ext_mut(doc: &mut Document, host: ObjectId) -> AttachResult<&mut AttachExtension> {
    Ok(doc.require_extension_mut::<AttachExtension>(host)?)
}

// ---------------------------------------------------------------------
// Positioning
// ---------------------------------------------------------------------

/// Compute and store the placement of `host`.
///
/// With `strict`, kernel failures are returned instead of being recorded
/// as the `Failed` state.
pub(crate) fn position_by_support(
    doc: &mut Document,
    host: ObjectId,
    kernel: &dyn GeometryKernel,
    strict: bool,
) -> AttachResult<bool> {
    let attach = doc.attachment(host)?;
    if attach.state() == AttachState::Deactivated {
        ext_mut(doc, host)?.active = None;
        update_property_status(doc, host)?;
        return Ok(false);
    }
    let computed = attach.calculate(kernel);

    ext_mut(doc, host)?.updating = true;
    let result = store(doc, host, computed, strict);
    ext_mut(doc, host)?.updating = false;
    update_property_status(doc, host)?;
    result
}

fn store(
    doc: &mut Document,
    host: ObjectId,
    computed: AttachResult<(Attached, Vec<SubElementRename>)>,
    strict: bool,
) -> AttachResult<bool> {
    match computed {
        Ok((attached, base_renames)) => {
            doc.set_property_as(
                host,
                props::PLACEMENT,
                PropertyValue::Placement(attached.placement),
                ChangeOrigin::Internal,
            )?;
            ext_mut(doc, host)?.active = Some(true);
            if !attached.renames.is_empty() {
                rename::rename_references(doc, host, props::ATTACHMENT_SUPPORT, &attached.renames)?;
            }
            if !base_renames.is_empty() {
                rename::rename_references(doc, host, props::BASE_ATTACHMENT, &base_renames)?;
            }
            tracing::debug!(target: "trellis_link::attach", object = ?host, placement = ?attached.placement, "attached");
            Ok(true)
        }
        Err(err) if err.is_recoverable() => {
            ext_mut(doc, host)?.active = Some(false);
            tracing::debug!(target: "trellis_link::attach", object = ?host, reason = %err, "attachment not computable");
            Ok(false)
        }
        Err(AttachError::Kernel(message)) if !strict => {
            ext_mut(doc, host)?.active = Some(false);
            tracing::warn!(target: "trellis_link::attach", object = ?host, %message, "kernel failure during attachment");
            Ok(false)
        }
        Err(err) => {
            ext_mut(doc, host)?.active = Some(false);
            Err(err)
        }
    }
}

/// Lock the placement while attached and show only the properties that
/// affect the current mode.
fn update_property_status(doc: &mut Document, host: ObjectId) -> AttachResult<()> {
    let (lock, primary, base) = {
        let attach = doc.attachment(host)?;
        let mode = attach.map_mode(AttachRole::Primary);
        let lock = match (attach.is_attached(), mode.keeps_rotation()) {
            (false, _) => EditLock::Editable,
            (true, true) => EditLock::RotationOnly,
            (true, false) => EditLock::ReadOnly,
        };
        let visibility = |role: AttachRole| {
            let mode = attach.map_mode(role);
            let single = attach.references(role).len() == 1;
            (mode == MapMode::Deactivated, !(mode.uses_path_parameter() && single))
        };
        (lock, visibility(AttachRole::Primary), visibility(AttachRole::Base))
    };

    if doc.has_property(host, props::PLACEMENT) {
        doc.set_property_status(host, props::PLACEMENT, |s| s.lock = lock)?;
    }
    for (role, (deactivated, hide_path)) in [(AttachRole::Primary, primary), (AttachRole::Base, base)] {
        let p = role.props();
        if !doc.has_property(host, p.mode) {
            continue;
        }
        doc.set_property_status(host, p.path_parameter, |s| s.hidden = hide_path)?;
        doc.set_property_status(host, p.reversed, |s| s.hidden = deactivated)?;
        if role == AttachRole::Primary {
            doc.set_property_status(host, props::ATTACHMENT_OFFSET, |s| s.hidden = deactivated)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Change handling
// ---------------------------------------------------------------------

/// Reject unknown engine types and modes the engine does not offer.
pub(crate) fn check_change(doc: &Document, change: &PropertyChange, value: &PropertyValue) -> AttachResult<()> {
    let Ok(attach) = doc.attachment(change.object) else {
        return Ok(());
    };
    let role = match change.name.as_str() {
        props::ATTACHER_TYPE | props::MAP_MODE => AttachRole::Primary,
        props::BASE_ATTACHER_TYPE | props::BASE_MAP_MODE => AttachRole::Base,
        _ => return Ok(()),
    };
    let name = value.as_str().unwrap_or_default();
    if change.name == role.props().attacher_type {
        if !name.is_empty() && EngineKind::from_type_name(name).is_none() {
            return Err(AttachError::UnknownEngineType(name.to_string()));
        }
        return Ok(());
    }
    let mode = MapMode::parse(name).ok_or_else(|| AttachError::UnknownMode(name.to_string()))?;
    match attach.engine_kind(role) {
        Some(kind) if !kind.supports(mode) => Err(AttachError::UnknownMode(format!(
            "{mode} is not available for {kind}"
        ))),
        _ => Ok(()),
    }
}

fn recompute_on_change(doc: &mut Document, host: ObjectId, kernel: &dyn GeometryKernel) -> AttachResult<()> {
    if doc.attachment(host)?.ext.updating {
        return Ok(());
    }
    position_by_support(doc, host, kernel, false)?;
    Ok(())
}

fn mirror_support(doc: &mut Document, host: ObjectId, from: &str, to: &str) -> AttachResult<()> {
    if doc.attachment(host)?.ext.syncing_support || !doc.has_property(host, to) {
        return Ok(());
    }
    let value = doc.property(host, from)?.clone();
    if *doc.property(host, to)? == value {
        return Ok(());
    }
    ext_mut(doc, host)?.syncing_support = true;
    let result = doc.set_property_as(host, to, value, ChangeOrigin::Internal);
    ext_mut(doc, host)?.syncing_support = false;
    result?;
    Ok(())
}

/// Engine type change. The mode is reset when the new engine does not
/// offer it.
fn on_type_changed(doc: &mut Document, host: ObjectId, role: AttachRole) -> AttachResult<()> {
    let p = role.props();
    let name = doc.property(host, p.attacher_type)?.as_str().unwrap_or_default().to_string();
    let kind = EngineKind::from_type_name(&name);
    if doc.attachment(host)?.engine_kind(role) == kind {
        return Ok(());
    }
    ext_mut(doc, host)?.set_kind(role, kind);
    tracing::debug!(target: "trellis_link::attach", object = ?host, ?role, engine = %name, "attach engine changed");

    let mode = doc.attachment(host)?.map_mode(role);
    if !kind.is_some_and(|k| k.supports(mode)) && mode != MapMode::Deactivated {
        doc.set_property_as(
            host,
            p.mode,
            PropertyValue::Enum(MapMode::Deactivated.as_str().into()),
            ChangeOrigin::Internal,
        )?;
    }
    Ok(())
}

pub(crate) fn on_host_changed(
    doc: &mut Document,
    host: ObjectId,
    change: &PropertyChange,
    kernel: &dyn GeometryKernel,
) -> AttachResult<()> {
    if !doc.is_attachable(host) {
        return Ok(());
    }
    match change.name.as_str() {
        props::ATTACHER_TYPE => {
            on_type_changed(doc, host, AttachRole::Primary)?;
            recompute_on_change(doc, host, kernel)
        }
        props::BASE_ATTACHER_TYPE => {
            on_type_changed(doc, host, AttachRole::Base)?;
            recompute_on_change(doc, host, kernel)
        }
        props::SUPPORT => mirror_support(doc, host, props::SUPPORT, props::ATTACHMENT_SUPPORT),
        props::ATTACHMENT_SUPPORT => {
            mirror_support(doc, host, props::ATTACHMENT_SUPPORT, props::SUPPORT)?;
            recompute_on_change(doc, host, kernel)
        }
        props::MAP_MODE
        | props::MAP_REVERSED
        | props::MAP_PATH_PARAMETER
        | props::ATTACHMENT_OFFSET
        | props::BASE_ATTACHMENT
        | props::BASE_MAP_MODE
        | props::BASE_MAP_REVERSED
        | props::BASE_MAP_PATH_PARAMETER => recompute_on_change(doc, host, kernel),
        _ => Ok(()),
    }
}

/// Drop references to an object that is about to be removed.
pub(crate) fn on_object_removing(doc: &mut Document, object: ObjectId) -> AttachResult<()> {
    let hosts: Vec<ObjectId> = doc
        .registry()
        .ids()
        .filter(|&id| id != object && doc.is_attachable(id))
        .collect();
    for host in hosts {
        for property in [props::ATTACHMENT_SUPPORT, props::BASE_ATTACHMENT] {
            let Some(links) = doc
                .property(host, property)
                .ok()
                .and_then(PropertyValue::as_link_sub_list)
            else {
                continue;
            };
            if !links.iter().any(|l| l.object == Some(object)) {
                continue;
            }
            let kept: Vec<LinkSub> = links
                .iter()
                .filter(|l| l.object != Some(object))
                .cloned()
                .collect();
            tracing::debug!(target: "trellis_link::attach", object = ?host, removed = ?object, property, "dropped attachment reference");
            doc.set_property_as(host, property, PropertyValue::LinkSubList(kept), ChangeOrigin::Internal)?;
        }
    }
    Ok(())
}

/// Rebuild the engines from the stored type strings and migrate legacy
/// properties. The attachment is computed once, without storing the result,
/// so the placement lock matches the restored state.
pub(crate) fn on_object_loaded(doc: &mut Document, host: ObjectId, kernel: &dyn GeometryKernel) -> AttachResult<()> {
    if !doc.has_property(host, props::ATTACHER_TYPE) {
        return Ok(());
    }
    if let Some(legacy) = doc.remove_property(host, props::LEGACY_OFFSET)?
        && let Some(offset) = legacy.value().as_placement()
    {
        doc.ensure_property(host, props::ATTACHMENT_OFFSET, || {
            cell(PropertyValue::Placement(Placement::IDENTITY), "Extra placement applied in the attached frame")
        })?;
        doc.set_property_as(host, props::ATTACHMENT_OFFSET, PropertyValue::Placement(offset), ChangeOrigin::Restore)?;
        tracing::debug!(target: "trellis_link::attach", object = ?host, "migrated legacy attachment offset");
    }
    doc.ensure_property(host, props::SUPPORT, || {
        cell(PropertyValue::LinkSubList(Vec::new()), "Alias of AttachmentSupport").hidden()
    })?;
    let support = doc.property(host, props::ATTACHMENT_SUPPORT)?.clone();
    let legacy = doc.property(host, props::SUPPORT)?.clone();
    let (target, value) = match (&support, &legacy) {
        (PropertyValue::LinkSubList(s), PropertyValue::LinkSubList(l)) if s.is_empty() && !l.is_empty() => {
            (props::ATTACHMENT_SUPPORT, legacy.clone())
        }
        _ => (props::SUPPORT, support.clone()),
    };
    doc.set_property_as(host, target, value, ChangeOrigin::Restore)?;
    hide_base_support(doc, host)?;

    let kind_of = |doc: &Document, name: &str| {
        doc.property(host, name)
            .ok()
            .and_then(PropertyValue::as_str)
            .and_then(EngineKind::from_type_name)
    };
    let extension = AttachExtension {
        kind: kind_of(doc, props::ATTACHER_TYPE),
        base_kind: kind_of(doc, props::BASE_ATTACHER_TYPE),
        ..Default::default()
    };
    doc.set_extension(host, extension)?;

    let computed = {
        let attach = doc.attachment(host)?;
        (attach.state() != AttachState::Deactivated).then(|| attach.calculate(kernel).is_ok())
    };
    ext_mut(doc, host)?.active = computed;
    update_property_status(doc, host)
}

/// Recompute pass: kernel failures are errors here.
pub(crate) fn execute(doc: &mut Document, host: ObjectId, kernel: &dyn GeometryKernel) -> AttachResult<()> {
    let Ok(attach) = doc.attachment(host) else {
        return Ok(());
    };
    if attach.engine_kind(AttachRole::Primary).is_none() {
        return Ok(());
    }
    position_by_support(doc, host, kernel, true)?;
    Ok(())
}
