//! Integration tests for attachment positioning.

use std::sync::Arc;

use glam::{DQuat, DVec3};
use parking_lot::Mutex;
use trellis_core::{Document, EditLock, LinkSub, ObjectId, PathRename, Placement, PropertyCell, PropertyValue};
use trellis_link::attach::props;
use trellis_link::{
    AttachDocumentExt, AttachRole, AttachState, ElementGeometry, EngineKind, MapMode, MemoryKernel,
    add_attach_extension,
};

const EPS: f64 = 1e-9;

struct Scene {
    doc: Document,
    kernel: Arc<MemoryKernel>,
    body: ObjectId,
    sketch: ObjectId,
}

/// A body lifted 10 units up and turned a quarter around Z, with a top face
/// and three corner vertices, plus an unattached sketch.
fn scene() -> Scene {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut doc = Document::new();
    let kernel = Arc::new(MemoryKernel::new());
    trellis_link::install(&mut doc, kernel.clone());

    let body = doc.add_object("Part::Box", "Box");
    doc.add_property(
        body,
        props::PLACEMENT,
        PropertyCell::new(PropertyValue::Placement(Placement::new(
            DVec3::new(0.0, 0.0, 10.0),
            DQuat::from_rotation_z(std::f64::consts::FRAC_PI_2),
        ))),
    )
    .unwrap();
    kernel.add_element(
        body,
        "Face6",
        ElementGeometry::Plane {
            origin: DVec3::new(0.0, 0.0, 5.0),
            normal: DVec3::Z,
            x_axis: DVec3::X,
        },
    );
    kernel.add_element(body, "Vertex1", ElementGeometry::Point(DVec3::ZERO));
    kernel.add_element(body, "Vertex2", ElementGeometry::Point(DVec3::X));
    kernel.add_element(body, "Vertex3", ElementGeometry::Point(DVec3::Y));

    let sketch = doc.add_object("Sketcher::Sketch", "Sketch");
    add_attach_extension(&mut doc, sketch, EngineKind::Plane).unwrap();
    Scene {
        doc,
        kernel,
        body,
        sketch,
    }
}

fn attach(scene: &mut Scene, mode: MapMode, subs: &[&str]) {
    let mut attach = scene.doc.attachment_mut(scene.sketch).unwrap();
    attach
        .set_references(vec![LinkSub::with_subs(scene.body, subs.iter().copied())])
        .unwrap();
    attach.set_map_mode(mode).unwrap();
}

fn placement(scene: &Scene) -> Placement {
    scene.doc.attachment(scene.sketch).unwrap().placement()
}

#[test]
fn test_flat_face_follows_body_frame() {
    let mut s = scene();
    attach(&mut s, MapMode::FlatFace, &["Face6"]);
    let p = placement(&s);
    assert!(p.position.abs_diff_eq(DVec3::new(0.0, 0.0, 15.0), EPS));
    // The face X axis turns with the body.
    assert!((p.rotation * DVec3::X).abs_diff_eq(DVec3::Y, EPS));
    assert!((p.rotation * DVec3::Z).abs_diff_eq(DVec3::Z, EPS));
}

#[test]
fn test_positioning_is_deterministic() {
    let mut s = scene();
    attach(&mut s, MapMode::ThreePointsPlane, &["Vertex1", "Vertex2", "Vertex3"]);
    let first = placement(&s);
    for _ in 0..3 {
        let mut attach = s.doc.attachment_mut(s.sketch).unwrap();
        assert!(attach.position_by_support(s.kernel.as_ref()).unwrap());
        assert_eq!(placement(&s), first);
    }
    let (computed, _) = s
        .doc
        .attachment(s.sketch)
        .unwrap()
        .calculate(s.kernel.as_ref())
        .unwrap();
    assert_eq!(computed.placement, first);
}

#[test]
fn test_offset_applies_in_attached_frame() {
    let mut s = scene();
    attach(&mut s, MapMode::FlatFace, &["Face6"]);
    s.doc
        .attachment_mut(s.sketch)
        .unwrap()
        .set_offset(Placement::from_translation(DVec3::new(1.0, 0.0, 2.0)))
        .unwrap();
    // Local X of the face points along global Y.
    assert!(placement(&s).position.abs_diff_eq(DVec3::new(0.0, 1.0, 17.0), EPS));
}

#[test]
fn test_mode_switch_scenario() {
    let mut s = scene();
    attach(&mut s, MapMode::FlatFace, &["Face6"]);
    let on_face = placement(&s);

    // Widening the engine keeps the mode.
    s.doc
        .attachment_mut(s.sketch)
        .unwrap()
        .set_attacher_type(EngineKind::Engine3D.type_name())
        .unwrap();
    assert_eq!(s.doc.attachment(s.sketch).unwrap().map_mode(AttachRole::Primary), MapMode::FlatFace);
    assert_eq!(placement(&s), on_face);

    // Translate keeps the current orientation and unlocks it.
    let mut view = s.doc.attachment_mut(s.sketch).unwrap();
    view.set_map_mode(MapMode::Translate).unwrap();
    view.set_references(vec![LinkSub::with_subs(s.body, ["Vertex2"])])
        .unwrap();
    let moved = placement(&s);
    assert!(moved.position.abs_diff_eq(DVec3::new(0.0, 1.0, 10.0), EPS));
    assert!(moved.rotation.abs_diff_eq(on_face.rotation, EPS));
    let lock = s.doc.property_cell(s.sketch, props::PLACEMENT).unwrap().status.lock;
    assert_eq!(lock, EditLock::RotationOnly);

    // Deactivating freezes the last result and frees the placement.
    s.doc
        .attachment_mut(s.sketch)
        .unwrap()
        .set_map_mode(MapMode::Deactivated)
        .unwrap();
    let attach = s.doc.attachment(s.sketch).unwrap();
    assert_eq!(attach.state(), AttachState::Deactivated);
    assert_eq!(attach.placement(), moved);
    s.doc
        .set_property(s.sketch, props::PLACEMENT, PropertyValue::Placement(Placement::IDENTITY))
        .unwrap();
}

#[test]
fn test_rename_reported_to_listeners() {
    let mut s = scene();
    attach(&mut s, MapMode::FlatFace, &["Face6"]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _guard = s
        .doc
        .signals()
        .paths_renamed
        .connect_scoped(move |renames: &Vec<PathRename>| sink.lock().extend(renames.iter().cloned()));

    s.kernel.rename_element(s.body, "Face6", "Face9");
    s.doc.recompute(s.sketch).unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].object, s.sketch);
    assert_eq!(seen[0].old, "Box.Face6");
    assert_eq!(seen[0].new, "Box.Face9");
    let support = s.doc.attachment(s.sketch).unwrap().support(AttachRole::Primary).to_vec();
    assert_eq!(support[0].subs, ["Face9"]);
}

#[test]
fn test_attachment_restored_from_json() {
    let mut s = scene();
    attach(&mut s, MapMode::FlatFace, &["Face6"]);
    let attached = placement(&s);

    let json = serde_json::to_string(&s.doc.snapshot()).unwrap();
    let mut restored = Document::new();
    trellis_link::install(&mut restored, s.kernel.clone());
    restored.restore(serde_json::from_str(&json).unwrap()).unwrap();

    let view = restored.attachment(s.sketch).unwrap();
    assert_eq!(view.engine_kind(AttachRole::Primary), Some(EngineKind::Plane));
    assert_eq!(view.map_mode(AttachRole::Primary), MapMode::FlatFace);
    assert_eq!(view.placement(), attached);
    let lock = restored.property_cell(s.sketch, props::PLACEMENT).unwrap().status.lock;
    assert_eq!(lock, EditLock::ReadOnly);

    restored.recompute(s.sketch).unwrap();
    assert_eq!(restored.attachment(s.sketch).unwrap().state(), AttachState::Active);
}

#[test]
fn test_mode_serializes_by_name() {
    assert_eq!(serde_json::to_string(&MapMode::FlatFace).unwrap(), "\"FlatFace\"");
    let kind: EngineKind = serde_json::from_str("\"Point\"").unwrap();
    assert_eq!(kind, EngineKind::Point);
}
