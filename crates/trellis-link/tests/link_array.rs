//! Integration tests for link arrays, groups and sub-name resolution.

use std::sync::Arc;

use glam::DVec3;
use trellis_core::{Document, ObjectId, Placement, PropertyCell, PropertyValue};
use trellis_link::link::props;
use trellis_link::{
    LinkDocumentExt, LinkError, LinkMode, LinkShape, MemoryKernel, make_link, make_link_array,
    make_link_group,
};

fn setup() -> Document {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut doc = Document::new();
    trellis_link::install(&mut doc, Arc::new(MemoryKernel::new()));
    doc
}

fn cube(doc: &mut Document) -> ObjectId {
    let cube = doc.add_object("Part::Box", "Box");
    doc.add_property(
        cube,
        props::PLACEMENT,
        PropertyCell::new(PropertyValue::Placement(Placement::IDENTITY)),
    )
    .unwrap();
    cube
}

fn bolt_pattern(doc: &mut Document, target: ObjectId) -> ObjectId {
    let array = make_link_array(doc, "Bolts", Some(target), 3).unwrap();
    let mut link = doc.link_mut(array).unwrap();
    for i in 0..3 {
        link.set_element_placement(i, Placement::from_translation(DVec3::new(i as f64 * 10.0, 0.0, 0.0)))
            .unwrap();
    }
    array
}

#[test]
fn test_simple_array_resolves_each_element() {
    let mut doc = setup();
    let target = cube(&mut doc);
    let array = bolt_pattern(&mut doc, target);

    let view = doc.link(array).unwrap();
    assert_eq!(view.shape(), LinkShape::Array);
    assert_eq!(view.element_count(), 3);
    for i in 0..3 {
        let sub = view
            .extension_get_sub_object(&format!("{i}.Face1"))
            .unwrap()
            .unwrap();
        assert_eq!(sub.object, target);
        assert_eq!(sub.element, "Face1");
        assert_eq!(
            sub.matrix.transform_point3(DVec3::ZERO),
            DVec3::new(i as f64 * 10.0, 0.0, 0.0)
        );
    }
}

#[test]
fn test_element_bounds_are_enforced() {
    let mut doc = setup();
    let target = cube(&mut doc);
    let array = bolt_pattern(&mut doc, target);

    let mut link = doc.link_mut(array).unwrap();
    let err = link
        .set_element_placement(3, Placement::IDENTITY)
        .unwrap_err();
    assert!(matches!(err, LinkError::InvalidIndex { index: 3, count: 3 }));
    let err = link.set_link(7, Some(target), None, Vec::new()).unwrap_err();
    assert!(matches!(err, LinkError::InvalidIndex { index: 7, .. }));
    assert_eq!(doc.link(array).unwrap().element_count(), 3);
}

#[test]
fn test_groups_grow_on_assignment() {
    let mut doc = setup();
    let a = cube(&mut doc);
    let b = doc.add_object("Part::Cylinder", "Cylinder");
    let group = make_link_group(&mut doc, "Assembly").unwrap();

    let mut link = doc.link_mut(group).unwrap();
    link.set_link(0, Some(a), None, Vec::new()).unwrap();
    link.set_link(5, Some(b), None, Vec::new()).unwrap();
    assert_eq!(doc.link(group).unwrap().element_list(), [a, b]);

    doc.link_mut(group)
        .unwrap()
        .set_link(0, None, None, Vec::new())
        .unwrap();
    assert_eq!(doc.link(group).unwrap().element_list(), [b]);
}

#[test]
fn test_auto_link_group_wraps_targets() {
    let mut doc = setup();
    let a = cube(&mut doc);
    let group = make_link_group(&mut doc, "Assembly").unwrap();
    doc.link_mut(group)
        .unwrap()
        .set_link_mode(LinkMode::AutoLink)
        .unwrap();
    doc.link_mut(group)
        .unwrap()
        .set_link(0, Some(a), None, Vec::new())
        .unwrap();

    let wrapper = doc.link(group).unwrap().element_list()[0];
    assert_ne!(wrapper, a);
    assert_eq!(doc.group_of(wrapper).unwrap(), Some(group));
    assert_eq!(doc.link(wrapper).unwrap().linked_object(), Some(a));
}

#[test]
fn test_cycles_are_rejected_without_side_effects() {
    let mut doc = setup();
    let target = cube(&mut doc);
    let array = make_link_array(&mut doc, "Array", Some(target), 2).unwrap();
    let outer = make_link(&mut doc, "Outer", Some(array)).unwrap();

    let err = doc
        .link_mut(array)
        .unwrap()
        .set_link(-1, Some(outer), None, Vec::new())
        .unwrap_err();
    assert!(matches!(err, LinkError::CircularLink { .. }));
    assert_eq!(doc.link(array).unwrap().linked_object(), Some(target));
    let element = doc.link(array).unwrap().element_object(0).unwrap();
    assert_eq!(doc.link(element).unwrap().linked_object(), Some(target));
}

#[test]
fn test_array_slot_cannot_contain_its_array() {
    let mut doc = setup();
    let target = cube(&mut doc);
    let array = make_link_array(&mut doc, "Array", Some(target), 2).unwrap();
    let outer = make_link(&mut doc, "Outer", Some(array)).unwrap();

    let err = doc
        .link_mut(array)
        .unwrap()
        .set_link(1, Some(array), None, Vec::new())
        .unwrap_err();
    assert!(matches!(err, LinkError::CircularLink { .. }));
    let err = doc
        .link_mut(array)
        .unwrap()
        .set_link(0, Some(outer), None, Vec::new())
        .unwrap_err();
    assert!(matches!(err, LinkError::CircularLink { .. }));

    let view = doc.link(array).unwrap();
    for i in 0..2 {
        let element = view.element_object(i).unwrap();
        assert_eq!(doc.link(element).unwrap().linked_object(), Some(target));
    }
}

#[test]
fn test_removed_slot_target_keeps_array_queryable() {
    let mut doc = setup();
    let target = cube(&mut doc);
    let x = doc.add_object("Part::Sphere", "Sphere");
    let array = bolt_pattern(&mut doc, target);
    doc.link_mut(array)
        .unwrap()
        .set_link(2, Some(x), None, Vec::new())
        .unwrap();
    let slot = doc.link(array).unwrap().element_object(2).unwrap();
    assert_eq!(doc.link(slot).unwrap().linked_object(), Some(x));

    doc.remove_object(x).unwrap();
    let view = doc.link(array).unwrap();
    let children = view.linked_children(false);
    assert_eq!(children.len(), 3);
    assert!(!children.contains(&x));
    assert_eq!(doc.link(slot).unwrap().linked_object(), None);

    let element = view.element(2);
    assert_eq!(element.object, Some(slot));
    assert_eq!(
        element.placement,
        Placement::from_translation(DVec3::new(20.0, 0.0, 0.0))
    );
    assert!(element.visible);
    assert!(view.is_element_visible("2."));
    assert!(view.extension_get_sub_object("2.Face1").is_ok());
}

#[test]
fn test_removed_target_leaves_dangling_link() {
    let mut doc = setup();
    let target = cube(&mut doc);
    let array = bolt_pattern(&mut doc, target);
    doc.remove_object(target).unwrap();

    let view = doc.link(array).unwrap();
    assert_eq!(view.linked_object(), None);
    assert_eq!(view.element_count(), 3);
    assert_eq!(view.true_linked_object(true).unwrap(), None);
}

#[test]
fn test_fresh_array_uses_defaults() {
    let mut doc = setup();
    let target = cube(&mut doc);
    let array = make_link_array(&mut doc, "Array", Some(target), 3).unwrap();

    let elements = doc.link(array).unwrap().elements();
    assert_eq!(elements.len(), 3);
    for (i, element) in elements.iter().enumerate() {
        assert_eq!(element.index, i);
        assert_eq!(element.placement, Placement::IDENTITY);
        assert_eq!(element.scale, DVec3::ONE);
        assert_eq!(element.matrix, None);
        assert!(element.visible);
    }
}

#[test]
fn test_deleted_group_slot_degrades_to_default() {
    let mut doc = setup();
    let a = cube(&mut doc);
    let b = doc.add_object("Part::Cylinder", "Cylinder");
    let x = doc.add_object("Part::Sphere", "Sphere");
    doc.add_property(
        x,
        props::PLACEMENT,
        PropertyCell::new(PropertyValue::Placement(Placement::from_translation(DVec3::Z))),
    )
    .unwrap();
    let group = make_link_group(&mut doc, "Assembly").unwrap();
    let mut link = doc.link_mut(group).unwrap();
    for (i, object) in [a, b, x].into_iter().enumerate() {
        link.set_link(i as i64, Some(object), None, Vec::new()).unwrap();
    }

    doc.remove_object(x).unwrap();
    let view = doc.link(group).unwrap();
    assert_eq!(view.linked_children(true), vec![a, b]);
    let slot = view.element(2);
    assert_eq!(slot.object, None);
    assert_eq!(slot.placement, Placement::IDENTITY);
    assert!(slot.visible);
}

#[test]
fn test_snapshot_survives_json_round_trip() {
    let mut doc = setup();
    let target = cube(&mut doc);
    let array = bolt_pattern(&mut doc, target);
    doc.link_mut(array)
        .unwrap()
        .set_element_visible("2.", false)
        .unwrap();

    let json = serde_json::to_string(&doc.snapshot()).unwrap();
    let mut restored = setup();
    restored.restore(serde_json::from_str(&json).unwrap()).unwrap();

    let view = restored.link(array).unwrap();
    assert_eq!(view.element_count(), 3);
    assert!(!view.is_element_visible_at(2));
    assert_eq!(view.placement_list(), doc.link(array).unwrap().placement_list());
    let element = view.element_object(1).unwrap();
    assert_eq!(restored.link(element).unwrap().extension().element_of(), Some(array));

    // Element edits still write back after the restore.
    let moved = Placement::from_translation(DVec3::new(0.0, 3.0, 0.0));
    restored
        .set_property(element, props::PLACEMENT, PropertyValue::Placement(moved))
        .unwrap();
    assert_eq!(restored.link(array).unwrap().placement_list()[1], moved);
}

#[test]
fn test_duplicated_array_owns_its_elements() {
    let mut doc = setup();
    let target = cube(&mut doc);
    let array = bolt_pattern(&mut doc, target);
    let copy = doc.duplicate_object(array).unwrap();

    let original = doc.link(array).unwrap().element_list().to_vec();
    let copied = doc.link(copy).unwrap().element_list().to_vec();
    assert_eq!(copied.len(), 3);
    assert!(copied.iter().all(|e| !original.contains(e)));
    for &element in &copied {
        assert_eq!(doc.group_of(element).unwrap(), Some(copy));
        assert_eq!(doc.link(element).unwrap().extension().element_of(), Some(copy));
        assert_eq!(doc.link(element).unwrap().linked_object(), Some(target));
    }
}
