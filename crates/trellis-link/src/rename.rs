//! Sub-element rename migration.
//!
//! After a topological change the kernel may know an element under a new
//! name. References stored in `LinkSub` and `LinkSubList` properties are
//! rewritten in place and every rewritten path is reported through
//! [`DocumentSignals::paths_renamed`](trellis_core::DocumentSignals) as
//! `Object.sub` text, so expression layers can migrate their bindings.

use serde::{Deserialize, Serialize};
use trellis_core::{ChangeOrigin, CoreResult, Document, ObjectId, PathRename, PropertyValue};

/// One element of `object` now known as `new`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubElementRename {
    pub object: ObjectId,
    pub old: String,
    pub new: String,
}

/// Rewrite one sub-name if its last segment is `old`.
fn rename_sub(sub: &str, old: &str, new: &str) -> Option<String> {
    if sub == old {
        return Some(new.to_string());
    }
    let prefix = sub.strip_suffix(old)?.strip_suffix('.')?;
    Some(format!("{prefix}.{new}"))
}

fn path(doc: &Document, object: ObjectId, sub: &str) -> String {
    let name = doc.name(object).unwrap_or_default();
    if sub.is_empty() {
        name.to_string()
    } else {
        format!("{name}.{sub}")
    }
}

/// Apply `renames` to one reference property of `owner`.
///
/// Returns the rewritten paths; nothing is emitted.
fn rewrite_property(
    doc: &mut Document,
    owner: ObjectId,
    property: &str,
    renames: &[SubElementRename],
) -> CoreResult<Vec<PathRename>> {
    let mut value = doc.property(owner, property)?.clone();
    let mut reported = Vec::new();
    {
        let links = match &mut value {
            PropertyValue::LinkSub(link) => std::slice::from_mut(link),
            PropertyValue::LinkSubList(list) => list.as_mut_slice(),
            _ => return Ok(Vec::new()),
        };
        for link in links {
            let Some(object) = link.object else {
                continue;
            };
            for rename in renames.iter().filter(|r| r.object == object) {
                for sub in &mut link.subs {
                    if let Some(new_sub) = rename_sub(sub, &rename.old, &rename.new) {
                        reported.push((object, std::mem::replace(sub, new_sub.clone()), new_sub));
                    }
                }
            }
        }
    }
    if reported.is_empty() {
        return Ok(Vec::new());
    }
    doc.set_property_as(owner, property, value, ChangeOrigin::Internal)?;
    Ok(reported
        .into_iter()
        .map(|(object, old, new)| PathRename {
            object: owner,
            property: property.to_string(),
            old: path(doc, object, &old),
            new: path(doc, object, &new),
        })
        .collect())
}

/// Rewrite a reference property of `owner` and report the renamed paths.
pub fn rename_references(
    doc: &mut Document,
    owner: ObjectId,
    property: &str,
    renames: &[SubElementRename],
) -> CoreResult<Vec<PathRename>> {
    let renamed = rewrite_property(doc, owner, property, renames)?;
    if !renamed.is_empty() {
        tracing::debug!(target: "trellis_link::rename", object = ?owner, property, count = renamed.len(), "migrated sub-element references");
        doc.emit_renames(renamed.clone());
    }
    Ok(renamed)
}

/// Rewrite every reference to `object`'s element `old` in the document.
pub fn rename_sub_element(
    doc: &mut Document,
    object: ObjectId,
    old: &str,
    new: &str,
) -> CoreResult<Vec<PathRename>> {
    let rename = [SubElementRename {
        object,
        old: old.to_string(),
        new: new.to_string(),
    }];
    let holders: Vec<(ObjectId, String)> = doc
        .registry()
        .ids()
        .filter_map(|id| doc.object(id).ok().map(|data| (id, data)))
        .flat_map(|(id, data)| {
            data.properties()
                .filter(|(_, cell)| {
                    matches!(
                        cell.value(),
                        PropertyValue::LinkSub(_) | PropertyValue::LinkSubList(_)
                    ) && cell.value().referenced_objects().contains(&object)
                })
                .map(move |(name, _)| (id, name.to_string()))
                .collect::<Vec<_>>()
        })
        .collect();

    let mut renamed = Vec::new();
    for (owner, property) in holders {
        renamed.extend(rewrite_property(doc, owner, &property, &rename)?);
    }
    if !renamed.is_empty() {
        tracing::debug!(target: "trellis_link::rename", ?object, old, new, count = renamed.len(), "renamed sub-element");
        doc.emit_renames(renamed.clone());
    }
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use trellis_core::{LinkSub, PropertyCell};

    #[test]
    fn test_rename_sub_suffix() {
        assert_eq!(rename_sub("Face6", "Face6", "Face7").as_deref(), Some("Face7"));
        assert_eq!(
            rename_sub("Body.Pad.Face6", "Face6", "Face7").as_deref(),
            Some("Body.Pad.Face7")
        );
        assert_eq!(rename_sub("Face16", "Face6", "Face7"), None);
        assert_eq!(rename_sub("Edge1", "Face6", "Face7"), None);
    }

    #[test]
    fn test_rename_everywhere_reports_paths() {
        let mut doc = Document::new();
        let body = doc.add_object("Part::Box", "Box");
        let sketch = doc.add_object("Sketcher::Sketch", "Sketch");
        let datum = doc.add_object("Part::Plane", "Plane");
        doc.add_property(
            sketch,
            "AttachmentSupport",
            PropertyCell::new(PropertyValue::LinkSubList(vec![LinkSub::with_subs(
                body,
                ["Face6", "Edge1"],
            )])),
        )
        .unwrap();
        doc.add_property(
            datum,
            "Reference",
            PropertyCell::new(PropertyValue::LinkSub(LinkSub::with_subs(body, ["Face6"]))),
        )
        .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _guard = doc
            .signals()
            .paths_renamed
            .connect_scoped(move |renames: &Vec<PathRename>| sink.lock().extend(renames.iter().cloned()));

        let renamed = rename_sub_element(&mut doc, body, "Face6", "Face7").unwrap();
        assert_eq!(renamed.len(), 2);
        assert_eq!(seen.lock().len(), 2);
        assert!(renamed.iter().all(|r| r.old == "Box.Face6" && r.new == "Box.Face7"));

        let list = doc.property(sketch, "AttachmentSupport").unwrap().as_link_sub_list().unwrap();
        assert_eq!(list[0].subs, ["Face7", "Edge1"]);
        let link = doc.property(datum, "Reference").unwrap().as_link_sub().unwrap();
        assert_eq!(link.subs, ["Face7"]);
    }

    #[test]
    fn test_non_reference_property_reports_nothing() {
        let mut doc = Document::new();
        let body = doc.add_object("Part::Box", "Box");
        doc.add_property(body, "Length", PropertyCell::new(PropertyValue::Float(4.0)))
            .unwrap();
        let rename = [SubElementRename {
            object: body,
            old: "Face6".into(),
            new: "Face7".into(),
        }];
        assert!(rename_references(&mut doc, body, "Length", &rename).unwrap().is_empty());
        assert_eq!(doc.property(body, "Length").unwrap(), &PropertyValue::Float(4.0));
    }

    #[test]
    fn test_unrelated_property_untouched() {
        let mut doc = Document::new();
        let body = doc.add_object("Part::Box", "Box");
        let other = doc.add_object("Part::Box", "Other");
        let sketch = doc.add_object("Sketcher::Sketch", "Sketch");
        doc.add_property(
            sketch,
            "AttachmentSupport",
            PropertyCell::new(PropertyValue::LinkSubList(vec![LinkSub::with_subs(
                other,
                ["Face6"],
            )])),
        )
        .unwrap();
        let renamed = rename_references(
            &mut doc,
            sketch,
            "AttachmentSupport",
            &[SubElementRename {
                object: body,
                old: "Face6".into(),
                new: "Face7".into(),
            }],
        )
        .unwrap();
        assert!(renamed.is_empty());
    }
}
