//! Placement computation from resolved references.

use glam::{DQuat, DVec3};
use trellis_core::{Document, LinkSub, ObjectId, Placement};

use super::mode::{EngineKind, MapMode};
use crate::error::{AttachError, AttachResult};
use crate::kernel::{ElementGeometry, GeometryKernel};
use crate::rename::SubElementRename;

/// At most this many references take part in an attachment.
pub const MAX_REFERENCES: usize = 4;

/// One `(object, sub-element)` reference. An empty sub-name refers to the
/// object as a whole.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub object: ObjectId,
    pub subname: String,
}

/// Flatten link-sub values into ordered references.
pub fn references_from_links(links: &[LinkSub]) -> Vec<Reference> {
    let mut out = Vec::new();
    for link in links {
        let Some(object) = link.object else {
            continue;
        };
        if link.subs.is_empty() {
            out.push(Reference {
                object,
                subname: String::new(),
            });
        } else {
            out.extend(link.subs.iter().map(|sub| Reference {
                object,
                subname: sub.clone(),
            }));
        }
    }
    out
}

/// Result of a successful calculation.
#[derive(Clone, Debug, PartialEq)]
pub struct Attached {
    pub placement: Placement,
    /// Sub-elements the kernel now knows under a different name.
    pub renames: Vec<SubElementRename>,
}

/// A configured placement strategy.
#[derive(Clone, Debug, PartialEq)]
pub struct AttachEngine {
    pub kind: EngineKind,
    pub mode: MapMode,
    pub references: Vec<Reference>,
    pub reversed: bool,
    pub path_parameter: f64,
    /// Applied in the attached frame after reversal.
    pub offset: Placement,
}

impl AttachEngine {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            mode: MapMode::Deactivated,
            references: Vec::new(),
            reversed: false,
            path_parameter: 0.0,
            offset: Placement::IDENTITY,
        }
    }

    /// Compute the attached placement.
    ///
    /// `current` is the host's present placement; only modes that keep the
    /// orientation read it. Missing or degenerate references are reported
    /// as [`AttachError::NotComputable`].
    pub fn calculate(
        &self,
        doc: &Document,
        kernel: &dyn GeometryKernel,
        current: Placement,
    ) -> AttachResult<Attached> {
        if self.mode == MapMode::Deactivated {
            return Err(AttachError::NotComputable("attachment is deactivated".into()));
        }
        if !self.kind.supports(self.mode) {
            return Err(AttachError::UnknownMode(format!(
                "{} is not available for {}",
                self.mode, self.kind
            )));
        }
        let needed = self.mode.reference_count();
        if self.references.len() < needed {
            return Err(AttachError::NotComputable(format!(
                "{} needs {needed} reference(s), {} given",
                self.mode,
                self.references.len()
            )));
        }
        if self.references.len() > MAX_REFERENCES {
            return Err(AttachError::NotComputable(format!(
                "at most {MAX_REFERENCES} references are supported"
            )));
        }

        let mut geometry = Vec::with_capacity(needed);
        let mut renames = Vec::new();
        for reference in &self.references[..needed] {
            let resolved = kernel.resolve(doc, reference.object, &reference.subname)?;
            if let Some(new) = resolved.renamed {
                renames.push(SubElementRename {
                    object: reference.object,
                    old: reference.subname.clone(),
                    new,
                });
            }
            geometry.push(resolved.geometry);
        }

        let placement = if self.mode.keeps_rotation() {
            let point = anchor(&geometry[0])?;
            Placement::new(point + current.rotation * self.offset.position, current.rotation)
        } else {
            let mut frame = self.raw_frame(&geometry)?;
            if self.reversed {
                frame = frame.reversed();
            }
            frame * self.offset
        };
        Ok(Attached { placement, renames })
    }

    fn raw_frame(&self, geometry: &[ElementGeometry]) -> AttachResult<Placement> {
        let degenerate = || AttachError::NotComputable(format!("degenerate references for {}", self.mode));
        match self.mode {
            MapMode::ObjectXY => frame_of(&geometry[0]).ok_or_else(degenerate),
            MapMode::ObjectXZ => frame_of(&geometry[0])
                .map(|f| f * Placement::from_rotation(DQuat::from_rotation_x(std::f64::consts::FRAC_PI_2)))
                .ok_or_else(degenerate),
            MapMode::ObjectYZ => {
                let frame = frame_of(&geometry[0]).ok_or_else(degenerate)?;
                let swap = Placement::from_axes(DVec3::ZERO, DVec3::Y, DVec3::X).ok_or_else(degenerate)?;
                Ok(frame * swap)
            }
            MapMode::FlatFace => match &geometry[0] {
                ElementGeometry::Plane {
                    origin,
                    normal,
                    x_axis,
                } => Placement::from_axes(*origin, *x_axis, *normal).ok_or_else(degenerate),
                ElementGeometry::Frame(frame) => Ok(*frame),
                _ => Err(AttachError::NotComputable("FlatFace needs a planar reference".into())),
            },
            MapMode::NormalToPath => {
                let (point, tangent) =
                    point_on_path(&geometry[0], self.path_parameter).ok_or_else(|| {
                        AttachError::NotComputable("NormalToPath needs an edge reference".into())
                    })?;
                Placement::from_normal(point, tangent).ok_or_else(degenerate)
            }
            MapMode::ThreePointsPlane => {
                let [p0, p1, p2] = three_points(geometry)?;
                let normal = (p1 - p0).cross(p2 - p0);
                Placement::from_axes(p0, p1 - p0, normal).ok_or_else(degenerate)
            }
            MapMode::ThreePointsNormal => {
                let [p0, p1, p2] = three_points(geometry)?;
                Placement::from_axes(p0, p2 - p0, p1 - p0).ok_or_else(degenerate)
            }
            MapMode::Deactivated | MapMode::Translate => Err(degenerate()),
        }
    }
}

fn anchor(geometry: &ElementGeometry) -> AttachResult<DVec3> {
    geometry
        .anchor()
        .ok_or_else(|| AttachError::NotComputable("reference has no position".into()))
}

fn three_points(geometry: &[ElementGeometry]) -> AttachResult<[DVec3; 3]> {
    Ok([anchor(&geometry[0])?, anchor(&geometry[1])?, anchor(&geometry[2])?])
}

/// Coordinate system carried by an element.
fn frame_of(geometry: &ElementGeometry) -> Option<Placement> {
    match geometry {
        ElementGeometry::Frame(frame) => Some(*frame),
        ElementGeometry::Plane {
            origin,
            normal,
            x_axis,
        } => Placement::from_axes(*origin, *x_axis, *normal),
        ElementGeometry::Line { origin, direction } => Placement::from_normal(*origin, *direction),
        ElementGeometry::Point(point) => Some(Placement::from_translation(*point)),
        ElementGeometry::Curve(points) => match points.as_slice() {
            [first, second, ..] => Placement::from_normal(*first, *second - *first),
            _ => None,
        },
    }
}

/// Point and tangent at parameter `t` in `[0, 1]` along an edge.
fn point_on_path(geometry: &ElementGeometry, t: f64) -> Option<(DVec3, DVec3)> {
    let t = t.clamp(0.0, 1.0);
    match geometry {
        ElementGeometry::Line { origin, direction } => Some((*origin + *direction * t, *direction)),
        ElementGeometry::Curve(points) if points.len() >= 2 => {
            let total: f64 = points.windows(2).map(|w| w[0].distance(w[1])).sum();
            if total <= 0.0 {
                return None;
            }
            let last = points.len() - 2;
            let mut remaining = total * t;
            for (i, segment) in points.windows(2).enumerate() {
                let length = segment[0].distance(segment[1]);
                if remaining <= length || i == last {
                    let ratio = if length > 0.0 { (remaining / length).min(1.0) } else { 0.0 };
                    return Some((segment[0].lerp(segment[1], ratio), segment[1] - segment[0]));
                }
                remaining -= length;
            }
            None
        }
        _ => None,
    }
}
