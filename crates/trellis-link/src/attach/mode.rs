//! Attachment modes and engine types.

use std::fmt;

use serde::{Deserialize, Serialize};
/// How the references determine a placement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapMode {
    /// No computation; the placement is edited freely.
    #[default]
    Deactivated,
    /// Move the origin onto a point, keep the orientation.
    Translate,
    /// Align with the XY plane of the referenced frame.
    ObjectXY,
    /// Align with the XZ plane of the referenced frame.
    ObjectXZ,
    /// Align with the YZ plane of the referenced frame.
    ObjectYZ,
    /// Lie on a planar face, Z along its normal.
    FlatFace,
    /// Sit on a path, Z along its tangent at `MapPathParameter`.
    NormalToPath,
    /// Plane through three points.
    ThreePointsPlane,
    /// Z from the first to the second point, X towards the third.
    ThreePointsNormal,
}

impl MapMode {
    pub const ALL: [MapMode; 9] = [
        Self::Deactivated,
        Self::Translate,
        Self::ObjectXY,
        Self::ObjectXZ,
        Self::ObjectYZ,
        Self::FlatFace,
        Self::NormalToPath,
        Self::ThreePointsPlane,
        Self::ThreePointsNormal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deactivated => "Deactivated",
            Self::Translate => "Translate",
            Self::ObjectXY => "ObjectXY",
            Self::ObjectXZ => "ObjectXZ",
            Self::ObjectYZ => "ObjectYZ",
            Self::FlatFace => "FlatFace",
            Self::NormalToPath => "NormalToPath",
            Self::ThreePointsPlane => "ThreePointsPlane",
            Self::ThreePointsNormal => "ThreePointsNormal",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.as_str() == name)
    }

    /// Number of references the mode consumes.
    pub fn reference_count(self) -> usize {
        match self {
            Self::Deactivated => 0,
            Self::ThreePointsPlane | Self::ThreePointsNormal => 3,
            _ => 1,
        }
    }

    /// Whether `MapPathParameter` affects the result.
    pub fn uses_path_parameter(self) -> bool {
        self == Self::NormalToPath
    }

    /// Whether the orientation stays under user control while attached.
    pub fn keeps_rotation(self) -> bool {
        self == Self::Translate
    }
}

impl fmt::Display for MapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placement computation strategy, selected by the `AttacherType` string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    /// Attaches full coordinate systems.
    Engine3D,
    /// Attaches planes; the path mode is not available.
    Plane,
    /// Attaches points; only positional modes are available.
    Point,
}

impl EngineKind {
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Engine3D => "Attacher::AttachEngine3D",
            Self::Plane => "Attacher::AttachEnginePlane",
            Self::Point => "Attacher::AttachEnginePoint",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        [Self::Engine3D, Self::Plane, Self::Point]
            .into_iter()
            .find(|kind| kind.type_name() == name)
    }

    pub fn supports(self, mode: MapMode) -> bool {
        match self {
            Self::Engine3D => true,
            Self::Plane => mode != MapMode::NormalToPath,
            Self::Point => matches!(
                mode,
                MapMode::Deactivated | MapMode::Translate | MapMode::ObjectXY
            ),
        }
    }

    /// Modes offered by this engine, in display order.
    pub fn modes(self) -> impl Iterator<Item = MapMode> {
        MapMode::ALL.into_iter().filter(move |&mode| self.supports(mode))
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_names() {
        for mode in MapMode::ALL {
            assert_eq!(MapMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(MapMode::parse("Sideways"), None);
        assert_eq!(MapMode::default(), MapMode::Deactivated);
    }

    #[test]
    fn test_engine_mode_support() {
        assert_eq!(EngineKind::Engine3D.modes().count(), MapMode::ALL.len());
        assert!(!EngineKind::Plane.supports(MapMode::NormalToPath));
        assert!(EngineKind::Plane.supports(MapMode::FlatFace));
        let point: Vec<_> = EngineKind::Point.modes().collect();
        assert_eq!(
            point,
            [MapMode::Deactivated, MapMode::Translate, MapMode::ObjectXY]
        );
    }

    #[test]
    fn test_engine_type_names() {
        assert_eq!(
            EngineKind::from_type_name("Attacher::AttachEnginePlane"),
            Some(EngineKind::Plane)
        );
        assert_eq!(EngineKind::from_type_name("Attacher::Nope"), None);
    }

    #[test]
    fn test_reference_counts() {
        assert_eq!(MapMode::FlatFace.reference_count(), 1);
        assert_eq!(MapMode::ThreePointsPlane.reference_count(), 3);
        assert!(MapMode::NormalToPath.uses_path_parameter());
        assert!(MapMode::Translate.keeps_rotation());
    }
}
