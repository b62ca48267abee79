//! Rigid placements (position + orientation) and transform matrices.
//!
//! All document geometry is expressed in `f64` using `glam`'s double
//! precision types. A [`Placement`] is a rigid transform; non-uniform scale
//! and shear live in a [`Matrix`] instead.
//!
//! Composition follows the usual convention: `a * b` applies `b` first and
//! then `a`, so `parent * local` maps local coordinates into the parent frame.

use std::ops::Mul;

use glam::{DMat3, DMat4, DQuat, DVec3};
use serde::{Deserialize, Serialize};

/// A general 4x4 transform matrix.
pub type Matrix = DMat4;

/// Default tolerance used when comparing placements and directions.
pub const PRECISION: f64 = 1e-9;

/// A rigid transform: rotation followed by translation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    /// Translation component.
    pub position: DVec3,
    /// Orientation component (unit quaternion).
    pub rotation: DQuat,
}

impl Placement {
    /// The identity placement.
    pub const IDENTITY: Self = Self {
        position: DVec3::ZERO,
        rotation: DQuat::IDENTITY,
    };

    /// Create a placement from a position and a rotation.
    pub fn new(position: DVec3, rotation: DQuat) -> Self {
        Self {
            position,
            rotation: rotation.normalize(),
        }
    }

    /// A pure translation.
    pub fn from_translation(position: DVec3) -> Self {
        Self {
            position,
            rotation: DQuat::IDENTITY,
        }
    }

    /// A pure rotation about the origin.
    pub fn from_rotation(rotation: DQuat) -> Self {
        Self::new(DVec3::ZERO, rotation)
    }

    /// Build a frame from an origin, a direction for the local X axis and a
    /// direction for the local Z axis.
    ///
    /// The X direction is projected onto the plane normal to Z. Returns `None`
    /// when either direction is zero or when X is parallel to Z.
    pub fn from_axes(origin: DVec3, x_dir: DVec3, z_dir: DVec3) -> Option<Self> {
        let z = z_dir.try_normalize()?;
        let x = (x_dir - z * x_dir.dot(z)).try_normalize()?;
        let y = z.cross(x);
        let basis = DMat3::from_cols(x, y, z);
        Some(Self::new(origin, DQuat::from_mat3(&basis)))
    }

    /// Build a frame whose Z axis points along `z_dir`, choosing an arbitrary
    /// but deterministic X axis.
    pub fn from_normal(origin: DVec3, z_dir: DVec3) -> Option<Self> {
        let z = z_dir.try_normalize()?;
        let helper = if z.x.abs() < 0.9 { DVec3::X } else { DVec3::Y };
        Self::from_axes(origin, helper, z)
    }

    /// Convert a matrix into a placement, discarding scale.
    pub fn from_matrix(matrix: &Matrix) -> Self {
        let (_, rotation, translation) = matrix.to_scale_rotation_translation();
        Self::new(translation, rotation)
    }

    /// Convert into a 4x4 matrix.
    pub fn to_matrix(&self) -> Matrix {
        DMat4::from_rotation_translation(self.rotation, self.position)
    }

    /// The inverse transform.
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            position: -(rotation * self.position),
            rotation,
        }
    }

    /// Transform a point from local to parent coordinates.
    pub fn transform_point(&self, point: DVec3) -> DVec3 {
        self.rotation * point + self.position
    }

    /// Rotate a direction vector from local to parent coordinates.
    pub fn transform_vector(&self, vector: DVec3) -> DVec3 {
        self.rotation * vector
    }

    /// Local X axis expressed in parent coordinates.
    pub fn x_axis(&self) -> DVec3 {
        self.rotation * DVec3::X
    }

    /// Local Z axis expressed in parent coordinates.
    pub fn z_axis(&self) -> DVec3 {
        self.rotation * DVec3::Z
    }

    /// Whether this is the identity transform within [`PRECISION`].
    pub fn is_identity(&self) -> bool {
        self.is_same(&Self::IDENTITY, PRECISION)
    }

    /// Compare two placements with a tolerance.
    ///
    /// Quaternions `q` and `-q` describe the same rotation and compare equal.
    pub fn is_same(&self, other: &Self, tolerance: f64) -> bool {
        self.position.abs_diff_eq(other.position, tolerance)
            && (self.rotation.abs_diff_eq(other.rotation, tolerance)
                || self.rotation.abs_diff_eq(-other.rotation, tolerance))
    }

    /// Flip the local Z axis by rotating half a turn about the local X axis.
    pub fn reversed(&self) -> Self {
        *self * Self::from_rotation(DQuat::from_rotation_x(std::f64::consts::PI))
    }
}

impl Default for Placement {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul for Placement {
    type Output = Placement;

    fn mul(self, rhs: Placement) -> Placement {
        Placement {
            position: self.rotation * rhs.position + self.position,
            rotation: (self.rotation * rhs.rotation).normalize(),
        }
    }
}

/// Whether a matrix is the identity within [`PRECISION`].
pub fn is_identity_matrix(matrix: &Matrix) -> bool {
    matrix.abs_diff_eq(DMat4::IDENTITY, PRECISION)
}

/// A scale matrix built from a scale vector.
pub fn scale_matrix(scale: DVec3) -> Matrix {
    DMat4::from_scale(scale)
}
