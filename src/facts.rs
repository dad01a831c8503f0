//! Spatial and multimodal fact primitives.
//!
//! These are the typed values exchanged between perception, calibration, planning and
//! dispatch. Image payloads stay opaque: nothing in the core looks inside them.

use std::fmt;

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// A 2D image coordinate `(u, v)`.
///
/// Internally uses [`nalgebra::Vector2<f32>`] for downstream math convenience.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pixel(pub Vector2<f32>);

impl Pixel {
    pub fn new(u: f32, v: f32) -> Self {
        Self(Vector2::new(u, v))
    }

    pub fn u(&self) -> f32 {
        self.0.x
    }

    pub fn v(&self) -> f32 {
        self.0.y
    }

    /// Squared Euclidean distance in pixel space.
    pub fn distance_squared(&self, other: &Pixel) -> f32 {
        (self.0 - other.0).norm_squared()
    }
}

impl fmt::Display for Pixel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.u(), self.v())
    }
}

/// A 6-DoF robot pose: position `(x, y, z)` plus orientation `(roll, pitch, yaw)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose6D {
    pub position: Vector3<f32>,
    pub orientation: Vector3<f32>,
}

impl Pose6D {
    pub fn new(x: f32, y: f32, z: f32, roll: f32, pitch: f32, yaw: f32) -> Self {
        Self {
            position: Vector3::new(x, y, z),
            orientation: Vector3::new(roll, pitch, yaw),
        }
    }

    /// Builds a pose from the persisted `[x, y, z, roll, pitch, yaw]` layout.
    pub fn from_array(values: [f32; 6]) -> Self {
        let [x, y, z, roll, pitch, yaw] = values;
        Self::new(x, y, z, roll, pitch, yaw)
    }

    pub fn to_array(&self) -> [f32; 6] {
        [
            self.position.x,
            self.position.y,
            self.position.z,
            self.orientation.x,
            self.orientation.y,
            self.orientation.z,
        ]
    }

    pub fn roll(&self) -> f32 {
        self.orientation.x
    }

    pub fn pitch(&self) -> f32 {
        self.orientation.y
    }

    pub fn yaw(&self) -> f32 {
        self.orientation.z
    }
}

impl fmt::Display for Pose6D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(X={:.2}, Y={:.2}, Z={:.2}; roll={:.2}, pitch={:.2}, yaw={:.2})",
            self.position.x,
            self.position.y,
            self.position.z,
            self.roll(),
            self.pitch(),
            self.yaw()
        )
    }
}

/// Raw image bytes handed between collaborators. Used both for full camera frames and
/// for per-region crops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

/// One segmented region of a captured frame.
///
/// `id` is the region's index within its capture; regions only live for one capture cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedRegion {
    pub id: usize,
    pub center: Pixel,
    pub crop: ImageData,
}

/// A physical object named by the task description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskObject {
    pub name: String,
}

impl TaskObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for TaskObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
