//! Position estimation from ranges to fixed anchors
//!
//! The building block is the intersection of three spheres centered at the
//! anchors with the measured ranges as radii, see [`trilaterate`]. It yields
//! two candidate positions mirrored at the plane of the anchors. Which one is
//! right is decided by a fourth sphere ([`trilaterate4`], [`locate`]) or, in
//! [`TrilatSolver`], by checking every candidate against all other anchors
//! and clustering the agreeing ones.
//!
//! All coordinates and ranges are in meters. The algebra uses no
//! trigonometric functions.

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::geometry::Vec3;

mod locate;
mod solver;
mod sphere;

pub use locate::{get_location, locate, Location};
pub use solver::{solve, Estimate, TrilatSolver, MAX_ANCHORS, MAX_CACHE, MAX_RESULTS};
pub use sphere::{gdop_rate, trilaterate, trilaterate4, Intersection};

/// Largest non-negative number still considered zero
pub const MAX_ZERO: f64 = 0.001;

/// Number of times the ranges are inflated when the spheres don't intersect
pub const MAX_INFLATIONS: usize = 10;

/// Range added to every sphere per inflation, m
pub const RADIUS_INFLATION_M: f64 = 0.10;

/// A sphere around an anchor, radius is the range measured to it
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Sphere {
    /// Position of the anchor
    pub center: Vec3,
    /// Measured range
    pub radius: f64,
}

impl Sphere {
    pub fn new(center: Vec3, radius: f64) -> Self {
        Sphere { center, radius }
    }
}

/// Reasons why no position could be found
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum TrilatError {
    /// Two of the anchors are at the same position
    Concentric,
    /// The anchors are on one line and the spheres meet in a circle
    Colinear2Solutions,
    /// The spheres don't intersect
    SqrtNegative,
    /// The fourth sphere doesn't intersect the line between the candidates
    NoIntersectionSphere4,
    /// The candidates can't be told apart without another sphere
    NeedMoreSpheres,
    /// No combination of anchors produced a plausible position
    NoSolution,
}

impl TrilatError {
    /// Numeric code of the error, as printed in the report line
    pub fn code(&self) -> i32 {
        match self {
            TrilatError::Concentric => -1,
            TrilatError::Colinear2Solutions => -2,
            TrilatError::SqrtNegative => -3,
            TrilatError::NoIntersectionSphere4 => -4,
            TrilatError::NeedMoreSpheres => -5,
            TrilatError::NoSolution => -21,
        }
    }
}

/// Calls `attempt` with growing spheres until it succeeds
///
/// After each failure other than [`TrilatError::Concentric`] every radius is
/// increased by [`RADIUS_INFLATION_M`], at most [`MAX_INFLATIONS`] times.
/// Returns the result and the number of inflations it took.
pub(crate) fn with_inflation<const N: usize, T>(
    mut spheres: [Sphere; N],
    mut attempt: impl FnMut(&[Sphere; N]) -> Result<T, TrilatError>,
) -> Result<(T, usize), TrilatError> {
    let mut inflations = 0;

    loop {
        match attempt(&spheres) {
            Ok(result) => return Ok((result, inflations)),
            Err(TrilatError::Concentric) => return Err(TrilatError::Concentric),
            Err(e) => {
                inflations += 1;
                if inflations > MAX_INFLATIONS {
                    return Err(e);
                }
                for sphere in spheres.iter_mut() {
                    sphere.radius += RADIUS_INFLATION_M;
                }
            }
        }
    }
}
