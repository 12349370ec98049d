//! Vector algebra and small numeric helpers used by the position solver
//!
//! Everything in here is a pure function over `f64` coordinates. No
//! trigonometry is used anywhere in the solver, only products, sums and square
//! roots.

use core::ops::{Add, Div, Mul, Neg, Sub};

#[cfg(feature = "defmt")]
use defmt::Format;
#[allow(unused_imports)]
use num_traits::Float;

/// A point or direction in 3D space
///
/// The unit depends on the context: the position solver works in meters, the
/// ranging messages carry millimeters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Vec3 {
    /// X coordinate
    pub x: f64,
    /// Y coordinate
    pub y: f64,
    /// Z coordinate
    pub z: f64,
}

impl Vec3 {
    /// The origin
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);

    /// Creates a new vector from its coordinates
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Vec3 { x, y, z }
    }

    /// Scalar product
    pub fn dot(self, other: Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Vector product
    pub fn cross(self, other: Vec3) -> Vec3 {
        Vec3 {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    /// Euclidean length
    pub fn norm(self) -> f64 {
        self.dot(self).sqrt()
    }

    /// Euclidean distance between two points
    pub fn distance(self, other: Vec3) -> f64 {
        (self - other).norm()
    }

    /// Scales every coordinate by `factor`
    ///
    /// Used to go from the millimeters of the wire format to the meters of the
    /// solver and back.
    pub fn scale(self, factor: f64) -> Vec3 {
        self * factor
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Self::Output {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Self::Output {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f64) -> Self::Output {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Div<f64> for Vec3 {
    type Output = Vec3;

    fn div(self, rhs: f64) -> Self::Output {
        Vec3::new(self.x / rhs, self.y / rhs, self.z / rhs)
    }
}

impl Neg for Vec3 {
    type Output = Vec3;

    fn neg(self) -> Self::Output {
        Vec3::new(-self.x, -self.y, -self.z)
    }
}

/// A point in the horizontal plane, used by [`polygon_contains`]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Vec2 {
    /// X coordinate
    pub x: f32,
    /// Y coordinate
    pub y: f32,
}

/// Fast approximation of `1 / sqrt(x)`
///
/// One Newton-Raphson step on top of the well known bit-level initial guess.
/// The relative error stays below 0.2 %.
pub fn fast_inv_sqrt(x: f32) -> f32 {
    let half = 0.5 * x;
    let guess = f32::from_bits(0x5f37_59df - (x.to_bits() >> 1));

    guess * (1.5 - half * guess * guess)
}

/// Returns `true` if `point` lies inside the polygon given by its vertices
///
/// Even-odd rule: a horizontal ray is cast from the point and the crossed
/// edges are counted. Points exactly on an edge may go either way.
pub fn polygon_contains(polygon: &[Vec2], point: Vec2) -> bool {
    let mut inside = false;
    let mut j = match polygon.len() {
        0 => return false,
        n => n - 1,
    };

    for (i, vi) in polygon.iter().enumerate() {
        let vj = polygon[j];

        if (vi.y > point.y) != (vj.y > point.y)
            && point.x < (vj.x - vi.x) * (point.y - vi.y) / (vj.y - vi.y) + vi.x
        {
            inside = !inside;
        }

        j = i;
    }

    inside
}

/// `n!`, saturating at `u64::MAX`
pub fn factorial(n: u32) -> u64 {
    (2..=n as u64).fold(1u64, |acc, k| acc.saturating_mul(k))
}

/// Number of ways to choose `k` elements out of `n`
pub fn combinations(n: u32, k: u32) -> u64 {
    if k > n {
        return 0;
    }

    // Multiplicative form, stays exact for every anchor count we care about
    // where the factorial form would already overflow.
    let k = k.min(n - k) as u64;
    let n = n as u64;

    (0..k).fold(1u64, |acc, i| acc * (n - i) / (i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    #[test]
    fn vector_algebra() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(-2.0, 0.5, 4.0);

        assert_eq!(a + b, Vec3::new(-1.0, 2.5, 7.0));
        assert_eq!(a - b, Vec3::new(3.0, 1.5, -1.0));
        assert_eq!(a * 2.0, Vec3::new(2.0, 4.0, 6.0));
        assert_eq!(a / 2.0, Vec3::new(0.5, 1.0, 1.5));
        assert_eq!(-a, Vec3::new(-1.0, -2.0, -3.0));
        assert!((a.dot(b) - 11.0).abs() < EPS);
    }

    #[test]
    fn cross_product_is_right_handed() {
        let x = Vec3::new(1.0, 0.0, 0.0);
        let y = Vec3::new(0.0, 1.0, 0.0);

        assert_eq!(x.cross(y), Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(y.cross(x), Vec3::new(0.0, 0.0, -1.0));
    }

    #[test]
    fn norm_and_distance() {
        let a = Vec3::new(3.0, 4.0, 12.0);

        assert!((a.norm() - 13.0).abs() < EPS);
        assert!((a.distance(Vec3::ZERO) - 13.0).abs() < EPS);
        assert!((Vec3::new(1.0, 1.0, 1.0).distance(Vec3::new(1.0, 1.0, 3.0)) - 2.0).abs() < EPS);
    }

    #[test]
    fn fast_inv_sqrt_is_close() {
        for x in [0.25f32, 1.0, 2.0, 10.0, 1234.5] {
            let exact = 1.0 / x.sqrt();
            let fast = fast_inv_sqrt(x);

            assert!((fast - exact).abs() / exact < 2e-3, "x = {}", x);
        }
    }

    #[test]
    fn polygon_contains_points() {
        let square = [
            Vec2 { x: 0.0, y: 0.0 },
            Vec2 { x: 4.0, y: 0.0 },
            Vec2 { x: 4.0, y: 4.0 },
            Vec2 { x: 0.0, y: 4.0 },
        ];

        assert!(polygon_contains(&square, Vec2 { x: 2.0, y: 2.0 }));
        assert!(polygon_contains(&square, Vec2 { x: 0.5, y: 3.5 }));
        assert!(!polygon_contains(&square, Vec2 { x: 5.0, y: 2.0 }));
        assert!(!polygon_contains(&square, Vec2 { x: 2.0, y: -1.0 }));
        assert!(!polygon_contains(&[], Vec2 { x: 0.0, y: 0.0 }));
    }

    #[test]
    fn polygon_contains_concave() {
        // "L" shape, the notch at the top right is outside
        let l_shape = [
            Vec2 { x: 0.0, y: 0.0 },
            Vec2 { x: 4.0, y: 0.0 },
            Vec2 { x: 4.0, y: 2.0 },
            Vec2 { x: 2.0, y: 2.0 },
            Vec2 { x: 2.0, y: 4.0 },
            Vec2 { x: 0.0, y: 4.0 },
        ];

        assert!(polygon_contains(&l_shape, Vec2 { x: 1.0, y: 3.0 }));
        assert!(polygon_contains(&l_shape, Vec2 { x: 3.0, y: 1.0 }));
        assert!(!polygon_contains(&l_shape, Vec2 { x: 3.0, y: 3.0 }));
    }

    #[test]
    fn factorial_values() {
        assert_eq!(factorial(0), 1);
        assert_eq!(factorial(1), 1);
        assert_eq!(factorial(5), 120);
        assert_eq!(factorial(20), 2_432_902_008_176_640_000);
        assert_eq!(factorial(25), u64::MAX);
    }

    #[test]
    fn combinations_values() {
        assert_eq!(combinations(3, 3), 1);
        assert_eq!(combinations(4, 3), 4);
        assert_eq!(combinations(8, 3), 56);
        assert_eq!(combinations(20, 3), 1140);
        assert_eq!(combinations(2, 3), 0);
    }
}
