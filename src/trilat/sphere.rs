use super::{Sphere, TrilatError};
use crate::geometry::Vec3;

#[allow(unused_imports)]
use num_traits::Float;

/// Result of a successful sphere intersection
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Intersection {
    /// Only the first three spheres were used, the position is one of the two
    /// candidates
    Three(Vec3, Vec3),
    /// The fourth sphere picked a single position out of the two candidates
    Four {
        /// The candidates of the first three spheres, the one nearer to the
        /// fourth anchor first
        candidates: (Vec3, Vec3),
        /// The chosen position
        best: Vec3,
    },
}

/// Outcome of the three sphere step, `unique` if the colinear case produced
/// exactly one point
struct Candidates {
    first: Vec3,
    second: Vec3,
    unique: bool,
}

/// Intersects three spheres
///
/// Returns the two intersection points, mirrored at the plane of the three
/// centers. Both are the same point if the spheres touch in one point only.
/// Distances up to `max_zero` count as zero.
///
/// # Errors
///
/// - [`TrilatError::Concentric`] if two centers are at the same position
/// - [`TrilatError::Colinear2Solutions`] if the centers are on one line and
///   the spheres don't meet in a single point on it
/// - [`TrilatError::SqrtNegative`] if the spheres don't intersect at all
pub fn trilaterate(spheres: &[Sphere; 3], max_zero: f64) -> Result<(Vec3, Vec3), TrilatError> {
    three_spheres(spheres, max_zero).map(|c| (c.first, c.second))
}

fn three_spheres(spheres: &[Sphere; 3], max_zero: f64) -> Result<Candidates, TrilatError> {
    let [s1, s2, s3] = spheres;
    let (p1, p2, p3) = (s1.center, s2.center, s3.center);
    let (r1, r2, r3) = (s1.radius, s2.radius, s3.radius);

    if (p3 - p1).norm() <= max_zero || (p3 - p2).norm() <= max_zero {
        return Err(TrilatError::Concentric);
    }
    let h = (p2 - p1).norm();
    if h <= max_zero {
        return Err(TrilatError::Concentric);
    }

    // Basis with p1 as origin and ex pointing to p2
    let ex = (p2 - p1) / h;
    let p13 = p3 - p1;
    let i = ex.dot(p13);
    let mut ey = p13 - ex * i;
    let t = ey.norm();
    let j = if t > max_zero {
        ey = ey / t;
        ey.dot(p13)
    } else {
        0.0
    };

    if j.abs() <= max_zero {
        // All centers on one line, the spheres can only meet on it
        for candidate in [p1 + ex * r1, p1 - ex * r1] {
            if ((p2 - candidate).norm() - r2).abs() <= max_zero
                && ((p3 - candidate).norm() - r3).abs() <= max_zero
            {
                return Ok(Candidates {
                    first: candidate,
                    second: candidate,
                    unique: true,
                });
            }
        }

        return Err(TrilatError::Colinear2Solutions);
    }

    let ez = ex.cross(ey);

    let x = (r1 * r1 - r2 * r2) / (2.0 * h) + h / 2.0;
    let y = (r1 * r1 - r3 * r3 + i * i) / (2.0 * j) + j / 2.0 - x * i / j;
    let zz = r1 * r1 - x * x - y * y;
    let z = if zz < -max_zero {
        return Err(TrilatError::SqrtNegative);
    } else if zz > 0.0 {
        zz.sqrt()
    } else {
        0.0
    };

    let base = p1 + ex * x + ey * y;

    Ok(Candidates {
        first: base + ez * z,
        second: base - ez * z,
        unique: false,
    })
}

/// Intersects the line through `p1` and `p2` with a sphere
///
/// Returns the line parameters `mu` of both intersections, where `p1` is at 0
/// and `p2` at 1.
fn sphere_line(p1: Vec3, p2: Vec3, sphere: Sphere) -> Option<(f64, f64)> {
    let dp = p2 - p1;
    let sc = sphere.center;

    let a = dp.dot(dp);
    let b = 2.0 * dp.dot(p1 - sc);
    let c = sc.dot(sc) + p1.dot(p1) - 2.0 * sc.dot(p1) - sphere.radius * sphere.radius;

    let discriminant = b * b - 4.0 * a * c;
    if a == 0.0 || discriminant < 0.0 {
        return None;
    }

    let root = discriminant.sqrt();
    Some(((-b + root) / (2.0 * a), (-b - root) / (2.0 * a)))
}

/// Intersects three spheres and uses a fourth one to pick a single position
///
/// The candidate nearer to the fourth anchor is the starting point. The line
/// between the candidates is intersected with the fourth sphere and the
/// position is moved along the line so that the remaining error is spread over
/// all four spheres.
///
/// Falls back to [`Intersection::Three`] if the fourth center coincides with
/// one of the others, or if the first three only meet in a single point on
/// their common axis. Fails like [`trilaterate`].
pub fn trilaterate4(spheres: &[Sphere; 4], max_zero: f64) -> Result<Intersection, TrilatError> {
    let [s1, s2, s3, s4] = spheres;
    let found = three_spheres(&[*s1, *s2, *s3], max_zero)?;

    if found.unique {
        return Ok(Intersection::Three(found.first, found.second));
    }

    let p4 = s4.center;
    if [s1, s2, s3]
        .iter()
        .any(|s| (p4 - s.center).norm() <= max_zero)
    {
        return Ok(Intersection::Three(found.first, found.second));
    }

    let (near, far) = if (found.first - p4).norm() > (found.second - p4).norm() {
        (found.second, found.first)
    } else {
        (found.first, found.second)
    };

    let mut sphere4 = *s4;
    let mut mus = None;
    for _ in 0..super::MAX_INFLATIONS {
        mus = sphere_line(near, far, sphere4);
        if mus.is_some() {
            break;
        }
        sphere4.radius += super::RADIUS_INFLATION_M;
    }

    let best = match mus {
        None => near,
        Some(mus) => move_along(near, far, mus),
    };

    Ok(Intersection::Four {
        candidates: (near, far),
        best,
    })
}

/// Moves from `near` towards `far` depending on where the line between them
/// meets the fourth sphere
///
/// `mu1` and `mu2` are the line parameters of the two intersections, see
/// [`sphere_line`].
fn move_along(near: Vec3, far: Vec3, (mu1, mu2): (f64, f64)) -> Vec3 {
    let span = far - near;
    let h = span.norm();
    let ex = span / h;
    let along = |mu: f64| near + ex * (mu * h);

    let inside = |mu: f64| mu > 0.0 && mu < 1.0;
    let outside = |mu: f64| mu < 0.0 || mu > 1.0;

    if mu1 < 0.0 && mu2 < 0.0 {
        // The segment misses the sphere, move halfway towards it
        let mu = if mu1.abs() <= mu2.abs() { mu1 } else { mu2 };
        along(0.5 * mu)
    } else if (mu1 < 0.0 && mu2 > 1.0) || (mu2 < 0.0 && mu1 > 1.0) {
        // The segment is inside the sphere
        let mu = mu1.max(mu2);
        let t = along(mu);
        t + (far - t) * 0.5
    } else if (inside(mu1) && outside(mu2)) || (inside(mu2) && outside(mu1)) {
        let mut mu = if (0.0..=1.0).contains(&mu1) { mu1 } else { mu2 };
        if mu <= 0.5 {
            mu -= 0.5 * mu;
        } else {
            mu -= 0.5 * (1.0 - mu);
        }
        along(mu)
    } else if mu1 == mu2 {
        // Tangent
        let mut mu = mu1;
        if mu <= 0.25 {
            mu -= 0.5 * mu;
        } else if mu <= 0.5 {
            mu -= 0.5 * (0.5 - mu);
        } else if mu <= 0.75 {
            mu -= 0.5 * (mu - 0.5);
        } else {
            mu -= 0.5 * (1.0 - mu);
        }
        along(mu)
    } else {
        // Two intersections on the segment
        along(0.5 * (mu1 + mu2))
    }
}

/// Geometric dilution of precision seen from `tag`, between 0 and 1
///
/// The largest absolute cosine between the directions from `tag` to the
/// anchors. 0 means the directions are orthogonal, 1 that the anchors are on
/// one line as seen from `tag`.
pub fn gdop_rate(tag: Vec3, p1: Vec3, p2: Vec3, p3: Vec3) -> f64 {
    let unit = |p: Vec3| {
        let d = p - tag;
        d / d.norm()
    };
    let (t1, t2, t3) = (unit(p1), unit(p2), unit(p3));

    t1.dot(t2).abs().max(t2.dot(t3).abs()).max(t3.dot(t1).abs())
}
