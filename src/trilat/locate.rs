use super::{
    sphere::{gdop_rate, trilaterate4, Intersection},
    with_inflation, Sphere, TrilatError, MAX_ZERO,
};
use crate::geometry::Vec3;

#[allow(unused_imports)]
use num_traits::Float;

/// Position found from four anchors
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Location {
    /// Number of spheres that decided the position, 3 or 4
    pub spheres_used: u8,
    /// The two three sphere candidates that `best` was picked from
    pub candidates: (Vec3, Vec3),
    /// The four sphere position with the lowest GDOP, the first candidate if
    /// no four sphere intersection succeeded
    pub best: Vec3,
    /// Number of range inflations needed for `best`
    pub inflations: usize,
    /// Root of the squared range errors of `best` against all four spheres
    pub error_3d: f64,
    /// GDOP of `best`, 1 if unknown
    pub gdop: f64,
    /// Which rotation of the anchors produced `best`, 1 to 4, 0 if none
    pub combination: u8,
}

/// Finds a position from four spheres
///
/// The intersection is tried with every anchor as the fourth one. The result
/// with the lowest GDOP wins. If the first three spheres only touch in a
/// single point, that point is returned right away. Spheres that don't
/// intersect are inflated, see [`MAX_INFLATIONS`].
///
/// If a later rotation fails after an earlier one succeeded, the best result
/// so far is returned.
///
/// [`MAX_INFLATIONS`]: super::MAX_INFLATIONS
pub fn locate(spheres: [Sphere; 4]) -> Result<Location, TrilatError> {
    let mut spheres = spheres;
    let mut found: Option<Location> = None;

    for rotation in 1..=4u8 {
        let (intersection, inflations) =
            match with_inflation(spheres, |s| trilaterate4(s, MAX_ZERO)) {
                Ok(result) => result,
                Err(e) => return found.ok_or(e),
            };

        match intersection {
            Intersection::Three(first, second) => {
                let mut location = found.unwrap_or(Location {
                    spheres_used: 3,
                    candidates: (first, second),
                    best: first,
                    inflations,
                    error_3d: 0.0,
                    gdop: 1.0,
                    combination: 0,
                });
                location.spheres_used = 3;
                location.candidates = (first, second);

                return Ok(location);
            }
            Intersection::Four { candidates, best } => {
                let gdop = gdop_rate(
                    best,
                    spheres[0].center,
                    spheres[1].center,
                    spheres[2].center,
                );

                if gdop <= found.map_or(1.0, |l| l.gdop) {
                    let error_3d = spheres
                        .iter()
                        .map(|s| {
                            let e = (best - s.center).norm() - s.radius;
                            e * e
                        })
                        .sum::<f64>()
                        .sqrt();

                    found = Some(Location {
                        spheres_used: 4,
                        candidates,
                        best,
                        inflations,
                        error_3d,
                        gdop,
                        combination: rotation,
                    });
                }

                spheres.rotate_left(1);
            }
        }
    }

    found.ok_or(TrilatError::NoSolution)
}

/// Finds a position from four anchors and ranges in millimeters
///
/// Anchor positions are in meters. Out of the two candidates, the one below
/// the first anchor is picked, assuming the anchors are mounted above the
/// tags. With `use_fourth_anchor`, the candidate that matches all four ranges
/// best is picked instead.
pub fn get_location(
    anchors: &[Vec3; 4],
    distances_mm: &[i32; 4],
    use_fourth_anchor: bool,
) -> Result<Vec3, TrilatError> {
    let mut spheres = [Sphere::default(); 4];
    for (sphere, (anchor, distance)) in spheres
        .iter_mut()
        .zip(anchors.iter().zip(distances_mm.iter()))
    {
        *sphere = Sphere::new(*anchor, *distance as f64 / 1000.0);
    }

    let location = locate(spheres)?;
    let (o1, o2) = location.candidates;

    let position = if use_fourth_anchor {
        let misfit = |o: Vec3| {
            spheres
                .iter()
                .map(|s| (s.radius - (o - s.center).norm()).abs())
                .sum::<f64>()
        };

        if misfit(o1) < misfit(o2) {
            o1
        } else {
            o2
        }
    } else if o1.z < anchors[0].z {
        o1
    } else {
        o2
    };

    Ok(position)
}
