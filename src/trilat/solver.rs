use heapless::Vec;

#[cfg(feature = "defmt")]
#[allow(unused_imports)]
use defmt::{debug, error, info, warn};
#[cfg(not(feature = "defmt"))]
#[allow(unused_imports)]
use log::{debug, error, info, warn};
#[allow(unused_imports)]
use num_traits::Float;

use super::{sphere::trilaterate, with_inflation, Sphere, TrilatError, MAX_ZERO};
use crate::{
    geometry::{combinations, Vec3},
    tag_list::KNOWN_TAG_LIST_SIZE,
    trilat::gdop_rate,
};

/// Maximum number of anchor triples the solver evaluates
pub const MAX_CACHE: usize = 56;
/// Maximum number of candidate positions
pub const MAX_RESULTS: usize = 2 * MAX_CACHE;
/// Maximum number of anchors, further anchors are ignored
pub const MAX_ANCHORS: usize = KNOWN_TAG_LIST_SIZE;

/// Candidates whose range error to every unused anchor is larger are dropped, m
const MAX_DIFF_M: f64 = 5.0;
/// Positions closer than this are clustered, m
const MIN_DIFF_M: f64 = 0.15;
/// A measured range this much shorter than the geometry allows rules a
/// candidate out, m
const MIN_NEG_DIFF_M: f64 = -0.5;
/// Range errors closer than this count as a tie, m
const MIN_ERR_M: f64 = 0.05;

/// Position estimate of the solver
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Estimate {
    /// Position, m
    pub position: Vec3,
    /// Quality factor, 0 to 100, higher is better
    pub quality: u8,
    /// Smallest range error against the anchors not used for the position, m
    pub error: f64,
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    position: Vec3,
    error: f64,
}

#[derive(Clone, Copy, Debug)]
struct Score {
    rejected: bool,
    min_error: f64,
}

/// Multi-anchor position solver
///
/// Caches every combination of three anchors on creation. Solving runs the
/// three sphere intersection for each of them, keeps the candidate that agrees
/// best with the remaining anchors and averages the largest cluster of
/// agreeing positions.
#[derive(Clone, Debug)]
pub struct TrilatSolver {
    anchors: Vec<Vec3, MAX_ANCHORS>,
    triples: Vec<[usize; 3], MAX_CACHE>,
    min: Vec3,
    max: Vec3,
    center: Vec3,
}

impl TrilatSolver {
    /// Creates a solver for the given anchor positions, in meters
    pub fn new(anchors: &[Vec3]) -> Result<Self, TrilatError> {
        if anchors.len() < 3 {
            return Err(TrilatError::NeedMoreSpheres);
        }
        if anchors.len() > MAX_ANCHORS {
            warn!("{} anchors, only using the first {}", anchors.len(), MAX_ANCHORS);
        }

        let anchors: Vec<Vec3, MAX_ANCHORS> =
            anchors.iter().take(MAX_ANCHORS).copied().collect();
        let n = anchors.len();

        let count = (combinations(n as u32, 3) as usize).min(MAX_CACHE);
        let mut triples = Vec::new();
        'outer: for a in 0..n {
            for b in a + 1..n {
                for c in b + 1..n {
                    if triples.len() >= count || triples.push([a, b, c]).is_err() {
                        break 'outer;
                    }
                }
            }
        }

        // The bounding box always includes the origin
        let mut min = Vec3::ZERO;
        let mut max = Vec3::ZERO;
        for anchor in anchors.iter() {
            min.x = min.x.min(anchor.x);
            min.y = min.y.min(anchor.y);
            min.z = min.z.min(anchor.z);
            max.x = max.x.max(anchor.x);
            max.y = max.y.max(anchor.y);
            max.z = max.z.max(anchor.z);
        }

        let center = (min + max) / 2.0;
        if center.z != 0.0 {
            min.z -= 1.0;
            max.z += 1.0;
        }

        Ok(TrilatSolver {
            anchors,
            triples,
            min,
            max,
            center,
        })
    }

    /// Number of cached anchor triples
    pub fn triple_count(&self) -> usize {
        self.triples.len()
    }

    /// Estimates the position from the ranges to every anchor, in meters
    ///
    /// `ranges[i]` is the range to the `i`-th anchor given to [`new`].
    ///
    /// [`new`]: TrilatSolver::new
    pub fn solve(&self, ranges: &[f64]) -> Result<Estimate, TrilatError> {
        if ranges.len() < self.anchors.len() {
            return Err(TrilatError::NeedMoreSpheres);
        }

        let mut results: Vec<Candidate, MAX_RESULTS> = Vec::new();

        for triple in self.triples.iter() {
            if let Some(candidate) = self.candidate(triple, ranges) {
                // At most one result per triple, this can't overflow
                let _ = results.push(candidate);
            }
        }

        if results.is_empty() {
            return Err(TrilatError::NoSolution);
        }

        results.sort_unstable_by(|a, b| a.error.abs().total_cmp(&b.error.abs()));

        let best = if results.len() > 1 {
            cluster(&mut results)
        } else {
            0
        };
        let position = results[best].position;

        let gdop = self
            .triples
            .iter()
            .map(|[a, b, c]| {
                gdop_rate(position, self.anchors[*a], self.anchors[*b], self.anchors[*c])
            })
            .fold(1.0, |min: f64, gdop| if gdop < min { gdop } else { min });

        Ok(Estimate {
            position,
            quality: ((1.0 - gdop) * 100.0).min(100.0) as u8,
            error: results[best].error,
        })
    }

    /// Intersects the spheres of one anchor triple and picks a candidate
    ///
    /// Returns `None` if the spheres don't intersect, if both candidates are
    /// ruled out or if the picked one is off by more than [`MAX_DIFF_M`].
    fn candidate(&self, triple: &[usize; 3], ranges: &[f64]) -> Option<Candidate> {
        let spheres = triple.map(|i| Sphere::new(self.anchors[i], ranges[i]));

        let (estimates, _) = with_inflation(spheres, |s| trilaterate(s, MAX_ZERO)).ok()?;
        let estimates = [estimates.0, estimates.1];
        let scores = estimates.map(|e| self.score(e, triple, ranges));

        if scores[0].rejected && scores[1].rejected {
            debug!("triple {:?} rejected", triple);
            return None;
        }

        let min_errors = scores.map(|s| (s.min_error * 1e6).floor() / 1e6);
        let pick = if scores[0].rejected {
            1
        } else if scores[1].rejected {
            0
        } else {
            self.pick(&estimates, &min_errors)
        };

        if min_errors[pick].abs() > MAX_DIFF_M {
            debug!("triple {:?} off by {} m", triple, min_errors[pick]);
            return None;
        }

        Some(Candidate {
            position: estimates[pick],
            error: min_errors[pick],
        })
    }

    /// Checks a candidate against all anchors
    fn score(&self, estimate: Vec3, triple: &[usize; 3], ranges: &[f64]) -> Score {
        let mut min_error: Option<f64> = None;

        for (j, (anchor, range)) in self.anchors.iter().zip(ranges).enumerate() {
            let e = range - (estimate - *anchor).norm();

            if e < MIN_NEG_DIFF_M {
                return Score {
                    rejected: true,
                    min_error: e,
                };
            }

            if !triple.contains(&j) && min_error.map_or(true, |min| e.abs() < min.abs()) {
                min_error = Some(e);
                if e == 0.0 {
                    break;
                }
            }
        }

        Score {
            rejected: false,
            min_error: min_error.unwrap_or(-1.0),
        }
    }

    /// Picks one of two plausible candidates
    fn pick(&self, estimates: &[Vec3; 2], min_errors: &[f64; 2]) -> usize {
        let in_span = |p: &Vec3| p.z >= self.min.z && p.z <= self.max.z;

        match (in_span(&estimates[0]), in_span(&estimates[1])) {
            (true, true) => {
                if (min_errors[0] - min_errors[1]).abs() < MIN_ERR_M {
                    let d0 = (estimates[0].z - self.center.z).abs();
                    let d1 = (estimates[1].z - self.center.z).abs();
                    if d0 <= d1 {
                        0
                    } else {
                        1
                    }
                } else if min_errors[0].abs() < min_errors[1].abs() {
                    0
                } else {
                    1
                }
            }
            (true, false) => 0,
            (false, true) => 1,
            (false, false) => {
                if min_errors[0].abs() <= min_errors[1].abs() {
                    0
                } else {
                    1
                }
            }
        }
    }
}

/// Averages agreeing candidates, returns the index of the largest cluster
///
/// `results` must be sorted by error. Only candidates whose error is close to
/// the smallest one start a cluster.
fn cluster(results: &mut [Candidate]) -> usize {
    let mut absorbed = [false; MAX_RESULTS];
    let mut best = 0;
    let mut best_size = 0;
    let smallest_error = results[0].error.abs();

    for i in 0..results.len() {
        if (smallest_error - results[i].error.abs()).abs() > MIN_DIFF_M {
            break;
        }
        if absorbed[i] {
            continue;
        }

        let mut sum = results[i].position;
        let mut size = 1;
        for j in i + 1..results.len() {
            if absorbed[j] || (results[i].position - results[j].position).norm() > MIN_DIFF_M {
                continue;
            }
            sum = sum + results[j].position;
            absorbed[j] = true;
            size += 1;
        }

        if size > best_size {
            best_size = size;
            best = i;
        }
        if size > 1 {
            results[i].position = sum / size as f64;
        }
    }

    best
}

/// Estimates a position from anchor positions and ranges, in meters
pub fn solve(anchors: &[Vec3], ranges: &[f64]) -> Result<Estimate, TrilatError> {
    TrilatSolver::new(anchors)?.solve(ranges)
}
