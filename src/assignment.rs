//! One-to-one assignment of task objects to observed regions.
//!
//! Both solvers return exactly one [`Match`] per object, never reuse a region, and drop
//! any pairing whose similarity is not strictly positive.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::similarity::SimilarityMatrix;

/// The region an object was paired with, if any.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub region: Option<usize>,
    /// Similarity of the chosen pairing; 0 when unmatched.
    pub confidence: f32,
}

impl Match {
    pub const UNMATCHED: Match = Match {
        region: None,
        confidence: 0.0,
    };
}

/// Per-object matches, indexed like the similarity matrix rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    matches: Vec<Match>,
}

impl Assignment {
    pub fn unmatched(objects: usize) -> Self {
        Self {
            matches: vec![Match::UNMATCHED; objects],
        }
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn get(&self, object: usize) -> Match {
        self.matches.get(object).copied().unwrap_or(Match::UNMATCHED)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Match> {
        self.matches.iter()
    }

    pub fn matched_count(&self) -> usize {
        self.matches.iter().filter(|m| m.region.is_some()).count()
    }

    pub fn total_confidence(&self) -> f32 {
        self.matches.iter().map(|m| m.confidence).sum()
    }
}

/// Contract shared by the exact and the greedy solver.
pub trait AssignmentSolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn solve(&self, scores: &SimilarityMatrix) -> Assignment;
}

/// Which solver a run uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    #[default]
    Hungarian,
    Greedy,
}

impl SolverKind {
    pub fn solver(self) -> Box<dyn AssignmentSolver> {
        match self {
            SolverKind::Hungarian => Box::new(HungarianSolver),
            SolverKind::Greedy => Box::new(GreedySolver),
        }
    }
}

/// Exact maximum-total-similarity assignment (Kuhn–Munkres with potentials).
#[derive(Debug, Clone, Copy, Default)]
pub struct HungarianSolver;

impl AssignmentSolver for HungarianSolver {
    fn name(&self) -> &'static str {
        "hungarian"
    }

    fn solve(&self, scores: &SimilarityMatrix) -> Assignment {
        let (n, m) = (scores.objects(), scores.regions());
        let mut assignment = Assignment::unmatched(n);
        if n == 0 || m == 0 {
            return assignment;
        }

        // The potential method needs rows <= cols; transpose when there are more objects
        // than regions and map back afterwards.
        let transpose = n > m;
        let (rows, cols) = if transpose { (m, n) } else { (n, m) };
        let cost = |r: usize, c: usize| -> f64 {
            let s = if transpose {
                scores.get(c, r)
            } else {
                scores.get(r, c)
            };
            // Non-positive pairs are never kept, so they must not outweigh leaving a row
            // on a zero-cost column.
            -f64::from(s.max(0.0))
        };

        let col_to_row = min_cost_matching(rows, cols, cost);

        for (c, row) in col_to_row.into_iter().enumerate() {
            let Some(r) = row else { continue };
            let (object, region) = if transpose { (c, r) } else { (r, c) };
            let similarity = scores.get(object, region);
            if similarity > 0.0 {
                assignment.matches[object] = Match {
                    region: Some(region),
                    confidence: similarity,
                };
            }
        }

        debug!(solver = self.name(), matched = assignment.matched_count(), "assignment solved");
        assignment
    }
}

/// Minimum-cost assignment of every row to a distinct column (`rows <= cols`).
///
/// Returns, for each column, the row assigned to it.
fn min_cost_matching(
    rows: usize,
    cols: usize,
    cost: impl Fn(usize, usize) -> f64,
) -> Vec<Option<usize>> {
    // 1-based internally; index 0 is the virtual source column/row.
    let mut u = vec![0.0_f64; rows + 1];
    let mut v = vec![0.0_f64; cols + 1];
    let mut owner = vec![0_usize; cols + 1];
    let mut way = vec![0_usize; cols + 1];

    for i in 1..=rows {
        owner[0] = i;
        let mut j0 = 0;
        let mut minv = vec![f64::INFINITY; cols + 1];
        let mut used = vec![false; cols + 1];

        loop {
            used[j0] = true;
            let i0 = owner[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0;

            for j in 1..=cols {
                if used[j] {
                    continue;
                }
                let reduced = cost(i0 - 1, j - 1) - u[i0] - v[j];
                if reduced < minv[j] {
                    minv[j] = reduced;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }

            for j in 0..=cols {
                if used[j] {
                    u[owner[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }

            j0 = j1;
            if owner[j0] == 0 {
                break;
            }
        }

        loop {
            let j1 = way[j0];
            owner[j0] = owner[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    owner[1..]
        .iter()
        .map(|&row| (row != 0).then(|| row - 1))
        .collect()
}

/// Global greedy matching: best remaining pair first.
///
/// Ties keep input order (lower object index, then lower region index).
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySolver;

impl AssignmentSolver for GreedySolver {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn solve(&self, scores: &SimilarityMatrix) -> Assignment {
        let (n, m) = (scores.objects(), scores.regions());
        let mut assignment = Assignment::unmatched(n);
        if n == 0 || m == 0 {
            return assignment;
        }

        let mut triples: Vec<(usize, usize, f32)> = (0..n)
            .flat_map(|i| (0..m).map(move |j| (i, j, scores.get(i, j))))
            .collect();
        // `sort_by` is stable, so equal scores stay in (object, region) order.
        triples.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut object_used = vec![false; n];
        let mut region_used = vec![false; m];
        let mut matched = 0;

        for (i, j, similarity) in triples {
            if similarity <= 0.0 {
                break;
            }
            if object_used[i] || region_used[j] {
                continue;
            }
            assignment.matches[i] = Match {
                region: Some(j),
                confidence: similarity,
            };
            object_used[i] = true;
            region_used[j] = true;
            matched += 1;
            if matched == n.min(m) {
                break;
            }
        }

        debug!(solver = self.name(), matched, "assignment solved");
        assignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solvers() -> [Box<dyn AssignmentSolver>; 2] {
        [SolverKind::Hungarian.solver(), SolverKind::Greedy.solver()]
    }

    fn assert_one_to_one(assignment: &Assignment, regions: usize) {
        let mut seen = vec![false; regions];
        for m in assignment.iter() {
            match m.region {
                Some(r) => {
                    assert!(r < regions);
                    assert!(!seen[r], "region {r} used twice");
                    assert!(m.confidence > 0.0);
                    seen[r] = true;
                }
                None => assert_eq!(m.confidence, 0.0),
            }
        }
    }

    #[test]
    fn returns_one_entry_per_object_for_any_shape() {
        let shapes = [
            vec![vec![0.3, 0.9, 0.2], vec![0.8, 0.7, 0.1]],
            vec![vec![0.5], vec![0.6], vec![0.7]],
            vec![vec![0.2, 0.4], vec![0.9, 0.1]],
        ];
        for rows in &shapes {
            let s = SimilarityMatrix::from_rows(rows);
            for solver in solvers() {
                let a = solver.solve(&s);
                assert_eq!(a.len(), s.objects(), "{}", solver.name());
                assert_one_to_one(&a, s.regions());
            }
        }
    }

    /// Best total over every one-to-one partial matching that only uses positive cells.
    fn brute_force_best(s: &SimilarityMatrix, object: usize, used: &mut [bool]) -> f32 {
        if object == s.objects() {
            return 0.0;
        }
        let mut best = brute_force_best(s, object + 1, used);
        for region in 0..s.regions() {
            let score = s.get(object, region);
            if used[region] || score <= 0.0 {
                continue;
            }
            used[region] = true;
            best = best.max(score + brute_force_best(s, object + 1, used));
            used[region] = false;
        }
        best
    }

    #[test]
    fn exact_solver_matches_brute_force_on_random_matrices() {
        let mut seed = 0x9e37_79b9_u32;
        let mut next = move || {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (seed >> 8) as f32 / (1u32 << 24) as f32
        };

        for round in 0..40 {
            for objects in 0..=5 {
                for regions in 0..=5 {
                    let mut s = SimilarityMatrix::zeros(objects, regions);
                    for i in 0..objects {
                        for j in 0..regions {
                            // Roughly one cell in five is non-positive.
                            s.set(i, j, next() * 1.2 - 0.2);
                        }
                    }
                    let best = brute_force_best(&s, 0, &mut vec![false; regions]);

                    let exact = HungarianSolver.solve(&s);
                    assert_eq!(exact.len(), objects);
                    assert_one_to_one(&exact, regions);
                    assert!(
                        (exact.total_confidence() - best).abs() < 1e-4,
                        "round {round}, {objects}x{regions}: {} vs {best}",
                        exact.total_confidence()
                    );

                    let greedy = GreedySolver.solve(&s);
                    assert_eq!(greedy.len(), objects);
                    assert_one_to_one(&greedy, regions);
                    assert!(greedy.total_confidence() <= best + 1e-4);
                }
            }
        }
    }

    #[test]
    fn zero_regions_leaves_everything_unmatched() {
        let s = SimilarityMatrix::zeros(3, 0);
        for solver in solvers() {
            let a = solver.solve(&s);
            assert_eq!(a.len(), 3);
            assert_eq!(a.matched_count(), 0);
        }
    }

    #[test]
    fn non_positive_scores_never_match() {
        let s = SimilarityMatrix::from_rows(&[vec![0.0, -0.2], vec![-0.5, 0.0], vec![-1.0, -0.1]]);
        for solver in solvers() {
            let a = solver.solve(&s);
            assert_eq!(a.matched_count(), 0, "{}", solver.name());
            assert_eq!(a.total_confidence(), 0.0);
        }
    }

    #[test]
    fn exact_solver_drops_forced_non_positive_pair() {
        // Two objects, two regions: optimum pairs object 1 with region 1 at -0.3.
        let s = SimilarityMatrix::from_rows(&[vec![0.9, 0.2], vec![0.1, -0.3]]);
        let a = HungarianSolver.solve(&s);
        assert_eq!(a.get(0), Match { region: Some(0), confidence: 0.9 });
        assert_eq!(a.get(1), Match::UNMATCHED);
    }

    #[test]
    fn strongly_negative_cell_does_not_displace_a_positive_pair() {
        // A full matching would avoid the -1.0 cell and give up the 0.9 pair.
        let s = SimilarityMatrix::from_rows(&[vec![0.9, 0.5], vec![0.1, -1.0]]);
        let a = HungarianSolver.solve(&s);
        assert_eq!(a.get(0), Match { region: Some(0), confidence: 0.9 });
        assert_eq!(a.get(1), Match::UNMATCHED);
    }

    #[test]
    fn exact_solver_maximises_total_where_greedy_does_not() {
        let s = SimilarityMatrix::from_rows(&[vec![0.9, 0.8], vec![0.85, 0.1]]);
        let exact = HungarianSolver.solve(&s);
        assert_eq!(exact.get(0).region, Some(1));
        assert_eq!(exact.get(1).region, Some(0));
        assert!((exact.total_confidence() - 1.65).abs() < 1e-6);

        let greedy = GreedySolver.solve(&s);
        assert_eq!(greedy.get(0).region, Some(0));
        assert_eq!(greedy.get(1).region, Some(1));
    }

    #[test]
    fn solvers_agree_when_best_pairs_do_not_conflict() {
        let s = SimilarityMatrix::from_rows(&[
            vec![0.91, 0.12, 0.05, 0.33],
            vec![0.14, 0.08, 0.77, 0.21],
            vec![0.02, 0.64, 0.11, 0.09],
        ]);
        let exact = HungarianSolver.solve(&s);
        let greedy = GreedySolver.solve(&s);
        assert_eq!(exact, greedy);
        assert_eq!(exact.get(1).region, Some(2));
    }

    #[test]
    fn more_objects_than_regions() {
        let s = SimilarityMatrix::from_rows(&[vec![0.2], vec![0.7], vec![0.4]]);
        for solver in solvers() {
            let a = solver.solve(&s);
            assert_eq!(a.get(1), Match { region: Some(0), confidence: 0.7 });
            assert_eq!(a.matched_count(), 1);
        }
    }

    #[test]
    fn greedy_ties_prefer_earlier_object_then_region() {
        let s = SimilarityMatrix::from_rows(&[vec![0.5, 0.5], vec![0.5, 0.5]]);
        let a = GreedySolver.solve(&s);
        assert_eq!(a.get(0).region, Some(0));
        assert_eq!(a.get(1).region, Some(1));
    }

    #[test]
    fn solver_kind_deserializes_snake_case() {
        let kind: SolverKind = serde_json::from_str("\"greedy\"").expect("valid kind");
        assert_eq!(kind, SolverKind::Greedy);
        assert_eq!(SolverKind::default().solver().name(), "hungarian");
    }
}
