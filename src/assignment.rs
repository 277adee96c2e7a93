//! Minimum-cost bipartite matching on top of `munkres`.
//!
//! Rectangular matrices are padded to square with a constant cost, which
//! shifts every complete assignment by the same amount and so leaves the
//! optimum among real cells unchanged.

use munkres::{solve_assignment, WeightMatrix};
use tracing::warn;

/// Cost of padding cells and of any non-finite input cost.
const PAD_COST: f64 = 100_000.0;

/// Solve the rectangular assignment problem for `cost[row][col]`.
///
/// Returns `(row, col)` pairs sorted by row. Every row is assigned when
/// `rows <= cols`, otherwise every column is.
pub fn linear_assignment(cost: &[Vec<f64>]) -> Vec<(usize, usize)> {
    let rows = cost.len();
    let cols = cost.first().map_or(0, Vec::len);
    if rows == 0 || cols == 0 {
        return Vec::new();
    }

    let n = rows.max(cols);
    let mut weights = WeightMatrix::from_fn(n, |(r, c)| {
        if r < rows && c < cols {
            let v = cost[r].get(c).copied().unwrap_or(PAD_COST);
            if v.is_finite() {
                v
            } else {
                PAD_COST
            }
        } else {
            PAD_COST
        }
    });

    let positions = match solve_assignment(&mut weights) {
        Ok(positions) => positions,
        Err(e) => {
            warn!(rows, cols, "assignment failed: {e:?}");
            return Vec::new();
        }
    };

    let mut pairs: Vec<(usize, usize)> = positions
        .into_iter()
        .filter(|p| p.row < rows && p.column < cols)
        .map(|p| (p.row, p.column))
        .collect();
    pairs.sort_unstable();
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(cost: &[Vec<f64>], pairs: &[(usize, usize)]) -> f64 {
        pairs.iter().map(|&(i, j)| cost[i][j]).sum()
    }

    #[test]
    fn test_empty_matrix() {
        assert!(linear_assignment(&[]).is_empty());
        assert!(linear_assignment(&[vec![], vec![]]).is_empty());
    }

    #[test]
    fn test_two_by_two_beats_greedy() {
        // Greedy on row 0 would take (0,0) at 0.1 and force (1,1) at 0.9.
        let cost = vec![vec![0.1, 0.2], vec![0.15, 0.9]];
        let pairs = linear_assignment(&cost);
        assert_eq!(pairs, vec![(0, 1), (1, 0)]);
        assert!((total(&cost, &pairs) - 0.35).abs() < 1e-12);
    }

    #[test]
    fn test_three_by_three_optimal() {
        let cost = vec![
            vec![4.0, 1.0, 3.0],
            vec![2.0, 0.0, 5.0],
            vec![3.0, 2.0, 2.0],
        ];
        let pairs = linear_assignment(&cost);
        assert_eq!(pairs.len(), 3);
        assert!((total(&cost, &pairs) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_more_rows_than_columns() {
        let cost = vec![vec![0.9], vec![0.2], vec![0.5]];
        assert_eq!(linear_assignment(&cost), vec![(1, 0)]);
    }

    #[test]
    fn test_more_columns_than_rows() {
        let cost = vec![vec![0.7, 0.3, 0.1]];
        assert_eq!(linear_assignment(&cost), vec![(0, 2)]);
    }

    #[test]
    fn test_non_finite_cost_is_avoided() {
        let cost = vec![vec![f64::NAN, 0.4], vec![0.3, f64::INFINITY]];
        assert_eq!(linear_assignment(&cost), vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn test_equal_costs_are_deterministic() {
        let cost = vec![vec![1.0; 3]; 3];
        let first = linear_assignment(&cost);
        for _ in 0..5 {
            assert_eq!(linear_assignment(&cost), first);
        }
        assert_eq!(first.len(), 3);
    }
}
