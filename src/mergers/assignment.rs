//! Minimum-cost assignment for sub-object re-linking
//!
//! Munkres-style star/prime algorithm over a dense cost matrix. Forbidden
//! links carry infinite cost and are never part of the returned
//! assignment. Rectangular inputs are padded to square internally.

use ndarray::Array2;

/// Result of an assignment solve
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Assigned column per row; None for rows left unassigned (padding
    /// or forbidden-only rows)
    pub row_to_col: Vec<Option<usize>>,
    /// Total cost of the realized links
    pub cost: f64,
}

/// Solve the minimum-cost assignment over the given cost matrix.
///
/// Entries of `f64::INFINITY` mark forbidden links.
pub fn min_cost_assignment(costs: &Array2<f64>) -> Assignment {
    let rows = costs.nrows();
    let cols = costs.ncols();
    if rows == 0 || cols == 0 {
        return Assignment {
            row_to_col: vec![None; rows],
            cost: 0.0,
        };
    }

    // pad to square; padding and forbidden entries both become a large
    // finite cost so the matrix stays numerically workable
    let size = rows.max(cols);
    let finite_max = costs
        .iter()
        .copied()
        .filter(|c| c.is_finite())
        .fold(0.0f64, f64::max);
    let big = (finite_max + 1.0) * (size as f64 + 1.0);

    let mut work = Array2::from_elem((size, size), big);
    for i in 0..rows {
        for j in 0..cols {
            let c = costs[(i, j)];
            work[(i, j)] = if c.is_finite() { c } else { big };
        }
    }

    let stars = munkres(&mut work);

    let mut row_to_col = vec![None; rows];
    let mut total = 0.0;
    for (i, slot) in row_to_col.iter_mut().enumerate() {
        if let Some(j) = stars[i] {
            if j < cols && costs[(i, j)].is_finite() {
                *slot = Some(j);
                total += costs[(i, j)];
            }
        }
    }
    Assignment {
        row_to_col,
        cost: total,
    }
}

/// Munkres main loop over a square matrix; returns the starred column
/// per row.
fn munkres(costs: &mut Array2<f64>) -> Vec<Option<usize>> {
    let n = costs.nrows();

    // subtract row minima
    for mut row in costs.rows_mut() {
        let min = row.iter().copied().fold(f64::INFINITY, f64::min);
        row.mapv_inplace(|v| v - min);
    }

    // 0 = none, 1 = starred, 2 = primed
    let mut marks = Array2::<u8>::zeros((n, n));
    let mut row_cover = vec![false; n];
    let mut col_cover = vec![false; n];

    // initial independent stars
    for i in 0..n {
        for j in 0..n {
            if costs[(i, j)] == 0.0 && !row_cover[i] && !col_cover[j] {
                marks[(i, j)] = 1;
                row_cover[i] = true;
                col_cover[j] = true;
            }
        }
    }
    row_cover.fill(false);
    col_cover.fill(false);

    loop {
        // cover starred columns; done when all are covered
        for j in 0..n {
            col_cover[j] = (0..n).any(|i| marks[(i, j)] == 1);
        }
        if col_cover.iter().filter(|&&c| c).count() == n {
            break;
        }

        // prime uncovered zeros until an augmenting path appears
        let (prime_r, prime_c) = loop {
            match find_uncovered_zero(costs, &row_cover, &col_cover) {
                Some((r, c)) => {
                    marks[(r, c)] = 2;
                    if let Some(star_c) = (0..n).find(|&j| marks[(r, j)] == 1) {
                        row_cover[r] = true;
                        col_cover[star_c] = false;
                    } else {
                        break (r, c);
                    }
                }
                None => {
                    // adjust the matrix by the smallest uncovered value
                    let mut min = f64::INFINITY;
                    for i in 0..n {
                        if row_cover[i] {
                            continue;
                        }
                        for j in 0..n {
                            if !col_cover[j] {
                                min = min.min(costs[(i, j)]);
                            }
                        }
                    }
                    for i in 0..n {
                        for j in 0..n {
                            if row_cover[i] {
                                costs[(i, j)] += min;
                            }
                            if !col_cover[j] {
                                costs[(i, j)] -= min;
                            }
                        }
                    }
                }
            }
        };

        // alternate star/prime along the augmenting path
        let mut path = vec![(prime_r, prime_c)];
        loop {
            let col = path.last().expect("path is never empty").1;
            match (0..n).find(|&i| marks[(i, col)] == 1) {
                Some(star_r) => {
                    path.push((star_r, col));
                    let prime_col = (0..n)
                        .find(|&j| marks[(star_r, j)] == 2)
                        .expect("covered row has a primed zero");
                    path.push((star_r, prime_col));
                }
                None => break,
            }
        }
        for &(i, j) in &path {
            marks[(i, j)] = if marks[(i, j)] == 1 { 0 } else { 1 };
        }

        // clear covers and primes
        row_cover.fill(false);
        col_cover.fill(false);
        marks.mapv_inplace(|m| if m == 2 { 0 } else { m });
    }

    (0..n)
        .map(|i| (0..n).find(|&j| marks[(i, j)] == 1))
        .collect()
}

fn find_uncovered_zero(
    costs: &Array2<f64>,
    row_cover: &[bool],
    col_cover: &[bool],
) -> Option<(usize, usize)> {
    for i in 0..costs.nrows() {
        if row_cover[i] {
            continue;
        }
        for j in 0..costs.ncols() {
            if !col_cover[j] && costs[(i, j)] == 0.0 {
                return Some((i, j));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_assignment() {
        let costs = Array2::from_shape_vec(
            (3, 3),
            vec![1.0, 2.0, 3.0, 2.0, 4.0, 6.0, 3.0, 6.0, 9.0],
        )
        .unwrap();
        let result = min_cost_assignment(&costs);
        // optimal anti-diagonal: 3 + 4 + 3 = 10
        assert_eq!(result.row_to_col, vec![Some(2), Some(1), Some(0)]);
        assert!((result.cost - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_forbidden_links_avoided() {
        let costs = Array2::from_shape_vec(
            (2, 2),
            vec![1.0, f64::INFINITY, f64::INFINITY, 2.0],
        )
        .unwrap();
        let result = min_cost_assignment(&costs);
        assert_eq!(result.row_to_col, vec![Some(0), Some(1)]);
        assert!((result.cost - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rectangular_leaves_rows_unassigned() {
        // three rows competing for two columns
        let costs = Array2::from_shape_vec(
            (3, 2),
            vec![1.0, 10.0, 10.0, 1.0, 5.0, 5.0],
        )
        .unwrap();
        let result = min_cost_assignment(&costs);
        assert_eq!(result.row_to_col[0], Some(0));
        assert_eq!(result.row_to_col[1], Some(1));
        assert_eq!(result.row_to_col[2], None);
    }

    #[test]
    fn test_empty() {
        let costs = Array2::<f64>::zeros((0, 0));
        let result = min_cost_assignment(&costs);
        assert!(result.row_to_col.is_empty());
        assert_eq!(result.cost, 0.0);
    }
}
