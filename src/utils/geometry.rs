// Polygon and ellipse geometry over integer contour vertices

use imageproc::point::Point;

/// Round to 4 decimal places (all reported features use this precision)
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Enclosed area of a closed polygon via the shoelace formula
pub fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice_area: i64 = 0;
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % points.len()];
        twice_area += p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64;
    }
    (twice_area as f64 / 2.0).abs()
}

/// Arc length of the closed path through all vertices
pub fn closed_arc_length(points: &[Point<i32>]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let q = points[(i + 1) % points.len()];
            let dx = (q.x - p.x) as f64;
            let dy = (q.y - p.y) as f64;
            (dx * dx + dy * dy).sqrt()
        })
        .sum()
}

/// Best-fit ellipse, full axis lengths with `minor_axis <= major_axis`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipse {
    pub center: (f64, f64),
    pub minor_axis: f64,
    pub major_axis: f64,
}

/// Minimum number of points for an ellipse fit
pub const MIN_ELLIPSE_POINTS: usize = 5;

/// Least-squares ellipse fit.
///
/// Two passes on centroid-shifted points: first the general conic
/// `a·x² + b·xy + c·y² + d·x + e·y = 1` locates the center, then
/// `a·u² + b·uv + c·v² = 1` is refit about that center and the axes are read
/// off the eigenvalues of the quadratic form. Returns `None` for fewer than
/// five points or a degenerate (non-elliptic) fit.
pub fn fit_ellipse(points: &[Point<i32>]) -> Option<Ellipse> {
    if points.len() < MIN_ELLIPSE_POINTS {
        return None;
    }

    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x as f64).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y as f64).sum::<f64>() / n;
    let shifted: Vec<(f64, f64)> = points
        .iter()
        .map(|p| (p.x as f64 - cx, p.y as f64 - cy))
        .collect();

    // Pass 1: general conic for the center
    let conic = least_squares::<5>(shifted.iter().map(|&(x, y)| [x * x, x * y, y * y, x, y]))?;
    let [a, b, c, d, e] = conic;
    let det = 4.0 * a * c - b * b;
    if det.abs() < 1e-12 {
        return None;
    }
    let x0 = (b * e - 2.0 * c * d) / det;
    let y0 = (b * d - 2.0 * a * e) / det;

    // Pass 2: centered quadratic form
    let [qa, qb, qc] = least_squares::<3>(shifted.iter().map(|&(x, y)| {
        let (u, v) = (x - x0, y - y0);
        [u * u, u * v, v * v]
    }))?;

    // Eigenvalues of [[qa, qb/2], [qb/2, qc]]
    let mean = (qa + qc) / 2.0;
    let spread = (((qa - qc) / 2.0).powi(2) + (qb / 2.0).powi(2)).sqrt();
    let (l_small, l_large) = (mean - spread, mean + spread);
    if l_small <= 1e-12 || !l_small.is_finite() || !l_large.is_finite() {
        return None;
    }

    Some(Ellipse {
        center: (x0 + cx, y0 + cy),
        minor_axis: 2.0 / l_large.sqrt(),
        major_axis: 2.0 / l_small.sqrt(),
    })
}

/// Solve `min Σ (row·w - 1)²` through the normal equations
fn least_squares<const N: usize>(rows: impl Iterator<Item = [f64; N]>) -> Option<[f64; N]> {
    let mut ata = [[0.0f64; N]; N];
    let mut atb = [0.0f64; N];
    for row in rows {
        for i in 0..N {
            atb[i] += row[i];
            for j in 0..N {
                ata[i][j] += row[i] * row[j];
            }
        }
    }
    solve_linear(ata, atb)
}

/// Gaussian elimination with partial pivoting
fn solve_linear<const N: usize>(mut m: [[f64; N]; N], mut rhs: [f64; N]) -> Option<[f64; N]> {
    let scale = m
        .iter()
        .flat_map(|row| row.iter())
        .fold(0.0f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 {
        return None;
    }

    for col in 0..N {
        let pivot = (col..N).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot][col].abs() < scale * 1e-14 {
            return None;
        }
        m.swap(col, pivot);
        rhs.swap(col, pivot);

        for row in (col + 1)..N {
            let factor = m[row][col] / m[col][col];
            for k in col..N {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut solution = [0.0f64; N];
    for row in (0..N).rev() {
        let tail: f64 = ((row + 1)..N).map(|k| m[row][k] * solution[k]).sum();
        solution[row] = (rhs[row] - tail) / m[row][row];
    }
    solution.iter().all(|v| v.is_finite()).then_some(solution)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(side: i32) -> Vec<Point<i32>> {
        vec![
            Point::new(0, 0),
            Point::new(side, 0),
            Point::new(side, side),
            Point::new(0, side),
        ]
    }

    fn ellipse_points(a: f64, b: f64, samples: usize) -> Vec<Point<i32>> {
        (0..samples)
            .map(|i| {
                let t = i as f64 / samples as f64 * std::f64::consts::TAU;
                Point::new((100.0 + a * t.cos()).round() as i32, (100.0 + b * t.sin()).round() as i32)
            })
            .collect()
    }

    #[test]
    fn test_round4() {
        assert_eq!(round4(1.234_56), 1.2346);
        assert_eq!(round4(-0.000_04), -0.0);
    }

    #[test]
    fn test_square_area_and_perimeter() {
        let pts = square(10);
        assert_eq!(polygon_area(&pts), 100.0);
        assert_eq!(closed_arc_length(&pts), 40.0);
    }

    #[test]
    fn test_orientation_independent_area() {
        let mut pts = square(7);
        pts.reverse();
        assert_eq!(polygon_area(&pts), 49.0);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert_eq!(polygon_area(&[Point::new(1, 1)]), 0.0);
        assert_eq!(closed_arc_length(&[Point::new(1, 1)]), 0.0);
        assert!(fit_ellipse(&square(10)).is_none());
    }

    #[test]
    fn test_fit_circle() {
        let e = fit_ellipse(&ellipse_points(30.0, 30.0, 120)).unwrap();
        assert!((e.major_axis - 60.0).abs() < 1.0, "major {}", e.major_axis);
        assert!((e.minor_axis - 60.0).abs() < 1.0, "minor {}", e.minor_axis);
        assert!((e.center.0 - 100.0).abs() < 0.5);
    }

    #[test]
    fn test_fit_elongated_ellipse() {
        let e = fit_ellipse(&ellipse_points(40.0, 20.0, 200)).unwrap();
        assert!((e.major_axis - 80.0).abs() < 1.5, "major {}", e.major_axis);
        assert!((e.minor_axis - 40.0).abs() < 1.5, "minor {}", e.minor_axis);
    }

    #[test]
    fn test_collinear_points_do_not_fit() {
        let pts: Vec<Point<i32>> = (0..10).map(|i| Point::new(i, 2 * i)).collect();
        assert!(fit_ellipse(&pts).is_none());
    }
}
