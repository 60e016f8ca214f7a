// GEEPAFS REGRESSION
// ORDINARY LEAST SQUARES LINE, CONTINUOUS TWO-SEGMENT ("FOLD-LINE") FIT,
// AND THE CUBIC FREQUENCY->POWER POLYNOMIAL.
//
// EVERY FIT RETURNS A Result. A DEGENERATE OR SINGULAR SYSTEM IS A REJECTED
// CANDIDATE FOR THE CALLER, NEVER A PANIC OR A NaN LEAKING DOWNSTREAM.
//
// RESIDUALS ARE RMS OVER THE POINTS INVOLVED, SO SINGLE-LINE, TWO-SEGMENT AND
// PINNED FOLD-LINE CANDIDATES ARE COMPARED IN THE SAME UNIT.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum FitError {
    #[error("x/y length mismatch ({x} vs {y})")]
    LengthMismatch { x: usize, y: usize },
    #[error("degenerate fit: not enough distinct x values")]
    Degenerate,
    #[error("singular fold-line system at breakpoint {xc}")]
    Singular { xc: f64 },
}

// --- SINGLE LINE ---

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
    pub err: f64,
}

impl LineFit {
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

// PRECONDITION: AT LEAST 2 POINTS WITH DISTINCT x. VIOLATIONS SURFACE AS
// FitError::Degenerate RATHER THAN A DIVISION BY ZERO.
pub fn fit_line(x: &[f64], y: &[f64]) -> Result<LineFit, FitError> {
    if x.len() != y.len() {
        return Err(FitError::LengthMismatch { x: x.len(), y: y.len() });
    }
    let n = x.len();
    if n < 2 {
        return Err(FitError::Degenerate);
    }
    let nf = n as f64;
    let mean_x = x.iter().sum::<f64>() / nf;
    let mean_y = y.iter().sum::<f64>() / nf;

    // CENTERED SUMS: FREQUENCIES SIT AROUND 1E3, RAW x^2 SUMS LOSE DIGITS
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        let dx = xi - mean_x;
        sxx += dx * dx;
        sxy += dx * (yi - mean_y);
    }
    if sxx == 0.0 || !sxx.is_finite() {
        return Err(FitError::Degenerate);
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let sse: f64 = x
        .iter()
        .zip(y)
        .map(|(xi, yi)| {
            let r = slope * xi + intercept - yi;
            r * r
        })
        .sum();
    let fit = LineFit { slope, intercept, err: (sse / nf).sqrt() };
    if fit.slope.is_finite() && fit.intercept.is_finite() && fit.err.is_finite() {
        Ok(fit)
    } else {
        Err(FitError::Degenerate)
    }
}

// x WHERE TWO LINES MEET. None FOR PARALLEL LINES OR A NON-FINITE RESULT.
pub fn intersect(lower: &LineFit, upper: &LineFit) -> Option<f64> {
    let ds = upper.slope - lower.slope;
    if ds == 0.0 {
        return None;
    }
    let x = (lower.intercept - upper.intercept) / ds;
    x.is_finite().then_some(x)
}

// --- FOLD-LINE ---

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FoldFit {
    pub slope1: f64,
    pub intercept1: f64,
    pub slope2: f64,
    pub intercept2: f64,
    pub cross: f64,
    pub err: f64,
}

impl FoldFit {
    pub fn eval(&self, x: f64) -> f64 {
        if x < self.cross {
            self.slope1 * x + self.intercept1
        } else {
            self.slope2 * x + self.intercept2
        }
    }
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

// CONTINUOUS TWO-SEGMENT FIT WITH THE BREAKPOINT PINNED AT x = xc.
//
// LOWER SEGMENT: y = a1*x + b1
// UPPER SEGMENT: y = a1*xc + b1 + a2*(x - xc)   (CONTINUOUS AT xc)
//
// MINIMIZING SSE OVER (a1, a2, b1) GIVES A 3x3 NORMAL SYSTEM, SOLVED BY
// CRAMER'S RULE. b2 FOLLOWS FROM CONTINUITY: b2 = b1 + xc*(a1 - a2).
pub fn fit_fold_line(
    xc: f64,
    lower_x: &[f64],
    lower_y: &[f64],
    upper_x: &[f64],
    upper_y: &[f64],
) -> Result<FoldFit, FitError> {
    if lower_x.len() != lower_y.len() {
        return Err(FitError::LengthMismatch { x: lower_x.len(), y: lower_y.len() });
    }
    if upper_x.len() != upper_y.len() {
        return Err(FitError::LengthMismatch { x: upper_x.len(), y: upper_y.len() });
    }

    let n1 = lower_x.len() as f64;
    let n2 = upper_x.len() as f64;
    let n = n1 + n2;
    if n < 3.0 {
        return Err(FitError::Degenerate);
    }

    let (mut s1x, mut s1y, mut s1xx, mut s1xy) = (0.0, 0.0, 0.0, 0.0);
    for (x, y) in lower_x.iter().zip(lower_y) {
        s1x += x;
        s1y += y;
        s1xx += x * x;
        s1xy += x * y;
    }
    let (mut s2x, mut s2y, mut s2xx, mut s2xy) = (0.0, 0.0, 0.0, 0.0);
    for (x, y) in upper_x.iter().zip(upper_y) {
        s2x += x;
        s2y += y;
        s2xx += x * x;
        s2xy += x * y;
    }

    // UPPER SEGMENT REGRESSOR FOR a2 IS (x - xc)
    let s2d = s2x - n2 * xc;
    let s2dd = s2xx - 2.0 * xc * s2x + n2 * xc * xc;
    let s2dy = s2xy - xc * s2y;

    let m = [
        [s1xx + n2 * xc * xc, xc * s2d, s1x + n2 * xc],
        [xc * s2d, s2dd, s2d],
        [s1x + n2 * xc, s2d, n],
    ];
    let rhs = [s1xy + xc * s2y, s2dy, s1y + s2y];

    let det = det3(&m);
    if det == 0.0 || !det.is_finite() {
        return Err(FitError::Singular { xc });
    }

    let mut solved = [0.0; 3];
    for (col, out) in solved.iter_mut().enumerate() {
        let mut mc = m;
        for row in 0..3 {
            mc[row][col] = rhs[row];
        }
        *out = det3(&mc) / det;
    }
    let [a1, a2, b1] = solved;
    let b2 = b1 + xc * (a1 - a2);

    let mut sse = 0.0;
    for (x, y) in lower_x.iter().zip(lower_y) {
        let r = a1 * x + b1 - y;
        sse += r * r;
    }
    for (x, y) in upper_x.iter().zip(upper_y) {
        let r = a2 * x + b2 - y;
        sse += r * r;
    }

    let fit = FoldFit {
        slope1: a1,
        intercept1: b1,
        slope2: a2,
        intercept2: b2,
        cross: xc,
        err: (sse / n).sqrt(),
    };
    let finite = [fit.slope1, fit.intercept1, fit.slope2, fit.intercept2, fit.err]
        .iter()
        .all(|v| v.is_finite());
    if finite {
        Ok(fit)
    } else {
        Err(FitError::Singular { xc })
    }
}

// --- CUBIC POWER MODEL ---

// LEAST-SQUARES CUBIC IN A NORMALIZED VARIABLE t = (x - center) / scale.
// NORMALIZING KEEPS THE 4x4 NORMAL SYSTEM WELL CONDITIONED AT MHz SCALE.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cubic {
    pub coefs: [f64; 4], // c0 + c1*t + c2*t^2 + c3*t^3
    pub center: f64,
    pub scale: f64,
}

impl Cubic {
    pub fn eval(&self, x: f64) -> f64 {
        let t = (x - self.center) / self.scale;
        let [c0, c1, c2, c3] = self.coefs;
        ((c3 * t + c2) * t + c1) * t + c0
    }
}

pub fn fit_cubic(x: &[f64], y: &[f64]) -> Result<Cubic, FitError> {
    if x.len() != y.len() {
        return Err(FitError::LengthMismatch { x: x.len(), y: y.len() });
    }
    if x.len() < 4 {
        return Err(FitError::Degenerate);
    }
    let center = x.iter().sum::<f64>() / x.len() as f64;
    let spread = x.iter().map(|v| (v - center).abs()).fold(0.0, f64::max);
    let scale = if spread > 0.0 { spread } else { 1.0 };

    // AUGMENTED NORMAL MATRIX [A | b], A[i][j] = SUM t^(i+j), b[i] = SUM t^i * y
    let mut a = [[0.0f64; 5]; 4];
    for (xi, yi) in x.iter().zip(y) {
        let t = (xi - center) / scale;
        let mut pows = [1.0f64; 7];
        for k in 1..7 {
            pows[k] = pows[k - 1] * t;
        }
        for i in 0..4 {
            for j in 0..4 {
                a[i][j] += pows[i + j];
            }
            a[i][4] += pows[i] * yi;
        }
    }

    // GAUSSIAN ELIMINATION, PARTIAL PIVOTING
    for col in 0..4 {
        let pivot = (col..4)
            .max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return Err(FitError::Degenerate);
        }
        a.swap(col, pivot);
        for row in (col + 1)..4 {
            let factor = a[row][col] / a[col][col];
            for k in col..5 {
                a[row][k] -= factor * a[col][k];
            }
        }
    }
    let mut coefs = [0.0f64; 4];
    for row in (0..4).rev() {
        let mut acc = a[row][4];
        for k in (row + 1)..4 {
            acc -= a[row][k] * coefs[k];
        }
        coefs[row] = acc / a[row][row];
    }

    if coefs.iter().all(|c| c.is_finite()) {
        Ok(Cubic { coefs, center, scale })
    } else {
        Err(FitError::Degenerate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn line_exact() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 3.0).collect();
        let fit = fit_line(&x, &y).unwrap();
        assert!((fit.slope - 2.0).abs() < EPS);
        assert!((fit.intercept - 3.0).abs() < EPS);
        assert!(fit.err < EPS);
    }

    #[test]
    fn line_rms_residual() {
        // y = 0 EXCEPT ALTERNATING +-1 -> BEST LINE IS y = 0, RMS = 1
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.0, -1.0, 1.0, -1.0];
        let fit = fit_line(&x, &y).unwrap();
        let sse: f64 = x.iter().zip(&y).map(|(a, b)| (fit.eval(*a) - b).powi(2)).sum();
        assert!((fit.err - (sse / 4.0).sqrt()).abs() < EPS);
    }

    #[test]
    fn line_length_mismatch() {
        let err = fit_line(&[1.0, 2.0], &[1.0]).unwrap_err();
        assert_eq!(err, FitError::LengthMismatch { x: 2, y: 1 });
    }

    #[test]
    fn line_no_spread_is_degenerate() {
        assert_eq!(fit_line(&[5.0, 5.0, 5.0], &[1.0, 2.0, 3.0]), Err(FitError::Degenerate));
        assert_eq!(fit_line(&[5.0], &[1.0]), Err(FitError::Degenerate));
    }

    #[test]
    fn intersect_parallel_is_none() {
        let a = LineFit { slope: 1.0, intercept: 0.0, err: 0.0 };
        let b = LineFit { slope: 1.0, intercept: 5.0, err: 0.0 };
        assert_eq!(intersect(&a, &b), None);
    }

    #[test]
    fn intersect_meets() {
        let a = LineFit { slope: 2.0, intercept: 0.0, err: 0.0 };
        let b = LineFit { slope: 0.5, intercept: 15.0, err: 0.0 };
        let x = intersect(&a, &b).unwrap();
        assert!((x - 10.0).abs() < EPS);
    }

    #[test]
    fn fold_line_recovers_breakpoint() {
        let lower_x = [0.0, 2.0, 4.0, 6.0, 8.0];
        let lower_y: Vec<f64> = lower_x.iter().map(|x| 2.0 * x).collect();
        let upper_x = [10.0, 12.0, 14.0, 16.0, 18.0, 20.0];
        let upper_y: Vec<f64> = upper_x.iter().map(|x| 0.5 * x + 15.0).collect();

        let fit = fit_fold_line(10.0, &lower_x, &lower_y, &upper_x, &upper_y).unwrap();
        assert!((fit.cross - 10.0).abs() < EPS);
        assert!((fit.slope1 - 2.0).abs() < 1e-6);
        assert!(fit.intercept1.abs() < 1e-6);
        assert!((fit.slope2 - 0.5).abs() < 1e-6);
        assert!((fit.intercept2 - 15.0).abs() < 1e-6);
        assert!(fit.err < 1e-6);
    }

    #[test]
    fn fold_line_is_continuous_at_pin() {
        // NOISY DATA: CONTINUITY HOLDS REGARDLESS OF FIT QUALITY
        let lower_x = [100.0, 100.0, 200.0, 200.0];
        let lower_y = [0.11, 0.09, 0.21, 0.19];
        let upper_x = [300.0, 300.0, 400.0, 400.0];
        let upper_y = [0.26, 0.24, 0.27, 0.30];
        let fit = fit_fold_line(200.0, &lower_x, &lower_y, &upper_x, &upper_y).unwrap();
        let left = fit.slope1 * 200.0 + fit.intercept1;
        let right = fit.slope2 * 200.0 + fit.intercept2;
        assert!((left - right).abs() < 1e-9);
    }

    #[test]
    fn fold_line_singular_system() {
        // ALL POINTS AT ONE x: NORMAL MATRIX HAS NO FULL RANK
        let xs = [5.0, 5.0];
        let ys = [1.0, 1.0];
        let err = fit_fold_line(5.0, &xs, &ys, &xs, &ys).unwrap_err();
        assert!(matches!(err, FitError::Singular { .. }));
    }

    #[test]
    fn fold_line_length_mismatch() {
        let err = fit_fold_line(1.0, &[0.0, 1.0], &[0.0], &[2.0], &[2.0]).unwrap_err();
        assert_eq!(err, FitError::LengthMismatch { x: 2, y: 1 });
    }

    #[test]
    fn cubic_exact_at_mhz_scale() {
        let f = |x: f64| 40.0 + 1e-2 * x + 2e-6 * x * x + 3e-8 * x * x * x;
        let x = [720.0, 855.0, 982.0, 1117.0, 1245.0, 1440.0];
        let y: Vec<f64> = x.iter().map(|v| f(*v)).collect();
        let cubic = fit_cubic(&x, &y).unwrap();
        for xi in [720.0, 900.0, 1300.0, 1440.0] {
            assert!((cubic.eval(xi) - f(xi)).abs() < 1e-6, "at {}", xi);
        }
    }

    #[test]
    fn cubic_needs_four_distinct_points() {
        let x = [1.0, 1.0, 2.0, 2.0];
        let y = [1.0, 1.0, 2.0, 2.0];
        assert_eq!(fit_cubic(&x, &y), Err(FitError::Degenerate));
        assert_eq!(fit_cubic(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]), Err(FitError::Degenerate));
    }
}
