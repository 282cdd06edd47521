//! Base-2 Niederreiter low-discrepancy sequence.
//!
//! Direction numbers come from the primitive polynomials over GF(2) listed
//! below, one per dimension. Successive points differ by one XOR per
//! dimension, selected by the lowest zero bit of the point index (Gray code
//! order), so generation is constant time per dimension.

/// Highest supported dimension.
pub const MAX_DIMENSION: usize = 12;

const NBITS: usize = 31;
const MAX_DEGREE: usize = 50;
const MAXV: usize = NBITS + MAX_DEGREE;
const SCALE: f64 = 1.0 / (1u64 << NBITS) as f64;

/// Coefficients (lowest degree first) of the polynomials; entry `d + 1`
/// drives dimension `d`.
const PRIMITIVE_POLY: [[u8; 6]; MAX_DIMENSION + 1] = [
    [1, 0, 0, 0, 0, 0],
    [0, 1, 0, 0, 0, 0],
    [1, 1, 0, 0, 0, 0],
    [1, 1, 1, 0, 0, 0],
    [1, 1, 0, 1, 0, 0],
    [1, 0, 1, 1, 0, 0],
    [1, 1, 0, 0, 1, 0],
    [1, 0, 0, 1, 1, 0],
    [1, 1, 1, 1, 1, 0],
    [1, 0, 1, 0, 0, 1],
    [1, 0, 0, 1, 0, 1],
    [1, 1, 1, 1, 0, 1],
    [1, 1, 1, 0, 1, 1],
];

const POLY_DEGREE: [usize; MAX_DIMENSION + 1] = [0, 1, 1, 2, 3, 3, 4, 4, 4, 5, 5, 5, 5];

type Poly = [u8; MAX_DEGREE + 1];

/// Product of two polynomials over GF(2).
fn poly_multiply(a: &Poly, a_degree: usize, b: &Poly, b_degree: usize) -> (Poly, usize) {
    let degree = a_degree + b_degree;
    let mut out = [0u8; MAX_DEGREE + 1];
    for (k, term) in out.iter_mut().enumerate().take(degree + 1) {
        for j in 0..=k {
            *term ^= a[k - j] & b[j];
        }
    }
    (out, degree)
}

/// Multiply `pb` by `px` in place and expand the resulting linear recurrence.
fn calculate_v(px: &Poly, px_degree: usize, pb: &mut Poly, pb_degree: &mut usize) -> [u8; MAXV + 1] {
    let bigm = *pb_degree;
    let (product, degree) = poly_multiply(px, px_degree, pb, *pb_degree);
    *pb = product;
    *pb_degree = degree;
    let m = degree;

    let mut v = [0u8; MAXV + 1];
    v[bigm] = 1;
    for x in v.iter_mut().take(m).skip(bigm + 1) {
        *x = 1;
    }
    for r in 0..=MAXV - m {
        let mut term = 0;
        for k in 0..m {
            term ^= pb[k] & v[r + k];
        }
        v[r + m] = term;
    }
    v
}

/// Generator state for up to [`MAX_DIMENSION`] dimensions.
#[derive(Debug, Clone)]
pub struct Niederreiter2 {
    cj: Vec<[u32; MAX_DIMENSION]>,
    next: [u32; MAX_DIMENSION],
    count: u32,
    dimension: usize,
}

impl Niederreiter2 {
    /// `dimension` is clamped to `1..=MAX_DIMENSION`.
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.clamp(1, MAX_DIMENSION);
        let mut cj = vec![[0u32; MAX_DIMENSION]; NBITS];

        for dim in 0..dimension {
            let poly = dim + 1;
            let px_degree = POLY_DEGREE[poly];
            let mut px = [0u8; MAX_DEGREE + 1];
            px[..=px_degree].copy_from_slice(&PRIMITIVE_POLY[poly][..=px_degree]);
            let mut pb = [0u8; MAX_DEGREE + 1];
            pb[0] = 1;
            let mut pb_degree = 0;

            let mut ci = [[0u8; NBITS]; NBITS];
            let mut v = [0u8; MAXV + 1];
            let mut u = 0;
            for j in 0..NBITS {
                if u == 0 {
                    v = calculate_v(&px, px_degree, &mut pb, &mut pb_degree);
                }
                for (r, row) in ci.iter_mut().enumerate() {
                    row[j] = v[r + u];
                }
                u = (u + 1) % px_degree;
            }
            for (r, row) in ci.iter().enumerate() {
                cj[r][dim] = row.iter().fold(0u32, |acc, &bit| (acc << 1) | bit as u32);
            }
        }

        Self {
            cj,
            next: [0; MAX_DIMENSION],
            count: 0,
            dimension,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Back to the first point (the origin).
    pub fn reset(&mut self) {
        self.next = [0; MAX_DIMENSION];
        self.count = 0;
    }

    /// Write the next point, in `[0, 1)`, into `out[..dimension]`.
    pub fn next_point(&mut self, out: &mut [f64]) {
        for (o, q) in out.iter_mut().zip(&self.next[..self.dimension]) {
            *o = *q as f64 * SCALE;
        }
        // the sequence is exhausted after 2^31 points; start over
        let r = self.count.trailing_ones() as usize;
        if r >= NBITS {
            self.reset();
            return;
        }
        for (q, c) in self.next[..self.dimension].iter_mut().zip(&self.cj[r]) {
            *q ^= c;
        }
        self.count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(dimension: usize, n: usize) -> Vec<Vec<f64>> {
        let mut g = Niederreiter2::new(dimension);
        (0..n)
            .map(|_| {
                let mut p = vec![0.0; dimension];
                g.next_point(&mut p);
                p
            })
            .collect()
    }

    #[test]
    fn test_first_dimension_is_gray_coded_van_der_corput() {
        let p = points(1, 8);
        let first: Vec<f64> = p.iter().map(|x| x[0]).collect();
        assert_eq!(first, vec![0.0, 0.5, 0.75, 0.25, 0.375, 0.875, 0.625, 0.125]);
    }

    #[test]
    fn test_known_two_dimensional_points() {
        let p = points(2, 7);
        assert_eq!(p[1], vec![0.5, 0.5]);
        assert_eq!(p[2], vec![0.75, 0.25]);
        assert_eq!(p[3], vec![0.25, 0.75]);
        assert_eq!(p[6], vec![0.625, 0.125]);
    }

    #[test]
    fn test_higher_dimensions() {
        let p = points(5, 3);
        assert_eq!(p[1], vec![0.5, 0.5, 0.75, 0.875, 0.875]);
        assert_eq!(p[2], vec![0.75, 0.25, 0.3125, 0.140625, 0.140625]);
    }

    #[test]
    fn test_stratified_and_resettable() {
        // the first 2^k points fill every dyadic interval of length 2^-k once
        let mut seen = [false; 16];
        for p in points(3, 16) {
            for x in &p {
                assert!((0.0..1.0).contains(x));
            }
            let cell = (p[0] * 16.0) as usize;
            assert!(!seen[cell], "cell {cell} hit twice");
            seen[cell] = true;
        }

        let mut g = Niederreiter2::new(3);
        let mut a = [0.0; 3];
        for _ in 0..5 {
            g.next_point(&mut a);
        }
        g.reset();
        let mut b = [0.0; 3];
        g.next_point(&mut b);
        g.next_point(&mut b);
        assert_eq!(b, [0.5, 0.5, 0.75]);
        assert_eq!(Niederreiter2::new(40).dimension(), MAX_DIMENSION);
    }
}
