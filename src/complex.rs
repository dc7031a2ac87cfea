use num_complex::Complex64;

/// Complex accumulator with Kahan (two-sum) compensation on both rails
#[derive(Clone, Copy, Default, PartialEq, Debug)]
pub struct KahanSum {
    pub sum: Complex64,
    pub compensation: Complex64,
}

impl KahanSum {
    #[inline(always)]
    pub fn add(&mut self, value: Complex64) {
        let y = value - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    /// Return the sum and zero both the sum and the compensation term
    pub fn take(&mut self) -> Complex64 {
        let sum = self.sum;
        *self = Self::default();
        sum
    }
}

/// Unit phasor at `turns` cycles (e^{i 2 pi turns})
pub fn phasor(turns: f64) -> Complex64 {
    Complex64::from_polar(1.0, 2.0 * std::f64::consts::PI * turns)
}

/// Pull a phasor back onto the unit circle
#[inline]
pub fn renormalize(z: Complex64) -> Complex64 {
    z / z.norm()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kahan_beats_naive() {
        let mut naive = Complex64::new(1.0, -1.0);
        let mut kahan = KahanSum::default();
        kahan.add(Complex64::new(1.0, -1.0));
        let tiny = Complex64::new(1e-16, -1e-16);
        for _ in 0..10_000 {
            naive += tiny;
            kahan.add(tiny);
        }
        let exact = Complex64::new(1.0 + 1e-12, -1.0 - 1e-12);
        assert!((kahan.sum - exact).norm() < 1e-14);
        assert!((naive - exact).norm() > 1e-13);
    }

    #[test]
    fn test_take_resets() {
        let mut k = KahanSum::default();
        k.add(Complex64::new(2.0, 3.0));
        assert_eq!(k.take(), Complex64::new(2.0, 3.0));
        assert_eq!(k, KahanSum::default());
    }

    #[test]
    fn test_renormalize() {
        let z = renormalize(Complex64::new(3.0, 4.0));
        assert!((z.norm() - 1.0).abs() < 1e-15);
        assert!((phasor(0.25) - Complex64::new(0.0, 1.0)).norm() < 1e-15);
    }
}
