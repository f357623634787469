use std::ops::AddAssign;

use elliptic_curve::Field;
use k256::{AffinePoint, ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

/// Represents a polynomial with coefficients in the scalar field of the curve.
#[derive(Debug, Clone)]
pub struct Polynomial {
    /// The coefficients of our polynomial, from 0..size-1.
    coefficients: Vec<Scalar>,
}

impl Polynomial {
    /// Generate a random polynomial with a certain number of coefficients.
    pub fn random(rng: &mut impl CryptoRngCore, size: usize) -> Self {
        let coefficients = (0..size).map(|_| Scalar::random(&mut *rng)).collect();
        Self { coefficients }
    }

    /// Extend a constant to a random polynomial of a certain size.
    ///
    /// With a zero constant this gives a sharing of zero, used for masking.
    pub fn extend_random(rng: &mut impl CryptoRngCore, size: usize, constant: &Scalar) -> Self {
        let mut coefficients = Vec::with_capacity(size);
        coefficients.push(*constant);
        for _ in 1..size {
            coefficients.push(Scalar::random(&mut *rng));
        }
        Self { coefficients }
    }

    /// Evaluate this polynomial at a point, using Horner's method.
    pub fn evaluate(&self, x: &Scalar) -> Scalar {
        self.coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, c| acc * x + c)
    }

    pub fn evaluate_zero(&self) -> Scalar {
        self.coefficients.first().copied().unwrap_or(Scalar::ZERO)
    }

    /// Commit to this polynomial, by multiplying each coefficient by the generator.
    pub fn commit(&self) -> GroupPolynomial {
        let coefficients = self
            .coefficients
            .iter()
            .map(|c| (ProjectivePoint::GENERATOR * c).to_affine())
            .collect();
        GroupPolynomial { coefficients }
    }
}

/// A polynomial whose coefficients are curve points.
///
/// This is the public commitment to a [Polynomial]: evaluating it at `x`
/// gives `f(x) * G`, which lets anyone check a share without learning it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupPolynomial {
    coefficients: Vec<AffinePoint>,
}

impl GroupPolynomial {
    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn evaluate(&self, x: &Scalar) -> ProjectivePoint {
        self.coefficients
            .iter()
            .rev()
            .fold(ProjectivePoint::IDENTITY, |acc, c| acc * x + c)
    }

    pub fn evaluate_zero(&self) -> ProjectivePoint {
        self.coefficients
            .first()
            .map(|c| ProjectivePoint::from(*c))
            .unwrap_or(ProjectivePoint::IDENTITY)
    }
}

impl AddAssign<&GroupPolynomial> for GroupPolynomial {
    fn add_assign(&mut self, rhs: &GroupPolynomial) {
        assert_eq!(self.len(), rhs.len());
        for (a, b) in self.coefficients.iter_mut().zip(rhs.coefficients.iter()) {
            *a = (ProjectivePoint::from(*a) + b).to_affine();
        }
    }
}

#[cfg(test)]
mod test {
    use rand_core::OsRng;

    use super::*;

    #[test]
    fn test_commitment_matches_evaluation() {
        let f = Polynomial::random(&mut OsRng, 3);
        let big_f = f.commit();
        let x = Scalar::from(7u64);
        assert_eq!(big_f.evaluate(&x), ProjectivePoint::GENERATOR * f.evaluate(&x));
        assert_eq!(
            big_f.evaluate_zero(),
            ProjectivePoint::GENERATOR * f.evaluate_zero()
        );
    }

    #[test]
    fn test_extend_random_keeps_constant() {
        let constant = Scalar::from(42u64);
        let f = Polynomial::extend_random(&mut OsRng, 4, &constant);
        assert_eq!(f.evaluate(&Scalar::ZERO), constant);
    }
}
