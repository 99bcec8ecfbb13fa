use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::rngs::OsRng;

use crate::error::{Error, Result};

/// A point `(x, y)` on a sharing polynomial. `x` is the owning party's id.
pub type Point = (u32, BigUint);

/// Represents a polynomial over the prime field GF(p).
///
/// Coefficients are stored lowest degree first, so `coefficients[0]` is the shared secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polynomial {
    /// The coefficients of the polynomial, each already reduced mod p.
    pub coefficients: Vec<BigUint>,
}

impl Polynomial {
    /// Constructs a new polynomial of a given degree with random coefficients,
    /// where the constant term is the provided secret.
    ///
    /// The higher-degree coefficients are drawn uniformly from `[1, p-1]` using the operating
    /// system's CSPRNG.
    ///
    /// # Arguments
    ///
    /// * `degree` - The degree of the polynomial (threshold - 1).
    /// * `secret` - The secret (constant term) of the polynomial.
    /// * `prime` - The field modulus.
    pub fn random(degree: usize, secret: &BigUint, prime: &BigUint) -> Self {
        let mut rng = OsRng;
        let low = BigUint::one();
        let mut coefficients = Vec::with_capacity(degree + 1);
        coefficients.push(secret % prime);
        for _ in 0..degree {
            coefficients.push(rng.gen_biguint_range(&low, prime));
        }

        Polynomial { coefficients }
    }

    /// Evaluates the polynomial at `x` using Horner's method.
    ///
    /// # Arguments
    ///
    /// * `x` - The point at which to evaluate the polynomial.
    /// * `prime` - The field modulus.
    ///
    /// # Returns
    ///
    /// The value of the polynomial at point `x`, reduced mod `prime`.
    pub fn evaluate(&self, x: &BigUint, prime: &BigUint) -> BigUint {
        self.coefficients
            .iter()
            .rev()
            .fold(BigUint::zero(), |acc, coeff| (acc * x + coeff) % prime)
    }
}

fn check_prime(prime: &BigUint) -> Result<()> {
    if *prime < BigUint::from(2u32) {
        return Err(Error::Validation(format!(
            "field modulus must be at least 2, got {prime}"
        )));
    }
    Ok(())
}

/// Splits a secret into `n` points of a random degree `threshold - 1` polynomial.
///
/// The secret is first normalised into `[0, p)`. Point `i` is `(i, f(i))` for `i = 1..=n`.
///
/// # Errors
///
/// Returns a validation error if `threshold < 1`, `threshold > n`, `prime < 2`, or `n` is not
/// smaller than the prime (x-coordinates must be distinct non-zero field elements).
///
/// # Examples
///
/// ```rust
/// use num_bigint::BigUint;
/// use smpcnet::sss::{create_shares, reconstruct_secret};
///
/// let prime = BigUint::from(2_147_483_647u32);
/// let shares = create_shares(&BigUint::from(42u32), 2, 3, &prime).unwrap();
/// let secret = reconstruct_secret(&shares[1..], &prime).unwrap();
/// assert_eq!(secret, BigUint::from(42u32));
/// ```
pub fn create_shares(
    secret: &BigUint,
    threshold: usize,
    n: usize,
    prime: &BigUint,
) -> Result<Vec<Point>> {
    check_prime(prime)?;
    if threshold < 1 || n < 1 {
        return Err(Error::Validation(
            "threshold and share count must be positive".to_string(),
        ));
    }
    if threshold > n {
        return Err(Error::Validation(format!(
            "threshold {threshold} cannot exceed share count {n}"
        )));
    }
    if BigUint::from(n) >= *prime {
        return Err(Error::Validation(format!(
            "share count {n} must be smaller than the field modulus"
        )));
    }
    let n = u32::try_from(n)
        .map_err(|_| Error::Validation(format!("share count {n} is too large")))?;

    let poly = Polynomial::random(threshold - 1, secret, prime);
    Ok((1..=n)
        .map(|x| (x, poly.evaluate(&BigUint::from(x), prime)))
        .collect())
}

/// Modular inverse via Fermat's little theorem: `d^(p-2) mod p`.
///
/// Only valid for prime `p`. Returns `None` when `d ≡ 0 (mod p)`.
pub fn mod_inverse(d: &BigUint, prime: &BigUint) -> Option<BigUint> {
    let d = d % prime;
    if d.is_zero() {
        return None;
    }
    let exponent = prime - BigUint::from(2u32);
    Some(d.modpow(&exponent, prime))
}

// (a - b) mod p for a, b already reduced.
fn sub_mod(a: &BigUint, b: &BigUint, prime: &BigUint) -> BigUint {
    (a + prime - b) % prime
}

/// Performs Lagrange interpolation over GF(p) and evaluates the polynomial at `x`.
///
/// For each point `i` the basis term is `y_i * Π_{j≠i} (x - x_j) * inverse(x_i - x_j)`.
///
/// # Errors
///
/// * `InsufficientShares` if fewer than two points are supplied.
/// * `DuplicateCoordinate` if two points coincide mod p, which would make a denominator zero.
pub fn interpolate_at(points: &[Point], x: &BigUint, prime: &BigUint) -> Result<BigUint> {
    check_prime(prime)?;
    if points.len() < 2 {
        return Err(Error::InsufficientShares {
            needed: 2,
            got: points.len(),
        });
    }

    let x = x % prime;
    let xs: Vec<BigUint> = points
        .iter()
        .map(|(xi, _)| BigUint::from(*xi) % prime)
        .collect();

    let mut value = BigUint::zero();
    for (i, (a_x, a_y)) in points.iter().enumerate() {
        let mut term = a_y % prime;
        for (j, b_x) in xs.iter().enumerate() {
            if i == j {
                continue;
            }
            let numerator = sub_mod(&x, b_x, prime);
            let denominator = sub_mod(&xs[i], b_x, prime);
            let inverse = mod_inverse(&denominator, prime).ok_or(Error::DuplicateCoordinate(*a_x))?;
            term = term * numerator % prime * inverse % prime;
        }
        value = (value + term) % prime;
    }

    Ok(value)
}

/// Reconstructs the constant term of the polynomial through `points`.
///
/// This is deliberately unaware of the sharing threshold: given at least two distinct points it
/// always returns *some* field element. Below the sharing threshold that element is unrelated to
/// the secret, and nothing here signals the difference. Quorum policy belongs to the caller.
pub fn reconstruct_secret(points: &[Point], prime: &BigUint) -> Result<BigUint> {
    interpolate_at(points, &BigUint::zero(), prime)
}

/// Sums share values mod p.
pub fn add_shares(values: &[BigUint], prime: &BigUint) -> Result<BigUint> {
    check_prime(prime)?;
    Ok(values
        .iter()
        .fold(BigUint::zero(), |acc, v| (acc + v) % prime))
}

/// Adds two share sets point by point, yielding shares of the sum of the two secrets.
///
/// # Errors
///
/// Returns a validation error if the sets differ in length or if the x-coordinates at the same
/// position disagree.
pub fn add_share_sets(a: &[Point], b: &[Point], prime: &BigUint) -> Result<Vec<Point>> {
    check_prime(prime)?;
    if a.len() != b.len() {
        return Err(Error::Validation(format!(
            "share sets differ in length: {} vs {}",
            a.len(),
            b.len()
        )));
    }

    a.iter()
        .zip(b)
        .map(|((x1, y1), (x2, y2))| {
            if x1 != x2 {
                return Err(Error::Validation(format!(
                    "x-coordinate mismatch: {x1} != {x2}"
                )));
            }
            Ok((*x1, (y1 + y2) % prime))
        })
        .collect()
}
