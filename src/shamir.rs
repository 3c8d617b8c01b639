//! Raw Shamir split/combine over byte strings.
//!
//! Each byte of the secret is the constant term of an independent random
//! polynomial of degree `threshold - 1`; share `i` is the evaluation of
//! every polynomial at x = i. Recovery interpolates the constant terms
//! with Lagrange coefficients at x = 0. All field arithmetic is the
//! constant-time GF(2^8) from [`crate::gf256`].

use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::RngCore;
use rayon::prelude::*;
use zeroize::Zeroize;

use crate::error::{FortifyError, Result};
use crate::gf256::Gf;

/// Splits `secret` into `parts` share payloads, any `threshold` of which
/// recover it. The returned vectors are y-coordinate strings; the
/// x-coordinate of entry `i` is `i + 1`.
pub fn split(
    rng: &mut ChaCha20Rng,
    secret: &[u8],
    parts: u8,
    threshold: u8,
) -> Result<Vec<Vec<u8>>> {
    if parts == 0 {
        return Err(FortifyError::InvalidShareCount(parts));
    }
    if threshold == 0 {
        return Err(FortifyError::InvalidThreshold(threshold));
    }
    if threshold > parts {
        return Err(FortifyError::ThresholdTooLarge { threshold, parts });
    }

    let len = secret.len();
    let t = threshold as usize;

    // Random coefficients for x^1..x^(t-1), laid out per secret byte.
    let mut coefficients = vec![0u8; len * (t - 1)];
    rng.fill_bytes(&mut coefficients);

    let xs: Vec<Gf> = (1..=parts).map(Gf::new).collect();
    let shares: Vec<Vec<u8>> = xs
        .into_par_iter()
        .map(|x| {
            (0..len)
                .map(|idx| {
                    // Horner evaluation from the highest coefficient down.
                    let mut acc = Gf(0);
                    for j in (0..t).rev() {
                        let coeff = if j == 0 {
                            Gf(secret[idx])
                        } else {
                            Gf(coefficients[idx * (t - 1) + (j - 1)])
                        };
                        acc = acc * x + coeff;
                    }
                    acc.0
                })
                .collect()
        })
        .collect();

    coefficients.zeroize();
    Ok(shares)
}

/// Recovers the secret from `(x, payload)` points. The caller is expected
/// to pass at least the original threshold; with fewer points the result
/// is well-formed garbage, which digest verification upstream rejects.
pub fn combine(points: &[(u8, Vec<u8>)]) -> Result<Vec<u8>> {
    if points.is_empty() {
        return Err(FortifyError::InsufficientShares { needed: 1, got: 0 });
    }
    let len = points[0].1.len();
    if !points.iter().all(|(_, data)| data.len() == len) {
        return Err(FortifyError::InconsistentShareLength);
    }

    let xs: Vec<Gf> = points.iter().map(|&(x, _)| Gf(x)).collect();
    for (i, &xi) in xs.iter().enumerate() {
        if xi.0 == 0 {
            return Err(FortifyError::InvalidShareIndex(0));
        }
        if xs[i + 1..].contains(&xi) {
            return Err(FortifyError::InvalidShareIndex(xi.0 as u32));
        }
    }

    // Lagrange basis at x = 0: l_i = prod(x_j) / (x_i * prod(x_i + x_j)).
    let p = xs.iter().fold(Gf(1), |acc, &x| acc * x);
    let lagrange: Vec<Gf> = xs
        .iter()
        .enumerate()
        .map(|(i, &x_i)| {
            let numerator = p * x_i.inverse().expect("nonzero index checked above");
            let mut denominator = Gf(1);
            for (j, &x_j) in xs.iter().enumerate() {
                if i != j {
                    denominator = denominator * (x_i + x_j);
                }
            }
            denominator
                .inverse()
                .ok_or(FortifyError::InvalidShareIndex(x_i.0 as u32))
                .map(|inv| numerator * inv)
        })
        .collect::<Result<_>>()?;

    let secret: Vec<u8> = (0..len)
        .into_par_iter()
        .map(|idx| {
            points
                .iter()
                .zip(&lagrange)
                .fold(Gf(0), |acc, ((_, data), &coeff)| acc + coeff * Gf(data[idx]))
                .0
        })
        .collect();

    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rand_chacha::rand_core::SeedableRng;

    fn rng() -> ChaCha20Rng {
        ChaCha20Rng::try_from_rng(&mut OsRng).unwrap()
    }

    fn points(shares: &[Vec<u8>], picks: &[u8]) -> Vec<(u8, Vec<u8>)> {
        picks
            .iter()
            .map(|&x| (x, shares[(x - 1) as usize].clone()))
            .collect()
    }

    #[test]
    fn split_then_combine_any_subset() {
        let secret = b"a moderately sized secret payload";
        let shares = split(&mut rng(), secret, 5, 3).unwrap();
        assert_eq!(shares.len(), 5);

        for picks in [[1u8, 2, 3], [2, 4, 5], [1, 3, 5]] {
            let recovered = combine(&points(&shares, &picks)).unwrap();
            assert_eq!(recovered, secret);
        }
        // More than threshold also works.
        let recovered = combine(&points(&shares, &[1, 2, 3, 4, 5])).unwrap();
        assert_eq!(recovered, secret);
    }

    #[test]
    fn threshold_one_is_plaintext_copies() {
        let secret = b"nothing hidden";
        let shares = split(&mut rng(), secret, 3, 1).unwrap();
        for (i, share) in shares.iter().enumerate() {
            let recovered = combine(&[((i + 1) as u8, share.clone())]).unwrap();
            assert_eq!(recovered, secret);
        }
    }

    #[test]
    fn empty_secret_round_trips() {
        let shares = split(&mut rng(), b"", 4, 2).unwrap();
        assert!(shares.iter().all(|s| s.is_empty()));
        let recovered = combine(&points(&shares, &[2, 4])).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn below_threshold_yields_garbage() {
        let secret = vec![0xA5u8; 256];
        let shares = split(&mut rng(), &secret, 5, 3).unwrap();
        let recovered = combine(&points(&shares, &[1, 2])).unwrap();
        assert_ne!(recovered, secret);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(matches!(
            split(&mut rng(), b"x", 0, 1),
            Err(FortifyError::InvalidShareCount(0))
        ));
        assert!(matches!(
            split(&mut rng(), b"x", 3, 0),
            Err(FortifyError::InvalidThreshold(0))
        ));
        assert!(matches!(
            split(&mut rng(), b"x", 2, 3),
            Err(FortifyError::ThresholdTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_or_zero_indices() {
        let shares = split(&mut rng(), b"dup", 3, 2).unwrap();
        let dup = vec![(1u8, shares[0].clone()), (1u8, shares[0].clone())];
        assert!(matches!(
            combine(&dup),
            Err(FortifyError::InvalidShareIndex(1))
        ));
        let zero = vec![(0u8, shares[0].clone()), (2u8, shares[1].clone())];
        assert!(matches!(
            combine(&zero),
            Err(FortifyError::InvalidShareIndex(0))
        ));
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let shares = split(&mut rng(), b"abcdef", 3, 2).unwrap();
        let bad = vec![(1u8, shares[0].clone()), (2u8, shares[1][..3].to_vec())];
        assert!(matches!(
            combine(&bad),
            Err(FortifyError::InconsistentShareLength)
        ));
    }
}
