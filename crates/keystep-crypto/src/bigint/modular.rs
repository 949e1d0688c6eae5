//! Modular exponentiation, inversion and square roots.

use super::{BigInt, BigIntError};

impl BigInt {
    /// `self = self^exp mod modulus` by left-to-right square-and-multiply.
    ///
    /// Negative exponents are rejected; invert the base first.
    pub fn powm(&mut self, exp: &Self, modulus: &Self) -> Result<(), BigIntError> {
        check_modulus(modulus)?;
        if exp.is_negative() {
            return Err(BigIntError::NegativeExponent);
        }

        let base = self.modulo(modulus)?;
        let mut acc = Self::one().modulo(modulus)?;
        for i in (0..exp.bit_len()).rev() {
            let square = acc.clone();
            acc.mul_mod(&square, Some(modulus))?;
            if exp.bit(i) {
                acc.mul_mod(&base, Some(modulus))?;
            }
        }
        *self = acc;
        Ok(())
    }

    /// `self = self^-1 mod modulus` by the extended Euclidean algorithm.
    pub fn invert(&mut self, modulus: &Self) -> Result<(), BigIntError> {
        check_modulus(modulus)?;

        let mut old_r = self.modulo(modulus)?;
        let mut r = modulus.clone();
        let mut old_s = Self::one();
        let mut s = Self::zero();
        while !r.is_zero() {
            let (quotient, rem) = old_r.divrem(&r)?;
            old_r = std::mem::replace(&mut r, rem);
            let next_s = &old_s - &(&quotient * &s);
            old_s = std::mem::replace(&mut s, next_s);
        }

        if !old_r.is_one() {
            return Err(BigIntError::ModularInverseDoesNotExist);
        }
        *self = old_s.modulo(modulus)?;
        Ok(())
    }

    /// Greatest common divisor of the magnitudes.
    pub fn gcd(a: &Self, b: &Self) -> Self {
        let mut x = a.abs();
        let mut y = b.abs();
        while !y.is_zero() {
            let Ok((_, rem)) = x.divrem(&y) else {
                unreachable!("divisor checked non-zero by loop condition");
            };
            x = std::mem::replace(&mut y, rem);
        }
        x
    }

    /// Square roots of `op` modulo the prime `p`, returned as `(p - r, r)`.
    ///
    /// `p` must be prime; this is not checked. Euler's criterion is applied to
    /// every non-zero input before any root is computed, so a non-residue
    /// always yields `NoSquareRootExists`. Zero has the single root zero.
    ///
    /// Primes `p ≡ 3 (mod 4)` take the single-exponentiation path. Other odd
    /// primes use Tonelli–Shanks with a non-residue found by linear search
    /// from 2; the search gives up once it reaches `p`, which only happens
    /// when `p` is not prime.
    pub fn sqrtm(op: &Self, p: &Self) -> Result<(Self, Self), BigIntError> {
        check_modulus(p)?;
        let a = op.modulo(p)?;
        if a.is_zero() {
            return Ok((Self::zero(), Self::zero()));
        }

        let p_minus_one = p - &Self::one();
        let half = p_minus_one.shr_bits(1);
        if !euler_criterion(&a, &half, p)? {
            return Err(BigIntError::NoSquareRootExists);
        }

        if *p == Self::from(2u32) {
            return Ok((a.clone(), a));
        }

        let root = if p.low_u64() & 3 == 3 {
            let mut root = a;
            root.powm(&(p + &Self::one()).shr_bits(2), p)?;
            root
        } else {
            tonelli_shanks(&a, p, &p_minus_one, &half)?
        };

        Ok((p - &root, root))
    }
}

fn check_modulus(modulus: &BigInt) -> Result<(), BigIntError> {
    if modulus.is_zero() {
        return Err(BigIntError::DivisionByZero);
    }
    if modulus.is_negative() {
        return Err(BigIntError::NonPositiveModulus);
    }
    Ok(())
}

/// True when `a^((p-1)/2) == 1 (mod p)`.
fn euler_criterion(a: &BigInt, half: &BigInt, p: &BigInt) -> Result<bool, BigIntError> {
    let mut symbol = a.clone();
    symbol.powm(half, p)?;
    Ok(symbol.is_one())
}

fn tonelli_shanks(
    a: &BigInt,
    p: &BigInt,
    p_minus_one: &BigInt,
    half: &BigInt,
) -> Result<BigInt, BigIntError> {
    // p - 1 = t * 2^s with t odd
    let mut s = 0usize;
    while !p_minus_one.bit(s) {
        s += 1;
    }
    let t = p_minus_one.shr_bits(s);

    let mut g = BigInt::from(2u32);
    loop {
        if g >= *p {
            return Err(BigIntError::NoSquareRootExists);
        }
        let mut symbol = g.clone();
        symbol.powm(half, p)?;
        if symbol == *p_minus_one {
            break;
        }
        g.add_mod(&BigInt::one(), None)?;
    }

    let mut g_inverse = g;
    g_inverse.invert(p)?;

    // a^t lies in the 2-Sylow subgroup generated by g^t; recover the
    // discrete log e of a^t bit by bit, bit 0 is known to be zero
    let mut e = BigInt::zero();
    for i in 1..s {
        let mut probe = g_inverse.clone();
        probe.powm(&e, p)?;
        probe.mul_mod(a, Some(p))?;
        probe.powm(&p_minus_one.shr_bits(i + 1), p)?;
        if !probe.is_one() {
            e.add_mod(&BigInt::one().shl_bits(i), None)?;
        }
    }

    // root = g^(-t*e/2) * a^((t+1)/2)
    let mut root = g_inverse;
    root.powm(&(&t * &e.shr_bits(1)), p)?;
    let mut a_part = a.clone();
    a_part.powm(&(&t + &BigInt::one()).shr_bits(1), p)?;
    root.mul_mod(&a_part, Some(p))?;
    Ok(root)
}
