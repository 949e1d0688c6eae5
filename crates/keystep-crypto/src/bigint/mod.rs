//! Arbitrary-precision signed integers with modular arithmetic.
//!
//! [`BigInt`] stores a sign flag and a normalized little-endian magnitude of
//! 32-bit limbs. Zero is never negative, so the derived equality and hashing
//! agree with numeric equality.
//!
//! Modular operations mutate the receiver in place: each result is computed
//! into a fresh buffer and then swapped in, so an operand may alias the
//! receiver's previous value without corrupting the result.

mod error;
mod magnitude;
mod modular;

use std::{
    cmp::Ordering,
    fmt,
    ops::{Add, Mul, Neg, Sub},
};

pub use error::BigIntError;

/// A signed arbitrary-precision integer.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct BigInt {
    negative: bool,
    limbs: Vec<u32>,
}

impl BigInt {
    /// Zero.
    pub fn zero() -> Self {
        Self::default()
    }

    /// One.
    pub fn one() -> Self {
        Self::from(1u32)
    }

    fn from_parts(negative: bool, mut limbs: Vec<u32>) -> Self {
        magnitude::normalize(&mut limbs);
        let negative = negative && !limbs.is_empty();
        Self { negative, limbs }
    }

    /// Interpret big-endian bytes as a non-negative integer.
    pub fn from_bytes_be(bytes: &[u8]) -> Self {
        let mut limbs = Vec::with_capacity(bytes.len().div_ceil(4));
        for chunk in bytes.rchunks(4) {
            let mut limb = 0u32;
            for &byte in chunk {
                limb = (limb << 8) | u32::from(byte);
            }
            limbs.push(limb);
        }
        Self::from_parts(false, limbs)
    }

    /// Parse a hexadecimal string with optional leading `-` and `0x`.
    pub fn from_hex(text: &str) -> Result<Self, BigIntError> {
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let digits = digits.strip_prefix("0x").unwrap_or(digits);

        let mut limbs = Vec::with_capacity(digits.len().div_ceil(8));
        let chars: Vec<char> = digits.chars().filter(|c| *c != '_').collect();
        for chunk in chars.rchunks(8) {
            let mut limb = 0u32;
            for &c in chunk {
                let digit = c.to_digit(16).ok_or(BigIntError::InvalidHexDigit(c))?;
                limb = (limb << 4) | digit;
            }
            limbs.push(limb);
        }
        Ok(Self::from_parts(negative, limbs))
    }

    /// Fixed-width big-endian encoding, left-padded with zeros.
    ///
    /// # Errors
    ///
    /// - `CannotEncodeNegativeBigInt` for negative values
    /// - `InsufficientNumberOfBytes` if the value does not fit in `len`
    pub fn to_bytes_be(&self, len: usize) -> Result<Vec<u8>, BigIntError> {
        if self.negative {
            return Err(BigIntError::CannotEncodeNegativeBigInt);
        }
        let needed = self.byte_size();
        if needed > len {
            return Err(BigIntError::InsufficientNumberOfBytes { needed, available: len });
        }

        let mut out = vec![0u8; len];
        for (i, byte) in out.iter_mut().rev().take(needed).enumerate() {
            *byte = (self.limbs[i / 4] >> (8 * (i % 4))) as u8;
        }
        Ok(out)
    }

    /// Minimal big-endian encoding. Zero encodes to an empty vector.
    pub fn to_bytes_be_minimal(&self) -> Result<Vec<u8>, BigIntError> {
        self.to_bytes_be(self.byte_size())
    }

    /// Number of bytes in the minimal big-endian encoding of the magnitude.
    pub fn byte_size(&self) -> usize {
        self.bit_len().div_ceil(8)
    }

    /// Number of significant bits in the magnitude.
    pub fn bit_len(&self) -> usize {
        magnitude::bit_len(&self.limbs)
    }

    /// Bit `index` of the magnitude (bit 0 is least significant).
    pub fn bit(&self, index: usize) -> bool {
        magnitude::bit(&self.limbs, index)
    }

    /// True for zero.
    pub fn is_zero(&self) -> bool {
        self.limbs.is_empty()
    }

    /// True for one.
    pub fn is_one(&self) -> bool {
        !self.negative && self.limbs == [1]
    }

    /// True for values strictly below zero.
    pub fn is_negative(&self) -> bool {
        self.negative
    }

    /// True for even values (including zero).
    pub fn is_even(&self) -> bool {
        !self.bit(0)
    }

    /// Absolute value.
    pub fn abs(&self) -> Self {
        Self { negative: false, limbs: self.limbs.clone() }
    }

    /// Low 64 bits of the magnitude.
    pub fn low_u64(&self) -> u64 {
        let low = self.limbs.first().copied().unwrap_or(0);
        let high = self.limbs.get(1).copied().unwrap_or(0);
        (u64::from(high) << 32) | u64::from(low)
    }

    /// Shift the magnitude left, keeping the sign.
    pub fn shl_bits(&self, bits: usize) -> Self {
        Self::from_parts(self.negative, magnitude::shl(&self.limbs, bits))
    }

    /// Shift the magnitude right, keeping the sign (rounds toward zero).
    pub fn shr_bits(&self, bits: usize) -> Self {
        Self::from_parts(self.negative, magnitude::shr(&self.limbs, bits))
    }

    /// Truncated division: the quotient rounds toward zero and the remainder
    /// takes the sign of the dividend.
    pub fn divrem(&self, divisor: &Self) -> Result<(Self, Self), BigIntError> {
        if divisor.is_zero() {
            return Err(BigIntError::DivisionByZero);
        }
        let (quotient, rem) = magnitude::divrem(&self.limbs, &divisor.limbs);
        Ok((
            Self::from_parts(self.negative != divisor.negative, quotient),
            Self::from_parts(self.negative, rem),
        ))
    }

    /// Floored modulo: for a positive modulus the result lies in `[0, modulus)`.
    pub fn modulo(&self, modulus: &Self) -> Result<Self, BigIntError> {
        let (_, rem) = self.divrem(modulus)?;
        if !rem.is_zero() && rem.negative != modulus.negative {
            return Ok(&rem + modulus);
        }
        Ok(rem)
    }

    /// `self = self + op`, reduced when a modulus is given.
    pub fn add_mod(&mut self, op: &Self, modulus: Option<&Self>) -> Result<(), BigIntError> {
        let sum = &*self + op;
        *self = reduce_optional(sum, modulus)?;
        Ok(())
    }

    /// `self = self - op`, reduced when a modulus is given.
    pub fn sub_mod(&mut self, op: &Self, modulus: Option<&Self>) -> Result<(), BigIntError> {
        let difference = &*self - op;
        *self = reduce_optional(difference, modulus)?;
        Ok(())
    }

    /// `self = self * op`, reduced when a modulus is given.
    pub fn mul_mod(&mut self, op: &Self, modulus: Option<&Self>) -> Result<(), BigIntError> {
        let product = &*self * op;
        *self = reduce_optional(product, modulus)?;
        Ok(())
    }

    fn add_signed(&self, other_negative: bool, other: &[u32]) -> Self {
        if self.negative == other_negative {
            return Self::from_parts(self.negative, magnitude::add(&self.limbs, other));
        }
        match magnitude::cmp(&self.limbs, other) {
            Ordering::Equal => Self::zero(),
            Ordering::Greater => Self::from_parts(self.negative, magnitude::sub(&self.limbs, other)),
            Ordering::Less => Self::from_parts(other_negative, magnitude::sub(other, &self.limbs)),
        }
    }
}

fn reduce_optional(value: BigInt, modulus: Option<&BigInt>) -> Result<BigInt, BigIntError> {
    match modulus {
        Some(modulus) => value.modulo(modulus),
        None => Ok(value),
    }
}

impl From<u32> for BigInt {
    fn from(value: u32) -> Self {
        Self::from_parts(false, vec![value])
    }
}

impl From<u64> for BigInt {
    fn from(value: u64) -> Self {
        Self::from_parts(false, vec![value as u32, (value >> 32) as u32])
    }
}

impl From<i64> for BigInt {
    fn from(value: i64) -> Self {
        let magnitude = value.unsigned_abs();
        Self::from_parts(value < 0, vec![magnitude as u32, (magnitude >> 32) as u32])
    }
}

impl Ord for BigInt {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.negative, other.negative) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => magnitude::cmp(&self.limbs, &other.limbs),
            (true, true) => magnitude::cmp(&other.limbs, &self.limbs),
        }
    }
}

impl PartialOrd for BigInt {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add for &BigInt {
    type Output = BigInt;

    fn add(self, rhs: Self) -> BigInt {
        self.add_signed(rhs.negative, &rhs.limbs)
    }
}

impl Sub for &BigInt {
    type Output = BigInt;

    fn sub(self, rhs: Self) -> BigInt {
        self.add_signed(!rhs.negative, &rhs.limbs)
    }
}

impl Mul for &BigInt {
    type Output = BigInt;

    fn mul(self, rhs: Self) -> BigInt {
        BigInt::from_parts(self.negative != rhs.negative, magnitude::mul(&self.limbs, &rhs.limbs))
    }
}

impl Neg for &BigInt {
    type Output = BigInt;

    fn neg(self) -> BigInt {
        BigInt::from_parts(!self.negative, self.limbs.clone())
    }
}

impl fmt::LowerHex for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            f.write_str("-")?;
        }
        match self.limbs.split_last() {
            None => f.write_str("0"),
            Some((top, rest)) => {
                write!(f, "{top:x}")?;
                for limb in rest.iter().rev() {
                    write!(f, "{limb:08x}")?;
                }
                Ok(())
            },
        }
    }
}

impl fmt::Display for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const CHUNK: u32 = 1_000_000_000;

        if self.is_zero() {
            return f.write_str("0");
        }

        let mut chunks = Vec::new();
        let mut rest = self.limbs.clone();
        while !rest.is_empty() {
            let (quotient, rem) = magnitude::divrem_limb(&rest, CHUNK);
            chunks.push(rem);
            rest = quotient;
        }

        if self.negative {
            f.write_str("-")?;
        }
        if let Some((first, others)) = chunks.split_last() {
            write!(f, "{first}")?;
            for chunk in others.iter().rev() {
                write!(f, "{chunk:09}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BigInt(0x{self:x})")
    }
}
