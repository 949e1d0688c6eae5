//! Edwards25519 group arithmetic over [`BigInt`].
//!
//! The curve is `-x^2 + y^2 = 1 + d*x^2*y^2` over `p = 2^255 - 19`. Points
//! are kept in extended coordinates `(X:Y:Z:T)` with `x = X/Z`, `y = Y/Z`
//! and `T = XY/Z`, which gives a single complete addition formula.
//!
//! Curve constants are derived rather than transcribed: `d = -121665/121666`,
//! the base point has `y = 4/5` and even `x`.
//!
//! Compressed encoding is 32 bytes: `y` big-endian with the parity of `x` in
//! the top bit of the first byte.

use std::sync::LazyLock;

use crate::{
    bigint::{BigInt, BigIntError},
    error::CryptoError,
};

/// Size of a compressed point.
pub const POINT_SIZE: usize = 32;

/// Size of an encoded scalar.
pub const SCALAR_SIZE: usize = 32;

const GROUP_ORDER_HEX: &str = "1000000000000000000000000000000014def9dea2f79cd65812631a5cf5d3ed";

struct Curve {
    p: BigInt,
    d: BigInt,
    two_d: BigInt,
    order: BigInt,
    base: EdwardsPoint,
}

static CURVE: LazyLock<Curve> = LazyLock::new(build_curve);

fn build_curve() -> Curve {
    let p = &BigInt::one().shl_bits(255) - &BigInt::from(19u32);

    let Ok(d) = ratio(&-&BigInt::from(121_665u32), &BigInt::from(121_666u32), &p) else {
        unreachable!("121666 is invertible modulo a prime");
    };
    let Ok(two_d) = (&d + &d).modulo(&p) else {
        unreachable!("field prime is non-zero");
    };
    let Ok(order) = BigInt::from_hex(GROUP_ORDER_HEX) else {
        unreachable!("group order constant is valid hex");
    };
    let Ok(base_y) = ratio(&BigInt::from(4u32), &BigInt::from(5u32), &p) else {
        unreachable!("5 is invertible modulo a prime");
    };
    let Ok(base_x) = recover_x(&base_y, false, &p, &d) else {
        unreachable!("y = 4/5 lies on the curve");
    };

    let base = EdwardsPoint::from_affine_unchecked(base_x, base_y, &p);
    Curve { p, d, two_d, order, base }
}

fn ratio(numerator: &BigInt, denominator: &BigInt, p: &BigInt) -> Result<BigInt, BigIntError> {
    let mut inverse = denominator.clone();
    inverse.invert(p)?;
    let mut value = numerator.modulo(p)?;
    value.mul_mod(&inverse, Some(p))?;
    Ok(value)
}

/// Solve `x^2 = (y^2 - 1) / (d*y^2 + 1)` and pick the root with the given
/// parity.
fn recover_x(y: &BigInt, odd: bool, p: &BigInt, d: &BigInt) -> Result<BigInt, CryptoError> {
    let mut y2 = y.clone();
    y2.mul_mod(y, Some(p))?;

    let mut u = y2.clone();
    u.sub_mod(&BigInt::one(), Some(p))?;
    let mut v = y2;
    v.mul_mod(d, Some(p))?;
    v.add_mod(&BigInt::one(), Some(p))?;

    let x2 = ratio(&u, &v, p)?;
    if x2.is_zero() {
        if odd {
            return Err(CryptoError::InvalidPoint);
        }
        return Ok(BigInt::zero());
    }

    let (r1, r2) = BigInt::sqrtm(&x2, p).map_err(|err| match err {
        BigIntError::NoSquareRootExists => CryptoError::InvalidPoint,
        other => CryptoError::BigInt(other),
    })?;
    Ok(if r1.bit(0) == odd { r1 } else { r2 })
}

fn field_mul(a: &BigInt, b: &BigInt) -> BigInt {
    let Ok(value) = (a * b).modulo(&CURVE.p) else {
        unreachable!("field prime is non-zero");
    };
    value
}

fn field_add(a: &BigInt, b: &BigInt) -> BigInt {
    let Ok(value) = (a + b).modulo(&CURVE.p) else {
        unreachable!("field prime is non-zero");
    };
    value
}

fn field_sub(a: &BigInt, b: &BigInt) -> BigInt {
    let Ok(value) = (a - b).modulo(&CURVE.p) else {
        unreachable!("field prime is non-zero");
    };
    value
}

/// A point on Edwards25519 in extended coordinates.
#[derive(Clone, Debug)]
pub struct EdwardsPoint {
    x: BigInt,
    y: BigInt,
    z: BigInt,
    t: BigInt,
}

impl EdwardsPoint {
    /// The neutral element `(0, 1)`.
    pub fn identity() -> Self {
        Self { x: BigInt::zero(), y: BigInt::one(), z: BigInt::one(), t: BigInt::zero() }
    }

    /// The standard base point.
    pub fn base() -> Self {
        CURVE.base.clone()
    }

    fn from_affine_unchecked(x: BigInt, y: BigInt, p: &BigInt) -> Self {
        let Ok(t) = (&x * &y).modulo(p) else {
            unreachable!("field prime is non-zero");
        };
        Self { x, y, z: BigInt::one(), t }
    }

    /// Complete addition (add-2008-hwcd-3, a = -1).
    pub fn add(&self, other: &Self) -> Self {
        let a = field_mul(&field_sub(&self.y, &self.x), &field_sub(&other.y, &other.x));
        let b = field_mul(&field_add(&self.y, &self.x), &field_add(&other.y, &other.x));
        let c = field_mul(&field_mul(&self.t, &CURVE.two_d), &other.t);
        let d = field_mul(&field_add(&self.z, &self.z), &other.z);

        let e = field_sub(&b, &a);
        let f = field_sub(&d, &c);
        let g = field_add(&d, &c);
        let h = field_add(&b, &a);

        Self { x: field_mul(&e, &f), y: field_mul(&g, &h), z: field_mul(&f, &g), t: field_mul(&e, &h) }
    }

    /// Point doubling via the complete addition formula.
    pub fn double(&self) -> Self {
        self.add(self)
    }

    /// Scalar multiplication, most significant bit first.
    pub fn mul(&self, scalar: &Scalar) -> Self {
        let mut acc = Self::identity();
        for i in (0..scalar.0.bit_len()).rev() {
            acc = acc.double();
            if scalar.0.bit(i) {
                acc = acc.add(self);
            }
        }
        acc
    }

    /// Affine `(x, y)`.
    pub fn to_affine(&self) -> (BigInt, BigInt) {
        let mut z_inverse = self.z.clone();
        let Ok(()) = z_inverse.invert(&CURVE.p) else {
            unreachable!("Z is non-zero for every point produced by the complete formula");
        };
        (field_mul(&self.x, &z_inverse), field_mul(&self.y, &z_inverse))
    }

    /// True for the neutral element.
    pub fn is_identity(&self) -> bool {
        self.x.is_zero() && self.y == self.z
    }

    /// True if the point lies in the torsion subgroup, i.e. `8 * P` is the
    /// neutral element.
    pub fn is_small_order(&self) -> bool {
        self.double().double().double().is_identity()
    }

    /// Compressed 32-byte encoding.
    pub fn compress(&self) -> [u8; POINT_SIZE] {
        let (x, y) = self.to_affine();
        let Ok(bytes) = y.to_bytes_be(POINT_SIZE) else {
            unreachable!("reduced field elements fit in 255 bits");
        };
        let mut out = [0u8; POINT_SIZE];
        out.copy_from_slice(&bytes);
        if x.bit(0) {
            out[0] |= 0x80;
        }
        out
    }

    /// Decode a compressed point.
    ///
    /// # Errors
    ///
    /// - `InvalidPoint` if `y` is not reduced or no `x` exists for it
    pub fn decompress(bytes: &[u8; POINT_SIZE]) -> Result<Self, CryptoError> {
        let curve = &*CURVE;
        let odd = bytes[0] & 0x80 != 0;
        let mut y_bytes = *bytes;
        y_bytes[0] &= 0x7F;

        let y = BigInt::from_bytes_be(&y_bytes);
        if y >= curve.p {
            return Err(CryptoError::InvalidPoint);
        }
        let x = recover_x(&y, odd, &curve.p, &curve.d)?;
        Ok(Self::from_affine_unchecked(x, y, &curve.p))
    }
}

impl PartialEq for EdwardsPoint {
    fn eq(&self, other: &Self) -> bool {
        // X1*Z2 == X2*Z1 and Y1*Z2 == Y2*Z1
        field_mul(&self.x, &other.z) == field_mul(&other.x, &self.z)
            && field_mul(&self.y, &other.z) == field_mul(&other.y, &self.z)
    }
}

impl Eq for EdwardsPoint {}

/// An integer modulo the prime group order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scalar(BigInt);

impl Scalar {
    /// Reduce big-endian bytes modulo the group order.
    pub fn from_bytes_mod_order(bytes: &[u8]) -> Self {
        let Ok(value) = BigInt::from_bytes_be(bytes).modulo(&CURVE.order) else {
            unreachable!("group order is non-zero");
        };
        Self(value)
    }

    /// A scalar in `[1, order)` derived from uniform random bytes.
    ///
    /// At least 48 bytes should be given to keep the reduction bias negligible.
    pub fn from_random_nonzero(bytes: &[u8]) -> Self {
        let order_minus_one = &CURVE.order - &BigInt::one();
        let Ok(mut value) = BigInt::from_bytes_be(bytes).modulo(&order_minus_one) else {
            unreachable!("group order exceeds one");
        };
        let Ok(()) = value.add_mod(&BigInt::one(), None) else {
            unreachable!("addition without modulus cannot fail");
        };
        Self(value)
    }

    /// Decode a canonical scalar.
    ///
    /// # Errors
    ///
    /// - `InvalidPrivateKey` if the value is zero or not below the group order
    pub fn from_canonical_bytes(bytes: &[u8; SCALAR_SIZE]) -> Result<Self, CryptoError> {
        let value = BigInt::from_bytes_be(bytes);
        if value.is_zero() || value >= CURVE.order {
            return Err(CryptoError::InvalidPrivateKey);
        }
        Ok(Self(value))
    }

    /// Big-endian 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; SCALAR_SIZE] {
        let Ok(bytes) = self.0.to_bytes_be(SCALAR_SIZE) else {
            unreachable!("scalars are reduced below a 253-bit order");
        };
        let mut out = [0u8; SCALAR_SIZE];
        out.copy_from_slice(&bytes);
        out
    }

    /// The group order as a big integer.
    pub fn group_order() -> BigInt {
        CURVE.order.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on_curve(point: &EdwardsPoint) -> bool {
        // -x^2 + y^2 == 1 + d x^2 y^2
        let (x, y) = point.to_affine();
        let x2 = field_mul(&x, &x);
        let y2 = field_mul(&y, &y);
        let lhs = field_sub(&y2, &x2);
        let rhs = field_add(&BigInt::one(), &field_mul(&CURVE.d, &field_mul(&x2, &y2)));
        lhs == rhs
    }

    #[test]
    fn base_point_matches_published_coordinates() {
        let (x, y) = EdwardsPoint::base().to_affine();
        assert_eq!(
            x,
            BigInt::from_hex("216936d3cd6e53fec0a4e231fdd6dc5c692cc7609525a7b2c9562d608f25d51a")
                .unwrap()
        );
        assert_eq!(
            y,
            BigInt::from_hex("6666666666666666666666666666666666666666666666666666666666666658")
                .unwrap()
        );
    }

    #[test]
    fn base_point_is_on_curve() {
        assert!(on_curve(&EdwardsPoint::base()));
        assert!(on_curve(&EdwardsPoint::base().double()));
    }

    #[test]
    fn identity_is_neutral() {
        let base = EdwardsPoint::base();
        assert_eq!(base.add(&EdwardsPoint::identity()), base);
        assert!(EdwardsPoint::identity().is_identity());
    }

    #[test]
    fn order_times_base_is_identity() {
        let order = Scalar(Scalar::group_order());
        assert!(EdwardsPoint::base().mul(&order).is_identity());
    }

    #[test]
    fn scalar_multiplication_distributes() {
        let a = Scalar::from_bytes_mod_order(&[7]);
        let b = Scalar::from_bytes_mod_order(&[11]);
        let sum = Scalar::from_bytes_mod_order(&[18]);
        let base = EdwardsPoint::base();
        assert_eq!(base.mul(&a).add(&base.mul(&b)), base.mul(&sum));
    }

    #[test]
    fn compression_roundtrip_of_multiples() {
        let base = EdwardsPoint::base();
        let mut point = base.clone();
        for _ in 0..4 {
            let decoded = EdwardsPoint::decompress(&point.compress()).unwrap();
            assert_eq!(decoded, point);
            point = point.add(&base);
        }
    }

    #[test]
    fn decompress_rejects_unreduced_y() {
        // y = 2^255 - 1 is above the field prime
        let bytes = [0xFF; POINT_SIZE];
        assert!(matches!(EdwardsPoint::decompress(&bytes), Err(CryptoError::InvalidPoint)));
    }

    #[test]
    fn decompress_rejects_odd_zero_x() {
        // y = 1 gives x = 0, which has no odd representative
        let mut bytes = [0u8; POINT_SIZE];
        bytes[POINT_SIZE - 1] = 1;
        bytes[0] |= 0x80;
        assert!(matches!(EdwardsPoint::decompress(&bytes), Err(CryptoError::InvalidPoint)));

        bytes[0] &= 0x7F;
        assert!(EdwardsPoint::decompress(&bytes).unwrap().is_identity());
    }

    #[test]
    fn torsion_points_have_small_order() {
        // y = 0 gives x = sqrt(-1), a point of order 4
        let order_four = EdwardsPoint::decompress(&[0u8; POINT_SIZE]).unwrap();
        assert!(!order_four.double().is_identity());
        assert!(order_four.is_small_order());

        // (0, -1) has order 2
        let minus_one = (&CURVE.p - &BigInt::one()).to_bytes_be(POINT_SIZE).unwrap();
        let mut bytes = [0u8; POINT_SIZE];
        bytes.copy_from_slice(&minus_one);
        let order_two = EdwardsPoint::decompress(&bytes).unwrap();
        assert!(order_two.double().is_identity());
        assert!(order_two.is_small_order());

        assert!(EdwardsPoint::identity().is_small_order());
        assert!(!EdwardsPoint::base().is_small_order());
        assert!(!order_two.add(&EdwardsPoint::base()).is_small_order());
    }

    #[test]
    fn scalar_canonical_decoding() {
        assert!(matches!(
            Scalar::from_canonical_bytes(&[0u8; SCALAR_SIZE]),
            Err(CryptoError::InvalidPrivateKey)
        ));
        let order_bytes = Scalar::group_order().to_bytes_be(SCALAR_SIZE).unwrap();
        let mut encoded = [0u8; SCALAR_SIZE];
        encoded.copy_from_slice(&order_bytes);
        assert!(matches!(Scalar::from_canonical_bytes(&encoded), Err(CryptoError::InvalidPrivateKey)));

        let scalar = Scalar::from_random_nonzero(&[0xAB; 64]);
        assert_eq!(Scalar::from_canonical_bytes(&scalar.to_bytes()).unwrap(), scalar);
    }
}
