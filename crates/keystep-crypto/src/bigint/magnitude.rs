//! Unsigned limb-vector arithmetic.
//!
//! Magnitudes are little-endian `u32` limbs with no trailing zero limbs.
//! The empty slice is zero. Every function here accepts and returns
//! normalized magnitudes unless noted otherwise.

use std::cmp::Ordering;

const LIMB_BITS: u32 = 32;
const LIMB_BASE: u64 = 1 << LIMB_BITS;

pub(super) fn normalize(limbs: &mut Vec<u32>) {
    while limbs.last() == Some(&0) {
        limbs.pop();
    }
}

pub(super) fn cmp(a: &[u32], b: &[u32]) -> Ordering {
    if a.len() != b.len() {
        return a.len().cmp(&b.len());
    }
    for (x, y) in a.iter().rev().zip(b.iter().rev()) {
        if x != y {
            return x.cmp(y);
        }
    }
    Ordering::Equal
}

pub(super) fn bit_len(a: &[u32]) -> usize {
    match a.last() {
        None => 0,
        Some(top) => (a.len() - 1) * LIMB_BITS as usize + (LIMB_BITS - top.leading_zeros()) as usize,
    }
}

pub(super) fn bit(a: &[u32], index: usize) -> bool {
    a.get(index / LIMB_BITS as usize)
        .is_some_and(|limb| (limb >> (index % LIMB_BITS as usize)) & 1 == 1)
}

pub(super) fn add(a: &[u32], b: &[u32]) -> Vec<u32> {
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let mut out = Vec::with_capacity(long.len() + 1);
    let mut carry = 0u64;
    for (i, &x) in long.iter().enumerate() {
        let y = short.get(i).copied().unwrap_or(0);
        let sum = u64::from(x) + u64::from(y) + carry;
        out.push(sum as u32);
        carry = sum >> LIMB_BITS;
    }
    if carry != 0 {
        out.push(carry as u32);
    }
    out
}

/// `a - b`. Requires `a >= b`.
pub(super) fn sub(a: &[u32], b: &[u32]) -> Vec<u32> {
    debug_assert!(cmp(a, b) != Ordering::Less, "magnitude subtraction underflow");

    let mut out = Vec::with_capacity(a.len());
    let mut borrow = 0i64;
    for (i, &x) in a.iter().enumerate() {
        let y = b.get(i).copied().unwrap_or(0);
        let mut diff = i64::from(x) - i64::from(y) - borrow;
        if diff < 0 {
            diff += LIMB_BASE as i64;
            borrow = 1;
        } else {
            borrow = 0;
        }
        out.push(diff as u32);
    }
    normalize(&mut out);
    out
}

/// Schoolbook multiplication.
pub(super) fn mul(a: &[u32], b: &[u32]) -> Vec<u32> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }

    let mut out = vec![0u32; a.len() + b.len()];
    for (i, &x) in a.iter().enumerate() {
        let mut carry = 0u64;
        for (j, &y) in b.iter().enumerate() {
            // (2^32-1)^2 + 2*(2^32-1) == 2^64-1, so this never overflows
            let t = u64::from(x) * u64::from(y) + u64::from(out[i + j]) + carry;
            out[i + j] = t as u32;
            carry = t >> LIMB_BITS;
        }
        out[i + b.len()] = carry as u32;
    }
    normalize(&mut out);
    out
}

pub(super) fn shl(a: &[u32], bits: usize) -> Vec<u32> {
    if a.is_empty() {
        return Vec::new();
    }
    let limb_shift = bits / LIMB_BITS as usize;
    let bit_shift = (bits % LIMB_BITS as usize) as u32;

    let mut out = vec![0u32; limb_shift];
    out.reserve(a.len() + 1);
    let mut carry = 0u32;
    for &x in a {
        out.push((x << bit_shift) | carry);
        carry = if bit_shift == 0 { 0 } else { x >> (LIMB_BITS - bit_shift) };
    }
    if carry != 0 {
        out.push(carry);
    }
    out
}

pub(super) fn shr(a: &[u32], bits: usize) -> Vec<u32> {
    let limb_shift = bits / LIMB_BITS as usize;
    let bit_shift = (bits % LIMB_BITS as usize) as u32;
    if limb_shift >= a.len() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(a.len() - limb_shift);
    for i in limb_shift..a.len() {
        let low = a[i] >> bit_shift;
        let high = if bit_shift == 0 {
            0
        } else {
            a.get(i + 1).map_or(0, |&next| next << (LIMB_BITS - bit_shift))
        };
        out.push(low | high);
    }
    normalize(&mut out);
    out
}

/// Division by a single non-zero limb.
pub(super) fn divrem_limb(a: &[u32], divisor: u32) -> (Vec<u32>, u32) {
    debug_assert!(divisor != 0, "division by zero limb");

    let divisor = u64::from(divisor);
    let mut quotient = vec![0u32; a.len()];
    let mut rem = 0u64;
    for i in (0..a.len()).rev() {
        let current = (rem << LIMB_BITS) | u64::from(a[i]);
        quotient[i] = (current / divisor) as u32;
        rem = current % divisor;
    }
    normalize(&mut quotient);
    (quotient, rem as u32)
}

/// Long division (Knuth, TAOCP vol. 2, 4.3.1, Algorithm D).
///
/// Returns `(quotient, remainder)`. `v` must be non-empty.
pub(super) fn divrem(u: &[u32], v: &[u32]) -> (Vec<u32>, Vec<u32>) {
    debug_assert!(!v.is_empty(), "division by zero magnitude");

    if cmp(u, v) == Ordering::Less {
        return (Vec::new(), u.to_vec());
    }
    if v.len() == 1 {
        let (quotient, rem) = divrem_limb(u, v[0]);
        let mut rem = vec![rem];
        normalize(&mut rem);
        return (quotient, rem);
    }

    let n = v.len();
    let m = u.len();

    // D1: normalize so the divisor's top limb has its high bit set
    let shift = v[n - 1].leading_zeros();
    let vn = shifted_into(v, shift, n);
    let mut un = shifted_into(u, shift, m + 1);

    let top = u64::from(vn[n - 1]);
    let second = u64::from(vn[n - 2]);
    let mut quotient = vec![0u32; m - n + 1];

    for j in (0..=m - n).rev() {
        // D3: estimate the quotient limb
        let numerator = (u64::from(un[j + n]) << LIMB_BITS) | u64::from(un[j + n - 1]);
        let mut qhat = numerator / top;
        let mut rhat = numerator % top;
        while qhat >= LIMB_BASE || qhat * second > ((rhat << LIMB_BITS) | u64::from(un[j + n - 2]))
        {
            qhat -= 1;
            rhat += top;
            if rhat >= LIMB_BASE {
                break;
            }
        }

        // D4: multiply and subtract
        let mut borrow = 0i64;
        for i in 0..n {
            let product = qhat * u64::from(vn[i]);
            let t = i64::from(un[i + j]) - borrow - (product & 0xFFFF_FFFF) as i64;
            un[i + j] = t as u32;
            borrow = (product >> LIMB_BITS) as i64 - (t >> LIMB_BITS);
        }
        let t = i64::from(un[j + n]) - borrow;
        un[j + n] = t as u32;

        // D5/D6: the estimate was one too large, add the divisor back
        if t < 0 {
            qhat -= 1;
            let mut carry = 0u64;
            for i in 0..n {
                let sum = u64::from(un[i + j]) + u64::from(vn[i]) + carry;
                un[i + j] = sum as u32;
                carry = sum >> LIMB_BITS;
            }
            un[j + n] = un[j + n].wrapping_add(carry as u32);
        }
        quotient[j] = qhat as u32;
    }

    // D8: unnormalize the remainder
    let mut rem = vec![0u32; n];
    for i in 0..n {
        rem[i] = if shift == 0 {
            un[i]
        } else {
            (un[i] >> shift) | (un[i + 1] << (LIMB_BITS - shift))
        };
    }

    normalize(&mut quotient);
    normalize(&mut rem);
    (quotient, rem)
}

/// Left-shift by fewer than 32 bits into a buffer of exactly `len` limbs.
fn shifted_into(a: &[u32], shift: u32, len: usize) -> Vec<u32> {
    let mut out = vec![0u32; len];
    if shift == 0 {
        out[..a.len()].copy_from_slice(a);
        return out;
    }
    let mut carry = 0u32;
    for (i, &x) in a.iter().enumerate() {
        out[i] = (x << shift) | carry;
        carry = x >> (LIMB_BITS - shift);
    }
    if a.len() < len {
        out[a.len()] = carry;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_carries_across_limbs() {
        assert_eq!(add(&[u32::MAX, u32::MAX], &[1]), vec![0, 0, 1]);
    }

    #[test]
    fn sub_borrows_across_limbs() {
        assert_eq!(sub(&[0, 0, 1], &[1]), vec![u32::MAX, u32::MAX]);
        assert_eq!(sub(&[5], &[5]), Vec::<u32>::new());
    }

    #[test]
    fn mul_of_max_limbs() {
        // (2^32 - 1)^2 = 2^64 - 2^33 + 1
        assert_eq!(mul(&[u32::MAX], &[u32::MAX]), vec![1, u32::MAX - 1]);
    }

    #[test]
    fn shifts_cross_limb_boundaries() {
        assert_eq!(shl(&[1], 32), vec![0, 1]);
        assert_eq!(shl(&[0x8000_0000], 1), vec![0, 1]);
        assert_eq!(shr(&[0, 1], 1), vec![0x8000_0000]);
        assert_eq!(shr(&[1], 1), Vec::<u32>::new());
    }

    #[test]
    fn divrem_reconstructs_dividend() {
        let u = [0x0000_0000, 0x0000_0000, 0x8000_0000, 0x7FFF_FFFF];
        let v = [0x0000_0001, 0x0000_0000, 0x8000_0000];
        let (q, r) = divrem(&u, &v);
        let mut back = add(&mul(&q, &v), &r);
        normalize(&mut back);
        assert_eq!(back, u.to_vec());
        assert_eq!(cmp(&r, &v), Ordering::Less);
    }

    #[test]
    fn divrem_with_unshifted_divisor() {
        let u = [1, 2, 3, 4];
        let v = [5, 0x8000_0000];
        let (q, r) = divrem(&u, &v);
        let back = add(&mul(&q, &v), &r);
        assert_eq!(back, u.to_vec());
        assert_eq!(cmp(&r, &v), Ordering::Less);
    }

    #[test]
    fn bit_len_of_values() {
        assert_eq!(bit_len(&[]), 0);
        assert_eq!(bit_len(&[1]), 1);
        assert_eq!(bit_len(&[0, 1]), 33);
        assert!(bit(&[0, 1], 32));
        assert!(!bit(&[0, 1], 31));
    }
}
