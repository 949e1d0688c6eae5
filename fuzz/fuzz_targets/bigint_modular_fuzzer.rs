//! Fuzz target for modular BigInt arithmetic
//!
//! Checks algebraic identities against arbitrary operands:
//! - (a + b) - b == a (mod m)
//! - a * a^-1 == 1 (mod m) whenever the inverse exists
//! - both roots returned by sqrtm square back to a (mod p), for small primes

#![no_main]

use arbitrary::Arbitrary;
use keystep_crypto::BigInt;
use libfuzzer_sys::fuzz_target;

const SMALL_PRIMES: [u32; 8] = [3, 5, 7, 13, 17, 97, 65_537, 2_147_483_647];

#[derive(Debug, Arbitrary)]
struct Input {
    a: Vec<u8>,
    b: Vec<u8>,
    modulus: Vec<u8>,
    prime_index: u8,
}

fuzz_target!(|input: Input| {
    let a = BigInt::from_bytes_be(&input.a);
    let b = BigInt::from_bytes_be(&input.b);
    let modulus = BigInt::from_bytes_be(&input.modulus);

    if modulus.is_zero() {
        let mut sum = a.clone();
        assert!(sum.add_mod(&b, Some(&modulus)).is_err());
        return;
    }

    let a_mod = a.modulo(&modulus).unwrap();

    let mut value = a.clone();
    value.add_mod(&b, Some(&modulus)).unwrap();
    value.sub_mod(&b, Some(&modulus)).unwrap();
    assert_eq!(value, a_mod);

    let mut inverse = a.clone();
    if inverse.invert(&modulus).is_ok() && !modulus.is_one() {
        let mut product = a_mod.clone();
        product.mul_mod(&inverse, Some(&modulus)).unwrap();
        assert!(product.is_one());
    }

    let p = BigInt::from(SMALL_PRIMES[usize::from(input.prime_index) % SMALL_PRIMES.len()]);
    let square = a.modulo(&p).unwrap();
    if let Ok((r1, r2)) = BigInt::sqrtm(&square, &p) {
        for root in [r1, r2] {
            let mut check = root.clone();
            check.mul_mod(&root, Some(&p)).unwrap();
            assert_eq!(check, square);
        }
    }
});
