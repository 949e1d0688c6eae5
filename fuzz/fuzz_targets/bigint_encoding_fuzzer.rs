//! Fuzz target for BigInt byte and hex parsing
//!
//! - Byte parsing never fails and re-encodes to the input minus leading zeros
//! - Hex parsing rejects bad digits with an error, never a panic
//! - Fixed-width encoding fails exactly when the value does not fit

#![no_main]

use arbitrary::Arbitrary;
use keystep_crypto::BigInt;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    bytes: Vec<u8>,
    hex: String,
    width: u8,
}

fuzz_target!(|input: Input| {
    let value = BigInt::from_bytes_be(&input.bytes);
    let first_nonzero = input.bytes.iter().position(|&b| b != 0).unwrap_or(input.bytes.len());
    let minimal = value.to_bytes_be_minimal().unwrap();
    assert_eq!(minimal, &input.bytes[first_nonzero..]);

    let width = usize::from(input.width);
    match value.to_bytes_be(width) {
        Ok(padded) => {
            assert!(minimal.len() <= width);
            assert_eq!(padded.len(), width);
            assert_eq!(&padded[width - minimal.len()..], minimal.as_slice());
        },
        Err(_) => assert!(minimal.len() > width),
    }

    if let Ok(parsed) = BigInt::from_hex(&input.hex) {
        if !parsed.is_negative() {
            let bytes = parsed.to_bytes_be_minimal().unwrap();
            assert_eq!(BigInt::from_bytes_be(&bytes), parsed);
        }
    }
});
