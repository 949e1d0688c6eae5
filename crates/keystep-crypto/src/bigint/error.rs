//! Big-integer error types

use thiserror::Error;

/// Errors from big-integer arithmetic and encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BigIntError {
    /// A fixed-width encoding was requested that cannot hold the value.
    #[error("insufficient number of bytes: value needs {needed}, buffer holds {available}")]
    InsufficientNumberOfBytes {
        /// Minimal big-endian size of the value
        needed: usize,
        /// Requested output size
        available: usize,
    },

    /// Negative values have no unsigned byte encoding.
    #[error("cannot encode a negative big integer")]
    CannotEncodeNegativeBigInt,

    /// Division or reduction by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// Modular operations require a strictly positive modulus.
    #[error("modulus must be positive")]
    NonPositiveModulus,

    /// `powm` was given a negative exponent; invert first.
    #[error("negative exponent")]
    NegativeExponent,

    /// The value shares a factor with the modulus.
    #[error("modular inverse does not exist")]
    ModularInverseDoesNotExist,

    /// The value is not a quadratic residue modulo the given prime.
    #[error("no square root exists")]
    NoSquareRootExists,

    /// Hexadecimal parsing failed.
    #[error("invalid hex digit {0:?}")]
    InvalidHexDigit(char),
}
