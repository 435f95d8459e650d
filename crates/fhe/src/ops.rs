//! Homomorphic operations available to contract code.

use clearing_types::{Address, EncryptedBool, EncryptedInput, EncryptedU64, Handle, InputProof};

use crate::error::FheError;

/// Operations over encrypted 64-bit integers and booleans.
///
/// Integer arithmetic wraps modulo 2^64. Every operation produces a fresh
/// handle; inputs are never mutated.
pub trait FheOps {
    /// Encrypt a public constant.
    fn trivial_encrypt(&mut self, value: u64) -> EncryptedU64;

    /// Encrypt a public boolean constant.
    fn trivial_encrypt_bool(&mut self, value: bool) -> EncryptedBool;

    /// Accept user-supplied ciphertexts after checking the proof binds them to
    /// `contract` and `user`.
    fn verify_inputs(
        &mut self,
        inputs: &[EncryptedInput],
        proof: &InputProof,
        contract: &Address,
        user: &Address,
    ) -> Result<Vec<EncryptedU64>, FheError>;

    fn add(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedU64, FheError>;

    fn sub(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedU64, FheError>;

    fn mul(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedU64, FheError>;

    /// Wrapping product together with an encrypted overflow flag.
    fn overflowing_mul(
        &mut self,
        a: EncryptedU64,
        b: EncryptedU64,
    ) -> Result<(EncryptedU64, EncryptedBool), FheError>;

    /// Multiply by a public scalar.
    fn mul_plain(&mut self, a: EncryptedU64, scalar: u64) -> Result<EncryptedU64, FheError>;

    fn eq(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedBool, FheError>;

    fn ge(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedBool, FheError>;

    fn gt(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedBool, FheError>;

    fn lt(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedBool, FheError>;

    fn and(&mut self, a: EncryptedBool, b: EncryptedBool) -> Result<EncryptedBool, FheError>;

    fn or(&mut self, a: EncryptedBool, b: EncryptedBool) -> Result<EncryptedBool, FheError>;

    fn not(&mut self, a: EncryptedBool) -> Result<EncryptedBool, FheError>;

    /// `cond ? a : b`, evaluated without revealing `cond`.
    fn select(
        &mut self,
        cond: EncryptedBool,
        a: EncryptedU64,
        b: EncryptedU64,
    ) -> Result<EncryptedU64, FheError>;

    fn select_bool(
        &mut self,
        cond: EncryptedBool,
        a: EncryptedBool,
        b: EncryptedBool,
    ) -> Result<EncryptedBool, FheError>;

    /// Grant `account` a private view of `handle`.
    fn allow(&mut self, handle: Handle, account: &Address) -> Result<(), FheError>;

    /// Mark `handle` as publicly decryptable by the oracle.
    fn allow_for_decryption(&mut self, handle: Handle) -> Result<(), FheError>;

    /// Wrapping sum together with an encrypted overflow flag.
    ///
    /// An unsigned sum wrapped exactly when it is smaller than an operand.
    fn overflowing_add(
        &mut self,
        a: EncryptedU64,
        b: EncryptedU64,
    ) -> Result<(EncryptedU64, EncryptedBool), FheError> {
        let sum = self.add(a, b)?;
        let wrapped = self.lt(sum, a)?;
        Ok((sum, wrapped))
    }

    /// Sum clamped to `u64::MAX`.
    fn saturating_add(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedU64, FheError> {
        let (sum, wrapped) = self.overflowing_add(a, b)?;
        let max = self.trivial_encrypt(u64::MAX);
        self.select(wrapped, max, sum)
    }

    /// Encrypted minimum of `a` and `b`.
    fn min(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedU64, FheError> {
        let a_lower = self.lt(a, b)?;
        self.select(a_lower, a, b)
    }
}
