//! In-memory FHE coprocessor.
//!
//! Plaintexts live in a store shared between the [`MockCoprocessor`] handed to
//! contract code and the [`KeyHolder`] handed to the decryption oracle. Contract
//! code can only reach plaintexts through the [`FheOps`] interface.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use clearing_types::{
    Address, EncryptedBool, EncryptedInput, EncryptedU64, FheType, Handle, InputProof,
    PlaintextValue,
};
use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::FheError;
use crate::ops::FheOps;

#[derive(Debug, Default)]
struct CiphertextStore {
    values: HashMap<Handle, PlaintextValue>,
    /// Accounts granted a private view of each handle
    acl: HashMap<Handle, HashSet<Address>>,
    /// Handles the oracle is allowed to reveal
    decryptable: HashSet<Handle>,
    next_index: u64,
    ops_executed: u64,
}

impl CiphertextStore {
    fn insert(&mut self, value: PlaintextValue) -> Handle {
        let mut hasher = Sha256::new();
        hasher.update(b"FHE_HANDLE_V1:");
        hasher.update(self.next_index.to_le_bytes());
        hasher.update([value.fhe_type() as u8]);
        self.next_index += 1;

        let handle = Handle(hasher.finalize().into());
        self.values.insert(handle, value);
        handle
    }

    fn get(&self, handle: Handle) -> Result<PlaintextValue, FheError> {
        self.values
            .get(&handle)
            .copied()
            .ok_or(FheError::UnknownHandle(handle))
    }

    fn get_u64(&self, handle: Handle) -> Result<u64, FheError> {
        match self.get(handle)? {
            PlaintextValue::Uint64(v) => Ok(v),
            other => Err(FheError::TypeMismatch {
                handle,
                expected: FheType::Uint64,
                got: other.fhe_type(),
            }),
        }
    }

    fn get_bool(&self, handle: Handle) -> Result<bool, FheError> {
        match self.get(handle)? {
            PlaintextValue::Bool(v) => Ok(v),
            other => Err(FheError::TypeMismatch {
                handle,
                expected: FheType::Bool,
                got: other.fhe_type(),
            }),
        }
    }
}

/// Coprocessor backing encrypted computation with plaintexts held in memory.
///
/// Cloning yields another view of the same ciphertext store, so a contract
/// and a confidential token ledger can operate on each other's handles.
#[derive(Clone)]
pub struct MockCoprocessor {
    store: Arc<RwLock<CiphertextStore>>,
    /// Secret key for input proofs
    proof_key: [u8; 32],
}

impl MockCoprocessor {
    pub fn new() -> Self {
        let mut proof_key = [0u8; 32];
        OsRng.fill_bytes(&mut proof_key);
        Self {
            store: Arc::new(RwLock::new(CiphertextStore::default())),
            proof_key,
        }
    }

    /// Decryption authority over this coprocessor's ciphertexts.
    pub fn key_holder(&self) -> KeyHolder {
        KeyHolder {
            store: Arc::clone(&self.store),
        }
    }

    /// Encrypt `values` on behalf of `user` for submission to `contract`.
    ///
    /// This is the client side of input encryption: the returned proof is
    /// only accepted by [`FheOps::verify_inputs`] for the same contract and
    /// user.
    ///
    /// # Arguments
    /// * `values` - Plaintexts to encrypt
    /// * `contract` - Contract the inputs are destined for
    /// * `user` - Account that will submit the inputs
    ///
    /// # Returns
    /// One input per value plus a single proof covering all of them
    pub fn encrypt_inputs(
        &self,
        values: &[u64],
        contract: &Address,
        user: &Address,
    ) -> (Vec<EncryptedInput>, InputProof) {
        let inputs: Vec<EncryptedInput> = {
            let mut store = self.store.write();
            values
                .iter()
                .map(|v| EncryptedInput {
                    handle: store.insert(PlaintextValue::Uint64(*v)),
                })
                .collect()
        };
        let proof = InputProof {
            tag: self.proof_tag(&inputs, contract, user),
        };
        (inputs, proof)
    }

    /// Total homomorphic operations evaluated so far.
    ///
    /// Input verification and ACL updates are not counted.
    pub fn ops_executed(&self) -> u64 {
        self.store.read().ops_executed
    }

    /// Whether `account` has been granted a view of `handle`.
    pub fn is_allowed(&self, handle: Handle, account: &Address) -> bool {
        self.store
            .read()
            .acl
            .get(&handle)
            .map(|accounts| accounts.contains(account))
            .unwrap_or(false)
    }

    pub fn is_publicly_decryptable(&self, handle: Handle) -> bool {
        self.store.read().decryptable.contains(&handle)
    }

    fn proof_tag(&self, inputs: &[EncryptedInput], contract: &Address, user: &Address) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"FHE_INPUT_PROOF_V1:");
        hasher.update(self.proof_key);
        hasher.update(contract);
        hasher.update(user);
        for input in inputs {
            hasher.update(input.handle.0);
        }
        hasher.finalize().into()
    }

    fn binary_u64(
        &mut self,
        a: EncryptedU64,
        b: EncryptedU64,
        f: impl FnOnce(u64, u64) -> u64,
    ) -> Result<EncryptedU64, FheError> {
        let mut store = self.store.write();
        let result = f(store.get_u64(a.0)?, store.get_u64(b.0)?);
        store.ops_executed += 1;
        Ok(EncryptedU64(store.insert(PlaintextValue::Uint64(result))))
    }

    fn compare(
        &mut self,
        a: EncryptedU64,
        b: EncryptedU64,
        f: impl FnOnce(u64, u64) -> bool,
    ) -> Result<EncryptedBool, FheError> {
        let mut store = self.store.write();
        let result = f(store.get_u64(a.0)?, store.get_u64(b.0)?);
        store.ops_executed += 1;
        Ok(EncryptedBool(store.insert(PlaintextValue::Bool(result))))
    }

    fn binary_bool(
        &mut self,
        a: EncryptedBool,
        b: EncryptedBool,
        f: impl FnOnce(bool, bool) -> bool,
    ) -> Result<EncryptedBool, FheError> {
        let mut store = self.store.write();
        let result = f(store.get_bool(a.0)?, store.get_bool(b.0)?);
        store.ops_executed += 1;
        Ok(EncryptedBool(store.insert(PlaintextValue::Bool(result))))
    }
}

impl Default for MockCoprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl FheOps for MockCoprocessor {
    fn trivial_encrypt(&mut self, value: u64) -> EncryptedU64 {
        let mut store = self.store.write();
        store.ops_executed += 1;
        EncryptedU64(store.insert(PlaintextValue::Uint64(value)))
    }

    fn trivial_encrypt_bool(&mut self, value: bool) -> EncryptedBool {
        let mut store = self.store.write();
        store.ops_executed += 1;
        EncryptedBool(store.insert(PlaintextValue::Bool(value)))
    }

    fn verify_inputs(
        &mut self,
        inputs: &[EncryptedInput],
        proof: &InputProof,
        contract: &Address,
        user: &Address,
    ) -> Result<Vec<EncryptedU64>, FheError> {
        if proof.tag != self.proof_tag(inputs, contract, user) {
            debug!(user = hex::encode(user), "Rejected input proof");
            return Err(FheError::InvalidInputProof);
        }
        let store = self.store.read();
        inputs
            .iter()
            .map(|input| {
                store.get_u64(input.handle)?;
                Ok(EncryptedU64(input.handle))
            })
            .collect()
    }

    fn add(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedU64, FheError> {
        self.binary_u64(a, b, u64::wrapping_add)
    }

    fn sub(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedU64, FheError> {
        self.binary_u64(a, b, u64::wrapping_sub)
    }

    fn mul(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedU64, FheError> {
        self.binary_u64(a, b, u64::wrapping_mul)
    }

    fn overflowing_mul(
        &mut self,
        a: EncryptedU64,
        b: EncryptedU64,
    ) -> Result<(EncryptedU64, EncryptedBool), FheError> {
        let mut store = self.store.write();
        let (product, overflowed) = store.get_u64(a.0)?.overflowing_mul(store.get_u64(b.0)?);
        store.ops_executed += 1;
        let product = EncryptedU64(store.insert(PlaintextValue::Uint64(product)));
        let overflowed = EncryptedBool(store.insert(PlaintextValue::Bool(overflowed)));
        Ok((product, overflowed))
    }

    fn mul_plain(&mut self, a: EncryptedU64, scalar: u64) -> Result<EncryptedU64, FheError> {
        let mut store = self.store.write();
        let result = store.get_u64(a.0)?.wrapping_mul(scalar);
        store.ops_executed += 1;
        Ok(EncryptedU64(store.insert(PlaintextValue::Uint64(result))))
    }

    fn eq(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedBool, FheError> {
        self.compare(a, b, |x, y| x == y)
    }

    fn ge(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedBool, FheError> {
        self.compare(a, b, |x, y| x >= y)
    }

    fn gt(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedBool, FheError> {
        self.compare(a, b, |x, y| x > y)
    }

    fn lt(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedBool, FheError> {
        self.compare(a, b, |x, y| x < y)
    }

    fn and(&mut self, a: EncryptedBool, b: EncryptedBool) -> Result<EncryptedBool, FheError> {
        self.binary_bool(a, b, |x, y| x && y)
    }

    fn or(&mut self, a: EncryptedBool, b: EncryptedBool) -> Result<EncryptedBool, FheError> {
        self.binary_bool(a, b, |x, y| x || y)
    }

    fn not(&mut self, a: EncryptedBool) -> Result<EncryptedBool, FheError> {
        let mut store = self.store.write();
        let result = !store.get_bool(a.0)?;
        store.ops_executed += 1;
        Ok(EncryptedBool(store.insert(PlaintextValue::Bool(result))))
    }

    fn select(
        &mut self,
        cond: EncryptedBool,
        a: EncryptedU64,
        b: EncryptedU64,
    ) -> Result<EncryptedU64, FheError> {
        let mut store = self.store.write();
        let c = store.get_bool(cond.0)?;
        let (x, y) = (store.get_u64(a.0)?, store.get_u64(b.0)?);
        store.ops_executed += 1;
        Ok(EncryptedU64(
            store.insert(PlaintextValue::Uint64(if c { x } else { y })),
        ))
    }

    fn select_bool(
        &mut self,
        cond: EncryptedBool,
        a: EncryptedBool,
        b: EncryptedBool,
    ) -> Result<EncryptedBool, FheError> {
        let mut store = self.store.write();
        let c = store.get_bool(cond.0)?;
        let (x, y) = (store.get_bool(a.0)?, store.get_bool(b.0)?);
        store.ops_executed += 1;
        Ok(EncryptedBool(
            store.insert(PlaintextValue::Bool(if c { x } else { y })),
        ))
    }

    fn allow(&mut self, handle: Handle, account: &Address) -> Result<(), FheError> {
        let mut store = self.store.write();
        store.get(handle)?;
        store.acl.entry(handle).or_default().insert(*account);
        Ok(())
    }

    fn allow_for_decryption(&mut self, handle: Handle) -> Result<(), FheError> {
        let mut store = self.store.write();
        store.get(handle)?;
        store.decryptable.insert(handle);
        Ok(())
    }
}

/// Holder of the decryption key.
///
/// The oracle uses [`KeyHolder::public_decrypt`], which only works on handles
/// a contract has released. Users read their own balances and allocations
/// through [`KeyHolder::user_decrypt`].
#[derive(Clone)]
pub struct KeyHolder {
    store: Arc<RwLock<CiphertextStore>>,
}

impl KeyHolder {
    /// Decrypt a handle marked publicly decryptable.
    pub fn public_decrypt(&self, handle: Handle) -> Result<PlaintextValue, FheError> {
        let store = self.store.read();
        if !store.decryptable.contains(&handle) {
            return Err(FheError::NotDecryptable(handle));
        }
        store.get(handle)
    }

    /// Decrypt a handle on behalf of an account that was granted access.
    pub fn user_decrypt(&self, handle: Handle, account: &Address) -> Result<u64, FheError> {
        let store = self.store.read();
        let allowed = store
            .acl
            .get(&handle)
            .map(|accounts| accounts.contains(account))
            .unwrap_or(false);
        if !allowed {
            return Err(FheError::AccessDenied(handle));
        }
        store.get_u64(handle)
    }

    /// Unrestricted read, for components that hold the key themselves such as
    /// an in-process token ledger settling its own balances.
    pub fn reveal_u64(&self, value: EncryptedU64) -> Result<u64, FheError> {
        self.store.read().get_u64(value.0)
    }

    pub fn reveal_bool(&self, value: EncryptedBool) -> Result<bool, FheError> {
        self.store.read().get_bool(value.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT: Address = [0xc0; 32];
    const ALICE: Address = [0xa1; 32];
    const BOB: Address = [0xb0; 32];

    #[test]
    fn test_arithmetic_wraps() {
        let mut fhe = MockCoprocessor::new();
        let keys = fhe.key_holder();

        let max = fhe.trivial_encrypt(u64::MAX);
        let one = fhe.trivial_encrypt(1);
        let sum = fhe.add(max, one).unwrap();
        let diff = fhe.sub(one, max).unwrap();
        let prod = fhe.mul_plain(max, 2).unwrap();

        assert_eq!(keys.reveal_u64(sum).unwrap(), 0);
        assert_eq!(keys.reveal_u64(diff).unwrap(), 2);
        assert_eq!(keys.reveal_u64(prod).unwrap(), u64::MAX - 1);
    }

    #[test]
    fn test_overflow_flags() {
        let mut fhe = MockCoprocessor::new();
        let keys = fhe.key_holder();

        let max = fhe.trivial_encrypt(u64::MAX);
        let one = fhe.trivial_encrypt(1);
        let two_32 = fhe.trivial_encrypt(1 << 32);
        let below_32 = fhe.trivial_encrypt((1 << 32) - 1);

        let (prod, over) = fhe.overflowing_mul(two_32, two_32).unwrap();
        assert_eq!(keys.reveal_u64(prod).unwrap(), 0);
        assert!(keys.reveal_bool(over).unwrap());

        let (prod, over) = fhe.overflowing_mul(below_32, below_32).unwrap();
        assert_eq!(keys.reveal_u64(prod).unwrap(), u64::MAX - (1 << 33) + 2);
        assert!(!keys.reveal_bool(over).unwrap());

        let (_, over) = fhe.overflowing_add(max, one).unwrap();
        assert!(keys.reveal_bool(over).unwrap());
        let (sum, over) = fhe.overflowing_add(below_32, one).unwrap();
        assert_eq!(keys.reveal_u64(sum).unwrap(), 1 << 32);
        assert!(!keys.reveal_bool(over).unwrap());

        let saturated = fhe.saturating_add(max, two_32).unwrap();
        assert_eq!(keys.reveal_u64(saturated).unwrap(), u64::MAX);
        let exact = fhe.saturating_add(one, two_32).unwrap();
        assert_eq!(keys.reveal_u64(exact).unwrap(), (1 << 32) + 1);
    }

    #[test]
    fn test_comparisons_and_select() {
        let mut fhe = MockCoprocessor::new();
        let keys = fhe.key_holder();

        let three = fhe.trivial_encrypt(3);
        let five = fhe.trivial_encrypt(5);

        let ge = fhe.ge(three, three).unwrap();
        let gt = fhe.gt(three, three).unwrap();
        let lt = fhe.lt(three, five).unwrap();
        assert!(keys.reveal_bool(ge).unwrap());
        assert!(!keys.reveal_bool(gt).unwrap());
        assert!(keys.reveal_bool(lt).unwrap());

        let picked = fhe.select(gt, three, five).unwrap();
        assert_eq!(keys.reveal_u64(picked).unwrap(), 5);

        let min = fhe.min(five, three).unwrap();
        assert_eq!(keys.reveal_u64(min).unwrap(), 3);

        let not_gt = fhe.not(gt).unwrap();
        let both = fhe.and(ge, not_gt).unwrap();
        let either = fhe.or(gt, lt).unwrap();
        assert!(keys.reveal_bool(both).unwrap());
        assert!(keys.reveal_bool(either).unwrap());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut fhe = MockCoprocessor::new();
        let flag = fhe.trivial_encrypt_bool(true);
        let value = fhe.trivial_encrypt(1);

        let err = fhe.add(value, EncryptedU64(flag.0)).unwrap_err();
        assert!(matches!(err, FheError::TypeMismatch { expected: FheType::Uint64, .. }));
    }

    #[test]
    fn test_input_proof_binding() {
        let mut fhe = MockCoprocessor::new();
        let (inputs, proof) = fhe.encrypt_inputs(&[10, 20], &CONTRACT, &ALICE);

        let accepted = fhe.verify_inputs(&inputs, &proof, &CONTRACT, &ALICE).unwrap();
        assert_eq!(accepted.len(), 2);

        // Wrong sender
        assert_eq!(
            fhe.verify_inputs(&inputs, &proof, &CONTRACT, &BOB),
            Err(FheError::InvalidInputProof)
        );
        // Wrong contract
        assert_eq!(
            fhe.verify_inputs(&inputs, &proof, &[0u8; 32], &ALICE),
            Err(FheError::InvalidInputProof)
        );
        // Reordered inputs
        let swapped = [inputs[1], inputs[0]];
        assert_eq!(
            fhe.verify_inputs(&swapped, &proof, &CONTRACT, &ALICE),
            Err(FheError::InvalidInputProof)
        );
    }

    #[test]
    fn test_public_decryption_requires_release() {
        let mut fhe = MockCoprocessor::new();
        let keys = fhe.key_holder();
        let secret = fhe.trivial_encrypt(42);

        assert_eq!(
            keys.public_decrypt(secret.0),
            Err(FheError::NotDecryptable(secret.0))
        );

        fhe.allow_for_decryption(secret.0).unwrap();
        assert_eq!(
            keys.public_decrypt(secret.0).unwrap(),
            PlaintextValue::Uint64(42)
        );
    }

    #[test]
    fn test_user_decrypt_checks_acl() {
        let mut fhe = MockCoprocessor::new();
        let keys = fhe.key_holder();
        let balance = fhe.trivial_encrypt(7);

        fhe.allow(balance.0, &ALICE).unwrap();
        assert_eq!(keys.user_decrypt(balance.0, &ALICE).unwrap(), 7);
        assert_eq!(
            keys.user_decrypt(balance.0, &BOB),
            Err(FheError::AccessDenied(balance.0))
        );
        assert!(fhe.is_allowed(balance.0, &ALICE));
    }

    #[test]
    fn test_ops_counter_ignores_plaintexts() {
        let run = |x: u64, y: u64| {
            let mut fhe = MockCoprocessor::new();
            let a = fhe.trivial_encrypt(x);
            let b = fhe.trivial_encrypt(y);
            let _ = fhe.min(a, b).unwrap();
            fhe.ops_executed()
        };
        assert_eq!(run(1, 2), run(9, 0));
    }

    #[test]
    fn test_clones_share_store() {
        let mut fhe = MockCoprocessor::new();
        let mut other = fhe.clone();
        let a = fhe.trivial_encrypt(4);
        let b = other.trivial_encrypt(6);
        let sum = other.add(a, b).unwrap();
        assert_eq!(fhe.key_holder().reveal_u64(sum).unwrap(), 10);
    }
}
