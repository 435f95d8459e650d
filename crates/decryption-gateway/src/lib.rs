//! Decryption Gateway
//!
//! Stands in for the external decryption oracle:
//! 1. Contracts register a ciphertext handle and receive an opaque request id
//! 2. The gateway decrypts registered handles through a [`KeyHolder`], which
//!    refuses any handle the contract has not released
//! 3. Results are delivered back through [`DecryptionCallback`] in an order
//!    the contract does not control
//!
//! Requests are keyed by id, never by position, so any resolution order is
//! valid.

pub mod relayer;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use clearing_fhe::{FheError, KeyHolder};
use clearing_types::{compute_request_id, Address, Handle, PlaintextValue, RequestId};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use relayer::{Relayer, RelayerConfig};

/// Errors that can occur while coordinating decryptions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Unknown decryption request {0}")]
    UnknownRequest(String),

    #[error("Decryption request {0} has no result to deliver")]
    NotFulfilled(String),

    #[error("Decryption refused: {0}")]
    Refused(#[from] FheError),

    #[error("Callback rejected result: {0}")]
    CallbackRejected(String),
}

/// Request-side interface of the oracle, as seen by a contract.
pub trait DecryptionOracle {
    /// Register `handle` for decryption on behalf of `requester`.
    fn request_decryption(
        &mut self,
        requester: &Address,
        handle: Handle,
    ) -> Result<RequestId, GatewayError>;
}

/// Receiver of oracle results.
pub trait DecryptionCallback {
    type Error: fmt::Display;

    /// Deliver the plaintext for `request_id`. `oracle` identifies the caller
    /// so the receiver can reject deliveries from anyone else.
    fn on_decryption_result(
        &mut self,
        oracle: &Address,
        request_id: RequestId,
        value: PlaintextValue,
    ) -> Result<(), Self::Error>;
}

/// State of a decryption request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    /// Registered, not yet decrypted
    Pending,
    /// Decrypted, awaiting delivery
    Fulfilled(PlaintextValue),
    /// Delivered to the requester
    Delivered(PlaintextValue),
    /// Decryption or delivery failed
    Failed(String),
}

/// A single decryption request.
#[derive(Debug, Clone)]
pub struct DecryptionRequest {
    pub request_id: RequestId,
    /// Contract that asked for the decryption
    pub requester: Address,
    pub handle: Handle,
    /// Position in issue order
    pub sequence: u64,
    pub state: RequestState,
}

/// A decrypted value ready to hand to its requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub request_id: RequestId,
    pub requester: Address,
    pub value: PlaintextValue,
}

/// Order in which ready results are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryOrder {
    /// Issue order
    #[default]
    Fifo,
    /// Newest request first
    Reverse,
    /// Deterministic shuffle from a seed
    Shuffled(u64),
}

/// In-process decryption oracle.
pub struct DecryptionGateway {
    /// Account the gateway signs callbacks with
    address: Address,
    key_holder: KeyHolder,
    requests: HashMap<RequestId, DecryptionRequest>,
    nonce: u64,
}

/// Gateway shared between contracts and a relayer task.
pub type SharedGateway = Arc<Mutex<DecryptionGateway>>;

impl DecryptionGateway {
    pub fn new(address: Address, key_holder: KeyHolder) -> Self {
        Self {
            address,
            key_holder,
            requests: HashMap::new(),
            nonce: 0,
        }
    }

    pub fn into_shared(self) -> SharedGateway {
        Arc::new(Mutex::new(self))
    }

    /// Account that callbacks are delivered from.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Decrypt a pending request.
    pub fn fulfill(&mut self, request_id: RequestId) -> Result<PlaintextValue, GatewayError> {
        let request = self
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| GatewayError::UnknownRequest(hex::encode(request_id)))?;

        match &request.state {
            RequestState::Fulfilled(value) | RequestState::Delivered(value) => return Ok(*value),
            RequestState::Failed(reason) => {
                return Err(GatewayError::CallbackRejected(reason.clone()))
            }
            RequestState::Pending => {}
        }

        match self.key_holder.public_decrypt(request.handle) {
            Ok(value) => {
                debug!(
                    request_id = hex::encode(request_id),
                    handle = %request.handle,
                    "Fulfilled decryption request"
                );
                request.state = RequestState::Fulfilled(value);
                Ok(value)
            }
            Err(e) => {
                warn!(
                    request_id = hex::encode(request_id),
                    error = %e,
                    "Decryption refused"
                );
                request.state = RequestState::Failed(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Decrypt every pending request. Refusals are recorded on the request.
    pub fn fulfill_all(&mut self) -> usize {
        let pending = self.pending_requests();
        pending
            .into_iter()
            .filter(|id| self.fulfill(*id).is_ok())
            .count()
    }

    /// Fulfilled but undelivered results, in `order`.
    pub fn ready(&self, order: DeliveryOrder) -> Vec<Delivery> {
        let mut ready: Vec<&DecryptionRequest> = self
            .requests
            .values()
            .filter(|r| matches!(r.state, RequestState::Fulfilled(_)))
            .collect();
        ready.sort_by_key(|r| r.sequence);

        match order {
            DeliveryOrder::Fifo => {}
            DeliveryOrder::Reverse => ready.reverse(),
            DeliveryOrder::Shuffled(seed) => ready.shuffle(&mut StdRng::seed_from_u64(seed)),
        }

        ready
            .into_iter()
            .filter_map(|r| match r.state {
                RequestState::Fulfilled(value) => Some(Delivery {
                    request_id: r.request_id,
                    requester: r.requester,
                    value,
                }),
                _ => None,
            })
            .collect()
    }

    /// Record the outcome of handing a result to its requester.
    pub fn record_delivery(&mut self, request_id: RequestId, outcome: Result<(), String>) {
        if let Some(request) = self.requests.get_mut(&request_id) {
            request.state = match (outcome, &request.state) {
                (Ok(()), RequestState::Fulfilled(value)) => RequestState::Delivered(*value),
                (Ok(()), state) => state.clone(),
                (Err(reason), _) => RequestState::Failed(reason),
            };
        }
    }

    /// A previously fulfilled result, for redelivery.
    pub fn delivery(&self, request_id: RequestId) -> Result<Delivery, GatewayError> {
        let request = self
            .requests
            .get(&request_id)
            .ok_or_else(|| GatewayError::UnknownRequest(hex::encode(request_id)))?;
        match request.state {
            RequestState::Fulfilled(value) | RequestState::Delivered(value) => Ok(Delivery {
                request_id,
                requester: request.requester,
                value,
            }),
            _ => Err(GatewayError::NotFulfilled(hex::encode(request_id))),
        }
    }

    /// Fulfil everything pending and deliver it to `callback`.
    ///
    /// # Returns
    /// The number of results delivered
    pub fn relay_all<C: DecryptionCallback>(
        &mut self,
        callback: &mut C,
        order: DeliveryOrder,
    ) -> Result<usize, GatewayError> {
        self.fulfill_all();
        let deliveries = self.ready(order);
        let count = deliveries.len();
        for delivery in deliveries {
            deliver(self, callback, delivery)?;
        }
        Ok(count)
    }

    pub fn get_state(&self, request_id: &RequestId) -> Option<RequestState> {
        self.requests.get(request_id).map(|r| r.state.clone())
    }

    pub fn get_request(&self, request_id: &RequestId) -> Option<&DecryptionRequest> {
        self.requests.get(request_id)
    }

    /// Ids of requests not yet decrypted.
    pub fn pending_requests(&self) -> Vec<RequestId> {
        let mut pending: Vec<&DecryptionRequest> = self
            .requests
            .values()
            .filter(|r| matches!(r.state, RequestState::Pending))
            .collect();
        pending.sort_by_key(|r| r.sequence);
        pending.into_iter().map(|r| r.request_id).collect()
    }
}

fn deliver<C: DecryptionCallback>(
    gateway: &mut DecryptionGateway,
    callback: &mut C,
    delivery: Delivery,
) -> Result<(), GatewayError> {
    let address = gateway.address;
    match callback.on_decryption_result(&address, delivery.request_id, delivery.value) {
        Ok(()) => {
            gateway.record_delivery(delivery.request_id, Ok(()));
            Ok(())
        }
        Err(e) => {
            let reason = e.to_string();
            gateway.record_delivery(delivery.request_id, Err(reason.clone()));
            Err(GatewayError::CallbackRejected(reason))
        }
    }
}

impl DecryptionOracle for DecryptionGateway {
    fn request_decryption(
        &mut self,
        requester: &Address,
        handle: Handle,
    ) -> Result<RequestId, GatewayError> {
        let sequence = self.nonce;
        self.nonce += 1;
        let request_id = compute_request_id(requester, &handle, sequence);

        info!(
            request_id = hex::encode(request_id),
            requester = hex::encode(requester),
            sequence,
            "Registered decryption request"
        );

        self.requests.insert(
            request_id,
            DecryptionRequest {
                request_id,
                requester: *requester,
                handle,
                sequence,
                state: RequestState::Pending,
            },
        );
        Ok(request_id)
    }
}

impl DecryptionOracle for SharedGateway {
    fn request_decryption(
        &mut self,
        requester: &Address,
        handle: Handle,
    ) -> Result<RequestId, GatewayError> {
        self.lock().request_decryption(requester, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clearing_fhe::{FheOps, MockCoprocessor};

    const ORACLE: Address = [0x0a; 32];
    const CONTRACT: Address = [0xc0; 32];

    #[derive(Default)]
    struct Recorder {
        received: Vec<(RequestId, PlaintextValue)>,
        reject: bool,
    }

    impl DecryptionCallback for Recorder {
        type Error = String;

        fn on_decryption_result(
            &mut self,
            oracle: &Address,
            request_id: RequestId,
            value: PlaintextValue,
        ) -> Result<(), String> {
            assert_eq!(*oracle, ORACLE);
            if self.reject {
                return Err("rejected".into());
            }
            self.received.push((request_id, value));
            Ok(())
        }
    }

    fn setup() -> (MockCoprocessor, DecryptionGateway) {
        let fhe = MockCoprocessor::new();
        let gateway = DecryptionGateway::new(ORACLE, fhe.key_holder());
        (fhe, gateway)
    }

    #[test]
    fn test_request_ids_unique_per_request() {
        let (mut fhe, mut gateway) = setup();
        let value = fhe.trivial_encrypt(5);
        let first = gateway.request_decryption(&CONTRACT, value.handle()).unwrap();
        let second = gateway.request_decryption(&CONTRACT, value.handle()).unwrap();
        assert_ne!(first, second);
        assert_eq!(gateway.pending_requests(), vec![first, second]);
    }

    #[test]
    fn test_fulfill_requires_release() {
        let (mut fhe, mut gateway) = setup();
        let secret = fhe.trivial_encrypt(99);
        let id = gateway.request_decryption(&CONTRACT, secret.handle()).unwrap();

        assert_eq!(
            gateway.fulfill(id),
            Err(GatewayError::Refused(FheError::NotDecryptable(secret.handle())))
        );
        assert!(matches!(gateway.get_state(&id), Some(RequestState::Failed(_))));
    }

    #[test]
    fn test_relay_in_each_order() {
        for (order, expected) in [
            (DeliveryOrder::Fifo, vec![1u64, 2, 3]),
            (DeliveryOrder::Reverse, vec![3, 2, 1]),
        ] {
            let (mut fhe, mut gateway) = setup();
            for v in 1..=3 {
                let c = fhe.trivial_encrypt(v);
                fhe.allow_for_decryption(c.handle()).unwrap();
                gateway.request_decryption(&CONTRACT, c.handle()).unwrap();
            }

            let mut recorder = Recorder::default();
            assert_eq!(gateway.relay_all(&mut recorder, order).unwrap(), 3);
            let values: Vec<u64> = recorder
                .received
                .iter()
                .map(|(_, v)| match v {
                    PlaintextValue::Uint64(x) => *x,
                    PlaintextValue::Bool(_) => unreachable!(),
                })
                .collect();
            assert_eq!(values, expected);
            assert!(gateway.ready(order).is_empty());
        }
    }

    #[test]
    fn test_shuffled_order_is_deterministic() {
        let (mut fhe, mut gateway) = setup();
        for v in 0..8 {
            let c = fhe.trivial_encrypt(v);
            fhe.allow_for_decryption(c.handle()).unwrap();
            gateway.request_decryption(&CONTRACT, c.handle()).unwrap();
        }
        gateway.fulfill_all();
        let a = gateway.ready(DeliveryOrder::Shuffled(42));
        let b = gateway.ready(DeliveryOrder::Shuffled(42));
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn test_rejected_callback_marks_failed() {
        let (mut fhe, mut gateway) = setup();
        let flag = fhe.trivial_encrypt_bool(true);
        fhe.allow_for_decryption(flag.handle()).unwrap();
        let id = gateway.request_decryption(&CONTRACT, flag.handle()).unwrap();

        let mut recorder = Recorder {
            reject: true,
            ..Default::default()
        };
        let err = gateway
            .relay_all(&mut recorder, DeliveryOrder::Fifo)
            .unwrap_err();
        assert_eq!(err, GatewayError::CallbackRejected("rejected".into()));
        assert_eq!(
            gateway.get_state(&id),
            Some(RequestState::Failed("rejected".into()))
        );
    }

    #[test]
    fn test_redelivery_of_delivered_result() {
        let (mut fhe, mut gateway) = setup();
        let c = fhe.trivial_encrypt(7);
        fhe.allow_for_decryption(c.handle()).unwrap();
        let id = gateway.request_decryption(&CONTRACT, c.handle()).unwrap();

        assert!(gateway.delivery(id).is_err());
        let mut recorder = Recorder::default();
        gateway.relay_all(&mut recorder, DeliveryOrder::Fifo).unwrap();

        let again = gateway.delivery(id).unwrap();
        assert_eq!(again.value, PlaintextValue::Uint64(7));
        assert_eq!(again.requester, CONTRACT);
    }

    #[test]
    fn test_unknown_request() {
        let (_, mut gateway) = setup();
        assert!(matches!(
            gateway.fulfill([9u8; 32]),
            Err(GatewayError::UnknownRequest(_))
        ));
    }
}
