//! In-process order registry.
//!
//! Every computation request becomes an order: the POST handler registers
//! it, a spawned worker resolves it, and the GET handlers poll it by ID.
//! Orders live for the lifetime of the process.

pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::RwLock;
use rand::RngCore;

use crate::api::types::{BilateralMilpOutputs, PoolMilpOutputs, VanillaOutputs};
use crate::market::{LemOrganization, PricingMechanism};

/// Kind of computation behind an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Vanilla,
    Dual,
    Loop,
}

/// Why a processed order carries no result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Meter IDs unknown to the registry or absent from the dataspace.
    MetersNotFound,
    /// Intervals without data for one or more meters.
    DataPointsMissing,
    /// Connector, solver, or runtime failure.
    Internal,
}

/// Payload stored for a successfully processed order.
#[derive(Debug, Clone)]
pub enum OrderResult {
    Vanilla(VanillaOutputs),
    PoolMilp(PoolMilpOutputs),
    BilateralMilp(BilateralMilpOutputs),
}

/// Lifecycle of one order.
#[derive(Debug, Clone)]
pub enum OrderStatus {
    Pending,
    Failed { kind: FailureKind, message: String },
    Completed(Box<OrderResult>),
}

/// One registered order.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub kind: OrderKind,
    pub organization: LemOrganization,
    pub mechanism: Option<PricingMechanism>,
    pub status: OrderStatus,
}

/// Shared, lock-protected order map.
#[derive(Clone, Default)]
pub struct OrderStore {
    inner: Arc<RwLock<HashMap<String, OrderRecord>>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new pending order.
    pub fn register(
        &self,
        order_id: &str,
        kind: OrderKind,
        organization: LemOrganization,
        mechanism: Option<PricingMechanism>,
    ) {
        self.inner.write().insert(
            order_id.to_string(),
            OrderRecord {
                kind,
                organization,
                mechanism,
                status: OrderStatus::Pending,
            },
        );
    }

    /// Stores the result of a processed order.
    pub fn complete(&self, order_id: &str, result: OrderResult) {
        if let Some(record) = self.inner.write().get_mut(order_id) {
            record.status = OrderStatus::Completed(Box::new(result));
        }
    }

    /// Marks an order as processed with a failure.
    pub fn fail(&self, order_id: &str, kind: FailureKind, message: String) {
        if let Some(record) = self.inner.write().get_mut(order_id) {
            record.status = OrderStatus::Failed { kind, message };
        }
    }

    pub fn get(&self, order_id: &str) -> Option<OrderRecord> {
        self.inner.read().get(order_id).cloned()
    }
}

/// Returns an unequivocal order ID: 45 random bytes in URL-safe base64,
/// 60 characters.
pub fn new_order_id() -> String {
    let mut bytes = [0u8; 45];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
