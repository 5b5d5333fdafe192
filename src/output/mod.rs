//! Output transports for Tilt messages.
//!
//! This module provides a trait for publishing assembled messages and an
//! MQTT implementation. The broadcast loop only sees the trait, so it can
//! be tested deterministically without a broker.

pub mod mqtt;

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Topic for Spark block patches derived from sync rules.
pub const SPARK_PATCH_TOPIC: &str = "brewcast/spark/blocks/patch";

/// Errors returned by publish operations.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("MQTT error: {0}")]
    Mqtt(String),
}

/// Eventbus topics for one service instance.
#[derive(Debug, Clone)]
pub struct Topics {
    /// Retained service/device state messages.
    pub state: String,
    /// History messages, one per non-empty batch.
    pub history: String,
    /// Incoming rename requests.
    pub names: String,
}

impl Topics {
    pub fn new(service_name: &str) -> Topics {
        Topics {
            state: format!("brewcast/state/{}", service_name),
            history: format!("brewcast/history/{}", service_name),
            names: format!("brewcast/tilt/{}/names", service_name),
        }
    }
}

/// One message bound for the eventbus.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    /// Retained messages persist for newly-connecting consumers.
    pub retain: bool,
}

/// Trait for message transports.
///
/// Boxed futures keep the trait dyn-compatible so tests can inject fakes.
pub trait Publisher: Send + Sync {
    fn publish(
        &self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>>;
}
