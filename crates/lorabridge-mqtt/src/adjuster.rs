//! Payload adjustment hook
//!
//! Applied to uplinks after the adapter parsed them, so device-family
//! specific reshaping can be layered independently of the wire format.

use lorabridge_core::LoraMessage;

use crate::error::Result;

/// Rewrites an uplink payload in place
pub trait PayloadAdjuster: Send + Sync {
    /// Adjust the payload; failures leave the message as it was forwarded
    fn adjust(&self, message: &mut LoraMessage) -> Result<()>;
}

/// Leaves every payload untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityAdjuster;

impl PayloadAdjuster for IdentityAdjuster {
    fn adjust(&self, _message: &mut LoraMessage) -> Result<()> {
        Ok(())
    }
}

impl<F> PayloadAdjuster for F
where
    F: Fn(&mut LoraMessage) -> Result<()> + Send + Sync,
{
    fn adjust(&self, message: &mut LoraMessage) -> Result<()> {
        self(message)
    }
}
