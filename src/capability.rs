//! Capability gate
//!
//! Every capability access from the orchestration layer goes through
//! [`CapabilityGate`]. The gate first confirms, against the node's own
//! capability descriptors, that the capability exists and supports the
//! requested operation; only then is the vendor SDK called. Calling an
//! unsupported operation on a vendor object has unspecified results, so an
//! unsupported request fails with [`CaptureError::CapabilityUnsupported`]
//! without reaching the SDK.

use std::sync::Arc;

use tracing::trace;

use crate::bridge::CompletionToken;
use crate::error::{AppResult, CaptureError};
use crate::sdk::{CapOperations, CapType, CapValue, CapabilityId, CaptureSdk, EnumValue};
use crate::tree::DeviceNode;

/// Whether `node` advertises `capability` with `operation`.
pub fn check_operation(node: &DeviceNode, capability: CapabilityId, operation: CapOperations) -> bool {
    node.supports(capability, operation)
}

/// Vendor SDK wrapper that refuses unsupported capability operations.
#[derive(Clone)]
pub struct CapabilityGate {
    sdk: Arc<dyn CaptureSdk>,
}

impl CapabilityGate {
    /// Gate over `sdk`.
    pub fn new(sdk: Arc<dyn CaptureSdk>) -> Self {
        Self { sdk }
    }

    /// Underlying SDK, for tree operations and message pumping.
    pub fn sdk(&self) -> &dyn CaptureSdk {
        self.sdk.as_ref()
    }

    /// Fail unless `node` supports `operation` on `capability`.
    pub fn require(
        &self,
        node: &DeviceNode,
        capability: CapabilityId,
        operation: CapOperations,
    ) -> AppResult<()> {
        if check_operation(node, capability, operation) {
            Ok(())
        } else {
            Err(CaptureError::CapabilityUnsupported {
                capability,
                operation,
            })
        }
    }

    /// Fail unless `capability` exists on `node` with the declared type.
    pub fn require_type(
        &self,
        node: &DeviceNode,
        capability: CapabilityId,
        cap_type: CapType,
    ) -> AppResult<()> {
        match node.capability(capability) {
            Some(info) if info.cap_type == cap_type => Ok(()),
            _ => Err(CaptureError::CapabilityUnsupported {
                capability,
                operation: CapOperations::empty(),
            }),
        }
    }

    /// Read a capability after checking `GET` is advertised.
    pub fn get(&self, node: &DeviceNode, capability: CapabilityId) -> AppResult<CapValue> {
        self.require(node, capability, CapOperations::GET)?;
        trace!("get {:?} on {:?}", capability, node.handle());
        self.sdk
            .cap_get(node.handle(), capability)
            .map_err(|source| CaptureError::CapabilityGetFailed { capability, source })
    }

    /// Read an unsigned capability.
    pub fn get_unsigned(&self, node: &DeviceNode, capability: CapabilityId) -> AppResult<u32> {
        let value = self.get(node, capability)?;
        value.as_unsigned().ok_or_else(|| unexpected(capability, &value))
    }

    /// Read an enum capability.
    pub fn get_enum(&self, node: &DeviceNode, capability: CapabilityId) -> AppResult<EnumValue> {
        let value = self.get(node, capability)?;
        value.as_enum().ok_or_else(|| unexpected(capability, &value))
    }

    /// Write a capability after checking `SET` is advertised.
    pub fn set(&self, node: &DeviceNode, capability: CapabilityId, value: CapValue) -> AppResult<()> {
        self.require(node, capability, CapOperations::SET)?;
        trace!("set {:?} = {:?} on {:?}", capability, value, node.handle());
        self.sdk
            .cap_set(node.handle(), capability, value)
            .map_err(|source| CaptureError::CapabilitySetFailed { capability, source })
    }

    /// Read-modify-write of an enum capability's current value.
    pub fn set_enum_value(
        &self,
        node: &DeviceNode,
        capability: CapabilityId,
        value: u32,
    ) -> AppResult<()> {
        let mut current = self.get_enum(node, capability)?;
        current.value = value;
        self.set(node, capability, CapValue::Enum(current))
    }

    /// Start an asynchronous capability; completion is reported through `token`.
    pub fn start(
        &self,
        node: &DeviceNode,
        capability: CapabilityId,
        param: CapValue,
        token: &CompletionToken,
    ) -> AppResult<()> {
        self.require(node, capability, CapOperations::START)?;
        trace!("start {:?} on {:?}", capability, node.handle());
        self.sdk
            .cap_start(node.handle(), capability, param, token.clone())
            .map_err(|source| CaptureError::CapabilityStartFailed { capability, source })
    }

    /// Read an array capability (requires `Get`).
    pub fn get_array(&self, node: &DeviceNode, capability: CapabilityId) -> AppResult<Vec<u32>> {
        self.require(node, capability, CapOperations::GET)?;
        self.sdk
            .cap_get_array(node.handle(), capability)
            .map_err(|source| CaptureError::CapabilityGetFailed { capability, source })
    }
}

fn unexpected(capability: CapabilityId, value: &CapValue) -> CaptureError {
    CaptureError::CapabilityGetFailed {
        capability,
        source: crate::sdk::SdkError::new(-1, format!("unexpected value {value:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::mock::{MockCaptureSdk, MockSdkConfig, SdkCall};

    #[test]
    fn test_unsupported_operation_never_reaches_sdk() {
        let sdk = Arc::new(MockCaptureSdk::new(MockSdkConfig {
            withheld: vec![(CapabilityId::Sensitivity, CapOperations::SET)],
            ..MockSdkConfig::default()
        }));
        let gate = CapabilityGate::new(sdk.clone());
        let mut module = DeviceNode::open_module(gate.sdk()).unwrap();
        let source = module.ensure_child(gate.sdk(), 1).unwrap();

        let err = gate
            .set(source, CapabilityId::Sensitivity, CapValue::Enum(EnumValue::default()))
            .unwrap_err();
        assert!(matches!(err, CaptureError::CapabilityUnsupported { .. }));
        assert!(!sdk
            .calls()
            .iter()
            .any(|c| *c == SdkCall::Set(CapabilityId::Sensitivity)));

        // Get is still advertised.
        gate.get_enum(source, CapabilityId::Sensitivity).unwrap();
    }

    #[test]
    fn test_missing_capability_on_item() {
        let sdk = Arc::new(MockCaptureSdk::default());
        let gate = CapabilityGate::new(sdk.clone());
        let mut module = DeviceNode::open_module(gate.sdk()).unwrap();

        assert!(!check_operation(&module, CapabilityId::Acquire, CapOperations::START));
        assert!(check_operation(&module, CapabilityId::Children, CapOperations::GET));

        let err = gate
            .start(&module, CapabilityId::Acquire, CapValue::Null, &CompletionToken::new())
            .unwrap_err();
        assert!(matches!(err, CaptureError::CapabilityUnsupported { .. }));
        assert!(sdk.calls().iter().all(|c| !matches!(c, SdkCall::Start(_))));

        module.ensure_child(gate.sdk(), 1).unwrap();
    }

    #[test]
    fn test_set_enum_value_reads_then_writes() {
        let sdk = Arc::new(MockCaptureSdk::default());
        let gate = CapabilityGate::new(sdk.clone());
        let mut module = DeviceNode::open_module(gate.sdk()).unwrap();
        let source = module.ensure_child(gate.sdk(), 1).unwrap();

        gate.set_enum_value(source, CapabilityId::WbMode, 3).unwrap();
        let wb = gate.get_enum(source, CapabilityId::WbMode).unwrap();
        assert_eq!(wb.value, 3);

        let calls = sdk.calls();
        let get = calls.iter().position(|c| *c == SdkCall::Get(CapabilityId::WbMode));
        let set = calls.iter().position(|c| *c == SdkCall::Set(CapabilityId::WbMode));
        assert!(get.unwrap() < set.unwrap());
    }
}
