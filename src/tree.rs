//! Device object tree
//!
//! Ownership hierarchy mirroring the vendor SDK's object model:
//!
//! ```text
//! Module ──> Source (camera body) ──> Item (one exposure) ──> DataObject (image payload)
//! ```
//!
//! A [`DeviceNode`] owns its children; the parent link is a non-owning copy of
//! the parent's vendor handle. A node is present in the tree exactly while its
//! vendor handle is open: [`DeviceNode::add_child`] links a node only after the
//! SDK opened it and reported its capabilities, and [`DeviceNode::remove_child`]
//! releases the subtree bottom-up before closing the node itself.
//!
//! Vendor handles cannot be closed from `Drop` (closing needs the SDK), so the
//! owner of the root is responsible for calling [`DeviceNode::close`].

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::{AppResult, CaptureError};
use crate::sdk::{CapOperations, CapabilityId, CapabilityInfo, CaptureSdk, ObjectHandle};

/// Level of a node in the object tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// The driver module object.
    Module,
    /// A camera body.
    Source,
    /// One captured frame.
    Item,
    /// The data stream of an item.
    DataObject,
}

impl NodeKind {
    /// Kind of the nodes one level down, if any.
    pub fn child_kind(self) -> Option<NodeKind> {
        match self {
            NodeKind::Module => Some(NodeKind::Source),
            NodeKind::Source => Some(NodeKind::Item),
            NodeKind::Item => Some(NodeKind::DataObject),
            NodeKind::DataObject => None,
        }
    }
}

/// One opened vendor object and its opened children.
#[derive(Debug)]
pub struct DeviceNode {
    id: u32,
    kind: NodeKind,
    handle: ObjectHandle,
    parent: Option<ObjectHandle>,
    capabilities: Vec<CapabilityInfo>,
    children: BTreeMap<u32, DeviceNode>,
}

impl DeviceNode {
    /// Open the module object and read its capabilities.
    pub fn open_module(sdk: &dyn CaptureSdk) -> AppResult<Self> {
        let handle = sdk
            .open_object(None, 0)
            .map_err(CaptureError::ModuleOpenFailed)?;

        let capabilities = match sdk.enum_capabilities(handle) {
            Ok(caps) => caps,
            Err(source) => {
                close_handle(sdk, handle);
                return Err(CaptureError::CapabilityEnumerationFailed {
                    object_id: 0,
                    source,
                });
            }
        };

        debug!(
            "Module opened ({:?}, {} capabilities)",
            handle,
            capabilities.len()
        );
        Ok(Self {
            id: 0,
            kind: NodeKind::Module,
            handle,
            parent: None,
            capabilities,
            children: BTreeMap::new(),
        })
    }

    /// Id within the parent.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Level of this node.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// SDK handle of the opened object.
    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    /// Handle of the owning node (`None` for the module).
    pub fn parent(&self) -> Option<ObjectHandle> {
        self.parent
    }

    /// Capabilities enumerated when the node was opened.
    pub fn capabilities(&self) -> &[CapabilityInfo] {
        &self.capabilities
    }

    /// Descriptor for `cap`, if this node advertises it.
    pub fn capability(&self, cap: CapabilityId) -> Option<&CapabilityInfo> {
        self.capabilities.iter().find(|info| info.id == cap)
    }

    /// Whether `cap` is advertised with every operation in `op`.
    pub fn supports(&self, cap: CapabilityId, op: CapOperations) -> bool {
        self.capability(cap).is_some_and(|info| info.supports(op))
    }

    /// Ids of the opened children, ascending.
    pub fn child_ids(&self) -> Vec<u32> {
        self.children.keys().copied().collect()
    }

    /// Number of opened children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Look up an opened child. Never creates.
    pub fn find_child(&self, id: u32) -> Option<&DeviceNode> {
        self.children.get(&id)
    }

    /// Mutable lookup of an opened child. Never creates.
    pub fn find_child_mut(&mut self, id: u32) -> Option<&mut DeviceNode> {
        self.children.get_mut(&id)
    }

    /// Open child `id` through the SDK and link it under this node.
    ///
    /// Nothing is linked when opening or capability enumeration fails; a handle
    /// that was opened before the failure is closed again.
    pub fn add_child(&mut self, sdk: &dyn CaptureSdk, id: u32) -> AppResult<()> {
        if self.children.contains_key(&id) {
            return Ok(());
        }
        let kind = self
            .kind
            .child_kind()
            .ok_or_else(|| CaptureError::ChildCreationFailed {
                id,
                reason: format!("{:?} objects have no children", self.kind),
            })?;

        let handle = sdk
            .open_object(Some(self.handle), id)
            .map_err(|err| CaptureError::ChildCreationFailed {
                id,
                reason: err.to_string(),
            })?;

        let capabilities = match sdk.enum_capabilities(handle) {
            Ok(caps) => caps,
            Err(source) => {
                close_handle(sdk, handle);
                return Err(CaptureError::CapabilityEnumerationFailed {
                    object_id: id,
                    source,
                });
            }
        };

        debug!("{:?} {} opened under {:?}", kind, id, self.handle);
        self.children.insert(
            id,
            DeviceNode {
                id,
                kind,
                handle,
                parent: Some(self.handle),
                capabilities,
                children: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Find child `id`, opening it first if it is not in the tree yet.
    pub fn ensure_child(&mut self, sdk: &dyn CaptureSdk, id: u32) -> AppResult<&mut DeviceNode> {
        if self.find_child(id).is_none() {
            self.add_child(sdk, id)?;
        }
        self.find_child_mut(id)
            .ok_or_else(|| CaptureError::ChildCreationFailed {
                id,
                reason: "child missing after creation".to_string(),
            })
    }

    /// Unlink child `id` and release its subtree. No-op when absent.
    pub fn remove_child(&mut self, sdk: &dyn CaptureSdk, id: u32) {
        if let Some(child) = self.children.remove(&id) {
            child.release(sdk);
        }
    }

    /// Release this node and everything below it.
    pub fn close(self, sdk: &dyn CaptureSdk) {
        self.release(sdk);
    }

    fn release(mut self, sdk: &dyn CaptureSdk) {
        let ids: Vec<u32> = self.children.keys().copied().collect();
        for id in ids {
            self.remove_child(sdk, id);
        }
        debug!("Closing {:?} {} ({:?})", self.kind, self.id, self.handle);
        close_handle(sdk, self.handle);
    }
}

fn close_handle(sdk: &dyn CaptureSdk, handle: ObjectHandle) {
    if let Err(err) = sdk.close_object(handle) {
        warn!("Failed to close {:?}: {}", handle, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::mock::{MockCaptureSdk, MockSdkConfig, SdkCall};

    fn open() -> (MockCaptureSdk, DeviceNode) {
        let sdk = MockCaptureSdk::default();
        let module = DeviceNode::open_module(&sdk).unwrap();
        (sdk, module)
    }

    #[test]
    fn test_add_then_find() {
        let (sdk, mut module) = open();
        module.add_child(&sdk, 1).unwrap();

        let source = module.find_child(1).unwrap();
        assert_eq!(source.kind(), NodeKind::Source);
        assert_eq!(source.parent(), Some(module.handle()));
        assert!(source.supports(CapabilityId::Capture, CapOperations::START));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (sdk, mut module) = open();
        module.add_child(&sdk, 1).unwrap();
        let handle = module.find_child(1).unwrap().handle();

        module.remove_child(&sdk, 1);
        assert!(module.find_child(1).is_none());
        module.remove_child(&sdk, 1);
        module.remove_child(&sdk, 42);

        let closes = sdk
            .calls()
            .into_iter()
            .filter(|c| *c == SdkCall::Close(handle))
            .count();
        assert_eq!(closes, 1);
        assert!(!sdk.is_open(handle));
    }

    #[test]
    fn test_remove_releases_children_first() {
        let (sdk, mut module) = open();
        let source = module.ensure_child(&sdk, 1).unwrap();
        let source_handle = source.handle();
        let item = source.ensure_child(&sdk, 7).unwrap();
        let item_handle = item.handle();

        module.remove_child(&sdk, 1);

        let closes: Vec<ObjectHandle> = sdk
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                SdkCall::Close(h) => Some(h),
                _ => None,
            })
            .collect();
        assert_eq!(closes, vec![item_handle, source_handle]);
    }

    #[test]
    fn test_failed_open_leaves_no_node() {
        let sdk = MockCaptureSdk::new(MockSdkConfig {
            failing_object_ids: vec![3],
            ..MockSdkConfig::default()
        });
        let mut module = DeviceNode::open_module(&sdk).unwrap();

        let err = module.add_child(&sdk, 3).unwrap_err();
        assert!(matches!(err, CaptureError::ChildCreationFailed { id: 3, .. }));
        assert!(module.find_child(3).is_none());
        assert_eq!(module.child_count(), 0);
    }

    #[test]
    fn test_data_objects_have_no_children() {
        let (sdk, mut module) = open();
        let data = module
            .ensure_child(&sdk, 1)
            .unwrap()
            .ensure_child(&sdk, 9)
            .unwrap()
            .ensure_child(&sdk, 1)
            .unwrap();
        assert_eq!(data.kind(), NodeKind::DataObject);
        assert!(data.add_child(&sdk, 1).is_err());
    }

    #[test]
    fn test_close_releases_everything() {
        let (sdk, mut module) = open();
        module.ensure_child(&sdk, 1).unwrap().ensure_child(&sdk, 5).unwrap();
        module.close(&sdk);
        assert_eq!(sdk.open_object_count(), 0);
    }
}
