//! Mock capture SDK
//!
//! Simulates a DSLR driver module for testing without hardware. Objects are
//! opened and closed like the real SDK, capabilities follow the object level,
//! and asynchronous work (capture acknowledgement, terminate, image delivery)
//! is queued and only runs while the caller drives [`CaptureSdk::pump`], the
//! way message-pump based vendor SDKs behave.
//!
//! Every call except `pump` is recorded so tests can assert on the exact
//! sequence the orchestration layer issued.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use super::{
    CapOperations, CapType, CapValue, CapabilityId, CapabilityInfo, CaptureSdk, DataCallback,
    EnumValue, EventHandler, ModuleEvent, ObjectHandle, SdkError, SdkResult,
    DATA_OBJ_TYPE_IMAGE,
};
use crate::bridge::CompletionToken;
use crate::tree::NodeKind;

/// Calls recorded by [`MockCaptureSdk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkCall {
    /// `open_object` with the child id.
    Open(u32),
    /// `close_object`.
    Close(ObjectHandle),
    /// `cap_get`.
    Get(CapabilityId),
    /// `cap_set`.
    Set(CapabilityId),
    /// `cap_start`.
    Start(CapabilityId),
    /// `cap_get_array`.
    GetArray(CapabilityId),
}

/// Behaviour knobs for [`MockCaptureSdk`].
#[derive(Debug, Clone)]
pub struct MockSdkConfig {
    /// Whether the driver module can be found on disk.
    pub module_present: bool,
    /// Fail opening the module object.
    pub module_open_fails: bool,
    /// Fail capability enumeration on the module object.
    pub module_enumeration_fails: bool,
    /// Child ids whose open call fails.
    pub failing_object_ids: Vec<u32>,
    /// Operations removed from the advertised capabilities.
    pub withheld: Vec<(CapabilityId, CapOperations)>,
    /// Number of children a source reports on successive polls after an item
    /// was last released; the last entry repeats.
    pub children_schedule: Vec<u32>,
    /// Id given to the first produced item; later items count up.
    pub first_item_id: u32,
    /// Data-type bitmask items report.
    pub data_types: u32,
    /// Bytes delivered for each acquired image.
    pub image: Vec<u8>,
    /// Size of each delivered chunk.
    pub chunk_size: usize,
    /// Fault reported through the capture completion.
    pub capture_fault: Option<SdkError>,
    /// Never complete the acquire process.
    pub acquire_hangs: bool,
    /// Value of the camera-type capability.
    pub camera_type: u32,
}

impl Default for MockSdkConfig {
    fn default() -> Self {
        Self {
            module_present: true,
            module_open_fails: false,
            module_enumeration_fails: false,
            failing_object_ids: Vec::new(),
            withheld: Vec::new(),
            children_schedule: vec![1],
            first_item_id: 0x1000,
            data_types: DATA_OBJ_TYPE_IMAGE,
            image: (0..4096u32).map(|i| (i % 251) as u8).collect(),
            chunk_size: 1024,
            capture_fault: None,
            acquire_hangs: false,
            camera_type: 750,
        }
    }
}

#[derive(Debug)]
struct MockObject {
    id: u32,
    kind: NodeKind,
}

enum Pending {
    Complete(CompletionToken, SdkResult<()>),
    Deliver {
        data_object: ObjectHandle,
        token: CompletionToken,
    },
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    objects: HashMap<ObjectHandle, MockObject>,
    values: HashMap<(ObjectHandle, CapabilityId), CapValue>,
    data_procs: HashMap<ObjectHandle, DataCallback>,
    event_handler: Option<EventHandler>,
    pending: Vec<Pending>,
    calls: Vec<SdkCall>,
    polls: usize,
    next_item_id: u32,
    loaded: bool,
}

/// Simulated vendor capture SDK.
pub struct MockCaptureSdk {
    config: MockSdkConfig,
    state: Mutex<MockState>,
}

impl MockCaptureSdk {
    /// Simulated SDK behaving as `config` describes.
    pub fn new(config: MockSdkConfig) -> Self {
        let state = MockState {
            next_handle: 1,
            next_item_id: config.first_item_id,
            ..MockState::default()
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Every recorded call, in order.
    pub fn calls(&self) -> Vec<SdkCall> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls matching `call`.
    pub fn call_count(&self, call: &SdkCall) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    /// Whether `handle` is still open.
    pub fn is_open(&self, handle: ObjectHandle) -> bool {
        self.state.lock().objects.contains_key(&handle)
    }

    /// Objects opened and not yet closed.
    pub fn open_object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Whether a data-delivery callback is installed on any object.
    pub fn has_data_proc(&self) -> bool {
        !self.state.lock().data_procs.is_empty()
    }

    /// Whether the driver module is loaded.
    pub fn is_loaded(&self) -> bool {
        self.state.lock().loaded
    }

    fn capabilities_for(&self, kind: NodeKind) -> Vec<CapabilityInfo> {
        use CapabilityId as C;
        let get = CapOperations::GET;
        let get_set = CapOperations::GET | CapOperations::SET;
        let start = CapOperations::START;

        let base = match kind {
            NodeKind::Module => vec![
                CapabilityInfo::new(C::ModuleMode, CapType::Unsigned, get_set),
                CapabilityInfo::new(C::Children, CapType::Enum, get),
            ],
            NodeKind::Source => vec![
                CapabilityInfo::new(C::Children, CapType::Enum, get),
                CapabilityInfo::new(C::Capture, CapType::Process, start),
                CapabilityInfo::new(C::TerminateCapture, CapType::Process, start),
                CapabilityInfo::new(C::CameraType, CapType::Unsigned, get),
                CapabilityInfo::new(C::Sensitivity, CapType::Enum, get_set),
                CapabilityInfo::new(C::IsoControl, CapType::Boolean, get_set),
                CapabilityInfo::new(C::ShutterSpeed, CapType::Enum, get_set),
                CapabilityInfo::new(C::WbMode, CapType::Enum, get_set),
                CapabilityInfo::new(C::NoiseReduction, CapType::Boolean, get_set),
                CapabilityInfo::new(C::NoiseReductionHighIso, CapType::Unsigned, get_set),
                CapabilityInfo::new(C::CompressionLevel, CapType::Enum, get_set),
                CapabilityInfo::new(C::PictureControl, CapType::Enum, get_set),
                CapabilityInfo::new(C::ActiveDLighting, CapType::Unsigned, get_set),
            ],
            NodeKind::Item => vec![CapabilityInfo::new(C::DataTypes, CapType::Unsigned, get)],
            NodeKind::DataObject => vec![
                CapabilityInfo::new(C::DataProc, CapType::Callback, CapOperations::SET),
                CapabilityInfo::new(C::Acquire, CapType::Process, start),
            ],
        };

        base.into_iter()
            .filter_map(|mut info| {
                for (cap, ops) in &self.config.withheld {
                    if *cap == info.id {
                        info.operations.remove(*ops);
                    }
                }
                (!info.operations.is_empty()).then_some(info)
            })
            .collect()
    }

    fn children_now(&self, state: &mut MockState) -> u32 {
        let schedule = &self.config.children_schedule;
        let count = schedule
            .get(state.polls)
            .or_else(|| schedule.last())
            .copied()
            .unwrap_or(0);
        state.polls += 1;
        count
    }

    fn default_value(cap: CapabilityId) -> CapValue {
        match cap {
            CapabilityId::Sensitivity => CapValue::Enum(EnumValue {
                value: 0,
                elements: 29,
            }),
            CapabilityId::ShutterSpeed => CapValue::Enum(EnumValue {
                value: 20,
                elements: 56,
            }),
            CapabilityId::WbMode
            | CapabilityId::CompressionLevel
            | CapabilityId::PictureControl => CapValue::Enum(EnumValue {
                value: 0,
                elements: 8,
            }),
            CapabilityId::IsoControl | CapabilityId::NoiseReduction => CapValue::Boolean(true),
            _ => CapValue::Unsigned(0),
        }
    }

    fn kind_of(state: &MockState, handle: ObjectHandle) -> SdkResult<NodeKind> {
        state
            .objects
            .get(&handle)
            .map(|o| o.kind)
            .ok_or_else(|| SdkError::new(-4, format!("object {:?} is not open", handle)))
    }
}

impl Default for MockCaptureSdk {
    fn default() -> Self {
        Self::new(MockSdkConfig::default())
    }
}

impl CaptureSdk for MockCaptureSdk {
    fn search_module(&self) -> Option<PathBuf> {
        self.config
            .module_present
            .then(|| PathBuf::from("Type0015 Module.md3"))
    }

    fn load_module(&self, path: &Path) -> SdkResult<()> {
        debug!("Mock module loaded from {}", path.display());
        self.state.lock().loaded = true;
        Ok(())
    }

    fn unload_module(&self) {
        self.state.lock().loaded = false;
    }

    fn open_object(&self, parent: Option<ObjectHandle>, id: u32) -> SdkResult<ObjectHandle> {
        let mut state = self.state.lock();
        state.calls.push(SdkCall::Open(id));

        let kind = match parent {
            None if self.config.module_open_fails => {
                return Err(SdkError::new(-2, "module object unavailable"))
            }
            None => NodeKind::Module,
            Some(parent) => Self::kind_of(&state, parent)?
                .child_kind()
                .ok_or_else(|| SdkError::new(-3, "object has no children"))?,
        };
        if parent.is_some() && self.config.failing_object_ids.contains(&id) {
            return Err(SdkError::new(-5, format!("object {id} refused to open")));
        }

        let handle = ObjectHandle(state.next_handle);
        state.next_handle += 1;
        state.objects.insert(handle, MockObject { id, kind });
        Ok(handle)
    }

    fn close_object(&self, handle: ObjectHandle) -> SdkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(SdkCall::Close(handle));
        let object = state
            .objects
            .remove(&handle)
            .ok_or_else(|| SdkError::new(-4, format!("object {:?} is not open", handle)))?;
        state.values.retain(|(h, _), _| *h != handle);
        state.data_procs.remove(&handle);
        if object.kind == NodeKind::Item {
            state.polls = 0;
        }
        debug!("Mock {:?} {} closed", object.kind, object.id);
        Ok(())
    }

    fn enum_capabilities(&self, handle: ObjectHandle) -> SdkResult<Vec<CapabilityInfo>> {
        let state = self.state.lock();
        let kind = Self::kind_of(&state, handle)?;
        if kind == NodeKind::Module && self.config.module_enumeration_fails {
            return Err(SdkError::new(-6, "capability table unavailable"));
        }
        Ok(self.capabilities_for(kind))
    }

    fn set_event_handler(
        &self,
        handle: ObjectHandle,
        handler: Option<EventHandler>,
    ) -> SdkResult<()> {
        let mut state = self.state.lock();
        Self::kind_of(&state, handle)?;
        state.event_handler = handler;
        Ok(())
    }

    fn cap_get(&self, handle: ObjectHandle, cap: CapabilityId) -> SdkResult<CapValue> {
        let mut state = self.state.lock();
        state.calls.push(SdkCall::Get(cap));
        let kind = Self::kind_of(&state, handle)?;

        let value = match (kind, cap) {
            (NodeKind::Module, CapabilityId::Children) => CapValue::Enum(EnumValue {
                value: 1,
                elements: 1,
            }),
            (NodeKind::Source, CapabilityId::Children) => {
                let elements = self.children_now(&mut state);
                CapValue::Enum(EnumValue { value: 0, elements })
            }
            (NodeKind::Source, CapabilityId::CameraType) => {
                CapValue::Unsigned(self.config.camera_type)
            }
            (NodeKind::Item, CapabilityId::DataTypes) => CapValue::Unsigned(self.config.data_types),
            _ => state
                .values
                .get(&(handle, cap))
                .cloned()
                .unwrap_or_else(|| Self::default_value(cap)),
        };
        Ok(value)
    }

    fn cap_set(&self, handle: ObjectHandle, cap: CapabilityId, value: CapValue) -> SdkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(SdkCall::Set(cap));
        Self::kind_of(&state, handle)?;

        match (cap, value) {
            (CapabilityId::DataProc, CapValue::Callback(callback)) => {
                state.data_procs.insert(handle, callback);
            }
            (CapabilityId::DataProc, CapValue::Null) => {
                state.data_procs.remove(&handle);
            }
            (CapabilityId::DataProc, other) => {
                return Err(SdkError::new(-7, format!("bad data proc value {other:?}")))
            }
            (cap, value) => {
                state.values.insert((handle, cap), value);
            }
        }
        Ok(())
    }

    fn cap_start(
        &self,
        handle: ObjectHandle,
        cap: CapabilityId,
        _param: CapValue,
        completion: CompletionToken,
    ) -> SdkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(SdkCall::Start(cap));
        Self::kind_of(&state, handle)?;

        match cap {
            CapabilityId::Capture => {
                let result = match &self.config.capture_fault {
                    Some(fault) => Err(fault.clone()),
                    None => Ok(()),
                };
                state.pending.push(Pending::Complete(completion, result));
            }
            CapabilityId::TerminateCapture => {
                state.pending.push(Pending::Complete(completion, Ok(())));
            }
            CapabilityId::Acquire => {
                if !self.config.acquire_hangs {
                    state.pending.push(Pending::Deliver {
                        data_object: handle,
                        token: completion,
                    });
                }
            }
            other => return Err(SdkError::new(-8, format!("{other:?} is not a process"))),
        }
        Ok(())
    }

    fn cap_get_array(&self, handle: ObjectHandle, cap: CapabilityId) -> SdkResult<Vec<u32>> {
        let (ids, handler) = {
            let mut state = self.state.lock();
            state.calls.push(SdkCall::GetArray(cap));
            let kind = Self::kind_of(&state, handle)?;
            if (kind, cap) != (NodeKind::Source, CapabilityId::Children) {
                return Err(SdkError::new(-9, format!("{cap:?} is not an array")));
            }
            let count = self
                .config
                .children_schedule
                .iter()
                .copied()
                .find(|n| *n > 0)
                .unwrap_or(1);
            let first = state.next_item_id;
            state.next_item_id += count;
            ((first..first + count).collect::<Vec<u32>>(), state.event_handler.clone())
        };

        if let (Some(handler), Some(first)) = (handler, ids.first()) {
            handler(ModuleEvent::AddChild(*first));
        }
        Ok(ids)
    }

    fn pump(&self, _handle: ObjectHandle) -> SdkResult<()> {
        let pending = std::mem::take(&mut self.state.lock().pending);

        for work in pending {
            match work {
                Pending::Complete(token, result) => token.complete(result),
                Pending::Deliver { data_object, token } => {
                    let callback = self.state.lock().data_procs.get(&data_object).cloned();
                    match callback {
                        Some(callback) => {
                            for chunk in self.config.image.chunks(self.config.chunk_size.max(1)) {
                                callback(chunk);
                            }
                            token.complete(Ok(()));
                        }
                        None => token.complete(Err(SdkError::new(-10, "no data proc installed"))),
                    }
                }
            }
        }
        Ok(())
    }
}
