//! Capture state machine
//!
//! One exposure walks a fixed sequence of states:
//!
//! ```text
//! Idle -> Arming -> Exposing -> Terminating -> DiscoveringItem
//!      -> AcquiringImage -> Cleanup -> Complete | Failed
//! ```
//!
//! Two triggers share the sequence. [`Trigger::Vendor`] lets the camera time
//! the exposure through the `Capture`/`TerminateCapture` processes and arms
//! only when `Capture` can be started. [`Trigger::Serial`] arms only when the
//! shutter speed can be set, holds the shutter open with the external release
//! accessory and skips `Terminating`. They also differ in how many times the
//! source is polled for the produced item.
//!
//! Once an item id has been discovered, the item node is removed from the
//! source again whatever the outcome, and the data-delivery callback is
//! always cleared after an acquire was attempted.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::bridge::{CompletionBridge, CompletionToken};
use crate::capability::CapabilityGate;
use crate::config::CaptureSettings;
use crate::error::{AppResult, CaptureError};
use crate::sdk::{
    CapOperations, CapType, CapValue, CapabilityId, DataCallback, TerminateParams,
    DATA_OBJ_TYPE_IMAGE,
};
use crate::shutter::ShutterController;
use crate::tree::DeviceNode;

/// States of one capture cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Not started.
    Idle,
    /// Checking capabilities and opening the release.
    Arming,
    /// Shutter open.
    Exposing,
    /// Ending the vendor capture.
    Terminating,
    /// Polling the source for the new item.
    DiscoveringItem,
    /// Streaming the image data.
    AcquiringImage,
    /// Releasing the item.
    Cleanup,
    /// Image returned.
    Complete,
    /// Cycle aborted with an error.
    Failed,
}

/// How the shutter is released.
#[derive(Debug)]
pub enum Trigger {
    /// The camera times the exposure itself (bulb via `Capture`/`TerminateCapture`).
    Vendor,
    /// The external release accessory holds the shutter open.
    Serial(ShutterController),
}

impl Trigger {
    /// Item polls allowed for this trigger.
    pub fn discovery_attempts(&self, settings: &CaptureSettings) -> u32 {
        match self {
            Trigger::Vendor => settings.vendor_discovery_attempts,
            Trigger::Serial(_) => settings.serial_discovery_attempts,
        }
    }

    /// Short label for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::Vendor => "vendor",
            Trigger::Serial(_) => "serial",
        }
    }
}

/// Transient state of one exposure.
#[derive(Debug)]
pub struct CaptureSession {
    exposure: Duration,
    state: CaptureState,
    history: Vec<CaptureState>,
    item_id: Option<u32>,
    camera_type: Option<u32>,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CaptureSession {
    /// Session for an exposure of `exposure`.
    pub fn new(exposure: Duration) -> Self {
        Self {
            exposure,
            state: CaptureState::Idle,
            history: vec![CaptureState::Idle],
            item_id: None,
            camera_type: None,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Requested exposure length.
    pub fn exposure(&self) -> Duration {
        self.exposure
    }

    /// Current state.
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Every state entered, in order.
    pub fn history(&self) -> &[CaptureState] {
        &self.history
    }

    /// Id of the produced item, once discovered.
    pub fn item_id(&self) -> Option<u32> {
        self.item_id
    }

    /// Camera type read after terminating a vendor-timed capture.
    pub fn camera_type(&self) -> Option<u32> {
        self.camera_type
    }

    fn enter(&mut self, state: CaptureState) {
        debug!("Capture {:?} -> {:?}", self.state, state);
        self.state = state;
        self.history.push(state);
    }
}

/// Runs capture cycles against one source node.
#[derive(Clone)]
pub struct CaptureEngine {
    gate: CapabilityGate,
    bridge: CompletionBridge,
    settings: CaptureSettings,
}

impl CaptureEngine {
    /// Engine issuing calls through `gate`.
    pub fn new(gate: CapabilityGate, settings: &CaptureSettings) -> Self {
        Self {
            gate,
            bridge: CompletionBridge::from_settings(settings),
            settings: settings.clone(),
        }
    }

    /// Run one full cycle and return the image bytes.
    ///
    /// The session ends in [`CaptureState::Complete`] or
    /// [`CaptureState::Failed`].
    pub async fn run(
        &self,
        session: &mut CaptureSession,
        source: &mut DeviceNode,
        trigger: &mut Trigger,
    ) -> AppResult<Bytes> {
        info!(
            "Starting {} capture of {:?}",
            trigger.name(),
            session.exposure
        );
        let result = self.drive(session, source, trigger).await;

        if let Some(id) = session.item_id {
            session.enter(CaptureState::Cleanup);
            source.remove_child(self.gate.sdk(), id);
        }

        match result {
            Ok(bytes) => {
                session.enter(CaptureState::Complete);
                info!("Capture complete ({} bytes)", bytes.len());
                Ok(bytes)
            }
            Err(err) => {
                session.enter(CaptureState::Failed);
                warn!("Capture failed: {}", err);
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        session: &mut CaptureSession,
        source: &mut DeviceNode,
        trigger: &mut Trigger,
    ) -> AppResult<Bytes> {
        session.enter(CaptureState::Arming);
        match trigger {
            Trigger::Vendor => {
                self.gate
                    .require(source, CapabilityId::Capture, CapOperations::START)?;
            }
            Trigger::Serial(shutter) => {
                // The body must accept the bulb setting the release relies on.
                self.gate
                    .require(source, CapabilityId::ShutterSpeed, CapOperations::SET)?;
                shutter.open_session().await?;
            }
        }

        session.enter(CaptureState::Exposing);
        match trigger {
            Trigger::Vendor => self.expose_vendor(source, session.exposure).await?,
            Trigger::Serial(shutter) => expose_serial(shutter, session.exposure).await?,
        }

        if matches!(trigger, Trigger::Vendor) {
            session.enter(CaptureState::Terminating);
            session.camera_type = self.terminate(source).await?;
        }

        session.enter(CaptureState::DiscoveringItem);
        let budget = trigger.discovery_attempts(&self.settings);
        let id = self.discover_item(source, budget).await?;
        session.item_id = Some(id);

        session.enter(CaptureState::AcquiringImage);
        self.acquire(source, id, &session.buffer).await?;

        let bytes = std::mem::take(&mut *session.buffer.lock());
        Ok(Bytes::from(bytes))
    }

    async fn expose_vendor(&self, source: &DeviceNode, exposure: Duration) -> AppResult<()> {
        let token = CompletionToken::new();
        self.gate
            .start(source, CapabilityId::Capture, CapValue::Null, &token)?;
        self.bridge
            .wait_for_completion(
                self.gate.sdk(),
                source.handle(),
                CapabilityId::Capture,
                &token,
                1,
            )
            .await?;
        if let Err(err) = self.gate.sdk().pump(source.handle()) {
            warn!("Message pump after capture start failed: {}", err);
        }

        sleep(exposure).await;
        Ok(())
    }

    async fn terminate(&self, source: &DeviceNode) -> AppResult<Option<u32>> {
        let token = CompletionToken::new();
        self.gate.start(
            source,
            CapabilityId::TerminateCapture,
            CapValue::Terminate(TerminateParams::default()),
            &token,
        )?;
        self.bridge
            .wait_for_completion(
                self.gate.sdk(),
                source.handle(),
                CapabilityId::TerminateCapture,
                &token,
                1,
            )
            .await?;

        if !source.supports(CapabilityId::CameraType, CapOperations::GET) {
            return Ok(None);
        }
        let camera_type = self.gate.get_unsigned(source, CapabilityId::CameraType)?;
        debug!("Camera type {}", camera_type);
        Ok(Some(camera_type))
    }

    /// Poll the source's children until an item appears, then take the first id.
    async fn discover_item(&self, source: &DeviceNode, budget: u32) -> AppResult<u32> {
        self.gate
            .require_type(source, CapabilityId::Children, CapType::Enum)?;
        self.gate
            .require(source, CapabilityId::Children, CapOperations::GET)?;

        let mut found = false;
        for attempt in 1..=budget {
            sleep(self.settings.poll_interval).await;
            let children = self.gate.get_enum(source, CapabilityId::Children)?;
            if children.elements > 0 {
                debug!(
                    "{} item(s) after {} poll(s)",
                    children.elements, attempt
                );
                found = true;
                break;
            }
            debug!("No item yet (poll {}/{})", attempt, budget);
        }
        if !found {
            return Err(CaptureError::NoImageProduced { attempts: budget });
        }

        let ids = self.gate.get_array(source, CapabilityId::Children)?;
        if ids.len() > 1 {
            debug!("Source reports {} items; taking the first", ids.len());
        }
        ids.first()
            .copied()
            .ok_or(CaptureError::NoImageProduced { attempts: budget })
    }

    async fn acquire(
        &self,
        source: &mut DeviceNode,
        item_id: u32,
        buffer: &Arc<Mutex<Vec<u8>>>,
    ) -> AppResult<()> {
        let sdk = self.gate.sdk();
        let item = source.ensure_child(sdk, item_id)?;

        let data_types = self.gate.get_unsigned(item, CapabilityId::DataTypes)?;
        if data_types & DATA_OBJ_TYPE_IMAGE == 0 {
            return Err(CaptureError::UnsupportedDataType { data_types });
        }

        let data = item.ensure_child(sdk, DATA_OBJ_TYPE_IMAGE)?;
        self.gate
            .require(data, CapabilityId::Acquire, CapOperations::START)?;

        let sink = buffer.clone();
        let deliver: DataCallback = Arc::new(move |chunk: &[u8]| {
            sink.lock().extend_from_slice(chunk);
        });
        self.gate
            .set(data, CapabilityId::DataProc, CapValue::Callback(deliver))?;

        let token = CompletionToken::new();
        let acquired = match self
            .gate
            .start(data, CapabilityId::Acquire, CapValue::Null, &token)
        {
            Ok(()) => {
                self.bridge
                    .wait_for_completion(sdk, data.handle(), CapabilityId::Acquire, &token, 1)
                    .await
            }
            Err(err) => Err(err),
        };

        let reset = self.gate.set(data, CapabilityId::DataProc, CapValue::Null);
        acquired?;
        reset?;
        debug!("Acquired {} bytes from item {:#x}", buffer.lock().len(), item_id);
        Ok(())
    }
}

async fn expose_serial(shutter: &ShutterController, exposure: Duration) -> AppResult<()> {
    let attempts = shutter.open_shutter().await?;
    debug!("Shutter opened after {} attempt(s)", attempts);

    sleep(exposure).await;

    let attempts = shutter.close_shutter().await?;
    debug!("Shutter closed after {} attempt(s)", attempts);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_recovery::RetryPolicy;
    use crate::sdk::mock::{MockCaptureSdk, MockSdkConfig, SdkCall};
    use crate::sdk::{SdkError, DATA_OBJ_TYPE_THUMBNAIL};
    use crate::shutter::mock::{Reply, ScriptedTransport};

    struct Rig {
        sdk: Arc<MockCaptureSdk>,
        engine: CaptureEngine,
        module: DeviceNode,
    }

    fn rig(config: MockSdkConfig) -> Rig {
        let sdk = Arc::new(MockCaptureSdk::new(config));
        let gate = CapabilityGate::new(sdk.clone());
        let mut module = DeviceNode::open_module(gate.sdk()).unwrap();
        module.add_child(gate.sdk(), 1).unwrap();
        let engine = CaptureEngine::new(gate, &CaptureSettings::default());
        Rig {
            sdk,
            engine,
            module,
        }
    }

    impl Rig {
        async fn capture(&mut self, trigger: &mut Trigger) -> (CaptureSession, AppResult<Bytes>) {
            let mut session = CaptureSession::new(Duration::from_secs(1));
            let source = self.module.find_child_mut(1).unwrap();
            let result = self.engine.run(&mut session, source, trigger).await;
            (session, result)
        }

        fn source_children(&self) -> usize {
            self.module.find_child(1).unwrap().child_count()
        }

        fn children_polls(&self) -> usize {
            self.sdk.call_count(&SdkCall::Get(CapabilityId::Children))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_found_on_last_poll() {
        let mut rig = rig(MockSdkConfig {
            children_schedule: vec![0, 0, 0, 0, 1],
            ..MockSdkConfig::default()
        });
        let (session, result) = rig.capture(&mut Trigger::Vendor).await;

        let bytes = result.unwrap();
        assert_eq!(bytes.len(), 4096);
        assert_eq!(rig.children_polls(), 5);
        assert_eq!(session.item_id(), Some(0x1000));
        assert_eq!(session.state(), CaptureState::Complete);
        assert_eq!(rig.source_children(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_image_after_budget() {
        let mut rig = rig(MockSdkConfig {
            children_schedule: vec![0],
            ..MockSdkConfig::default()
        });
        let (session, result) = rig.capture(&mut Trigger::Vendor).await;

        assert!(matches!(
            result,
            Err(CaptureError::NoImageProduced { attempts: 5 })
        ));
        assert_eq!(rig.children_polls(), 5);
        assert_eq!(session.state(), CaptureState::Failed);
        assert!(!session.history().contains(&CaptureState::Cleanup));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vendor_state_sequence() {
        let mut rig = rig(MockSdkConfig::default());
        let (session, result) = rig.capture(&mut Trigger::Vendor).await;
        result.unwrap();

        use CaptureState::*;
        assert_eq!(
            session.history(),
            &[
                Idle,
                Arming,
                Exposing,
                Terminating,
                DiscoveringItem,
                AcquiringImage,
                Cleanup,
                Complete
            ]
        );
        assert_eq!(session.camera_type(), Some(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_image_item_is_still_released() {
        let mut rig = rig(MockSdkConfig {
            data_types: DATA_OBJ_TYPE_THUMBNAIL,
            ..MockSdkConfig::default()
        });
        let (_, result) = rig.capture(&mut Trigger::Vendor).await;

        assert!(matches!(
            result,
            Err(CaptureError::UnsupportedDataType { data_types }) if data_types == DATA_OBJ_TYPE_THUMBNAIL
        ));
        assert_eq!(rig.source_children(), 0);
        assert_eq!(rig.sdk.open_object_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_acquire_clears_callback() {
        let mut rig = rig(MockSdkConfig {
            acquire_hangs: true,
            ..MockSdkConfig::default()
        });
        let (_, result) = rig.capture(&mut Trigger::Vendor).await;

        assert!(matches!(
            result,
            Err(CaptureError::CompletionTimedOut {
                capability: CapabilityId::Acquire,
                ..
            })
        ));
        assert!(!rig.sdk.has_data_proc());
        assert_eq!(rig.source_children(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_capture_capability_fails_before_sdk() {
        let mut rig = rig(MockSdkConfig {
            withheld: vec![(CapabilityId::Capture, CapOperations::START)],
            ..MockSdkConfig::default()
        });
        let (session, result) = rig.capture(&mut Trigger::Vendor).await;

        assert!(matches!(
            result,
            Err(CaptureError::CapabilityUnsupported {
                capability: CapabilityId::Capture,
                ..
            })
        ));
        assert_eq!(rig.sdk.call_count(&SdkCall::Start(CapabilityId::Capture)), 0);
        assert_eq!(
            session.history(),
            &[CaptureState::Idle, CaptureState::Arming, CaptureState::Failed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_trigger_skips_vendor_processes() {
        let mut rig = rig(MockSdkConfig {
            children_schedule: vec![0; 9].into_iter().chain([1]).collect(),
            ..MockSdkConfig::default()
        });
        let transport = ScriptedTransport::new(vec![Reply::Silent]);
        let shutter = ShutterController::new(Box::new(transport.clone()), RetryPolicy::default());
        let mut trigger = Trigger::Serial(shutter);

        let (session, result) = rig.capture(&mut trigger).await;

        assert_eq!(result.unwrap().len(), 4096);
        assert_eq!(rig.children_polls(), 10);
        assert_eq!(transport.writes(), b"OOC".to_vec());
        assert!(!session.history().contains(&CaptureState::Terminating));
        assert_eq!(rig.sdk.call_count(&SdkCall::Start(CapabilityId::Capture)), 0);
        assert_eq!(
            rig.sdk
                .call_count(&SdkCall::Start(CapabilityId::TerminateCapture)),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_fault_surfaces_completion_failure() {
        let fault = SdkError::new(-7, "shutter busy");
        let mut rig = rig(MockSdkConfig {
            capture_fault: Some(fault.clone()),
            ..MockSdkConfig::default()
        });
        let (session, result) = rig.capture(&mut Trigger::Vendor).await;

        match result {
            Err(CaptureError::CompletionFailed { capability, source }) => {
                assert_eq!(capability, CapabilityId::Capture);
                assert_eq!(source, fault);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(session.state(), CaptureState::Failed);
        assert!(!session.history().contains(&CaptureState::Terminating));
        assert!(!session.history().contains(&CaptureState::Cleanup));
        assert_eq!(rig.source_children(), 0);
        assert_eq!(rig.sdk.open_object_count(), 2);
        assert!(!rig.sdk.has_data_proc());
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_discovery_budget_exhausted() {
        let mut rig = rig(MockSdkConfig {
            children_schedule: vec![0],
            ..MockSdkConfig::default()
        });
        let transport = ScriptedTransport::echoing();
        let shutter = ShutterController::new(Box::new(transport.clone()), RetryPolicy::default());
        let mut trigger = Trigger::Serial(shutter);

        let (session, result) = rig.capture(&mut trigger).await;

        assert!(matches!(
            result,
            Err(CaptureError::NoImageProduced { attempts: 10 })
        ));
        assert_eq!(rig.children_polls(), 10);
        assert_eq!(transport.writes(), b"OC".to_vec());
        assert_eq!(session.state(), CaptureState::Failed);
        assert_eq!(rig.source_children(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_trigger_requires_shutter_speed() {
        let mut rig = rig(MockSdkConfig {
            withheld: vec![(CapabilityId::ShutterSpeed, CapOperations::SET)],
            ..MockSdkConfig::default()
        });
        let transport = ScriptedTransport::echoing();
        let shutter = ShutterController::new(Box::new(transport.clone()), RetryPolicy::default());
        let mut trigger = Trigger::Serial(shutter);

        let (session, result) = rig.capture(&mut trigger).await;

        assert!(matches!(
            result,
            Err(CaptureError::CapabilityUnsupported {
                capability: CapabilityId::ShutterSpeed,
                ..
            })
        ));
        assert_eq!(transport.open_count(), 0);
        assert!(transport.writes().is_empty());
        assert_eq!(
            session.history(),
            &[CaptureState::Idle, CaptureState::Arming, CaptureState::Failed]
        );
    }
}
