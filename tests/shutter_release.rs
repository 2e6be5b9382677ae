//! Shutter-release handshake over a scripted serial accessory.

use std::time::Duration;

use astro_capture::error_recovery::RetryPolicy;
use astro_capture::shutter::mock::{Reply, ScriptedTransport};
use astro_capture::shutter::ShutterController;
use astro_capture::CaptureError;

#[tokio::test(start_paused = true)]
async fn open_succeeds_on_fourth_attempt() {
    let transport = ScriptedTransport::new([
        Reply::Echo(b"opne".to_vec()),
        Reply::Echo(b"clos".to_vec()),
        Reply::Echo(b"xxxx".to_vec()),
        Reply::Echo(b"open".to_vec()),
    ]);
    let mut shutter = ShutterController::new(Box::new(transport.clone()), RetryPolicy::default());
    shutter.open_session().await.unwrap();

    let attempts = shutter.open_shutter().await.unwrap();

    assert_eq!(attempts, 4);
    assert_eq!(transport.attempts(), 4);
    shutter.close_session().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_gives_up_after_budget() {
    let transport = ScriptedTransport::new(vec![Reply::Silent; 10]);
    let policy = RetryPolicy {
        max_attempts: 10,
        backoff_delay: Duration::from_millis(250),
    };
    let mut shutter = ShutterController::new(Box::new(transport.clone()), policy);
    shutter.open_session().await.unwrap();

    let err = shutter.close_shutter().await.unwrap_err();

    assert!(matches!(
        err,
        CaptureError::DeviceNotResponding {
            command: 'C',
            attempts: 10
        }
    ));
    assert_eq!(transport.writes(), vec![b'C'; 10]);
}
