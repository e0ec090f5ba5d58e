mod common;

use std::time::Duration;

use ace_core::config::AceConfig;
use ace_core::device::AceDevice;
use ace_core::error::AceError;
use ace_core::notify::Notification;
use ace_core::protocol::RequestError;
use ace_core::runtime::{self, AceHandle, TokioTimers};
use ace_core::scheduler::{TimerQueue, TokioClock};
use common::{status_result, MockTransport};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn spawn_device(
    config: AceConfig,
) -> (
    AceHandle<TokioTimers>,
    JoinHandle<()>,
    MockTransport,
    mpsc::UnboundedReceiver<Notification>,
) {
    let transport = MockTransport::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let device = AceDevice::new(
        config,
        Box::new(transport.clone()),
        Box::new(tx),
        TimerQueue::new(TokioClock),
    )
    .unwrap();
    let (handle, task) = runtime::spawn(device);
    (handle, task, transport, rx)
}

/// Plays the device side: answers every request a few ms after it is written
fn auto_respond(transport: MockTransport) -> JoinHandle<()> {
    auto_respond_with_ready(transport, vec![0, 1, 2, 3])
}

fn auto_respond_with_ready(transport: MockTransport, ready: Vec<u8>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            for request in transport.take_requests() {
                let reply = match request.method.as_str() {
                    "get_status" => json!({
                        "id": request.id, "code": 0, "msg": "success",
                        "result": status_result("ready", 4, &ready)
                    }),
                    "get_info" => json!({
                        "id": request.id, "code": 0, "msg": "success",
                        "result": {"model": "ACE-1", "firmware": "V1.3.84"}
                    }),
                    "get_filament_info" => json!({
                        "id": request.id, "code": 0, "msg": "success",
                        "result": {"index": 0, "sku": "AHPLBK-101", "rfid": 2}
                    }),
                    "feed_filament" => json!({
                        "id": request.id, "code": 3, "msg": "slot is busy"
                    }),
                    _ => json!({"id": request.id, "code": 0, "msg": "success", "result": {}}),
                };
                transport.respond(reply);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_request_through_handle() {
    let (ace, task, transport, mut notifications) = spawn_device(AceConfig::default());
    let responder = auto_respond(transport.clone());

    let response = ace
        .request(|device, reply| device.filament_info(0, Some(reply)))
        .await
        .unwrap();
    assert_eq!(response.result_str("sku"), Some("AHPLBK-101"));
    assert!(ace.is_connected().await.unwrap());
    assert_eq!(
        notifications.recv().await,
        Some(Notification::Connected {
            model: "ACE-1".to_string(),
            firmware: "V1.3.84".to_string()
        })
    );

    ace.shutdown().await.unwrap();
    task.await.unwrap();
    responder.abort();
    assert!(!transport.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_application_error_through_handle() {
    let (ace, _task, transport, _notifications) = spawn_device(AceConfig::default());
    let _responder = auto_respond(transport);

    let err = ace
        .request(|device, reply| device.feed(1, 20, None, Some(reply)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AceError::Request(RequestError::Application { code: 3, .. })
    ));

    let err = ace
        .request(|device, reply| device.feed(9, 20, None, Some(reply)))
        .await
        .unwrap_err();
    assert!(matches!(err, AceError::InvalidArgument { name: "index", .. }));
}

#[tokio::test(start_paused = true)]
async fn test_park_through_handle() {
    let (ace, _task, transport, mut notifications) = spawn_device(AceConfig::default());
    let _responder = auto_respond(transport);

    // wait for the first status poll so the slots are known
    loop {
        let status = ace.status().await.unwrap();
        if status.is_slot_ready(2) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    ace.park_to_toolhead(2).await.unwrap();
    loop {
        match notifications.recv().await {
            Some(Notification::ParkCompleted { slot }) => {
                assert_eq!(slot, 2);
                break;
            }
            Some(_) => continue,
            None => panic!("notifier closed before the park completed"),
        }
    }
    assert!(!ace.call(|device| device.is_parking()).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_park_of_empty_slot_is_refused_and_handle_stays_usable() {
    let (ace, task, transport, _notifications) = spawn_device(AceConfig::default());
    let _responder = auto_respond_with_ready(transport, vec![0]);

    loop {
        if ace.status().await.unwrap().is_slot_ready(0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let err = ace.park_to_toolhead(3).await.unwrap_err();
    assert!(matches!(err, AceError::SlotNotReady(3)));
    assert!(!task.is_finished());
    assert!(ace.is_connected().await.unwrap());

    ace.park_to_toolhead(0).await.unwrap();
    assert!(ace.call(|device| device.is_parking()).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let (ace, _task, _transport, _notifications) = spawn_device(AceConfig::default());

    let err = ace
        .request(|device, reply| device.filament_info(1, Some(reply)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AceError::Request(RequestError::Timeout { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handles_stops_the_task() {
    let (ace, task, transport, _notifications) = spawn_device(AceConfig::default());
    assert!(ace.is_connected().await.unwrap());
    drop(ace);
    task.await.unwrap();
    assert!(!transport.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_calls_after_shutdown_fail() {
    let (ace, task, _transport, _notifications) = spawn_device(AceConfig::default());
    ace.shutdown().await.unwrap();
    task.await.unwrap();
    assert!(matches!(
        ace.status().await,
        Err(AceError::DeviceStopped)
    ));
}
