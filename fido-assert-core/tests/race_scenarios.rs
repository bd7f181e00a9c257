//! Race scenarios driven through the public API.

use std::sync::Arc;
use std::time::Duration;

use fido_assert_core::{
    AssertionRace, AssertionRequest, AssertionTask, Capability, ClientDataHash,
    CredentialDescriptor, DeviceHandle, MockDevice, MockReply, ProtocolVersion, RaceConfig,
    RequestError, ResponseCode, TaskOutcome, TaskState, UserEntity,
};
use tokio::sync::mpsc;

const CREDENTIAL: &[u8] = &[0xC0, 0xFF, 0xEE];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn request() -> AssertionRequest {
    AssertionRequest::builder("login.example.com", ClientDataHash::new([0x5A; 32]))
        .allow_credential(CredentialDescriptor::new(CREDENTIAL.to_vec()))
        .build()
        .expect("valid request")
}

fn failing(code: ResponseCode) -> MockDevice {
    MockDevice::new(Capability::SupportsModernProtocol).modern(MockReply::Code(code))
}

#[tokio::test]
async fn single_modern_device_signs_on_first_exchange() {
    init_tracing();
    let device = MockDevice::modern_success();
    let probe = device.probe();

    let response = AssertionRace::default()
        .submit(request(), vec![DeviceHandle::new("usb-0", device)])
        .wait()
        .await
        .expect("assertion");

    assert_eq!(response.credential_id, CREDENTIAL);
    assert!(!response.signature.is_empty());
    assert!(response.auth_data.user_present());
    assert_eq!(probe.exchanges(), vec![ProtocolVersion::Modern]);
}

#[tokio::test]
async fn protocol_mismatch_then_legacy_success_takes_two_exchanges() {
    init_tracing();
    let device = MockDevice::new(Capability::SupportsModernProtocol)
        .modern(MockReply::Code(ResponseCode::ProtocolMismatch))
        .legacy(MockReply::Success);
    let probe = device.probe();

    let response = AssertionRace::default()
        .submit(request(), vec![DeviceHandle::new("usb-0", device)])
        .wait()
        .await
        .expect("assertion");

    assert_eq!(response.credential_id, CREDENTIAL);
    assert_eq!(probe.exchange_count(), 2);
    assert_eq!(
        probe.exchanges(),
        vec![ProtocolVersion::Modern, ProtocolVersion::Legacy]
    );
}

#[tokio::test]
async fn unsupported_option_falls_back_exactly_once() {
    let device = MockDevice::new(Capability::SupportsModernProtocol)
        .modern(MockReply::Code(ResponseCode::UnsupportedOption))
        .legacy(MockReply::Code(ResponseCode::UserActionTimeout));
    let probe = device.probe();

    let result = AssertionRace::default()
        .submit(request(), vec![DeviceHandle::new("usb-0", device)])
        .wait()
        .await;

    assert_eq!(result.unwrap_err(), RequestError::AllDevicesFailed);
    assert_eq!(
        probe.exchanges(),
        vec![ProtocolVersion::Modern, ProtocolVersion::Legacy]
    );
}

#[tokio::test]
async fn legacy_only_device_never_sees_modern_exchange() {
    let device = MockDevice::legacy_success();
    let probe = device.probe();

    let response = AssertionRace::default()
        .submit(request(), vec![DeviceHandle::new("nfc-0", device)])
        .wait()
        .await
        .expect("assertion");

    assert_eq!(response.credential_id, CREDENTIAL);
    assert_eq!(probe.exchanges(), vec![ProtocolVersion::Legacy]);
}

#[tokio::test]
async fn winner_cancels_every_other_device() {
    init_tracing();
    let winner = MockDevice::modern_success();
    let slow = MockDevice::modern_success().gated();
    let legacy = MockDevice::legacy_success().gated();
    let (slow_probe, legacy_probe) = (slow.probe(), legacy.probe());

    let response = AssertionRace::default()
        .submit(
            request(),
            vec![
                DeviceHandle::new("winner", winner),
                DeviceHandle::new("slow", slow),
                DeviceHandle::new("legacy", legacy),
            ],
        )
        .wait()
        .await
        .expect("assertion");

    assert_eq!(response.credential_id, CREDENTIAL);
    // Losers finish their exchange but nothing more is attempted.
    slow_probe.release();
    legacy_probe.release();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(slow_probe.exchange_count() <= 1);
    assert!(legacy_probe.exchange_count() <= 1);
}

#[tokio::test]
async fn all_invalid_credential_is_no_eligible_device() {
    let result = AssertionRace::default()
        .submit(
            request(),
            vec![
                DeviceHandle::new("a", failing(ResponseCode::InvalidCredential)),
                DeviceHandle::new(
                    "b",
                    MockDevice::new(Capability::LegacyOnly)
                        .legacy(MockReply::Code(ResponseCode::InvalidCredential)),
                ),
            ],
        )
        .wait()
        .await;

    assert_eq!(result.unwrap_err(), RequestError::NoEligibleDevice);
}

#[tokio::test]
async fn mixed_failures_are_all_devices_failed() {
    let result = AssertionRace::default()
        .submit(
            request(),
            vec![
                DeviceHandle::new("a", failing(ResponseCode::InvalidCredential)),
                DeviceHandle::new("b", failing(ResponseCode::TransportError)),
                DeviceHandle::new("c", MockDevice::unreachable()),
            ],
        )
        .wait()
        .await;

    assert_eq!(result.unwrap_err(), RequestError::AllDevicesFailed);
}

#[tokio::test]
async fn first_processed_report_wins_and_later_success_is_cancelled() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let a = MockDevice::modern_success().with_seed(0xA).gated();
    let b = MockDevice::modern_success().with_seed(0xB).gated();
    let (probe_a, probe_b) = (a.probe(), b.probe());
    let task_a = AssertionTask::new(DeviceHandle::new("a", a), tx.clone());
    let task_b = AssertionTask::new(DeviceHandle::new("b", b), tx);

    let request = Arc::new(request());
    task_a.start(Arc::clone(&request));
    task_b.start(request);
    probe_a.wait_for_exchanges(1).await;
    probe_b.wait_for_exchanges(1).await;

    // B reports success first, then A.
    probe_b.release();
    let report_b = rx.recv().await.expect("report from b");
    probe_a.release();
    let report_a = rx.recv().await.expect("report from a");
    assert!(matches!(report_b.outcome(), TaskOutcome::Success(_)));

    // A's notification is processed first.
    let accepted = report_a.accept().expect("a accepted");
    task_b.cancel();

    assert!(matches!(accepted.outcome, TaskOutcome::Success(_)));
    assert_eq!(accepted.device_id.as_str(), "a");
    assert!(report_b.accept().is_none());
    assert_eq!(task_b.state(), TaskState::Cancelled);
}

#[tokio::test]
async fn cancel_all_mid_race_resolves_user_cancelled() {
    let a = MockDevice::modern_success().gated();
    let b = MockDevice::legacy_success().gated();
    let (probe_a, probe_b) = (a.probe(), b.probe());

    let pending = AssertionRace::default().submit(
        request(),
        vec![DeviceHandle::new("a", a), DeviceHandle::new("b", b)],
    );
    probe_a.wait_for_exchanges(1).await;
    probe_b.wait_for_exchanges(1).await;

    pending.cancel_all();
    let result = pending.wait().await;

    // Exchanges that finish afterwards have nowhere to go.
    probe_a.release();
    probe_b.release();
    assert_eq!(result.unwrap_err(), RequestError::UserCancelled);
}

#[tokio::test]
async fn hot_plugged_device_joins_running_race() {
    let pending = AssertionRace::default().submit(request(), Vec::new());

    pending
        .controller()
        .attach(DeviceHandle::new("late", MockDevice::modern_success()));

    let response = pending.wait().await.expect("assertion");
    assert_eq!(response.credential_id, CREDENTIAL);
}

#[tokio::test]
async fn detached_device_fails_the_race() {
    let device = MockDevice::modern_success().gated();
    let probe = device.probe();

    let pending =
        AssertionRace::default().submit(request(), vec![DeviceHandle::new("a", device)]);
    probe.wait_for_exchanges(1).await;
    pending.controller().detach("a");

    assert_eq!(pending.wait().await.unwrap_err(), RequestError::AllDevicesFailed);
    probe.release();
}

#[tokio::test]
async fn deadline_resolves_timeout() {
    let config = RaceConfig {
        deadline: Some(Duration::from_millis(50)),
        ..RaceConfig::default()
    };
    let device = MockDevice::modern_success().gated();

    let result = AssertionRace::new(config)
        .submit(request(), vec![DeviceHandle::new("a", device)])
        .wait()
        .await;

    assert_eq!(result.unwrap_err(), RequestError::Timeout);
}

#[tokio::test]
async fn transport_error_is_retried_with_backoff() {
    let config = RaceConfig {
        transport_retries: 2,
        retry_initial_interval: Duration::from_millis(1),
        retry_max_interval: Duration::from_millis(5),
        ..RaceConfig::default()
    };
    let device = MockDevice::new(Capability::SupportsModernProtocol)
        .modern(MockReply::Io("usb stall".into()))
        .modern(MockReply::Code(ResponseCode::TransportError))
        .modern(MockReply::Success);
    let probe = device.probe();

    let response = AssertionRace::new(config)
        .submit(request(), vec![DeviceHandle::new("a", device)])
        .wait()
        .await
        .expect("assertion after retries");

    assert_eq!(response.credential_id, CREDENTIAL);
    assert_eq!(probe.exchange_count(), 3);
}

#[tokio::test]
async fn resident_credential_returns_user_entity() {
    let user = UserEntity {
        id: vec![0x01, 0x02],
        name: Some("alice@example.com".into()),
    };
    let device = MockDevice::modern_success().with_resident_credential(vec![0x77], user.clone());
    let request = AssertionRequest::builder("login.example.com", ClientDataHash::new([1; 32]))
        .build()
        .expect("valid request");

    let response = AssertionRace::default()
        .submit(request, vec![DeviceHandle::new("a", device)])
        .wait()
        .await
        .expect("assertion");

    assert_eq!(response.credential_id, vec![0x77]);
    assert_eq!(response.user, Some(user));
}

#[tokio::test]
async fn legacy_device_with_empty_allow_list_is_not_eligible() {
    let request = AssertionRequest::builder("login.example.com", ClientDataHash::new([1; 32]))
        .build()
        .expect("valid request");

    let result = AssertionRace::default()
        .submit(request, vec![DeviceHandle::new("u2f", MockDevice::legacy_success())])
        .wait()
        .await;

    assert_eq!(result.unwrap_err(), RequestError::NoEligibleDevice);
}
