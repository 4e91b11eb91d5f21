//! End-to-end tests for image rejection through a running driver.
//!
//! Each test spawns its own driver and talks to it through real clients:
//! 1. Publication and subscription connect, an image becomes available
//! 2. The subscriber rejects the image
//! 3. Publishers see an error frame and go disconnected
//! 4. The subscriber sees the image go unavailable
//! 5. After the image liveness timeout a replacement image appears
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=ferry=debug cargo test --features tracing --test reject_image -- --nocapture
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serial_test::serial;

use ferry::client::{ImageEvent, Publication, Subscription};
use ferry::driver::commands::NOTIFICATION_QUEUE_CAPACITY;
use ferry::net::Endpoint;
use ferry::{
    Client, ClientConfig, ClientError, Driver, DriverConfig, ErrorCode, NULL_VALUE,
    PublicationErrorFrame, PublicationErrorFrameHandler, SystemCounter,
};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        ferry::init_tracing();
    });
}

const CHANNEL: &str = "ferry:udp?endpoint=localhost:10000";
const IPC_CHANNEL: &str = "ferry:ipc";
const STREAM_ID: i32 = 10000;
const MESSAGE: &[u8] = b"this is a test message";
const REASON: &str = "Needs to be closed";

/// Anything below this after one rejection shows frames are not being spammed.
const NOT_SPAMMING: i64 = 1000;

const AWAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Default)]
struct QueuedErrorFrameHandler {
    frames: Arc<Mutex<VecDeque<PublicationErrorFrame>>>,
}

impl QueuedErrorFrameHandler {
    fn poll(&self) -> Option<PublicationErrorFrame> {
        self.frames.lock().pop_front()
    }
}

impl PublicationErrorFrameHandler for QueuedErrorFrameHandler {
    fn on_publication_error(&self, frame: &PublicationErrorFrame) {
        self.frames.lock().push_back(frame.clone());
    }
}

fn launch(image_liveness_timeout: Duration) -> Driver {
    init_test_tracing();
    let config = DriverConfig::default()
        .with_image_liveness_timeout(image_liveness_timeout)
        .with_publication_connection_timeout(Duration::from_secs(5));
    Driver::spawn(config).expect("spawn driver")
}

fn connect(driver: &Driver, handler: Option<&QueuedErrorFrameHandler>) -> Client {
    let mut config = ClientConfig::default();
    if let Some(handler) = handler {
        config = config.with_error_frame_handler(handler.clone());
    }
    Client::connect(&driver.connector(), config).expect("connect client")
}

/// Spins on `step` until it returns `true`.
fn await_condition(what: &str, mut step: impl FnMut() -> bool) {
    let deadline = Instant::now() + AWAIT_TIMEOUT;
    while !step() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::yield_now();
    }
}

fn await_connected(client: &mut Client, publication: &Publication, subscription: &mut Subscription) {
    await_condition("connection", || {
        client.poll().expect("client poll");
        subscription.poll();
        publication.is_connected() && subscription.is_connected()
    });
}

/// Offers one message and waits until the subscription has received it.
fn offer_and_receive(client: &mut Client, publication: &Publication, subscription: &mut Subscription) {
    await_condition("offer", || publication.offer(MESSAGE).is_ok());
    await_condition("receive", || {
        client.poll().expect("client poll");
        subscription.poll() > 0
    });
}

fn await_frame(client: &mut Client, handler: &QueuedErrorFrameHandler) -> PublicationErrorFrame {
    let mut frame = None;
    await_condition("error frame", || {
        client.poll().expect("client poll");
        frame = handler.poll();
        frame.is_some()
    });
    frame.expect("frame present")
}

#[derive(Debug, Default)]
struct EventCounts {
    available: usize,
    unavailable: usize,
}

impl EventCounts {
    fn update(&mut self, subscription: &mut Subscription) {
        for event in subscription.take_events() {
            match event {
                ImageEvent::Available(_) => self.available += 1,
                ImageEvent::Unavailable(_) => self.unavailable += 1,
            }
        }
    }
}

#[test]
#[serial]
fn should_reject_subscriptions_image() {
    let driver = launch(Duration::from_millis(1234));
    let handler = QueuedErrorFrameHandler::default();
    let mut client = connect(&driver, Some(&handler));

    let publication = client.add_publication(CHANNEL, STREAM_ID).unwrap();
    let mut subscription = client.add_subscription(CHANNEL, STREAM_ID).unwrap();
    await_connected(&mut client, &publication, &mut subscription);
    let mut events = EventCounts::default();
    events.update(&mut subscription);
    assert_eq!(events.available, 1);

    let counters = driver.counters();
    let initial_received = counters.get(SystemCounter::ErrorFramesReceived);
    let initial_sent = counters.get(SystemCounter::ErrorFramesSent);
    let initial_errors = counters.get(SystemCounter::Errors);

    offer_and_receive(&mut client, &publication, &mut subscription);
    let image = subscription.image_at(0).unwrap().clone();
    assert_eq!(publication.position(), image.position());

    client.reject_image(&image, REASON).unwrap();
    let rejected_at = Instant::now();

    await_condition("publication disconnect", || {
        client.poll().expect("client poll");
        !publication.is_connected()
    });
    assert!(rejected_at.elapsed() < Duration::from_secs(5));

    await_condition("error frame counters", || {
        client.poll().expect("client poll");
        counters.get(SystemCounter::ErrorFramesReceived) > initial_received
            && counters.get(SystemCounter::ErrorFramesSent) > initial_sent
    });
    await_condition("errors counter", || counters.get(SystemCounter::Errors) > initial_errors);

    let frame = await_frame(&mut client, &handler);
    assert_eq!(frame.error_message, REASON);
    assert_eq!(frame.error_code, ErrorCode::ImageRejected);
    assert_eq!(frame.registration_id, publication.registration_id());

    await_condition("image unavailable", || {
        client.poll().expect("client poll");
        events.update(&mut subscription);
        events.unavailable > 0
    });

    assert!(counters.get(SystemCounter::ErrorFramesReceived) - initial_received < NOT_SPAMMING);
    assert_eq!(counters.get(SystemCounter::Errors) - initial_errors, 1);
    await_condition("error log entry", || driver.error_log().contains(REASON));

    // Reconnects once the image liveness timeout has passed.
    await_condition("replacement image", || {
        client.poll().expect("client poll");
        events.update(&mut subscription);
        events.available == 2
    });
    assert!(rejected_at.elapsed() >= Duration::from_secs(1));
    await_condition("publication reconnect", || {
        client.poll().expect("client poll");
        publication.is_connected()
    });
    assert!(subscription.is_connected());
    assert_eq!(subscription.image_count(), 1);
    assert_ne!(
        subscription.image_at(0).unwrap().correlation_id(),
        image.correlation_id()
    );
    assert_eq!(counters.get(SystemCounter::Errors) - initial_errors, 1);

    drop(subscription);
    client.close();
    driver.shutdown();
}

#[test]
#[serial]
fn should_only_receive_publication_error_frame_on_relevant_client() {
    let driver = launch(Duration::from_secs(3));
    let handler1 = QueuedErrorFrameHandler::default();
    let handler2 = QueuedErrorFrameHandler::default();
    let mut client1 = connect(&driver, Some(&handler1));
    let mut client2 = connect(&driver, Some(&handler2));

    let publication = client1.add_publication(CHANNEL, STREAM_ID).unwrap();
    let mut subscription = client1.add_subscription(CHANNEL, STREAM_ID).unwrap();
    await_connected(&mut client1, &publication, &mut subscription);
    offer_and_receive(&mut client1, &publication, &mut subscription);

    let image = subscription.image_at(0).unwrap().clone();
    client1.reject_image(&image, REASON).unwrap();

    let frame = await_frame(&mut client1, &handler1);
    assert_eq!(frame.registration_id, publication.registration_id());
    assert_eq!(frame.error_code, ErrorCode::ImageRejected);
    assert_eq!(frame.error_message, REASON);

    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        client2.poll().expect("client poll");
        assert!(
            handler2.poll().is_none(),
            "client without publication should not report error"
        );
        thread::yield_now();
    }

    client2.close();
    client1.close();
    driver.shutdown();
}

#[test]
#[serial]
fn should_receive_publication_error_frames_all_relevant_clients() {
    let driver = launch(Duration::from_secs(3));
    let handler1 = QueuedErrorFrameHandler::default();
    let handler2 = QueuedErrorFrameHandler::default();
    let mut client1 = connect(&driver, Some(&handler1));
    let mut client2 = connect(&driver, Some(&handler2));

    let publication = client1.add_publication(CHANNEL, STREAM_ID).unwrap();
    let publication_other = client2.add_publication(CHANNEL, STREAM_ID).unwrap();
    let mut subscription = client1.add_subscription(CHANNEL, STREAM_ID).unwrap();
    await_connected(&mut client1, &publication, &mut subscription);
    await_condition("other publication connected", || {
        client2.poll().expect("client poll");
        publication_other.is_connected()
    });
    offer_and_receive(&mut client1, &publication, &mut subscription);

    let image = subscription.image_at(0).unwrap().clone();
    client1.reject_image(&image, REASON).unwrap();

    let frame = await_frame(&mut client1, &handler1);
    assert_eq!(frame.registration_id, publication.registration_id());
    assert_eq!(frame.error_code, ErrorCode::ImageRejected);
    assert_eq!(frame.error_message, REASON);

    let frame = await_frame(&mut client2, &handler2);
    assert_eq!(frame.registration_id, publication.registration_id());
    assert_eq!(frame.error_code, ErrorCode::ImageRejected);
    assert_eq!(frame.error_message, REASON);

    assert_eq!(driver.counters().get(SystemCounter::Errors), 1);
    assert_eq!(driver.counters().get(SystemCounter::ErrorFramesSent), 2);

    client2.close();
    client1.close();
    driver.shutdown();
}

#[test]
#[serial]
fn should_reject_subscriptions_image_manual_mdc() {
    let driver = launch(Duration::from_secs(3));
    let handler = QueuedErrorFrameHandler::default();
    let mut client = connect(&driver, Some(&handler));

    let publication = client
        .add_publication("ferry:udp?control-mode=manual", STREAM_ID)
        .unwrap();
    let mut subscription = client.add_subscription(CHANNEL, STREAM_ID).unwrap();
    let destination_registration_id = client.add_destination(&publication, CHANNEL).unwrap();
    await_connected(&mut client, &publication, &mut subscription);

    let counters = driver.counters();
    let initial_received = counters.get(SystemCounter::ErrorFramesReceived);

    offer_and_receive(&mut client, &publication, &mut subscription);
    let image = subscription.image_at(0).unwrap().clone();
    assert_eq!(publication.position(), image.position());

    let mut events = EventCounts::default();
    events.update(&mut subscription);
    let initial_available = events.available;

    client.reject_image(&image, REASON).unwrap();
    let rejected_at = Instant::now();
    await_condition("publication disconnect", || {
        client.poll().expect("client poll");
        !publication.is_connected()
    });
    assert!(rejected_at.elapsed() < Duration::from_secs(5));

    await_condition("error frame received", || {
        client.poll().expect("client poll");
        counters.get(SystemCounter::ErrorFramesReceived) > initial_received
    });
    await_condition("image unavailable", || {
        client.poll().expect("client poll");
        events.update(&mut subscription);
        events.unavailable > 0
    });
    assert!(counters.get(SystemCounter::ErrorFramesReceived) < NOT_SPAMMING);

    await_condition("replacement image", || {
        client.poll().expect("client poll");
        events.update(&mut subscription);
        events.available > initial_available
    });

    let frame = await_frame(&mut client, &handler);
    assert_eq!(frame.error_message, REASON);
    assert_eq!(frame.registration_id, publication.registration_id());
    assert_eq!(frame.destination_registration_id, Some(destination_registration_id));

    drop(subscription);
    client.close();
    driver.shutdown();
}

#[test]
#[serial]
fn should_error_if_rejection_reason_is_too_long() {
    let driver = launch(Duration::from_secs(3));
    let mut client = connect(&driver, None);

    let publication = client.add_publication(CHANNEL, STREAM_ID).unwrap();
    let mut subscription = client.add_subscription(CHANNEL, STREAM_ID).unwrap();
    await_connected(&mut client, &publication, &mut subscription);

    let too_long = "x".repeat(1024);
    let image = subscription.image_at(0).unwrap().clone();
    let err = client.reject_image(&image, &too_long).unwrap_err();
    assert!(
        matches!(
            err,
            ClientError::Driver {
                code: ErrorCode::GenericError,
                ..
            }
        ),
        "{err}"
    );
    assert_eq!(driver.counters().get(SystemCounter::Errors), 0);
    assert!(publication.is_connected());

    drop(subscription);
    client.close();
    driver.shutdown();
}

#[test]
#[serial]
fn should_error_if_rejection_reason_is_too_long_for_local_buffer() {
    let driver = launch(Duration::from_secs(3));
    let mut client = connect(&driver, None);

    let publication = client.add_publication(CHANNEL, STREAM_ID).unwrap();
    let mut subscription = client.add_subscription(CHANNEL, STREAM_ID).unwrap();
    await_connected(&mut client, &publication, &mut subscription);

    let too_long = "x".repeat(1024 * 1024);
    let image = subscription.image_at(0).unwrap().clone();
    let err = client.reject_image(&image, &too_long).unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument(_)), "{err}");
    assert_eq!(driver.counters().get(SystemCounter::Errors), 0);

    drop(subscription);
    client.close();
    driver.shutdown();
}

#[test]
#[serial]
fn should_error_if_using_an_ipc_channel() {
    let driver = launch(Duration::from_secs(3));
    let mut client = connect(&driver, None);

    let publication = client.add_publication(IPC_CHANNEL, STREAM_ID).unwrap();
    let mut subscription = client.add_subscription(IPC_CHANNEL, STREAM_ID).unwrap();
    await_connected(&mut client, &publication, &mut subscription);

    let image = subscription.image_at(0).unwrap().clone();
    let err = client.reject_image(&image, "Reject this").unwrap_err();
    match err {
        ClientError::Driver { code, message } => {
            assert_eq!(code, ErrorCode::UnknownImage);
            assert!(
                message.contains("Unable to resolve image for correlationId"),
                "{message}"
            );
        }
        other => panic!("unexpected error: {other}"),
    }

    drop(subscription);
    client.close();
    driver.shutdown();
}

#[test]
#[serial]
fn commands_succeed_after_notifications_were_dropped() {
    let driver = launch(Duration::from_secs(3));
    let handler = QueuedErrorFrameHandler::default();
    let mut client = connect(&driver, Some(&handler));
    let mut sender = connect(&driver, None);

    let publication = client.add_publication(CHANNEL, STREAM_ID).unwrap();
    let mut subscription = client.add_subscription(CHANNEL, STREAM_ID).unwrap();
    await_connected(&mut client, &publication, &mut subscription);
    let image = subscription.image_at(0).unwrap().clone();

    // Every exclusive IPC publication announces an image to a client that is
    // not polling, until its notification queue overflows.
    let _ipc_subscription = client.add_subscription(IPC_CHANNEL, STREAM_ID).unwrap();
    let _ipc_publications: Vec<Publication> = (0..NOTIFICATION_QUEUE_CAPACITY + 64)
        .map(|_| sender.add_exclusive_publication(IPC_CHANNEL, STREAM_ID).unwrap())
        .collect();
    let counters = driver.counters();
    await_condition("notification overflow", || {
        counters.get(SystemCounter::NotificationsDropped) > 0
    });

    let other = client
        .add_publication("ferry:udp?endpoint=localhost:10050", STREAM_ID)
        .unwrap();
    client.close_publication(other).unwrap();
    client.reject_image(&image, REASON).unwrap();
    assert_eq!(counters.get(SystemCounter::Errors), 1);

    // The overflow is reported once, by poll.
    let err = client.poll().unwrap_err();
    assert!(matches!(err, ClientError::NotificationsDropped(n) if n > 0), "{err}");

    let frame = await_frame(&mut client, &handler);
    assert_eq!(frame.registration_id, publication.registration_id());
    assert_eq!(frame.error_message, REASON);

    drop(subscription);
    sender.close();
    client.close();
    driver.shutdown();
}

fn should_return_all_parameters_to_api(address: &str) {
    let driver = launch(Duration::from_secs(3));
    let handler = QueuedErrorFrameHandler::default();
    let mut client = connect(&driver, Some(&handler));

    let group_tag = 1001;
    let port = 10001;
    let mdc = format!("ferry:udp?control-mode=dynamic|control={address}:10000|fc=tagged,g:{group_tag}");
    let channel = format!("ferry:udp?control={address}:10000|endpoint={address}:{port}|gtag={group_tag}");

    let publication = client.add_publication(&mdc, STREAM_ID).unwrap();
    let mut subscription = client.add_subscription(&channel, STREAM_ID).unwrap();
    await_connected(&mut client, &publication, &mut subscription);
    offer_and_receive(&mut client, &publication, &mut subscription);

    let image = subscription.image_at(0).unwrap().clone();
    assert_eq!(publication.position(), image.position());
    client.reject_image(&image, REASON).unwrap();

    let frame = await_frame(&mut client, &handler);
    let receiver: Endpoint = format!("{address}:{port}").parse().unwrap();
    assert_eq!(frame.error_message, REASON);
    assert_eq!(frame.registration_id, publication.registration_id());
    assert_eq!(frame.destination_registration_id_or_null(), NULL_VALUE);
    assert_eq!(frame.stream_id, publication.stream_id());
    assert_eq!(frame.session_id, publication.session_id());
    assert_eq!(frame.group_tag, Some(group_tag));
    assert_eq!(frame.source_address, receiver);

    drop(subscription);
    client.close();
    driver.shutdown();
}

#[test]
#[serial]
fn should_return_all_parameters_to_api_ipv4() {
    should_return_all_parameters_to_api("127.0.0.1");
}

#[test]
#[serial]
fn should_return_all_parameters_to_api_ipv6() {
    should_return_all_parameters_to_api("[::1]");
}

fn should_only_receive_publication_error_frames(exclusive: bool) {
    let driver = launch(Duration::from_secs(3));
    let handler = QueuedErrorFrameHandler::default();
    let mut client = connect(&driver, Some(&handler));

    let publication = if exclusive {
        client.add_exclusive_publication(CHANNEL, STREAM_ID).unwrap()
    } else {
        client.add_publication(CHANNEL, STREAM_ID).unwrap()
    };
    assert_eq!(publication.is_exclusive(), exclusive);
    let mut subscription = client.add_subscription(CHANNEL, STREAM_ID).unwrap();
    await_connected(&mut client, &publication, &mut subscription);
    offer_and_receive(&mut client, &publication, &mut subscription);

    let image = subscription.image_at(0).unwrap().clone();
    client.reject_image(&image, REASON).unwrap();
    let frame = await_frame(&mut client, &handler);
    assert_eq!(frame.registration_id, publication.registration_id());

    drop(subscription);
    client.close();
    driver.shutdown();
}

#[test]
#[serial]
fn should_only_receive_publication_error_frames_exclusive() {
    should_only_receive_publication_error_frames(true);
}

#[test]
#[serial]
fn should_only_receive_publication_error_frames_shared() {
    should_only_receive_publication_error_frames(false);
}
