use abc150_lib::bus::LoopbackBus;
use abc150_lib::clock::SystemClock;
use abc150_lib::converter::Converter;
use abc150_lib::protocol::{self, Channel, ControlMode};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn engine_against_simulated_converter() {
    let bus = Arc::new(LoopbackBus::with_converter_echo());
    let receiver = Box::new(bus.receiver());
    let converter = Arc::new(Converter::with_period(
        bus.clone(),
        Arc::new(SystemClock::new()),
        Duration::from_millis(20),
    ));
    let mut rx_task = converter.spawn_receiver(receiver).unwrap();
    let mut tx_task = converter.spawn_transmitter().unwrap();

    converter.request_converter().unwrap();
    wait_until("greeting", || converter.is_detected());
    wait_until("station ids", || {
        Channel::ALL
            .iter()
            .all(|&c| converter.channel(c).measured.station_id.is_some())
    });

    converter.take_control(Channel::A).unwrap();
    wait_until("remote control", || converter.is_remote(Channel::A));
    assert!(!converter.is_remote(Channel::B));

    converter.set_voltage(Channel::A, 300.0);
    converter.enable(Channel::A).unwrap();
    wait_until("command echo", || {
        converter.channel(Channel::A).measured.status.control_mode == ControlMode::Voltage
    });

    wait_until("limits burst", || {
        bus.sent()
            .iter()
            .any(|f| f.id() == protocol::UPPER_LIMITS_OUT)
    });

    let sent = bus.sent();
    assert!(sent.iter().any(|f| f.id() == protocol::COMMAND));
    assert!(sent.iter().any(|f| f.id() == protocol::LOWER_LIMITS_OUT));
    assert!(sent.iter().any(|f| f.id() == protocol::UPPER_LIMITS_OUT));
    assert!(!sent
        .iter()
        .any(|f| f.id() == protocol::COMMAND + protocol::CHANNEL_OFFSET));

    tx_task.stop();
    rx_task.stop();
}
