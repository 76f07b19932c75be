use std::sync::mpsc;
use std::time::Duration;
use sx126x_ctl::radio::cad::{
    CadController, CadExitMode, CadOutcome, CadParameters, CadState, CadSymbols,
};
use sx126x_ctl::radio::commands::opcode;
use sx126x_ctl::radio::hal::MockHal;
use sx126x_ctl::radio::modem::ModemConfigurator;
use sx126x_ctl::radio::modulation::*;
use sx126x_ctl::radio::packet::PacketConfigurator;
use sx126x_ctl::radio::session::{OperatingMode, RadioEvent, RadioIdentity, RadioSession};
use sx126x_ctl::{ConfigError, RadioError};

const CAD_DONE: u16 = 0x0080;
const CAD_DETECTED: u16 = 0x0100;
const TIMEOUT: u16 = 0x0200;

fn lora_session(mock: &MockHal) -> RadioSession<MockHal> {
    let mut session = RadioSession::begin(mock.clone(), RadioIdentity::default()).unwrap();
    ModemConfigurator::apply(&mut session, ModemParameters::LoRa(LoRaModulation::default())).unwrap();
    PacketConfigurator::apply(&mut session, PacketParameters::LoRa(LoRaPacket::default())).unwrap();
    session
}

#[test]
fn test_cad_requires_lora() {
    let mock = MockHal::new();
    let identity = RadioIdentity {
        protocol: Protocol::Fsk,
        ..RadioIdentity::default()
    };
    let mut session = RadioSession::begin(mock.clone(), identity).unwrap();
    mock.clear_ops();

    let mut cad = CadController::new();
    let err = cad.configure(&mut session, CadParameters::default()).unwrap_err();
    assert_eq!(
        err,
        ConfigError::ProtocolMismatch {
            expected: Protocol::Fsk,
            found: Protocol::LoRa
        }
    );
    assert_eq!(mock.write_count(), 0);
    assert_eq!(cad.state(), CadState::Idle);
}

#[test]
fn test_run_without_configuration() {
    let mock = MockHal::new();
    let mut session = lora_session(&mock);
    mock.clear_ops();

    let mut cad = CadController::new();
    assert_eq!(cad.run(&mut session), Err(RadioError::CadNotArmed));
    assert_eq!(
        cad.wait_outcome(&mut session, Duration::from_millis(10)),
        Err(RadioError::CadNotArmed)
    );
    assert_eq!(mock.write_count(), 0);
}

#[test]
fn test_detection_cycle() {
    let mock = MockHal::new();
    let mut session = lora_session(&mock);
    let mut cad = CadController::new();

    cad.configure(&mut session, CadParameters::default()).unwrap();
    assert_eq!(
        mock.last_command(opcode::SET_CAD_PARAMS),
        Some(vec![0x01, 22, 10, 0x00, 0x00, 0x00, 0x00])
    );
    assert_eq!(cad.state(), CadState::Armed);

    cad.run(&mut session).unwrap();
    assert_eq!(mock.last_command(opcode::SET_CAD), Some(vec![]));
    assert_eq!(cad.state(), CadState::Sensing);
    assert_eq!(session.mode(), OperatingMode::Cad);

    mock.queue_irq(CAD_DONE | CAD_DETECTED);
    let outcome = cad.wait_outcome(&mut session, Duration::from_secs(1)).unwrap();
    assert_eq!(outcome, Some(CadOutcome::Detected));
    assert_eq!(cad.state(), CadState::Done(CadOutcome::Detected));
    assert_eq!(session.mode(), OperatingMode::Standby);

    // a finished cycle can be re-run
    cad.run(&mut session).unwrap();
    mock.queue_irq(CAD_DONE);
    let outcome = cad.wait_outcome(&mut session, Duration::from_secs(1)).unwrap();
    assert_eq!(outcome, Some(CadOutcome::NotDetected));

    let stats = cad.stats();
    assert_eq!(stats.total_cad_operations, 2);
    assert_eq!(stats.activity_detected, 1);
    assert_eq!(stats.channel_clear, 1);
    assert!((stats.detection_rate() - 0.5).abs() < f32::EPSILON);
}

#[test]
fn test_timeout_outcome_reaches_handler() {
    let mock = MockHal::new();
    let mut session = lora_session(&mock);
    let (sender, receiver) = mpsc::channel();
    session
        .on_receive(move |event| {
            let _ = sender.send(event);
        })
        .unwrap();

    let mut cad = CadController::new();
    cad.configure(&mut session, CadParameters::default()).unwrap();
    cad.run(&mut session).unwrap();

    mock.queue_irq(TIMEOUT);
    let outcome = cad.wait_outcome(&mut session, Duration::from_secs(1)).unwrap();
    assert_eq!(outcome, Some(CadOutcome::TimedOut));
    assert_eq!(
        receiver.recv_timeout(Duration::from_secs(1)).unwrap(),
        RadioEvent::Cad(CadOutcome::TimedOut)
    );
    assert_eq!(cad.stats().timeouts, 1);
}

#[test]
fn test_quiet_channel_returns_none() {
    let mock = MockHal::new();
    let mut session = lora_session(&mock);
    let mut cad = CadController::new();
    cad.configure(&mut session, CadParameters::default()).unwrap();
    cad.run(&mut session).unwrap();

    let outcome = cad.wait_outcome(&mut session, Duration::from_millis(30)).unwrap();
    assert_eq!(outcome, None);
    assert_eq!(cad.state(), CadState::Sensing);
}

#[test]
fn test_exit_to_rx_delivers_following_frame() {
    let mock = MockHal::new();
    let mut session = lora_session(&mock);
    let (sender, receiver) = mpsc::channel();
    session
        .on_receive(move |event| {
            let _ = sender.send(event);
        })
        .unwrap();

    let params = CadParameters::optimal(SpreadingFactor::SF7, LoRaBandwidth::BW125)
        .with_exit_mode(CadExitMode::ExitToRx, 64_000);
    assert_eq!(params.symbol_count, CadSymbols::Two);

    let mut cad = CadController::new();
    cad.configure(&mut session, params).unwrap();
    assert_eq!(
        mock.last_command(opcode::SET_CAD_PARAMS),
        Some(vec![0x01, 22, 10, 0x01, 0x00, 0xFA, 0x00])
    );

    cad.run(&mut session).unwrap();
    mock.queue_irq(CAD_DONE | CAD_DETECTED);
    let outcome = cad.wait_outcome(&mut session, Duration::from_secs(1)).unwrap();
    assert_eq!(outcome, Some(CadOutcome::Detected));
    assert_eq!(session.mode(), OperatingMode::Rx);
    assert_eq!(
        receiver.recv_timeout(Duration::from_secs(1)).unwrap(),
        RadioEvent::Cad(CadOutcome::Detected)
    );

    mock.queue_rx_frame(0, b"ping\0\x03");
    let flags = session.service_irq(Duration::from_millis(100)).unwrap().unwrap();
    assert!(flags.rx_done());
    match receiver.recv_timeout(Duration::from_secs(1)).unwrap() {
        RadioEvent::Frame(frame) => {
            assert_eq!(frame.message(), "ping");
            assert_eq!(frame.counter, 3);
        }
        other => panic!("expected a frame, got {other:?}"),
    }
}

#[test]
fn test_end_wakes_cad_wait() {
    let mock = MockHal::new();
    let mut session = lora_session(&mock);
    let mut cad = CadController::new();
    cad.configure(&mut session, CadParameters::default()).unwrap();
    cad.run(&mut session).unwrap();

    let handle = session.handle();
    let ender = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        handle.end();
    });
    let result = cad.wait_outcome(&mut session, Duration::from_secs(10));
    ender.join().unwrap();
    assert_eq!(result, Err(RadioError::SessionClosed));
}
