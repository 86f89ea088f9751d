//! Connection manager behavior over simulated adapters

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use elm_diagnostics::{
    ProtocolError,
    connection::{AdapterTarget, ConnectionManager, ConnectionSettings},
    dtc::DtcKind,
    simulation::{SimulationFactory, SimulationTransport},
    state::ConnectionState,
    transport::{Transport, TransportError, TransportResult},
};

fn test_settings() -> ConnectionSettings {
    ConnectionSettings {
        connect_timeout_ms: 1_000,
        command_timeout_ms: 250,
        frame_timeout_ms: 100,
        auto_reconnect: false,
        max_reconnect_attempts: 3,
    }
}

fn sim_target() -> AdapterTarget {
    AdapterTarget::new("SimELM", "00:11:22:33:44:55")
}

/// Manager connected to a responder driven sim adapter, plus the raw
/// write log for assertions
fn connected_manager<F>(responder: F) -> (ConnectionManager, Arc<Mutex<Vec<String>>>)
where
    F: FnMut(&str) -> Option<String> + Send + 'static,
{
    let transport = SimulationTransport::new(responder);
    let log = transport.write_log();
    let manager = ConnectionManager::new(
        Arc::new(SimulationFactory::single_use(transport)),
        test_settings(),
    );
    manager.connect(&sim_target()).unwrap();
    (manager, log)
}

#[test]
fn send_appends_carriage_return_exactly_once() {
    let (manager, log) = connected_manager(|_| Some("OK".to_string()));
    manager.send("ATE0").unwrap();
    manager.send("ATL0\r").unwrap();
    let written = log.lock().unwrap().clone();
    assert_eq!(written, vec!["ATE0\r", "ATL0\r"]);
}

#[test]
fn send_strips_prompt_and_trims() {
    let (manager, _log) = connected_manager(|cmd| match cmd {
        "0100" => Some("41 00 BE 3F E8 11".to_string()),
        _ => Some("OK".to_string()),
    });
    let response = manager.send("0100").unwrap();
    assert_eq!(response, "41 00 BE 3F E8 11");
    assert!(!response.contains('>'));
}

#[test]
fn multi_line_responses_are_joined() {
    let (manager, _log) = connected_manager(|cmd| match cmd {
        "0100" => Some("SEARCHING...\r41 00 BE 3F E8 11".to_string()),
        _ => Some("OK".to_string()),
    });
    let response = manager.send("0100").unwrap();
    assert_eq!(response, "SEARCHING...\n41 00 BE 3F E8 11");
}

#[test]
fn echoed_command_is_dropped_from_the_response() {
    let (manager, _log) = connected_manager(|cmd| match cmd {
        // Echo still on, the adapter repeats the command first
        "0100" => Some("0100\r41 00 BE 3F E8 11".to_string()),
        _ => Some("OK".to_string()),
    });
    assert_eq!(manager.send("0100").unwrap(), "41 00 BE 3F E8 11");
}

#[test]
fn timeout_leaves_the_manager_usable() {
    let (manager, _log) = connected_manager(|cmd| match cmd {
        "0902" => None, // silence
        _ => Some("OK".to_string()),
    });
    assert!(matches!(
        manager.send("0902"),
        Err(ProtocolError::TimedOut)
    ));
    // The guard is released and the link still works
    assert_eq!(manager.send("ATDPN").unwrap(), "OK");
    assert!(matches!(manager.state(), ConnectionState::Connected { .. }));
}

#[test]
fn adapter_error_strings_surface_as_bus_errors() {
    let (manager, _log) = connected_manager(|cmd| match cmd {
        "03" => Some("NO DATA".to_string()),
        _ => Some("OK".to_string()),
    });
    match manager.send("03") {
        Err(ProtocolError::Bus(message)) => assert_eq!(message, "NO DATA"),
        other => panic!("expected a bus error, got {other:?}"),
    }
}

#[test]
fn connect_failure_reports_error_state() {
    let factory = SimulationFactory::new(|_| {
        Err(TransportError::Io(Arc::new(std::io::Error::other(
            "connection refused",
        ))))
    });
    let manager = ConnectionManager::new(Arc::new(factory), test_settings());
    assert!(manager.connect(&sim_target()).is_err());
    assert!(matches!(manager.state(), ConnectionState::Error { .. }));
    assert!(!manager.is_connected());
}

#[test]
fn send_without_a_link_is_rejected() {
    let factory = SimulationFactory::new(|_| Err(TransportError::Closed));
    let manager = ConnectionManager::new(Arc::new(factory), test_settings());
    assert!(matches!(
        manager.send("0100"),
        Err(ProtocolError::NotConnected)
    ));
}

#[test]
fn disconnect_is_idempotent_and_publishes_state() {
    let (manager, _log) = connected_manager(|_| Some("OK".to_string()));
    let listener = manager.subscribe();
    assert!(matches!(
        listener.try_recv(),
        Some(ConnectionState::Connected { .. })
    ));
    manager.disconnect();
    manager.disconnect();
    assert_eq!(listener.try_recv(), Some(ConnectionState::Disconnected));
    assert!(matches!(
        manager.send("0100"),
        Err(ProtocolError::NotConnected)
    ));
}

/// Transport whose reads and writes always fail, simulating a dropped
/// Bluetooth link
#[derive(Debug)]
struct DeadTransport;

impl Transport for DeadTransport {
    fn write(&mut self, _bytes: &[u8]) -> TransportResult<()> {
        Err(TransportError::Io(Arc::new(std::io::Error::other(
            "broken pipe",
        ))))
    }
    fn read_line(&mut self, _timeout_ms: u32) -> TransportResult<String> {
        Err(TransportError::Io(Arc::new(std::io::Error::other(
            "broken pipe",
        ))))
    }
    fn read_available(&mut self) -> TransportResult<String> {
        Ok(String::new())
    }
    fn close(&mut self) {}
}

#[test]
fn io_failure_triggers_reconnection_and_recovers() {
    let mut opens = 0;
    let factory = SimulationFactory::new(move |_| {
        opens += 1;
        if opens == 1 {
            Ok(Box::new(DeadTransport) as Box<dyn Transport>)
        } else {
            Ok(Box::new(SimulationTransport::new(|_| Some("OK".to_string())))
                as Box<dyn Transport>)
        }
    });
    let settings = ConnectionSettings {
        auto_reconnect: true,
        ..test_settings()
    };
    let manager = ConnectionManager::new(Arc::new(factory), settings);
    manager.connect(&sim_target()).unwrap();
    let listener = manager.subscribe();

    assert!(matches!(
        manager.send("0100"),
        Err(ProtocolError::Transport(_))
    ));

    // Error, then Reconnecting{1}, then Connected again (first backoff
    // delay is one second)
    let mut saw_error = false;
    let mut saw_reconnecting = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(
            std::time::Instant::now() < deadline,
            "reconnection did not complete"
        );
        match listener.recv_timeout(3_000) {
            Some(ConnectionState::Error { .. }) => saw_error = true,
            Some(ConnectionState::Reconnecting { attempt, .. }) => {
                assert_eq!(attempt, 1);
                saw_reconnecting = true;
            }
            Some(ConnectionState::Connected { .. }) if saw_reconnecting => break,
            _ => {}
        }
    }
    assert!(saw_error);
    // The replacement link works
    assert_eq!(manager.send("ATDPN").unwrap(), "OK");
}

#[test]
fn read_dtcs_decodes_stored_codes() {
    let (manager, _log) = connected_manager(|cmd| match cmd {
        "03" => Some("43 01 33 00 00".to_string()),
        _ => Some("OK".to_string()),
    });
    let codes = manager.read_dtcs(DtcKind::Stored).unwrap();
    assert_eq!(codes.len(), 1);
    assert_eq!(codes[0].code(), "P0133");
    assert_eq!(codes[0].kind, DtcKind::Stored);
}

#[test]
fn read_battery_voltage_parses_the_atrv_reply() {
    let transport = SimulationTransport::scripted(HashMap::from([(
        "ATRV".to_string(),
        "12.4V".to_string(),
    )]));
    let manager = ConnectionManager::new(
        Arc::new(SimulationFactory::single_use(transport)),
        test_settings(),
    );
    manager.connect(&sim_target()).unwrap();
    assert_eq!(manager.read_battery_voltage(), Some(12.4));
}
