//! Name registry tests against a scripted bus daemon
//!
//! Name requests block the caller, so each test runs the daemon side of the
//! exchange on a helper thread and hands the peer back when done.

mod common;

use std::thread;

use pretty_assertions::assert_eq;

use busway_core::{
    error_names, BusConfig, BusError, Envelope, ErrorKind, NameFlags, NameStatus,
    ReleaseNameReply, RequestNameReply,
};

use common::{FakeBus, FakePeer, Recorder};

const NAME: &str = "org.example.Service";

/// Answer the next name request with `reply`
fn grant(mut peer: FakePeer, reply: RequestNameReply) -> thread::JoinHandle<FakePeer> {
    thread::spawn(move || {
        let (serial, _, _) = peer.expect_request_name();
        peer.send(&Envelope::RequestNameReply {
            reply_serial: serial,
            reply,
        });
        peer
    })
}

/// Answer the next name release with `reply`
fn release(mut peer: FakePeer, reply: ReleaseNameReply) -> thread::JoinHandle<FakePeer> {
    thread::spawn(move || {
        let (serial, _) = peer.expect_release_name();
        peer.send(&Envelope::ReleaseNameReply {
            reply_serial: serial,
            reply,
        });
        peer
    })
}

// =============================================================================
// Request / Release
// =============================================================================

#[test]
fn test_request_then_release() {
    let bus = FakeBus::new();
    let (connection, peer) = bus.connect();

    let script = grant(peer, RequestNameReply::PrimaryOwner);
    connection.request_name(NAME).unwrap();
    let peer = script.join().unwrap();
    assert_eq!(connection.owned_names(), vec![NAME.to_string()]);

    let entry = &connection.name_entries()[0];
    assert_eq!(entry.owner, connection.unique_name());
    assert_eq!(entry.status, NameStatus::Owner);

    let script = release(peer, ReleaseNameReply::Released);
    connection.release_name(NAME).unwrap();
    let _peer = script.join().unwrap();
    assert!(connection.owned_names().is_empty());

    // Second release is answered locally
    let err = connection.release_name(NAME).unwrap_err();
    assert_eq!(err, BusError::NotOwned(NAME.to_string()));
}

#[test]
fn test_request_sends_name_and_flags() {
    let bus = FakeBus::new();
    let (connection, mut peer) = bus.connect();

    let script = thread::spawn(move || {
        let (serial, name, flags) = peer.expect_request_name();
        peer.send(&Envelope::RequestNameReply {
            reply_serial: serial,
            reply: RequestNameReply::PrimaryOwner,
        });
        (name, flags)
    });

    let reply = connection
        .request_name_with(NAME, NameFlags::queue())
        .unwrap();
    assert_eq!(reply, RequestNameReply::PrimaryOwner);
    assert_eq!(script.join().unwrap(), (NAME.to_string(), NameFlags::queue()));
}

#[test]
fn test_rerequest_of_owned_name_is_local() {
    let bus = FakeBus::new();
    let (connection, peer) = bus.connect();

    let script = grant(peer, RequestNameReply::PrimaryOwner);
    connection.request_name(NAME).unwrap();
    let _peer = script.join().unwrap();
    let before = connection.name_entries();

    // Nobody answers: any I/O here would time out
    assert_eq!(connection.request_name(NAME), Ok(()));
    assert_eq!(
        connection.request_name_with(NAME, NameFlags::default()),
        Ok(RequestNameReply::AlreadyOwner)
    );
    assert_eq!(connection.name_entries(), before);
}

#[test]
fn test_names_listed_in_acquisition_order() {
    let bus = FakeBus::new();
    let (connection, mut peer) = bus.connect();

    for name in ["org.example.B", "org.example.A", "org.example.C"] {
        let script = grant(peer, RequestNameReply::PrimaryOwner);
        connection.request_name(name).unwrap();
        peer = script.join().unwrap();
    }

    assert_eq!(
        connection.owned_names(),
        vec!["org.example.B", "org.example.A", "org.example.C"]
    );
}

#[test]
fn test_release_of_never_requested_name() {
    let bus = FakeBus::new();
    let (connection, _peer) = bus.connect();

    let err = connection.release_name("org.example.Never").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotOwned);
}

// =============================================================================
// Rejections
// =============================================================================

#[test]
fn test_invalid_name_rejected_without_io() {
    let bus = FakeBus::new();
    let (connection, _peer) = bus.connect();

    for name in ["", "noDots", "org..example", "org.1example", ":1.3"] {
        let err = connection.request_name(name).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidName, "{name:?}");
    }
    assert!(connection.name_entries().is_empty());
}

#[test]
fn test_taken_name_is_unavailable() {
    let bus = FakeBus::new();
    let (connection, peer) = bus.connect();

    let script = grant(peer, RequestNameReply::Exists);
    let err = connection.request_name(NAME).unwrap_err();
    let _peer = script.join().unwrap();

    assert_eq!(err, BusError::NameUnavailable(NAME.to_string()));
    assert!(connection.name_entries().is_empty());
}

#[test]
fn test_daemon_control_errors_are_mapped() {
    let bus = FakeBus::new();
    let (connection, mut peer) = bus.connect();

    let script = thread::spawn(move || {
        for error_name in [error_names::INVALID_ARGS, error_names::NAME_EXISTS] {
            let (serial, _, _) = peer.expect_request_name();
            peer.send(&Envelope::ControlError {
                reply_serial: serial,
                name: error_name.to_string(),
                message: "rejected by policy".to_string(),
            });
        }
        peer
    });

    let err = connection.request_name(NAME).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidName);
    assert!(err.to_string().contains("rejected by policy"));

    let err = connection.request_name(NAME).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameUnavailable);

    let _peer = script.join().unwrap();
}

#[test]
fn test_release_refused_by_daemon_forgets_entry() {
    let bus = FakeBus::new();
    let (connection, peer) = bus.connect();

    let script = grant(peer, RequestNameReply::PrimaryOwner);
    connection.request_name(NAME).unwrap();
    let peer = script.join().unwrap();

    let script = release(peer, ReleaseNameReply::NotOwner);
    let err = connection.release_name(NAME).unwrap_err();
    let _peer = script.join().unwrap();

    assert_eq!(err.kind(), ErrorKind::NotOwned);
    assert!(connection.name_entries().is_empty());
}

// =============================================================================
// Queueing
// =============================================================================

#[test]
fn test_queued_name_promoted_by_name_acquired() {
    let bus = FakeBus::new();
    let (connection, peer) = bus.connect();
    let recorder = Recorder::new();
    connection.set_dispatch_handler(recorder.handler());

    let script = grant(peer, RequestNameReply::InQueue);
    let reply = connection
        .request_name_with(NAME, NameFlags::queue())
        .unwrap();
    let mut peer = script.join().unwrap();

    assert_eq!(reply, RequestNameReply::InQueue);
    assert!(connection.owned_names().is_empty());
    assert_eq!(connection.name_entries()[0].status, NameStatus::Queued);

    connection.enter_processing_loop_async().unwrap();
    peer.announce_name_acquired(NAME);

    // The signal is still delivered to the handler
    recorder.wait_for(1);
    assert_eq!(connection.owned_names(), vec![NAME.to_string()]);
    connection.leave_processing_loop().unwrap();
}

#[test]
fn test_queued_name_can_be_released() {
    let bus = FakeBus::new();
    let (connection, peer) = bus.connect();

    let script = grant(peer, RequestNameReply::InQueue);
    connection
        .request_name_with(NAME, NameFlags::queue())
        .unwrap();
    let peer = script.join().unwrap();

    let script = release(peer, ReleaseNameReply::Released);
    connection.release_name(NAME).unwrap();
    let _peer = script.join().unwrap();
    assert!(connection.name_entries().is_empty());
}

// =============================================================================
// Interaction With the Processing Loop
// =============================================================================

#[test]
fn test_request_while_background_loop_runs() {
    let bus = FakeBus::new();
    let (connection, mut peer) = bus.connect();
    let recorder = Recorder::new();
    connection.set_dispatch_handler(recorder.handler());
    connection.enter_processing_loop_async().unwrap();

    let script = thread::spawn(move || {
        let (serial, _, _) = peer.expect_request_name();
        // Traffic ahead of the reply goes to the handler
        peer.deliver_signal("interleaved");
        peer.send(&Envelope::RequestNameReply {
            reply_serial: serial,
            reply: RequestNameReply::PrimaryOwner,
        });
        peer
    });

    connection.request_name(NAME).unwrap();
    let _peer = script.join().unwrap();

    recorder.wait_for(1);
    assert_eq!(recorder.labels(), vec!["interleaved".to_string()]);
    assert_eq!(connection.owned_names(), vec![NAME.to_string()]);
    connection.leave_processing_loop().unwrap();
}

#[test]
fn test_frames_read_while_idle_are_dispatched_first() {
    let bus = FakeBus::new();
    let (connection, mut peer) = bus.connect();
    let recorder = Recorder::new();
    connection.set_dispatch_handler(recorder.handler());

    let script = thread::spawn(move || {
        let (serial, _, _) = peer.expect_request_name();
        peer.deliver_signal("a");
        peer.deliver_corrupted("bad");
        peer.deliver_signal("b");
        peer.send(&Envelope::RequestNameReply {
            reply_serial: serial,
            reply: RequestNameReply::PrimaryOwner,
        });
        peer
    });

    connection.request_name(NAME).unwrap();
    let mut peer = script.join().unwrap();

    // Parked until a loop runs
    assert_eq!(recorder.len(), 0);

    connection.enter_processing_loop_async().unwrap();
    peer.deliver_signal("c");
    recorder.wait_for(4);
    assert_eq!(recorder.labels(), vec!["a", "<error>", "b", "c"]);
    connection.leave_processing_loop().unwrap();
}

// =============================================================================
// Timeouts and Failures
// =============================================================================

#[test]
fn test_request_times_out_without_breaking_connection() {
    let bus = FakeBus::new();
    let config = BusConfig {
        call_timeout_ms: 200,
        ..bus.config()
    };
    let (connection, mut peer) = bus.connect_with(config);

    let err = connection.request_name(NAME).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.to_string().contains("Timed out"));
    assert!(connection.is_open());
    assert!(connection.name_entries().is_empty());

    // Drop the unanswered request and try again
    let _ = peer.expect_request_name();
    let script = grant(peer, RequestNameReply::PrimaryOwner);
    connection.request_name(NAME).unwrap();
    let _peer = script.join().unwrap();
    assert_eq!(connection.owned_names(), vec![NAME.to_string()]);
}

#[test]
fn test_request_fails_when_daemon_disconnects() {
    let bus = FakeBus::new();
    let (connection, mut peer) = bus.connect();

    let script = thread::spawn(move || {
        let _ = peer.expect_request_name();
        drop(peer);
    });

    let err = connection.request_name(NAME).unwrap_err();
    script.join().unwrap();

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(!connection.is_open());
}

#[test]
fn test_names_are_forgotten_when_transport_closes() {
    let bus = FakeBus::new();
    let (connection, peer) = bus.connect();

    let script = grant(peer, RequestNameReply::PrimaryOwner);
    connection.request_name(NAME).unwrap();
    let peer = script.join().unwrap();

    let script = grant(peer, RequestNameReply::InQueue);
    connection
        .request_name_with("org.example.Other", NameFlags::queue())
        .unwrap();
    let peer = script.join().unwrap();
    assert_eq!(connection.name_entries().len(), 2);

    drop(peer);
    let err = connection.enter_processing_loop().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);

    assert!(!connection.is_open());
    assert!(connection.owned_names().is_empty());
    assert!(connection.name_entries().is_empty());
    assert_eq!(
        connection.release_name(NAME).unwrap_err(),
        BusError::NotOwned(NAME.to_string())
    );
}
