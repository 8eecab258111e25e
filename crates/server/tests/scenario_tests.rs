//! End-to-end protocol scenarios
//!
//! Each test starts a real server on an ephemeral loopback port with a
//! scripted mock backend and speaks raw USB/IP over a TCP socket, exactly
//! as a vhci_hcd client would.

use common::test_utils::{
    MOCK_DEVICE_DESCRIPTOR, MockBackend, MockTransfer, mock_device, with_timeout,
};
use common::TransferError;
use protocol::{
    BusId, CmdSubmit, CmdUnlink, OpReply, OpRequest, UrbMessage, UsbSpeed, read_op_reply,
    read_urb_message, USBIP_DIR_IN, USBIP_DIR_OUT,
};
use server::persist::load_bind_file;
use server::registry::DeviceState;
use server::{ServerConfig, UsbIpServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const DEVID_1_1: u32 = (1 << 16) | 2;

struct TestServer {
    server: Arc<UsbIpServer<MockBackend>>,
    backend: Arc<MockBackend>,
    addr: SocketAddr,
    state_file: PathBuf,
    run: tokio::task::JoinHandle<common::Result<()>>,
    _dir: TempDir,
}

impl TestServer {
    async fn start(backend: Arc<MockBackend>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::start_with_state(backend, dir.path().join("bindings"), dir).await
    }

    async fn start_with_state(backend: Arc<MockBackend>, state_file: PathBuf, dir: TempDir) -> Self {
        let mut config = ServerConfig::default();
        config.server.listen_address = "127.0.0.1".to_string();
        config.server.listen_port = 0;
        config.state.state_file_path = state_file.clone();

        let server = UsbIpServer::bind(config, Arc::clone(&backend)).await.unwrap();
        let addr = server.local_addrs()[0];
        let run = tokio::spawn(Arc::clone(&server).run());

        Self {
            server,
            backend,
            addr,
            state_file,
            run,
            _dir: dir,
        }
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    async fn stop(self) -> (TempDir, PathBuf) {
        self.server.shutdown();
        let _ = with_timeout(self.run).await;
        (self._dir, self.state_file)
    }
}

fn bus(s: &str) -> BusId {
    BusId::new(s).unwrap()
}

async fn send_op(stream: &mut TcpStream, request: OpRequest) {
    let mut frame = Vec::new();
    request.write_to(&mut frame).unwrap();
    stream.write_all(&frame).await.unwrap();
}

async fn send_urb(stream: &mut TcpStream, message: UrbMessage) {
    let mut frame = Vec::new();
    message.write_to(&mut frame).unwrap();
    stream.write_all(&frame).await.unwrap();
}

/// Import a device and assert success
async fn import(stream: &mut TcpStream, bus_id: &str) {
    send_op(
        stream,
        OpRequest::Import {
            bus_id: bus(bus_id),
        },
    )
    .await;
    let reply = with_timeout(read_op_reply(stream)).await.unwrap();
    let OpReply::Import { status, record } = reply else {
        panic!("expected import reply, got {reply:?}");
    };
    assert_eq!(status, 0);
    assert!(record.is_some());
}

fn control_in_submit(seqnum: u32) -> UrbMessage {
    UrbMessage::CmdSubmit(CmdSubmit {
        seqnum,
        devid: DEVID_1_1,
        direction: USBIP_DIR_IN,
        ep: 0,
        transfer_flags: 0,
        transfer_buffer_length: 18,
        start_frame: 0,
        number_of_packets: 0,
        interval: 0,
        setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
        data: Vec::new(),
        iso_packets: Vec::new(),
    })
}

fn bulk_in_submit(seqnum: u32, length: i32) -> UrbMessage {
    UrbMessage::CmdSubmit(CmdSubmit {
        seqnum,
        devid: DEVID_1_1,
        direction: USBIP_DIR_IN,
        ep: 1,
        transfer_flags: 0,
        transfer_buffer_length: length,
        start_frame: 0,
        number_of_packets: 0,
        interval: 0,
        setup: [0u8; 8],
        data: Vec::new(),
        iso_packets: Vec::new(),
    })
}

// Scenario A: device listing with one bound device.
#[tokio::test]
async fn scenario_a_device_listing() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    let ts = TestServer::start(backend).await;
    ts.server.bind_device(&bus("1-1")).await.unwrap();

    let mut stream = ts.connect().await;
    send_op(&mut stream, OpRequest::DevList).await;

    let reply = with_timeout(read_op_reply(&mut stream)).await.unwrap();
    let OpReply::DevList { devices } = reply else {
        panic!("expected devlist reply");
    };
    assert_eq!(devices.len(), 1);
    let dev = &devices[0];
    assert_eq!(dev.record.bus_id, bus("1-1"));
    assert_eq!(dev.record.vendor_id, 0x1d6b);
    assert_eq!(dev.record.product_id, 0x0002);
    assert_eq!(dev.record.speed, UsbSpeed::High);
    assert_eq!(dev.record.num_interfaces, 1);
    assert_eq!(dev.interfaces.len(), 1);
    assert_eq!(dev.interfaces[0].interface_class, 9);
    assert_eq!(dev.interfaces[0].interface_subclass, 0);
    assert_eq!(dev.interfaces[0].interface_protocol, 0);
}

// An unbound device must not be listed; an empty exportable set is a
// header plus a zero count.
#[tokio::test]
async fn devlist_excludes_unbound_devices() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    let ts = TestServer::start(backend).await;

    let mut stream = ts.connect().await;
    send_op(&mut stream, OpRequest::DevList).await;

    let reply = with_timeout(read_op_reply(&mut stream)).await.unwrap();
    assert!(matches!(reply, OpReply::DevList { devices } if devices.is_empty()));

    // The connection survives and can list again after a bind.
    ts.server.bind_device(&bus("1-1")).await.unwrap();
    send_op(&mut stream, OpRequest::DevList).await;
    let reply = with_timeout(read_op_reply(&mut stream)).await.unwrap();
    assert!(matches!(reply, OpReply::DevList { devices } if devices.len() == 1));
}

// Scenario B: import then a control IN transfer (GET_DEVICE_DESCRIPTOR).
#[tokio::test]
async fn scenario_b_import_and_control_in() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    let ts = TestServer::start(backend).await;
    ts.server.bind_device(&bus("1-1")).await.unwrap();

    let mut stream = ts.connect().await;
    send_op(
        &mut stream,
        OpRequest::Import {
            bus_id: bus("1-1"),
        },
    )
    .await;
    let reply = with_timeout(read_op_reply(&mut stream)).await.unwrap();
    let OpReply::Import { status, record } = reply else {
        panic!("expected import reply");
    };
    assert_eq!(status, 0);
    let record = record.unwrap();
    assert_eq!(record.bus_id, bus("1-1"));
    assert_eq!(record.devid(), DEVID_1_1);

    send_urb(&mut stream, control_in_submit(1)).await;
    let message = with_timeout(read_urb_message(&mut stream)).await.unwrap();
    let UrbMessage::RetSubmit(ret) = message else {
        panic!("expected RET_SUBMIT, got {message:?}");
    };
    assert_eq!(ret.seqnum, 1);
    assert_eq!(ret.status, 0);
    assert_eq!(ret.actual_length, 18);
    assert_eq!(ret.start_frame, 0);
    assert_eq!(ret.data, MOCK_DEVICE_DESCRIPTOR);
}

// Scenario C: UNLINK cancels an in-flight bulk transfer; the unlinked
// URB never produces a RET_SUBMIT.
#[tokio::test]
async fn scenario_c_unlink_cancels_bulk() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    backend.script(0x81, MockTransfer::HangUntilCancel);
    let ts = TestServer::start(Arc::clone(&backend)).await;
    ts.server.bind_device(&bus("1-1")).await.unwrap();

    let mut stream = ts.connect().await;
    import(&mut stream, "1-1").await;

    send_urb(&mut stream, bulk_in_submit(7, 65536)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    send_urb(
        &mut stream,
        UrbMessage::CmdUnlink(CmdUnlink {
            seqnum: 8,
            devid: DEVID_1_1,
            direction: USBIP_DIR_OUT,
            ep: 0,
            unlink_seqnum: 7,
        }),
    )
    .await;

    let message = with_timeout(read_urb_message(&mut stream)).await.unwrap();
    let UrbMessage::RetUnlink(ret) = message else {
        panic!("expected RET_UNLINK, got {message:?}");
    };
    assert_eq!(ret.seqnum, 8);
    assert_eq!(ret.status, -104);

    // No RET_SUBMIT for seqnum 7, ever.
    let next = tokio::time::timeout(Duration::from_millis(300), read_urb_message(&mut stream)).await;
    assert!(next.is_err(), "unexpected frame after unlink: {next:?}");
}

// UNLINK of a seqnum that already completed reports status 0.
#[tokio::test]
async fn unlink_of_completed_urb_reports_already_gone() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    let ts = TestServer::start(backend).await;
    ts.server.bind_device(&bus("1-1")).await.unwrap();

    let mut stream = ts.connect().await;
    import(&mut stream, "1-1").await;

    send_urb(&mut stream, control_in_submit(1)).await;
    let UrbMessage::RetSubmit(_) = with_timeout(read_urb_message(&mut stream)).await.unwrap()
    else {
        panic!("expected RET_SUBMIT");
    };

    send_urb(
        &mut stream,
        UrbMessage::CmdUnlink(CmdUnlink {
            seqnum: 2,
            devid: DEVID_1_1,
            direction: USBIP_DIR_OUT,
            ep: 0,
            unlink_seqnum: 1,
        }),
    )
    .await;
    let UrbMessage::RetUnlink(ret) = with_timeout(read_urb_message(&mut stream)).await.unwrap()
    else {
        panic!("expected RET_UNLINK");
    };
    assert_eq!(ret.status, 0);
}

// Scenario D: import of an already-exported device fails; the losing
// session stays usable on the op channel.
#[tokio::test]
async fn scenario_d_second_import_fails() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    let ts = TestServer::start(backend).await;
    ts.server.bind_device(&bus("1-1")).await.unwrap();

    let mut s1 = ts.connect().await;
    import(&mut s1, "1-1").await;

    let mut s2 = ts.connect().await;
    send_op(
        &mut s2,
        OpRequest::Import {
            bus_id: bus("1-1"),
        },
    )
    .await;
    let reply = with_timeout(read_op_reply(&mut s2)).await.unwrap();
    let OpReply::Import { status, record } = reply else {
        panic!("expected import reply");
    };
    assert_ne!(status, 0);
    assert!(record.is_none());

    // S2 remains in the op phase.
    send_op(&mut s2, OpRequest::DevList).await;
    let reply = with_timeout(read_op_reply(&mut s2)).await.unwrap();
    assert!(matches!(reply, OpReply::DevList { .. }));
}

// Export exclusivity under a true race: exactly one of two concurrent
// imports wins.
#[tokio::test]
async fn concurrent_imports_have_one_winner() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    let ts = TestServer::start(backend).await;
    ts.server.bind_device(&bus("1-1")).await.unwrap();

    let mut s1 = ts.connect().await;
    let mut s2 = ts.connect().await;

    let import_frame = || {
        let mut frame = Vec::new();
        OpRequest::Import {
            bus_id: bus("1-1"),
        }
        .write_to(&mut frame)
        .unwrap();
        frame
    };
    let f1 = import_frame();
    let f2 = import_frame();
    let (r1, r2) = tokio::join!(s1.write_all(&f1), s2.write_all(&f2));
    r1.unwrap();
    r2.unwrap();

    let (rep1, rep2) = tokio::join!(read_op_reply(&mut s1), read_op_reply(&mut s2));
    let statuses: Vec<u32> = [rep1.unwrap(), rep2.unwrap()]
        .into_iter()
        .map(|reply| match reply {
            OpReply::Import { status, .. } => status,
            other => panic!("expected import reply, got {other:?}"),
        })
        .collect();

    let winners = statuses.iter().filter(|&&s| s == 0).count();
    assert_eq!(winners, 1, "statuses were {statuses:?}");
}

// Scenario E: surprise removal mid-transfer delivers -ENODEV, closes the
// session, and keeps the bind record.
#[tokio::test]
async fn scenario_e_surprise_removal() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    backend.script(0x81, MockTransfer::HangUntilCancel);
    let ts = TestServer::start(Arc::clone(&backend)).await;
    ts.server.bind_device(&bus("1-1")).await.unwrap();

    let mut stream = ts.connect().await;
    import(&mut stream, "1-1").await;

    send_urb(&mut stream, bulk_in_submit(42, 4096)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    backend.unplug(&bus("1-1"));

    let message = with_timeout(read_urb_message(&mut stream)).await.unwrap();
    let UrbMessage::RetSubmit(ret) = message else {
        panic!("expected RET_SUBMIT, got {message:?}");
    };
    assert_eq!(ret.seqnum, 42);
    assert_eq!(ret.status, -19);
    assert_eq!(ret.actual_length, 0);

    // The server closes the session after delivering the failure.
    let end = with_timeout(read_urb_message(&mut stream)).await;
    assert!(end.is_err(), "expected close, got {end:?}");

    // The bind record survives for a future reattachment.
    let persisted = load_bind_file(&ts.state_file).unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].bus_id, bus("1-1"));
}

// Scenario F: client disconnect drains every in-flight URB and returns
// the device to Bound.
#[tokio::test]
async fn scenario_f_disconnect_drains_urbs() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    for _ in 0..5 {
        backend.script(0x81, MockTransfer::HangUntilCancel);
    }
    let ts = TestServer::start(Arc::clone(&backend)).await;
    ts.server.bind_device(&bus("1-1")).await.unwrap();

    let mut stream = ts.connect().await;
    import(&mut stream, "1-1").await;

    for seqnum in 1..=5 {
        send_urb(&mut stream, bulk_in_submit(seqnum, 512)).await;
    }
    // Let the submits reach the engine before dropping the socket.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ts.server.engine().in_flight(), 5);

    drop(stream);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while ts.server.engine().in_flight() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(ts.server.engine().in_flight(), 0);

    // Device back to Bound, claim released, ready for the next client.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let state = ts.server.list_devices().await[0].1;
        if state == DeviceState::Bound && !ts.backend.is_claimed(&bus("1-1")) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "device stuck in {state:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut stream = ts.connect().await;
    import(&mut stream, "1-1").await;
}

// A transfer error is reported in RET_SUBMIT and never closes the session.
#[tokio::test]
async fn transfer_error_keeps_session_alive() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    backend.script(0x81, MockTransfer::Reply(Err(TransferError::Stall)));
    let ts = TestServer::start(backend).await;
    ts.server.bind_device(&bus("1-1")).await.unwrap();

    let mut stream = ts.connect().await;
    import(&mut stream, "1-1").await;

    send_urb(&mut stream, bulk_in_submit(3, 64)).await;
    let UrbMessage::RetSubmit(ret) = with_timeout(read_urb_message(&mut stream)).await.unwrap()
    else {
        panic!("expected RET_SUBMIT");
    };
    assert_eq!(ret.status, -32);

    // Next transfer on the same session still works.
    send_urb(&mut stream, control_in_submit(4)).await;
    let UrbMessage::RetSubmit(ret) = with_timeout(read_urb_message(&mut stream)).await.unwrap()
    else {
        panic!("expected RET_SUBMIT");
    };
    assert_eq!(ret.status, 0);
}

// A CMD_SUBMIT whose devid disagrees with the imported device closes the
// connection without a reply.
#[tokio::test]
async fn devid_mismatch_closes_session() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    let ts = TestServer::start(backend).await;
    ts.server.bind_device(&bus("1-1")).await.unwrap();

    let mut stream = ts.connect().await;
    import(&mut stream, "1-1").await;

    let UrbMessage::CmdSubmit(mut cmd) = control_in_submit(1) else {
        unreachable!()
    };
    cmd.devid = 0xdead;
    send_urb(&mut stream, UrbMessage::CmdSubmit(cmd)).await;

    let result = with_timeout(read_urb_message(&mut stream)).await;
    assert!(result.is_err(), "expected close, got {result:?}");
}

// Property 4: a bind survives a clean restart.
#[tokio::test]
async fn bind_survives_restart() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    let ts = TestServer::start(backend).await;
    ts.server.bind_device(&bus("1-1")).await.unwrap();
    let (dir, state_file) = ts.stop().await;

    // Fresh process: new backend instance, same state file.
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    let ts = TestServer::start_with_state(backend, state_file, dir).await;

    let listed = ts.server.list_devices().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].1, DeviceState::Bound);

    // And the device is importable without a new bind call.
    let mut stream = ts.connect().await;
    import(&mut stream, "1-1").await;
}

// Unbinding an exported device force-closes the owning session.
#[tokio::test]
async fn unbind_force_closes_exporter() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    let ts = TestServer::start(Arc::clone(&backend)).await;
    ts.server.bind_device(&bus("1-1")).await.unwrap();

    let mut stream = ts.connect().await;
    import(&mut stream, "1-1").await;

    ts.server.unbind_device(&bus("1-1")).await.unwrap();

    let result = with_timeout(read_urb_message(&mut stream)).await;
    assert!(result.is_err(), "expected close, got {result:?}");

    // The claim comes back once teardown finishes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while ts.backend.is_claimed(&bus("1-1")) {
        assert!(tokio::time::Instant::now() < deadline, "claim never released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// An unknown op code closes the connection with no partial reply.
#[tokio::test]
async fn unknown_op_code_closes_connection() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    let ts = TestServer::start(backend).await;

    let mut stream = ts.connect().await;
    stream
        .write_all(&[0x01, 0x11, 0x80, 0x09, 0, 0, 0, 0])
        .await
        .unwrap();

    let result = with_timeout(read_op_reply(&mut stream)).await;
    assert!(result.is_err(), "expected close, got {result:?}");
}

// A version-mismatched header closes the connection.
#[tokio::test]
async fn version_mismatch_closes_connection() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    let ts = TestServer::start(backend).await;

    let mut stream = ts.connect().await;
    stream
        .write_all(&[0x01, 0x06, 0x80, 0x05, 0, 0, 0, 0])
        .await
        .unwrap();

    let result = with_timeout(read_op_reply(&mut stream)).await;
    assert!(result.is_err(), "expected close, got {result:?}");
}

// Whole-service shutdown tears down active sessions.
#[tokio::test]
async fn shutdown_closes_sessions() {
    let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
    let ts = TestServer::start(backend).await;
    ts.server.bind_device(&bus("1-1")).await.unwrap();

    let mut stream = ts.connect().await;
    import(&mut stream, "1-1").await;

    ts.server.shutdown();
    let result = with_timeout(read_urb_message(&mut stream)).await;
    assert!(result.is_err(), "expected close, got {result:?}");

    let _ = with_timeout(ts.run).await;
}
