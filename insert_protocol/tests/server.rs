use std::{
    io::Write,
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread,
    time::Duration,
};

use insert_protocol::{
    Ack, BufferedConn, Error, ProtocolMode, RpcCall, marshal_row,
    frame::read_frame,
    read_block, rows,
    server::{BlockHandler, ServerConfig, StorageServer},
    send_block, send_empty_block,
};
use parking_lot::Mutex;
use test_helpers::assert_eventually;

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Recorder {
    blocks: Mutex<Vec<(RpcCall, Vec<u8>)>>,
}

impl Recorder {
    fn keys(&self) -> Vec<Vec<u8>> {
        self.blocks
            .lock()
            .iter()
            .filter(|(call, _)| *call == RpcCall::WriteRows)
            .flat_map(|(_, block)| {
                rows(block)
                    .map(|r| r.unwrap().key.to_vec())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl BlockHandler for Recorder {
    fn handle_block(
        &self,
        _peer: SocketAddr,
        call: RpcCall,
        block: &[u8],
    ) -> insert_protocol::Result<()> {
        self.blocks.lock().push((call, block.to_vec()));
        Ok(())
    }
}

fn block(keys: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (i, k) in keys.iter().enumerate() {
        marshal_row(&mut buf, k.as_bytes(), i as i64, i as f64);
    }
    buf
}

fn start(config: ServerConfig) -> (StorageServer, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let server =
        StorageServer::bind("127.0.0.1:0", config, Arc::clone(&recorder) as _).unwrap();
    (server, recorder)
}

fn connect(
    server: &StorageServer,
    compress: bool,
    mode: ProtocolMode,
) -> insert_protocol::Result<BufferedConn> {
    BufferedConn::connect(
        &server.local_addr().to_string(),
        DIAL_TIMEOUT,
        compress,
        mode,
    )
}

#[test_log::test]
fn test_write_rows_both_modes() {
    let (server, recorder) = start(ServerConfig {
        compress: true,
        ..Default::default()
    });

    let mut rpc = connect(&server, true, ProtocolMode::Rpc).unwrap();
    let ack = send_block(&mut rpc, RpcCall::WriteRows, &block(&["a", "b"])).unwrap();
    assert_eq!(ack, Ack::Accepted);

    let mut legacy = connect(&server, false, ProtocolMode::Legacy).unwrap();
    assert_eq!(legacy.mode(), ProtocolMode::Legacy);
    let ack = send_block(&mut legacy, RpcCall::WriteRows, &block(&["c"])).unwrap();
    assert_eq!(ack, Ack::Accepted);

    // Acks are written before the handler runs.
    assert_eventually!(Duration::from_secs(5), recorder.keys().len() == 3);
    let mut keys = recorder.keys();
    keys.sort();
    assert_eq!(keys, [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[test_log::test]
fn test_metadata_call() {
    let (server, recorder) = start(ServerConfig::default());

    let mut rpc = connect(&server, false, ProtocolMode::Rpc).unwrap();
    let ack = send_block(&mut rpc, RpcCall::WriteMetadata, b"meta").unwrap();
    assert_eq!(ack, Ack::Accepted);
    assert_eventually!(Duration::from_secs(5), recorder.blocks.lock().len() == 1);
    assert_eq!(recorder.blocks.lock()[0].0, RpcCall::WriteMetadata);

    let mut legacy = connect(&server, false, ProtocolMode::Legacy).unwrap();
    let err = send_block(&mut legacy, RpcCall::WriteMetadata, b"meta").unwrap_err();
    assert!(
        matches!(err, Error::UnsupportedOnLegacy(RpcCall::WriteMetadata)),
        "{err}"
    );
    // Nothing reached the wire, so the connection is still usable.
    send_block(&mut legacy, RpcCall::WriteRows, &block(&["x"])).unwrap();
}

#[test_log::test]
fn test_read_only_ack() {
    let (server, recorder) = start(ServerConfig {
        read_only: true,
        ..Default::default()
    });

    let mut conn = connect(&server, false, ProtocolMode::Rpc).unwrap();
    let ack = send_block(&mut conn, RpcCall::WriteRows, &block(&["a"])).unwrap();
    assert_eq!(ack, Ack::ReadOnly);

    server.set_read_only(false);
    let ack = send_block(&mut conn, RpcCall::WriteRows, &block(&["b"])).unwrap();
    assert_eq!(ack, Ack::Accepted);
    assert_eventually!(Duration::from_secs(5), recorder.keys() == [b"b".to_vec()]);
}

#[test_log::test]
fn test_empty_block_is_only_acked() {
    let (server, recorder) = start(ServerConfig {
        read_only: true,
        ..Default::default()
    });

    let mut conn = connect(&server, false, ProtocolMode::Rpc).unwrap();
    assert_eq!(send_empty_block(&mut conn).unwrap(), Ack::ReadOnly);

    server.set_read_only(false);
    assert_eq!(send_empty_block(&mut conn).unwrap(), Ack::Accepted);
    send_block(&mut conn, RpcCall::WriteRows, &block(&["a"])).unwrap();
    assert_eventually!(Duration::from_secs(5), recorder.blocks.lock().len() == 1);
    assert_eq!(recorder.keys(), [b"a".to_vec()]);
}

#[test_log::test]
fn test_legacy_only_server() {
    let (server, _recorder) = start(ServerConfig {
        legacy_only: true,
        ..Default::default()
    });

    let err = connect(&server, false, ProtocolMode::Rpc).unwrap_err();
    assert!(err.is_hello_rejected(), "{err}");

    let mut conn = connect(&server, false, ProtocolMode::Legacy).unwrap();
    send_block(&mut conn, RpcCall::WriteRows, &block(&["a"])).unwrap();
}

#[test_log::test]
fn test_reject_mode() {
    let (server, recorder) = start(ServerConfig::default());

    let mut conn = connect(&server, false, ProtocolMode::Rpc).unwrap();
    send_block(&mut conn, RpcCall::WriteRows, &block(&["before"])).unwrap();
    assert_eventually!(Duration::from_secs(5), recorder.keys().len() == 1);

    server.set_reject(true);
    let err = send_block(&mut conn, RpcCall::WriteRows, &block(&["during"])).unwrap_err();
    assert!(matches!(err, Error::Io(_)), "{err}");
    let err = connect(&server, false, ProtocolMode::Rpc).unwrap_err();
    assert!(matches!(err, Error::Handshake { .. }), "{err}");

    server.set_reject(false);
    let mut conn = connect(&server, false, ProtocolMode::Rpc).unwrap();
    send_block(&mut conn, RpcCall::WriteRows, &block(&["after"])).unwrap();
    assert_eventually!(Duration::from_secs(5), recorder.keys().len() == 2);
    assert!(!recorder.keys().contains(&b"during".to_vec()));
}

/// A peer that handshakes and then runs `f` on the connection.
fn raw_peer(
    f: impl FnOnce(BufferedConn) + Send + 'static,
) -> (SocketAddr, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        f(BufferedConn::accept(stream, false, false).unwrap());
    });
    (addr, handle)
}

#[test_log::test]
fn test_close_before_ack_is_an_error() {
    let (addr, peer) = raw_peer(|mut conn| {
        let mut buf = Vec::new();
        let call = read_block(&mut conn, &mut buf).unwrap();
        assert_eq!(call, Some(RpcCall::WriteRows));
        // Fully received, but the ack never comes.
        conn.close().unwrap();
    });

    let mut conn =
        BufferedConn::connect(&addr.to_string(), DIAL_TIMEOUT, false, ProtocolMode::Rpc).unwrap();
    let err = send_block(&mut conn, RpcCall::WriteRows, &block(&["a"])).unwrap_err();
    assert!(matches!(err, Error::Io(_)), "{err}");
    peer.join().unwrap();
}

#[test_log::test]
fn test_unexpected_ack_byte() {
    let (addr, peer) = raw_peer(|mut conn| {
        let mut buf = Vec::new();
        read_block(&mut conn, &mut buf).unwrap();
        conn.write_all(&[7]).unwrap();
        conn.flush().unwrap();
    });

    let mut conn =
        BufferedConn::connect(&addr.to_string(), DIAL_TIMEOUT, false, ProtocolMode::Rpc).unwrap();
    let err = send_block(&mut conn, RpcCall::WriteRows, &block(&["a"])).unwrap_err();
    assert!(matches!(err, Error::UnexpectedAck(7)), "{err}");
    peer.join().unwrap();
}

#[test_log::test]
fn test_legacy_frames_carry_no_name() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut conn = BufferedConn::accept(stream, false, false).unwrap();
        assert_eq!(conn.mode(), ProtocolMode::Legacy);
        let mut buf = Vec::new();
        read_frame(&mut conn, 1024, &mut buf).unwrap();
        conn.write_all(&[1]).unwrap();
        conn.flush().unwrap();
        buf
    });

    let payload = block(&["legacy"]);
    let mut conn =
        BufferedConn::connect(&addr.to_string(), DIAL_TIMEOUT, false, ProtocolMode::Legacy)
            .unwrap();
    send_block(&mut conn, RpcCall::WriteRows, &payload).unwrap();
    assert_eq!(peer.join().unwrap(), payload);
}
