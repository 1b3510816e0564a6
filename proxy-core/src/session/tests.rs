use super::*;
use crate::codec::{Boundary, FrameQueue};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

fn addr(port: u16) -> std::net::SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn pair() -> (Arc<Endpoint>, DuplexStream, Arc<Endpoint>, DuplexStream) {
    let (client, client_peer) = Endpoint::in_memory(addr(50000), "client", 1024);
    let (server, server_peer) = Endpoint::in_memory(addr(80), "origin.test", 1024);
    (Arc::new(client), client_peer, Arc::new(server), server_peer)
}

async fn read_exactly(peer: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), peer.read_exact(&mut buf))
        .await
        .expect("peer read timed out")
        .unwrap();
    buf
}

/// Newline-delimited messages; client payloads are upper-cased on receive
#[derive(Default)]
struct LineHooks {
    frames: FrameQueue,
}

#[async_trait]
impl SessionHooks for LineHooks {
    fn boundary(&self, _direction: Direction, data: &[u8]) -> Result<Boundary> {
        Ok(match data.iter().position(|&b| b == b'\n') {
            Some(i) => Boundary::Complete(i + 1),
            None => Boundary::Incomplete,
        })
    }

    fn chunk_arrived(&self, direction: Direction, data: &[u8]) -> Result<()> {
        self.frames.push(direction, data);
        Ok(())
    }

    fn pass_through(&self, _direction: Direction) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn available(&self, direction: Direction) -> Result<Option<Vec<u8>>> {
        Ok(self.frames.take(direction))
    }

    async fn received(&self, direction: Direction, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(match direction {
            Direction::Client => data.to_ascii_uppercase(),
            Direction::Server => data,
        })
    }

    async fn send(&self, _direction: Direction, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(data)
    }

    async fn send_forced(&self, direction: Direction, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok([format!("{}:", direction).as_bytes(), &data].concat())
    }
}

#[tokio::test]
async fn test_disabled_hooks_tunnel_bytes_both_ways() {
    let (client, mut client_peer, server, mut server_peer) = pair();
    let session = Session::continuous(client, server, SessionOptions::default());
    assert!(matches!(session.dispatch(), HookDispatch::Disabled));
    session.start().unwrap();

    client_peer.write_all(b"hello").await.unwrap();
    assert_eq!(read_exactly(&mut server_peer, 5).await, b"hello");

    server_peer.write_all(b"world").await.unwrap();
    assert_eq!(read_exactly(&mut client_peer, 5).await, b"world");

    drop(client_peer);
    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .expect("session did not finish");
    assert!(session.server_endpoint().is_closed());
}

#[tokio::test]
async fn test_installed_hooks_delimit_and_transform() {
    let (client, mut client_peer, server, mut server_peer) = pair();
    let session = Session::continuous(client, server, SessionOptions::default());
    session.install_hooks(Arc::new(LineHooks::default())).unwrap();
    assert!(session.install_hooks(Arc::new(LineHooks::default())).is_err());
    session.start().unwrap();
    assert!(session.start().is_err());

    client_peer.write_all(b"get a\nget").await.unwrap();
    assert_eq!(read_exactly(&mut server_peer, 6).await, b"GET A\n");
    client_peer.write_all(b" b\n").await.unwrap();
    assert_eq!(read_exactly(&mut server_peer, 6).await, b"GET B\n");

    server_peer.write_all(b"ok\n").await.unwrap();
    assert_eq!(read_exactly(&mut client_peer, 3).await, b"ok\n");

    session.close().await;
    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .expect("session did not finish");
}

#[tokio::test]
async fn test_prepare_does_not_touch_transport() {
    let (client, _client_peer, server, mut server_peer) = pair();
    let session = Session::continuous(client, server, SessionOptions::default());
    session.install_hooks(Arc::new(LineHooks::default())).unwrap();

    let prepared = session.prepare(b"ping\n".to_vec()).await.unwrap();
    assert_eq!(prepared, b"PING\n");

    let mut byte = [0u8; 1];
    let nothing = tokio::time::timeout(Duration::from_millis(50), server_peer.read(&mut byte)).await;
    assert!(nothing.is_err(), "prepare must not write");

    session.execute(&prepared).await.unwrap();
    session.execute(&prepared).await.unwrap();
    assert_eq!(read_exactly(&mut server_peer, 10).await, b"PING\nPING\n");
}

#[tokio::test]
async fn test_continuous_prepare_rejects_partial_message() {
    let (client, _client_peer, server, _server_peer) = pair();
    let session = Session::continuous(client, server, SessionOptions::default());
    session.install_hooks(Arc::new(LineHooks::default())).unwrap();

    assert!(session.prepare(b"no newline".to_vec()).await.is_err());
    assert_eq!(session.prepare(b"a\nb\n".to_vec()).await.unwrap(), b"A\n");
}

#[tokio::test]
async fn test_synchronous_send_and_receive_keep_leftover() {
    let (server, mut server_peer) = Endpoint::in_memory(addr(80), "origin.test", 1024);
    let session = Session::synchronous(Arc::new(server), SessionOptions::default());
    session.install_hooks(Arc::new(LineHooks::default())).unwrap();
    session.start().unwrap();

    session.send(b"hi\n".to_vec()).await.unwrap();
    assert_eq!(read_exactly(&mut server_peer, 3).await, b"HI\n");

    server_peer.write_all(b"one\ntwo\nthr").await.unwrap();
    assert_eq!(session.receive().await.unwrap(), Some(b"one\n".to_vec()));
    assert_eq!(session.receive().await.unwrap(), Some(b"two\n".to_vec()));

    server_peer.write_all(b"ee\n").await.unwrap();
    assert_eq!(session.receive().await.unwrap(), Some(b"three\n".to_vec()));

    drop(server_peer);
    assert_eq!(session.receive().await.unwrap(), None);
}

#[tokio::test]
async fn test_synchronous_prepare_rejects_partial_message() {
    let (server, _server_peer) = Endpoint::in_memory(addr(80), "origin.test", 1024);
    let session = Session::synchronous(Arc::new(server), SessionOptions::default());
    session.install_hooks(Arc::new(LineHooks::default())).unwrap();

    assert!(session.prepare(b"no newline".to_vec()).await.is_err());
    assert_eq!(session.prepare(b"a\nb\n".to_vec()).await.unwrap(), b"A\n");
}

#[tokio::test]
async fn test_receive_requires_synchronous_strategy() {
    let (client, _c, server, _s) = pair();
    let session = Session::continuous(client, server, SessionOptions::default());
    assert!(matches!(
        session.receive().await,
        Err(ProxyError::Unsupported { .. })
    ));
}

#[tokio::test]
async fn test_forced_sends_reach_each_side() {
    let (client, mut client_peer, server, mut server_peer) = pair();
    let session = Session::continuous(client, server, SessionOptions::default());
    session.install_hooks(Arc::new(LineHooks::default())).unwrap();

    session.send_to_server(b"x".to_vec()).await.unwrap();
    assert_eq!(read_exactly(&mut server_peer, 8).await, b"client:x");

    session.send_to_client(b"y".to_vec()).await.unwrap();
    assert_eq!(read_exactly(&mut client_peer, 8).await, b"server:y");
}

#[tokio::test]
async fn test_same_connection_shares_transport() {
    let (client, _client_peer, server, mut server_peer) = pair();
    let session = Session::continuous(client, server, SessionOptions::default());
    session.install_hooks(Arc::new(LineHooks::default())).unwrap();

    let sibling = session.same_connection();
    assert_ne!(sibling.id(), session.id());
    assert!(!sibling.hooks_installed());
    assert!(Arc::ptr_eq(sibling.server_endpoint(), session.server_endpoint()));

    sibling.execute(b"raw").await.unwrap();
    assert_eq!(read_exactly(&mut server_peer, 3).await, b"raw");
}

#[tokio::test]
async fn test_finish_without_close_keeps_endpoints() {
    let (client, _client_peer, server, _server_peer) = pair();
    let session = Session::continuous(client, server, SessionOptions::default());
    session.start().unwrap();
    session.finish_without_close();

    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .expect("engines did not stop");
    assert!(!session.server_endpoint().is_closed());
    assert!(!session.client_endpoint().unwrap().is_closed());
}

#[tokio::test]
async fn test_addressing_from_endpoints() {
    let (client, _c, server, _s) = pair();
    let session = Session::continuous(
        client,
        server,
        SessionOptions::default().with_listener(ListenerId(8080)),
    );
    let addressing = session.addressing().unwrap();
    assert_eq!(addressing.listener, ListenerId(8080));
    assert_eq!(addressing.client, addr(50000));
    assert_eq!(addressing.server, addr(80));
    assert_eq!(addressing.server_name, "origin.test");
    assert_eq!(session.listener(), Some(ListenerId(8080)));
}
