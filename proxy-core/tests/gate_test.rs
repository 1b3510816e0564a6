use proxy_common::ListenerId;
use proxy_core::{assemble_intercept, CodecRegistry, Endpoint, PipelineContext, ProxyConfig, Session};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

fn request(path: &str) -> Vec<u8> {
    format!("GET /{} HTTP/1.1\r\nHost: a\r\n\r\n", path).into_bytes()
}

fn session(ctx: &PipelineContext, port: u16) -> (Arc<Session>, DuplexStream, DuplexStream) {
    let (client, client_peer) = Endpoint::in_memory(
        format!("127.0.0.1:{}", port).parse().unwrap(),
        "client",
        4096,
    );
    let (server, server_peer) = Endpoint::in_memory("127.0.0.1:80".parse().unwrap(), "a", 4096);
    let session = Session::continuous(
        Arc::new(client),
        Arc::new(server),
        ctx.session_options().with_listener(ListenerId(8080)),
    );
    assemble_intercept(ctx, &session, "HTTP", None).unwrap();
    session.start().unwrap();
    (session, client_peer, server_peer)
}

#[tokio::test]
async fn test_concurrent_sessions_are_reviewed_one_at_a_time() {
    let ctx = PipelineContext::new(&ProxyConfig::default(), Arc::new(CodecRegistry::with_builtin()));
    ctx.gate.enable_intercept_mode();

    let mut peers = Vec::new();
    for (i, port) in [50001u16, 50002, 50003, 50004].into_iter().enumerate() {
        let (_session, mut client_peer, server_peer) = session(&ctx, port);
        client_peer.write_all(&request(&format!("p{}", i))).await.unwrap();
        peers.push((client_peer, server_peer, i));
    }

    let mut rx = ctx.gate.subscribe();
    let mut shown = HashSet::new();
    let mut last_verdict: Option<Vec<u8>> = None;
    while shown.len() < 4 {
        let pending = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(p) = rx.borrow_and_update().clone() {
                    if ctx.gate.is_waiting() {
                        return p;
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("gate idle");

        // only one review at a time, and never the previous verdict
        assert_ne!(Some(&pending.data), last_verdict.as_ref());
        assert!(shown.insert(pending.data.clone()), "exchange shown twice");
        let verdict = String::from_utf8(pending.data.clone())
            .unwrap()
            .replace("Host: a", "Host: reviewed");
        assert!(ctx.gate.forward(verdict.clone().into_bytes()));
        last_verdict = Some(verdict.into_bytes());
    }

    for (_client_peer, mut server_peer, i) in peers {
        let expected = String::from_utf8(request(&format!("p{}", i)))
            .unwrap()
            .replace("Host: a", "Host: reviewed");
        let mut buf = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(5), server_peer.read_exact(&mut buf))
            .await
            .expect("server never received its request")
            .unwrap();
        assert_eq!(buf, expected.as_bytes());
    }

    let all = ctx.history.all();
    assert_eq!(all.len(), 4);
    assert!(all.iter().all(|e| e.modified));
    assert_eq!(
        ctx.metrics
            .exchanges_intercepted
            .load(std::sync::atomic::Ordering::Relaxed),
        4
    );
}
