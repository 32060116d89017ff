//! Link ordering over real TCP
//!
//! Drives a LinkRegistry directly: envelopes enqueued on one Link leave in
//! FIFO order, and a Link rebound to a new socket keeps its queue and its
//! identity.
//!
//! Run with: cargo test --test integration_link_ordering

use meshrelay_core::message::{read_frame, FrameRead, DEFAULT_MAX_FRAME_LEN};
use meshrelay_core::{Envelope, LinkRegistry, LinkRole, LinkState, PeerKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

async fn recv(stream: &mut TcpStream) -> Envelope {
    let frame = timeout(Duration::from_secs(5), read_frame(stream, DEFAULT_MAX_FRAME_LEN))
        .await
        .expect("no envelope arrived")
        .expect("read failed");
    match frame {
        FrameRead::Envelope(env) => env,
        FrameRead::Malformed(e) => panic!("malformed frame: {e}"),
    }
}

/// Connect to `listener`, returning (dialed side, accepted side)
async fn pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
    let addr = listener.local_addr().unwrap();
    let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (dialed.unwrap(), accepted.unwrap().0)
}

fn envelope(id: String) -> Envelope {
    Envelope::builder(id, "grp").build()
}

#[tokio::test]
async fn test_fifo_across_rebind() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let registry = LinkRegistry::new();
    let key = PeerKey::from("upstream");

    let (dialed, mut remote) = pair(&listener).await;
    let link = registry.get_or_create(key.clone(), LinkRole::Outbound, dialed);

    for i in 0..100 {
        link.enqueue(envelope(format!("a{i}")));
    }
    for i in 0..100 {
        assert_eq!(recv(&mut remote).await.id(), format!("a{i}"));
    }
    println!("✓ 100 envelopes in order on the first socket");

    drop(remote);
    timeout(Duration::from_secs(5), link.disconnected()).await?;
    assert_eq!(link.state(), LinkState::Reconnecting);

    for i in 0..20 {
        link.enqueue(envelope(format!("b{i}")));
    }
    assert_eq!(link.queue_len(), 20);

    let (dialed, mut remote) = pair(&listener).await;
    let rebound = registry.get_or_create(key, LinkRole::Outbound, dialed);
    assert!(Arc::ptr_eq(&link, &rebound));
    assert_eq!(link.generation(), 2);

    for i in 0..20 {
        assert_eq!(recv(&mut remote).await.id(), format!("b{i}"));
    }
    println!("✓ 20 queued envelopes drained in order after rebind");

    assert_eq!(registry.len(), 1);
    registry.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_keep_their_order() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let registry = LinkRegistry::new();
    let (dialed, mut remote) = pair(&listener).await;
    let link = registry.get_or_create(PeerKey::from("sink"), LinkRole::Outbound, dialed);

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                for i in 0..25 {
                    link.enqueue(envelope(format!("p{p}-{i}")));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await?;
    }

    let mut next = [0usize; 4];
    for _ in 0..100 {
        let got = recv(&mut remote).await;
        let (p, i) = got.id()[1..].split_once('-').expect("id shape");
        let p: usize = p.parse()?;
        let i: usize = i.parse()?;
        assert_eq!(i, next[p], "producer {p} out of order");
        next[p] += 1;
    }
    assert_eq!(next, [25; 4]);
    println!("✓ each producer's envelopes arrived in its own order");

    registry.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_detached_link_buffers() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let registry = LinkRegistry::new();
    let key = PeerKey::from("later");

    let link = registry.ensure(key.clone(), LinkRole::Outbound);
    assert_eq!(link.state(), LinkState::Connecting);
    for i in 0..5 {
        link.enqueue(envelope(format!("c{i}")));
    }

    let (dialed, mut remote) = pair(&listener).await;
    registry.get_or_create(key, LinkRole::Outbound, dialed);
    for i in 0..5 {
        assert_eq!(recv(&mut remote).await.id(), format!("c{i}"));
    }
    println!("✓ envelopes queued before the first connect were delivered");

    registry.shutdown().await;
    Ok(())
}
