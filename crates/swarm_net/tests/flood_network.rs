//! End-to-end tests: real nodes on loopback sockets.

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use swarm_net::{Direction, EnvelopeCodec, NetworkConfig, NodeEvent, SwarmNode};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::FramedRead;

fn config(min_peers: usize, max_peers: usize, seeds: Vec<String>) -> NetworkConfig {
    NetworkConfig {
        bind_host: "127.0.0.1".to_string(),
        port: 0,
        seed_hosts: seeds,
        min_peers,
        max_peers,
        discovery_interval: Duration::from_millis(50),
        connection_timeout: Duration::from_secs(2),
        ..NetworkConfig::default()
    }
}

/// Poll `check` until it returns true or five seconds pass.
async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

async fn peer_count(node: &SwarmNode) -> usize {
    node.peers().await.map(|p| p.len()).unwrap_or(0)
}

/// Collect `command` events arriving within `window`.
async fn collect_messages(
    rx: &mut broadcast::Receiver<NodeEvent>,
    command: &str,
    window: Duration,
) -> Vec<NodeEvent> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        if matches!(&event, NodeEvent::Message(m) if m.command == command) {
            out.push(event);
        }
    }
    out
}

#[tokio::test]
async fn test_node_joins_through_seed_host() {
    let b = SwarmNode::spawn(config(3, 10, vec![])).await.unwrap();
    let a = SwarmNode::spawn(config(1, 2, vec![b.host().to_string()]))
        .await
        .unwrap();
    let (a, b) = (&a, &b);

    let a_port = a.port();
    assert!(
        wait_until(|| async move {
            let Ok(peers) = b.peers().await else {
                return false;
            };
            peer_count(a).await == 1 && peers.len() == 1 && peers[0].port == Some(a_port)
        })
        .await,
        "nodes never paired up"
    );

    // A few more discovery rounds must not open duplicate connections.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let a_peers = a.peers().await.unwrap();
    let b_peers = b.peers().await.unwrap();
    assert_eq!(a_peers.len(), 1);
    assert_eq!(b_peers.len(), 1);
    assert_eq!(a_peers[0].direction, Direction::Outgoing);
    assert_eq!(a_peers[0].host.as_deref(), Some(b.host()));
    assert_eq!(b_peers[0].direction, Direction::Incoming);
    assert_eq!(b_peers[0].host.as_deref(), Some(a.host()));

    // B learned A's listening address from the port exchange.
    assert!(b.seed_hosts().await.unwrap().contains(&a.host().to_string()));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_broadcast_reaches_every_node_once() {
    let hub = SwarmNode::spawn(config(1, 10, vec![])).await.unwrap();
    let left = SwarmNode::spawn(config(1, 10, vec![hub.host().to_string()]))
        .await
        .unwrap();
    let right = SwarmNode::spawn(config(1, 10, vec![hub.host().to_string()]))
        .await
        .unwrap();
    let (hub, left, right) = (&hub, &left, &right);

    assert!(
        wait_until(|| async move {
            peer_count(hub).await == 2
                && peer_count(left).await == 1
                && peer_count(right).await == 1
        })
        .await,
        "star topology never formed"
    );

    let mut hub_rx = hub.subscribe();
    let mut left_rx = left.subscribe();
    let mut right_rx = right.subscribe();

    hub.broadcast("chat", serde_json::json!("hi")).await.unwrap();

    let window = Duration::from_millis(500);
    let (left_msgs, right_msgs, hub_msgs) = tokio::join!(
        collect_messages(&mut left_rx, "chat", window),
        collect_messages(&mut right_rx, "chat", window),
        collect_messages(&mut hub_rx, "chat", window),
    );

    for msgs in [&left_msgs, &right_msgs] {
        assert_eq!(msgs.len(), 1);
        let NodeEvent::Message(message) = &msgs[0] else {
            unreachable!()
        };
        assert_eq!(message.payload, serde_json::json!("hi"));
        assert_eq!(message.hops, Some(1));
        assert_eq!(&message.sender, hub.id());
    }
    // The echo relayed back to the originator is suppressed.
    assert!(hub_msgs.is_empty());

    hub.shutdown();
    left.shutdown();
    right.shutdown();
}

#[tokio::test]
async fn test_relay_crosses_a_line_of_nodes() {
    // first <- middle <- last: a message from `first` needs one relay to
    // reach `last`.
    let first = SwarmNode::spawn(config(1, 10, vec![])).await.unwrap();
    let middle = SwarmNode::spawn(config(1, 10, vec![first.host().to_string()]))
        .await
        .unwrap();
    let (first, middle) = (&first, &middle);
    assert!(wait_until(|| async move { peer_count(first).await == 1 }).await);

    let last = SwarmNode::spawn(config(1, 10, vec![middle.host().to_string()]))
        .await
        .unwrap();
    assert!(wait_until(|| async move { peer_count(middle).await == 2 }).await);

    let mut last_rx = last.subscribe();
    first
        .broadcast("note", serde_json::json!({ "n": 7 }))
        .await
        .unwrap();

    let msgs = collect_messages(&mut last_rx, "note", Duration::from_millis(500)).await;
    assert_eq!(msgs.len(), 1);
    let NodeEvent::Message(message) = &msgs[0] else {
        unreachable!()
    };
    assert_eq!(message.hops, Some(2));
    assert_eq!(&message.sender, first.id());

    first.shutdown();
    middle.shutdown();
    last.shutdown();
}

#[tokio::test]
async fn test_full_node_turns_connection_away_with_hosts() {
    let full = SwarmNode::spawn(config(1, 2, vec![])).await.unwrap();
    let one = SwarmNode::spawn(config(1, 10, vec![full.host().to_string()]))
        .await
        .unwrap();
    let two = SwarmNode::spawn(config(1, 10, vec![full.host().to_string()]))
        .await
        .unwrap();
    let (full, one, two) = (&full, &one, &two);

    assert!(
        wait_until(|| async move {
            let seeds = full.seed_hosts().await.unwrap_or_default();
            peer_count(full).await == 2
                && seeds.contains(&one.host().to_string())
                && seeds.contains(&two.host().to_string())
        })
        .await,
        "full node never reached capacity"
    );

    let stream = TcpStream::connect(("127.0.0.1", full.port())).await.unwrap();
    let mut frames = FramedRead::new(stream, EnvelopeCodec::new());

    let first = tokio::time::timeout(Duration::from_secs(2), frames.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.command, "hosts!");
    assert_eq!(&first.sender, full.id());
    let hosts: Vec<String> = serde_json::from_value(first.payload).unwrap();
    assert!(hosts.contains(&one.host().to_string()));
    assert!(hosts.contains(&two.host().to_string()));

    // Nothing else follows; the node hangs up.
    let next = tokio::time::timeout(Duration::from_secs(2), frames.next())
        .await
        .unwrap();
    assert!(next.is_none());
    assert_eq!(peer_count(full).await, 2);

    full.shutdown();
    one.shutdown();
    two.shutdown();
}

#[tokio::test]
async fn test_connecting_twice_keeps_one_peer() {
    let target = SwarmNode::spawn(config(3, 10, vec![])).await.unwrap();
    let dialer = SwarmNode::spawn(config(3, 10, vec![])).await.unwrap();
    let (target, dialer) = (&target, &dialer);

    dialer.connect("localhost", target.port()).await.unwrap();
    dialer.connect("localhost", target.port()).await.unwrap();

    assert!(wait_until(|| async move { peer_count(target).await == 1 }).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(peer_count(dialer).await, 1);
    assert_eq!(peer_count(target).await, 1);

    dialer.shutdown();
    target.shutdown();
}

#[tokio::test]
async fn test_lifecycle_events_on_remote_shutdown() {
    let server = SwarmNode::spawn(config(3, 10, vec![])).await.unwrap();
    let client = SwarmNode::spawn(config(3, 10, vec![])).await.unwrap();
    let client = &client;
    let mut events = client.subscribe();

    client.connect("localhost", server.port()).await.unwrap();
    let opened = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(opened.name(), "newOutgoingConnection");
    assert_eq!(opened.peer().port, Some(server.port()));

    // Let the handshake frames settle before the remote goes away.
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.shutdown();
    let lost = loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        if !matches!(event, NodeEvent::Message(_)) {
            break event;
        }
    };
    assert_eq!(lost.name(), "lostOutgoingConnection");
    assert!(wait_until(|| async move { peer_count(client).await == 0 }).await);

    client.shutdown();
}

#[tokio::test]
async fn test_max_hop_frame_does_not_stop_node() {
    let node = SwarmNode::spawn(config(3, 10, vec![])).await.unwrap();
    let mut events = node.subscribe();

    let mut stream = TcpStream::connect(("127.0.0.1", node.port())).await.unwrap();
    let frame = concat!(
        r#"{"id":"x","sender":"elsewhere","command":"chat","payload":1,"#,
        r#""broadcast":true,"hops":4294967295}"#,
        "\n"
    );
    stream.write_all(frame.as_bytes()).await.unwrap();

    let msgs = collect_messages(&mut events, "chat", Duration::from_millis(500)).await;
    assert_eq!(msgs.len(), 1);
    let NodeEvent::Message(message) = &msgs[0] else {
        unreachable!()
    };
    assert_eq!(message.hops, Some(u32::MAX));

    // The node is still serving and the sender is still a peer.
    assert_eq!(node.peers().await.unwrap().len(), 1);
    node.shutdown();
}
