use std::sync::Arc;
use std::time::Duration;

use framenet::{
    free_udp_port, udp_send, udp_send_recv, AppResult, Deadline, Retry, UdpConn, UdpServer,
};

async fn echo(conn: UdpConn) -> AppResult<()> {
    loop {
        let (data, peer) = conn.recv(0, Retry::none()).await?;
        conn.send_to(&data, peer, Retry::none()).await?;
    }
}

#[tokio::test]
async fn test_echo_on_free_port() {
    let port = free_udp_port().await.unwrap();
    let server = Arc::new(UdpServer::new(format!(":{}", port), echo));
    let handle = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };
    let mut listened = None;
    for _ in 0..100 {
        if let Ok(port) = server.listened_port() {
            listened = Some(port);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(listened, Some(port));

    let address = format!("127.0.0.1:{}", port);
    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        udp_send_recv(&address, b"datagram", 0, Retry::none()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(&reply[..], b"datagram");

    udp_send(&address, b"fire and forget", Retry::none())
        .await
        .unwrap();

    server.close();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_deadline_applies_until_cleared() {
    let mut conn = UdpConn::bind("127.0.0.1:0").await.unwrap();
    conn.set_deadline_recv(Some(tokio::time::Instant::now() + Duration::from_millis(30)));
    let err = conn.recv(0, Retry::none()).await.unwrap_err();
    assert!(err.is_timeout());
    // an elapsed deadline keeps failing reads until it is reset
    let err = conn.recv(0, Retry::none()).await.unwrap_err();
    assert!(err.is_timeout());

    conn.set_deadline_recv(None);
    let peer = UdpConn::connect(&conn.local_addr().unwrap().to_string(), None)
        .await
        .unwrap();
    peer.send(b"late", Retry::none()).await.unwrap();
    let (data, _) = conn.recv(0, Retry::none()).await.unwrap();
    assert_eq!(&data[..], b"late");
}
