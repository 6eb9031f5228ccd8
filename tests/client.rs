//! 命令管道的集成测试。传输使用内存双工管道,对端用 `Connection`
//! 扮演一个脚本化的服务器。

use redis_pool::{ClientConnection, Connection, Error, Frame};

use bytes::Bytes;
use std::sync::Arc;
use tokio::io;
use tokio::time::{self, Duration};

/// 构造一条单参数命令帧。
fn command(name: &str) -> Frame {
    let mut frame = Frame::array();
    frame.push_bulk(Bytes::copy_from_slice(name.as_bytes()));
    frame
}

#[tokio::test]
async fn responses_resolve_requests_in_order() {
    let (client, server) = io::duplex(4096);
    let connection = ClientConnection::new(client);

    let server = tokio::spawn(async move {
        let mut connection = Connection::new(server);
        for i in 1..=3i64 {
            let request = connection.read_frame().await.unwrap().unwrap();
            assert!(matches!(request, Frame::Array(_)));
            connection.write_frame(&Frame::Integer(i)).await.unwrap();
        }
    });

    // 三条命令流水线式发出,不等前一条的响应。
    let (first, second, third) = tokio::join!(
        connection.send(command("PING")),
        connection.send(command("PING")),
        connection.send(command("PING")),
    );

    assert_eq!(first.unwrap(), Frame::Integer(1));
    assert_eq!(second.unwrap(), Frame::Integer(2));
    assert_eq!(third.unwrap(), Frame::Integer(3));

    server.await.unwrap();
}

#[tokio::test]
async fn error_frame_fails_exactly_one_request() {
    let (client, server) = io::duplex(4096);
    let connection = ClientConnection::new(client);

    let server = tokio::spawn(async move {
        let mut connection = Connection::new(server);

        let _ = connection.read_frame().await.unwrap().unwrap();
        connection
            .write_frame(&Frame::Error("ERR test".to_string()))
            .await
            .unwrap();

        let _ = connection.read_frame().await.unwrap().unwrap();
        connection.write_frame(&Frame::Integer(1)).await.unwrap();
    });

    let (first, second) = tokio::join!(
        connection.send(command("GET")),
        connection.send(command("GET")),
    );

    // 错误帧只影响队首的那一个请求,连接保持可用。
    assert!(matches!(first, Err(Error::ServerError(message)) if message == "ERR test"));
    assert_eq!(second.unwrap(), Frame::Integer(1));
    assert!(connection.is_connected());

    server.await.unwrap();
}

#[tokio::test]
async fn transport_close_fails_all_requests_in_flight() {
    let (client, server) = io::duplex(4096);
    let connection = ClientConnection::new(client);

    let server = tokio::spawn(async move {
        let mut connection = Connection::new(server);
        for _ in 0..3 {
            let _ = connection.read_frame().await.unwrap().unwrap();
        }
        connection.write_frame(&Frame::Integer(1)).await.unwrap();

        // 在第二、三条响应之前关闭连接。
        drop(connection);
    });

    let (first, second, third) = tokio::join!(
        connection.send(command("GET")),
        connection.send(command("GET")),
        connection.send(command("GET")),
    );

    assert_eq!(first.unwrap(), Frame::Integer(1));
    assert!(matches!(second, Err(Error::ConnectionClosed)));
    assert!(matches!(third, Err(Error::ConnectionClosed)));

    // 之后的写入同样立即失败。
    connection.closed().await;
    assert!(!connection.is_connected());
    assert!(matches!(
        connection.send(command("PING")).await,
        Err(Error::ConnectionClosed)
    ));

    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unsolicited_frame_is_ignored() {
    let (client, server) = io::duplex(4096);
    let connection = ClientConnection::new(client);

    let server = tokio::spawn(async move {
        let mut connection = Connection::new(server);

        // 没有任何请求在途时推送一个帧。
        connection.write_frame(&Frame::Integer(99)).await.unwrap();

        let _ = connection.read_frame().await.unwrap().unwrap();
        connection
            .write_frame(&Frame::Simple("PONG".to_string()))
            .await
            .unwrap();
    });

    // 让管道先读到并丢弃推送帧。
    time::sleep(Duration::from_millis(10)).await;

    // 推送帧不会被配对到后续的请求上。
    let response = connection.send(command("PING")).await.unwrap();
    assert_eq!(response, Frame::Simple("PONG".to_string()));
    assert!(connection.is_connected());

    server.await.unwrap();
}

#[tokio::test]
async fn graceful_close_with_no_requests_closes_immediately() {
    let (client, server) = io::duplex(4096);
    let connection = ClientConnection::new(client);

    connection.graceful_close().await;

    assert!(!connection.is_connected());
    assert!(matches!(
        connection.send(command("PING")).await,
        Err(Error::ConnectionClosed)
    ));

    // 对端观察到干净的关闭。
    let mut server = Connection::new(server);
    assert!(server.read_frame().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn graceful_close_drains_requests_in_flight() {
    let (client, server) = io::duplex(4096);
    let connection = Arc::new(ClientConnection::new(client));

    let server_task = tokio::spawn(async move {
        let mut connection = Connection::new(server);

        let _ = connection.read_frame().await.unwrap().unwrap();
        let _ = connection.read_frame().await.unwrap().unwrap();

        // 在响应之前留出窗口,让关闭事件与后续的写入先到达。
        time::sleep(Duration::from_millis(50)).await;

        connection.write_frame(&Frame::Integer(1)).await.unwrap();
        connection.write_frame(&Frame::Integer(2)).await.unwrap();

        // 排空完成后,对端关闭传输。
        assert!(connection.read_frame().await.unwrap().is_none());
    });

    let first = tokio::spawn({
        let connection = connection.clone();
        async move { connection.send(command("GET")).await }
    });
    let second = tokio::spawn({
        let connection = connection.clone();
        async move { connection.send(command("GET")).await }
    });

    // 等两条命令都已写出。
    time::sleep(Duration::from_millis(10)).await;

    let drain = tokio::spawn({
        let connection = connection.clone();
        async move { connection.graceful_close().await }
    });

    time::sleep(Duration::from_millis(10)).await;

    // 排空期间新的写入立即失败。
    assert!(matches!(
        connection.send(command("GET")).await,
        Err(Error::ConnectionClosed)
    ));

    // 已经在途的命令仍然得到各自的响应。
    assert_eq!(first.await.unwrap().unwrap(), Frame::Integer(1));
    assert_eq!(second.await.unwrap().unwrap(), Frame::Integer(2));

    drain.await.unwrap();
    assert!(!connection.is_connected());

    server_task.await.unwrap();
}

#[tokio::test]
async fn graceful_close_is_idempotent() {
    let (client, _server) = io::duplex(4096);
    let connection = ClientConnection::new(client);

    connection.graceful_close().await;
    connection.graceful_close().await;

    assert!(!connection.is_connected());
}
