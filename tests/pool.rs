//! 连接池的集成测试。连接工厂在内存双工管道上搭建连接,对端是一个
//! 对每条命令回复 `+OK` 的极简服务器。时间相关的场景在暂停的时钟下
//! 运行,虚拟时间自动推进。

use redis_pool::{ClientConnection, Connection, Error, Frame, Pool, PoolConfig};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io;
use tokio::time::{self, Duration, Instant};

/// 搭建一条由内存服务器支撑的连接。服务器对每条命令回复 `+OK`,
/// 并在连接关闭时递增 `closed` 计数。
fn server_backed_connection(closed: Arc<AtomicUsize>) -> ClientConnection {
    let (client, server) = io::duplex(4096);

    tokio::spawn(async move {
        let mut connection = Connection::new(server);
        while let Ok(Some(_)) = connection.read_frame().await {
            if connection
                .write_frame(&Frame::Simple("OK".to_string()))
                .await
                .is_err()
            {
                break;
            }
        }
        closed.fetch_add(1, Ordering::SeqCst);
    });

    ClientConnection::new(client)
}

/// 用给定配置搭建一个池,返回池句柄以及创建/关闭计数。
fn pool_with(config: PoolConfig) -> (Pool, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let created = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));

    let pool = Pool::new(config, {
        let created = created.clone();
        let closed = closed.clone();
        move || {
            created.fetch_add(1, Ordering::SeqCst);
            let closed = closed.clone();
            async move { Ok(server_backed_connection(closed)) }
        }
    });

    (pool, created, closed)
}

/// 一个宽裕的截止时间。
fn generous_deadline() -> Instant {
    Instant::now() + Duration::from_secs(60)
}

#[tokio::test]
#[should_panic(expected = "pool misconfiguration")]
async fn rejects_min_above_max() {
    let config = PoolConfig {
        max_connections: 1,
        min_connections: 2,
        ..Default::default()
    };

    let _pool = Pool::new(config, || async {
        Err::<ClientConnection, Error>(Error::PoolClosed)
    });
}

#[tokio::test(start_paused = true)]
async fn hands_returned_connection_to_waiting_lease() {
    let config = PoolConfig {
        max_connections: 2,
        min_connections: 1,
        leaky: false,
        ..Default::default()
    };
    let (pool, _created, closed) = pool_with(config);

    let a = pool.lease_connection(generous_deadline()).await.unwrap();
    let b = pool.lease_connection(generous_deadline()).await.unwrap();
    let a_id = a.id();

    // 池已饱和,第三个租借排队等待。
    let mut third = tokio::spawn({
        let pool = pool.clone();
        async move { pool.lease_connection(generous_deadline()).await }
    });
    assert!(time::timeout(Duration::from_millis(50), &mut third)
        .await
        .is_err());

    // 归还一条连接,队首的等待者立即得到这一条。
    pool.return_connection(a);
    let c = third.await.unwrap().unwrap();
    assert_eq!(c.id(), a_id);

    // 两条连接仍然存活,归还后池中保有两条空闲连接。
    pool.return_connection(b);
    pool.return_connection(c);

    pool.close().await;

    // 关闭完成后,池保有的连接都已关闭,新的租借立即失败。
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(closed.load(Ordering::SeqCst), 2);
    assert!(matches!(
        pool.lease_connection(generous_deadline()).await,
        Err(Error::PoolClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn leaky_pool_discards_overflow_connection() {
    let config = PoolConfig {
        max_connections: 1,
        min_connections: 0,
        leaky: true,
        ..Default::default()
    };
    let (pool, created, closed) = pool_with(config);

    // 泄漏模式:池饱和后仍为第二个租借新建连接。
    let first = pool.lease_connection(generous_deadline()).await.unwrap();
    let second = pool.lease_connection(generous_deadline()).await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 2);

    let second_id = second.id();

    pool.return_connection(first);
    pool.return_connection(second);

    // 池容量为一:最旧的连接被逐出关闭,保留最近归还的那条。
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    let leased = pool.lease_connection(generous_deadline()).await.unwrap();
    assert_eq!(leased.id(), second_id);

    pool.return_connection(leased);
    pool.close().await;
}

#[tokio::test(start_paused = true)]
async fn retries_with_exponential_backoff() {
    let attempts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicUsize::new(0));

    let config = PoolConfig {
        max_connections: 2,
        min_connections: 1,
        leaky: false,
        initial_backoff: Duration::from_millis(100),
        backoff_factor: 2.0,
    };

    let pool = Pool::new(config, {
        let attempts = attempts.clone();
        let closed = closed.clone();
        move || {
            let mut attempts = attempts.lock().unwrap();
            attempts.push(Instant::now());
            let attempt = attempts.len();
            let closed = closed.clone();

            async move {
                // 前两次尝试失败,第三次成功。
                if attempt <= 2 {
                    Err(Error::ConnectionClosed)
                } else {
                    Ok(server_backed_connection(closed))
                }
            }
        }
    });

    pool.activate();

    // 0ms 失败,100ms 失败,300ms 成功。
    time::sleep(Duration::from_millis(400)).await;

    {
        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 3);

        // 第一次重试的延迟等于初始退避,第二次等于初始退避乘以
        // 增长系数。
        assert_eq!(attempts[1] - attempts[0], Duration::from_millis(100));
        assert_eq!(attempts[2] - attempts[1], Duration::from_millis(200));
    }

    // 补充扫描的成果:池中有一条存活的连接可供租借。
    let connection = pool.lease_connection(generous_deadline()).await.unwrap();
    assert!(connection.is_connected());

    pool.return_connection(connection);
    pool.close().await;
}

#[tokio::test(start_paused = true)]
async fn lease_times_out_without_a_connection() {
    let config = PoolConfig {
        max_connections: 1,
        min_connections: 0,
        leaky: false,
        ..Default::default()
    };
    let (pool, _created, _closed) = pool_with(config);

    let held = pool.lease_connection(generous_deadline()).await.unwrap();

    // 池已饱和且不泄漏,第二个租借只能等到超时。
    let result = pool
        .lease_connection(Instant::now() + Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(Error::TimedOutWaitingForConnection)));

    // 超时的等待者不再接收连接:之后归还的连接回到空闲队列。
    pool.return_connection(held);
    time::sleep(Duration::from_millis(10)).await;

    let leased = pool.lease_connection(generous_deadline()).await.unwrap();
    pool.return_connection(leased);
    pool.close().await;
}

#[tokio::test(start_paused = true)]
async fn leases_most_recently_returned_connection_first() {
    let config = PoolConfig {
        max_connections: 3,
        min_connections: 0,
        leaky: false,
        ..Default::default()
    };
    let (pool, _created, _closed) = pool_with(config);

    let first = pool.lease_connection(generous_deadline()).await.unwrap();
    let second = pool.lease_connection(generous_deadline()).await.unwrap();
    let third = pool.lease_connection(generous_deadline()).await.unwrap();
    let third_id = third.id();

    pool.return_connection(first);
    pool.return_connection(second);
    pool.return_connection(third);
    time::sleep(Duration::from_millis(10)).await;

    // 最近归还的连接最先被出借。
    let leased = pool.lease_connection(generous_deadline()).await.unwrap();
    assert_eq!(leased.id(), third_id);

    pool.return_connection(leased);
    pool.close().await;
}

#[tokio::test(start_paused = true)]
async fn replaces_dead_connection_on_return() {
    let config = PoolConfig {
        max_connections: 2,
        min_connections: 1,
        leaky: false,
        ..Default::default()
    };
    let (pool, created, _closed) = pool_with(config);

    // 先让补充扫描把连接建好,再租借,避免租借自己触发新的创建。
    pool.activate();
    time::sleep(Duration::from_millis(10)).await;

    let connection = pool.lease_connection(generous_deadline()).await.unwrap();
    let first_id = connection.id();
    assert_eq!(created.load(Ordering::SeqCst), 1);

    // 连接在出借期间失效。
    connection.graceful_close().await;
    assert!(!connection.is_connected());

    pool.return_connection(connection);
    time::sleep(Duration::from_millis(10)).await;

    // 失效的连接被丢弃,补充扫描恢复最小水位。
    assert_eq!(created.load(Ordering::SeqCst), 2);

    let replacement = pool.lease_connection(generous_deadline()).await.unwrap();
    assert_ne!(replacement.id(), first_id);
    assert!(replacement.is_connected());

    pool.return_connection(replacement);
    pool.close().await;
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent_and_cascades() {
    let config = PoolConfig {
        max_connections: 2,
        min_connections: 0,
        leaky: false,
        ..Default::default()
    };
    let (pool, _created, _closed) = pool_with(config);

    let connection = pool.lease_connection(generous_deadline()).await.unwrap();

    // 第一次关闭等待出借在外的连接归还。
    let mut closing = tokio::spawn({
        let pool = pool.clone();
        async move { pool.close().await }
    });
    assert!(time::timeout(Duration::from_millis(50), &mut closing)
        .await
        .is_err());

    // 关闭期间的租借立即失败。
    assert!(matches!(
        pool.lease_connection(generous_deadline()).await,
        Err(Error::PoolClosed)
    ));

    // 归还最后一条连接,关闭流程完成。
    pool.return_connection(connection);
    closing.await.unwrap();

    // 重复关闭立即完成。
    pool.close().await;
}
