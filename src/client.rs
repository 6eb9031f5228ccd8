//! 面向调用者的连接句柄。
//!
//! 一个 `ClientConnection` 对应一条底层连接以及为它服务的管道任务。
//! 句柄被连接池持有或出借给调用者;同一时刻恰好有一个所有者。

use crate::connection::Connection;
use crate::handler::{Handler, Request};
use crate::{Error, Frame};

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::instrument;

/// 在途请求队列的默认初始容量。
///
/// 这只是容量预分配,不是上限:队列按需增长。
const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// 连接 id 分配器。id 在进程内全局唯一且稳定。
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// 与服务器建立的一条连接。
///
/// 命令通过 [`send`] 发送,同一条连接上可以有多条命令在途,响应按
/// 发送顺序逐一配对返回。句柄被丢弃后,管道任务完成剩余工作并关闭
/// 传输。
///
/// [`send`]: ClientConnection::send
#[derive(Debug)]
pub struct ClientConnection {
    /// 稳定的连接标识。
    id: u64,

    /// 发往管道任务的请求通道。
    requests: mpsc::UnboundedSender<Request>,

    /// 连接的存活标志,由管道任务维护。
    connected: watch::Receiver<bool>,
}

impl ClientConnection {
    /// 在给定的字节流上启动命令管道,返回它的句柄。
    pub fn new<T>(stream: T) -> ClientConnection
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        ClientConnection::with_capacity(stream, DEFAULT_QUEUE_CAPACITY)
    }

    /// 与 [`new`] 相同,但指定在途请求队列的初始容量。
    ///
    /// [`new`]: ClientConnection::new
    pub fn with_capacity<T>(stream: T, capacity: usize) -> ClientConnection
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (requests, rx) = mpsc::unbounded_channel();
        let (connected_tx, connected) = watch::channel(true);

        // 生成专用任务来驱动连接。此后与连接的所有交互都通过消息
        // 传递进行。
        let handler = Handler::new(Connection::new(stream), rx, connected_tx, capacity);
        tokio::spawn(handler.run());

        ClientConnection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            requests,
            connected,
        }
    }

    /// 与位于 `addr` 的服务器建立 TCP 连接。
    ///
    /// `addr` 可以是任何能够异步转换为 `SocketAddr` 的类型,包括
    /// `SocketAddr` 和字符串。`ToSocketAddrs` 特性是 Tokio 版本,而
    /// 不是 `std` 版本。
    ///
    /// # 示例
    ///
    /// ```no_run
    /// use redis_pool::{ClientConnection, Frame};
    /// use bytes::Bytes;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let connection = ClientConnection::connect("localhost:6379").await.unwrap();
    ///
    ///     let mut command = Frame::array();
    ///     command.push_bulk(Bytes::from_static(b"PING"));
    ///
    ///     let response = connection.send(command).await.unwrap();
    ///     println!("response = {:?}", response);
    /// }
    /// ```
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> crate::Result<ClientConnection> {
        let socket = TcpStream::connect(addr).await?;

        // 禁用 Nagle 算法,降低小命令的延迟。
        socket.set_nodelay(true)?;

        Ok(ClientConnection::new(socket))
    }

    /// 返回连接的稳定标识。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 连接是否仍然存活。
    ///
    /// 返回 `false` 表示传输已经失效或正在关闭,通过该句柄发送的
    /// 命令将以错误完成。
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// 等待连接关闭。连接已经关闭时立即返回。
    pub async fn closed(&self) {
        let mut connected = self.connected.clone();

        // 管道任务退出时会丢弃发送端,`wait_for` 以错误返回,同样
        // 视为已关闭。
        let _ = connected.wait_for(|connected| !connected).await;
    }

    /// 返回一个用于观察连接关闭的接收端。
    ///
    /// 必须在连接被出借之前注册观察者,否则创建与首次使用之间的
    /// 关闭事件会被丢失。
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// 发送一条命令帧并等待与之配对的响应帧。
    ///
    /// 同一条连接上并发调用 `send` 时,命令按入队顺序写出,响应按
    /// 同样的顺序返回。服务器以错误帧回复时,返回
    /// [`Error::ServerError`]。
    #[instrument(skip(self))]
    pub async fn send(&self, frame: Frame) -> crate::Result<Frame> {
        let (sink, response) = oneshot::channel();

        self.requests
            .send(Request::Command { frame, sink })
            .map_err(|_| Error::ConnectionClosed)?;

        // 管道任务总是在完成或失败时回应;响应通道被丢弃意味着任务
        // 已经退出,按连接关闭处理。
        response.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// 请求优雅关闭,并等待关闭完成。
    ///
    /// 该调用之后的 `send` 立即以 [`Error::ConnectionClosed`] 失败;
    /// 已经在途的命令继续等待响应,全部完成后传输才会关闭。重复
    /// 调用是幂等的。
    pub async fn graceful_close(&self) {
        let (done, closed) = oneshot::channel();

        if self
            .requests
            .send(Request::GracefulClose { done })
            .is_err()
        {
            // 管道任务已经退出,连接早已关闭。
            return;
        }

        let _ = closed.await;
    }
}
