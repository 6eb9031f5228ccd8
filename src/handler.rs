//! 单条连接上的命令管道。
//!
//! 一个专用任务拥有连接的两个方向:出站命令从通道中弹出,按到达
//! 顺序写入传输;入站帧按到达顺序与在途请求配对。同一条连接上,
//! 响应的顺序严格等于写出的顺序,这也是流水线式发送多条命令而无需
//! 逐条等待的前提。
//!
//! 传输层的任何故障都会级联到每一个在途请求上:解码错误、读写错误
//! 以及对端关闭都会使队列中的所有请求以同一个错误完成。

use crate::connection::Connection;
use crate::frame::Frame;
use crate::Error;

use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// 通过通道发送给管道任务的请求。
#[derive(Debug)]
pub(crate) enum Request {
    /// 一条待发送的命令,以及用于接收其响应的一次性通道。
    ///
    /// `sink` 是一种只发送**单个**值的通道,这里用于将配对的响应
    /// 送回发起请求的任务。
    Command {
        frame: Frame,
        sink: oneshot::Sender<crate::Result<Frame>>,
    },

    /// 用户触发的优雅关闭事件。
    ///
    /// 收到该事件后不再接受新的命令,已经写出的命令继续等待响应;
    /// 当在途队列排空时关闭传输,并通过 `done` 通知事件的发起者。
    GracefulClose { done: oneshot::Sender<()> },
}

/// 管道的生命周期状态。
///
/// 状态迁移是单向的:`Running` 可以进入 `Draining` 或 `Errored`,
/// 进入终态后不再发生任何迁移。
enum State {
    /// 正常收发命令。
    Running,

    /// 收到优雅关闭事件时仍有在途请求。不再接受新的写入,等待
    /// 在途队列排空后关闭传输。
    Draining { done: Option<oneshot::Sender<()>> },

    /// 传输已经失效。携带导致失效的错误,后续的写入立即以该错误
    /// 失败。
    Errored(Error),
}

/// 每条连接的管道处理任务。
///
/// 同一任务拥有连接、在途队列与状态机,所有状态的变更都在该任务内
/// 串行发生,因此不需要任何锁。
pub(crate) struct Handler<T> {
    /// 带缓冲的帧级连接。
    connection: Connection<T>,

    /// 来自连接句柄的请求。所有句柄被丢弃后,通道关闭。
    requests: mpsc::UnboundedReceiver<Request>,

    /// 在途请求的响应通道,先进先出。每成功写出一条命令追加一项,
    /// 每收到一个入站帧弹出队首一项。
    in_flight: VecDeque<oneshot::Sender<crate::Result<Frame>>>,

    /// 连接的存活标志。进入终态时翻转为 `false`,供连接句柄与池的
    /// 关闭观察者查询。
    connected: watch::Sender<bool>,

    /// 生命周期状态。
    state: State,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Handler<T> {
    pub(crate) fn new(
        connection: Connection<T>,
        requests: mpsc::UnboundedReceiver<Request>,
        connected: watch::Sender<bool>,
        capacity: usize,
    ) -> Handler<T> {
        Handler {
            connection,
            requests,
            in_flight: VecDeque::with_capacity(capacity),
            connected,
            state: State::Running,
        }
    }

    /// 运行管道直到连接关闭且所有句柄被丢弃。
    pub(crate) async fn run(mut self) {
        // 在 `Running` 与 `Draining` 状态下同时监听两个方向。两个分支
        // 都是取消安全的:未选中分支的部分进度保留在各自的缓冲区中。
        while matches!(self.state, State::Running | State::Draining { .. }) {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => {
                        // 所有句柄都已丢弃,不可能再有新的请求。按本端
                        // 关闭处理:在途请求以连接关闭失败,传输被关闭。
                        self.transition_to_errored(Error::ConnectionClosed).await;
                    }
                },
                frame = self.connection.read_frame() => {
                    self.handle_inbound(frame).await;
                }
            }
        }

        // 终态。继续应答后到的请求,直到所有句柄被丢弃为止,这样
        // 竞争中的写入者能观察到导致失效的那个错误。
        while let Some(request) = self.requests.recv().await {
            self.handle_request(request).await;
        }
    }

    /// 处理一条来自连接句柄的请求。
    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Command { frame, sink } => match &self.state {
                State::Running => {
                    debug!(request = ?frame);

                    // 先入队再写出,保证响应顺序与写出顺序一致。写出
                    // 失败走统一的传输错误路径,刚入队的请求也会随队列
                    // 一起以该错误完成。
                    self.in_flight.push_back(sink);
                    if let Err(err) = self.connection.write_frame(&frame).await {
                        self.transition_to_errored(err.into()).await;
                    }
                }
                State::Draining { .. } => {
                    let _ = sink.send(Err(Error::ConnectionClosed));
                }
                State::Errored(err) => {
                    let _ = sink.send(Err(err.clone()));
                }
            },
            Request::GracefulClose { done } => match &self.state {
                State::Running => {
                    if self.in_flight.is_empty() {
                        // 没有在途请求,立即关闭传输。先记录事件的完成
                        // 通道,关闭完成后再级联回应。
                        self.state = State::Draining { done: Some(done) };
                        self.transition_to_errored(Error::ConnectionClosed).await;
                    } else {
                        self.state = State::Draining { done: Some(done) };
                    }
                }
                // 重复的关闭事件是幂等的,立即回应成功。
                State::Draining { .. } | State::Errored(_) => {
                    let _ = done.send(());
                }
            },
        }
    }

    /// 处理从传输读到的一个结果:一个入站帧、干净的对端关闭或错误。
    async fn handle_inbound(&mut self, result: crate::Result<Option<Frame>>) {
        match result {
            Ok(Some(frame)) => {
                match self.in_flight.pop_front() {
                    Some(sink) => match frame {
                        // 错误帧作为该请求的终止回复,只影响队首的
                        // 这一个请求。
                        Frame::Error(message) => {
                            debug!(error = %message, "command failed");
                            let _ = sink.send(Err(Error::ServerError(message)));
                        }
                        frame => {
                            debug!(response = ?frame);
                            let _ = sink.send(Ok(frame));
                        }
                    },
                    None => {
                        // 在途队列为空时收到帧:非订阅通道上的服务器
                        // 推送,或者协议违规。丢弃该帧,记录但绝不中断
                        // 连接。
                        debug!(?frame, "discarding frame received with no request in flight");
                    }
                }

                // 排空中的连接在最后一个响应到达后关闭传输。
                if self.in_flight.is_empty() && matches!(self.state, State::Draining { .. }) {
                    self.transition_to_errored(Error::ConnectionClosed).await;
                }
            }
            // 对端干净地关闭了连接。
            Ok(None) => {
                self.transition_to_errored(Error::ConnectionClosed).await;
            }
            // 解码错误或读错误。
            Err(err) => {
                self.transition_to_errored(err).await;
            }
        }
    }

    /// 进入 `Errored` 终态。该迁移最多发生一次。
    ///
    /// 在途队列按先进先出的顺序以同一个错误整体失败,传输被尽力
    /// 关闭。如果此前正处于排空状态,关闭完成后回应排空事件。
    async fn transition_to_errored(&mut self, err: Error) {
        if matches!(self.state, State::Errored(_)) {
            return;
        }
        let previous = std::mem::replace(&mut self.state, State::Errored(err.clone()));

        // 翻转存活标志。接收端全部消失时发送失败,可以忽略。
        let _ = self.connected.send(false);

        // 级联失败所有在途请求。
        for sink in self.in_flight.drain(..) {
            let _ = sink.send(Err(err.clone()));
        }

        // 尽力关闭传输,关闭失败没有可以通知的对象。
        let _ = self.connection.shutdown().await;

        if let State::Draining { done: Some(done) } = previous {
            let _ = done.send(());
        }
    }
}

impl<T> Drop for Handler<T> {
    fn drop(&mut self) {
        // 管道在仍有在途请求时被丢弃属于编程错误:持有连接的一方
        // 必须先排空队列。
        debug_assert!(
            self.in_flight.is_empty(),
            "handler dropped with requests in flight"
        );
    }
}
