//! 动态管理的连接池。
//!
//! 池按需把存活的连接出借给调用者,用指数退避创建新连接,维持
//! 最小/最大连接数不变式,并提供有序的关闭流程。
//!
//! 池的全部状态由一个专用任务拥有,公开方法把操作投递到该任务的
//! 消息队列上,消息被串行处理。这样的安排取代了锁:任何时刻只有
//! 池任务自己在变更状态。
//!
//! 池有两种溢出策略。非泄漏模式下,存活连接总数不超过最大值,
//! 饱和时新的租借请求只能排队等待。泄漏模式下,池饱和时仍会为
//! 等待者创建新连接,这些连接用完即弃,不会留在池中。

use crate::client::ClientConnection;
use crate::Error;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::debug;

/// 连接池配置。构造之后不可变。
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// 池保有的最大连接数。泄漏模式下只约束池内的空闲连接,不约束
    /// 瞬时存在的连接总数。
    pub max_connections: usize,

    /// 池维持的最小连接数。连接意外关闭后,池会自动补充到该水位。
    pub min_connections: usize,

    /// 泄漏模式开关。
    pub leaky: bool,

    /// 首次连接尝试失败后的重试延迟。
    pub initial_backoff: Duration,

    /// 每次重试之间延迟的增长系数。
    pub backoff_factor: f64,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_connections: 8,
            min_connections: 0,
            leaky: false,
            initial_backoff: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }
}

/// 投递给池任务的消息。
enum PoolMessage {
    /// 租借一条连接。`deadline` 到期仍未满足时以超时错误完成。
    Lease {
        deadline: Instant,
        sink: oneshot::Sender<crate::Result<ClientConnection>>,
    },

    /// 归还一条此前租借的连接。
    Release { connection: ClientConnection },

    /// 调度一次补充扫描。
    Activate,

    /// 关闭池。所有归属于池的连接关闭后,`done` 收到通知。
    Close { done: oneshot::Sender<()> },

    /// 某个等待者的截止时间已到。
    LeaseTimedOut { waiter: u64 },

    /// 一次连接创建尝试成功。
    Established { connection: ClientConnection },

    /// 一次连接创建尝试失败。`backoff` 是本次尝试对应的退避值,
    /// 用于推导下一次尝试的延迟。
    AttemptFailed { backoff: Duration },

    /// 关闭观察者报告:一条归属于池的连接已经关闭。
    ConnectionClosed { id: u64 },

    /// 关闭流程中的一条连接完成了关闭。
    ClosedForShutdown,
}

/// 一次尚未满足的租借请求。
struct Waiter {
    /// 用于按身份撤销的稳定标识。
    id: u64,

    /// 连接或错误的一次性接收通道。
    sink: oneshot::Sender<crate::Result<ClientConnection>>,

    /// 截止时间定时任务。等待者被满足或池关闭时取消。
    timeout: JoinHandle<()>,
}

/// 池的生命周期状态。
enum State {
    /// 正常出借与补充连接。
    Active,

    /// 正在关闭。`remaining` 是仍需等待其关闭的连接数,计数归零时
    /// 进入 `Closed` 并逐一回应 `done` 中的完成通道。
    Closing {
        remaining: usize,
        done: Vec<oneshot::Sender<()>>,
    },

    /// 已关闭。
    Closed,
}

/// 连接池句柄。
///
/// 句柄可以克隆并在任务之间传递,所有操作都会被投递到池的专用
/// 任务上串行执行。
#[derive(Debug, Clone)]
pub struct Pool {
    messages: mpsc::UnboundedSender<PoolMessage>,
}

impl Pool {
    /// 用给定的配置与连接工厂创建一个池。
    ///
    /// 工厂在每次创建尝试时被调用一次,返回一条已就绪的连接或一个
    /// 错误。创建出的池是惰性的:在调用 [`activate`] 或第一次租借
    /// 之前不会有任何连接尝试。
    ///
    /// # 恐慌
    ///
    /// `min_connections` 大于 `max_connections` 属于非法配置,会在
    /// 构造时恐慌。
    ///
    /// # 示例
    ///
    /// ```no_run
    /// use redis_pool::{ClientConnection, Pool, PoolConfig};
    /// use tokio::time::{Duration, Instant};
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let config = PoolConfig {
    ///         max_connections: 4,
    ///         min_connections: 1,
    ///         ..Default::default()
    ///     };
    ///
    ///     let pool = Pool::new(config, || ClientConnection::connect("localhost:6379"));
    ///     pool.activate();
    ///
    ///     let deadline = Instant::now() + Duration::from_secs(5);
    ///     let connection = pool.lease_connection(deadline).await.unwrap();
    ///     let _ = connection;
    /// }
    /// ```
    ///
    /// [`activate`]: Pool::activate
    pub fn new<F, Fut>(config: PoolConfig, factory: F) -> Pool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<ClientConnection>> + Send + 'static,
    {
        assert!(
            config.min_connections <= config.max_connections,
            "pool misconfiguration; min_connections ({}) exceeds max_connections ({})",
            config.min_connections,
            config.max_connections,
        );

        let (messages, rx) = mpsc::unbounded_channel();

        let actor = PoolActor {
            config,
            factory: Arc::new(factory),
            messages: messages.downgrade(),
            available: VecDeque::new(),
            waiters: VecDeque::new(),
            pending_count: 0,
            leased_count: 0,
            next_waiter_id: 0,
            state: State::Active,
        };

        tokio::spawn(actor.run(rx));

        Pool { messages }
    }

    /// 调度一次补充扫描,把连接数补足到配置的最小值。
    ///
    /// 池处于活动状态时该操作幂等;关闭中或已关闭的池上是无操作。
    pub fn activate(&self) {
        let _ = self.messages.send(PoolMessage::Activate);
    }

    /// 租借一条存活的连接,必要时等待。
    ///
    /// 可用连接按最近使用优先的顺序出借。没有可用连接时,请求排队
    /// 等待,直到有连接被归还或新建,或者 `deadline` 到期。
    ///
    /// # 错误
    ///
    /// 池已关闭时返回 [`Error::PoolClosed`];截止时间到期时返回
    /// [`Error::TimedOutWaitingForConnection`]。
    pub async fn lease_connection(&self, deadline: Instant) -> crate::Result<ClientConnection> {
        let (sink, lease) = oneshot::channel();

        self.messages
            .send(PoolMessage::Lease { deadline, sink })
            .map_err(|_| Error::PoolClosed)?;

        lease.await.map_err(|_| Error::PoolClosed)?
    }

    /// 归还一条此前租借的连接。
    ///
    /// 归还的连接按优先级处理:满足排队的等待者,放回池中,或者在
    /// 池已满时被关闭。已经失效的连接被丢弃,并触发一次补充扫描。
    pub fn return_connection(&self, connection: ClientConnection) {
        // 池已经关闭时,丢弃句柄即可让连接的管道任务自行退出。
        let _ = self.messages.send(PoolMessage::Release { connection });
    }

    /// 关闭池,等待所有归属于池的连接关闭。
    ///
    /// 排队的等待者立即以 [`Error::PoolClosed`] 失败。已租借的连接
    /// 在归还时被关闭;关闭流程直到它们全部归还并关闭后才完成。
    /// 重复调用是幂等的,后续调用与首次调用一同完成。
    pub async fn close(&self) {
        let (done, closed) = oneshot::channel();

        if self.messages.send(PoolMessage::Close { done }).is_err() {
            // 池任务已经退出,关闭早已完成。
            return;
        }

        let _ = closed.await;
    }
}

/// 池的专用任务。拥有全部可变状态。
struct PoolActor<F> {
    config: PoolConfig,

    /// 连接工厂。每次尝试在独立任务中运行,共享同一个工厂。
    factory: Arc<F>,

    /// 供内部任务回投消息的弱发送端。
    ///
    /// 弱引用保证通道的存活只取决于外部句柄:最后一个 `Pool` 句柄
    /// 被丢弃后,池任务从消息循环退出并释放所有空闲连接,而不是被
    /// 自己派生的任务无限期维持。
    messages: mpsc::WeakUnboundedSender<PoolMessage>,

    /// 空闲连接。队尾是最近归还(最近验证过存活)的连接。
    available: VecDeque<ClientConnection>,

    /// 排队的租借请求,先到先得。
    waiters: VecDeque<Waiter>,

    /// 正在创建途中的连接数。
    pending_count: usize,

    /// 出借在外的连接数。
    leased_count: usize,

    /// 等待者标识分配器。
    next_waiter_id: u64,

    state: State,
}

impl<F, Fut> PoolActor<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<ClientConnection>> + Send + 'static,
{
    /// 处理消息直到池关闭或所有句柄被丢弃。
    async fn run(mut self, mut messages: mpsc::UnboundedReceiver<PoolMessage>) {
        while let Some(message) = messages.recv().await {
            self.handle_message(message);

            if matches!(self.state, State::Closed) {
                return;
            }
        }

        // 所有池句柄都已丢弃。空闲连接随本任务一起被丢弃,它们的
        // 管道任务会各自关闭传输。
    }

    /// 归属于池的连接总数:空闲的、创建途中的以及出借在外的。
    fn active_connection_count(&self) -> usize {
        self.available.len() + self.pending_count + self.leased_count
    }

    fn handle_message(&mut self, message: PoolMessage) {
        match message {
            PoolMessage::Lease { deadline, sink } => self.lease(deadline, sink),
            PoolMessage::Release { connection } => self.release(connection),
            PoolMessage::Activate => self.refill(),
            PoolMessage::Close { done } => self.close(done),
            PoolMessage::LeaseTimedOut { waiter } => self.lease_timed_out(waiter),
            PoolMessage::Established { connection } => self.established(connection),
            PoolMessage::AttemptFailed { backoff } => self.attempt_failed(backoff),
            PoolMessage::ConnectionClosed { id } => self.connection_closed(id),
            PoolMessage::ClosedForShutdown => self.count_shutdown_closure(),
        }
    }

    /// 补充连接直到达到配置的最小值。只在活动状态下生效。
    fn refill(&mut self) {
        if !matches!(self.state, State::Active) {
            return;
        }

        while self.active_connection_count() < self.config.min_connections {
            self.create_connection(self.config.initial_backoff, Duration::ZERO);
        }
    }

    fn lease(&mut self, deadline: Instant, sink: oneshot::Sender<crate::Result<ClientConnection>>) {
        if !matches!(self.state, State::Active) {
            let _ = sink.send(Err(Error::PoolClosed));
            return;
        }

        // 从队尾向前找第一条仍然存活的连接:队尾的连接最近刚被验证
        // 过。途中遇到的失效连接直接丢弃,它们的关闭观察者会触发
        // 补充。
        while let Some(connection) = self.available.pop_back() {
            if !connection.is_connected() {
                debug!(id = connection.id(), "discarding dead pooled connection");
                continue;
            }

            match sink.send(Ok(connection)) {
                Ok(()) => {
                    self.leased_count += 1;
                }
                Err(rejected) => {
                    // 调用者已经放弃等待。把连接放回队尾,留给下一次
                    // 租借。
                    let connection = rejected.expect("value was sent as Ok");
                    self.available.push_back(connection);
                }
            }
            return;
        }

        // 没有能立即出借的连接,排队等待。
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;

        let messages = self.messages.clone();
        let timeout = tokio::spawn(async move {
            time::sleep_until(deadline).await;
            if let Some(messages) = messages.upgrade() {
                let _ = messages.send(PoolMessage::LeaseTimedOut { waiter: id });
            }
        });

        self.waiters.push_back(Waiter { id, sink, timeout });

        // 池还有增长空间,或者处于泄漏模式时,发起一次新的创建尝试。
        if self.active_connection_count() < self.config.max_connections || self.config.leaky {
            self.create_connection(self.config.initial_backoff, Duration::ZERO);
        }
    }

    fn release(&mut self, connection: ClientConnection) {
        debug_assert!(self.leased_count > 0, "release without a lease");
        self.leased_count = self.leased_count.saturating_sub(1);

        match self.state {
            State::Active => self.hand_back(connection),
            State::Closing { .. } => self.close_for_shutdown(connection),
            // 池任务在进入 `Closed` 后立即退出,不会再处理消息。
            State::Closed => unreachable!(),
        }
    }

    /// 为一条存活的连接找归宿。归还与新建的连接共用该逻辑。
    fn hand_back(&mut self, mut connection: ClientConnection) {
        if !connection.is_connected() {
            debug!(id = connection.id(), "discarding dead connection");
            self.refill();
            return;
        }

        // 优先满足排队的等待者。等待者的调用方可能已经放弃,此时把
        // 连接留给队列中的下一位。
        while let Some(waiter) = self.waiters.pop_front() {
            waiter.timeout.abort();

            match waiter.sink.send(Ok(connection)) {
                Ok(()) => {
                    debug!(waiter = waiter.id, "leased connection to waiter");
                    self.leased_count += 1;
                    return;
                }
                Err(rejected) => {
                    connection = rejected.expect("value was sent as Ok");
                }
            }
        }

        // 池有空位,放回队尾。
        if self.can_add_connection_to_pool() {
            self.available.push_back(connection);
            return;
        }

        // 池已满。逐出队首最旧的连接,保留刚刚验证过存活的这一条。
        if let Some(evicted) = self.available.pop_front() {
            debug!(id = evicted.id(), "evicting oldest pooled connection");
            close_connection(evicted);
            self.available.push_back(connection);
            return;
        }

        // 没有空位也没有可逐出的连接,直接关闭。
        close_connection(connection);
    }

    /// 归还的连接能否进入空闲队列。
    ///
    /// 泄漏模式只统计池内空闲的连接;非泄漏模式把出借在外的连接也
    /// 计算在内,保证存活总数不超过最大值。
    fn can_add_connection_to_pool(&self) -> bool {
        if self.config.leaky {
            self.available.len() < self.config.max_connections
        } else {
            self.available.len() + self.leased_count < self.config.max_connections
        }
    }

    fn close(&mut self, done: oneshot::Sender<()>) {
        match &mut self.state {
            State::Active => {
                let remaining = self.active_connection_count();

                // 排队的等待者全部以池关闭失败,并撤销各自的定时器。
                for waiter in self.waiters.drain(..) {
                    waiter.timeout.abort();
                    let _ = waiter.sink.send(Err(Error::PoolClosed));
                }

                if remaining == 0 {
                    debug!("pool closed with no connections outstanding");
                    let _ = done.send(());
                    self.state = State::Closed;
                    return;
                }

                debug!(remaining, "pool closing");
                self.state = State::Closing {
                    remaining,
                    done: vec![done],
                };

                // 关闭所有空闲连接。出借在外的连接在归还时关闭,创建
                // 途中的连接在就绪或失败时计入。
                for connection in std::mem::take(&mut self.available) {
                    self.close_for_shutdown(connection);
                }
            }
            // 关闭流程已经在进行,新的完成通道与已有的一同回应。
            State::Closing { done: pending, .. } => {
                pending.push(done);
            }
            State::Closed => {
                let _ = done.send(());
            }
        }
    }

    fn lease_timed_out(&mut self, id: u64) {
        // 按身份匹配。等待者已被满足或池已关闭时,定时器消息过期
        // 作废。
        if let Some(index) = self.waiters.iter().position(|waiter| waiter.id == id) {
            let waiter = self.waiters.remove(index).expect("index was just found");
            let _ = waiter
                .sink
                .send(Err(Error::TimedOutWaitingForConnection));
        }
    }

    fn established(&mut self, connection: ClientConnection) {
        debug_assert!(self.pending_count > 0, "established without a pending attempt");
        self.pending_count = self.pending_count.saturating_sub(1);

        match self.state {
            State::Active => {
                debug!(id = connection.id(), "connection established");

                // 先注册关闭观察者,再让连接进入流转。晚注册会丢失
                // 创建与首次使用之间的关闭事件。
                self.attach_close_observer(&connection);
                self.hand_back(connection);
            }
            State::Closing { .. } => self.close_for_shutdown(connection),
            State::Closed => unreachable!(),
        }
    }

    fn attempt_failed(&mut self, backoff: Duration) {
        debug_assert!(self.pending_count > 0, "failure without a pending attempt");
        self.pending_count = self.pending_count.saturating_sub(1);

        match &mut self.state {
            State::Active => {}
            // 关闭流程把创建失败视同一条连接完成了关闭。
            State::Closing { .. } => {
                self.count_shutdown_closure();
                return;
            }
            State::Closed => unreachable!(),
        }

        // 仍有需求时才重试:有等待者未被已在途的尝试覆盖,或者连接
        // 数低于最小值。非泄漏模式下重试还要受最大值约束。
        let retry = if self.config.leaky {
            self.waiters.len() > self.pending_count
                || self.active_connection_count() < self.config.min_connections
        } else {
            (!self.waiters.is_empty()
                && self.active_connection_count() < self.config.max_connections)
                || self.active_connection_count() < self.config.min_connections
        };

        if retry {
            let next = next_backoff(backoff, self.config.backoff_factor);
            debug!(delay = ?backoff, "scheduling connection retry");
            self.create_connection(next, backoff);
        }
    }

    fn connection_closed(&mut self, id: u64) {
        match self.state {
            State::Active => {
                // 空闲队列中的失效连接直接移除。出借在外的连接在归还
                // 时处理。
                let before = self.available.len();
                self.available.retain(|connection| connection.id() != id);
                if self.available.len() != before {
                    debug!(id, "removed closed connection from pool");
                }

                self.refill();
            }
            // 关闭流程的计数由 `ClosedForShutdown` 消息承担,空闲队列
            // 此时已经清空。
            State::Closing { .. } => {}
            State::Closed => unreachable!(),
        }
    }

    fn count_shutdown_closure(&mut self) {
        if let State::Closing { remaining, done } = &mut self.state {
            debug_assert!(*remaining > 0, "shutdown closure without a connection to count");
            *remaining = remaining.saturating_sub(1);

            if *remaining == 0 {
                debug!("pool closed");
                for tx in done.drain(..) {
                    let _ = tx.send(());
                }
                self.state = State::Closed;
            }
        }
    }

    /// 发起一次连接创建尝试。
    ///
    /// 尝试在独立任务中运行:等待 `start_in` 后调用工厂,把结果投递
    /// 回池任务。`backoff` 是本次尝试失败后用于推导下一次延迟的
    /// 退避值。
    fn create_connection(&mut self, backoff: Duration, start_in: Duration) {
        self.pending_count += 1;

        let factory = Arc::clone(&self.factory);
        let messages = self.messages.clone();

        tokio::spawn(async move {
            if !start_in.is_zero() {
                time::sleep(start_in).await;
            }

            let message = match factory().await {
                Ok(connection) => PoolMessage::Established { connection },
                Err(error) => {
                    debug!(%error, "connection attempt failed");
                    PoolMessage::AttemptFailed { backoff }
                }
            };

            if let Some(messages) = messages.upgrade() {
                let _ = messages.send(message);
            }
        });
    }

    /// 注册连接的关闭观察者,把关闭事件转成池消息。
    fn attach_close_observer(&self, connection: &ClientConnection) {
        let id = connection.id();
        let mut closed = connection.closed_signal();
        let messages = self.messages.clone();

        tokio::spawn(async move {
            // 发送端被丢弃同样意味着连接已经关闭。
            let _ = closed.wait_for(|connected| !connected).await;
            if let Some(messages) = messages.upgrade() {
                let _ = messages.send(PoolMessage::ConnectionClosed { id });
            }
        });
    }

    /// 关闭流程中关闭一条连接,完成后计入 `remaining`。
    fn close_for_shutdown(&self, connection: ClientConnection) {
        let messages = self.messages.clone();

        tokio::spawn(async move {
            connection.graceful_close().await;
            if let Some(messages) = messages.upgrade() {
                let _ = messages.send(PoolMessage::ClosedForShutdown);
            }
        });
    }
}

/// 关闭一条不再需要的连接。没有在途请求的连接会立即关闭传输。
fn close_connection(connection: ClientConnection) {
    tokio::spawn(async move {
        connection.graceful_close().await;
    });
}

/// 推导下一次重试的退避值,饱和而不是溢出。
fn next_backoff(backoff: Duration, factor: f64) -> Duration {
    let secs = backoff.as_secs_f64() * factor;

    if secs.is_finite() {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
        Duration::MAX
    }
}
