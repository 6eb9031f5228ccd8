//! 一个异步 RESP 客户端核心:帧编解码、命令管道与连接池。
//!
//! 本库实现了与 Redis 服务器通信所需的传输层核心,不包含具体的
//! 命令封装。主要组件包括:
//!
//! * `frame`:表示一个 RESP 协议帧,以及从字节流中增量解析帧的
//!   工具。帧作为命令与字节表示之间的中间表示。
//!
//! * `Connection`:在任意异步字节流上读写帧,封装字节级别的协议
//!   解析细节。
//!
//! * `ClientConnection`:一条连接的句柄。命令在同一条连接上流水线
//!   式发送,响应按发送顺序严格配对返回,支持优雅关闭。
//!
//! * `Pool`:动态管理的连接池。按需出借连接,以指数退避创建新
//!   连接,维持最小/最大连接数,并提供有序的关闭流程。

pub mod frame;
pub use frame::Frame;

mod connection;
pub use connection::Connection;

mod client;
pub use client::ClientConnection;

mod handler;

mod pool;
pub use pool::{Pool, PoolConfig};

mod error;
pub use error::Error;

/// Redis 服务器监听的默认端口。
///
/// 如果没有指定端口,则使用此端口。
pub const DEFAULT_PORT: u16 = 6379;

/// 本库操作的专用 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;
