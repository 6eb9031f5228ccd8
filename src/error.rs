use crate::frame;

use std::fmt;
use std::io;
use std::sync::Arc;

/// 本库所有操作共用的错误类型。
///
/// 五种语义化的错误足以覆盖核心:协议帧错误、服务器回复的错误、
/// 连接关闭、等待连接超时以及连接池关闭。其余情况(非法配置、
/// 终态的重复迁移等)属于编程错误,通过断言而不是 `Error` 暴露。
///
/// 传输层的一个错误需要广播给同一连接上所有在途请求,因此该类型
/// 实现 `Clone`;底层的 `io::Error` 通过 `Arc` 共享。
#[derive(Debug, Clone)]
pub enum Error {
    /// 连接已关闭,本端或远端均有可能。
    ConnectionClosed,

    /// 连接池已关闭,不再出借连接。
    PoolClosed,

    /// 在截止时间之前没有等到可用连接。
    TimedOutWaitingForConnection,

    /// 字节流不构成合法的 RESP 帧。携带具体原因。
    MalformedFrame(String),

    /// 服务器以错误帧回复了请求。携带错误帧的文本内容。
    ServerError(String),

    /// 底层传输报告的 I/O 错误。
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(src: io::Error) -> Error {
        Error::Io(Arc::new(src))
    }
}

impl From<frame::Error> for Error {
    fn from(src: frame::Error) -> Error {
        match src {
            // `Incomplete` 是解码循环内部消化的运行时条件,正常情况下
            // 不会越过连接层;越过即意味着帧被截断。
            frame::Error::Incomplete => Error::ConnectionClosed,
            frame::Error::Malformed(message) => Error::MalformedFrame(message),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ConnectionClosed => "connection closed".fmt(fmt),
            Error::PoolClosed => "connection pool closed".fmt(fmt),
            Error::TimedOutWaitingForConnection => {
                "timed out waiting for a connection".fmt(fmt)
            }
            Error::MalformedFrame(message) => write!(fmt, "protocol error; {}", message),
            Error::ServerError(message) => message.fmt(fmt),
            Error::Io(err) => err.fmt(fmt),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
