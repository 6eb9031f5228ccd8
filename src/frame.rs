//! 提供表示 RESP 协议帧的类型以及从字节流中增量解析帧的工具。
//!
//! 帧以类型标记字节开头:`+` 简单字符串、`-` 错误、`:` 整数、
//! `$` 批量字符串、`*` 数组,并以 `\r\n` 作为行终止符。数组可以
//! 任意嵌套。解析分两步进行:`check` 只验证缓冲区中是否存在一个
//! 完整的帧并推进光标,`parse` 在验证通过后分配并返回帧值。
//! 这样在数据尚未到齐时可以避免任何分配。

use bytes::{Buf, Bytes};
use std::convert::TryInto;
use std::fmt;
use std::io::Cursor;
use std::num::TryFromIntError;
use std::string::FromUtf8Error;

/// RESP 协议中的一个帧。
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// `+` 开头的简单字符串,内容中不含 CR 或 LF。
    Simple(String),
    /// `-` 开头的错误行。
    Error(String),
    /// `:` 开头的十进制有符号 64 位整数。
    Integer(i64),
    /// `$` 开头的批量字符串,按原始字节处理。
    Bulk(Bytes),
    /// 长度为 `-1` 的批量字符串或数组,表示空值。
    Null,
    /// `*` 开头的数组,元素可以是任意帧类型。
    Array(Vec<Frame>),
}

/// 解析帧时可能遇到的错误。
///
/// 只有 `Incomplete` 会在运行时被正常处理:它表示缓冲区中的数据
/// 还不足以构成一个完整的帧,调用方应当保留已有字节并等待更多
/// 数据。`Malformed` 表示字节流违反了帧格式,使用该解码器的连接
/// 必须被关闭。
#[derive(Debug)]
pub enum Error {
    /// 数据不足以解析出一个完整的帧。
    Incomplete,

    /// 字节流不符合 RESP 帧格式。
    Malformed(String),
}

impl Frame {
    /// 返回一个空数组帧。配合 `push_bulk` 与 `push_int` 用于构造
    /// 出站命令。
    pub fn array() -> Frame {
        Frame::Array(vec![])
    }

    /// 将一个批量字符串帧追加到数组帧中。
    ///
    /// # 恐慌
    ///
    /// 如果 `self` 不是数组帧,则会恐慌。
    pub fn push_bulk(&mut self, bytes: Bytes) {
        match self {
            Frame::Array(vec) => {
                vec.push(Frame::Bulk(bytes));
            }
            _ => panic!("not an array frame"),
        }
    }

    /// 将一个整数帧追加到数组帧中。
    ///
    /// # 恐慌
    ///
    /// 如果 `self` 不是数组帧,则会恐慌。
    pub fn push_int(&mut self, value: i64) {
        match self {
            Frame::Array(vec) => {
                vec.push(Frame::Integer(value));
            }
            _ => panic!("not an array frame"),
        }
    }

    /// 检查从光标当前位置开始能否解码出一个完整的帧。
    ///
    /// 成功时光标恰好前进到该帧末尾的下一个字节;数据不足时返回
    /// `Incomplete`,此时光标位置未定义,调用方应当在重试之前将其
    /// 复位。嵌套数组不会跨调用保留部分进度:要么整个数组完整,
    /// 要么整体等待更多数据。
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
        match get_u8(src)? {
            b'+' | b'-' => {
                get_line(src)?;
                Ok(())
            }
            b':' => {
                let _ = get_decimal(src)?;
                Ok(())
            }
            b'$' => {
                let len = get_decimal(src)?;
                if len == -1 {
                    // 表示空值的批量字符串,长度行即整个帧。
                    return Ok(());
                }
                let len = into_len(len)?;
                skip_bulk_body(src, len)
            }
            b'*' => {
                let len = get_decimal(src)?;
                if len == -1 {
                    return Ok(());
                }
                let len = into_len(len)?;
                for _ in 0..len {
                    Frame::check(src)?;
                }
                Ok(())
            }
            actual => Err(format!("invalid frame type byte `{}`", actual).into()),
        }
    }

    /// 解析出一个已经通过 `check` 验证的帧。
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        match get_u8(src)? {
            b'+' => {
                let line = get_line(src)?.to_vec();
                let string = String::from_utf8(line)?;
                Ok(Frame::Simple(string))
            }
            b'-' => {
                let line = get_line(src)?.to_vec();
                let string = String::from_utf8(line)?;
                Ok(Frame::Error(string))
            }
            b':' => {
                let value = get_decimal(src)?;
                Ok(Frame::Integer(value))
            }
            b'$' => {
                let len = get_decimal(src)?;
                if len == -1 {
                    return Ok(Frame::Null);
                }
                let len = into_len(len)?;
                if src.remaining() < len + 2 {
                    return Err(Error::Incomplete);
                }
                if &src.chunk()[len..len + 2] != b"\r\n" {
                    return Err("bulk string is not terminated by CRLF".into());
                }
                let data = Bytes::copy_from_slice(&src.chunk()[..len]);

                // 跳过数据与结尾的 CRLF。
                skip(src, len + 2)?;

                Ok(Frame::Bulk(data))
            }
            b'*' => {
                let len = get_decimal(src)?;
                if len == -1 {
                    return Ok(Frame::Null);
                }
                let len = into_len(len)?;
                let mut out = Vec::with_capacity(len);

                for _ in 0..len {
                    out.push(Frame::parse(src)?);
                }

                Ok(Frame::Array(out))
            }
            actual => Err(format!("invalid frame type byte `{}`", actual).into()),
        }
    }
}

/// 读取一个字节并推进光标。
fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

/// 跳过 `n` 个字节。
fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), Error> {
    if src.remaining() < n {
        return Err(Error::Incomplete);
    }
    src.advance(n);
    Ok(())
}

/// 跳过批量字符串的数据部分,并验证其后紧跟 CRLF。
fn skip_bulk_body(src: &mut Cursor<&[u8]>, len: usize) -> Result<(), Error> {
    if src.remaining() < len + 2 {
        return Err(Error::Incomplete);
    }
    if &src.chunk()[len..len + 2] != b"\r\n" {
        return Err("bulk string is not terminated by CRLF".into());
    }
    skip(src, len + 2)
}

/// 读取一行并解析为十进制有符号整数。
fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    use atoi::atoi;

    let line = get_line(src)?;

    atoi::<i64>(line).ok_or_else(|| "invalid frame format".into())
}

/// 将长度字段转换为 `usize`。`-1` 之外的负数是非法的。
fn into_len(len: i64) -> Result<usize, Error> {
    len.try_into()
        .map_err(|_| format!("invalid length `{}`", len).into())
}

/// 查找一行,行以 `\r\n` 结尾。返回的切片不含终止符。
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    // 直接在底层切片上扫描。
    let start = src.position() as usize;
    // 最后一个可能的 `\r` 位置是倒数第二个字节。
    let end = src.get_ref().len().saturating_sub(1);

    for i in start..end {
        if src.get_ref()[i] == b'\r' && src.get_ref()[i + 1] == b'\n' {
            // 找到了一行,将光标移动到 `\n` 之后。
            src.set_position((i + 2) as u64);

            return Ok(&src.get_ref()[start..i]);
        }
    }

    Err(Error::Incomplete)
}

impl From<String> for Error {
    fn from(src: String) -> Error {
        Error::Malformed(src)
    }
}

impl From<&str> for Error {
    fn from(src: &str) -> Error {
        src.to_string().into()
    }
}

impl From<FromUtf8Error> for Error {
    fn from(_src: FromUtf8Error) -> Error {
        "invalid frame format".into()
    }
}

impl From<TryFromIntError> for Error {
    fn from(_src: TryFromIntError) -> Error {
        "invalid frame format".into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Incomplete => "stream ended early".fmt(fmt),
            Error::Malformed(message) => write!(fmt, "protocol error; {}", message),
        }
    }
}

impl std::error::Error for Error {}
