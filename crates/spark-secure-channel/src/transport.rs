//! 安全通道下方的原始字节传输。
//!
//! 通道只要求“非阻塞读写 + 连接进度查询 + 半关闭”，默认实现为 `mio::net::TcpStream`；
//! 测试可以提供内存管道实现同一接口。

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
};

use mio::net::TcpStream;

/// 非阻塞字节传输。
///
/// `read`/`write` 在暂时无法推进时返回 [`io::ErrorKind::WouldBlock`]，`read` 返回 `Ok(0)` 表示对端已关闭。
pub trait Transport: Read + Write + Send + 'static {
    /// 推进非阻塞连接：`Ok(true)` 已建立，`Ok(false)` 仍在进行。
    fn poll_connect(&mut self) -> io::Result<bool>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    /// 发起到 `addr` 的非阻塞连接。
    fn connect(addr: SocketAddr) -> io::Result<Self>
    where
        Self: Sized,
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("transport cannot initiate connections (target {addr})"),
        ))
    }
}

impl Transport for TcpStream {
    fn poll_connect(&mut self) -> io::Result<bool> {
        if let Some(error) = self.take_error()? {
            return Err(error);
        }
        match TcpStream::peer_addr(self) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }

    fn connect(addr: SocketAddr) -> io::Result<Self> {
        TcpStream::connect(addr)
    }
}

/// 遇到 `Interrupted` 时重试 I/O 调用。
pub(crate) fn retry_interrupted<R>(mut op: impl FnMut() -> io::Result<R>) -> io::Result<R> {
    loop {
        match op() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}
