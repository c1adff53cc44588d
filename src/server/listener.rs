use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;

const LISTEN_BACKLOG: i32 = 4096;

/// 绑定一个允许端口复用的监听 socket
///
/// 必须在 tokio 运行时内调用。
pub fn bind_reuse_port(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// 在同一端口上绑定 `count` 个监听实例，由内核分发连接
///
/// 端口为 0 时，后续实例复用第一个实例实际分配到的端口。
/// 非 unix 平台只绑定一个实例。
pub fn bind_group(addr: SocketAddr, count: usize) -> io::Result<Vec<TcpListener>> {
    let count = if cfg!(unix) { count.max(1) } else { 1 };

    let first = bind_reuse_port(addr)?;
    let bound = first.local_addr()?;

    let mut listeners = Vec::with_capacity(count);
    listeners.push(first);
    for _ in 1..count {
        listeners.push(bind_reuse_port(bound)?);
    }
    Ok(listeners)
}
