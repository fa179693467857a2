use crate::error::{TransportError, errno};
use crate::transport::{AcceptOutcome, ReadOutcome, SendOutcome, Transport};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};

/// 监听队列深度，与原生 `listen(2)` 的 backlog 对应。
const LISTEN_BACKLOG: i32 = 128;

/// 明文 TCP 传输：原生 `recv`/`send`/`accept`，Linux 上文件发送走
/// `sendfile(2)` 零拷贝。
pub(crate) struct PlainTransport {
    kind: Kind,
}

enum Kind {
    Empty,
    Listener(TcpListener),
    Stream(TcpStream),
}

impl PlainTransport {
    pub(crate) fn new() -> Self {
        PlainTransport { kind: Kind::Empty }
    }

    pub(crate) fn from_accepted(stream: TcpStream) -> Self {
        PlainTransport {
            kind: Kind::Stream(stream),
        }
    }

    fn stream(&mut self) -> Option<&mut TcpStream> {
        match &mut self.kind {
            Kind::Stream(stream) => Some(stream),
            _ => None,
        }
    }
}

/// 绑定并开始监听；EADDRINUSE 单独归类，其余系统错误携带 `errno`。
pub(crate) fn bind_listener(host: &str, port: u16) -> Result<TcpListener, TransportError> {
    let addr = resolve(host, port).map_err(|err| map_bind_error(&err))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|err| map_bind_error(&err))?;
    socket
        .set_reuse_address(true)
        .map_err(|err| map_bind_error(&err))?;
    socket
        .bind(&addr.into())
        .map_err(|err| map_bind_error(&err))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|err| map_bind_error(&err))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| map_bind_error(&err))?;
    Ok(TcpListener::from_std(socket.into()))
}

fn map_bind_error(err: &io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::AddrInUse {
        TransportError::AddressInUse
    } else {
        TransportError::BindFailed(errno(err))
    }
}

/// 解析 host:port；取第一个解析结果。
pub(crate) fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "主机名没有解析结果"))
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

impl Transport for PlainTransport {
    fn listen(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        if !matches!(self.kind, Kind::Empty) {
            return Err(TransportError::InvalidState("socket already in use"));
        }
        self.kind = Kind::Listener(bind_listener(host, port)?);
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        if !matches!(self.kind, Kind::Empty) {
            return Err(TransportError::InvalidState("socket already in use"));
        }
        let stream =
            TcpStream::connect(addr).map_err(|err| TransportError::ConnectFailed(errno(&err)))?;
        self.kind = Kind::Stream(stream);
        Ok(())
    }

    fn finish_connect(&mut self) -> Result<Option<SocketAddr>, i32> {
        let Some(stream) = self.stream() else {
            return Err(-1);
        };
        match stream.take_error() {
            Ok(Some(err)) => return Err(errno(&err)),
            Ok(None) => {}
            Err(err) => return Err(errno(&err)),
        }
        match stream.peer_addr() {
            Ok(peer) => Ok(Some(peer)),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(None),
            Err(err) => Err(errno(&err)),
        }
    }

    fn accept(&mut self) -> AcceptOutcome {
        let Kind::Listener(listener) = &mut self.kind else {
            return AcceptOutcome::Failed(-1);
        };
        match listener.accept() {
            Ok((stream, peer)) => AcceptOutcome::Accepted {
                transport: Box::new(PlainTransport::from_accepted(stream)),
                peer,
            },
            Err(err) if would_block(&err) => AcceptOutcome::WouldBlock,
            Err(err) => AcceptOutcome::Failed(errno(&err)),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let Some(stream) = self.stream() else {
            return ReadOutcome::WouldBlock;
        };
        match stream.read(buf) {
            Ok(0) => ReadOutcome::Eof,
            Ok(n) => ReadOutcome::Data(n),
            Err(err) if would_block(&err) => ReadOutcome::WouldBlock,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => ReadOutcome::WouldBlock,
            Err(err) => ReadOutcome::Failed(errno(&err)),
        }
    }

    fn send(&mut self, buf: &[u8]) -> SendOutcome {
        let Some(stream) = self.stream() else {
            return SendOutcome::Failed(-1);
        };
        match stream.write(buf) {
            Ok(0) => SendOutcome::WouldBlock,
            Ok(n) => SendOutcome::Sent(n),
            Err(err) if would_block(&err) => SendOutcome::WouldBlock,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => SendOutcome::WouldBlock,
            Err(err) => SendOutcome::Failed(errno(&err)),
        }
    }

    #[cfg(target_os = "linux")]
    fn sendfile_raw(&mut self, file: &mut File, remaining: u64) -> Option<SendOutcome> {
        use std::os::fd::AsRawFd;

        let stream = self.stream()?;
        let count = remaining.min(512 * 1024) as usize;
        loop {
            let sent = unsafe {
                libc::sendfile(
                    stream.as_raw_fd(),
                    file.as_raw_fd(),
                    std::ptr::null_mut(),
                    count,
                )
            };
            if sent >= 0 {
                return Some(SendOutcome::Sent(sent as usize));
            }
            let code = io::Error::last_os_error();
            match code.raw_os_error() {
                Some(libc::EAGAIN) => return Some(SendOutcome::WouldBlock),
                Some(libc::EINTR) => continue,
                _ => return Some(SendOutcome::Failed(errno(&code))),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sendfile_raw(&mut self, _file: &mut File, _remaining: u64) -> Option<SendOutcome> {
        None
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        match &mut self.kind {
            Kind::Empty => None,
            Kind::Listener(listener) => Some(listener),
            Kind::Stream(stream) => Some(stream),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match &self.kind {
            Kind::Empty => None,
            Kind::Listener(listener) => listener.local_addr().ok(),
            Kind::Stream(stream) => stream.local_addr().ok(),
        }
    }

    fn teardown(&mut self) {
        // 描述符随句柄析构释放；无会话级资源。
        self.kind = Kind::Empty;
    }
}
