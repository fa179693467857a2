use crate::error::TransportError;
use mio::event::Source;
use std::fs::File;
use std::net::SocketAddr;

/// 一次非阻塞读取的结果。
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// 读到了 `n` 个字节（`n > 0`）。
    Data(usize),
    /// 对端有序关闭。
    Eof,
    /// 现在读会阻塞，等待下一次就绪通知。
    WouldBlock,
    /// 读取失败，携带 `errno`；流应当被关闭。
    Failed(i32),
}

/// 一次非阻塞发送的结果。
#[derive(Debug)]
pub(crate) enum SendOutcome {
    /// 传输层接受了 `n` 个字节（`n > 0`）。
    Sent(usize),
    WouldBlock,
    Failed(i32),
}

/// 接受循环单步的结果。
pub(crate) enum AcceptOutcome {
    Accepted {
        transport: Box<dyn Transport>,
        peer: SocketAddr,
    },
    WouldBlock,
    Failed(i32),
}

/// 传输变体的能力集：{listen, connect, accept, read, send, send_file, close}。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 明文与加密变体共享同一个状态机（`SocketStream`），差异收敛到本
///   trait 的具体实现中：原生 `recv`/`send`/`accept` 对 TLS 的记录层
///   读写；这替代了“基类 + 子类”的继承式设计。
///
/// ## 契约（What）
/// - 所有方法都是非阻塞的；“现在会阻塞”一律以 `WouldBlock` 表达而非
///   错误；
/// - `pump` 推进与负载无关的协议机械（TLS 握手、记录层回写），明文
///   变体为空操作；
/// - `sendfile_raw` 只有支持零拷贝的变体返回 `Some`；加密变体返回
///   `None`，由写操作自行经加密通道拷贝；
/// - `teardown` 幂等，释放描述符与会话资源，错误仅记录。
pub(crate) trait Transport {
    fn listen(&mut self, host: &str, port: u16) -> Result<(), TransportError>;

    fn connect(&mut self, addr: SocketAddr) -> Result<(), TransportError>;

    /// 可写就绪时推进出站连接；`Ok(Some(peer))` 表示完成，`Ok(None)`
    /// 表示仍在进行，`Err(errno)` 表示失败。
    fn finish_connect(&mut self) -> Result<Option<SocketAddr>, i32>;

    fn accept(&mut self) -> AcceptOutcome;

    /// 推进协议机械；返回 `Err(errno)` 时流应当被关闭。
    fn pump(&mut self) -> Result<(), i32> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome;

    fn send(&mut self, buf: &[u8]) -> SendOutcome;

    /// 零拷贝文件发送；不支持的变体返回 `None`。
    fn sendfile_raw(&mut self, file: &mut File, remaining: u64) -> Option<SendOutcome>;

    /// 除写队列外，传输自身是否还有待冲刷的出站数据（TLS 记录缓冲）。
    fn wants_write(&self) -> bool {
        false
    }

    /// 冲刷传输自身缓冲的出站数据。
    fn flush(&mut self) -> Result<(), i32> {
        Ok(())
    }

    /// 当前注册用的事件源；尚未持有套接字时为 `None`。
    fn source(&mut self) -> Option<&mut dyn Source>;

    /// 本地绑定地址；监听流用它暴露实际分配的端口。
    fn local_addr(&self) -> Option<SocketAddr>;

    /// 手动重协商/密钥更新；默认不支持。
    fn redo_handshake(&mut self) -> Result<(), TransportError> {
        Err(TransportError::UnsupportedOperation(
            "re-handshake is only available on secure streams",
        ))
    }

    fn teardown(&mut self);
}
