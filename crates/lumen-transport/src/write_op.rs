use crate::transport::{SendOutcome, Transport};
use bytes::{Buf, Bytes, BytesMut};
use std::cell::Cell;
use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// 写操作完成回调：全部字节交付传输层之后恰好调用一次。
pub type WriteCallback = Box<dyn FnOnce()>;

/// 拷贝路径的单次读块大小。
const COPY_CHUNK: usize = 16 * 1024;

/// 单步推进的结果，仅供队列排水使用。
pub(crate) enum Advance {
    /// 本操作的全部字节已交付传输层。
    Complete,
    /// 传输层暂不接受更多数据，保留进度等待下次可写。
    Blocked,
    /// 传输层写失败，携带 `errno`；整个排水过程应当中止并关闭流。
    Failed(i32),
}

enum Payload {
    /// 分段字节负载；段与段之间零拷贝衔接，段内以游标保留部分写进度。
    Bytes { segments: VecDeque<Bytes> },
    File(FileSend),
    Noop,
}

/// 有序写队列中的一个单元：{字节负载 | 文件负载 | 空操作} + 可选完成回调。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 写路径的全部顺序性保证都落在这一类型上：操作严格按入队顺序完成，
///   回调在其全部字节交付传输层后恰好触发一次；后入队者绝不先完成。
///
/// ## 契约（What）
/// - 部分写必须续传而非重写：`advance` 跨多次可写事件保留游标；
/// - 空操作入队即视为“之前的数据都交付后”的同步点，轮到它时立即完成；
/// - 流在中途关闭时，未完成操作的回调永不触发（由 `SocketStream` 丢弃）。
pub struct WriteOperation {
    payload: Payload,
    callback: Option<WriteCallback>,
}

impl WriteOperation {
    /// 多段字节负载；空段被忽略。
    pub fn bytes(segments: Vec<Bytes>, callback: Option<WriteCallback>) -> Self {
        WriteOperation {
            payload: Payload::Bytes {
                segments: segments.into_iter().filter(|s| !s.is_empty()).collect(),
            },
            callback,
        }
    }

    /// 单段字节负载。
    pub fn single(data: Bytes, callback: Option<WriteCallback>) -> Self {
        Self::bytes(vec![data], callback)
    }

    pub fn file(send: FileSend, callback: Option<WriteCallback>) -> Self {
        WriteOperation {
            payload: Payload::File(send),
            callback,
        }
    }

    /// 空操作：排到队首时立即完成，用作“此前全部数据已交付”的通知点。
    pub fn noop(callback: Option<WriteCallback>) -> Self {
        WriteOperation {
            payload: Payload::Noop,
            callback,
        }
    }

    pub(crate) fn take_callback(&mut self) -> Option<WriteCallback> {
        self.callback.take()
    }

    pub(crate) fn advance(&mut self, transport: &mut dyn Transport) -> Advance {
        match &mut self.payload {
            Payload::Noop => Advance::Complete,
            Payload::Bytes { segments } => advance_bytes(segments, transport),
            Payload::File(send) => send.advance(transport),
        }
    }
}

fn advance_bytes(segments: &mut VecDeque<Bytes>, transport: &mut dyn Transport) -> Advance {
    while let Some(front) = segments.front_mut() {
        match transport.send(front) {
            SendOutcome::Sent(n) => {
                front.advance(n);
                if front.is_empty() {
                    segments.pop_front();
                }
            }
            SendOutcome::WouldBlock => return Advance::Blocked,
            SendOutcome::Failed(code) => return Advance::Failed(code),
        }
    }
    Advance::Complete
}

/// 文件发送负载。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 明文流走零拷贝原语；加密流必须逐块经加密通道拷贝。两条路径共用
///   本类型：零拷贝不可用时自动退化为“读块 + send”的拷贝循环。
///
/// ## 逻辑（How）
/// - 文件在首次排到队首时才打开；分块编码模式下块长只有此刻才知道，
///   块帧由本操作自行构造：`[收尾 CRLF]<hex>\r\n<内容>\r\n`，自带收尾，
///   完成后上游不存在未闭合的块；
/// - 实际长度写入共享单元 `resolved_len`，发起方（HTTP 输出流）在完成
///   回调里读取它做累计长度记账；
/// - 打开/读取失败按宽容策略处理：记录错误，按零长度完成，不让单个
///   文件失败拖垮整个响应。
///
/// ## 注意事项（Trade-offs）
/// - 长度为零的文件在分块模式下不发出块帧（`0\r\n` 是流终止符），但
///   入队时接手的前块收尾 CRLF 仍要补上。
pub struct FileSend {
    path: PathBuf,
    chunked: bool,
    prefix_close: bool,
    resolved_len: Rc<Cell<Option<u64>>>,
    opened: bool,
    file: Option<File>,
    header: Option<Bytes>,
    trailer: Option<Bytes>,
    remaining: u64,
    pending: BytesMut,
}

impl FileSend {
    /// `chunked`：由本操作自行发出完整块帧；`prefix_close`：块帧之前
    /// 需要先补上前一块的收尾 CRLF。
    pub fn new(path: impl AsRef<Path>, chunked: bool, prefix_close: bool) -> Self {
        FileSend {
            path: path.as_ref().to_path_buf(),
            chunked,
            prefix_close,
            resolved_len: Rc::new(Cell::new(None)),
            opened: false,
            file: None,
            header: None,
            trailer: None,
            remaining: 0,
            pending: BytesMut::new(),
        }
    }

    /// 与发起方共享的长度单元：stat 完成或文件打开时写入。
    pub fn length_cell(&self) -> Rc<Cell<Option<u64>>> {
        self.resolved_len.clone()
    }

    fn open_once(&mut self) {
        if self.opened {
            return;
        }
        self.opened = true;
        match File::open(&self.path) {
            Ok(file) => {
                let length = match self.resolved_len.get() {
                    Some(length) => length,
                    None => {
                        let length = file.metadata().map(|m| m.len()).unwrap_or_else(|err| {
                            tracing::error!(
                                target: "lumen::transport",
                                path = %self.path.display(),
                                "读取文件长度失败，按零长度处理: {err}"
                            );
                            0
                        });
                        self.resolved_len.set(Some(length));
                        length
                    }
                };
                self.remaining = length;
                self.file = Some(file);
                if self.chunked {
                    if length > 0 {
                        self.header = Some(chunk_header(self.prefix_close, length));
                        self.trailer = Some(Bytes::from_static(b"\r\n"));
                    } else if self.prefix_close {
                        self.header = Some(Bytes::from_static(b"\r\n"));
                    }
                }
            }
            Err(err) => {
                tracing::error!(
                    target: "lumen::transport",
                    path = %self.path.display(),
                    "打开文件失败，按零长度完成该写操作: {err}"
                );
                self.resolved_len.set(Some(0));
                self.remaining = 0;
                if self.chunked && self.prefix_close {
                    self.header = Some(Bytes::from_static(b"\r\n"));
                }
            }
        }
    }

    fn advance(&mut self, transport: &mut dyn Transport) -> Advance {
        self.open_once();

        // 块头先行，部分写同样续传。
        while let Some(header) = &mut self.header {
            match transport.send(header) {
                SendOutcome::Sent(n) => {
                    header.advance(n);
                    if header.is_empty() {
                        self.header = None;
                    }
                }
                SendOutcome::WouldBlock => return Advance::Blocked,
                SendOutcome::Failed(code) => return Advance::Failed(code),
            }
        }

        loop {
            // 先冲掉拷贝路径已读出但未送达的余量。
            while !self.pending.is_empty() {
                match transport.send(&self.pending) {
                    SendOutcome::Sent(n) => {
                        self.pending.advance(n);
                    }
                    SendOutcome::WouldBlock => return Advance::Blocked,
                    SendOutcome::Failed(code) => return Advance::Failed(code),
                }
            }

            if self.remaining == 0 {
                self.file = None;
                while let Some(trailer) = &mut self.trailer {
                    match transport.send(trailer) {
                        SendOutcome::Sent(n) => {
                            trailer.advance(n);
                            if trailer.is_empty() {
                                self.trailer = None;
                            }
                        }
                        SendOutcome::WouldBlock => return Advance::Blocked,
                        SendOutcome::Failed(code) => return Advance::Failed(code),
                    }
                }
                return Advance::Complete;
            }

            // 不变量：remaining > 0 时文件已打开。
            let Some(file) = self.file.as_mut() else {
                self.remaining = 0;
                continue;
            };
            match transport.sendfile_raw(file, self.remaining) {
                Some(SendOutcome::Sent(0)) => {
                    // 文件比预期短（并发截断），提前收尾。
                    self.remaining = 0;
                }
                Some(SendOutcome::Sent(n)) => {
                    self.remaining = self.remaining.saturating_sub(n as u64);
                }
                Some(SendOutcome::WouldBlock) => return Advance::Blocked,
                Some(SendOutcome::Failed(code)) => return Advance::Failed(code),
                None => {
                    let want = COPY_CHUNK.min(self.remaining as usize);
                    let mut buf = vec![0u8; want];
                    match file.read(&mut buf) {
                        Ok(0) => self.remaining = 0,
                        Ok(n) => {
                            self.pending.extend_from_slice(&buf[..n]);
                            self.remaining = self.remaining.saturating_sub(n as u64);
                        }
                        Err(err) => {
                            tracing::error!(
                                target: "lumen::transport",
                                path = %self.path.display(),
                                "读取文件内容失败，提前结束该写操作: {err}"
                            );
                            self.remaining = 0;
                        }
                    }
                }
            }
        }
    }
}

/// 构造分块编码的块头：`[\r\n]<hex>\r\n`。
///
/// 前导 CRLF 是上一块的收尾，按约定折叠进下一块的块头缓冲。
pub fn chunk_header(prefix_close: bool, length: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(24);
    if prefix_close {
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(format!("{length:x}").as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.freeze()
}

/// 终止块：`[\r\n]0\r\n\r\n`。
pub fn chunk_terminator(prefix_close: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    if prefix_close {
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"0\r\n\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AcceptOutcome, ReadOutcome};
    use std::net::SocketAddr;

    /// 每次最多接受 `cap` 字节的测试传输，用于逼出部分写续传路径。
    struct ThrottledSink {
        cap: usize,
        accepted: Vec<u8>,
        block_next: bool,
    }

    impl ThrottledSink {
        fn new(cap: usize) -> Self {
            ThrottledSink {
                cap,
                accepted: Vec::new(),
                block_next: false,
            }
        }
    }

    impl Transport for ThrottledSink {
        fn listen(&mut self, _host: &str, _port: u16) -> Result<(), crate::TransportError> {
            unreachable!()
        }
        fn connect(&mut self, _addr: SocketAddr) -> Result<(), crate::TransportError> {
            unreachable!()
        }
        fn finish_connect(&mut self) -> Result<Option<SocketAddr>, i32> {
            unreachable!()
        }
        fn accept(&mut self) -> AcceptOutcome {
            AcceptOutcome::WouldBlock
        }
        fn read(&mut self, _buf: &mut [u8]) -> ReadOutcome {
            ReadOutcome::WouldBlock
        }
        fn send(&mut self, buf: &[u8]) -> SendOutcome {
            if self.block_next {
                self.block_next = false;
                return SendOutcome::WouldBlock;
            }
            let n = self.cap.min(buf.len());
            self.accepted.extend_from_slice(&buf[..n]);
            self.block_next = true;
            SendOutcome::Sent(n)
        }
        fn sendfile_raw(&mut self, _file: &mut File, _remaining: u64) -> Option<SendOutcome> {
            None
        }
        fn source(&mut self) -> Option<&mut dyn mio::event::Source> {
            None
        }
        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn teardown(&mut self) {}
    }

    #[test]
    fn partial_writes_resume_without_restarting() {
        let mut sink = ThrottledSink::new(4);
        let mut op = WriteOperation::bytes(
            vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")],
            None,
        );

        let mut steps = 0;
        loop {
            match op.advance(&mut sink) {
                Advance::Complete => break,
                Advance::Blocked => {
                    steps += 1;
                    assert!(steps < 32, "排水不应卡死");
                }
                Advance::Failed(code) => panic!("意外失败: {code}"),
            }
        }
        assert_eq!(sink.accepted, b"hello world");
    }

    #[test]
    fn noop_completes_immediately() {
        let mut sink = ThrottledSink::new(1);
        let mut op = WriteOperation::noop(None);
        assert!(matches!(op.advance(&mut sink), Advance::Complete));
    }

    #[test]
    fn chunk_header_folds_previous_close() {
        assert_eq!(&chunk_header(false, 3)[..], b"3\r\n");
        assert_eq!(&chunk_header(true, 16)[..], b"\r\n10\r\n");
        assert_eq!(&chunk_terminator(false)[..], b"0\r\n\r\n");
        assert_eq!(&chunk_terminator(true)[..], b"\r\n0\r\n\r\n");
    }

    fn drain(op: &mut WriteOperation, sink: &mut ThrottledSink) {
        let mut steps = 0;
        loop {
            match op.advance(sink) {
                Advance::Complete => return,
                Advance::Blocked => {
                    steps += 1;
                    assert!(steps < 128, "排水不应卡死");
                }
                Advance::Failed(code) => panic!("意外失败: {code}"),
            }
        }
    }

    fn temp_file(tag: &str, content: &[u8]) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("lumen-write-op-{}-{tag}", std::process::id()));
        std::fs::write(&path, content).expect("写入临时文件失败");
        path
    }

    /// 分块模式下文件负载发出自带收尾的完整块帧，并接手前块的收尾。
    #[test]
    fn chunked_file_emits_self_closing_frame() {
        let path = temp_file("frame", b"payload");
        let mut sink = ThrottledSink::new(5);
        let mut op = WriteOperation::file(FileSend::new(&path, true, true), None);
        drain(&mut op, &mut sink);
        assert_eq!(sink.accepted, b"\r\n7\r\npayload\r\n");
    }

    /// 空文件在分块模式下保持静默，只补上接手的前块收尾。
    #[test]
    fn chunked_empty_file_only_closes_previous_chunk() {
        let path = temp_file("empty", b"");
        let mut sink = ThrottledSink::new(8);
        let mut op = WriteOperation::file(FileSend::new(&path, true, true), None);
        drain(&mut op, &mut sink);
        assert_eq!(sink.accepted, b"\r\n");

        let mut sink = ThrottledSink::new(8);
        let mut op = WriteOperation::file(FileSend::new(&path, true, false), None);
        drain(&mut op, &mut sink);
        assert_eq!(sink.accepted, b"");
    }
}
