use crate::entity::HttpEntity;
use crate::error::HttpError;
use bytes::{Bytes, BytesMut};
use lumen_transport::{
    FileSend, SocketStream, WriteCallback, WriteOperation, chunk_header, chunk_terminator,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::rc::{Rc, Weak};

struct Inner {
    entity: Box<dyn HttpEntity>,
    socket: SocketStream,
    /// 已写出负载字节的累计长度；分块帧开销不入账。
    length: u64,
    chunk_encode: bool,
    add_headers: bool,
    metadata_written: bool,
    final_chunk_sent: bool,
    /// 上一个分块尚欠收尾 CRLF，折叠进下一个块头。
    needs_chunk_close: bool,
    pending_lookups: usize,
    /// 一次性的延迟收尾槽：存一次，消费一次。
    deferred_end: Option<Option<WriteCallback>>,
    /// 元数据定稿前的暂存队列（仅定长模式使用）。
    staging: VecDeque<WriteOperation>,
}

/// 面向应用的只写 HTTP 输出流。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 应用只管写字节和发文件，本类型负责把输出翻译成分块或定长编码，
///   并把「头必须晚于长度定稿」的时序问题挡在应用之外。
///
/// ## 逻辑（How）
/// - 分块模式：首次写出即定稿元数据；每次写包装为「块头 + 负载」两段，
///   前一块的收尾 CRLF 折叠进下一块的块头，终止块 `0\r\n\r\n` 由
///   [`HttpStream::end`] 发出；文件负载的块帧在排水时自行构造（长度
///   此刻才可知），自带收尾；
/// - 定长模式：`Content-Length` 要等全部长度可知才能发头，所以写操作
///   先进私有暂存队列；[`HttpStream::send_file`] 在循环外线程 stat
///   文件并把完成回调编组回循环线程；[`HttpStream::end`] 在全部查询
///   落定后定稿元数据、按原序冲出暂存队列，再以空操作挂上完成回调；
/// - 查询未落定时的 `end` 被延迟：标志 + 回调存入一次性槽，计数归零
///   时重放。
///
/// ## 契约（What）
/// - 编码模式只在首字节之前可变，此后返回
///   [`HttpError::InvalidState`]；
/// - 终止块至多发出一次，重复 `end` 不再发；
/// - 底层套接字流是共享的：本类型不拥有它，也不负责关闭它；
/// - stat 失败按零长度记账并记日志，响应继续（宽容策略）。
#[derive(Clone)]
pub struct HttpStream {
    inner: Rc<RefCell<Inner>>,
}

impl HttpStream {
    /// 默认分块编码、自动补全编码头。
    pub fn new(entity: impl HttpEntity + 'static, socket: SocketStream) -> Self {
        HttpStream {
            inner: Rc::new(RefCell::new(Inner {
                entity: Box::new(entity),
                socket,
                length: 0,
                chunk_encode: true,
                add_headers: true,
                metadata_written: false,
                final_chunk_sent: false,
                needs_chunk_close: false,
                pending_lookups: 0,
                deferred_end: None,
                staging: VecDeque::new(),
            })),
        }
    }

    /// 已写出的累计负载字节数；两种编码模式口径一致。
    pub fn length(&self) -> u64 {
        self.inner.borrow().length
    }

    pub fn chunked(&self) -> bool {
        self.inner.borrow().chunk_encode
    }

    /// 切换编码模式；首字节之后冻结。
    pub fn set_chunked(&self, on: bool) -> Result<(), HttpError> {
        let mut inner = self.inner.borrow_mut();
        if inner.length > 0 || inner.metadata_written {
            return Err(HttpError::InvalidState(
                "encoding mode is frozen once output has started",
            ));
        }
        inner.chunk_encode = on;
        Ok(())
    }

    /// 关掉自动头合成；调用方自行保证元数据与编码一致。
    pub fn set_add_headers(&self, on: bool) {
        self.inner.borrow_mut().add_headers = on;
    }

    /// 写出一段负载；空负载是空操作（分块模式下 `0` 长度块是终止符，
    /// 不能因空写误发）。
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let chunked = self.inner.borrow().chunk_encode;
        if chunked {
            write_metadata(&self.inner);
            let (op, socket) = {
                let mut inner = self.inner.borrow_mut();
                let prefix = std::mem::replace(&mut inner.needs_chunk_close, true);
                let header = chunk_header(prefix, data.len() as u64);
                inner.length += data.len() as u64;
                (
                    WriteOperation::bytes(
                        vec![header, Bytes::copy_from_slice(data)],
                        None,
                    ),
                    inner.socket.clone(),
                )
            };
            socket.queue_write(op);
        } else {
            let mut inner = self.inner.borrow_mut();
            inner.length += data.len() as u64;
            let op = WriteOperation::single(Bytes::copy_from_slice(data), None);
            queue_or_stage(&mut inner, op);
        }
    }

    /// 发送一个文件的全部内容。
    ///
    /// 定长模式先在循环外线程 stat 出长度（计入 `Content-Length`），
    /// 查询未落定前 `end` 被门控；分块模式无需预知长度，块帧由文件
    /// 操作在排水时构造，完成时把实际长度补入累计记账。
    pub fn send_file(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let chunked = self.inner.borrow().chunk_encode;
        if chunked {
            write_metadata(&self.inner);
            let (op, socket) = {
                let mut inner = self.inner.borrow_mut();
                let prefix = std::mem::replace(&mut inner.needs_chunk_close, false);
                let send = FileSend::new(&path, true, prefix);
                let cell = send.length_cell();
                let weak = Rc::downgrade(&self.inner);
                let op = WriteOperation::file(
                    send,
                    Some(Box::new(move || {
                        file_sent(&weak, cell.get().unwrap_or(0));
                    })),
                );
                (op, inner.socket.clone())
            };
            socket.queue_write(op);
        } else {
            let (handle, cell) = {
                let mut inner = self.inner.borrow_mut();
                inner.pending_lookups += 1;
                let send = FileSend::new(&path, false, false);
                let cell = send.length_cell();
                queue_or_stage(&mut inner, WriteOperation::file(send, None));
                (inner.socket.loop_handle(), cell)
            };
            let weak = Rc::downgrade(&self.inner);
            let stat_path = path.clone();
            handle.spawn_blocking(
                move || std::fs::metadata(&stat_path).map(|meta| meta.len()),
                move |result| {
                    let size = match result {
                        Ok(size) => size,
                        Err(err) => {
                            tracing::error!(
                                target: "lumen::http",
                                path = %path.display(),
                                "文件长度查询失败，按零长度记账: {err}"
                            );
                            0
                        }
                    };
                    cell.set(Some(size));
                    lookup_resolved(&weak, size);
                },
            );
        }
    }

    /// 收尾：定稿元数据并通知调用方「此前的数据都已交付传输层」。
    ///
    /// 长度查询未落定时延迟执行；终止块至多发出一次。
    pub fn end(&self, callback: Option<WriteCallback>) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.pending_lookups > 0 {
                if inner.deferred_end.is_none() {
                    inner.deferred_end = Some(callback);
                } else {
                    tracing::debug!(
                        target: "lumen::http",
                        "收尾已在等待长度查询，重复调用被忽略"
                    );
                }
                return;
            }
        }
        finish_end(&self.inner, callback);
    }
}

/// 定稿元数据：回填编码头、序列化状态行 + 头块、按原序冲出暂存队列。
///
/// 守卫：至多执行一次，且长度查询未落定时不执行。
fn write_metadata(inner_rc: &Rc<RefCell<Inner>>) {
    let (metadata, staged, socket) = {
        let mut inner = inner_rc.borrow_mut();
        if inner.metadata_written || inner.pending_lookups > 0 {
            return;
        }
        inner.metadata_written = true;
        if inner.add_headers {
            if inner.chunk_encode {
                inner.entity.headers().set("Transfer-Encoding", "chunked");
            } else {
                let length = inner.length;
                inner.entity.headers().set_content_length(length);
            }
        }
        let mut buf = BytesMut::new();
        inner.entity.write_metadata(&mut buf);
        (
            buf.freeze(),
            std::mem::take(&mut inner.staging),
            inner.socket.clone(),
        )
    };
    if !metadata.is_empty() {
        socket.queue_write(WriteOperation::single(metadata, None));
    }
    for op in staged {
        socket.queue_write(op);
    }
}

/// 元数据已定稿时直接入队，否则进暂存队列等待定稿后按原序冲出。
fn queue_or_stage(inner: &mut Inner, op: WriteOperation) {
    if inner.metadata_written {
        inner.socket.queue_write(op);
    } else {
        inner.staging.push_back(op);
    }
}

/// 分块文件操作完成：把排水时才得知的实际长度补入累计记账。
fn file_sent(weak: &Weak<RefCell<Inner>>, size: u64) {
    let Some(inner_rc) = weak.upgrade() else { return };
    inner_rc.borrow_mut().length += size;
}

/// 一次长度查询落定：记账、递减计数，归零时重放被延迟的收尾。
fn lookup_resolved(weak: &Weak<RefCell<Inner>>, size: u64) {
    let Some(inner_rc) = weak.upgrade() else { return };
    let replay = {
        let mut inner = inner_rc.borrow_mut();
        inner.length += size;
        inner.pending_lookups -= 1;
        inner.pending_lookups == 0 && inner.deferred_end.is_some()
    };
    if replay {
        let callback = inner_rc.borrow_mut().deferred_end.take().flatten();
        finish_end(&inner_rc, callback);
    }
}

fn finish_end(inner_rc: &Rc<RefCell<Inner>>, callback: Option<WriteCallback>) {
    write_metadata(inner_rc);
    let (op, socket) = {
        let mut inner = inner_rc.borrow_mut();
        let socket = inner.socket.clone();
        if inner.chunk_encode && !inner.final_chunk_sent {
            inner.final_chunk_sent = true;
            let prefix = std::mem::replace(&mut inner.needs_chunk_close, false);
            let terminator = chunk_terminator(prefix);
            (WriteOperation::single(terminator, callback), socket)
        } else {
            // 定长模式的同步点；分块模式重复收尾只剩通知义务。
            (WriteOperation::noop(callback), socket)
        }
    };
    socket.queue_write(op);
}
