//! HTTP 输出流的端到端编码测试：分块帧、定长记账、文件发送与收尾
//! 门控，全部在真实回环套接字上按原始线上字节断言。
//!
//! # 教案式说明
//! - **Why**：编码正确性只有在真实排水路径下才算数——部分写、暂存
//!   队列冲出顺序、循环外 stat 的编组都参与其中；
//! - **How**：事件循环占用测试线程，客户端在工作线程上读到 EOF；
//!   服务端脚本在接受回调里构造输出流并执行；
//! - **What**：每个场景断言完整的线上字节序列。

use bytes::BytesMut;
use lumen_http::{Headers, HttpEntity, HttpError, HttpStream};
use lumen_reactor::{EventLoop, LoopHandle};
use lumen_transport::SocketStream;
use std::cell::{Cell, RefCell};
use std::io::Read;
use std::net::TcpStream as StdTcpStream;
use std::path::PathBuf;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

/// 不写任何元数据的实体；用于裸断言分块帧。
#[derive(Default)]
struct SilentEntity {
    headers: Headers,
}

impl HttpEntity for SilentEntity {
    fn headers(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn write_metadata(&mut self, _buf: &mut BytesMut) {}
}

/// 固定 200 状态行的实体；头块由 [`Headers`] 序列化。
#[derive(Default)]
struct OkEntity {
    headers: Headers,
}

impl HttpEntity for OkEntity {
    fn headers(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn write_metadata(&mut self, buf: &mut BytesMut) {
        buf.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
        self.headers.write_to(buf);
        buf.extend_from_slice(b"\r\n");
    }
}

fn temp_file(tag: &str, content: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("lumen-http-{}-{tag}", std::process::id()));
    std::fs::write(&path, content).expect("写入临时文件失败");
    path
}

/// 起一条回环连接，执行服务端脚本，返回客户端读到 EOF 的全部字节。
fn collect_response(serve: impl FnOnce(SocketStream, LoopHandle) + 'static) -> Vec<u8> {
    let mut event_loop = EventLoop::new().expect("创建事件循环失败");
    let handle = event_loop.handle();
    let failsafe_handle = event_loop.handle();
    let _failsafe = event_loop
        .handle()
        .new_timer(Duration::from_secs(5), Duration::ZERO, move || {
            failsafe_handle.stop();
        });

    let listener = SocketStream::plain(&handle);
    listener.listen("127.0.0.1", 0).expect("监听失败");
    let port = listener.local_port().expect("未取得监听端口");

    let serve_slot = Rc::new(RefCell::new(Some(serve)));
    {
        let handle = handle.clone();
        listener.on_connection_accepted(move |stream| {
            if let Some(serve) = serve_slot.borrow_mut().take() {
                serve(stream, handle.clone());
            }
        });
    }

    let client = thread::spawn(move || {
        let mut sock = StdTcpStream::connect(("127.0.0.1", port)).expect("客户端连接失败");
        let mut body = Vec::new();
        sock.read_to_end(&mut body).expect("客户端读失败");
        body
    });

    event_loop.run_blocking().expect("循环运行失败");
    client.join().expect("客户端线程 panic")
}

/// `foo` + `bar` 的分块线上字节：前块收尾折叠进后块块头。
#[test]
fn chunked_writes_produce_the_canonical_wire_bytes() {
    let body = collect_response(|stream, handle| {
        let http = HttpStream::new(SilentEntity::default(), stream.clone());
        http.set_add_headers(false);
        http.write(b"foo");
        http.write(b"bar");
        http.end(Some(Box::new(move || {
            stream.close();
            handle.stop();
        })));
    });
    assert_eq!(body, b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n");
}

/// 终止块至多发出一次：重复收尾与空写都不改变线上字节。
#[test]
fn end_is_idempotent_for_the_terminator() {
    let body = collect_response(|stream, handle| {
        let http = HttpStream::new(SilentEntity::default(), stream.clone());
        http.set_add_headers(false);
        http.write(b"foo");
        http.write(b"");
        http.end(None);
        http.end(Some(Box::new(move || {
            stream.close();
            handle.stop();
        })));
    });
    assert_eq!(body, b"3\r\nfoo\r\n0\r\n\r\n");
    let hits = body.windows(5).filter(|w| w == b"0\r\n\r\n").count();
    assert_eq!(hits, 1, "终止块只能出现一次");
}

/// 定长模式：`Content-Length` 等于全部写入的字节数，头先于数据。
#[test]
fn fixed_length_accounts_every_written_byte() {
    let body = collect_response(|stream, handle| {
        let mut entity = OkEntity::default();
        entity.headers().set("content-type", "text/plain");
        let http = HttpStream::new(entity, stream.clone());
        http.set_chunked(false).expect("收到首字节前应可切换编码");
        http.write(b"hello");
        http.write(b"world");
        http.end(Some(Box::new(move || {
            stream.close();
            handle.stop();
        })));
    });
    assert_eq!(
        body,
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 10\r\n\r\nhelloworld"
    );
}

/// 定长模式发文件后立即收尾：回调要等 stat 落定才触发，且
/// `Content-Length` 已按真实长度排在文件字节之前。
#[test]
fn send_file_gates_end_until_the_lookup_resolves() {
    let path = temp_file("ten", b"0123456789");
    let fired = Rc::new(Cell::new(false));
    let observed = fired.clone();
    let body = collect_response(move |stream, handle| {
        let http = HttpStream::new(OkEntity::default(), stream.clone());
        http.set_chunked(false).expect("收到首字节前应可切换编码");
        http.send_file(&path);
        let fired_in_cb = fired.clone();
        http.end(Some(Box::new(move || {
            fired_in_cb.set(true);
            stream.close();
            handle.stop();
        })));
        assert!(!fired.get(), "stat 未落定时收尾回调不得触发");
    });
    assert!(observed.get(), "收尾回调最终必须触发");
    assert_eq!(
        body,
        b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789"
    );
}

/// 分块模式下的文件块帧自带收尾，与前后的普通写正确衔接。
#[test]
fn chunked_send_file_frames_interleave_with_writes() {
    let path = temp_file("content", b"content");
    let body = collect_response(move |stream, handle| {
        let http = HttpStream::new(SilentEntity::default(), stream.clone());
        http.set_add_headers(false);
        http.write(b"a");
        http.send_file(&path);
        http.write(b"b");
        http.end(Some(Box::new(move || {
            stream.close();
            handle.stop();
        })));
    });
    assert_eq!(body, b"1\r\na\r\n7\r\ncontent\r\n1\r\nb\r\n0\r\n\r\n");
}

/// stat 失败按零长度记账：响应继续，`Content-Length` 只计成功部分。
#[test]
fn missing_file_degrades_to_zero_length() {
    let body = collect_response(|stream, handle| {
        let http = HttpStream::new(OkEntity::default(), stream.clone());
        http.set_chunked(false).expect("收到首字节前应可切换编码");
        http.send_file("/nonexistent/lumen-http-missing.bin");
        http.write(b"ok");
        http.end(Some(Box::new(move || {
            stream.close();
            handle.stop();
        })));
    });
    assert_eq!(body, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
}

/// 累计长度只计负载字节：分块帧的块头与收尾 CRLF 不入账。
#[test]
fn length_counts_payload_bytes_only() {
    let event_loop = EventLoop::new().expect("创建事件循环失败");
    let handle = event_loop.handle();

    let socket = SocketStream::plain(&handle);
    let http = HttpStream::new(SilentEntity::default(), socket);
    http.set_add_headers(false);
    http.write(b"foo");
    http.write(b"quux");
    assert_eq!(http.length(), 7);
}

/// 编码模式在首字节之后冻结。
#[test]
fn encoding_mode_freezes_after_the_first_byte() {
    let event_loop = EventLoop::new().expect("创建事件循环失败");
    let handle = event_loop.handle();

    let socket = SocketStream::plain(&handle);
    let http = HttpStream::new(SilentEntity::default(), socket);
    http.set_add_headers(false);
    http.set_chunked(false).expect("首字节前应可切换");
    http.set_chunked(true).expect("首字节前应可反复切换");

    http.write(b"x");
    match http.set_chunked(false) {
        Err(HttpError::InvalidState(_)) => {}
        Ok(()) => panic!("首字节之后不应允许切换编码"),
    }
}
