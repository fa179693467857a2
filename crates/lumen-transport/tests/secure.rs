//! 加密套接字流的端到端契约测试。
//!
//! # 教案式说明
//! - **Why**：加密变体与明文变体共用同一状态机，必须单独验证证书装载
//!   失败的同步报告路径，以及真实握手之上的读写回环。
//! - **How**：用 `rcgen` 现场签发自签名证书写入临时 PEM 文件；客户端
//!   在工作线程上用 `rustls::StreamOwned` 套在阻塞套接字上，仅信任该
//!   自签名证书。
//! - **What**：断言失败即 panic；握手、回显与有序关闭都在 5 秒兜底
//!   定时器内完成。

use lumen_reactor::EventLoop;
use lumen_transport::{SocketStream, TransportError};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use rustls_pki_types::{CertificateDer, ServerName};
use std::cell::RefCell;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 兜底定时器：测试逻辑若悬挂，在限期内强制停表。
fn arm_failsafe(event_loop: &EventLoop) -> lumen_reactor::TimerWatcher {
    let handle = event_loop.handle();
    event_loop
        .handle()
        .new_timer(Duration::from_secs(5), Duration::ZERO, move || {
            handle.stop();
        })
}

/// 签发 localhost 自签名证书，把证书链与私钥写成 PEM 文件。
///
/// 返回 (证书路径, 私钥路径, 证书 DER)；DER 用于客户端信任锚。
fn issue_test_cert(tag: &str) -> (PathBuf, PathBuf, CertificateDer<'static>) {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    let mut params =
        CertificateParams::new(vec!["localhost".to_string()]).expect("构造证书参数失败");
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "localhost");
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate().expect("生成证书私钥失败");
    let certificate = params.self_signed(&key_pair).expect("签发自签名证书失败");

    let dir = std::env::temp_dir().join(format!("lumen-tls-{}-{tag}", std::process::id()));
    fs::create_dir_all(&dir).expect("创建临时证书目录失败");
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    fs::write(&cert_path, certificate.pem()).expect("写入证书 PEM 失败");
    fs::write(&key_path, key_pair.serialize_pem()).expect("写入私钥 PEM 失败");

    let cert_der = CertificateDer::from(certificate.der().to_vec());
    (cert_path, key_path, cert_der)
}

/// 仅信任指定证书的客户端配置。
fn client_config(trust: CertificateDer<'static>) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(trust).expect("装入信任锚失败");
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("客户端协议配置失败")
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

/// 证书路径不存在时，构造同步失败并携带两个路径。
#[test]
fn missing_certificate_reports_tls_init_failed() {
    let event_loop = EventLoop::new().expect("创建事件循环失败");
    let handle = event_loop.handle();

    let cert = PathBuf::from("/nonexistent/lumen-cert.pem");
    let key = PathBuf::from("/nonexistent/lumen-key.pem");
    match SocketStream::secure(&handle, &cert, &key) {
        Err(TransportError::TlsInitFailed {
            cert_path,
            key_path,
            ..
        }) => {
            assert_eq!(cert_path, cert);
            assert_eq!(key_path, key);
        }
        Ok(_) => panic!("缺失证书不应构造成功"),
        Err(other) => panic!("期望 TlsInitFailed，实际 {other:?}"),
    }
}

/// 私钥文件无法解析同样以 `TlsInitFailed` 同步报告。
#[test]
fn malformed_key_reports_tls_init_failed() {
    let event_loop = EventLoop::new().expect("创建事件循环失败");
    let handle = event_loop.handle();

    let (cert_path, key_path, _) = issue_test_cert("malformed");
    fs::write(&key_path, "这不是一个 PEM 文件").expect("覆写私钥文件失败");
    match SocketStream::secure(&handle, &cert_path, &key_path) {
        Err(TransportError::TlsInitFailed { .. }) => {}
        Ok(_) => panic!("非法私钥不应构造成功"),
        Err(other) => panic!("期望 TlsInitFailed，实际 {other:?}"),
    }
}

/// 握手之上的回显：服务端读到什么就写回什么，客户端透过记录层核对。
/// 客户端随后发 close_notify，服务端读回调观察到空切片。
#[test]
fn tls_echo_round_trip() {
    let (cert_path, key_path, trust) = issue_test_cert("echo");

    let mut event_loop = EventLoop::new().expect("创建事件循环失败");
    let handle = event_loop.handle();
    let _failsafe = arm_failsafe(&event_loop);

    let listener = SocketStream::secure(&handle, &cert_path, &key_path).expect("加密监听构造失败");
    listener.listen("127.0.0.1", 0).expect("监听失败");
    let port = listener.local_port().expect("未取得监听端口");

    let saw_shutdown = Rc::new(RefCell::new(false));
    let accepted_slot: Rc<RefCell<Option<SocketStream>>> = Rc::new(RefCell::new(None));
    {
        let saw_shutdown = saw_shutdown.clone();
        let accepted_slot = accepted_slot.clone();
        let handle = handle.clone();
        listener.on_connection_accepted(move |stream| {
            let saw_shutdown = saw_shutdown.clone();
            let handle = handle.clone();
            stream.start_reading(move |stream, data| {
                if data.is_empty() {
                    *saw_shutdown.borrow_mut() = true;
                    handle.stop();
                } else {
                    stream.write(data, None);
                }
            });
            *accepted_slot.borrow_mut() = Some(stream);
        });
    }

    let config = client_config(trust);
    let client = thread::spawn(move || {
        let sock = StdTcpStream::connect(("127.0.0.1", port)).expect("客户端连接失败");
        let server_name = ServerName::try_from("localhost").expect("服务器名非法");
        let conn = ClientConnection::new(config, server_name).expect("客户端会话构造失败");
        let mut tls = StreamOwned::new(conn, sock);

        tls.write_all(b"echo through the record layer").expect("客户端写失败");
        let mut buf = vec![0u8; b"echo through the record layer".len()];
        tls.read_exact(&mut buf).expect("客户端读失败");

        tls.conn.send_close_notify();
        let _ = tls.flush();
        buf
    });

    event_loop.run_blocking().expect("循环运行失败");
    let echoed = client.join().expect("客户端线程 panic");
    assert_eq!(echoed, b"echo through the record layer");
    assert!(*saw_shutdown.borrow(), "服务端应观察到有序关闭");
}

/// 服务端主动刷新流量密钥后仍能继续收发；客户端对 KeyUpdate 无感。
#[test]
fn traffic_key_refresh_keeps_stream_usable() {
    let (cert_path, key_path, trust) = issue_test_cert("rekey");

    let mut event_loop = EventLoop::new().expect("创建事件循环失败");
    let handle = event_loop.handle();
    let _failsafe = arm_failsafe(&event_loop);

    let listener = SocketStream::secure(&handle, &cert_path, &key_path).expect("加密监听构造失败");
    listener.listen("127.0.0.1", 0).expect("监听失败");
    let port = listener.local_port().expect("未取得监听端口");

    let accepted_slot: Rc<RefCell<Option<SocketStream>>> = Rc::new(RefCell::new(None));
    {
        let accepted_slot = accepted_slot.clone();
        let handle = handle.clone();
        listener.on_connection_accepted(move |stream| {
            let handle = handle.clone();
            stream.start_reading(move |stream, data| {
                if data.is_empty() {
                    handle.stop();
                    return;
                }
                // 第一段数据到达说明握手已完成，此时刷新密钥再应答。
                stream.redo_handshake().expect("流量密钥刷新失败");
                stream.write(b"after-rekey", None);
            });
            *accepted_slot.borrow_mut() = Some(stream);
        });
    }

    let config = client_config(trust);
    let client = thread::spawn(move || {
        let sock = StdTcpStream::connect(("127.0.0.1", port)).expect("客户端连接失败");
        let server_name = ServerName::try_from("localhost").expect("服务器名非法");
        let conn = ClientConnection::new(config, server_name).expect("客户端会话构造失败");
        let mut tls = StreamOwned::new(conn, sock);

        tls.write_all(b"trigger").expect("客户端写失败");
        let mut buf = vec![0u8; b"after-rekey".len()];
        tls.read_exact(&mut buf).expect("客户端读失败");
        tls.conn.send_close_notify();
        let _ = tls.flush();
        buf
    });

    event_loop.run_blocking().expect("循环运行失败");
    assert_eq!(client.join().expect("客户端线程 panic"), b"after-rekey");
}
