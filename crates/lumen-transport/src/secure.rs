use crate::error::{TransportError, errno};
use crate::plain::bind_listener;
use crate::transport::{AcceptOutcome, ReadOutcome, SendOutcome, Transport};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use rustls::{ServerConfig, ServerConnection};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

/// 加密 TCP 传输：rustls 记录层跑在非阻塞套接字之上。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 与明文变体共享同一状态机与写队列，差异全部收敛在这里：握手与
///   记录层由 `pump`/`flush` 驱动，读写只面对明文。
///
/// ## 逻辑（How）
/// - 可读就绪 → `read_tls` 吸入密文至 `WouldBlock`，`process_new_packets`
///   推进握手/解密，随后 `write_tls` 冲掉握手应答；
/// - 发送先落入 rustls 的出站缓冲（有上限，写满视作 `WouldBlock`），
///   再尽力 `write_tls` 到套接字；
/// - 文件发送不返回零拷贝通道（`sendfile_raw` 恒为 `None`）：内容必须
///   逐块经记录层加密，这是与明文变体的关键行为差异。
///
/// ## 契约（What）
/// - 构造时加载证书/私钥并固化 `ServerConfig`，失败以
///   [`TransportError::TlsInitFailed`] 报告错误码与两个路径；
/// - 客户端方向未实现：`connect` 返回 `UnsupportedOperation`；
/// - `redo_handshake` 映射为 TLS 1.3 的流量密钥刷新。
pub(crate) struct SecureTransport {
    config: Arc<ServerConfig>,
    kind: Kind,
    /// 对端在 TCP 层关闭（未必送达 close_notify）。
    eof: bool,
}

enum Kind {
    Empty,
    Listener(TcpListener),
    Stream {
        sock: TcpStream,
        conn: Box<ServerConnection>,
    },
}

/// rustls 出站缓冲上限；写满后 `send` 报告 `WouldBlock`。
const SEND_BUFFER_LIMIT: usize = 64 * 1024;

impl SecureTransport {
    pub(crate) fn new(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TransportError> {
        let config = load_server_config(cert_path.as_ref(), key_path.as_ref())?;
        Ok(SecureTransport {
            config,
            kind: Kind::Empty,
            eof: false,
        })
    }

    fn accepted(&self, sock: TcpStream, conn: ServerConnection) -> Self {
        SecureTransport {
            config: self.config.clone(),
            kind: Kind::Stream {
                sock,
                conn: Box::new(conn),
            },
            eof: false,
        }
    }

    fn stream_mut(&mut self) -> Option<(&mut TcpStream, &mut ServerConnection)> {
        match &mut self.kind {
            Kind::Stream { sock, conn } => Some((sock, conn)),
            _ => None,
        }
    }

    /// 尽力把 rustls 出站缓冲写到套接字；`Ok(true)` 表示已全部冲出。
    fn flush_records(&mut self) -> Result<bool, i32> {
        let Some((sock, conn)) = self.stream_mut() else {
            return Ok(true);
        };
        while conn.wants_write() {
            match conn.write_tls(sock) {
                Ok(0) => return Err(libc_epipe()),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(errno(&err)),
            }
        }
        Ok(true)
    }
}

impl Transport for SecureTransport {
    fn listen(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        if !matches!(self.kind, Kind::Empty) {
            return Err(TransportError::InvalidState("socket already in use"));
        }
        self.kind = Kind::Listener(bind_listener(host, port)?);
        Ok(())
    }

    fn connect(&mut self, _addr: SocketAddr) -> Result<(), TransportError> {
        Err(TransportError::UnsupportedOperation(
            "client-side TLS connect is not implemented",
        ))
    }

    fn finish_connect(&mut self) -> Result<Option<SocketAddr>, i32> {
        Err(-1)
    }

    fn accept(&mut self) -> AcceptOutcome {
        loop {
            let Kind::Listener(listener) = &mut self.kind else {
                return AcceptOutcome::Failed(-1);
            };
            match listener.accept() {
                Ok((sock, peer)) => {
                    let mut conn = match ServerConnection::new(self.config.clone()) {
                        Ok(conn) => conn,
                        Err(err) => {
                            // 单个会话构造失败不影响监听循环；丢弃该连接。
                            tracing::error!(
                                target: "lumen::transport",
                                %peer,
                                "构造 TLS 会话失败，丢弃连接: {err}"
                            );
                            continue;
                        }
                    };
                    conn.set_buffer_limit(Some(SEND_BUFFER_LIMIT));
                    return AcceptOutcome::Accepted {
                        transport: Box::new(self.accepted(sock, conn)),
                        peer,
                    };
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return AcceptOutcome::WouldBlock;
                }
                Err(err) => return AcceptOutcome::Failed(errno(&err)),
            }
        }
    }

    /// 吸入密文、推进握手/解密，并回写握手应答。
    fn pump(&mut self) -> Result<(), i32> {
        let mut saw_eof = false;
        let mut record_error = false;
        {
            let Some((sock, conn)) = self.stream_mut() else {
                return Ok(());
            };
            loop {
                match conn.read_tls(sock) {
                    Ok(0) => {
                        saw_eof = true;
                        break;
                    }
                    Ok(_) => {
                        if let Err(err) = conn.process_new_packets() {
                            tracing::warn!(
                                target: "lumen::transport",
                                "TLS 记录处理失败: {err}"
                            );
                            record_error = true;
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(errno(&err)),
                }
            }
        }
        if saw_eof {
            self.eof = true;
        }
        if record_error {
            // 先冲掉排队的告警记录，再报告失败。
            let _ = self.flush_records();
            return Err(-1);
        }
        self.flush_records().map(|_| ())
    }

    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let eof = self.eof;
        let Some((_, conn)) = self.stream_mut() else {
            return ReadOutcome::WouldBlock;
        };
        match conn.reader().read(buf) {
            Ok(0) => ReadOutcome::Eof,
            Ok(n) => ReadOutcome::Data(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if eof {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::WouldBlock
                }
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => ReadOutcome::Eof,
            Err(err) => ReadOutcome::Failed(errno(&err)),
        }
    }

    fn send(&mut self, buf: &[u8]) -> SendOutcome {
        let accepted = {
            let Some((_, conn)) = self.stream_mut() else {
                return SendOutcome::Failed(-1);
            };
            match conn.writer().write(buf) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => 0,
                Err(err) => return SendOutcome::Failed(errno(&err)),
            }
        };
        if let Err(code) = self.flush_records() {
            return SendOutcome::Failed(code);
        }
        if accepted == 0 {
            SendOutcome::WouldBlock
        } else {
            SendOutcome::Sent(accepted)
        }
    }

    fn sendfile_raw(&mut self, _file: &mut File, _remaining: u64) -> Option<SendOutcome> {
        // 文件内容必须经记录层加密，不得绕过传输。
        None
    }

    fn wants_write(&self) -> bool {
        match &self.kind {
            Kind::Stream { conn, .. } => conn.wants_write(),
            _ => false,
        }
    }

    fn flush(&mut self) -> Result<(), i32> {
        self.flush_records().map(|_| ())
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        match &mut self.kind {
            Kind::Empty => None,
            Kind::Listener(listener) => Some(listener),
            Kind::Stream { sock, .. } => Some(sock),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match &self.kind {
            Kind::Empty => None,
            Kind::Listener(listener) => listener.local_addr().ok(),
            Kind::Stream { sock, .. } => sock.local_addr().ok(),
        }
    }

    fn redo_handshake(&mut self) -> Result<(), TransportError> {
        let Some((_, conn)) = self.stream_mut() else {
            return Err(TransportError::InvalidState(
                "re-handshake requires an open stream",
            ));
        };
        conn.refresh_traffic_keys().map_err(|err| {
            tracing::warn!(target: "lumen::transport", "流量密钥刷新被拒绝: {err}");
            TransportError::UnsupportedOperation("traffic key refresh rejected by session")
        })?;
        if let Err(code) = self.flush_records() {
            tracing::warn!(target: "lumen::transport", "密钥刷新记录冲刷失败 (errno {code})");
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if let Kind::Stream { .. } = &self.kind {
            if let Some((_, conn)) = self.stream_mut() {
                conn.send_close_notify();
            }
            if let Err(code) = self.flush_records() {
                tracing::warn!(
                    target: "lumen::transport",
                    "关闭时冲刷 close_notify 失败 (errno {code})"
                );
            }
        }
        self.kind = Kind::Empty;
    }
}

fn tls_init_error(code: i32, cert_path: &Path, key_path: &Path) -> TransportError {
    TransportError::TlsInitFailed {
        code,
        cert_path: cert_path.to_path_buf(),
        key_path: key_path.to_path_buf(),
    }
}

fn pem_errno(err: &rustls_pki_types::pem::Error) -> i32 {
    match err {
        rustls_pki_types::pem::Error::Io(io_err) => errno(io_err),
        _ => -1,
    }
}

/// 从 PEM 路径加载证书链与私钥，构造固定的服务端配置。
fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<ServerConfig>, TransportError> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .map_err(|err| tls_init_error(pem_errno(&err), cert_path, key_path))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| tls_init_error(pem_errno(&err), cert_path, key_path))?;
    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|err| tls_init_error(pem_errno(&err), cert_path, key_path))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| {
            tracing::error!(target: "lumen::transport", "TLS 协议配置失败: {err}");
            tls_init_error(-1, cert_path, key_path)
        })?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| {
            tracing::error!(target: "lumen::transport", "证书/私钥不匹配或非法: {err}");
            tls_init_error(-1, cert_path, key_path)
        })?;
    Ok(Arc::new(config))
}

fn libc_epipe() -> i32 {
    #[cfg(target_os = "linux")]
    {
        libc::EPIPE
    }
    #[cfg(not(target_os = "linux"))]
    {
        32
    }
}
