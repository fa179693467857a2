use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// 传输层错误域。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 构造期失败（绑定、TLS 初始化、发起连接）同步返回给调用方；
///   运行期读写失败只会关闭所在连接并记录日志，不再向调用方传播。
///
/// ## 契约（What）
/// - 携带原始 `errno` 的变体保证底层错误码可用于日志与告警归类；
///   无法取得 `errno` 时记为 `-1`；
/// - `TlsInitFailed` 按约定同时报告证书与私钥路径，便于部署排障。
#[derive(Debug, Error)]
pub enum TransportError {
    /// 监听地址已被占用（EADDRINUSE）。
    #[error("address already in use")]
    AddressInUse,

    /// 绑定/监听失败（EADDRINUSE 之外的系统错误）。
    #[error("bind failed (errno {0})")]
    BindFailed(i32),

    /// 发起出站连接失败。
    #[error("connect failed (errno {0})")]
    ConnectFailed(i32),

    /// TLS 会话初始化失败：证书或私钥不可用、配置非法等。
    #[error("failed to initialize TLS socket (code {code}) with keypair ({}, {})", cert_path.display(), key_path.display())]
    TlsInitFailed {
        code: i32,
        cert_path: PathBuf,
        key_path: PathBuf,
    },

    /// 运行期读取失败；流已被关闭。
    #[error("transport read error (errno {0})")]
    TransportReadError(i32),

    /// 运行期写入失败；流已被关闭。
    #[error("transport write error (errno {0})")]
    TransportWriteError(i32),

    /// 当前状态不允许该操作（如在已监听的流上再次监听）。
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// 该传输变体不支持的操作（如 TLS 客户端连接）。
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
}

/// 提取原始系统错误码；没有时退化为 `-1`。
pub(crate) fn errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 运行期读写失败归入各自的错误变体，日志里能看到原始 errno。
    #[test]
    fn runtime_errors_render_their_errno() {
        assert_eq!(
            TransportError::TransportReadError(104).to_string(),
            "transport read error (errno 104)"
        );
        assert_eq!(
            TransportError::TransportWriteError(32).to_string(),
            "transport write error (errno 32)"
        );
    }
}
