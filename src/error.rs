use http::StatusCode;
use std::{error::Error as StdError, fmt, io::Error as IoError, result};
use thiserror::Error as ThisError;

/// 错误类别
///
/// 类别决定错误是否可以通过换一台主机重试来恢复，
/// 参见 [`Error::is_retryable`]。
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// 传输层错误，包含连接建立、读写与超时
    #[error("transport error")]
    Transport,

    /// 服务端暂时性错误（5xx 或 429），换一台主机重试可能恢复
    #[error("transient status code {0}")]
    ServerTransient(StatusCode),

    /// 服务端终结性错误（除 416 外的 4xx），重试没有意义
    #[error("terminal status code {0}")]
    ServerTerminal(StatusCode),

    /// 凭证缺失、非法或已过期
    #[error("authorization rejected")]
    Auth,

    /// 206 响应缺失或携带非法的 Content-Range
    #[error("invalid content range")]
    RangeProtocol,

    /// 本地文件、锁或序列化操作错误
    #[error("local i/o error")]
    LocalIo,

    /// 多集群路由表中找不到对象键对应的配置
    #[error("no config for key")]
    UndefinedConfig,

    /// 被咨询的主机池为空
    #[error("no hosts configured")]
    NoHosts,
}

type BoxedError = Box<dyn StdError + Send + Sync>;

/// 错误，由类别与来源组成
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: BoxedError,
}

/// 结果
pub type Result<T> = result::Result<T, Error>;

impl Error {
    /// 从类别与来源创建错误
    #[inline]
    pub fn new(kind: ErrorKind, source: impl Into<BoxedError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    /// 从类别与描述信息创建错误
    #[inline]
    pub fn with_msg(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            source: msg.into().into(),
        }
    }

    /// 获取错误类别
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 该错误是否值得换一台主机重试
    ///
    /// 传输层错误与服务端暂时性错误可以重试，其余类别一律终结。
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Transport | ErrorKind::ServerTransient(_)
        )
    }

    /// 按照状态码分类意外响应
    ///
    /// 5xx 与 429 归为暂时性，401 / 403 归为凭证错误，其余归为终结性。
    pub fn from_status(status: StatusCode) -> Self {
        let kind = if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            ErrorKind::ServerTransient(status)
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            ErrorKind::Auth
        } else {
            ErrorKind::ServerTerminal(status)
        };
        Self::with_msg(kind, format!("unexpected status code {}", status))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.source)
    }
}

impl StdError for Error {
    #[inline]
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl From<IoError> for Error {
    #[inline]
    fn from(err: IoError) -> Self {
        Self::new(ErrorKind::LocalIo, err)
    }
}

impl From<Error> for IoError {
    #[inline]
    fn from(err: Error) -> Self {
        IoError::new(std::io::ErrorKind::Other, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::with_msg(ErrorKind::Transport, "reset").is_retryable());
        assert!(Error::from_status(StatusCode::SERVICE_UNAVAILABLE).is_retryable());
        assert!(Error::from_status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!Error::from_status(StatusCode::NOT_FOUND).is_retryable());
        assert!(!Error::from_status(StatusCode::UNAUTHORIZED).is_retryable());
        assert!(!Error::with_msg(ErrorKind::NoHosts, "empty pool").is_retryable());
        assert!(!Error::with_msg(ErrorKind::UndefinedConfig, "k").is_retryable());
    }

    #[test]
    fn test_status_kinds() {
        assert_eq!(
            Error::from_status(StatusCode::BAD_GATEWAY).kind(),
            ErrorKind::ServerTransient(StatusCode::BAD_GATEWAY)
        );
        assert_eq!(
            Error::from_status(StatusCode::FORBIDDEN).kind(),
            ErrorKind::Auth
        );
        assert_eq!(
            Error::from_status(StatusCode::CONFLICT).kind(),
            ErrorKind::ServerTerminal(StatusCode::CONFLICT)
        );
    }
}
