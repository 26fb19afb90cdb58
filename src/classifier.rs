//! Error classifier: maps any failure to a fixed taxonomy with a retryability
//! flag and the user-facing text the client sees. The underlying error detail
//! never leaks past this boundary.

use crate::types::ChatflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnknownError,
    NetworkError,
    TimeoutError,
    ApiKeyError,
    QuotaExceeded,
    InternalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub user_message: &'static str,
}

const UNKNOWN: Classification = Classification {
    kind: ErrorKind::UnknownError,
    retryable: false,
    user_message: "未知错误",
};
const NETWORK: Classification = Classification {
    kind: ErrorKind::NetworkError,
    retryable: true,
    user_message: "网络连接异常，请检查网络设置后重试",
};
const TIMEOUT: Classification = Classification {
    kind: ErrorKind::TimeoutError,
    retryable: true,
    user_message: "请求超时，请稍后重试",
};
const API_KEY: Classification = Classification {
    kind: ErrorKind::ApiKeyError,
    retryable: false,
    user_message: "API密钥配置错误，请联系管理员",
};
const QUOTA: Classification = Classification {
    kind: ErrorKind::QuotaExceeded,
    retryable: false,
    user_message: "API调用配额已用完，请稍后重试",
};
const INTERNAL: Classification = Classification {
    kind: ErrorKind::InternalError,
    retryable: true,
    user_message: "系统内部错误，请稍后重试",
};

/// Classify in fixed priority order: typed connection failures, typed
/// timeouts, then case-insensitive substring matches on the message. "model
/// not found" deliberately lands in the generic internal bucket; existing
/// client behavior depends on it staying retryable.
pub fn classify(error: Option<&ChatflowError>) -> Classification {
    let error = match error {
        Some(e) => e,
        None => return UNKNOWN,
    };

    if is_connection_error(error) {
        return NETWORK;
    }
    if is_timeout_error(error) {
        return TIMEOUT;
    }

    let message = error.to_string().to_lowercase();
    if message.contains("api key") {
        return API_KEY;
    }
    if message.contains("rate limit") {
        return QUOTA;
    }
    INTERNAL
}

fn is_connection_error(error: &ChatflowError) -> bool {
    match error {
        ChatflowError::Network(e) => e.is_connect(),
        ChatflowError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected
        ),
        _ => {
            let message = error.to_string().to_lowercase();
            message.contains("connection refused")
                || message.contains("unknown host")
                || message.contains("no route to host")
        }
    }
}

fn is_timeout_error(error: &ChatflowError) -> bool {
    match error {
        ChatflowError::Timeout(_) => true,
        ChatflowError::Network(e) => e.is_timeout(),
        ChatflowError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
        _ => {
            let message = error.to_string().to_lowercase();
            message.contains("timeout") || message.contains("timed out")
        }
    }
}
