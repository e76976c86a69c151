//! 安全通道错误模型。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 把“传输层 I/O 失败”“安全引擎拒绝”“缓冲上限”“生命周期误用”四类失败显式区分，
//!   让调用方无需解析文案即可决定是重建连接还是修正调用顺序；
//! - 通道进入终止态后，需要对后续每一次 `read`/`write`/`connect` 返回**同一个**错误，
//!   因此错误本身必须可克隆（底层 `io::Error` 以 `Arc` 共享）。
//!
//! ## 逻辑（How）
//! - `OperationKind` 描述触发失败的操作（握手/读/写/刷新/连接/关闭/任务）及其稳定错误码；
//! - [`SecureChannelError`] 的每个变体都能给出稳定错误码（[`SecureChannelError::code`]）与
//!   对应的 [`io::ErrorKind`]（[`SecureChannelError::io_kind`]）；
//! - 对外暴露 `std::io` 接口时，错误被包装进 `io::Error` 的 source，调用方可通过
//!   [`SecureChannelError::from_io`] 还原结构化错误。
//!
//! ## 契约（What）
//! - `Transport`/`Protocol`/`BufferLimit` 为终止性错误：通道随即进入 broken 状态；
//! - `Closed`/`NotConnected`/`AlreadyConnected`/`Configuration` 描述调用方误用，不改变通道状态；
//! - “缓冲不足”与“would-block”永远不会以错误形式出现。
//!
//! ## 风险与权衡（Trade-offs）
//! - 终止错误以克隆方式重复返回，`io::Error` 的原始所有权无法交还调用方，只能通过引用访问。

use std::{borrow::Cow, fmt, io, sync::Arc};

use crate::{buffer::BufferKind, engine::EngineError};

/// 描述一次通道操作的错误码及默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message)
    }
}

pub const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.secure_channel.handshake_failed",
    message: "secure channel handshake",
};

pub const READ: OperationKind = OperationKind {
    code: "spark.secure_channel.read_failed",
    message: "secure channel read",
};

pub const WRITE: OperationKind = OperationKind {
    code: "spark.secure_channel.write_failed",
    message: "secure channel write",
};

pub const FLUSH: OperationKind = OperationKind {
    code: "spark.secure_channel.flush_failed",
    message: "secure channel flush",
};

pub const CONNECT: OperationKind = OperationKind {
    code: "spark.secure_channel.connect_failed",
    message: "secure channel connect",
};

pub const CLOSE: OperationKind = OperationKind {
    code: "spark.secure_channel.close_failed",
    message: "secure channel close",
};

pub const TASK: OperationKind = OperationKind {
    code: "spark.secure_channel.task_failed",
    message: "secure channel handshake task",
};

const PROTOCOL_CODE: &str = "spark.secure_channel.protocol_violation";
const BUFFER_LIMIT_CODE: &str = "spark.secure_channel.buffer_limit";
const CLOSED_CODE: &str = "spark.secure_channel.closed";
const NOT_CONNECTED_CODE: &str = "spark.secure_channel.not_connected";
const ALREADY_CONNECTED_CODE: &str = "spark.secure_channel.already_connected";
const CONFIGURATION_CODE: &str = "spark.secure_channel.configuration";

/// 安全通道的结构化错误。
#[derive(Clone, Debug, thiserror::Error)]
pub enum SecureChannelError {
    /// 底层传输读写或连接失败，原样保留 `io::Error`。
    #[error("{op}: transport failure: {source}")]
    Transport {
        op: OperationKind,
        source: Arc<io::Error>,
    },
    /// 安全引擎拒绝了记录、证书或握手消息；委派任务失败同样归入此类。
    #[error("{op}: protocol failure: {source}")]
    Protocol {
        op: OperationKind,
        source: EngineError,
    },
    /// 缓冲增长超过配置上限，视同分配失败。
    #[error("{kind} buffer cannot grow to {requested} bytes (limit {limit})")]
    BufferLimit {
        kind: BufferKind,
        requested: usize,
        limit: usize,
    },
    #[error("{op}: channel is closed")]
    Closed { op: OperationKind },
    #[error("{op}: channel is not connected")]
    NotConnected { op: OperationKind },
    #[error("{op}: channel is already connected")]
    AlreadyConnected { op: OperationKind },
    #[error("secure channel configuration: {0}")]
    Configuration(Cow<'static, str>),
}

impl SecureChannelError {
    pub(crate) fn transport(op: OperationKind, error: io::Error) -> Self {
        Self::Transport {
            op,
            source: Arc::new(error),
        }
    }

    pub(crate) fn protocol(op: OperationKind, error: EngineError) -> Self {
        Self::Protocol { op, source: error }
    }

    /// 稳定错误码，供日志与告警规则匹配。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport { op, .. } => op.code,
            Self::Protocol { .. } => PROTOCOL_CODE,
            Self::BufferLimit { .. } => BUFFER_LIMIT_CODE,
            Self::Closed { .. } => CLOSED_CODE,
            Self::NotConnected { .. } => NOT_CONNECTED_CODE,
            Self::AlreadyConnected { .. } => ALREADY_CONNECTED_CODE,
            Self::Configuration(_) => CONFIGURATION_CODE,
        }
    }

    /// 是否为协议类失败（含证书校验失败与委派任务失败）。
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }

    /// 终止性错误会让通道进入 broken 状态。
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Protocol { .. } | Self::BufferLimit { .. }
        )
    }

    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::Transport { source, .. } => source.kind(),
            Self::Protocol { .. } => io::ErrorKind::InvalidData,
            Self::BufferLimit { .. } => io::ErrorKind::OutOfMemory,
            Self::Closed { .. } | Self::NotConnected { .. } => io::ErrorKind::NotConnected,
            Self::AlreadyConnected { .. } => io::ErrorKind::AlreadyExists,
            Self::Configuration(_) => io::ErrorKind::InvalidInput,
        }
    }

    /// 从 `io::Error` 中还原由本 crate 产生的结构化错误。
    pub fn from_io(error: &io::Error) -> Option<&SecureChannelError> {
        error.get_ref()?.downcast_ref::<SecureChannelError>()
    }
}

impl From<SecureChannelError> for io::Error {
    fn from(error: SecureChannelError) -> Self {
        io::Error::new(error.io_kind(), error)
    }
}

pub(crate) fn would_block() -> io::Error {
    io::Error::from(io::ErrorKind::WouldBlock)
}
