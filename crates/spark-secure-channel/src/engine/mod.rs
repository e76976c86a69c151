//! 安全引擎抽象：通道与具体 TLS 实现之间的接缝。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 握手状态机只关心“引擎下一步需要什么”（写出、读入、执行任务），不关心具体协议细节；
//! - 通过 [`SecurityEngine`] 把 `rustls` 等实现隔离在适配器之后，测试可以注入确定性的玩具引擎。
//!
//! ## 逻辑（How）
//! - 引擎以“缓冲进、缓冲出”的方式工作：`wrap` 把明文加密进目标切片，`unwrap` 把密文解密进目标切片，
//!   每次调用返回 [`EngineResult`]，报告消费/产出字节数、结果状态与调用后的握手状态；
//! - 需要较长时间的计算（例如证书链校验）通过 [`SecurityEngine::delegated_task`] 交给调用方调度；
//! - [`SecurityContext`] 是引擎工厂，通道在首次 I/O 时才按角色与对端地址创建引擎。
//!
//! ## 契约（What）
//! - [`HandshakeStatus::Finished`] 只会出现在某一次 `wrap`/`unwrap` 的结果中，且每个会话仅出现一次；
//!   [`SecurityEngine::handshake_status`] 永远不返回它；
//! - 结果状态 `BufferOverflow` 表示目标空间不足，`BufferUnderflow` 表示源数据不足以构成一条完整记录，
//!   二者都不是错误；
//! - 引擎在上一个委派任务完成之前不会再交出新的任务。
//!
//! ## 风险与权衡（Trade-offs）
//! - `EngineError` 只保留文案与分类，原始错误类型在适配器边界被抹去，换取可克隆与跨线程传递。

use std::{borrow::Cow, fmt, net::SocketAddr};

#[cfg(feature = "rustls")]
pub mod rustls_engine;

/// 通道在握手中的角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ChannelMode {
    /// 主动发起握手。
    #[default]
    Client,
    /// 等待对端的第一轮握手消息。
    Server,
}

impl ChannelMode {
    pub fn is_client(&self) -> bool {
        matches!(self, Self::Client)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 引擎报告的握手进度。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandshakeStatus {
    /// 当前没有进行中的握手。
    NotHandshaking,
    /// 需要调用 `wrap` 产出握手字节。
    NeedWrap,
    /// 需要调用 `unwrap` 消费对端握手字节。
    NeedUnwrap,
    /// 需要执行一个委派任务后才能继续。
    NeedTask,
    /// 握手刚刚完成；只出现在一次操作结果中。
    Finished,
}

/// 单次 `wrap`/`unwrap` 的结果状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    Ok,
    /// 源数据不足以构成完整记录。
    BufferUnderflow,
    /// 目标空间不足以容纳产出。
    BufferOverflow,
    /// 该方向已关闭。
    Closed,
}

/// 单次 `wrap`/`unwrap` 的完整结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake_status: HandshakeStatus,
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
}

impl EngineResult {
    pub const fn new(
        status: EngineStatus,
        handshake_status: HandshakeStatus,
        bytes_consumed: usize,
        bytes_produced: usize,
    ) -> Self {
        Self {
            status,
            handshake_status,
            bytes_consumed,
            bytes_produced,
        }
    }

    /// 是否消费或产出了任何字节。
    pub fn made_progress(&self) -> bool {
        self.bytes_consumed > 0 || self.bytes_produced > 0
    }
}

/// 引擎拒绝操作的原因。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("malformed or unexpected record: {0}")]
    Protocol(Cow<'static, str>),
    #[error("peer certificate rejected: {0}")]
    Certificate(Cow<'static, str>),
    #[error("peer sent fatal alert: {0}")]
    Alert(Cow<'static, str>),
    #[error("delegated task failed: {0}")]
    Task(Cow<'static, str>),
    #[error("security engine misconfigured: {0}")]
    Configuration(Cow<'static, str>),
}

type TaskFn = Box<dyn FnOnce() -> Result<(), EngineError> + Send + 'static>;

/// 引擎交给调用方调度的一段计算。
pub struct DelegatedTask {
    label: &'static str,
    job: TaskFn,
}

impl DelegatedTask {
    pub fn new<F>(label: &'static str, job: F) -> Self
    where
        F: FnOnce() -> Result<(), EngineError> + Send + 'static,
    {
        Self {
            label,
            job: Box::new(job),
        }
    }

    /// 供日志使用的任务名称。
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn run(self) -> Result<(), EngineError> {
        (self.job)()
    }
}

impl fmt::Debug for DelegatedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedTask")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// 面向缓冲的安全引擎。
///
/// 所有方法都在通道内部锁下调用，因此实现只需 `Send`。
pub trait SecurityEngine: Send {
    /// 开始握手；客户端角色通常随即进入 `NeedWrap`，服务端进入 `NeedUnwrap`。
    fn begin_handshake(&mut self) -> Result<(), EngineError>;

    /// 当前握手状态，不会返回 [`HandshakeStatus::Finished`]。
    fn handshake_status(&self) -> HandshakeStatus;

    /// 加密 `src` 中的明文（握手期间可为空）写入 `dst`。
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError>;

    /// 解密 `src` 中的密文，明文写入 `dst`。
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError>;

    /// 取出一个待执行的委派任务。
    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    /// 请求发送关闭告警；随后的 `wrap` 负责产出告警字节。
    fn close_outbound(&mut self);

    /// 关闭告警已全部产出。
    fn is_outbound_done(&self) -> bool;

    /// 已收到对端关闭告警。
    fn is_inbound_done(&self) -> bool;

    /// 引擎内部仍有已解密、未交付的明文。
    ///
    /// 为 `true` 时，以空源调用 `unwrap` 即可取出这些明文，无需等待新的密文。
    fn has_buffered_plaintext(&self) -> bool {
        false
    }

    /// 单条密文记录的最大尺寸，用作网络侧缓冲的初始容量与扩容提示。
    fn packet_buffer_size(&self) -> usize;

    /// 单条记录可承载的最大明文尺寸，用作应用侧缓冲的初始容量与扩容提示。
    fn application_buffer_size(&self) -> usize;
}

/// 引擎工厂。
pub trait SecurityContext: Send + Sync {
    /// 为给定角色与对端地址创建一个新引擎。
    fn create_engine(
        &self,
        mode: ChannelMode,
        peer: Option<SocketAddr>,
    ) -> Result<Box<dyn SecurityEngine>, EngineError>;
}
