#![doc = r#"
# spark-secure-channel

## 设计动机（Why）
- **即插即用**：让加密通道在调用方眼里与普通非阻塞 socket 无异，`read`/`write` 要么推进、要么 would-block，
  并且可以直接注册到 `mio::Poll`；
- **不阻塞轮询线程**：握手中的耗时计算（证书校验等）以委派任务的形式交给工作线程，完成后自动恢复握手；
- **引擎可替换**：TLS 协议本身由实现 [`SecurityEngine`] 的引擎完成，默认提供基于 `rustls` 的实现。

## 核心契约（What）
- [`SecureChannel`]：安全通道门面，实现 `io::Read`、`io::Write` 与 `mio::event::Source`；
- [`SecureChannel::open`] 系列工厂与 [`OpenOptions`]：按需覆盖安全上下文、握手角色、任务执行器与底层传输；
- 握手完成前不交付、不接收任何明文；终止性错误使通道进入 broken 状态并被重复报告；
- [`required_interest`]：握手状态到 selector 兴趣集合的纯映射，委派任务挂起期间为 `None`。

## 实现策略（How）
- `buffer`：四个可增长缓冲（网络入站/出站、应用入站/出站），增长保留未读数据并受上限约束；
- `handshake`：每个握手状态一个转移函数，外层驱动循环把它与非阻塞传输拼接；
- `dispatch`：委派任务执行器接缝与进程级共享池；
- `readiness`：兴趣推导与 selector 重新注册；
- `channel` / `open`：门面、锁与生命周期管理、工厂入口。

## 风险与考量（Trade-offs）
- 每个通道一把互斥锁，读写并发调用会被串行化；
- `close` 会在配置的时限内等待对端关闭告警，是唯一可能短暂阻塞的调用。
"#]
#![cfg_attr(
    not(feature = "rustls"),
    doc = r#"## 功能开关：`rustls`

默认启用基于 `rustls` 的安全引擎与默认安全上下文；禁用后调用方必须通过 [`OpenOptions::with_context`]
显式注入 [`SecurityContext`]，否则工厂返回配置错误。
"#
)]

pub mod buffer;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
mod handshake;
pub mod open;
pub mod readiness;
pub mod transport;

pub use buffer::{BufferKind, BufferSet, IoBuffer};
pub use channel::SecureChannel;
pub use config::SecureChannelConfig;
pub use dispatch::{
    DEFAULT_POOL_THREADS, DefaultTaskPool, InlineExecutor, Job, TaskDispatcher, TaskExecutor,
    TaskHandle,
};
pub use engine::{
    ChannelMode, DelegatedTask, EngineError, EngineResult, EngineStatus, HandshakeStatus,
    SecurityContext, SecurityEngine,
};
#[cfg(feature = "rustls")]
pub use engine::rustls_engine::{RustlsContext, RustlsEngine, default_context};
pub use error::{OperationKind, SecureChannelError};
pub use open::OpenOptions;
pub use readiness::{ReadinessInputs, required_interest};
pub use transport::Transport;
