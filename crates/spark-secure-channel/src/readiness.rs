//! 把握手状态翻译为 selector 关注的事件。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 应用把安全通道注册到 `mio::Poll` 时只声明“我想读/写”，但握手期间通道真正需要的事件
//!   由引擎状态决定：需要写出握手字节时必须关注可写，等待对端消息时必须关注可读，
//!   委派任务执行期间则不应被任何事件唤醒；
//! - 如果直接沿用应用的兴趣集合，握手会因等不到事件而停滞。
//!
//! ## 逻辑（How）
//! - [`required_interest`] 是纯函数：输入通道状态快照 [`ReadinessInputs`]，输出应注册的兴趣集合，
//!   `None` 表示暂时从 selector 注销；
//! - `ReadinessAdapter` 记录 registry、token 与当前已生效的兴趣，仅在兴趣变化时调用
//!   `register`/`reregister`/`deregister`；委派任务完成后重新注册，即可在底层 socket 就绪时触发一次事件。
//!
//! ## 契约（What）
//! - 任务挂起 → `None`；
//! - 正在连接或存在待刷出密文 → 包含 `WRITABLE`（握手期间只含 `WRITABLE`）；
//! - 握手中 `NeedWrap` → `WRITABLE`，`NeedUnwrap` → `READABLE`；
//! - 握手完成后 → 应用兴趣，并按需并入握手后消息与待加密明文所需的事件；
//! - 握手完成后通道内仍缓冲着明文、应用又关注可读时 → 并入 `WRITABLE`：这些明文不会再让 socket
//!   变为可读，借可写事件让 selector 尽快唤醒调用方取走。
//!
//! ## 风险与权衡（Trade-offs）
//! - `mio` 采用边沿触发，兴趣未变化时不会重复注册；调用方仍需遵循“操作直到 would-block”的惯例。

use std::io;

use mio::{Interest, Registry, Token, event::Source};

use crate::engine::HandshakeStatus;

/// 计算兴趣集合所需的通道状态快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadinessInputs {
    pub status: HandshakeStatus,
    /// 握手已经开始。
    pub started: bool,
    /// 握手已经完成。
    pub established: bool,
    /// 底层连接仍在建立中。
    pub connecting: bool,
    /// 有委派任务尚未完成。
    pub task_pending: bool,
    pub network_outbound_pending: bool,
    pub application_outbound_pending: bool,
    /// 已解密、尚未交付的明文（通道缓冲或引擎内部）。
    pub inbound_plaintext_buffered: bool,
    /// 应用注册时声明的兴趣。
    pub application_interest: Option<Interest>,
}

/// 根据通道状态推导应向 selector 注册的兴趣集合。
pub fn required_interest(inputs: &ReadinessInputs) -> Option<Interest> {
    if inputs.task_pending {
        return None;
    }
    if inputs.connecting {
        return Some(Interest::WRITABLE);
    }
    if inputs.started && !inputs.established {
        if inputs.network_outbound_pending {
            return Some(Interest::WRITABLE);
        }
        return match inputs.status {
            HandshakeStatus::NeedWrap => Some(Interest::WRITABLE),
            HandshakeStatus::NeedTask => None,
            _ => Some(Interest::READABLE),
        };
    }

    let mut interest = inputs.application_interest;
    if inputs.established {
        if inputs.network_outbound_pending
            || inputs.application_outbound_pending
            || inputs.status == HandshakeStatus::NeedWrap
        {
            interest = merge(interest, Interest::WRITABLE);
        }
        if inputs.status == HandshakeStatus::NeedUnwrap {
            interest = merge(interest, Interest::READABLE);
        }
        if inputs.inbound_plaintext_buffered
            && inputs
                .application_interest
                .is_some_and(|wanted| wanted.is_readable())
        {
            interest = merge(interest, Interest::WRITABLE);
        }
    }
    interest
}

fn merge(current: Option<Interest>, extra: Interest) -> Option<Interest> {
    Some(match current {
        Some(interest) => interest | extra,
        None => extra,
    })
}

/// 在 selector 上同步一个事件源的注册状态。
pub(crate) type SyncFn<T> =
    fn(&mut T, &Registry, Token, Option<Interest>, Option<Interest>) -> io::Result<()>;

/// 以 `active` → `desired` 的差异调用 `register`/`reregister`/`deregister`。
pub(crate) fn sync_source<S: Source>(
    source: &mut S,
    registry: &Registry,
    token: Token,
    active: Option<Interest>,
    desired: Option<Interest>,
) -> io::Result<()> {
    match (active, desired) {
        (None, Some(interest)) => registry.register(source, token, interest),
        (Some(_), Some(interest)) => registry.reregister(source, token, interest),
        (Some(_), None) => registry.deregister(source),
        (None, None) => Ok(()),
    }
}

struct Registration<T> {
    registry: Registry,
    token: Token,
    active: Option<Interest>,
    dirty: bool,
    sync: SyncFn<T>,
}

/// 记录 selector 注册信息，并把推导出的兴趣同步到 selector。
pub(crate) struct ReadinessAdapter<T> {
    registration: Option<Registration<T>>,
    application: Option<Interest>,
    desired: Option<Interest>,
}

impl<T> ReadinessAdapter<T> {
    pub(crate) fn new() -> Self {
        Self {
            registration: None,
            application: None,
            desired: None,
        }
    }

    pub(crate) fn application_interest(&self) -> Option<Interest> {
        self.application
    }

    /// 最近一次推导出的兴趣集合。
    pub(crate) fn desired(&self) -> Option<Interest> {
        self.desired
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// 记录（或更新）应用的注册信息；真正的系统调用推迟到下一次 [`Self::apply`]。
    pub(crate) fn bind(
        &mut self,
        registry: Registry,
        token: Token,
        interest: Interest,
        sync: SyncFn<T>,
    ) {
        let active = self
            .registration
            .take()
            .and_then(|previous| previous.active);
        self.application = Some(interest);
        self.registration = Some(Registration {
            registry,
            token,
            active,
            dirty: true,
            sync,
        });
    }

    /// 从 selector 注销并遗忘注册信息。
    pub(crate) fn unbind(&mut self, transport: Option<&mut T>) -> io::Result<()> {
        self.application = None;
        let Some(registration) = self.registration.take() else {
            return Ok(());
        };
        match (transport, registration.active) {
            (Some(transport), Some(active)) => (registration.sync)(
                transport,
                &registration.registry,
                registration.token,
                Some(active),
                None,
            ),
            _ => Ok(()),
        }
    }

    /// 把 `desired` 同步到 selector；无注册或无传输时只记录期望值。
    pub(crate) fn apply(
        &mut self,
        transport: Option<&mut T>,
        desired: Option<Interest>,
    ) -> io::Result<()> {
        self.desired = desired;
        let (Some(registration), Some(transport)) = (self.registration.as_mut(), transport)
        else {
            return Ok(());
        };
        if registration.active == desired && !registration.dirty {
            return Ok(());
        }
        (registration.sync)(
            transport,
            &registration.registry,
            registration.token,
            registration.active,
            desired,
        )?;
        tracing::trace!(
            token = registration.token.0,
            from = ?registration.active,
            to = ?desired,
            "secure channel interest updated"
        );
        registration.active = desired;
        registration.dirty = false;
        Ok(())
    }
}
