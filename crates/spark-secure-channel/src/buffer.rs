//! 安全通道的四个字节缓冲。
//!
//! # 模块定位（Why）
//! - 安全引擎每次 `wrap`/`unwrap` 都需要“待读取的源字节 + 可写入的目标空间”，
//!   通道为每个方向各维护一个网络侧（密文）与应用侧（明文）缓冲；
//! - 非阻塞 I/O 下每次读写都可能只完成一部分，未消费的字节必须跨调用保留。
//!
//! # 设计概要（How）
//! - [`IoBuffer`] 基于 `bytes::BytesMut`：已写入但未消费的字节即 `BytesMut` 的内容，
//!   消费通过 [`bytes::Buf::advance`] 完成，压缩借助 `BytesMut::reserve` 在原分配内回收前缀空间；
//! - 逻辑容量 `capacity` 与底层分配解耦：写入窗口 = `capacity - len`，扩容只修改逻辑容量并预留空间；
//! - [`BufferSet`] 把四个缓冲打包，按 [`BufferKind`] 寻址。
//!
//! # 契约（What）
//! - 扩容、压缩都不会丢失或重排未消费字节；
//! - 单次扩容至多把容量提升到 `max(2 × 当前容量, 未消费 + 所需)`，并受 `max_buffer_size` 约束，
//!   超限返回 [`SecureChannelError::BufferLimit`]。

use std::fmt;

use bytes::{Buf, BytesMut};

use crate::error::SecureChannelError;

/// 缓冲所属的方向与层次。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// 从传输读入、尚未解密的密文。
    NetworkInbound,
    /// 已加密、尚未写入传输的密文。
    NetworkOutbound,
    /// 已解密、尚未交付给应用的明文。
    ApplicationInbound,
    /// 应用已提交、尚未加密的明文。
    ApplicationOutbound,
}

impl BufferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkInbound => "network-inbound",
            Self::NetworkOutbound => "network-outbound",
            Self::ApplicationInbound => "application-inbound",
            Self::ApplicationOutbound => "application-outbound",
        }
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 可增长的字节缓冲，记录“已写未读”的区间。
#[derive(Debug)]
pub struct IoBuffer {
    kind: BufferKind,
    data: BytesMut,
    capacity: usize,
    limit: usize,
}

impl IoBuffer {
    /// 创建缓冲；初始容量被限制在 `1..=limit` 区间内。
    pub fn new(kind: BufferKind, capacity: usize, limit: usize) -> Self {
        let limit = limit.max(1);
        let capacity = capacity.clamp(1, limit);
        Self {
            kind,
            data: BytesMut::with_capacity(capacity),
            capacity,
            limit,
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 未消费的字节数。
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 写入窗口剩余的字节数。
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// 未消费字节的只读视图。
    pub fn unread(&self) -> &[u8] {
        &self.data
    }

    /// 标记前 `n` 个字节已被消费。
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.advance(n);
    }

    /// 把 `src` 尽可能多地追加到写入窗口，返回实际追加的字节数。
    pub fn extend_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data.extend_from_slice(&src[..n]);
        n
    }

    /// 把未消费字节复制到 `dst`，返回复制的字节数。
    pub fn take_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.data.len());
        dst[..n].copy_from_slice(&self.data[..n]);
        self.data.advance(n);
        if self.data.is_empty() {
            self.compact();
        }
        n
    }

    /// 把整个写入窗口交给 `fill`，由其返回实际写入的字节数与附带结果。
    ///
    /// `fill` 报告的字节数超过窗口时按窗口截断。
    pub fn write_with<R>(&mut self, fill: impl FnOnce(&mut [u8]) -> (usize, R)) -> R {
        let start = self.data.len();
        let window = self.remaining();
        self.data.resize(start + window, 0);
        let (written, outcome) = fill(&mut self.data[start..]);
        self.data.truncate(start + written.min(window));
        outcome
    }

    /// 把未消费字节移回分配起点，为写入窗口腾出连续空间。
    pub fn compact(&mut self) {
        let window = self.remaining();
        self.data.reserve(window);
    }

    /// 保证写入窗口至少有 `min_remaining` 字节。
    pub fn ensure_capacity(&mut self, min_remaining: usize) -> Result<(), SecureChannelError> {
        if self.remaining() >= min_remaining {
            return Ok(());
        }
        let needed = self.data.len().saturating_add(min_remaining);
        if needed > self.limit {
            return Err(SecureChannelError::BufferLimit {
                kind: self.kind,
                requested: needed,
                limit: self.limit,
            });
        }
        let grown = self.capacity.saturating_mul(2).max(needed).min(self.limit);
        tracing::trace!(
            buffer = %self.kind,
            from = self.capacity,
            to = grown,
            unread = self.data.len(),
            "growing secure channel buffer"
        );
        self.data.reserve(grown - self.data.len());
        self.capacity = grown;
        Ok(())
    }
}

/// 通道使用的四个缓冲。
#[derive(Debug)]
pub struct BufferSet {
    pub(crate) network_inbound: IoBuffer,
    pub(crate) network_outbound: IoBuffer,
    pub(crate) application_inbound: IoBuffer,
    pub(crate) application_outbound: IoBuffer,
}

impl BufferSet {
    pub fn new(network: usize, application: usize, limit: usize) -> Self {
        Self {
            network_inbound: IoBuffer::new(BufferKind::NetworkInbound, network, limit),
            network_outbound: IoBuffer::new(BufferKind::NetworkOutbound, network, limit),
            application_inbound: IoBuffer::new(BufferKind::ApplicationInbound, application, limit),
            application_outbound: IoBuffer::new(
                BufferKind::ApplicationOutbound,
                application,
                limit,
            ),
        }
    }

    pub fn get(&self, kind: BufferKind) -> &IoBuffer {
        match kind {
            BufferKind::NetworkInbound => &self.network_inbound,
            BufferKind::NetworkOutbound => &self.network_outbound,
            BufferKind::ApplicationInbound => &self.application_inbound,
            BufferKind::ApplicationOutbound => &self.application_outbound,
        }
    }

    pub fn get_mut(&mut self, kind: BufferKind) -> &mut IoBuffer {
        match kind {
            BufferKind::NetworkInbound => &mut self.network_inbound,
            BufferKind::NetworkOutbound => &mut self.network_outbound,
            BufferKind::ApplicationInbound => &mut self.application_inbound,
            BufferKind::ApplicationOutbound => &mut self.application_outbound,
        }
    }

    pub fn ensure_capacity(
        &mut self,
        kind: BufferKind,
        min_remaining: usize,
    ) -> Result<(), SecureChannelError> {
        self.get_mut(kind).ensure_capacity(min_remaining)
    }

    /// 写入窗口不足 `hint` 时扩容；窗口已足够但引擎仍报告溢出时，至少再扩一档。
    pub(crate) fn grow_for_overflow(
        &mut self,
        kind: BufferKind,
        hint: usize,
    ) -> Result<(), SecureChannelError> {
        let buffer = self.get_mut(kind);
        buffer.compact();
        let wanted = hint.max(buffer.remaining().saturating_add(1));
        buffer.ensure_capacity(wanted)
    }
}
