use std::time::Duration;

use crate::error::SecureChannelError;

/// 单个缓冲允许增长到的默认上限（4 MiB）。
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;
/// 关闭阶段等待对端关闭告警的默认时长。
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(50);
/// 关闭阶段两次轮询之间的间隔。
pub const DEFAULT_CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// 驱动循环中允许出现的连续“无进展”步数。
pub const DEFAULT_MAX_IDLE_STEPS: usize = 64;

/// 安全通道的可调参数。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把缓冲初始容量、增长上限、关闭等待时长集中到一处，调用方可以按部署环境调整，
///   而不需要触碰握手状态机本身。
///
/// ## 逻辑 (How)
/// - 采用 `const fn new` + `with_*` 的构建器风格；未显式设置的初始容量为 `None`，
///   表示“沿用安全引擎报告的包/明文尺寸”；
/// - [`SecureChannelConfig::validate`] 在打开通道时执行一次，拒绝自相矛盾的组合。
///
/// ## 契约 (What)
/// - `max_buffer_size` 同时约束四个缓冲；超过上限的增长请求以
///   [`SecureChannelError::BufferLimit`] 失败；
/// - `close_timeout` 为零时，关闭流程只发送本端关闭告警，不等待对端回应。
///
/// ## 风险与权衡 (Trade-offs)
/// - 关闭等待在持锁状态下轮询，超时越长，其他线程在关闭期间被阻塞得越久。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecureChannelConfig {
    initial_network_buffer: Option<usize>,
    initial_application_buffer: Option<usize>,
    max_buffer_size: usize,
    close_timeout: Duration,
    close_poll_interval: Duration,
    max_idle_steps: usize,
}

impl SecureChannelConfig {
    pub const fn new() -> Self {
        Self {
            initial_network_buffer: None,
            initial_application_buffer: None,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            close_poll_interval: DEFAULT_CLOSE_POLL_INTERVAL,
            max_idle_steps: DEFAULT_MAX_IDLE_STEPS,
        }
    }

    /// 覆盖网络侧缓冲（入站/出站密文）的初始容量。
    pub fn with_initial_network_buffer(mut self, bytes: usize) -> Self {
        self.initial_network_buffer = Some(bytes);
        self
    }

    /// 覆盖应用侧缓冲（入站/出站明文）的初始容量。
    pub fn with_initial_application_buffer(mut self, bytes: usize) -> Self {
        self.initial_application_buffer = Some(bytes);
        self
    }

    pub fn with_max_buffer_size(mut self, bytes: usize) -> Self {
        self.max_buffer_size = bytes;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_close_poll_interval(mut self, interval: Duration) -> Self {
        self.close_poll_interval = interval;
        self
    }

    pub fn with_max_idle_steps(mut self, steps: usize) -> Self {
        self.max_idle_steps = steps;
        self
    }

    pub fn initial_network_buffer(&self) -> Option<usize> {
        self.initial_network_buffer
    }

    pub fn initial_application_buffer(&self) -> Option<usize> {
        self.initial_application_buffer
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    pub fn close_poll_interval(&self) -> Duration {
        self.close_poll_interval
    }

    pub fn max_idle_steps(&self) -> usize {
        self.max_idle_steps
    }

    /// 校验参数组合是否自洽。
    pub fn validate(&self) -> Result<(), SecureChannelError> {
        if self.max_buffer_size == 0 {
            return Err(SecureChannelError::Configuration(
                "max_buffer_size must be greater than zero".into(),
            ));
        }
        for (name, initial) in [
            ("initial_network_buffer", self.initial_network_buffer),
            ("initial_application_buffer", self.initial_application_buffer),
        ] {
            match initial {
                Some(0) => {
                    return Err(SecureChannelError::Configuration(
                        format!("{name} must be greater than zero").into(),
                    ));
                }
                Some(bytes) if bytes > self.max_buffer_size => {
                    return Err(SecureChannelError::Configuration(
                        format!(
                            "{name} ({bytes}) exceeds max_buffer_size ({})",
                            self.max_buffer_size
                        )
                        .into(),
                    ));
                }
                _ => {}
            }
        }
        if self.max_idle_steps == 0 {
            return Err(SecureChannelError::Configuration(
                "max_idle_steps must be greater than zero".into(),
            ));
        }
        if self.close_poll_interval.is_zero() && !self.close_timeout.is_zero() {
            return Err(SecureChannelError::Configuration(
                "close_poll_interval must be non-zero when close_timeout is set".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SecureChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}
