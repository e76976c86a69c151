//! 委派任务调度。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 证书链校验等计算可能耗时数毫秒，若在 selector 线程上同步执行，会拖慢同一轮询线程上的全部连接；
//! - 因此引擎交出的 [`DelegatedTask`] 被提交到执行器，完成后通过回调通知通道继续握手。
//!
//! ## 逻辑（How）
//! - [`TaskExecutor`] 是执行器接缝：`tokio::runtime::Handle` 以 `spawn_blocking` 执行，
//!   [`InlineExecutor`] 在提交线程上立即执行，[`DefaultTaskPool`] 是进程级惰性创建的共享池；
//! - [`TaskDispatcher::submit`] 在执行器上运行任务，捕获 panic 并转换为 [`EngineError::Task`]，
//!   然后把结果交给完成回调；
//! - [`TaskHandle`] 供调用方观察任务是否已经结束。
//!
//! ## 契约（What）
//! - 完成回调恰好被调用一次，并且在任务所在的执行器线程上调用；
//! - 调度器本身不持有通道锁，回调负责自行加锁并判断通道是否仍然存活。
//!
//! ## 风险与权衡（Trade-offs）
//! - 默认池一旦创建便伴随进程存活，不提供显式关闭入口；需要可控生命周期的调用方应注入自己的执行器。

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::runtime::{Builder, Handle, Runtime};

use crate::{
    engine::{DelegatedTask, EngineError},
    error::SecureChannelError,
};

/// 提交给执行器的工作单元。
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// 默认共享池允许的最大阻塞线程数。
pub const DEFAULT_POOL_THREADS: usize = 4;

/// 任务执行器接缝。
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, job: Job);
}

impl TaskExecutor for Handle {
    fn execute(&self, job: Job) {
        drop(self.spawn_blocking(job));
    }
}

/// 在提交线程上同步执行任务。
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

/// 进程级共享的任务池，基于 Tokio 的阻塞线程池。
pub struct DefaultTaskPool {
    runtime: Runtime,
}

impl DefaultTaskPool {
    /// 返回进程级共享池，首次调用时创建。
    pub fn shared() -> Result<Arc<DefaultTaskPool>, SecureChannelError> {
        static SHARED: OnceLock<Arc<DefaultTaskPool>> = OnceLock::new();
        if let Some(pool) = SHARED.get() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(Self::build()?);
        Ok(Arc::clone(SHARED.get_or_init(|| pool)))
    }

    fn build() -> Result<Self, SecureChannelError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(DEFAULT_POOL_THREADS)
            .thread_name("spark-secure-task")
            .build()
            .map_err(|err| {
                SecureChannelError::Configuration(
                    format!("failed to start handshake task pool: {err}").into(),
                )
            })?;
        tracing::debug!(
            threads = DEFAULT_POOL_THREADS,
            "started shared handshake task pool"
        );
        Ok(Self { runtime })
    }
}

impl TaskExecutor for DefaultTaskPool {
    fn execute(&self, job: Job) {
        drop(self.runtime.spawn_blocking(job));
    }
}

impl fmt::Debug for DefaultTaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultTaskPool").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct TaskState {
    label: &'static str,
    finished: AtomicBool,
    failed: AtomicBool,
}

/// 已提交任务的观察句柄。
#[derive(Clone, Debug)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    fn new(label: &'static str) -> Self {
        Self {
            state: Arc::new(TaskState {
                label,
                finished: AtomicBool::new(false),
                failed: AtomicBool::new(false),
            }),
        }
    }

    pub fn label(&self) -> &'static str {
        self.state.label
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }

    /// 任务已结束且以失败告终。
    pub fn is_failed(&self) -> bool {
        self.is_finished() && self.state.failed.load(Ordering::Acquire)
    }

    fn mark_finished(&self, failed: bool) {
        self.state.failed.store(failed, Ordering::Release);
        self.state.finished.store(true, Ordering::Release);
    }
}

/// 把委派任务投递到执行器并回调结果。
#[derive(Clone)]
pub struct TaskDispatcher {
    executor: Arc<dyn TaskExecutor>,
}

impl TaskDispatcher {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self { executor }
    }

    /// 使用进程级共享池。
    pub fn shared_default() -> Result<Self, SecureChannelError> {
        let pool: Arc<dyn TaskExecutor> = DefaultTaskPool::shared()?;
        Ok(Self::new(pool))
    }

    pub fn submit<F>(&self, task: DelegatedTask, on_complete: F) -> TaskHandle
    where
        F: FnOnce(Result<(), EngineError>) + Send + 'static,
    {
        let handle = TaskHandle::new(task.label());
        let state = handle.clone();
        self.executor.execute(Box::new(move || {
            let label = task.label();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.run()))
                .unwrap_or_else(|payload| {
                    Err(EngineError::Task(
                        format!("task `{label}` panicked: {}", panic_message(payload.as_ref())).into(),
                    ))
                });
            if let Err(error) = &outcome {
                tracing::debug!(task = label, %error, "handshake task failed");
            }
            state.mark_finished(outcome.is_err());
            on_complete(outcome);
        }));
        handle
    }
}

impl fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDispatcher").finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
