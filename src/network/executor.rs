use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use simbus_error::ExecutorError;
use tokio::{
    runtime::{Builder, Handle, Runtime},
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, error, info};

/// Параметры исполнителя ввода-вывода.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Число рабочих потоков runtime (по умолчанию число CPU)
    pub worker_threads: usize,
    /// Префикс имени рабочих потоков
    pub thread_name: String,
    /// Сколько ждать завершения задач при остановке
    pub shutdown_timeout_ms: u64,
}

/// Общий контекст асинхронного ввода-вывода.
///
/// Все соединения, серверы и брокер запускают свои задачи через один
/// `IoExecutor`. Это явный сервисный объект, а не глобальная переменная:
/// в одном процессе (например, в тестах) их может быть несколько.
///
/// Два режима:
/// - [`IoExecutor::new`] создаёт собственный многопоточный runtime при
///   первом использовании;
/// - [`IoExecutor::attached`] использует уже работающий runtime (например,
///   внутри `#[tokio::main]`).
///
/// `stop` отменяет все задачи, запущенные через исполнитель, и безопасен
/// даже если `start` ни разу не вызывался.
#[derive(Clone)]
pub struct IoExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    config: ExecutorConfig,
    attached: Option<Handle>,
    state: Mutex<ExecutorState>,
    tasks: Mutex<Vec<AbortHandle>>,
}

enum ExecutorState {
    Idle,
    Running {
        runtime: Option<Runtime>,
        handle: Handle,
    },
    Stopped,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl IoExecutor {
    /// Исполнитель с собственным runtime. Runtime создаётся лениво.
    pub fn new(config: ExecutorConfig) -> Self {
        Self::with_parts(config, None)
    }

    /// Исполнитель поверх существующего runtime.
    pub fn attached(handle: Handle) -> Self {
        Self::with_parts(ExecutorConfig::default(), Some(handle))
    }

    fn with_parts(
        config: ExecutorConfig,
        attached: Option<Handle>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                config,
                attached,
                state: Mutex::new(ExecutorState::Idle),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Запускает исполнитель. Повторный вызов возвращает тот же handle.
    ///
    /// После `stop` собственный runtime можно запустить заново.
    ///
    /// # Возвращает
    /// - `Handle` работающего runtime
    /// - `ExecutorError::StartFailed`, если runtime не удалось построить.
    ///   Это фатальная ошибка для процесса.
    pub fn start(&self) -> Result<Handle, ExecutorError> {
        let mut state = self.inner.state.lock();
        if let ExecutorState::Running { handle, .. } = &*state {
            return Ok(handle.clone());
        }

        let (runtime, handle) = match &self.inner.attached {
            Some(handle) => (None, handle.clone()),
            None => {
                let runtime = self.build_runtime()?;
                let handle = runtime.handle().clone();
                (Some(runtime), handle)
            }
        };

        info!(
            owned = runtime.is_some(),
            worker_threads = self.inner.config.worker_threads,
            "I/O executor started"
        );

        *state = ExecutorState::Running {
            runtime,
            handle: handle.clone(),
        };
        Ok(handle)
    }

    fn build_runtime(&self) -> Result<Runtime, ExecutorError> {
        let config = &self.inner.config;
        Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()
            .map_err(|e| {
                error!("Failed to build I/O runtime: {e}");
                ExecutorError::StartFailed {
                    reason: e.to_string(),
                }
            })
    }

    /// Handle runtime. Запускает исполнитель при первом обращении.
    ///
    /// # Возвращает
    /// - `ExecutorError::Stopped`, если исполнитель был остановлен
    pub fn handle(&self) -> Result<Handle, ExecutorError> {
        {
            let state = self.inner.state.lock();
            match &*state {
                ExecutorState::Running { handle, .. } => return Ok(handle.clone()),
                ExecutorState::Stopped => return Err(ExecutorError::Stopped),
                ExecutorState::Idle => {}
            }
        }
        self.start()
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.inner.state.lock(), ExecutorState::Running { .. })
    }

    /// Запускает задачу на исполнителе и запоминает её для отмены при
    /// остановке.
    pub fn spawn<F>(
        &self,
        future: F,
    ) -> Result<JoinHandle<F::Output>, ExecutorError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = self.handle()?;
        let join = handle.spawn(future);

        let mut tasks = self.inner.tasks.lock();
        if !self.is_running() {
            join.abort();
            return Err(ExecutorError::Stopped);
        }
        tasks.retain(|task| !task.is_finished());
        tasks.push(join.abort_handle());

        Ok(join)
    }

    /// Выполняет future до завершения из синхронного кода.
    ///
    /// # Примечание
    /// Нельзя вызывать изнутри асинхронного контекста.
    pub fn block_on<F: Future>(
        &self,
        future: F,
    ) -> Result<F::Output, ExecutorError> {
        let handle = self.handle()?;
        Ok(handle.block_on(future))
    }

    /// Останавливает исполнитель: отменяет запущенные задачи и завершает
    /// собственный runtime. Повторный вызов ничего не делает.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), ExecutorState::Stopped);

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        let cancelled = tasks.iter().filter(|task| !task.is_finished()).count();
        for task in tasks {
            task.abort();
        }

        match previous {
            ExecutorState::Running {
                runtime: Some(runtime),
                ..
            } => {
                shutdown_runtime(
                    runtime,
                    Duration::from_millis(self.inner.config.shutdown_timeout_ms),
                );
                info!(cancelled, "I/O executor stopped");
            }
            ExecutorState::Running { runtime: None, .. } => {
                info!(cancelled, "I/O executor detached");
            }
            ExecutorState::Idle | ExecutorState::Stopped => {
                debug!("I/O executor stop requested while not running");
            }
        }
    }
}

/// Завершает runtime. Изнутри асинхронного контекста блокирующее ожидание
/// запрещено, поэтому там используется фоновое завершение.
fn shutdown_runtime(
    runtime: Runtime,
    timeout: Duration,
) {
    if Handle::try_current().is_ok() {
        runtime.shutdown_background();
    } else {
        runtime.shutdown_timeout(timeout);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().max(1),
            thread_name: "simbus-io".to_string(),
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl std::fmt::Debug for IoExecutor {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("IoExecutor")
            .field("attached", &self.inner.attached.is_some())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for ExecutorInner {
    fn drop(&mut self) {
        let state = std::mem::replace(self.state.get_mut(), ExecutorState::Stopped);
        if let ExecutorState::Running {
            runtime: Some(runtime),
            ..
        } = state
        {
            runtime.shutdown_background();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
