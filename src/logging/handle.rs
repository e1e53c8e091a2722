use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Instant,
};

use tracing_appender::non_blocking::WorkerGuard;

/// Handle для управления lifecycle логирования.
///
/// Держит `WorkerGuard` файлового вывода: пока handle жив, фоновый поток
/// дописывает буфер в файл.
pub struct LoggingHandle {
    file_guard: Option<WorkerGuard>,
    flush_count: AtomicU64,
    shutdown_in_progress: AtomicBool,
}

impl LoggingHandle {
    pub fn new(file_guard: Option<WorkerGuard>) -> Self {
        Self {
            file_guard,
            flush_count: AtomicU64::new(0),
            shutdown_in_progress: AtomicBool::new(false),
        }
    }

    pub fn has_file_sink(&self) -> bool {
        self.file_guard.is_some()
    }

    /// Отмечает запрос на flush. Неблокирующий writer сбрасывает буфер сам.
    pub fn flush(&self) {
        let count = self.flush_count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(flush_count = count, "Logging flush requested");
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Relaxed)
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        self.shutdown_in_progress.load(Ordering::Acquire)
    }

    /// Завершает логирование: сбрасывает файловый буфер и ждёт фоновый
    /// поток записи.
    pub fn shutdown(mut self) {
        self.shutdown_in_progress.store(true, Ordering::Release);
        tracing::info!("Logging shutdown");

        let start = Instant::now();
        drop(self.file_guard.take());
        let elapsed = start.elapsed();
        if elapsed.as_secs() >= 1 {
            eprintln!("Logging shutdown took {}ms", elapsed.as_millis());
        }
    }
}
