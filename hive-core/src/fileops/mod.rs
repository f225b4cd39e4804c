//! # 异步文件操作管理器
//!
//! 所有读写经由两个独立限并发的队列（读 / 写各一个信号量），
//! 约束同时打开的文件句柄数——这是磁盘 I/O 的背压机制。
//!
//! ## 契约
//! - 每个操作返回统一的 [`FileOpResult`]，从不抛出：批量调用方可以
//!   逐条检查部分失败，单个失败不会打断整批
//! - `write_json` / `read_json` 在解析失败时给出独立的
//!   [`FileOpError::InvalidFormat`]，而不是裸的解析异常
//! - `ensure_directory` 幂等，"已存在"视为成功
//! - 超过 `stream_threshold` 的负载走分块缓冲 I/O，限制峰值内存
//! - [`AsyncFileManager::wait_for_pending`] 是关闭时的排空点

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

/// 分块 I/O 的块大小
const CHUNK_SIZE: usize = 64 * 1024;

/// 文件管理器配置
#[derive(Debug, Clone)]
pub struct FileManagerConfig {
    /// 写并发上限
    pub write_concurrency: usize,
    /// 读并发上限
    pub read_concurrency: usize,
    /// 超过该字节数的负载走流式读写
    pub stream_threshold: usize,
}

impl Default for FileManagerConfig {
    fn default() -> Self {
        Self {
            write_concurrency: 4,
            read_concurrency: 8,
            stream_threshold: 4 * 1024 * 1024,
        }
    }
}

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOpKind {
    Read,
    Write,
    Delete,
    Mkdir,
}

/// 文件操作错误（作为结果字段返回，不向上抛）
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum FileOpError {
    #[error("IO error: {0}")]
    Io(String),

    /// JSON 解析/序列化失败
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// 统一的操作结果记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOpResult {
    pub path: PathBuf,
    pub kind: FileOpKind,
    pub success: bool,
    pub duration_ms: u64,
    /// 读取/写入的字节数
    pub bytes: u64,
    pub error: Option<FileOpError>,
}

impl FileOpResult {
    fn ok(path: PathBuf, kind: FileOpKind, started: Instant, bytes: u64) -> Self {
        Self {
            path,
            kind,
            success: true,
            duration_ms: started.elapsed().as_millis() as u64,
            bytes,
            error: None,
        }
    }

    fn fail(path: PathBuf, kind: FileOpKind, started: Instant, error: FileOpError) -> Self {
        Self {
            path,
            kind,
            success: false,
            duration_ms: started.elapsed().as_millis() as u64,
            bytes: 0,
            error: Some(error),
        }
    }
}

/// 读取结果：统一记录 + 内容
#[derive(Debug, Clone)]
pub struct FileRead {
    pub result: FileOpResult,
    pub data: Option<Vec<u8>>,
}

/// JSON 读取结果：统一记录 + 反序列化后的值
#[derive(Debug, Clone)]
pub struct JsonRead<T> {
    pub result: FileOpResult,
    pub value: Option<T>,
}

/// 文件管理器统计快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileManagerStats {
    pub ops_total: u64,
    pub failures: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub pending: usize,
}

/// 异步文件操作管理器
pub struct AsyncFileManager {
    config: FileManagerConfig,
    write_slots: Arc<Semaphore>,
    read_slots: Arc<Semaphore>,
    pending: AtomicUsize,
    pending_drained: Notify,
    ops_total: AtomicU64,
    failures: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl AsyncFileManager {
    pub fn new(config: FileManagerConfig) -> Self {
        Self {
            write_slots: Arc::new(Semaphore::new(config.write_concurrency.max(1))),
            read_slots: Arc::new(Semaphore::new(config.read_concurrency.max(1))),
            config,
            pending: AtomicUsize::new(0),
            pending_drained: Notify::new(),
            ops_total: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// 写入原始字节
    pub async fn write_file(&self, path: impl AsRef<Path>, data: &[u8]) -> FileOpResult {
        let path = path.as_ref().to_path_buf();
        let _pending = self.begin_op();
        // 写队列：并发已满时在此挂起
        let _permit = self.write_slots.acquire().await.expect("semaphore closed");

        let started = Instant::now();
        let outcome = if data.len() >= self.config.stream_threshold {
            self.write_streamed(&path, data).await
        } else {
            tokio::fs::write(&path, data).await
        };

        let result = match outcome {
            Ok(()) => {
                self.bytes_written
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                FileOpResult::ok(path, FileOpKind::Write, started, data.len() as u64)
            }
            Err(e) => FileOpResult::fail(
                path,
                FileOpKind::Write,
                started,
                FileOpError::Io(e.to_string()),
            ),
        };
        self.finish_op(&result);
        result
    }

    /// 读取原始字节
    pub async fn read_file(&self, path: impl AsRef<Path>) -> FileRead {
        let path = path.as_ref().to_path_buf();
        let _pending = self.begin_op();
        let _permit = self.read_slots.acquire().await.expect("semaphore closed");

        let started = Instant::now();
        let outcome = self.read_maybe_streamed(&path).await;

        let (result, data) = match outcome {
            Ok(data) => {
                self.bytes_read
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                let len = data.len() as u64;
                (
                    FileOpResult::ok(path, FileOpKind::Read, started, len),
                    Some(data),
                )
            }
            Err(e) => (
                FileOpResult::fail(
                    path,
                    FileOpKind::Read,
                    started,
                    FileOpError::Io(e.to_string()),
                ),
                None,
            ),
        };
        self.finish_op(&result);
        FileRead { result, data }
    }

    /// 序列化并写入 JSON
    ///
    /// 序列化失败返回 [`FileOpError::InvalidFormat`]，不触达文件系统。
    pub async fn write_json<T: Serialize>(
        &self,
        path: impl AsRef<Path>,
        value: &T,
    ) -> FileOpResult {
        let path = path.as_ref().to_path_buf();
        let started = Instant::now();
        let data = match serde_json::to_vec_pretty(value) {
            Ok(data) => data,
            Err(e) => {
                let result = FileOpResult::fail(
                    path,
                    FileOpKind::Write,
                    started,
                    FileOpError::InvalidFormat(e.to_string()),
                );
                self.ops_total.fetch_add(1, Ordering::Relaxed);
                self.failures.fetch_add(1, Ordering::Relaxed);
                return result;
            }
        };
        self.write_file(path, &data).await
    }

    /// 读取并反序列化 JSON
    ///
    /// 解析失败算操作失败，错误为 [`FileOpError::InvalidFormat`]。
    pub async fn read_json<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> JsonRead<T> {
        let read = self.read_file(path).await;
        let Some(data) = read.data else {
            return JsonRead {
                result: read.result,
                value: None,
            };
        };

        match serde_json::from_slice(&data) {
            Ok(value) => JsonRead {
                result: read.result,
                value: Some(value),
            },
            Err(e) => {
                let mut result = read.result;
                result.success = false;
                result.error = Some(FileOpError::InvalidFormat(e.to_string()));
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = %result.path.display(), error = %e, "Malformed JSON payload");
                JsonRead {
                    result,
                    value: None,
                }
            }
        }
    }

    /// 删除文件
    pub async fn delete_file(&self, path: impl AsRef<Path>) -> FileOpResult {
        let path = path.as_ref().to_path_buf();
        let _pending = self.begin_op();
        let _permit = self.write_slots.acquire().await.expect("semaphore closed");

        let started = Instant::now();
        let result = match tokio::fs::remove_file(&path).await {
            Ok(()) => FileOpResult::ok(path, FileOpKind::Delete, started, 0),
            Err(e) => FileOpResult::fail(
                path,
                FileOpKind::Delete,
                started,
                FileOpError::Io(e.to_string()),
            ),
        };
        self.finish_op(&result);
        result
    }

    /// 创建目录（含父级），已存在视为成功
    pub async fn ensure_directory(&self, path: impl AsRef<Path>) -> FileOpResult {
        let path = path.as_ref().to_path_buf();
        let _pending = self.begin_op();
        let _permit = self.write_slots.acquire().await.expect("semaphore closed");

        let started = Instant::now();
        let result = match tokio::fs::create_dir_all(&path).await {
            Ok(()) => FileOpResult::ok(path, FileOpKind::Mkdir, started, 0),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                FileOpResult::ok(path, FileOpKind::Mkdir, started, 0)
            }
            Err(e) => FileOpResult::fail(
                path,
                FileOpKind::Mkdir,
                started,
                FileOpError::Io(e.to_string()),
            ),
        };
        self.finish_op(&result);
        result
    }

    /// 批量写入，逐条返回结果（部分失败不打断整批）
    pub async fn write_many(&self, entries: Vec<(PathBuf, Vec<u8>)>) -> Vec<FileOpResult> {
        let futures = entries
            .iter()
            .map(|(path, data)| self.write_file(path, data));
        futures::future::join_all(futures).await
    }

    /// 批量读取
    pub async fn read_many(&self, paths: Vec<PathBuf>) -> Vec<FileRead> {
        let futures = paths.iter().map(|path| self.read_file(path));
        futures::future::join_all(futures).await
    }

    /// 等待所有在途操作完成（关闭时的排空点）
    pub async fn wait_for_pending(&self) {
        loop {
            let drained = self.pending_drained.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// 统计快照
    pub fn stats(&self) -> FileManagerStats {
        FileManagerStats {
            ops_total: self.ops_total.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::SeqCst),
        }
    }

    pub fn config(&self) -> &FileManagerConfig {
        &self.config
    }

    fn begin_op(&self) -> PendingGuard<'_> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        PendingGuard { manager: self }
    }

    fn finish_op(&self, result: &FileOpResult) {
        self.ops_total.fetch_add(1, Ordering::Relaxed);
        if !result.success {
            self.failures.fetch_add(1, Ordering::Relaxed);
            debug!(
                path = %result.path.display(),
                kind = ?result.kind,
                error = ?result.error,
                "File operation failed"
            );
        }
    }

    /// 流式写：分块经 BufWriter 落盘，避免整体缓冲
    async fn write_streamed(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        let file = tokio::fs::File::create(path).await?;
        let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);
        for chunk in data.chunks(CHUNK_SIZE) {
            writer.write_all(chunk).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    async fn read_maybe_streamed(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        let meta = tokio::fs::metadata(path).await?;
        if (meta.len() as usize) < self.config.stream_threshold {
            return tokio::fs::read(path).await;
        }

        let file = tokio::fs::File::open(path).await?;
        let mut reader = BufReader::with_capacity(CHUNK_SIZE, file);
        let mut out = Vec::with_capacity(meta.len() as usize);
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }
}

/// 在途操作计数守卫，析构时递减并唤醒排空等待者
struct PendingGuard<'a> {
    manager: &'a AsyncFileManager,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.manager.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.manager.pending_drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> AsyncFileManager {
        AsyncFileManager::new(FileManagerConfig::default())
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let fm = manager();

        let write = fm.write_file(&path, b"hello").await;
        assert!(write.success);
        assert_eq!(write.bytes, 5);

        let read = fm.read_file(&path).await;
        assert!(read.result.success);
        assert_eq!(read.data.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_read_missing_reports_error() {
        let dir = TempDir::new().unwrap();
        let fm = manager();

        let read = fm.read_file(dir.path().join("missing.bin")).await;
        assert!(!read.result.success);
        assert!(read.data.is_none());
        assert!(matches!(read.result.error, Some(FileOpError::Io(_))));
    }

    #[tokio::test]
    async fn test_json_roundtrip_deep_equal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");
        let fm = manager();

        let original = serde_json::json!({
            "name": "pipeline",
            "steps": [{"id": 1, "tags": ["a", "b"]}, {"id": 2, "tags": []}],
            "nested": {"enabled": true, "ratio": 0.5},
        });
        assert!(fm.write_json(&path, &original).await.success);

        let read: JsonRead<serde_json::Value> = fm.read_json(&path).await;
        assert!(read.result.success);
        assert_eq!(read.value.unwrap(), original);
    }

    #[tokio::test]
    async fn test_json_invalid_format_is_distinct() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        let fm = manager();

        fm.write_file(&path, b"{not json").await;
        let read: JsonRead<serde_json::Value> = fm.read_json(&path).await;

        assert!(!read.result.success);
        assert!(read.value.is_none());
        assert!(matches!(
            read.result.error,
            Some(FileOpError::InvalidFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_directory_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c");
        let fm = manager();

        assert!(fm.ensure_directory(&path).await.success);
        assert!(fm.ensure_directory(&path).await.success);
    }

    #[tokio::test]
    async fn test_streamed_write_above_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("large.bin");
        let fm = AsyncFileManager::new(FileManagerConfig {
            stream_threshold: 1024,
            ..Default::default()
        });

        let payload = vec![7u8; 300 * 1024];
        let write = fm.write_file(&path, &payload).await;
        assert!(write.success);

        let read = fm.read_file(&path).await;
        assert_eq!(read.data.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_batch_partial_failure() {
        let dir = TempDir::new().unwrap();
        let fm = manager();
        fm.write_file(dir.path().join("ok.bin"), b"x").await;

        let reads = fm
            .read_many(vec![
                dir.path().join("ok.bin"),
                dir.path().join("missing.bin"),
            ])
            .await;

        assert!(reads[0].result.success);
        assert!(!reads[1].result.success);
    }

    #[tokio::test]
    async fn test_wait_for_pending() {
        let dir = TempDir::new().unwrap();
        let fm = Arc::new(manager());

        let mut handles = Vec::new();
        for i in 0..16 {
            let fm = fm.clone();
            let path = dir.path().join(format!("f{}.bin", i));
            handles.push(tokio::spawn(async move {
                fm.write_file(path, &[0u8; 128]).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().success);
        }

        fm.wait_for_pending().await;
        assert_eq!(fm.stats().pending, 0);
        assert_eq!(fm.stats().ops_total, 16);
    }
}
