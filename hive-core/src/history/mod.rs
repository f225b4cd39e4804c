//! # 执行历史环形缓冲区
//!
//! 固定容量的环形缓冲区，记录最近的任务执行事件。
//!
//! ## 核心职责
//! - O(1) 追加，容量满后覆盖最旧记录
//! - 按写入顺序读取（最旧 -> 最新）
//! - 累计写入数 / 覆盖数统计（用于长期运行进程的可观测性）

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::TaskId;

/// 单条执行历史记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// 任务 ID
    pub task_id: TaskId,
    /// 执行耗时（毫秒）
    pub duration_ms: u64,
    /// 终态是否成功
    pub success: bool,
    /// 记录时间
    pub timestamp: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn new(task_id: impl Into<TaskId>, duration_ms: u64, success: bool) -> Self {
        Self {
            task_id: task_id.into(),
            duration_ms,
            success,
            timestamp: Utc::now(),
        }
    }
}

/// 定容环形缓冲区
///
/// 容量满后继续 `push` 会覆盖最旧的元素。长度永远不超过容量。
#[derive(Debug)]
pub struct CircularBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    /// 累计写入总数（含被覆盖的）
    total_written: u64,
    /// 被覆盖的元素数
    overwritten: u64,
}

impl<T> CircularBuffer<T> {
    /// 创建指定容量的缓冲区
    ///
    /// 容量为 0 时按 1 处理。
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            total_written: 0,
            overwritten: 0,
        }
    }

    /// 追加元素，必要时覆盖最旧的
    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
            self.overwritten += 1;
        }
        self.items.push_back(item);
        self.total_written += 1;
    }

    /// 返回所有保留的元素（最旧 -> 最新）
    pub fn get_all(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.iter().cloned().collect()
    }

    /// 返回最近 `min(n, len)` 个元素（最旧 -> 最新）
    pub fn get_recent(&self, n: usize) -> Vec<T>
    where
        T: Clone,
    {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 累计写入总数（即使发生回绕也单调递增）
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// 被覆盖丢弃的元素数
    pub fn overwritten(&self) -> u64 {
        self.overwritten
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// 执行历史统计快照
#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub size: usize,
    pub capacity: usize,
    pub total_written: u64,
    pub overwritten: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

/// 线程安全的执行历史
///
/// 对 [`CircularBuffer<HistoryRecord>`] 的共享封装，追加路径为单点
/// 互斥，适合调度循环与并发任务体同时写入。
#[derive(Debug, Clone)]
pub struct ExecutionHistory {
    inner: Arc<Mutex<CircularBuffer<HistoryRecord>>>,
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CircularBuffer::new(capacity))),
        }
    }

    pub fn record(&self, record: HistoryRecord) {
        self.inner.lock().push(record);
    }

    pub fn get_all(&self) -> Vec<HistoryRecord> {
        self.inner.lock().get_all()
    }

    pub fn get_recent(&self, n: usize) -> Vec<HistoryRecord> {
        self.inner.lock().get_recent(n)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn total_written(&self) -> u64 {
        self.inner.lock().total_written()
    }

    pub fn overwritten(&self) -> u64 {
        self.inner.lock().overwritten()
    }

    /// 统计快照
    pub fn stats(&self) -> HistoryStats {
        let buf = self.inner.lock();
        let size = buf.len();
        let (succeeded, total_ms) = buf
            .items
            .iter()
            .fold((0u64, 0u64), |(s, d), r| {
                (s + u64::from(r.success), d + r.duration_ms)
            });

        HistoryStats {
            size,
            capacity: buf.capacity(),
            total_written: buf.total_written(),
            overwritten: buf.overwritten(),
            success_rate: if size == 0 {
                0.0
            } else {
                succeeded as f64 / size as f64
            },
            avg_duration_ms: if size == 0 {
                0.0
            } else {
                total_ms as f64 / size as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_get_all() {
        let mut buf = CircularBuffer::new(3);
        buf.push(1);
        buf.push(2);

        assert_eq!(buf.len(), 2);
        assert_eq!(buf.get_all(), vec![1, 2]);
    }

    #[test]
    fn test_wraparound_accounting() {
        let mut buf = CircularBuffer::new(3);
        for i in 0..7 {
            buf.push(i);
        }

        // W = 7, C = 3
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.total_written(), 7);
        assert_eq!(buf.overwritten(), 4);
        assert_eq!(buf.get_all(), vec![4, 5, 6]);
    }

    #[test]
    fn test_get_recent() {
        let mut buf = CircularBuffer::new(5);
        for i in 0..5 {
            buf.push(i);
        }

        assert_eq!(buf.get_recent(2), vec![3, 4]);
        // n 大于当前长度时返回全部
        assert_eq!(buf.get_recent(10), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut buf = CircularBuffer::new(0);
        buf.push("a");
        buf.push("b");

        assert_eq!(buf.len(), 1);
        assert_eq!(buf.get_all(), vec!["b"]);
    }

    #[test]
    fn test_execution_history_stats() {
        let history = ExecutionHistory::new(10);
        history.record(HistoryRecord::new("t1", 100, true));
        history.record(HistoryRecord::new("t2", 300, false));

        let stats = history.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.total_written, 2);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((stats.avg_duration_ms - 200.0).abs() < f64::EPSILON);
    }
}
