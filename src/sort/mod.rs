//! Spillable buffers
//!
//! `SpillBuffer` is the common shape of the two buffers the index uses:
//!
//! - `SpillQueue`: no ordering. Items drain in the order they were pushed.
//!   The build pipeline uses it to stage heap rows without holding them all
//!   in memory.
//! - `ExternalSorter`: drains in ascending `Ord` order. The scan uses it to
//!   rank entries by distance.
//!
//! Both keep up to `work_mem` bytes in memory and spill the rest to
//! anonymous temp files. Draining consumes the buffer; the drain is lazy,
//! finite and single pass.

mod merge;
mod run;

pub use merge::MergeDrain;

use crate::Result;
use merge::Source;
use run::{RunReader, RunWriter};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;

/// push / drain buffer that may spill to disk
pub trait SpillBuffer<T> {
    type Drain: Iterator<Item = Result<T>>;

    fn push(&mut self, item: T) -> Result<()>;

    /// Items pushed so far
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of runs written to disk so far
    fn spilled_runs(&self) -> usize;

    fn drain(self) -> Result<Self::Drain>;
}

/// Memory accounting shared by both buffers
struct Staging<T> {
    work_mem: usize,
    spill_dir: Option<PathBuf>,
    buffer: Vec<T>,
    buffered_bytes: usize,
    total: usize,
}

impl<T: Serialize> Staging<T> {
    fn new(work_mem: usize) -> Self {
        Self {
            work_mem,
            spill_dir: None,
            buffer: Vec::new(),
            buffered_bytes: 0,
            total: 0,
        }
    }

    /// Returns true once the buffer went over budget
    fn push(&mut self, item: T) -> Result<bool> {
        let size = bincode::serialized_size(&item)? as usize + std::mem::size_of::<T>();
        self.buffer.push(item);
        self.buffered_bytes += size;
        self.total += 1;
        Ok(self.buffered_bytes > self.work_mem)
    }

    fn write_run(&mut self, items: Vec<T>) -> Result<RunReader<T>> {
        let mut writer = RunWriter::create(self.spill_dir.as_deref())?;
        let count = items.len();
        for item in &items {
            writer.write(item)?;
        }
        self.buffered_bytes = 0;
        tracing::debug!(items = count, "sort buffer spilled to disk");
        writer.finish()
    }
}

/// FIFO spill buffer (no comparator)
pub struct SpillQueue<T> {
    staging: Staging<T>,
    runs: Vec<RunReader<T>>,
}

impl<T: Serialize + DeserializeOwned> SpillQueue<T> {
    pub fn new(work_mem: usize) -> Self {
        Self { staging: Staging::new(work_mem), runs: Vec::new() }
    }

    /// Put spill files in `dir` instead of the system temp dir
    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging.spill_dir = Some(dir.into());
        self
    }
}

impl<T: Serialize + DeserializeOwned> SpillBuffer<T> for SpillQueue<T> {
    type Drain = QueueDrain<T>;

    fn push(&mut self, item: T) -> Result<()> {
        if self.staging.push(item)? {
            let items = std::mem::take(&mut self.staging.buffer);
            let run = self.staging.write_run(items)?;
            self.runs.push(run);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.staging.total
    }

    fn spilled_runs(&self) -> usize {
        self.runs.len()
    }

    fn drain(self) -> Result<QueueDrain<T>> {
        Ok(QueueDrain {
            runs: self.runs.into(),
            tail: self.staging.buffer.into_iter(),
        })
    }
}

/// Spilled runs in push order, then the in-memory tail
pub struct QueueDrain<T> {
    runs: VecDeque<RunReader<T>>,
    tail: std::vec::IntoIter<T>,
}

impl<T: DeserializeOwned> Iterator for QueueDrain<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(run) = self.runs.front_mut() {
            match run.next() {
                Some(item) => return Some(item),
                None => {
                    self.runs.pop_front();
                }
            }
        }
        self.tail.next().map(Ok)
    }
}

/// External merge sort, ascending by `T: Ord`
pub struct ExternalSorter<T> {
    staging: Staging<T>,
    runs: Vec<RunReader<T>>,
}

impl<T: Ord + Serialize + DeserializeOwned> ExternalSorter<T> {
    pub fn new(work_mem: usize) -> Self {
        Self { staging: Staging::new(work_mem), runs: Vec::new() }
    }

    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging.spill_dir = Some(dir.into());
        self
    }
}

impl<T: Ord + Serialize + DeserializeOwned> SpillBuffer<T> for ExternalSorter<T> {
    type Drain = MergeDrain<T>;

    fn push(&mut self, item: T) -> Result<()> {
        if self.staging.push(item)? {
            let mut items = std::mem::take(&mut self.staging.buffer);
            items.sort_unstable();
            let run = self.staging.write_run(items)?;
            self.runs.push(run);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.staging.total
    }

    fn spilled_runs(&self) -> usize {
        self.runs.len()
    }

    fn drain(self) -> Result<MergeDrain<T>> {
        let mut tail = self.staging.buffer;
        tail.sort_unstable();

        let mut sources: Vec<Source<T>> = self.runs.into_iter().map(Source::Run).collect();
        sources.push(Source::Memory(tail.into_iter()));
        MergeDrain::new(sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_queue_keeps_push_order_across_spills() {
        let mut queue = SpillQueue::new(256);
        for i in 0..500u32 {
            queue.push((i, vec![i as u8; 8])).unwrap();
        }
        assert!(queue.spilled_runs() > 1);
        assert_eq!(queue.len(), 500);

        let drained: Vec<u32> = queue.drain().unwrap().map(|r| r.unwrap().0).collect();
        assert_eq!(drained, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_queue_in_memory_only() {
        let mut queue = SpillQueue::new(1 << 20);
        queue.push("a".to_string()).unwrap();
        queue.push("b".to_string()).unwrap();
        assert_eq!(queue.spilled_runs(), 0);
        let drained: Vec<String> = queue.drain().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(drained, vec!["a", "b"]);
    }

    #[test]
    fn test_sorter_merges_spilled_runs() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut sorter = ExternalSorter::new(512);
        let mut expected = Vec::new();
        for _ in 0..2000 {
            let v: i64 = rng.gen_range(-10_000..10_000);
            sorter.push(v).unwrap();
            expected.push(v);
        }
        assert!(sorter.spilled_runs() > 2);

        expected.sort();
        let sorted: Vec<i64> = sorter.drain().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn test_sorter_spill_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut sorter = ExternalSorter::new(64).with_spill_dir(dir.path());
        for v in [5u16, 3, 9, 1, 7, 2, 8, 6, 4, 0] {
            sorter.push(v).unwrap();
        }
        let sorted: Vec<u16> = sorter.drain().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_sorter() {
        let sorter: ExternalSorter<u32> = ExternalSorter::new(1024);
        assert!(sorter.is_empty());
        assert_eq!(sorter.drain().unwrap().count(), 0);
    }
}
