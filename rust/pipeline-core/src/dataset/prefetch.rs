// rust/pipeline-core/src/dataset/prefetch.rs

//! Prefetching sequence for reducing I/O stalls during training.
//!
//! Batches are loaded by background threads while the driver thread feeds
//! the execution engine. Worker `w` of `n` loads positions `w, w + n,
//! w + 2n, ...` of the traversal order into its own bounded channel, and
//! the consumer reads the channels round-robin, so delivery order equals
//! traversal order no matter how the workers are scheduled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver};
use tracing::warn;

use super::iterator::BatchOrder;
use super::traits::{Batch, BatchSource};
use crate::error::Result;

/// Result type for prefetched items.
type PrefetchItem = Result<Batch>;

pub struct PrefetchingSequence {
    /// Source and order until the first read spawns the workers.
    pending: Option<(Arc<dyn BatchSource>, Arc<BatchOrder>)>,
    num_workers: usize,
    buffer_size: usize,
    receivers: Vec<Receiver<PrefetchItem>>,
    stop_flag: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    position: usize,
    exhausted: bool,
}

impl PrefetchingSequence {
    /// Prepares `num_workers` loader threads (at least one), each holding
    /// up to `buffer_size` batches ahead of the consumer. No thread runs
    /// and nothing is loaded until the first `next_batch` call.
    pub fn new(
        source: Arc<dyn BatchSource>,
        order: Arc<BatchOrder>,
        num_workers: usize,
        buffer_size: usize,
    ) -> Self {
        Self {
            pending: Some((source, order)),
            num_workers: num_workers.max(1),
            buffer_size: buffer_size.max(1),
            receivers: Vec::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            position: 0,
            exhausted: false,
        }
    }

    /// Whether the loader threads have been spawned.
    pub fn is_started(&self) -> bool {
        self.pending.is_none()
    }

    fn start(&mut self, source: Arc<dyn BatchSource>, order: Arc<BatchOrder>) {
        let num_workers = self.num_workers;
        for worker in 0..num_workers {
            let (tx, rx) = channel::bounded(self.buffer_size);
            let source = Arc::clone(&source);
            let order = Arc::clone(&order);
            let stop = Arc::clone(&self.stop_flag);

            self.workers.push(thread::spawn(move || {
                let mut position = worker;
                while !stop.load(Ordering::Relaxed) {
                    let Some(index) = order.get(position) else {
                        break;
                    };
                    let item = source.load(index);
                    let failed = item.is_err();
                    // Consumer gone
                    if tx.send(item).is_err() || failed {
                        break;
                    }
                    position += num_workers;
                }
            }));
            self.receivers.push(rx);
        }
    }

    /// Gets the next batch in traversal order.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.exhausted {
            return Ok(None);
        }
        if let Some((source, order)) = self.pending.take() {
            self.start(source, order);
        }

        let rx = &self.receivers[self.position % self.receivers.len()];
        match rx.recv() {
            Ok(Ok(batch)) => {
                self.position += 1;
                Ok(Some(batch))
            }
            Ok(Err(e)) => {
                self.exhausted = true;
                Err(e)
            }
            // The worker owning this position ran past the end of the order
            Err(_) => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Stops the workers and waits for them to exit.
    pub fn stop(&mut self) {
        self.pending = None;
        self.stop_flag.store(true, Ordering::Relaxed);
        // Unblocks workers waiting on a full channel
        self.receivers.clear();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("prefetch worker panicked");
            }
        }
        self.exhausted = true;
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }
}

impl Iterator for PrefetchingSequence {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl Drop for PrefetchingSequence {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::traits::{BatchOrigin, Phase, DENSE_FEATURE_COUNT, SPARSE_FEATURE_COUNT};
    use crate::error::PipelineError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct SlowSource {
        loads: AtomicUsize,
        fail_at: Option<usize>,
    }

    impl SlowSource {
        fn new() -> Self {
            Self {
                loads: AtomicUsize::new(0),
                fail_at: None,
            }
        }
    }

    impl BatchSource for SlowSource {
        fn phase(&self) -> Phase {
            Phase::Validate
        }

        fn num_batches(&self) -> Option<usize> {
            None
        }

        fn load(&self, index: usize) -> Result<Batch> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(index) {
                return Err(PipelineError::dataset("slow", "read failed"));
            }
            // Uneven latency so workers finish out of order
            thread::sleep(Duration::from_micros(((index * 37) % 5) as u64 * 200));
            Ok(Batch {
                origin: BatchOrigin {
                    phase: Phase::Validate,
                    index,
                },
                num_rows: 1,
                dense: vec![0.0; DENSE_FEATURE_COUNT],
                sparse: vec![0; SPARSE_FEATURE_COUNT],
                labels: vec![0.0],
            })
        }
    }

    #[test]
    fn test_preserves_order() {
        let order = Arc::new(BatchOrder::Finite(vec![4, 0, 9, 3, 3, 7, 1, 8, 2, 6, 5]));
        let seq = PrefetchingSequence::new(Arc::new(SlowSource::new()), order, 4, 2);

        let indices: Vec<usize> = seq.map(|b| b.unwrap().origin.index).collect();
        assert_eq!(indices, vec![4, 0, 9, 3, 3, 7, 1, 8, 2, 6, 5]);
    }

    #[test]
    fn test_more_workers_than_batches() {
        let order = Arc::new(BatchOrder::Finite(vec![0, 1]));
        let seq = PrefetchingSequence::new(Arc::new(SlowSource::new()), order, 5, 1);
        assert_eq!(seq.count(), 2);
    }

    #[test]
    fn test_nothing_loads_before_first_read() {
        let source = Arc::new(SlowSource::new());
        let mut seq = PrefetchingSequence::new(
            Arc::clone(&source) as Arc<dyn BatchSource>,
            Arc::new(BatchOrder::Unbounded),
            2,
            2,
        );

        thread::sleep(Duration::from_millis(50));
        assert!(!seq.is_started());
        assert_eq!(source.loads.load(Ordering::SeqCst), 0);

        assert_eq!(seq.next().unwrap().unwrap().origin.index, 0);
        assert!(seq.is_started());
        assert!(source.loads.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_drop_before_first_read() {
        let source = Arc::new(SlowSource::new());
        let seq = PrefetchingSequence::new(
            Arc::clone(&source) as Arc<dyn BatchSource>,
            Arc::new(BatchOrder::Unbounded),
            3,
            1,
        );
        drop(seq);
        assert_eq!(source.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_early_drop_stops_workers() {
        let source = Arc::new(SlowSource::new());
        let mut seq = PrefetchingSequence::new(
            Arc::clone(&source) as Arc<dyn BatchSource>,
            Arc::new(BatchOrder::Unbounded),
            2,
            2,
        );

        for _ in 0..3 {
            assert!(seq.next().unwrap().is_ok());
        }
        drop(seq);

        // Workers are joined, so no load happens after the drop
        let loads = source.loads.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(source.loads.load(Ordering::SeqCst), loads);
        // Bounded by what fits in the channels plus one in-flight load each
        assert!(loads <= 3 + 2 * (2 + 1));
    }

    #[test]
    fn test_error_is_delivered_in_order() {
        let source = SlowSource {
            fail_at: Some(3),
            ..SlowSource::new()
        };
        let order = Arc::new(BatchOrder::Finite((0..8).collect()));
        let mut seq = PrefetchingSequence::new(Arc::new(source), order, 2, 2);

        for expected in 0..3 {
            assert_eq!(seq.next().unwrap().unwrap().origin.index, expected);
        }
        assert!(seq.next().unwrap().is_err());
        assert!(seq.next().is_none());
    }
}
