//! # Frame Accumulator
//!
//! Re-blocks a stream of callback blocks of any size into batches of a fixed
//! size. Each full batch is handed to a [`BatchSink`] as its own `Vec`, so the
//! accumulation buffer can be reused at once. A sink that refuses a batch
//! costs that batch only; accumulation carries on.

use tracing::trace;

use crate::error::TransportError;

/// Receiver of full batches.
pub trait BatchSink {
    /// Takes ownership of one full batch.
    fn deliver(&mut self, batch: Vec<f32>) -> Result<(), TransportError>;
}

impl<F> BatchSink for F
where
    F: FnMut(Vec<f32>) -> Result<(), TransportError>,
{
    fn deliver(&mut self, batch: Vec<f32>) -> Result<(), TransportError> {
        self(batch)
    }
}

/// Fixed-size batcher.
#[derive(Debug, Clone)]
pub struct FrameAccumulator {
    buffer: Box<[f32]>,
    offset: usize,
    delivered: u64,
    dropped: u64,
}

impl FrameAccumulator {
    /// Creates an accumulator for batches of `batch_size` samples (at least one).
    pub fn new(batch_size: usize) -> Self {
        Self {
            buffer: vec![0.0; batch_size.max(1)].into_boxed_slice(),
            offset: 0,
            delivered: 0,
            dropped: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.buffer.len()
    }

    /// Samples currently waiting for the batch to fill.
    pub fn pending(&self) -> usize {
        self.offset
    }

    /// Batches the sink accepted so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Batches the sink refused so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Copies `block` in, handing every completed batch to `sink`. Returns the
    /// number of batches completed by this call, delivered or not.
    pub fn ingest<S: BatchSink + ?Sized>(&mut self, block: &[f32], sink: &mut S) -> usize {
        let batch_size = self.buffer.len();
        let mut read = 0;
        let mut completed = 0;

        while read < block.len() {
            let to_copy = (batch_size - self.offset).min(block.len() - read);
            self.buffer[self.offset..self.offset + to_copy]
                .copy_from_slice(&block[read..read + to_copy]);
            self.offset += to_copy;
            read += to_copy;

            if self.offset == batch_size {
                completed += 1;
                match sink.deliver(self.buffer.to_vec()) {
                    Ok(()) => self.delivered += 1,
                    Err(err) => {
                        self.dropped += 1;
                        trace!(%err, "dropping batch");
                    }
                }
                self.offset = 0;
            }
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_only_full_batches() {
        let mut accumulator = FrameAccumulator::new(1024);
        let mut batches: Vec<Vec<f32>> = Vec::new();
        let mut sink = |batch: Vec<f32>| -> Result<(), TransportError> {
            batches.push(batch);
            Ok(())
        };

        for block in 0..7 {
            let samples = vec![block as f32; 128];
            assert_eq!(accumulator.ingest(&samples, &mut sink), 0);
        }
        assert_eq!(accumulator.pending(), 896);

        assert_eq!(accumulator.ingest(&[7.0; 128], &mut sink), 1);
        assert_eq!(accumulator.pending(), 0);
        drop(sink);

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1024);
        assert_eq!(batches[0][0], 0.0);
        assert_eq!(batches[0][1023], 7.0);
    }

    #[test]
    fn block_larger_than_batch_yields_several_batches() {
        let mut accumulator = FrameAccumulator::new(4);
        let mut batches: Vec<Vec<f32>> = Vec::new();
        let input: Vec<f32> = (0..10).map(|i| i as f32).collect();

        let completed = accumulator.ingest(&input, &mut |batch: Vec<f32>| -> Result<(), TransportError> {
            batches.push(batch);
            Ok(())
        });

        assert_eq!(completed, 2);
        assert_eq!(batches, vec![vec![0.0, 1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0, 7.0]]);
        assert_eq!(accumulator.pending(), 2);
    }

    #[test]
    fn failing_sink_drops_batch_and_continues() {
        let mut accumulator = FrameAccumulator::new(4);
        let mut calls = 0;
        let mut flaky = |_batch: Vec<f32>| -> Result<(), TransportError> {
            calls += 1;
            if calls == 1 {
                Err(TransportError::Full)
            } else {
                Ok(())
            }
        };

        accumulator.ingest(&[1.0; 12], &mut flaky);

        assert_eq!(accumulator.dropped(), 1);
        assert_eq!(accumulator.delivered(), 2);
        assert_eq!(accumulator.pending(), 0);
    }

    #[test]
    fn channel_sink_reports_full_channel() {
        let (tx, rx) = crossbeam_channel::bounded::<Vec<f32>>(1);
        let mut sink = |batch: Vec<f32>| -> Result<(), TransportError> {
            tx.try_send(batch).map_err(TransportError::from)
        };
        let mut accumulator = FrameAccumulator::new(2);

        accumulator.ingest(&[1.0, 2.0, 3.0, 4.0], &mut sink);

        assert_eq!(accumulator.delivered(), 1);
        assert_eq!(accumulator.dropped(), 1);
        assert_eq!(rx.try_recv().ok(), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn empty_block_is_a_no_op() {
        let mut accumulator = FrameAccumulator::new(4);
        let mut sink = |_batch: Vec<f32>| -> Result<(), TransportError> {
            panic!("no batch expected")
        };
        assert_eq!(accumulator.ingest(&[], &mut sink), 0);
    }
}
