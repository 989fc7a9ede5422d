//! Fixed-capacity circular store of the most recent samples.
//!
//! The ring decouples the analysis window from the callback block size: a
//! 128-sample render quantum is too short to resolve low notes, so blocks are
//! written here and the last `capacity` samples are read back in order.

/// Circular sample buffer.
///
/// `write_position` always points at the slot the next sample goes to; once
/// the ring is full that slot holds the oldest sample.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    samples: Box<[f32]>,
    write_position: usize,
    fill_count: usize,
}

impl RingBuffer {
    /// Creates an empty ring. Zero capacity is clamped to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)].into_boxed_slice(),
            write_position: 0,
            fill_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    pub fn write_position(&self) -> usize {
        self.write_position
    }

    /// Number of valid samples, saturating at the capacity.
    pub fn fill_count(&self) -> usize {
        self.fill_count
    }

    pub fn is_full(&self) -> bool {
        self.fill_count == self.samples.len()
    }

    /// Appends samples, overwriting the oldest ones.
    pub fn write(&mut self, samples: &[f32]) {
        let capacity = self.samples.len();
        for &sample in samples {
            self.samples[self.write_position] = sample;
            self.write_position = (self.write_position + 1) % capacity;
            if self.fill_count < capacity {
                self.fill_count += 1;
            }
        }
    }

    /// Returns the whole ring oldest-first. Only meaningful once full.
    pub fn snapshot_ordered(&self) -> Vec<f32> {
        let mut window = vec![0.0; self.samples.len()];
        self.snapshot_into(&mut window);
        window
    }

    /// Copies the ring oldest-first into `window`, which must be exactly
    /// `capacity` long.
    pub fn snapshot_into(&self, window: &mut [f32]) {
        debug_assert_eq!(window.len(), self.samples.len());
        let (newer, older) = self.samples.split_at(self.write_position);
        window[..older.len()].copy_from_slice(older);
        window[older.len()..].copy_from_slice(newer);
    }

    /// Forgets all samples.
    pub fn clear(&mut self) {
        self.samples.fill(0.0);
        self.write_position = 0;
        self.fill_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::RingBuffer;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32).collect()
    }

    #[test]
    fn fill_count_saturates() {
        let mut ring = RingBuffer::new(8);
        ring.write(&ramp(5));
        assert_eq!(ring.fill_count(), 5);
        assert!(!ring.is_full());

        ring.write(&ramp(5));
        assert_eq!(ring.fill_count(), 8);
        assert!(ring.is_full());
        assert_eq!(ring.write_position(), 2);
    }

    #[test]
    fn snapshot_holds_last_capacity_samples_in_order() {
        for extra in [1, 3, 8, 13, 64] {
            let capacity = 8;
            let input = ramp(capacity + extra);
            let mut ring = RingBuffer::new(capacity);
            // Uneven chunks so wrap-around happens mid-write.
            for chunk in input.chunks(3) {
                ring.write(chunk);
            }

            assert_eq!(
                ring.snapshot_ordered(),
                input[input.len() - capacity..].to_vec(),
                "extra = {extra}"
            );
            assert!(ring.write_position() < capacity);
        }
    }

    #[test]
    fn snapshot_of_exactly_full_ring_starts_at_zero() {
        let mut ring = RingBuffer::new(4);
        ring.write(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ring.write_position(), 0);
        assert_eq!(ring.snapshot_ordered(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn clear_resets_state() {
        let mut ring = RingBuffer::new(4);
        ring.write(&[1.0; 6]);
        ring.clear();
        assert_eq!(ring.fill_count(), 0);
        assert_eq!(ring.write_position(), 0);
        assert_eq!(ring.snapshot_ordered(), vec![0.0; 4]);
    }
}
