use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::sample::Sample;

/// Largest ring a test may ask for, a bit over an hour at 1 kHz.
pub const MAX_BUFFER_CAPACITY: usize = 1 << 22;

/// Slots reserved up front; a larger ring grows as it fills.
const PREALLOCATED_SLOTS: usize = 1 << 16;

/// Fixed capacity ring of samples, oldest overwritten first.
pub struct SampleBuffer {
    slots: Vec<Sample>,
    capacity: usize,
    next: usize,
    written: u64,
}

pub trait SampleSink {
    fn push(&mut self, sample: Sample);
}

impl SampleBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity.min(PREALLOCATED_SLOTS)),
            capacity,
            next: 0,
            written: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() == self.capacity
    }

    pub fn total_written(&self) -> u64 {
        self.written
    }

    pub fn overwritten(&self) -> u64 {
        self.written - self.slots.len() as u64
    }

    pub fn push(&mut self, sample: Sample) {
        if self.is_full() {
            self.slots[self.next] = sample;
        } else {
            self.slots.push(sample);
        }
        self.next = (self.next + 1) % self.capacity;
        self.written += 1;
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.nth_latest(0)
    }

    /// `age` 0 is the most recent sample, 1 the one before it, and so on.
    pub fn nth_latest(&self, age: usize) -> Option<&Sample> {
        if age >= self.slots.len() {
            return None;
        }
        let index = (self.next + self.capacity - 1 - age) % self.capacity;
        self.slots.get(index)
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        let split = if self.is_full() { self.next } else { 0 };
        let (newer, older) = self.slots.split_at(split);
        older.iter().chain(newer.iter())
    }

    pub fn to_vec(&self) -> Vec<Sample> {
        self.iter().copied().collect()
    }

    pub fn into_vec(self) -> Vec<Sample> {
        let mut slots = self.slots;
        if slots.len() == self.capacity {
            slots.rotate_left(self.next);
        }
        slots
    }
}

impl SampleSink for SampleBuffer {
    fn push(&mut self, sample: Sample) {
        SampleBuffer::push(self, sample);
    }
}

/// Split a new buffer into its single writer and a cloneable reader.
pub fn shared(capacity: usize) -> (SampleWriter, SampleReader) {
    let inner = Arc::new(RwLock::new(SampleBuffer::with_capacity(capacity)));
    (SampleWriter { inner: inner.clone() }, SampleReader { inner })
}

/// The only handle that can append.  Deliberately not `Clone`.
pub struct SampleWriter {
    inner: Arc<RwLock<SampleBuffer>>,
}

impl SampleWriter {
    fn write(&self) -> RwLockWriteGuard<'_, SampleBuffer> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SampleSink for SampleWriter {
    fn push(&mut self, sample: Sample) {
        self.write().push(sample);
    }
}

#[derive(Clone)]
pub struct SampleReader {
    inner: Arc<RwLock<SampleBuffer>>,
}

impl SampleReader {
    fn read(&self) -> RwLockReadGuard<'_, SampleBuffer> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn total_written(&self) -> u64 {
        self.read().total_written()
    }

    pub fn overwritten(&self) -> u64 {
        self.read().overwritten()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.read().latest().copied()
    }

    /// The newest sample together with the one committed just before it.
    pub fn latest_pair(&self) -> Option<(Sample, Option<Sample>)> {
        let buffer = self.read();
        let latest = buffer.latest().copied()?;
        Some((latest, buffer.nth_latest(1).copied()))
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.read().to_vec()
    }

    /// Takes the samples out without copying when this is the last handle.
    pub fn into_samples(self) -> Vec<Sample> {
        match Arc::try_unwrap(self.inner) {
            Ok(lock) => lock.into_inner().unwrap_or_else(PoisonError::into_inner).into_vec(),
            Err(inner) => SampleReader { inner }.snapshot(),
        }
    }
}
