/// Frame accumulation buffer
///
/// Lock-free ring buffer that collects mono f32 samples arriving in
/// arbitrarily sized blocks from the capture callback and hands them out
/// again in fixed-size analysis frames.

use cache_padded::CachePadded;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use thiserror::Error;
use tracing::{trace, warn};

/// Audio sample format (normalised 32-bit float, -1.0 ..= 1.0)
pub type AudioSample = f32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioBufferError {
    #[error("Buffer underflow: attempted to read {0} samples, but only {1} available")]
    Underflow(usize, usize),

    #[error("Invalid buffer size: {0}")]
    InvalidSize(usize),
}

type RingBuffer = HeapRb<AudioSample>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

/// Ring buffer for audio samples
/// Producer and consumer halves are padded so the capture side and the
/// analysis side never share a cache line.
pub struct AudioBuffer {
    producer: CachePadded<Mutex<RingProducer>>,
    consumer: CachePadded<Mutex<RingConsumer>>,
}

impl AudioBuffer {
    /// Create a buffer holding at most `capacity` samples
    pub fn with_capacity(capacity: usize) -> Result<Self, AudioBufferError> {
        if capacity == 0 {
            return Err(AudioBufferError::InvalidSize(capacity));
        }

        trace!("Creating audio buffer with capacity: {} samples", capacity);

        let (producer, consumer) = RingBuffer::new(capacity).split();

        Ok(Self {
            producer: CachePadded::new(Mutex::new(producer)),
            consumer: CachePadded::new(Mutex::new(consumer)),
        })
    }

    /// Write samples, scaled by `gain`
    ///
    /// When the buffer cannot take the whole block the oldest samples are
    /// dropped, so the buffer always holds the most recent audio.
    /// Returns the number of samples now stored from this block.
    pub fn write_scaled(&self, samples: &[AudioSample], gain: f32) -> usize {
        let mut producer = self.producer.lock();
        let capacity = producer.capacity().get();

        // Only the newest `capacity` samples can ever survive.
        let samples = &samples[samples.len().saturating_sub(capacity)..];

        let vacant = producer.vacant_len();
        if samples.len() > vacant {
            let to_drop = samples.len() - vacant;
            self.consumer.lock().skip(to_drop);
            warn!("Frame buffer full, dropping {} oldest samples", to_drop);
        }

        let mut written = 0;
        for sample in samples {
            if producer.try_push(sample * gain).is_ok() {
                written += 1;
            }
        }
        written
    }

    /// Read and remove exactly `count` samples
    pub fn read(&self, count: usize) -> Result<Vec<AudioSample>, AudioBufferError> {
        let mut consumer = self.consumer.lock();
        let available = consumer.occupied_len();

        if count > available {
            return Err(AudioBufferError::Underflow(count, available));
        }

        let mut result = vec![0.0; count];
        let read = consumer.pop_slice(&mut result);
        result.truncate(read);
        Ok(result)
    }

    /// Number of samples currently buffered
    pub fn len(&self) -> usize {
        self.consumer.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.consumer.lock().capacity().get()
    }

    /// Drop everything currently buffered
    pub fn clear(&self) {
        let mut consumer = self.consumer.lock();
        let occupied = consumer.occupied_len();
        consumer.skip(occupied);
    }
}
