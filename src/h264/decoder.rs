//! Boundary to the host media pipeline

use bytes::BytesMut;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::DecoderError;

/// Default capacity of buffers handed out by [`StreamDecoder`]
const DEFAULT_SAMPLE_CAPACITY: usize = 64 * 1024;

/// Output buffer for one access unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuffer {
    pub data: BytesMut,
    /// Slot index assigned by the decoder
    pub index: usize,
    pub rtp_timestamp: u32,
}

impl SampleBuffer {
    pub fn new(index: usize, capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            index,
            rtp_timestamp: 0,
        }
    }

    /// Presentation time for a 90 kHz media clock
    pub fn presentation_time_us(&self) -> u64 {
        self.rtp_timestamp as u64 * 1000 / 90
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Consumer of reassembled access units
pub trait Decoder: Send + Sync {
    /// Hand out an empty buffer to fill
    fn acquire_buffer(&self) -> Result<SampleBuffer, DecoderError>;

    /// Queue a filled buffer for decoding
    fn submit(&self, sample: SampleBuffer) -> Result<(), DecoderError>;

    /// Return a buffer that will not be submitted
    fn release(&self, _sample: SampleBuffer) {}
}

/// Decoder that writes every submitted unit to a byte sink, e.g. an
/// Annex-B `.h264` file
pub struct StreamDecoder<W: Write + Send> {
    sink: Mutex<W>,
    next_index: AtomicUsize,
    submitted: AtomicUsize,
}

impl<W: Write + Send> StreamDecoder<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(sink),
            next_index: AtomicUsize::new(0),
            submitted: AtomicUsize::new(0),
        }
    }

    /// Units written so far
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.sink.lock().flush()
    }

    pub fn into_inner(self) -> W {
        self.sink.into_inner()
    }
}

impl<W: Write + Send> Decoder for StreamDecoder<W> {
    fn acquire_buffer(&self) -> Result<SampleBuffer, DecoderError> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        Ok(SampleBuffer::new(index, DEFAULT_SAMPLE_CAPACITY))
    }

    fn submit(&self, sample: SampleBuffer) -> Result<(), DecoderError> {
        self.sink
            .lock()
            .write_all(&sample.data)
            .map_err(|e| DecoderError::SubmitFailed(e.to_string()))?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            "Wrote sample #{} ({} bytes, pts {}us)",
            sample.index,
            sample.len(),
            sample.presentation_time_us()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presentation_time() {
        let mut sample = SampleBuffer::new(0, 16);
        sample.rtp_timestamp = 90_000;
        assert_eq!(sample.presentation_time_us(), 1_000_000);
        sample.rtp_timestamp = 45;
        assert_eq!(sample.presentation_time_us(), 500);
    }

    #[test]
    fn test_stream_decoder_writes_units() {
        let decoder = StreamDecoder::new(Vec::new());
        let mut first = decoder.acquire_buffer().unwrap();
        first.data.extend_from_slice(&[0, 0, 0, 1, 0x65]);
        let mut second = decoder.acquire_buffer().unwrap();
        second.data.extend_from_slice(&[0, 0, 0, 1, 0x41]);
        assert_eq!(second.index, 1);

        decoder.submit(first).unwrap();
        decoder.release(second);
        assert_eq!(decoder.submitted(), 1);
        assert_eq!(decoder.into_inner(), vec![0, 0, 0, 1, 0x65]);
    }
}
