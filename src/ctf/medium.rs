//! The medium: the opaque byte source a decoder consumes, plus an
//! in-memory implementation.

use std::rc::Rc;

use crate::error::DecodeError;
use crate::ir::stream::Stream;
use crate::ir::stream_class::StreamClass;
use crate::ir::trace::Trace;

/// Outcome of a byte request.
#[derive(Debug)]
pub enum MediumRequest {
    /// At least one byte, at most the requested maximum. The chunk is
    /// owned by the caller until the next request.
    Bytes(Vec<u8>),
    /// Clean end of the byte stream.
    Eof,
    /// Nothing available right now; the decoder suspends and the call
    /// may be retried later.
    Again,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SeekWhence {
    /// Absolute byte offset from the start of the stream.
    Set,
}

/// Optional size hints a medium may publish about its stream.
#[derive(Copy, Clone, Debug, Default)]
pub struct StreamInfo {
    /// Total stream size in bytes, when known.
    pub total_size_bytes: Option<u64>,
    /// Number of packets, when known.
    pub packet_count: Option<u64>,
}

/// Byte-source contract consumed by the decoder.
pub trait Medium {
    /// Supplies at least one byte and at most `max_len`.
    fn request_bytes(&mut self, max_len: usize) -> Result<MediumRequest, DecodeError>;

    /// Resolves the stream for a (stream class, instance id) pair.
    /// `stream_instance_id` is `None` when the packet header carries no
    /// `stream_instance_id` field.
    fn borrow_stream(
        &mut self,
        stream_class: &Rc<StreamClass>,
        stream_instance_id: Option<u64>,
    ) -> Result<Rc<Stream>, DecodeError>;

    /// Repositions the byte source; only packet boundaries are valid
    /// targets. Optional.
    fn seek(&mut self, _whence: SeekWhence, _offset: u64) -> Result<(), DecodeError> {
        Err(DecodeError::Medium("this medium cannot seek".into()))
    }

    /// Size hints. Optional.
    fn stream_info(&mut self) -> Option<StreamInfo> {
        None
    }
}

/// In-memory medium over a complete byte image, serving it in
/// configurable chunks. Resolves streams against a trace, creating
/// them on first use.
pub struct BufferMedium {
    trace: Rc<Trace>,
    data: Vec<u8>,
    position: usize,
    chunk_len: usize,
}

impl BufferMedium {
    pub fn new(trace: Rc<Trace>, data: Vec<u8>) -> Self {
        let chunk_len = data.len().max(1);
        Self::with_chunk_len(trace, data, chunk_len)
    }

    /// Serves at most `chunk_len` bytes per request, forcing the
    /// decoder through its continue states.
    pub fn with_chunk_len(trace: Rc<Trace>, data: Vec<u8>, chunk_len: usize) -> Self {
        assert!(chunk_len > 0);
        Self {
            trace,
            data,
            position: 0,
            chunk_len,
        }
    }
}

impl Medium for BufferMedium {
    fn request_bytes(&mut self, max_len: usize) -> Result<MediumRequest, DecodeError> {
        if self.position >= self.data.len() {
            return Ok(MediumRequest::Eof);
        }
        let len = (self.data.len() - self.position)
            .min(self.chunk_len)
            .min(max_len.max(1));
        let chunk = self.data[self.position..self.position + len].to_vec();
        self.position += len;
        Ok(MediumRequest::Bytes(chunk))
    }

    fn borrow_stream(
        &mut self,
        stream_class: &Rc<StreamClass>,
        stream_instance_id: Option<u64>,
    ) -> Result<Rc<Stream>, DecodeError> {
        let id = stream_instance_id.unwrap_or(0);
        if let Some(stream) = self.trace.stream_by_id(stream_class.id(), id) {
            return Ok(stream);
        }
        self.trace
            .create_stream(stream_class.clone(), id)
            .map_err(|e| DecodeError::Medium(format!("cannot create stream: {e}")))
    }

    fn seek(&mut self, whence: SeekWhence, offset: u64) -> Result<(), DecodeError> {
        let SeekWhence::Set = whence;
        if offset as usize > self.data.len() {
            return Err(DecodeError::Medium(format!(
                "seek offset {offset} is past the end of the {}-byte stream",
                self.data.len()
            )));
        }
        self.position = offset as usize;
        Ok(())
    }

    fn stream_info(&mut self) -> Option<StreamInfo> {
        Some(StreamInfo {
            total_size_bytes: Some(self.data.len() as u64),
            packet_count: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::stream_class::StreamClass;
    use pretty_assertions::assert_eq;

    fn trace_with_class() -> (Rc<Trace>, Rc<StreamClass>) {
        let trace = Trace::new();
        let sc = StreamClass::new(0);
        trace.add_stream_class(sc.clone()).unwrap();
        (trace, sc)
    }

    #[test]
    fn chunked_requests_cover_the_image() {
        let (trace, _) = trace_with_class();
        let mut m = BufferMedium::with_chunk_len(trace, (0u8..10).collect(), 3);
        let mut seen = Vec::new();
        loop {
            match m.request_bytes(64).unwrap() {
                MediumRequest::Bytes(b) => {
                    assert!(!b.is_empty() && b.len() <= 3);
                    seen.extend(b);
                }
                MediumRequest::Eof => break,
                MediumRequest::Again => unreachable!(),
            }
        }
        assert_eq!(seen, (0u8..10).collect::<Vec<u8>>());
    }

    #[test]
    fn streams_are_created_once_and_reused() {
        let (trace, sc) = trace_with_class();
        let mut m = BufferMedium::new(trace.clone(), Vec::new());
        let a = m.borrow_stream(&sc, Some(2)).unwrap();
        let b = m.borrow_stream(&sc, Some(2)).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(trace.stream_count(), 1);
        // No stream_instance_id field defaults to instance 0.
        let c = m.borrow_stream(&sc, None).unwrap();
        assert_eq!(c.id(), 0);
    }

    #[test]
    fn seek_repositions_to_byte_offsets() {
        let (trace, _) = trace_with_class();
        let mut m = BufferMedium::with_chunk_len(trace, vec![1, 2, 3, 4], 4);
        m.seek(SeekWhence::Set, 2).unwrap();
        match m.request_bytes(64).unwrap() {
            MediumRequest::Bytes(b) => assert_eq!(b, vec![3, 4]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(m.seek(SeekWhence::Set, 99).is_err());
    }
}
