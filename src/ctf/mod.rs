//! The CTF decoding path: medium abstraction, binary type reader,
//! stream decoder, and the source component tying them into a graph.

pub mod btr;
pub mod decoder;
pub mod medium;
pub mod source;
#[cfg(test)]
pub(crate) mod testwire;

pub use btr::{Btr, BtrCallbacks, BtrStatus};
pub use decoder::{DecoderNext, StreamDecoder};
pub use medium::{BufferMedium, Medium, MediumRequest, SeekWhence, StreamInfo};
pub use source::{CtfSource, CtfSourceConfig};
