//! Zero-copy text pipeline: raw bytes → decoded pooled buffers → line views

pub mod decode;
pub mod pool;
pub mod ring;
pub mod splitter;

pub use decode::{Encoding, Newline, SingleByteDecoder, TextDecoder, Utf8Decoder, MAX_CHAR_BYTES};
pub use pool::{BufferPool, LineView, PooledBuffer, Segment};
pub use ring::{RingByteBuffer, RingDecode};
pub use splitter::{LineSplitter, SplitState};
