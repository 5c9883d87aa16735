//! Bit-packed wire encoding.
//!
//! Every netnext packet body and the session data blob are bit streams:
//! integers take only the bits their declared range needs, booleans take a
//! single bit, and byte runs are aligned to a byte boundary first.

pub mod bits;
pub mod stream;

pub use bits::{bits_required, bits_required_signed};
pub use stream::{ReadStream, WriteStream};
