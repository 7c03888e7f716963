//! Wire format shared by the retrieval client and the image server.
//!
//! Every integer on the wire is a big-endian `int32`:
//!
//! ```text
//! client -> server:  len | query image bytes | requested count
//! server -> client:  (len | image bytes) x requested count
//! ```

pub mod retrieval;

pub use retrieval::{
    check_length, encode_image, parse_length, Endpoint, FrameError, RetrievalRequest, DEFAULT_PORT,
    LENGTH_PREFIX_BYTES, MAX_WIRE_LEN, READ_CHUNK_BYTES,
};
