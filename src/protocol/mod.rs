pub mod codec;

pub use codec::{decode_blocking, decode_blocking_limited, encode, FrameReader};

// Wire protocol shared by the relay, the notify hook and mounted replicas:
// `message := length(4 bytes, big-endian) payload(length bytes)`.
// Subscribers only ever receive frames; notify senders send exactly one.
