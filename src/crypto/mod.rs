//! Inner random stream - seekable stream ciphers used to mask protected values

mod keystream;
mod stream_key;

pub use keystream::{ChaCha20Keystream, Keystream, Salsa20Keystream, SharedKeystream};
pub use stream_key::{InnerStreamAlgorithm, InnerStreamKey};
