//! Fuzz target for CBOR message decoding
//!
//! Arbitrary bytes fed to every decoder that reads peer or disk input.
//! Decoding must return an error for invalid data and never panic.

#![no_main]

use keystep_core::channel::ReceivedMessage;
use keystep_proto::{ChannelMessage, ProtocolMessage, encoding};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = encoding::decode::<ChannelMessage>(data);
    let _ = encoding::decode::<ProtocolMessage>(data);
    let _ = encoding::decode::<ReceivedMessage>(data);
});
