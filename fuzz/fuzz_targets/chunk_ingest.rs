//! Fuzz target for chunk parsing and reassembly.
//!
//! Tests:
//! - Arbitrary chunk messages never panic the reassembler
//! - Any payload split at any chunk size reassembles to itself

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mdml_client::chunk::{chunk, ReassembledPayload, Reassembler};

#[derive(Debug, Arbitrary)]
struct IngestInput {
    /// Raw lines fed to the reassembler as received messages
    lines: Vec<String>,
    /// Payload for the round-trip check
    payload: Vec<u8>,
    /// Chunk size, mapped into 1..=4096
    chunk_size: u16,
}

fuzz_target!(|input: IngestInput| {
    let mut reassembler = Reassembler::new();
    for line in &input.lines {
        let _ = reassembler.ingest_json(line);
    }

    let size = usize::from(input.chunk_size % 4096) + 1;
    let mut parts: Vec<_> = chunk(input.payload.as_slice(), size, "fuzz")
        .expect("valid chunk arguments")
        .collect();
    parts.reverse();

    let mut fresh = Reassembler::new();
    let mut done = None;
    for part in parts {
        done = fresh.ingest(part).expect("consistent parts").or(done);
    }
    let file = done.expect("transfer completes");
    assert_eq!(file.payload, ReassembledPayload::Bytes(input.payload));
});
