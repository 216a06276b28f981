//! Decode fuzz target: arbitrary bytes as one payload and as a framed stream.
//! Neither path may panic or allocate more than the input can justify.
//! Build with: cargo fuzz run decode_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    let codec = logproto::Codec::default();
    if let Ok(record) = codec.decode_record(data) {
        let mut again = Vec::new();
        codec.encode_record(&record, &mut again).expect("decoded record re-encodes");
    }

    let config = logproto::ReaderConfig { max_frame_len: 1 << 16, read_chunk: 61, ..Default::default() };
    let _ = logproto::read_filtered(&logproto::CancellationToken::new(), data, None, &config, |_| {
        std::ops::ControlFlow::Continue(())
    });
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run decode_fuzz");
}
