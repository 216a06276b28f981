//! Filter fuzz target: compile arbitrary text and, when it compiles, evaluate it.
//! Compilation returns Ok or Err; evaluation may fail but must not panic.
//! Build with: cargo fuzz run filter_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    let s = match std::str::from_utf8(data) {
        Ok(x) => x,
        Err(_) => return,
    };
    if let Ok(program) = logproto::compile(s) {
        let mut record = logproto::Record { message: "fuzz".into(), ..Default::default() };
        record.attrs.insert("n".into(), logproto::Value::Int(-1));
        let _ = program.evaluate(&record);
    }
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run filter_fuzz");
}
