//! Property-based tests for the console byte ring.
//!
//! 1. Bytes arrive complete and in write order, whatever the message sizes
//!    relative to the ring capacity
//! 2. Every non-empty write is announced at least once
//! 3. A drained ring has all its space back

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use emu_thread::console::{self, ConsoleStream};
use emu_thread::event::{self, EmuEvent};
use emu_thread::sync::StopSignal;
use proptest::prelude::*;

// ── Strategies ──────────────────────────────────────────────────────────

fn capacity_strategy() -> impl Strategy<Value = usize> {
    1usize..96
}

/// Messages up to three times the largest capacity, so writes that fit,
/// wrap, and overflow the ring all show up.
fn messages_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..288), 0..24)
}

fn stream_strategy() -> impl Strategy<Value = ConsoleStream> {
    prop_oneof![Just(ConsoleStream::Normal), Just(ConsoleStream::Error)]
}

/// Writes every message from a producer thread while this thread drains in
/// `chunk`-sized reads. Returns the bytes read and the announcements seen.
fn pump(
    capacity: usize,
    messages: Vec<Vec<u8>>,
    stream: ConsoleStream,
    chunk: usize,
) -> (Vec<u8>, usize, usize) {
    let (events, announcements) = event::channel();
    let stop = Arc::new(StopSignal::new());
    let (mut writer, mut reader) = console::channel(capacity, events, stop);

    let total: usize = messages.iter().map(Vec::len).sum();
    let producer = thread::spawn(move || {
        for message in &messages {
            let written = writer.write_bytes(stream, message).unwrap();
            assert_eq!(written, message.len());
        }
    });

    let mut out = Vec::with_capacity(total);
    let mut buf = vec![0; chunk];
    while out.len() < total {
        let n = reader.read_timeout(&mut buf, Duration::from_secs(5));
        assert!(n > 0, "reader starved with {} of {total} bytes", out.len());
        out.extend_from_slice(&buf[..n]);
    }
    producer.join().unwrap();

    let announced = announcements
        .try_iter()
        .filter(|e| *e == EmuEvent::ConsoleDataReady(stream))
        .count();
    (out, announced, reader.free_space())
}

// ── Properties ──────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn bytes_arrive_complete_and_in_order(
        capacity in capacity_strategy(),
        messages in messages_strategy(),
        stream in stream_strategy(),
        chunk in 1usize..128,
    ) {
        let expected: Vec<u8> = messages.concat();
        let non_empty = messages.iter().filter(|m| !m.is_empty()).count();

        let (out, announced, free) = pump(capacity, messages, stream, chunk);

        prop_assert_eq!(out, expected);
        prop_assert!(announced >= non_empty);
        prop_assert_eq!(free, capacity);
    }

    #[test]
    fn formatted_text_matches_std_formatting(
        capacity in 1usize..64,
        words in prop::collection::vec("[a-z]{0,40}", 0..12),
    ) {
        let (events, _announcements) = event::channel();
        let (mut writer, mut reader) =
            console::channel(capacity, events, Arc::new(StopSignal::new()));

        let expected: String = words.iter().map(|w| format!("<{w}>")).collect();
        let producer = thread::spawn(move || {
            for word in &words {
                writer.write(ConsoleStream::Normal, format_args!("<{word}>")).unwrap();
            }
        });

        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        while out.len() < expected.len() {
            let n = reader.read_timeout(&mut buf, Duration::from_secs(5));
            prop_assert!(n > 0);
            out.extend_from_slice(&buf[..n]);
        }
        producer.join().unwrap();

        prop_assert_eq!(String::from_utf8(out).unwrap(), expected);
    }
}
