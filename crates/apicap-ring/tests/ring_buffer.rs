use apicap_ring::RingBuffer;
use proptest::prelude::*;
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use std::collections::VecDeque;
use std::sync::Arc;

/// Consumes `size` bytes through the wrap-aware path.
fn drain(rb: &RingBuffer, size: usize) -> Vec<u8> {
    let out = rb.peek(size, |first, second| [first, second].concat());
    rb.read_pointer_advance(size);
    out
}

#[test]
fn ring_buffer_single_thread_fuzz() {
    // Tiny capacity to force wraparound on most operations.
    let rb = RingBuffer::new(97);
    let mut model: VecDeque<u8> = VecDeque::new();

    let mut rng = StdRng::seed_from_u64(0x1234_5678_9ABC_DEF0);
    for _ in 0..50_000 {
        assert_eq!(rb.size_to_write() + rb.size_to_read(), rb.capacity());
        assert_eq!(rb.size_to_read(), model.len());

        if rng.gen_bool(0.5) {
            // Keep one byte of slack: filling the ring exactly reads back as empty.
            let free = rb.size_to_write().saturating_sub(1);
            let len = rng.gen_range(0..=free);
            let mut msg = vec![0u8; len.min(40)];
            rng.fill_bytes(&mut msg);
            rb.write(&msg).unwrap();
            model.extend(&msg);
        } else {
            let len = rng.gen_range(0..=rb.size_to_read());
            let got = drain(&rb, len);
            let expected: Vec<u8> = model.drain(..len).collect();
            assert_eq!(got, expected);
        }
    }

    let rest = rb.size_to_read();
    let got = drain(&rb, rest);
    let expected: Vec<u8> = model.drain(..).collect();
    assert_eq!(got, expected);
    assert!(rb.is_empty());
}

#[test]
fn write_of_exact_free_space_is_readable_through_pointer_path() {
    let rb = RingBuffer::new(32);
    rb.write(&[0u8; 20]).unwrap();
    rb.read_pointer_advance(20);

    // Cursors are equal, so the whole ring is free; this write straddles the end.
    let data: Vec<u8> = (0u8..32).collect();
    assert_eq!(rb.size_to_write(), 32);
    rb.write(&data).unwrap();

    // The accounting now reports empty, but the bytes are in place.
    assert!(rb.is_empty());
    assert_eq!(drain(&rb, 32), data);
}

#[test]
fn ring_buffer_spsc_concurrent() {
    let rb = Arc::new(RingBuffer::new(509));
    let producer = rb.clone();
    let consumer = rb.clone();

    const N: u32 = 100_000;

    let t_prod = std::thread::spawn(move || {
        for i in 0..N {
            let buf = i.to_le_bytes();
            while producer.size_to_write() <= buf.len() {
                std::thread::yield_now();
            }
            producer.write(&buf).unwrap();
        }
    });

    let t_cons = std::thread::spawn(move || {
        for i in 0..N {
            while consumer.size_to_read() < 4 {
                std::thread::yield_now();
            }
            let msg = drain(&consumer, 4);
            let got = u32::from_le_bytes(msg[..4].try_into().unwrap());
            assert_eq!(got, i);
        }
    });

    t_prod.join().unwrap();
    t_cons.join().unwrap();
    assert!(rb.is_empty());
}

proptest! {
    #[test]
    fn write_then_wrap_aware_read_round_trips(
        capacity in 1usize..256,
        prefix in 0usize..256,
        data in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let rb = RingBuffer::new(capacity);
        // Move the cursors somewhere in the middle of the buffer first.
        let prefix = prefix % capacity;
        rb.write(&vec![0xAA; prefix]).unwrap();
        rb.read_pointer_advance(prefix);

        let len = data.len().min(rb.size_to_write());
        let data = &data[..len];
        rb.write(data).unwrap();
        if len < capacity {
            prop_assert_eq!(rb.size_to_read(), len);
        }
        prop_assert_eq!(rb.size_to_write() + rb.size_to_read(), capacity);
        prop_assert_eq!(drain(&rb, len), data.to_vec());
        prop_assert_eq!(rb.size_to_write() + rb.size_to_read(), capacity);
    }
}
