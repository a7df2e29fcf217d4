use std::cell::Cell;
use std::io::{Cursor, Read};
use std::rc::Rc;

use apicap_file::{
    BlockCodec, ChunkedReader, ChunkedWriter, FileOptions, Lz4Block, Mode, Offset, TraceFile,
};
use proptest::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

const CHUNK: usize = 4096;

fn options() -> FileOptions {
    FileOptions { chunk_size: CHUNK }
}

/// Half random, half repetitive, so blocks actually compress.
fn sample(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .map(|i| if (i / 512) % 2 == 0 { rng.gen() } else { (i % 13) as u8 })
        .collect()
}

fn encode(data: &[u8]) -> Vec<u8> {
    let mut w = ChunkedWriter::with_options(Cursor::new(Vec::new()), options()).unwrap();
    w.append(data).unwrap();
    w.finish().unwrap().into_inner()
}

#[test]
fn round_trip_at_chunk_boundaries() {
    for len in [0, 1, CHUNK - 1, CHUNK, CHUNK + 1, 10 * CHUNK] {
        let data = sample(len, len as u64);
        let encoded = encode(&data);

        let mut r = ChunkedReader::new(Cursor::new(encoded)).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), data.len(), "len={len}");
        assert_eq!(out, data, "len={len}");
        assert!(r.end_of_data());
    }
}

#[test]
fn round_trip_with_default_chunk_size_and_odd_writes() {
    let data = sample(3 * 1024 * 1024 + 17, 7);
    let mut w = ChunkedWriter::new(Cursor::new(Vec::new())).unwrap();
    let mut rng = StdRng::seed_from_u64(99);
    let mut pos = 0;
    while pos < data.len() {
        let n = rng.gen_range(1..200_000).min(data.len() - pos);
        w.append(&data[pos..pos + n]).unwrap();
        pos += n;
    }
    w.flush().unwrap();
    assert_eq!(w.chunks_written(), 4);

    let mut r = ChunkedReader::new(Cursor::new(w.finish().unwrap().into_inner())).unwrap();
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn seeking_to_captured_offsets_resumes_reading() {
    let data = sample(10 * CHUNK + 123, 42);
    let encoded = encode(&data);

    // Capture offsets while reading sequentially: one per chunk boundary plus
    // one mid-chunk.
    let mut r = ChunkedReader::new(Cursor::new(encoded.clone())).unwrap();
    let mut marks: Vec<(usize, Offset)> = vec![(0, r.current_offset())];
    let mut consumed = 0;
    let mut buf = vec![0u8; CHUNK];
    while consumed < data.len() {
        let n = r.read_bytes(&mut buf).unwrap();
        consumed += n;
        marks.push((consumed, r.current_offset()));
    }
    let mut half = vec![0u8; CHUNK / 2];
    r.set_current_offset(marks[3].1).unwrap();
    r.read_exact(&mut half).unwrap();
    marks.push((marks[3].0 + half.len(), r.current_offset()));

    for (pos, offset) in marks {
        let mut r = ChunkedReader::new(Cursor::new(encoded.clone())).unwrap();
        r.set_current_offset(offset).unwrap();
        let mut rest = Vec::new();
        r.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, &data[pos..], "resume at {offset} (byte {pos})");
    }
}

#[test]
fn writer_offsets_are_valid_reader_offsets() {
    let data = sample(5 * CHUNK + 300, 3);
    let mut w = ChunkedWriter::with_options(Cursor::new(Vec::new()), options()).unwrap();
    let mut marks = Vec::new();
    let mut written = 0;
    for piece in data.chunks(CHUNK) {
        w.append(piece).unwrap();
        written += piece.len();
        marks.push((written, w.current_offset()));
    }
    let encoded = w.finish().unwrap().into_inner();

    for (pos, offset) in marks {
        if pos % CHUNK == 0 {
            // Every full piece flushed a chunk, so the offset names a fresh one.
            assert_eq!(offset.offset_in_chunk, 0);
        }
        let mut r = ChunkedReader::new(Cursor::new(encoded.clone())).unwrap();
        r.set_current_offset(offset).unwrap();
        let mut rest = Vec::new();
        r.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, &data[pos..], "resume at {offset}");
    }
}

#[test]
fn percent_read_is_monotonic_and_reaches_100() {
    let data = sample(7 * CHUNK + 5, 11);
    let mut r = ChunkedReader::new(Cursor::new(encode(&data))).unwrap();
    let mut last = r.percent_read();
    let mut buf = [0u8; 1000];
    loop {
        let n = r.read_bytes(&mut buf).unwrap();
        let pct = r.percent_read();
        assert!(pct >= last, "{pct} < {last}");
        assert!(pct <= 100);
        last = pct;
        if n == 0 {
            break;
        }
    }
    assert_eq!(last, 100);
}

/// Counts decompressions so skipping can be observed.
#[derive(Clone, Default)]
struct CountingCodec {
    decompressed: Rc<Cell<usize>>,
}

impl BlockCodec for CountingCodec {
    fn max_compressed_size(&self, len: usize) -> usize {
        Lz4Block.max_compressed_size(len)
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> apicap_file::Result<usize> {
        Lz4Block.compress(src, dst)
    }

    fn decompressed_size(&self, src: &[u8]) -> apicap_file::Result<usize> {
        Lz4Block.decompressed_size(src)
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> apicap_file::Result<()> {
        self.decompressed.set(self.decompressed.get() + 1);
        Lz4Block.decompress(src, dst)
    }
}

#[test]
fn skip_does_not_decompress_chunks_it_passes_over() {
    let data = sample(6 * CHUNK, 5);
    let codec = CountingCodec::default();
    let mut r = ChunkedReader::with_codec(Cursor::new(encode(&data)), codec.clone()).unwrap();
    assert_eq!(codec.decompressed.get(), 1);

    // Land in the middle of the fifth chunk; the three before it are passed over.
    let target = 4 * CHUNK + 100;
    assert!(r.skip(target).unwrap());
    assert_eq!(codec.decompressed.get(), 2);

    let mut buf = [0u8; 50];
    r.read_exact(&mut buf).unwrap();
    assert_eq!(&buf[..], &data[target..target + 50]);

    assert!(r.skip(10 * CHUNK).unwrap());
    assert!(r.end_of_data());
    assert!(!r.skip(1).unwrap());
}

#[test]
fn trace_file_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.trace");
    let data = sample(3 * CHUNK + 9, 1);

    let mut out = TraceFile::open_with_options(&path, Mode::Write, options()).unwrap();
    out.write(&data[..CHUNK + 1]).unwrap();
    let bookmark = out.current_offset();
    out.flush().unwrap();
    out.write(&data[CHUNK + 1..]).unwrap();
    out.close().unwrap();

    let mut input = TraceFile::open(&path, Mode::Read).unwrap();
    assert!(input.supports_offsets());
    input.set_current_offset(bookmark).unwrap();
    let mut rest = vec![0u8; data.len() - CHUNK - 1];
    let mut filled = 0;
    while filled < rest.len() {
        let n = input.read(&mut rest[filled..]).unwrap();
        assert!(n > 0);
        filled += n;
    }
    assert_eq!(rest, &data[CHUNK + 1..]);
}

proptest! {
    // Not a replacement for coverage-guided fuzzing, but it does guard against
    // panics on corrupted/truncated inputs.
    #[test]
    fn decoder_never_panics(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let mut bytes = b"at".to_vec();
        bytes.extend_from_slice(&data);
        if let Ok(mut r) = ChunkedReader::new(Cursor::new(bytes)) {
            let mut out = Vec::new();
            let _ = r.read_to_end(&mut out);
        }
    }

    #[test]
    fn arbitrary_write_splits_round_trip(
        data in proptest::collection::vec(any::<u8>(), 0..2048),
        splits in proptest::collection::vec(1usize..300, 1..20),
        chunk_size in 1usize..512,
    ) {
        let options = FileOptions { chunk_size };
        let mut w = ChunkedWriter::with_options(Cursor::new(Vec::new()), options).unwrap();
        let mut pos = 0;
        for n in splits.iter().cycle() {
            if pos >= data.len() {
                break;
            }
            let end = (pos + n).min(data.len());
            w.append(&data[pos..end]).unwrap();
            pos = end;
        }
        let encoded = w.finish().unwrap().into_inner();
        let mut r = ChunkedReader::new(Cursor::new(encoded)).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        prop_assert_eq!(out, data);
    }
}
