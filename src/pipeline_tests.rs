//! Layered test harness for the threaded compression pipeline.
//!
//! Uses flate2's `MultiGzDecoder` as the ground-truth gzip reader and checks
//! each layer before the composition above it.
//!
//! Layer 0: CompressOracle: known data, reference decoder
//! Layer 1: Members: every block is an independent, marked gzip member
//! Layer 2: Ordering: output independent of thread count and queue depth
//! Layer 3: Writer: round trips, backpressure, oversized input
//! Layer 4: Lifecycle: close, append, drop, handing back the sink

#[cfg(test)]
mod tests {
    use crate::codec::{parse_header, MARKED_HEADER_LEN};
    use crate::compression::compress_threaded;
    use crate::config::{StreamConfig, Threads};
    use crate::file::open;
    use crate::threaded_writer::ThreadedWriter;
    use flate2::read::MultiGzDecoder;
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};

    // =========================================================================
    // Layer 0: CompressOracle
    // =========================================================================

    struct CompressOracle {
        original: Vec<u8>,
        name: &'static str,
    }

    impl CompressOracle {
        fn new(name: &'static str, data: Vec<u8>) -> Self {
            Self {
                original: data,
                name,
            }
        }

        fn verify_roundtrip(&self, compressed: &[u8], path_name: &str) {
            let decompressed = decompress_reference(compressed);
            assert_eq!(
                decompressed.len(),
                self.original.len(),
                "{} [{}]: decompressed size {} != original {}",
                self.name,
                path_name,
                decompressed.len(),
                self.original.len()
            );
            assert!(
                decompressed == self.original,
                "{} [{}]: decompressed content differs from original",
                self.name,
                path_name
            );
        }
    }

    fn decompress_reference(gz_data: &[u8]) -> Vec<u8> {
        let mut decoder = MultiGzDecoder::new(gz_data);
        let mut output = Vec::new();
        decoder.read_to_end(&mut output).unwrap();
        output
    }

    fn make_literal_data(size: usize) -> Vec<u8> {
        let mut rng: u64 = 0x9e3779b97f4a7c15;
        (0..size)
            .map(|_| {
                rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (rng >> 33) as u8
            })
            .collect()
    }

    fn make_rle_data(size: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(size);
        let mut i = 0usize;
        while data.len() < size {
            let run = 1000.min(size - data.len());
            data.extend(std::iter::repeat((i % 256) as u8).take(run));
            i += 1;
        }
        data
    }

    fn make_mixed_data(size: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(size);
        let mut rng: u64 = 0xdeadbeef;
        let phrases: &[&[u8]] = &[
            b"the quick brown fox jumps over the lazy dog. ",
            b"pack my box with five dozen liquor jugs! ",
            b"0123456789 abcdefghijklmnopqrstuvwxyz\n",
        ];
        while data.len() < size {
            rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1);
            if (rng >> 32) % 5 < 2 {
                data.push((rng >> 16) as u8);
            } else {
                let phrase = phrases[((rng >> 24) as usize) % phrases.len()];
                let remaining = size - data.len();
                data.extend_from_slice(&phrase[..remaining.min(phrase.len())]);
            }
        }
        data.truncate(size);
        data
    }

    fn config(threads: usize, block_size: usize) -> StreamConfig {
        StreamConfig::default()
            .with_threads(Threads::Count(threads))
            .with_block_size(block_size)
    }

    fn compress_chunked(data: &[u8], config: StreamConfig, chunk: usize) -> Vec<u8> {
        let mut writer = ThreadedWriter::new(Vec::new(), config).unwrap();
        for piece in data.chunks(chunk.max(1)) {
            writer.write_all(piece).unwrap();
        }
        writer.finish().unwrap()
    }

    /// Split a stream written by the threaded writer into its members
    fn split_members(stream: &[u8]) -> Vec<&[u8]> {
        let mut members = Vec::new();
        let mut pos = 0;
        while pos < stream.len() {
            let header = parse_header(&stream[pos..]).unwrap().unwrap();
            let size = header.member_size.expect("threaded members carry a size marker");
            members.push(&stream[pos..pos + size]);
            pos += size;
        }
        members
    }

    // =========================================================================
    // Layer 0 tests: oracle self-consistency
    // =========================================================================

    #[test]
    fn test_oracle_data_shapes() {
        let literal = make_literal_data(10_000);
        let rle = make_rle_data(10_000);
        let mixed = make_mixed_data(10_000);
        assert_eq!(literal.len(), 10_000);
        assert_eq!(rle.len(), 10_000);
        assert_eq!(mixed.len(), 10_000);
        assert_eq!(make_literal_data(100), make_literal_data(100));

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&mixed).unwrap();
        let reference = encoder.finish().unwrap();
        CompressOracle::new("mixed", mixed).verify_roundtrip(&reference, "flate2");
    }

    // =========================================================================
    // Layer 1: members
    // =========================================================================

    #[test]
    fn test_one_member_per_block() {
        let data = make_mixed_data(10 * 1000 + 1);
        let compressed = compress_threaded(&data, &config(3, 1000)).unwrap();
        let members = split_members(&compressed);
        assert_eq!(members.len(), 11);

        // Each member stands alone and holds exactly its block
        for (i, member) in members.iter().enumerate() {
            let start = i * 1000;
            let end = (start + 1000).min(data.len());
            assert_eq!(decompress_reference(member), &data[start..end], "member {}", i);
            assert!(member.len() >= MARKED_HEADER_LEN + 8);
        }
    }

    #[test]
    fn test_empty_input_single_empty_member() {
        let compressed = compress_threaded(b"", &config(4, 1024)).unwrap();
        let members = split_members(&compressed);
        assert_eq!(members.len(), 1);
        assert!(decompress_reference(&compressed).is_empty());
    }

    // =========================================================================
    // Layer 2: ordering
    // =========================================================================

    #[test]
    fn test_output_independent_of_thread_count() {
        let data = make_mixed_data(300_000);
        let reference = compress_threaded(&data, &config(1, 8192)).unwrap();
        for threads in [2, 3, 4, 8] {
            let out = compress_threaded(&data, &config(threads, 8192)).unwrap();
            assert!(out == reference, "threads={} changed the output", threads);
        }
    }

    #[test]
    fn test_output_independent_of_queue_depth_and_write_sizes() {
        let data = make_mixed_data(100_000);
        let reference = compress_threaded(&data, &config(4, 4096)).unwrap();
        for (queue_size, chunk) in [(1, 1), (1, 4096), (3, 999), (8, 100_000)] {
            let out = compress_chunked(&data, config(4, 4096).with_queue_size(queue_size), chunk);
            assert!(
                out == reference,
                "queue_size={} chunk={} changed the output",
                queue_size,
                chunk
            );
        }
    }

    // =========================================================================
    // Layer 3: writer
    // =========================================================================

    #[test]
    fn test_roundtrip_threads_and_block_sizes() {
        for block_size in [1, 17, 4096] {
            let sizes = [0, 1, block_size, 3 * block_size + 5];
            for &size in &sizes {
                let oracle = CompressOracle::new("mixed", make_mixed_data(size));
                for threads in [1, 2, 3] {
                    let out = compress_threaded(&oracle.original, &config(threads, block_size)).unwrap();
                    oracle.verify_roundtrip(
                        &out,
                        &format!("T={} B={} n={}", threads, block_size, size),
                    );
                }
            }
        }
    }

    #[test]
    fn test_roundtrip_data_shapes_all_levels() {
        let oracles = [
            CompressOracle::new("literal", make_literal_data(200_000)),
            CompressOracle::new("rle", make_rle_data(200_000)),
            CompressOracle::new("mixed", make_mixed_data(200_000)),
        ];
        for oracle in &oracles {
            for level in [0, 1, 6, 9] {
                let out = compress_threaded(&oracle.original, &config(3, 32 * 1024).with_level(level))
                    .unwrap();
                oracle.verify_roundtrip(&out, &format!("L{}", level));
            }
        }
    }

    #[test]
    fn test_backpressure_large_stream() {
        // Far more data than threads * block_size * queue_size can hold
        let oracle = CompressOracle::new("mixed", make_mixed_data(4 * 1024 * 1024));
        let out = compress_chunked(
            &oracle.original,
            config(2, 16 * 1024).with_queue_size(1).with_level(1),
            10_007,
        );
        oracle.verify_roundtrip(&out, "backpressure");
        assert_eq!(split_members(&out).len(), 256);
    }

    #[test]
    fn test_single_oversized_incompressible_write() {
        let block_size = 4096;
        let oracle = CompressOracle::new("literal", make_literal_data(5 * block_size + 123));
        let mut writer = ThreadedWriter::new(Vec::new(), config(3, block_size).with_level(9)).unwrap();
        writer.write_all(&oracle.original).unwrap();
        let out = writer.finish().unwrap();
        oracle.verify_roundtrip(&out, "oversized write");
        assert_eq!(split_members(&out).len(), 6);
    }

    // =========================================================================
    // Layer 4: lifecycle
    // =========================================================================

    /// Sink shared with the test so it can be inspected after the writer is gone
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_idempotent_close() {
        let sink = SharedSink::default();
        let mut writer = ThreadedWriter::new(sink.clone(), config(2, 100)).unwrap();
        writer.write_all(&make_mixed_data(1000)).unwrap();
        writer.close().unwrap();
        let first = sink.contents();
        writer.close().unwrap();
        assert_eq!(sink.contents(), first);
        assert_eq!(decompress_reference(&first), make_mixed_data(1000));
    }

    #[test]
    fn test_drop_without_close_finishes_stream() {
        let sink = SharedSink::default();
        {
            let mut writer = ThreadedWriter::new(sink.clone(), config(3, 64)).unwrap();
            writer.write_all(&make_rle_data(5000)).unwrap();
        }
        assert_eq!(decompress_reference(&sink.contents()), make_rle_data(5000));
    }

    #[test]
    fn test_sink_is_handed_back_open() {
        let mut writer = ThreadedWriter::new(Vec::new(), config(2, 1024)).unwrap();
        writer.write_all(b"first").unwrap();
        let mut sink = writer.finish().unwrap();

        // Still ours: more members can follow
        let mut second = ThreadedWriter::new(&mut sink, config(2, 1024)).unwrap();
        second.write_all(b" second").unwrap();
        second.close().unwrap();
        drop(second);
        assert_eq!(decompress_reference(&sink), b"first second");
    }

    #[test]
    fn test_append_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ab.gz");

        let mut f = open(&path, "wb", config(2, 1)).unwrap();
        f.write_all(b"AB").unwrap();
        f.close().unwrap();

        let mut f = open(&path, "ab", config(3, 1)).unwrap();
        f.write_all(b"CD").unwrap();
        f.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(decompress_reference(&bytes), b"ABCD");
        assert_eq!(split_members(&bytes).len(), 4);
    }
}
