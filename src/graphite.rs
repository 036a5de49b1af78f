//! Graphite submission (spec §6): carbon pickle-protocol metrics for pool
//! and filesystem gauges, chunked to stay under the listener's size limits.
//! There's no ready-made carbon-pickle crate in the pack, so this hand-rolls
//! the protocol-2 pickle opcodes the same way `sender.rs` hand-rolls the
//! `zfs send` script text and `dropbox.rs` hand-rolls `fnmatch` — a small,
//! fully-specified wire format rather than a pulled-in dependency.

use std::io::{self, Write};
use std::net::TcpStream;

/// Carbon listeners reject payloads much larger than this; stay well clear.
pub const MAX_CHUNK_BYTES: usize = 1024 * 1024;
/// Spec §6: "chunked (<= ~1 MiB per message, <= 1000 samples)".
pub const MAX_CHUNK_SAMPLES: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub path: String,
    pub timestamp: i64,
    pub value: f64,
}

/// `hosts.<host>.zfs.pools.<pool>.<metric>` (spec §6). Snapshots are never
/// submitted; dots in filesystem paths are replaced so the metric tree
/// reflects path components, not literal slashes.
pub fn pool_metric_path(host: &str, pool: &str, metric: &str) -> String {
    format!("hosts.{host}.zfs.pools.{pool}.{metric}")
}

/// `hosts.<host>.zfs.filesystems.<fs-path-with-dots>.<metric>` (spec §6).
pub fn filesystem_metric_path(host: &str, fs_path: &str, metric: &str) -> String {
    let dotted = fs_path.replace('/', ".");
    format!("hosts.{host}.zfs.filesystems.{dotted}.{metric}")
}

/// Pickle protocol-2 encoding of `[(path, (timestamp, value)), ...]`, the
/// structure carbon's pickle receiver expects.
pub fn pickle_encode(samples: &[Sample]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0x80, 0x02]); // PROTO 2
    out.push(b']'); // EMPTY_LIST
    out.push(b'('); // MARK
    for s in samples {
        encode_str(&mut out, &s.path);
        encode_int(&mut out, s.timestamp);
        encode_float(&mut out, s.value);
        out.push(0x86); // TUPLE2: (timestamp, value)
        out.push(0x86); // TUPLE2: (path, (timestamp, value))
    }
    out.push(b'e'); // APPENDS
    out.push(b'.'); // STOP
    out
}

fn encode_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    if bytes.len() < 256 {
        out.push(b'U'); // SHORT_BINSTRING
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
    } else {
        out.push(b'T'); // BINSTRING
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
    }
}

fn encode_int(out: &mut Vec<u8>, v: i64) {
    out.push(b'J'); // BININT (32-bit signed, little-endian)
    out.extend_from_slice(&(v as i32).to_le_bytes());
}

fn encode_float(out: &mut Vec<u8>, v: f64) {
    out.push(b'G'); // BINFLOAT (big-endian IEEE 754 double)
    out.extend_from_slice(&v.to_be_bytes());
}

/// Splits into chunks of at most `MAX_CHUNK_SAMPLES` samples, and further
/// splits any chunk whose pickled payload would exceed `MAX_CHUNK_BYTES`.
pub fn chunk_samples(samples: &[Sample]) -> Vec<&[Sample]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < samples.len() {
        let mut end = (start + MAX_CHUNK_SAMPLES).min(samples.len());
        loop {
            let encoded_len = pickle_encode(&samples[start..end]).len();
            if encoded_len <= MAX_CHUNK_BYTES || end - start <= 1 {
                break;
            }
            end = start + (end - start) / 2;
        }
        chunks.push(&samples[start..end]);
        start = end;
    }
    chunks
}

/// Sends one chunk over a fresh TCP connection: a 4-byte big-endian length
/// header followed by the pickle payload (spec §6: "one TCP connection per
/// chunk").
pub fn send_chunk(host: &str, port: u16, chunk: &[Sample]) -> io::Result<()> {
    let payload = pickle_encode(chunk);
    let mut stream = TcpStream::connect((host, port))?;
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(&payload)?;
    Ok(())
}

/// Submits every sample, chunked, one TCP connection per chunk. Returns the
/// number of chunks sent.
pub fn submit(host: &str, port: u16, samples: &[Sample]) -> io::Result<usize> {
    let chunks = chunk_samples(samples);
    for chunk in &chunks {
        send_chunk(host, port, chunk)?;
    }
    Ok(chunks.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn pool_and_filesystem_metric_paths_follow_spec_grammar() {
        assert_eq!(pool_metric_path("h1", "tank", "free"), "hosts.h1.zfs.pools.tank.free");
        assert_eq!(
            filesystem_metric_path("h1", "tank/fs/sub", "used"),
            "hosts.h1.zfs.filesystems.tank.fs.sub.used"
        );
    }

    #[test]
    fn pickle_encode_matches_expected_opcode_layout() {
        let samples = vec![Sample { path: "a.b".to_string(), timestamp: 100, value: 1.5 }];
        let encoded = pickle_encode(&samples);

        let mut expected = vec![0x80, 0x02, b']', b'('];
        expected.push(b'U');
        expected.push(3);
        expected.extend_from_slice(b"a.b");
        expected.push(b'J');
        expected.extend_from_slice(&100i32.to_le_bytes());
        expected.push(b'G');
        expected.extend_from_slice(&1.5f64.to_be_bytes());
        expected.push(0x86);
        expected.push(0x86);
        expected.push(b'e');
        expected.push(b'.');

        assert_eq!(encoded, expected);
    }

    #[test]
    fn chunk_samples_respects_count_limit() {
        let samples: Vec<Sample> = (0..2500)
            .map(|i| Sample { path: format!("m{i}"), timestamp: i, value: i as f64 })
            .collect();
        let chunks = chunk_samples(&samples);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), MAX_CHUNK_SAMPLES);
        assert_eq!(chunks[1].len(), MAX_CHUNK_SAMPLES);
        assert_eq!(chunks[2].len(), 500);
    }

    #[test]
    fn chunk_samples_respects_byte_limit_for_oversized_paths() {
        let samples: Vec<Sample> = (0..10)
            .map(|i| Sample { path: "x".repeat(200_000), timestamp: i, value: 0.0 })
            .collect();
        let chunks = chunk_samples(&samples);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(pickle_encode(chunk).len() <= MAX_CHUNK_BYTES);
        }
    }

    #[test]
    fn submit_sends_length_prefixed_pickle_over_one_connection_per_chunk() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let samples = vec![
            Sample { path: "hosts.h1.zfs.pools.tank.free".to_string(), timestamp: 1000, value: 42.0 },
        ];
        let expected_payload = pickle_encode(&samples);

        let handle = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut len_buf = [0u8; 4];
            conn.read_exact(&mut len_buf).unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            conn.read_exact(&mut payload).unwrap();
            payload
        });

        let chunks_sent = submit("127.0.0.1", port, &samples).unwrap();
        assert_eq!(chunks_sent, 1);
        let received = handle.join().unwrap();
        assert_eq!(received, expected_payload);
    }
}
