//! NAL unit splitting (Annex-B and length-prefixed framings), type
//! inspection, and Annex-B reassembly. See `spec.md` §4.A.

/// The H.264 NAL unit types this system cares about. The low 5 bits of the
/// first body byte identify the type; anything else is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalType {
    NonIdrSlice,
    IdrSlice,
    Sei,
    Sps,
    Pps,
    Aud,
    Other(u8),
}

impl NalType {
    pub fn from_body(body: &[u8]) -> Option<Self> {
        let header = *body.first()?;
        Some(match header & 0x1f {
            1 => NalType::NonIdrSlice,
            5 => NalType::IdrSlice,
            6 => NalType::Sei,
            7 => NalType::Sps,
            8 => NalType::Pps,
            9 => NalType::Aud,
            other => NalType::Other(other),
        })
    }
}

pub type NalUnit = Vec<u8>;

fn start_code_len_at(buf: &[u8], pos: usize) -> Option<usize> {
    if buf.len() >= pos + 4 && buf[pos..pos + 4] == [0, 0, 0, 1] {
        Some(4)
    } else if buf.len() >= pos + 3 && buf[pos..pos + 3] == [0, 0, 1] {
        Some(3)
    } else {
        None
    }
}

fn find_next_start_code(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        if let Some(len) = start_code_len_at(buf, i) {
            return Some((i, len));
        }
        i += 1;
    }
    None
}

/// Splits an Annex-B byte stream (leading 3- or 4-byte `0x000001` /
/// `0x00000001` start codes) into NAL bodies, without the start codes.
/// Malformed/garbage bytes before the first start code, or after the last
/// complete NAL, are silently discarded.
pub fn split_annex_b(buf: &[u8]) -> Vec<NalUnit> {
    let mut out = Vec::new();
    let Some((mut pos, mut code_len)) = find_next_start_code(buf, 0) else {
        return out;
    };
    loop {
        let body_start = pos + code_len;
        match find_next_start_code(buf, body_start) {
            Some((next_pos, next_len)) => {
                out.push(buf[body_start..next_pos].to_vec());
                pos = next_pos;
                code_len = next_len;
            }
            None => {
                if body_start < buf.len() {
                    out.push(buf[body_start..].to_vec());
                }
                break;
            }
        }
    }
    out
}

/// Splits a length-prefixed (MP4-style) buffer: each NAL is preceded by a
/// 4-byte big-endian length. A truncated trailing length or body is
/// discarded rather than treated as an error.
pub fn split_length_prefixed(buf: &[u8]) -> Vec<NalUnit> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= buf.len() {
        let len = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        pos += 4;
        if pos + len > buf.len() {
            break;
        }
        out.push(buf[pos..pos + len].to_vec());
        pos += len;
    }
    out
}

/// Detects framing (Annex-B vs length-prefixed) by checking whether the
/// buffer opens with a start code, and splits accordingly.
pub fn split_auto(buf: &[u8]) -> Vec<NalUnit> {
    if start_code_len_at(buf, 0).is_some() {
        split_annex_b(buf)
    } else {
        split_length_prefixed(buf)
    }
}

/// Prefixes each NAL body with a 4-byte `0x00000001` start code and
/// concatenates them into a single Annex-B buffer.
pub fn to_annex_b(nals: &[NalUnit]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nals.iter().map(|n| n.len() + 4).sum());
    for nal in nals {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nal);
    }
    out
}

/// Incremental Annex-B splitter for subprocess stdout streams: fed chunks
/// of bytes, it yields complete NAL bodies as soon as the *next* start
/// code is seen, retaining the undetermined tail (up to 3 bytes of a
/// possible start code) for the next call. See `spec.md` §4.A "Streaming
/// split".
#[derive(Default)]
pub struct StreamingSplitter {
    buf: Vec<u8>,
}

impl StreamingSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends newly-read bytes and drains every NAL body that is now
    /// fully bounded by two start codes. The buffer retains everything
    /// from the last start code onward (the current, possibly incomplete,
    /// NAL).
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<NalUnit> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        let Some((first_pos, first_len)) = find_next_start_code(&self.buf, 0) else {
            // No start code yet; keep at most the last 3 bytes, the rest
            // can never become one (a start code is at most 4 bytes).
            if self.buf.len() > 3 {
                let keep_from = self.buf.len() - 3;
                self.buf.drain(0..keep_from);
            }
            return out;
        };

        // Discard any garbage preceding the first start code.
        if first_pos > 0 {
            self.buf.drain(0..first_pos);
        }
        let mut pos = 0usize;
        let mut code_len = first_len;
        loop {
            let body_start = pos + code_len;
            match find_next_start_code(&self.buf, body_start) {
                Some((next_pos, next_len)) => {
                    out.push(self.buf[body_start..next_pos].to_vec());
                    pos = next_pos;
                    code_len = next_len;
                }
                None => break,
            }
        }
        if pos > 0 {
            self.buf.drain(0..pos);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annex_b_of(bodies: &[&[u8]]) -> Vec<u8> {
        let owned: Vec<NalUnit> = bodies.iter().map(|b| b.to_vec()).collect();
        to_annex_b(&owned)
    }

    #[test]
    fn split_then_reassemble_round_trips() {
        let bodies: Vec<&[u8]> = vec![&[0x67, 1, 2, 3], &[0x68, 4, 5], &[0x65, 6, 7, 8, 9]];
        let buf = annex_b_of(&bodies);
        let split = split_annex_b(&buf);
        assert_eq!(split, bodies.iter().map(|b| b.to_vec()).collect::<Vec<_>>());
        let reassembled = to_annex_b(&split);
        assert_eq!(split_annex_b(&reassembled), split);
    }

    #[test]
    fn split_annex_b_discards_trailing_garbage() {
        let mut buf = annex_b_of(&[&[0x67, 1, 2]]);
        buf.extend_from_slice(&[9, 9, 9]); // no following start code, no body
        let split = split_annex_b(&buf);
        assert_eq!(split, vec![vec![0x67u8, 1, 2, 9, 9, 9]]);
    }

    #[test]
    fn split_length_prefixed_round_trips() {
        let bodies: Vec<&[u8]> = vec![&[0x67, 1, 2, 3], &[0x65, 4, 5]];
        let mut buf = Vec::new();
        for b in &bodies {
            buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
            buf.extend_from_slice(b);
        }
        let split = split_length_prefixed(&buf);
        assert_eq!(split, bodies.iter().map(|b| b.to_vec()).collect::<Vec<_>>());
    }

    #[test]
    fn split_length_prefixed_discards_truncated_tail() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(3u32).to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3]);
        buf.extend_from_slice(&(10u32).to_be_bytes()); // claims 10 bytes, has none
        let split = split_length_prefixed(&buf);
        assert_eq!(split, vec![vec![1u8, 2, 3]]);
    }

    #[test]
    fn nal_type_reads_low_five_bits() {
        assert_eq!(NalType::from_body(&[0x67]), Some(NalType::Sps));
        assert_eq!(NalType::from_body(&[0x68]), Some(NalType::Pps));
        assert_eq!(NalType::from_body(&[0x65]), Some(NalType::IdrSlice));
        assert_eq!(NalType::from_body(&[0x41]), Some(NalType::NonIdrSlice));
        assert_eq!(NalType::from_body(&[0x06]), Some(NalType::Sei));
        assert_eq!(NalType::from_body(&[0x09]), Some(NalType::Aud));
        assert_eq!(NalType::from_body(&[]), None);
    }

    #[test]
    fn streaming_splitter_yields_only_complete_nals() {
        let mut splitter = StreamingSplitter::new();
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&[0, 0, 0, 1]);
        chunk.extend_from_slice(&[0x67, 1, 2]);
        // start code bytes for the next NAL, split mid-sequence so it is
        // not yet a recognizable start code
        chunk.extend_from_slice(&[0, 0]);
        let out1 = splitter.feed(&chunk);
        assert!(out1.is_empty(), "first NAL not yet bounded by a complete start code");

        // completes the 3-byte start code after the first NAL; the
        // second NAL is now open but has no terminating start code yet
        let out2 = splitter.feed(&[1, 0x65, 9, 9]);
        assert_eq!(out2, vec![vec![0x67u8, 1, 2]]);

        let out3 = splitter.feed(&[0, 0, 0, 1, 0x68]);
        assert_eq!(out3, vec![vec![0x65u8, 9, 9]]);
    }

    #[test]
    fn streaming_splitter_matches_bulk_split_over_random_chunking() {
        let bodies: Vec<&[u8]> = vec![&[0x67, 1, 2], &[0x68, 3], &[0x65, 4, 5, 6], &[0x41, 7]];
        let buf = annex_b_of(&bodies);

        let mut splitter = StreamingSplitter::new();
        let mut got = Vec::new();
        for byte in &buf {
            got.extend(splitter.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(got, bodies[..3].iter().map(|b| b.to_vec()).collect::<Vec<_>>());
    }
}
