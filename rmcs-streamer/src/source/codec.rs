use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::h264::{NalUnit, StreamingSplitter};

/// Adapts the pure [`StreamingSplitter`] to `tokio_util`'s `Decoder`
/// trait so subprocess stdout can be read as a `Stream<Item = NalUnit>`
/// via `FramedRead` instead of a hand-rolled read loop (`spec.md` §9
/// "Subprocess as a coroutine substitute").
#[derive(Default)]
pub struct AnnexBDecoder {
    splitter: StreamingSplitter,
    pending: std::collections::VecDeque<NalUnit>,
}

impl Decoder for AnnexBDecoder {
    type Item = NalUnit;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(nal) = self.pending.pop_front() {
            return Ok(Some(nal));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let chunk = src.split().freeze();
        let nals = self.splitter.feed(&chunk);
        self.pending.extend(nals);
        Ok(self.pending.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_across_multiple_feeds() {
        let mut decoder = AnnexBDecoder::default();

        let mut buf = BytesMut::from(&[0, 0, 0, 1, 0x67, 1, 2, 0, 0, 0, 1, 0x68, 3, 4][..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(vec![0x67u8, 1, 2]));
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            None,
            "second NAL not yet bounded by a following start code"
        );

        let mut more = BytesMut::from(&[0, 0, 0, 1][..]);
        assert_eq!(decoder.decode(&mut more).unwrap(), Some(vec![0x68u8, 3, 4]));
    }

    #[test]
    fn decode_on_empty_buffer_is_pending_none() {
        let mut decoder = AnnexBDecoder::default();
        let mut buf = BytesMut::new();
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }
}
