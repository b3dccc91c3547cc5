use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::error::RntbdError;
use crate::protocol::Frame;

/// Length-prefixed RNTBD frame codec for `FramedRead` / `FramedWrite`.
///
/// Decoding is resumable: partial frames stay in the read buffer until the
/// declared length has arrived.
#[derive(Debug, Default, Clone, Copy)]
pub struct RntbdCodec;

impl RntbdCodec {
    pub fn new() -> Self {
        RntbdCodec
    }
}

impl Decoder for RntbdCodec {
    type Item = Frame;
    type Error = RntbdError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, RntbdError> {
        Frame::decode(src)
    }
}

impl Encoder<Frame> for RntbdCodec {
    type Error = RntbdError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), RntbdError> {
        frame.encode(dst)
    }
}
