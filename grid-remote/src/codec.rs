use anyhow::{anyhow, Context};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use grid_core::ext::{decode_bytes, encode_bytes, read_u32};
use grid_core::message::ClientMessage;

/// u32 big endian length prefix followed by a bincode encoded [`ClientMessage`].
#[derive(Debug, Copy, Clone)]
pub struct MessageCodec {
    max_frame_size: usize,
}

impl MessageCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Encoder<ClientMessage> for MessageCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: ClientMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = encode_bytes(&item)?;
        if body.len() > self.max_frame_size {
            return Err(anyhow!(
                "frame of {} bytes exceeds max frame size {}",
                body.len(),
                self.max_frame_size
            ));
        }
        let len = u32::try_from(body.len()).context("frame too large")?;
        dst.reserve(4 + body.len());
        dst.put_u32(len);
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = ClientMessage;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let buf_len = src.len();
        if buf_len < 4 {
            return Ok(None);
        }
        let body_len = read_u32(src, 0) as usize;
        if body_len > self.max_frame_size {
            return Err(anyhow!(
                "incoming frame of {} bytes exceeds max frame size {}",
                body_len,
                self.max_frame_size
            ));
        }
        if body_len > buf_len - 4 {
            src.reserve(4 + body_len - buf_len);
            return Ok(None);
        }
        let frame = src.split_to(4 + body_len);
        let message = decode_bytes::<ClientMessage>(&frame[4..])?;
        Ok(Some(message))
    }
}
