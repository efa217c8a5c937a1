//! Length-prefixed MessagePack framing.
//!
//! Frame layout: a 4-byte big-endian body length followed by the body,
//! which is one message encoded with `rmp_serde::to_vec_named`.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder};

use super::IpcError;
use super::protocol::{ClientMessage, ServerMessage};

/// Largest accepted frame body. Payloads are small serialized commands;
/// anything near this size is a broken or hostile peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Codec decoding `In` frames and encoding `Out` frames.
pub struct MessageCodec<In, Out> {
    _marker: PhantomData<fn(Out) -> In>,
}

/// Server side: reads client messages, writes server messages.
pub type ServerCodec = MessageCodec<ClientMessage, ServerMessage>;

/// Client side: reads server messages, writes client messages.
pub type ClientCodec = MessageCodec<ServerMessage, ClientMessage>;

impl<In, Out> MessageCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for MessageCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: DeserializeOwned, Out> Decoder for MessageCodec<In, Out> {
    type Item = In;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, IpcError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(IpcError::FrameTooLarge(len));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(len);
        Ok(Some(rmp_serde::from_slice(&body)?))
    }
}

impl<In, Out: Serialize> Encoder<Out> for MessageCodec<In, Out> {
    type Error = IpcError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), IpcError> {
        let body = rmp_serde::to_vec_named(&item)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(IpcError::FrameTooLarge(body.len()));
        }

        dst.reserve(HEADER_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::InstanceKey;
    use crate::ipc::protocol::{Call, CallResult};

    #[test]
    fn client_frame_decodes_on_server_side() {
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();
        let mut buf = BytesMut::new();

        let msg = ClientMessage::Call {
            id: 3,
            call: Call::Broadcast {
                payload: b"\x00\xffopaque".to_vec(),
            },
        };
        client.encode(msg.clone(), &mut buf).unwrap();

        assert_eq!(server.decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_rest() {
        let mut server = ServerCodec::new();
        let mut client = ClientCodec::new();
        let mut full = BytesMut::new();
        client
            .encode(
                ClientMessage::Call {
                    id: 1,
                    call: Call::PushInstance {
                        instance: InstanceKey(42),
                    },
                },
                &mut full,
            )
            .unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..2]);
        assert_eq!(server.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&full[2..full.len() - 1]);
        assert_eq!(server.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&full[full.len() - 1..]);
        assert!(matches!(
            server.decode(&mut buf).unwrap(),
            Some(ClientMessage::Call { id: 1, .. })
        ));
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut server = ServerCodec::new();
        let mut client = ClientCodec::new();
        let mut buf = BytesMut::new();

        client
            .encode(ClientMessage::SetMainReply { id: 9, accepted: true }, &mut buf)
            .unwrap();
        client
            .encode(
                ClientMessage::Call {
                    id: 10,
                    call: Call::GetTotalInstanceCount,
                },
                &mut buf,
            )
            .unwrap();

        assert_eq!(
            server.decode(&mut buf).unwrap(),
            Some(ClientMessage::SetMainReply { id: 9, accepted: true })
        );
        assert_eq!(
            server.decode(&mut buf).unwrap(),
            Some(ClientMessage::Call {
                id: 10,
                call: Call::GetTotalInstanceCount
            })
        );
        assert_eq!(server.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn server_reply_decodes_on_client_side() {
        let mut server = ServerCodec::new();
        let mut client = ClientCodec::new();
        let mut buf = BytesMut::new();

        server
            .encode(
                ServerMessage::Reply {
                    id: 4,
                    result: CallResult::Count(3),
                },
                &mut buf,
            )
            .unwrap();

        assert_eq!(
            client.decode(&mut buf).unwrap(),
            Some(ServerMessage::Reply {
                id: 4,
                result: CallResult::Count(3)
            })
        );
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut server = ServerCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);

        assert!(matches!(
            server.decode(&mut buf),
            Err(IpcError::FrameTooLarge(len)) if len == MAX_FRAME_LEN + 1
        ));
    }

    #[test]
    fn garbage_body_is_a_decode_error() {
        let mut server = ServerCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(&[0xc1, 0xc1, 0xc1]);

        assert!(matches!(server.decode(&mut buf), Err(IpcError::Decode(_))));
    }
}
