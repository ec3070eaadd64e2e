/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Just enough of the ttrpc wire format to issue a unary call: a 10 byte frame header followed
//! by a protobuf encoded `Request` or `Response`.

use anyhow::{anyhow, Context};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 10;
pub const MAX_PAYLOAD_LEN: u32 = 4 << 20;

pub const MESSAGE_TYPE_REQUEST: u8 = 0x1;
pub const MESSAGE_TYPE_RESPONSE: u8 = 0x2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub stream_id: u32,
    pub message_type: u8,
    pub flags: u8,
}
impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_u32(self.length);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.message_type);
        buf.put_u8(self.flags);

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&buf);
        header
    }

    pub fn decode(mut raw: &[u8]) -> anyhow::Result<Self> {
        if raw.len() < HEADER_LEN {
            return Err(anyhow!("Frame header too short: {} bytes", raw.len()));
        }
        Ok(Self {
            length: raw.get_u32(),
            stream_id: raw.get_u32(),
            message_type: raw.get_u8(),
            flags: raw.get_u8(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

pub async fn write_frame<W>(
    writer: &mut W,
    stream_id: u32,
    message_type: u8,
    payload: &[u8],
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let length = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD_LEN)
        .ok_or_else(|| anyhow!("Message of {} bytes exceeds the frame limit", payload.len()))?;

    let header = FrameHeader {
        length,
        stream_id,
        message_type,
        flags: 0,
    };
    writer.write_all(&header.encode()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut raw)
        .await
        .context("Failed to read frame header")?;
    let header = FrameHeader::decode(&raw)?;
    if header.length > MAX_PAYLOAD_LEN {
        return Err(anyhow!(
            "Frame of {} bytes exceeds the limit of {} bytes",
            header.length,
            MAX_PAYLOAD_LEN
        ));
    }

    let mut payload = vec![0u8; header.length as usize];
    reader
        .read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;
    Ok(Frame { header, payload })
}

// ******** ******** ********
// **       MESSAGES       **
// ******** ******** ********

#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
    #[prost(int64, tag = "4")]
    pub timeout_nano: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Status {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    #[prost(message, optional, tag = "1")]
    pub status: Option<Status>,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ImagePullRequest {
    #[prost(string, tag = "1")]
    pub image_url: String,
    #[prost(string, tag = "2")]
    pub bundle_path: String,
}
