//! PR1 message framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{field, status};
use crate::error::{ClientError, Result};
use crate::variant::{Variant, VARIANT_HEADER_SIZE};

/// Frames above this size are treated as a corrupt stream.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const HEADER_SIZE: usize = 8;

/// One typed field of a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub id: u16,
    pub value: Variant,
}

/// A PR1 message: an ordered list of fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    fields: Vec<Field>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a request carrying a COMMAND field.
    pub fn request(command: i64) -> Self {
        Self::new().with(field::COMMAND, command)
    }

    /// Builder-style field append.
    pub fn with(mut self, id: u16, value: impl Into<Variant>) -> Self {
        self.push(id, value);
        self
    }

    pub fn push(&mut self, id: u16, value: impl Into<Variant>) {
        self.fields.push(Field {
            id,
            value: value.into(),
        });
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// First field with this id.
    pub fn get(&self, id: u16) -> Option<&Variant> {
        self.fields.iter().find(|f| f.id == id).map(|f| &f.value)
    }

    /// Field value, or `None` when the field is absent.
    pub fn variant(&self, id: u16) -> Variant {
        self.get(id).cloned().unwrap_or_default()
    }

    pub fn int(&self, id: u16) -> Option<i64> {
        self.get(id).and_then(Variant::as_int)
    }

    /// Value of the COMMAND field.
    pub fn command(&self) -> Option<i64> {
        self.int(field::COMMAND)
    }

    /// Remote status; absent ERROR_CODE means success. Codes outside the
    /// `i32` range read as `GENERIC`.
    pub fn status(&self) -> i32 {
        self.int(field::ERROR_CODE)
            .map(|c| i32::try_from(c).unwrap_or(status::GENERIC))
            .unwrap_or(status::SUCCESS)
    }

    pub fn error_description(&self) -> String {
        self.get(field::ERROR_DESC)
            .map(|v| v.to_string())
            .unwrap_or_default()
    }

    /// Fail with `Protocol` if the answer carries a negative status.
    pub fn check_status(&self) -> Result<()> {
        let code = self.status();
        if code < 0 {
            let mut description = self.error_description();
            if description.is_empty() {
                description = "request failed".to_string();
            }
            return Err(ClientError::Protocol { code, description });
        }
        Ok(())
    }

    /// Serialize header and fields.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        for f in &self.fields {
            body.put_u16_le(f.id);
            f.value.encode_into(&mut body);
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
        buf.put_u32_le(body.len() as u32);
        buf.put_u16_le(self.fields.len() as u16);
        buf.put_u16_le(0);
        buf.put_slice(&body);
        buf.freeze()
    }

    /// Parse a message body holding `field_count` fields.
    pub fn decode_body(field_count: u16, mut body: Bytes) -> Result<Self> {
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            if body.remaining() < 2 + VARIANT_HEADER_SIZE {
                return Err(ClientError::protocol("truncated field header"));
            }
            let id = body.get_u16_le();
            let value = Variant::decode(&mut body)?;
            fields.push(Field { id, value });
        }
        if body.has_remaining() {
            return Err(ClientError::protocol(format!(
                "{} trailing bytes after {} fields",
                body.remaining(),
                field_count
            )));
        }
        Ok(Self { fields })
    }

    /// Parse a complete frame (header included).
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.remaining() < HEADER_SIZE {
            return Err(ClientError::protocol("truncated message header"));
        }
        let size = frame.get_u32_le() as usize;
        let field_count = frame.get_u16_le();
        let _reserved = frame.get_u16_le();
        if frame.remaining() != size {
            return Err(ClientError::protocol(format!(
                "message declares {} bytes, frame has {}",
                size,
                frame.remaining()
            )));
        }
        Self::decode_body(field_count, frame)
    }
}

/// Read one frame from the stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let mut h = &header[..];
    let size = h.get_u32_le() as usize;
    let field_count = h.get_u16_le();

    if size > MAX_MESSAGE_SIZE {
        return Err(ClientError::protocol(format!(
            "message of {} bytes exceeds limit",
            size
        )));
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Message::decode_body(field_count, Bytes::from(body))
}

/// Write one frame to the stream and flush it.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.encode()).await?;
    writer.flush().await?;
    Ok(())
}
