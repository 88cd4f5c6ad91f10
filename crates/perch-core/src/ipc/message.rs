//! Wire format of a single request or response.
//!
//! ```text
//! command SEP value (SEP complement)* TERM
//! ```
//!
//! `SEP` is ASCII group separator (0x1D) and `TERM` is ASCII record
//! separator (0x1E). There is no escaping: field content must never contain
//! either byte. [`Message::encode`] refuses such content instead of emitting
//! a corrupted stream.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Separates the fields of a message.
pub const FIELD_SEPARATOR: u8 = 0x1d;

/// Ends a message.
pub const RECORD_TERMINATOR: u8 = 0x1e;

/// Upper bound on the encoded size of one message.
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Command name of error responses.
pub const ERROR_COMMAND: &str = "error";

/// One framed unit exchanged over the control socket, in either direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Request name or response kind. Empty on a "list commands" request.
    pub command: String,
    /// Primary payload.
    pub value: String,
    /// Secondary payload items, in order.
    pub complement: Vec<String>,
}

impl Message {
    pub fn new(command: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            value: value.into(),
            complement: Vec::new(),
        }
    }

    /// A message carrying only a command name.
    pub fn command(command: impl Into<String>) -> Self {
        Self::new(command, String::new())
    }

    /// An `error`-kind response.
    pub fn error(text: impl Into<String>) -> Self {
        Self::new(ERROR_COMMAND, text)
    }

    pub fn with_complement<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.complement.extend(items.into_iter().map(Into::into));
        self
    }

    pub fn is_error(&self) -> bool {
        self.command == ERROR_COMMAND
    }

    fn fields(&self) -> impl Iterator<Item = &str> {
        [self.command.as_str(), self.value.as_str()]
            .into_iter()
            .chain(self.complement.iter().map(String::as_str))
    }

    /// Serialize to wire bytes.
    ///
    /// Fails with [`io::ErrorKind::InvalidInput`] if a field contains a
    /// delimiter byte.
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(
            self.fields().map(str::len).sum::<usize>() + self.complement.len() + 2,
        );
        for (i, field) in self.fields().enumerate() {
            if field.bytes().any(is_delimiter) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("message field {i} contains a delimiter byte"),
                ));
            }
            if i > 0 {
                out.push(FIELD_SEPARATOR);
            }
            out.extend_from_slice(field.as_bytes());
        }
        out.push(RECORD_TERMINATOR);
        Ok(out)
    }

    /// Encode and write the message, then flush.
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode()?;
        writer.write_all(&encoded).await?;
        writer.flush().await
    }

    /// Read one message from `reader`.
    ///
    /// Returns `Ok(None)` when the stream ends before the first byte (the
    /// peer closed the connection). A stream ending mid-message is an
    /// [`io::ErrorKind::UnexpectedEof`] error. Reads byte by byte, so pass a
    /// buffered reader.
    pub async fn read_from<R>(reader: &mut R) -> io::Result<Option<Self>>
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = Decoder::new();
        loop {
            let byte = match reader.read_u8().await {
                Ok(byte) => byte,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    if decoder.is_idle() {
                        return Ok(None);
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended in the middle of a message",
                    ));
                }
                Err(e) => return Err(e),
            };

            if let Some(message) = decoder.push(byte)? {
                return Ok(Some(message));
            }
        }
    }
}

fn is_delimiter(byte: u8) -> bool {
    byte == FIELD_SEPARATOR || byte == RECORD_TERMINATOR
}

/// Replace delimiter bytes so arbitrary text can travel inside a field.
pub fn sanitize_field(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_ascii() && is_delimiter(c as u8) {
                ' '
            } else {
                c
            }
        })
        .collect()
}

/// Incremental, byte-at-a-time message decoder.
///
/// Field 0 is the command, field 1 the value, and every later field is
/// appended to the complement. On the terminator the pending field is
/// committed even when empty, so a trailing empty complement item survives.
#[derive(Debug, Default)]
pub struct Decoder {
    field: Vec<u8>,
    index: usize,
    consumed: usize,
    message: Message,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no byte of the current message has been consumed yet.
    pub fn is_idle(&self) -> bool {
        self.consumed == 0
    }

    /// Feed one byte. Returns the completed message on a terminator.
    pub fn push(&mut self, byte: u8) -> io::Result<Option<Message>> {
        self.consumed += 1;
        if self.consumed > MAX_MESSAGE_LEN {
            *self = Self::default();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message exceeds {MAX_MESSAGE_LEN} bytes"),
            ));
        }

        match byte {
            FIELD_SEPARATOR => {
                self.commit()?;
                Ok(None)
            }
            RECORD_TERMINATOR => {
                self.commit()?;
                let message = std::mem::take(&mut self.message);
                *self = Self::default();
                Ok(Some(message))
            }
            other => {
                self.field.push(other);
                Ok(None)
            }
        }
    }

    fn commit(&mut self) -> io::Result<()> {
        let bytes = std::mem::take(&mut self.field);
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                *self = Self::default();
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        };

        match self.index {
            0 => self.message.command = text,
            1 => self.message.value = text,
            _ => self.message.complement.push(text),
        }
        self.index += 1;
        Ok(())
    }
}
