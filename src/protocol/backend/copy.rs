//! COPY protocol backend messages.
//!
//! COPY is not supported as a data path; these are parsed so the executor can
//! recognize the sub-protocol and back out of it cleanly.

use crate::error::Result;
use crate::protocol::codec::{MessageBuilder, expect_end, read_u8, read_u16};
use crate::protocol::types::FormatCode;

/// CopyInResponse / CopyOutResponse / CopyBothResponse body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResponse {
    /// Overall format (0=text, 1=binary)
    pub format: FormatCode,
    /// Per-column format codes
    pub column_formats: Vec<FormatCode>,
}

impl CopyResponse {
    /// Parse a Copy*Response message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (format_byte, rest) = read_u8(payload)?;
        let format = FormatCode::from_u16(format_byte as u16)?;

        let (num_columns, mut rest) = read_u16(rest)?;
        let mut column_formats = Vec::with_capacity(num_columns as usize);

        for _ in 0..num_columns {
            let (fmt, remaining) = read_u16(rest)?;
            column_formats.push(FormatCode::from_u16(fmt)?);
            rest = remaining;
        }
        expect_end(rest, "CopyResponse")?;

        Ok(Self {
            format,
            column_formats,
        })
    }

    pub fn write(&self, buf: &mut Vec<u8>, type_byte: u8) {
        let mut msg = MessageBuilder::new(buf, type_byte);
        msg.write_u8(self.format as u8);
        msg.write_i16(self.column_formats.len() as i16);
        for fmt in &self.column_formats {
            msg.write_i16(*fmt as i16);
        }
        msg.finish();
    }
}
