//! Extended query protocol backend messages.

use crate::error::Result;
use crate::protocol::codec::{MessageBuilder, expect_end, read_u16, read_u32};
use crate::protocol::types::Oid;

use super::msg_type;

/// ParameterDescription message - describes parameters for a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDescription {
    /// Parameter type OIDs
    param_oids: Vec<Oid>,
}

impl ParameterDescription {
    pub fn new(param_oids: Vec<Oid>) -> Self {
        Self { param_oids }
    }

    /// Parse a ParameterDescription message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (num_params, mut data) = read_u16(payload)?;
        let mut param_oids = Vec::with_capacity(num_params as usize);

        for _ in 0..num_params {
            let (oid, rest) = read_u32(data)?;
            param_oids.push(oid);
            data = rest;
        }
        expect_end(data, "ParameterDescription")?;

        Ok(Self { param_oids })
    }

    /// Get the number of parameters.
    pub fn len(&self) -> usize {
        self.param_oids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.param_oids.is_empty()
    }

    /// Get parameter type OIDs.
    pub fn oids(&self) -> &[Oid] {
        &self.param_oids
    }

    pub fn into_oids(self) -> Vec<Oid> {
        self.param_oids
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        let mut msg = MessageBuilder::new(buf, msg_type::PARAMETER_DESCRIPTION);
        msg.write_i16(self.param_oids.len() as i16);
        for oid in &self.param_oids {
            msg.write_i32(*oid as i32);
        }
        msg.finish();
    }
}
