use crate::Error;
use prost::encoding::{decode_varint, encode_varint};

/// Cursor over a borrowed byte slice for the fixed-order layouts used on the
/// wire and in persistence.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn u8(&mut self) -> Result<u8, Error> {
        let (first, rest) = self
            .buf
            .split_first()
            .ok_or_else(|| Error::Serde("Unexpected end of input".to_string()))?;
        self.buf = rest;
        Ok(*first)
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.buf.len() < len {
            return Err(Error::Serde(format!(
                "Expected {} bytes, {} remaining",
                len,
                self.buf.len()
            )));
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(crate) fn varint(&mut self) -> Result<u64, Error> {
        decode_varint(&mut self.buf).map_err(|e| Error::Serde(e.to_string()))
    }

    /// Presence byte of an optional field.
    pub(crate) fn flag(&mut self) -> Result<bool, Error> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Serde(format!("Invalid presence flag {}", other))),
        }
    }

    /// Varint length followed by that many bytes.
    pub(crate) fn length_prefixed(&mut self) -> Result<&'a [u8], Error> {
        let len = self.varint()?;
        let len = usize::try_from(len).map_err(|_| Error::Serde("Length overflow".to_string()))?;
        self.bytes(len)
    }

    pub(crate) fn finish(self) -> Result<(), Error> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::Serde(format!(
                "{} trailing bytes",
                self.buf.len()
            )))
        }
    }
}

pub(crate) fn put_varint(out: &mut Vec<u8>, value: u64) {
    encode_varint(value, out);
}

pub(crate) fn put_flag(out: &mut Vec<u8>, present: bool) {
    out.push(u8::from(present));
}

pub(crate) fn put_length_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    put_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}
