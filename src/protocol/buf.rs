use bytes::{Buf, BufMut, Bytes};

use crate::error::ProtocolError;

/// Length-prefixed writers on top of [`BufMut`]. Lengths that overflow their prefix
/// are refused instead of being truncated.
pub trait ByteBuilder: BufMut {
    /// int16 length followed by the utf-8 bytes.
    fn put_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        let len = i16::try_from(value.len()).map_err(|_| ProtocolError::StringTooLong(value.len()))?;
        self.put_i16(len);
        self.put_slice(value.as_bytes());
        Ok(())
    }

    /// int32 element count of the array that follows.
    fn put_array_len(&mut self, len: usize) -> Result<(), ProtocolError> {
        let len = i32::try_from(len).map_err(|_| ProtocolError::ArrayTooLong(len))?;
        self.put_i32(len);
        Ok(())
    }
}

impl<B: BufMut + ?Sized> ByteBuilder for B {}

macro_rules! checked_read {
    ($name:ident, $ty:ty, $get:ident) => {
        fn $name(&mut self, field: &'static str) -> Result<$ty, ProtocolError> {
            self.ensure(std::mem::size_of::<$ty>(), field)?;
            Ok(self.$get())
        }
    };
}

/// Checked big-endian readers. Every read names the field it decodes so a short
/// buffer reports where the frame ended.
pub trait ByteReader: Buf {
    fn ensure(&self, len: usize, field: &'static str) -> Result<(), ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::UnexpectedEof { field });
        }
        Ok(())
    }

    checked_read!(read_i16, i16, get_i16);
    checked_read!(read_i32, i32, get_i32);
    checked_read!(read_i64, i64, get_i64);

    fn read_bytes(&mut self, len: usize, field: &'static str) -> Result<Bytes, ProtocolError> {
        self.ensure(len, field)?;
        Ok(self.copy_to_bytes(len))
    }

    fn read_string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let len = self.read_i16(field)?;
        if len < 0 {
            return Err(ProtocolError::NegativeLength {
                field,
                length: len as i32,
            });
        }
        let bytes = self.read_bytes(len as usize, field)?;
        Ok(std::str::from_utf8(&bytes)?.to_string())
    }

    /// Reads an int32 element count, rejecting negative values. The count is not
    /// backed by any bytes yet, never size an allocation from it.
    fn read_array_len(&mut self, field: &'static str) -> Result<usize, ProtocolError> {
        match self.read_i32(field)? {
            len if len < 0 => Err(ProtocolError::NegativeLength { field, length: len }),
            len => Ok(len as usize),
        }
    }
}

impl<B: Buf + ?Sized> ByteReader for B {}
