//! Big-endian TPM 1.2 structure (un)marshalling.

use crate::interface::TcsErr;

/// Buffer for building TPM commands.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a byte string prefixed by its 32 bit length.
    pub fn put_sized(&mut self, bytes: &[u8]) -> Result<(), TcsErr> {
        let len = u32::try_from(bytes.len()).map_err(|_| tcs_err_rc!(BAD_PARAMETER))?;
        self.put_u32(len);
        self.put_bytes(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Overwrite a previously reserved u32, e.g. a size field.
    pub fn update_u32(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}

/// Cursor for parsing TPM responses and client supplied structures.
///
/// Running out of data is reported as `underflow_rc`, so that malformed
/// client input and malformed chip responses can be told apart.
#[derive(Debug)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
    underflow_rc: u32,
}

impl<'a> ResponseBuffer<'a> {
    /// A cursor over a chip response.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            underflow_rc: tcs_rc!(TPM_UNEXPECTED),
        }
    }

    /// A cursor over client supplied data.
    pub fn new_client(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            underflow_rc: tcs_rc!(BAD_PARAMETER),
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], TcsErr> {
        if len > self.remaining() {
            return Err(TcsErr::Rc(self.underflow_rc));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn get_u8(&mut self) -> Result<u8, TcsErr> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool, TcsErr> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u16(&mut self) -> Result<u16, TcsErr> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, TcsErr> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], TcsErr> {
        self.take(len)
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], TcsErr> {
        let mut a = [0u8; N];
        a.copy_from_slice(self.take(N)?);
        Ok(a)
    }

    /// Get a byte string prefixed by its 32 bit length.
    pub fn get_sized(&mut self) -> Result<&'a [u8], TcsErr> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }
}

#[test]
fn test_response_buffer_underflow_codes() {
    let data = [0x00u8, 0x01, 0x02];
    let mut r = ResponseBuffer::new(&data);
    assert_eq!(r.get_u16().unwrap(), 1);
    assert_eq!(r.get_u32(), Err(tcs_err_rc!(TPM_UNEXPECTED)));
    // A failed read doesn't advance the cursor.
    assert_eq!(r.position(), 2);
    assert_eq!(r.get_u8().unwrap(), 2);

    let sized = [0x00u8, 0x00, 0x00, 0x05, 0xaa];
    let mut r = ResponseBuffer::new_client(&sized);
    assert_eq!(r.get_sized(), Err(tcs_err_rc!(BAD_PARAMETER)));
}
