//! Program blob decoding.
//!
//! A blob is laid out as
//! `varint(jump_table_len) ‖ u8(entry_size) ‖ varint(code_len) ‖ jump_table ‖ code ‖ bitmask`,
//! where every jump table entry is an `entry_size`-byte little-endian code offset and the bitmask
//! holds one bit per code byte, least significant bit first, marking instruction starts.

/// Longest code section accepted.
pub const MAX_CODE_SIZE: usize = 1 << 24;
/// Widest jump table entry accepted.
pub const MAX_JUMP_TABLE_ENTRY_SIZE: u8 = 4;
/// Longest operand run after an opcode.
pub const MAX_SKIP: u32 = 24;

/// Errors raised while decoding a program blob.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgramError {
    /// The blob ended before the section being read.
    #[error("program blob truncated while reading {section}")]
    Truncated {
        /// The section being read.
        section: &'static str,
    },
    /// A varint did not fit the target integer.
    #[error("varint in {section} overflows")]
    VarintOverflow {
        /// The section being read.
        section: &'static str,
    },
    /// The jump table entry size is out of range.
    #[error("invalid jump table entry size: {0}")]
    InvalidEntrySize(u8),
    /// The code section exceeds [`MAX_CODE_SIZE`].
    #[error("code size {size} exceeds the maximum code size")]
    CodeTooLarge {
        /// The declared code size.
        size: u64,
    },
    /// The argument data does not fit the argument region.
    #[error("argument data of {size} bytes does not fit the argument region")]
    ArgumentTooLarge {
        /// Length of the argument data.
        size: usize,
    },
    /// Bytes follow the bitmask.
    #[error("{0} trailing bytes after program blob")]
    TrailingBytes(usize),
}

/// Encodes `value` with the variable-length natural number encoding used by program blobs.
pub fn encode_varint(value: u64, out: &mut Vec<u8>) {
    // `l` extra bytes carry 8 * l low bits; the prefix byte carries the rest after `l` one bits.
    for l in 0..8u32 {
        if value < 1u64 << (7 * (l + 1)) {
            let prefix = (256u64 - (1u64 << (8 - l))) + (value >> (8 * l));
            out.push(prefix as u8);
            out.extend_from_slice(&value.to_le_bytes()[..l as usize]);
            return;
        }
    }
    out.push(0xFF);
    out.extend_from_slice(&value.to_le_bytes());
}

/// A cursor over the blob bytes.
#[derive(Debug)]
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize, section: &'static str) -> Result<&'a [u8], ProgramError> {
        let end = self.offset.checked_add(len).ok_or(ProgramError::Truncated { section })?;
        let slice = self.bytes.get(self.offset..end).ok_or(ProgramError::Truncated { section })?;
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self, section: &'static str) -> Result<u8, ProgramError> {
        Ok(self.take(1, section)?[0])
    }

    fn varint(&mut self, section: &'static str) -> Result<u64, ProgramError> {
        let first = self.u8(section)?;
        let len = first.leading_ones();
        if len == 8 {
            let bytes = self.take(8, section)?;
            return Ok(le_value(bytes));
        }
        let high = u64::from(first) & (0xFF >> (len + 1));
        let low = le_value(self.take(len as usize, section)?);
        Ok((high << (8 * len)) | low)
    }

    fn varint_usize(&mut self, section: &'static str) -> Result<usize, ProgramError> {
        usize::try_from(self.varint(section)?).map_err(|_| ProgramError::VarintOverflow { section })
    }

    const fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }
}

/// Reads up to eight little-endian bytes as an unsigned value.
fn le_value(bytes: &[u8]) -> u64 {
    bytes.iter().rev().fold(0, |acc, byte| (acc << 8) | u64::from(*byte))
}

/// A decoded program: code, instruction-start bitmask and jump table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramCode {
    code: Vec<u8>,
    bitmask: Vec<u8>,
    jump_table: Vec<u32>,
}

impl ProgramCode {
    /// Decodes a program blob.
    pub fn parse(blob: &[u8]) -> Result<Self, ProgramError> {
        let mut reader = Reader::new(blob);
        let jump_table_len = reader.varint_usize("jump table length")?;
        let entry_size = reader.u8("jump table entry size")?;
        if entry_size > MAX_JUMP_TABLE_ENTRY_SIZE || (jump_table_len > 0 && entry_size == 0) {
            return Err(ProgramError::InvalidEntrySize(entry_size));
        }
        let code_len = reader.varint("code length")?;
        if code_len > MAX_CODE_SIZE as u64 {
            return Err(ProgramError::CodeTooLarge { size: code_len });
        }
        let code_len = code_len as usize;

        let table_bytes = jump_table_len
            .checked_mul(entry_size as usize)
            .ok_or(ProgramError::Truncated { section: "jump table" })?;
        let jump_table = reader
            .take(table_bytes, "jump table")?
            .chunks(entry_size.max(1) as usize)
            .map(|entry| le_value(entry) as u32)
            .collect();
        let code = reader.take(code_len, "code")?.to_vec();
        let bitmask = reader.take(code_len.div_ceil(8), "bitmask")?.to_vec();
        if reader.remaining() > 0 {
            return Err(ProgramError::TrailingBytes(reader.remaining()));
        }

        Ok(Self { code, bitmask, jump_table })
    }

    /// The code section.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// The jump table, as code offsets.
    pub fn jump_table(&self) -> &[u32] {
        &self.jump_table
    }

    /// Whether an instruction starts at `pc`.
    pub fn is_instruction_start(&self, pc: u32) -> bool {
        let pc = pc as usize;
        pc < self.code.len() && self.bitmask[pc / 8] & (1 << (pc % 8)) != 0
    }

    /// Number of operand bytes following the opcode at `pc`.
    ///
    /// The bitmask is treated as if it continued with set bits past the end of the code.
    pub fn skip(&self, pc: u32) -> u32 {
        (0..MAX_SKIP).find(|j| !self.is_operand_byte(pc + 1 + j)).unwrap_or(MAX_SKIP)
    }

    fn is_operand_byte(&self, pc: u32) -> bool {
        (pc as usize) < self.code.len() && !self.is_instruction_start(pc)
    }

    /// The opcode at `pc`. Reading past the end yields `0`, which is `trap`.
    pub fn opcode(&self, pc: u32) -> u8 {
        self.byte(pc)
    }

    /// Code byte at `pc`, zero past the end of the code.
    pub fn byte(&self, pc: u32) -> u8 {
        self.code.get(pc as usize).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_varint(bytes: &[u8]) -> u64 {
        Reader::new(bytes).varint("test").unwrap()
    }

    #[test]
    fn test_varint_lengths() {
        for (value, len) in [
            (0u64, 1usize),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (1 << 55, 8),
            (u64::MAX, 9),
        ] {
            let mut out = Vec::new();
            encode_varint(value, &mut out);
            assert_eq!(out.len(), len, "length of {value}");
            assert_eq!(decode_varint(&out), value);
        }
    }

    #[test]
    fn test_parse_program() {
        // one jump table entry pointing at offset 2, code `fallthrough; trap; trap`
        let blob = [1, 1, 3, 2, 1, 0, 0, 0b111];
        let program = ProgramCode::parse(&blob).unwrap();
        assert_eq!(program.jump_table(), &[2]);
        assert_eq!(program.code(), &[1, 0, 0]);
        assert!(program.is_instruction_start(1));
        assert!(!program.is_instruction_start(3));
        assert_eq!(program.skip(0), 0);
    }

    #[test]
    fn test_skip_counts_operands() {
        // load_imm r9, 100 followed by trap
        let blob = [0, 0, 4, 51, 9, 100, 0, 0b1001];
        let program = ProgramCode::parse(&blob).unwrap();
        assert_eq!(program.skip(0), 2);
        assert_eq!(program.skip(3), 0);
    }

    #[test]
    fn test_truncated_blob() {
        assert_eq!(
            ProgramCode::parse(&[0, 0, 4, 1]),
            Err(ProgramError::Truncated { section: "code" })
        );
        assert_eq!(
            ProgramCode::parse(&[]),
            Err(ProgramError::Truncated { section: "jump table length" })
        );
    }

    #[test]
    fn test_trailing_bytes() {
        assert_eq!(ProgramCode::parse(&[0, 0, 1, 0, 1, 9]), Err(ProgramError::TrailingBytes(1)));
    }

    #[test]
    fn test_invalid_entry_size() {
        assert_eq!(ProgramCode::parse(&[1, 5, 0]), Err(ProgramError::InvalidEntrySize(5)));
    }
}
