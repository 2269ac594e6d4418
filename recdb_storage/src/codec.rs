//! Fixed-width record encoding and file header handling.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::file::DataFile;
use crate::{RecNo, Record, FIELD_COUNT, FIELD_NAMES, FIELD_WIDTHS};

/// Magic cookie at the start of every database file.
pub const MAGIC: [u8; 4] = [0x00, 0x00, 0x02, 0x03];

/// Width of the field-count entry in the header.
const FIELD_COUNT_LEN: usize = 2;
/// Width of each field's name-length entry.
const NAME_LEN_LEN: usize = 1;
/// Width of each field's slot-width entry.
const WIDTH_LEN: usize = 1;

const PAD: u8 = b' ';
const UNMAPPABLE: u8 = b'?';

const fn record_width() -> usize {
    let mut width = 0;
    let mut i = 0;
    while i < FIELD_COUNT {
        width += FIELD_WIDTHS[i];
        i += 1;
    }
    width
}

const fn header_len() -> usize {
    let mut len = MAGIC.len() + FIELD_COUNT_LEN;
    let mut i = 0;
    while i < FIELD_COUNT {
        len += NAME_LEN_LEN + FIELD_NAMES[i].len() + WIDTH_LEN;
        i += 1;
    }
    len
}

/// Bytes of field data per record, excluding the flag.
pub const RECORD_WIDTH: usize = record_width();

/// Bytes per record slot: one flag byte plus the field data.
pub const SLOT_WIDTH: usize = 1 + RECORD_WIDTH;

/// Offset of the first record slot. Derived from the built-in field table,
/// not from the header bytes present in the file.
pub const HEADER_LEN: u64 = header_len() as u64;

const _: () = assert!(SLOT_WIDTH == 183);

/// Flag byte preceding each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFlag {
    /// Live record.
    Valid,
    /// Deleted record whose slot may be reused.
    Deleted,
}

impl SlotFlag {
    /// On-disk byte value.
    pub fn to_byte(self) -> u8 {
        match self {
            SlotFlag::Valid => 0x00,
            SlotFlag::Deleted => 0xFF,
        }
    }

    /// Parse an on-disk byte; any other value means the file is corrupt.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(SlotFlag::Valid),
            0xFF => Some(SlotFlag::Deleted),
            _ => None,
        }
    }
}

/// File offset of the flag byte of `rec_no`.
#[inline]
pub fn slot_offset(rec_no: RecNo) -> u64 {
    HEADER_LEN + rec_no * SLOT_WIDTH as u64
}

/// File offset of the field data of `rec_no`.
#[inline]
pub fn fields_offset(rec_no: RecNo) -> u64 {
    slot_offset(rec_no) + 1
}

/// Encode a record into its fixed-width form.
///
/// Values are written as ASCII (other characters become `?`), padded with
/// spaces and silently truncated to the slot width.
pub fn encode(record: &Record) -> [u8; RECORD_WIDTH] {
    let mut out = [PAD; RECORD_WIDTH];
    let mut offset = 0;
    for (value, &width) in record.iter().zip(FIELD_WIDTHS.iter()) {
        let slot = &mut out[offset..offset + width];
        for (dst, ch) in slot.iter_mut().zip(value.chars()) {
            *dst = if ch.is_ascii() { ch as u8 } else { UNMAPPABLE };
        }
        offset += width;
    }
    out
}

/// Decode fixed-width field data, trimming padding and control characters.
pub fn decode(bytes: &[u8; RECORD_WIDTH]) -> Record {
    let mut record = Record::default();
    let mut offset = 0;
    for (value, &width) in record.iter_mut().zip(FIELD_WIDTHS.iter()) {
        let text: String = bytes[offset..offset + width]
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { UNMAPPABLE as char })
            .collect();
        *value = text.trim_matches(|c: char| c <= ' ').to_string();
        offset += width;
    }
    record
}

/// Header bytes describing the built-in schema.
pub fn header_bytes() -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN as usize);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&(FIELD_COUNT as u16).to_be_bytes());
    for (name, &width) in FIELD_NAMES.iter().zip(FIELD_WIDTHS.iter()) {
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(width as u8);
    }
    out
}

/// Validate the file header.
///
/// Only the length and magic cookie are checked unless `verify_schema` is set,
/// in which case the schema section must match the built-in field table byte
/// for byte.
pub fn check_header(file: &DataFile, verify_schema: bool) -> Result<()> {
    if file.len()? < HEADER_LEN {
        return Err(DbError::CorruptFile(
            "database file is too small to be valid".into(),
        ));
    }
    let mut magic = [0u8; MAGIC.len()];
    file.read_at(0, &mut magic)?;
    if magic != MAGIC {
        return Err(DbError::CorruptFile(format!(
            "wrong magic cookie {magic:02x?}"
        )));
    }
    if verify_schema {
        let mut header = vec![0u8; HEADER_LEN as usize];
        file.read_at(0, &mut header)?;
        if header != header_bytes() {
            return Err(DbError::CorruptFile(
                "schema section does not match the record layout".into(),
            ));
        }
    }
    Ok(())
}

/// Create a new, empty database file at `path`. Fails if the file exists.
pub fn init_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(&header_bytes())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    #[test]
    fn layout_constants() {
        assert_eq!(RECORD_WIDTH, 182);
        assert_eq!(HEADER_LEN, 54);
        assert_eq!(header_bytes().len() as u64, HEADER_LEN);
        assert_eq!(slot_offset(0), 54);
        assert_eq!(slot_offset(2), 54 + 2 * 183);
        assert_eq!(fields_offset(1), 54 + 183 + 1);
    }

    #[test]
    fn encode_pads_with_spaces() {
        let rec = record(["Smith", "Leeds", "Plumbing", "4", "$40.00", ""]);
        let bytes = encode(&rec);
        assert_eq!(&bytes[..5], b"Smith");
        assert!(bytes[5..32].iter().all(|&b| b == b' '));
        assert_eq!(&bytes[32..37], b"Leeds");
        assert_eq!(decode(&bytes), rec);
    }

    #[test]
    fn overlong_field_truncated() {
        let long = "x".repeat(40);
        let rec = record([long.as_str(), "", "", "1234567", "", ""]);
        let back = decode(&encode(&rec));
        assert_eq!(back[0], "x".repeat(32));
        assert_eq!(back[3], "123456");
    }

    #[test]
    fn non_ascii_becomes_question_mark() {
        let rec = record(["Zoë", "", "", "", "", ""]);
        assert_eq!(decode(&encode(&rec))[0], "Zo?");
    }

    #[test]
    fn decode_trims_nul_and_spaces() {
        let mut bytes = [0u8; RECORD_WIDTH];
        bytes[..4].copy_from_slice(b" ab ");
        assert_eq!(decode(&bytes)[0], "ab");
        assert_eq!(decode(&bytes)[1], "");
    }

    #[test]
    fn flag_bytes() {
        assert_eq!(SlotFlag::from_byte(0x00), Some(SlotFlag::Valid));
        assert_eq!(SlotFlag::from_byte(0xFF), Some(SlotFlag::Deleted));
        assert_eq!(SlotFlag::from_byte(0x01), None);
        assert_eq!(SlotFlag::Deleted.to_byte(), 0xFF);
    }

    #[test]
    fn init_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        init_file(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), header_bytes());
        assert!(matches!(init_file(&path), Err(DbError::Io(_))));
    }
}
