// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Current on-disk header version.
///
/// - 1 through 3 are ancient and rejected.
/// - 4 lacks the security pointer and the revision limit.
/// - 5 lacks the revision limit.
/// - 6 is current.
pub const CURRENT_DISK_VERSION: u8 = 6;

/// Default maximum depth of a revision tree.
pub const DEFAULT_REVS_LIMIT: u64 = 1_000;

/// Serialized root of one B+-tree: a node pointer plus the encoded
/// reduction of the whole tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeState {
    /// File offset of the root node.
    pub root: u64,

    /// Opaque reduction bytes (codec-specific).
    pub reduction: Vec<u8>,
}

/// The database header record
///
/// Rewritten (by append) on every commit; the freshest valid header in the
/// file defines the database state. Everything it references lies at lower
/// offsets, so a torn write can only ever lose the tail, never corrupt the
/// committed prefix.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// On-disk version tag.
    pub disk_version: u8,

    /// Sequence of the latest committed document update.
    pub update_seq: u64,

    /// Number of purge batches ever applied.
    pub purge_seq: u64,

    /// Pointer to the most recent purged `(id, revs)` list, if any.
    pub purged_docs: Option<u64>,

    /// Root of the by-id index.
    pub by_id_state: Option<TreeState>,

    /// Root of the by-seq index.
    pub by_seq_state: Option<TreeState>,

    /// Root of the local (non-replicated) docs tree.
    pub local_state: Option<TreeState>,

    /// Pointer to the security policy blob, if one was set.
    pub security_ptr: Option<u64>,

    /// Maximum revision tree depth retained by stemming.
    pub revs_limit: u64,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            disk_version: CURRENT_DISK_VERSION,
            update_seq: 0,
            purge_seq: 0,
            purged_docs: None,
            by_id_state: None,
            by_seq_state: None,
            local_state: None,
            security_ptr: None,
            revs_limit: DEFAULT_REVS_LIMIT,
        }
    }
}

fn write_opt_u64<W: Write>(writer: &mut W, value: Option<u64>) -> Result<(), EncodeError> {
    match value {
        Some(v) => {
            writer.write_u8(1)?;
            writer.write_u64_varint(v)?;
        }
        None => writer.write_u8(0)?,
    }
    Ok(())
}

fn read_opt_u64<R: Read>(reader: &mut R) -> Result<Option<u64>, DecodeError> {
    match reader.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(reader.read_u64_varint()?)),
        tag => Err(DecodeError::InvalidTag(("Option<u64>", tag))),
    }
}

fn write_tree_state<W: Write>(
    writer: &mut W,
    state: Option<&TreeState>,
) -> Result<(), EncodeError> {
    match state {
        Some(state) => {
            writer.write_u8(1)?;
            writer.write_u64_varint(state.root)?;
            writer.write_u64_varint(state.reduction.len() as u64)?;
            writer.write_all(&state.reduction)?;
        }
        None => writer.write_u8(0)?,
    }
    Ok(())
}

fn read_tree_state<R: Read>(reader: &mut R) -> Result<Option<TreeState>, DecodeError> {
    match reader.read_u8()? {
        0 => Ok(None),
        1 => {
            let root = reader.read_u64_varint()?;

            #[allow(clippy::cast_possible_truncation)]
            let len = reader.read_u64_varint()? as usize;
            let mut reduction = vec![0u8; len];
            reader.read_exact(&mut reduction)?;
            Ok(Some(TreeState { root, reduction }))
        }
        tag => Err(DecodeError::InvalidTag(("TreeState", tag))),
    }
}

impl Encode for Header {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(self.disk_version)?;
        writer.write_u64_varint(self.update_seq)?;
        writer.write_u64_varint(self.purge_seq)?;
        write_opt_u64(writer, self.purged_docs)?;
        write_tree_state(writer, self.by_id_state.as_ref())?;
        write_tree_state(writer, self.by_seq_state.as_ref())?;
        write_tree_state(writer, self.local_state.as_ref())?;
        write_opt_u64(writer, self.security_ptr)?;
        writer.write_u64_varint(self.revs_limit)?;
        Ok(())
    }
}

impl Header {
    /// Decodes a header record, upgrading older disk versions in memory by
    /// padding the missing trailing fields with defaults.
    ///
    /// The upgraded header is rewritten at the next commit; until then the
    /// on-disk record keeps its old width.
    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        let mut reader = Cursor::new(bytes);

        let disk_version = reader.read_u8()?;

        if disk_version < 4 || disk_version > CURRENT_DISK_VERSION {
            return Err(crate::Error::InvalidDiskVersion(disk_version));
        }

        let update_seq = reader.read_u64_varint()?;
        let purge_seq = reader.read_u64_varint()?;
        let purged_docs = read_opt_u64(&mut reader)?;
        let by_id_state = read_tree_state(&mut reader)?;
        let by_seq_state = read_tree_state(&mut reader)?;
        let local_state = read_tree_state(&mut reader)?;

        let security_ptr = if disk_version >= 5 {
            read_opt_u64(&mut reader)?
        } else {
            None
        };

        let revs_limit = if disk_version >= 6 {
            reader.read_u64_varint()?
        } else {
            DEFAULT_REVS_LIMIT
        };

        Ok(Self {
            disk_version: CURRENT_DISK_VERSION,
            update_seq,
            purge_seq,
            purged_docs,
            by_id_state,
            by_seq_state,
            local_state,
            security_ptr,
            revs_limit,
        })
    }

    /// Whether the on-disk record was written by an older version.
    #[must_use]
    pub fn was_upgraded(bytes: &[u8]) -> bool {
        bytes.first().is_some_and(|v| *v < CURRENT_DISK_VERSION)
    }
}

impl Decode for Header {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut buf = vec![];
        reader.read_to_end(&mut buf)?;

        Self::from_slice(&buf).map_err(|e| match e {
            crate::Error::Decode(e) => e,
            crate::Error::Io(e) => DecodeError::Io(e),
            _ => DecodeError::InvalidTag(("Header", 0)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn header_roundtrip() -> crate::Result<()> {
        let header = Header {
            disk_version: CURRENT_DISK_VERSION,
            update_seq: 42,
            purge_seq: 3,
            purged_docs: Some(1_024),
            by_id_state: Some(TreeState {
                root: 8_192,
                reduction: vec![1, 2, 3],
            }),
            by_seq_state: Some(TreeState {
                root: 16_384,
                reduction: vec![],
            }),
            local_state: None,
            security_ptr: Some(77),
            revs_limit: 500,
        };

        let bytes = header.encode_into_vec()?;
        assert_eq!(header, Header::from_slice(&bytes)?);

        Ok(())
    }

    #[test]
    fn header_default_is_fresh() {
        let header = Header::default();
        assert_eq!(0, header.update_seq);
        assert_eq!(0, header.purge_seq);
        assert_eq!(DEFAULT_REVS_LIMIT, header.revs_limit);
        assert!(header.by_id_state.is_none());
    }

    #[test]
    fn header_rejects_ancient_versions() {
        for version in 0..4u8 {
            let mut bytes = Header::default().encode_into_vec().expect("should encode");
            *bytes.first_mut().expect("nonempty") = version;

            assert!(matches!(
                Header::from_slice(&bytes),
                Err(crate::Error::InvalidDiskVersion(v)) if v == version
            ));
        }
    }

    #[test]
    fn header_upgrades_v4() -> crate::Result<()> {
        // a v4 record ends after the local tree state
        let mut bytes = vec![4u8];

        {
            use varint_rs::VarintWriter;
            bytes.write_u64_varint(9)?; // update_seq
            bytes.write_u64_varint(0)?; // purge_seq
        }
        bytes.push(0); // purged_docs: none
        bytes.push(0); // by_id: none
        bytes.push(0); // by_seq: none
        bytes.push(0); // local: none

        let header = Header::from_slice(&bytes)?;
        assert_eq!(CURRENT_DISK_VERSION, header.disk_version);
        assert_eq!(9, header.update_seq);
        assert_eq!(None, header.security_ptr);
        assert_eq!(DEFAULT_REVS_LIMIT, header.revs_limit);
        assert!(Header::was_upgraded(&bytes));

        Ok(())
    }

    #[test]
    fn header_upgrades_v5() -> crate::Result<()> {
        // a v5 record carries the security pointer but no revs limit
        let mut bytes = vec![5u8];

        {
            use varint_rs::VarintWriter;
            bytes.write_u64_varint(1)?;
            bytes.write_u64_varint(1)?;
        }
        bytes.push(0); // purged_docs
        bytes.push(0); // by_id
        bytes.push(0); // by_seq
        bytes.push(0); // local
        bytes.push(1); // security: some
        {
            use varint_rs::VarintWriter;
            bytes.write_u64_varint(4_096)?;
        }

        let header = Header::from_slice(&bytes)?;
        assert_eq!(Some(4_096), header.security_ptr);
        assert_eq!(DEFAULT_REVS_LIMIT, header.revs_limit);

        Ok(())
    }
}
