//! Global transaction identifiers.
//!
//! A [`TransactionId`] is content-equatable: two ids with the same global id
//! bytes, branch qualifier and format id are the same transaction, however
//! they were obtained. The wire form is embedded in every owned log record.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Format id used for engine-local (non-XA) transactions.
pub const LOCAL_FORMAT_ID: i32 = 101;

/// Opaque identifier of a global transaction.
///
/// Wire form: `[u8 gid_len][u8 bqual_len][i32 format_id][gid][bqual]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId {
    gid: Vec<u8>,
    bqual: Vec<u8>,
    format_id: i32,
}

impl TransactionId {
    /// Build an id from externally supplied XA components.
    pub fn new(gid: Vec<u8>, bqual: Vec<u8>, format_id: i32) -> Self {
        TransactionId {
            gid,
            bqual,
            format_id,
        }
    }

    /// Build the id for an engine-local transaction from its serial number.
    ///
    /// The global id is the 8-byte big-endian serial, the branch qualifier is
    /// empty, and the format id is [`LOCAL_FORMAT_ID`].
    pub fn for_local_transaction(serial: u64) -> Self {
        let mut gid = vec![0u8; 8];
        BigEndian::write_u64(&mut gid, serial);
        TransactionId {
            gid,
            bqual: Vec::new(),
            format_id: LOCAL_FORMAT_ID,
        }
    }

    /// Global transaction id bytes.
    pub fn gid(&self) -> &[u8] {
        &self.gid
    }

    /// Branch qualifier bytes.
    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }

    /// XA format id.
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Serialized length in bytes.
    pub fn encoded_len(&self) -> usize {
        1 + 1 + 4 + self.gid.len() + self.bqual.len()
    }

    /// Append the wire form to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.gid.len() as u8);
        out.push(self.bqual.len() as u8);
        let mut fid = [0u8; 4];
        LittleEndian::write_i32(&mut fid, self.format_id);
        out.extend_from_slice(&fid);
        out.extend_from_slice(&self.gid);
        out.extend_from_slice(&self.bqual);
    }

    /// Decode a wire-form id, returning it and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
        if bytes.len() < 6 {
            return None;
        }
        let gid_len = bytes[0] as usize;
        let bqual_len = bytes[1] as usize;
        let format_id = LittleEndian::read_i32(&bytes[2..6]);
        let total = 6 + gid_len + bqual_len;
        if bytes.len() < total {
            return None;
        }
        let gid = bytes[6..6 + gid_len].to_vec();
        let bqual = bytes[6 + gid_len..total].to_vec();
        Some((
            TransactionId {
                gid,
                bqual,
                format_id,
            },
            total,
        ))
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn[")?;
        for b in &self.gid {
            write!(f, "{b:02x}")?;
        }
        if !self.bqual.is_empty() {
            write!(f, ":")?;
            for b in &self.bqual {
                write!(f, "{b:02x}")?;
            }
        }
        write!(f, "@{}]", self.format_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_id_roundtrip() {
        let id = TransactionId::for_local_transaction(42);
        assert_eq!(id.format_id(), LOCAL_FORMAT_ID);
        assert_eq!(id.gid().len(), 8);
        assert!(id.bqual().is_empty());

        let mut bytes = Vec::new();
        id.encode_into(&mut bytes);
        assert_eq!(bytes.len(), id.encoded_len());
        let (decoded, consumed) = TransactionId::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, id);
    }

    #[test]
    fn equality_is_by_content() {
        let a = TransactionId::new(vec![1, 2, 3], vec![9], 7);
        let b = TransactionId::new(vec![1, 2, 3], vec![9], 7);
        let c = TransactionId::new(vec![1, 2, 3], vec![9], 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let id = TransactionId::for_local_transaction(7);
        let mut bytes = Vec::new();
        id.encode_into(&mut bytes);
        assert!(TransactionId::decode(&bytes[..bytes.len() - 1]).is_none());
        assert!(TransactionId::decode(&[]).is_none());
    }
}
