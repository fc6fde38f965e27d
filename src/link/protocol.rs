//! # Link protocol
//!
//! Ordered description of the over-the-air header of a connection. Each
//! field has a fixed identity and size; the MAC walks the list in order to
//! compose outgoing headers and to extract incoming ones. A connection's
//! header size is the sum of its field sizes. The auto-reply frame of a
//! connection uses a distinct instance.

use heapless::Vec;

use crate::config::MAX_PROTOCOL_FIELD_COUNT;
use crate::error::WpsError;

/// Identity of a header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FieldId {
    /// Timeslot identifier; bit 7 flags an auto-reply timeslot, the low
    /// seven bits carry the slot index.
    TimeslotId,
    /// Connection index within the timeslot, present when several
    /// connections share a slot.
    ConnectionId,
    /// Random datarate offset, two bytes big-endian.
    RdoOffset,
    /// Credit grant: RX queue free space advertised to the peer.
    CreditControl,
    /// Ranging phase samples of the previous exchange.
    RangingPhases,
}

/// One field of a link protocol.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolField {
    pub id: FieldId,
    pub size: u8,
}

/// Ordered header field list of one connection direction.
#[derive(Debug, Default, Clone)]
pub struct LinkProtocol {
    fields: Vec<ProtocolField, MAX_PROTOCOL_FIELD_COUNT>,
}

impl LinkProtocol {
    /// Append `id` to the header layout.
    pub fn add_field(&mut self, id: FieldId, size: u8) -> Result<(), WpsError> {
        if self.fields.iter().any(|f| f.id == id) {
            return Ok(());
        }
        self.fields
            .push(ProtocolField { id, size })
            .map_err(|_| WpsError::NotEnoughMemory)
    }

    pub fn fields(&self) -> &[ProtocolField] {
        &self.fields
    }

    pub fn contains(&self, id: FieldId) -> bool {
        self.fields.iter().any(|f| f.id == id)
    }

    /// Sum of the field sizes, in bytes.
    pub fn header_size(&self) -> u8 {
        self.fields.iter().map(|f| f.size).sum()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_sum_of_field_sizes() {
        let mut proto = LinkProtocol::default();
        proto.add_field(FieldId::TimeslotId, 1).unwrap();
        proto.add_field(FieldId::RdoOffset, 2).unwrap();
        proto.add_field(FieldId::CreditControl, 1).unwrap();
        assert_eq!(proto.header_size(), 4);
        assert_eq!(proto.fields().len(), 3);
    }

    #[test]
    fn duplicate_fields_are_ignored() {
        let mut proto = LinkProtocol::default();
        proto.add_field(FieldId::TimeslotId, 1).unwrap();
        proto.add_field(FieldId::TimeslotId, 1).unwrap();
        assert_eq!(proto.header_size(), 1);
    }

    #[test]
    fn field_order_is_preserved() {
        let mut proto = LinkProtocol::default();
        proto.add_field(FieldId::TimeslotId, 1).unwrap();
        proto.add_field(FieldId::ConnectionId, 1).unwrap();
        proto.add_field(FieldId::RdoOffset, 2).unwrap();
        let ids: std::vec::Vec<FieldId> = proto.fields().iter().map(|f| f.id).collect();
        assert_eq!(ids, [FieldId::TimeslotId, FieldId::ConnectionId, FieldId::RdoOffset]);
    }

    extern crate std;
}
