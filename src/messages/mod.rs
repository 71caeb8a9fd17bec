//! The DKG wire format.
//!
//! Every protocol message travels as a [`DkgMessage`]: a type tag, the
//! round it belongs to, the sender's address, the opaque encoded crypto
//! payload and an ed25519 signature. The binary encoding is bincode with
//! its default fixed-width little-endian integer layout, produced through
//! an explicit [`Codec`] value so the encoding configuration is pinned in
//! one place. Signing bytes are the same encoding with the signature
//! field emptied, so a message can be verified from exactly what was
//! signed.

use serde::{Deserialize, Serialize};
use strum::EnumIter;
use thiserror::Error;

use crate::crypto::signature::ValidatorAddress;
use crate::error::*;
use crate::ordering::{Orderable, RoundId};
use crate::Err;

/// The seven protocol message types, in phase order.
#[derive(Serialize, Deserialize, EnumIter)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageKind {
    PubKey,
    Deal,
    Response,
    Justification,
    Commits,
    Complaint,
    ReconstructCommit,
}

impl MessageKind {
    /// The numeric tag used in on-chain query routes.
    pub fn code(&self) -> u8 {
        match self {
            MessageKind::PubKey => 0,
            MessageKind::Deal => 1,
            MessageKind::Response => 2,
            MessageKind::Justification => 3,
            MessageKind::Commits => 4,
            MessageKind::Complaint => 5,
            MessageKind::ReconstructCommit => 6,
        }
    }
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Failed to encode message: {0}")]
    Encode(String),
    #[error("Failed to decode message: {0}")]
    Decode(String),
    #[error("Message has an empty owner address")]
    EmptyOwner,
}

/// Marker for a deal that is not addressed to a specific participant.
pub const NO_RECIPIENT: i32 = -1;

/// The only object that ever crosses the wire between DKG participants.
#[derive(Serialize, Deserialize, Clone)]
pub struct DkgMessage {
    pub kind: MessageKind,
    pub round_id: RoundId,
    pub from_addr: ValidatorAddress,
    /// Payload is the serialized crypto object; empty for the nil
    /// placeholders that keep message counts deterministic.
    pub payload: Vec<u8>,
    /// Receiver index inside the sorted participant list; only
    /// meaningful for deals, [`NO_RECIPIENT`] otherwise.
    pub to_index: i32,
    /// Size hint for variable-length commitment arrays, used by commits
    /// and complaints.
    pub num_entities: u32,
    /// Signature over the message with this field emptied.
    pub signature: Vec<u8>,
}

impl DkgMessage {
    pub fn new(kind: MessageKind, round_id: RoundId, from_addr: ValidatorAddress) -> Self {
        Self {
            kind,
            round_id,
            from_addr,
            payload: Vec::new(),
            to_index: NO_RECIPIENT,
            num_entities: 0,
            signature: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_to_index(mut self, to_index: usize) -> Self {
        self.to_index = to_index as i32;
        self
    }

    pub fn with_num_entities(mut self, num_entities: usize) -> Self {
        self.num_entities = num_entities as u32;
        self
    }

    /// Whether the payload is one of the nil placeholders.
    pub fn is_nil(&self) -> bool {
        self.payload.is_empty()
    }

    /// The exact bytes signatures are computed over.
    pub fn sign_bytes(&self, codec: &Codec) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();

        codec.encode(&unsigned)
    }

    pub fn set_signature(&mut self, signature: Vec<u8>) {
        self.signature = signature;
    }

    pub fn validate_basic(&self) -> Result<()> {
        if self.from_addr.as_ref().iter().all(|byte| *byte == 0) {
            return Err!(MessageError::EmptyOwner);
        }

        Ok(())
    }
}

impl Orderable for DkgMessage {
    fn round_id(&self) -> RoundId {
        self.round_id
    }
}

impl std::fmt::Debug for DkgMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DkgMessage")
            .field("kind", &self.kind)
            .field("round_id", &self.round_id)
            .field("from", &self.from_addr)
            .field("to_index", &self.to_index)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// The fixed binary encoding of the engine.
///
/// One value is constructed at startup and threaded to everything that
/// encodes or decodes, replacing any notion of a process-wide
/// registration table.
#[derive(Copy, Clone, Default)]
pub struct Codec;

impl Codec {
    pub fn new() -> Self {
        Codec
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|err| MessageError::Encode(format!("{}", err)).into())
    }

    pub fn decode<'de, T: Deserialize<'de>>(&self, bytes: &'de [u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|err| MessageError::Decode(format!("{}", err)).into())
    }
}

/// The transaction envelope the on-chain transport submits.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MsgSendDkgData {
    pub data: DkgMessage,
    pub owner: ValidatorAddress,
}

impl MsgSendDkgData {
    pub fn new(data: DkgMessage, owner: ValidatorAddress) -> Self {
        Self { data, owner }
    }

    /// The name of the module routing these transactions.
    pub fn route(&self) -> &'static str {
        "randapp"
    }

    /// The action carried out by these transactions.
    pub fn action(&self) -> &'static str {
        "send_dkg_data"
    }

    /// Runs stateless checks on the message.
    pub fn validate_basic(&self) -> Result<()> {
        if self.owner.as_ref().iter().all(|byte| *byte == 0) {
            return Err!(MessageError::EmptyOwner);
        }

        self.data.validate_basic()
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    fn sample_addr() -> ValidatorAddress {
        ValidatorAddress::from_bytes([7u8; ValidatorAddress::LENGTH])
    }

    fn sample_message() -> DkgMessage {
        DkgMessage::new(MessageKind::Deal, RoundId::from(3), sample_addr())
            .with_payload(vec![1, 2, 3])
            .with_to_index(2)
            .with_num_entities(5)
    }

    #[test]
    fn messages_round_trip_through_the_codec() {
        let codec = Codec::new();
        let mut message = sample_message();
        message.set_signature(vec![9; 64]);

        let encoded = codec.encode(&message).unwrap();
        let decoded: DkgMessage = codec.decode(&encoded).unwrap();

        assert_eq!(decoded.kind, message.kind);
        assert_eq!(decoded.round_id, message.round_id);
        assert_eq!(decoded.from_addr, message.from_addr);
        assert_eq!(decoded.payload, message.payload);
        assert_eq!(decoded.to_index, message.to_index);
        assert_eq!(decoded.num_entities, message.num_entities);
        assert_eq!(decoded.signature, message.signature);
    }

    #[test]
    fn sign_bytes_ignore_the_signature_field() {
        let codec = Codec::new();
        let mut message = sample_message();

        let before = message.sign_bytes(&codec).unwrap();
        message.set_signature(vec![42; 64]);
        let after = message.sign_bytes(&codec).unwrap();

        assert_eq!(before, after);

        let reencoded: DkgMessage = codec.decode(&codec.encode(&message).unwrap()).unwrap();
        assert_eq!(reencoded.sign_bytes(&codec).unwrap(), before);
    }

    #[test]
    fn kind_codes_are_dense_and_ordered() {
        let codes: Vec<u8> = MessageKind::iter().map(|kind| kind.code()).collect();

        assert_eq!(codes, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn envelopes_reject_an_empty_owner() {
        let message = sample_message();
        let empty = ValidatorAddress::from_bytes([0u8; ValidatorAddress::LENGTH]);

        assert!(MsgSendDkgData::new(message.clone(), empty).validate_basic().is_err());
        assert!(MsgSendDkgData::new(message, sample_addr()).validate_basic().is_ok());
    }
}
