//! Typed DMS messages carried as TLV packets.

use bytes::Bytes;

use crate::tlv::{read_str, read_u16, TlvError, TlvReader, TlvWriter};

/// Protocol version stamped on every packet.
pub const DMS_VERSION_VALUE: u16 = 200;

/// Field tags, in the order they appear on the wire.
pub mod tags {
    pub const COMMAND_ID: u8 = 1;
    pub const CALLEE_BUNDLE_NAME: u8 = 2;
    pub const CALLEE_ABILITY_NAME: u8 = 3;
    pub const CALLER_SIGNATURE: u8 = 4;
    pub const DMS_VERSION: u8 = 5;
    pub const START_ABILITY_RESULT: u8 = 6;
}

/// Command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandId {
    /// Ask the peer to start an ability.
    StartFa = 1,
    /// Peer's answer to [`CommandId::StartFa`].
    StartFaReply = 2,
}

impl TryFrom<u16> for CommandId {
    type Error = TlvError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CommandId::StartFa),
            2 => Ok(CommandId::StartFaReply),
            other => Err(TlvError::UnexpectedCommand(other)),
        }
    }
}

/// Request to start an ability on the receiving device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartAbilityRequest {
    pub callee_bundle_name: String,
    pub callee_ability_name: String,
    /// Claimed signing identity of the caller. `None` when the field was
    /// absent on the wire; encoded as an empty string when unavailable.
    pub caller_signature: Option<String>,
    pub version: u16,
}

impl StartAbilityRequest {
    pub fn new(
        callee_bundle_name: impl Into<String>,
        callee_ability_name: impl Into<String>,
        caller_signature: Option<String>,
    ) -> Self {
        Self {
            callee_bundle_name: callee_bundle_name.into(),
            callee_ability_name: callee_ability_name.into(),
            caller_signature,
            version: DMS_VERSION_VALUE,
        }
    }

    pub fn encode(&self) -> Result<Bytes, TlvError> {
        let mut writer = TlvWriter::new();
        writer
            .put_u16(tags::COMMAND_ID, CommandId::StartFa as u16)?
            .put_str(tags::CALLEE_BUNDLE_NAME, &self.callee_bundle_name)?
            .put_str(tags::CALLEE_ABILITY_NAME, &self.callee_ability_name)?
            .put_str(
                tags::CALLER_SIGNATURE,
                self.caller_signature.as_deref().unwrap_or(""),
            )?
            .put_u16(tags::DMS_VERSION, self.version)?;
        Ok(writer.finish())
    }
}

/// Result of a [`StartAbilityRequest`], sent back on the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartAbilityReply {
    /// Numeric result code, zero on success.
    pub result_code: u16,
    pub version: u16,
}

impl StartAbilityReply {
    pub fn new(result_code: u16) -> Self {
        Self {
            result_code,
            version: DMS_VERSION_VALUE,
        }
    }

    pub fn encode(&self) -> Result<Bytes, TlvError> {
        let mut writer = TlvWriter::new();
        writer
            .put_u16(tags::COMMAND_ID, CommandId::StartFaReply as u16)?
            .put_u16(tags::DMS_VERSION, self.version)?
            .put_u16(tags::START_ABILITY_RESULT, self.result_code)?;
        Ok(writer.finish())
    }
}

/// Any message the DMS endpoint understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmsMessage {
    StartAbility(StartAbilityRequest),
    StartAbilityReply(StartAbilityReply),
}

impl DmsMessage {
    /// Decode a packet. The command id must be the first item.
    pub fn decode(packet: &[u8]) -> Result<Self, TlvError> {
        let mut reader = TlvReader::new(packet)?;
        let command = match reader.next_item()? {
            Some((tags::COMMAND_ID, value)) => CommandId::try_from(read_u16(tags::COMMAND_ID, value)?)?,
            _ => return Err(TlvError::MissingField("command_id")),
        };

        let mut bundle_name = None;
        let mut ability_name = None;
        let mut caller_signature = None;
        let mut version = None;
        let mut result_code = None;

        while let Some((tag, value)) = reader.next_item()? {
            match tag {
                tags::CALLEE_BUNDLE_NAME => bundle_name = Some(read_str(tag, value)?),
                tags::CALLEE_ABILITY_NAME => ability_name = Some(read_str(tag, value)?),
                tags::CALLER_SIGNATURE => caller_signature = Some(read_str(tag, value)?),
                tags::DMS_VERSION => version = Some(read_u16(tag, value)?),
                tags::START_ABILITY_RESULT => result_code = Some(read_u16(tag, value)?),
                // Newer peers may append fields we do not know about.
                _ => {}
            }
        }

        let version = version.ok_or(TlvError::MissingField("dms_version"))?;
        match command {
            CommandId::StartFa => Ok(DmsMessage::StartAbility(StartAbilityRequest {
                callee_bundle_name: bundle_name.ok_or(TlvError::MissingField("callee_bundle_name"))?,
                callee_ability_name: ability_name
                    .ok_or(TlvError::MissingField("callee_ability_name"))?,
                caller_signature,
                version,
            })),
            CommandId::StartFaReply => Ok(DmsMessage::StartAbilityReply(StartAbilityReply {
                result_code: result_code.ok_or(TlvError::MissingField("start_ability_result"))?,
                version,
            })),
        }
    }

    pub fn command(&self) -> CommandId {
        match self {
            DmsMessage::StartAbility(_) => CommandId::StartFa,
            DmsMessage::StartAbilityReply(_) => CommandId::StartFaReply,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_request_field_order_on_wire() {
        let req = StartAbilityRequest::new("com.app", "MainAbility", Some("SIG123".into()));
        let packet = req.encode().unwrap();

        let mut reader = TlvReader::new(&packet).unwrap();
        let mut seen = Vec::new();
        while let Some((tag, _)) = reader.next_item().unwrap() {
            seen.push(tag);
        }
        assert_eq!(
            seen,
            vec![
                tags::COMMAND_ID,
                tags::CALLEE_BUNDLE_NAME,
                tags::CALLEE_ABILITY_NAME,
                tags::CALLER_SIGNATURE,
                tags::DMS_VERSION,
            ]
        );

        assert_eq!(DmsMessage::decode(&packet).unwrap(), DmsMessage::StartAbility(req));
    }

    #[test]
    fn test_missing_signature_encodes_empty() {
        let req = StartAbilityRequest::new("com.app", "MainAbility", None);
        let packet = req.encode().unwrap();
        match DmsMessage::decode(&packet).unwrap() {
            DmsMessage::StartAbility(decoded) => {
                assert_eq!(decoded.caller_signature.as_deref(), Some(""));
                assert_eq!(decoded.version, DMS_VERSION_VALUE);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_absent_signature_field_decodes_as_none() {
        let mut writer = TlvWriter::new();
        writer
            .put_u16(tags::COMMAND_ID, CommandId::StartFa as u16)
            .unwrap()
            .put_str(tags::CALLEE_BUNDLE_NAME, "com.app")
            .unwrap()
            .put_str(tags::CALLEE_ABILITY_NAME, "Main")
            .unwrap()
            .put_u16(tags::DMS_VERSION, DMS_VERSION_VALUE)
            .unwrap();
        let packet = writer.finish();

        match DmsMessage::decode(&packet).unwrap() {
            DmsMessage::StartAbility(decoded) => assert!(decoded.caller_signature.is_none()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_reply_decodes() {
        let packet = StartAbilityReply::new(6).encode().unwrap();
        let msg = DmsMessage::decode(&packet).unwrap();
        assert_eq!(msg.command(), CommandId::StartFaReply);
        assert_eq!(msg, DmsMessage::StartAbilityReply(StartAbilityReply::new(6)));
    }

    #[test]
    fn test_oversized_request_rejected() {
        let req = StartAbilityRequest::new("b".repeat(120), "a".repeat(120), Some("s".repeat(40)));
        assert!(matches!(req.encode(), Err(TlvError::PacketTooLarge(_, _))));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut writer = TlvWriter::new();
        writer.put_u16(tags::COMMAND_ID, 99).unwrap();
        assert_eq!(
            DmsMessage::decode(&writer.finish()).unwrap_err(),
            TlvError::UnexpectedCommand(99)
        );
    }

    #[test]
    fn test_missing_command_rejected() {
        let mut writer = TlvWriter::new();
        writer.put_str(tags::CALLEE_BUNDLE_NAME, "com.app").unwrap();
        assert_eq!(
            DmsMessage::decode(&writer.finish()).unwrap_err(),
            TlvError::MissingField("command_id")
        );
    }

    proptest! {
        #[test]
        fn prop_decode_arbitrary_bytes_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = DmsMessage::decode(&data);
        }
    }
}
