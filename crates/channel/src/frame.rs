//! Bounded frames for [`ChannelMessage`].
//!
//! Frames are postcard-encoded messages no larger than [`MAX_FRAME_LEN`]; a
//! decoded frame is guaranteed to carry a known badge ordinal.

use sigil_primitives::BadgeState;

use crate::{ChannelError, ChannelMessage, Result};

/// Largest encoded message one frame can hold.
pub const MAX_FRAME_LEN: usize = 4096;

/// Encodes one message into a frame.
pub fn encode(message: &ChannelMessage) -> Result<Vec<u8>> {
	let bytes = postcard::to_stdvec(message)?;
	if bytes.len() > MAX_FRAME_LEN {
		return Err(ChannelError::MessageTooLarge {
			len: bytes.len(),
			limit: MAX_FRAME_LEN,
		});
	}
	Ok(bytes)
}

/// Decodes one frame.
pub fn decode(frame: &[u8]) -> Result<ChannelMessage> {
	if frame.len() > MAX_FRAME_LEN {
		return Err(ChannelError::MessageTooLarge {
			len: frame.len(),
			limit: MAX_FRAME_LEN,
		});
	}
	let message: ChannelMessage = postcard::from_bytes(frame)?;
	BadgeState::try_from(message.state)?;
	Ok(message)
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use sigil_primitives::BadgePath;

	use super::*;
	use crate::{EventSubType, EventType};

	#[test]
	fn frame_preserves_message() {
		let message = ChannelMessage::core(EventSubType::AddBadgePath, BadgeState::Failed, &BadgePath::new("/cloud/ä/b.txt"));
		let frame = encode(&message).expect("encode");
		assert_eq!(decode(&frame).expect("decode"), message);
	}

	#[test]
	fn oversized_path_is_rejected() {
		let path = BadgePath::new(&format!("/cloud/{}", "x".repeat(MAX_FRAME_LEN)));
		let message = ChannelMessage::core(EventSubType::AddBadgePath, BadgeState::Syncing, &path);
		assert!(matches!(encode(&message), Err(ChannelError::MessageTooLarge { .. })));
	}

	#[test]
	fn unknown_ordinal_is_rejected_on_decode() {
		let message = ChannelMessage {
			event: EventType::CoreToPeer,
			sub_type: EventSubType::AddBadgePath,
			state: 9,
			path: "/cloud".to_string(),
		};
		let frame = postcard::to_stdvec(&message).expect("encode");
		assert!(matches!(decode(&frame), Err(ChannelError::InvalidBadgeState(_))));
	}

	#[test]
	fn truncated_frame_is_a_codec_error() {
		let frame = encode(&ChannelMessage::peer_initialized()).expect("encode");
		assert!(matches!(decode(&frame[..1]), Err(ChannelError::Codec(_))));
	}
}
