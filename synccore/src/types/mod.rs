pub mod message;
pub mod profile;
pub mod room;
pub mod typing;

pub use message::{
    FileAttachment, Message, MessageKind, MessagePreview, NewMessage, is_placeholder_id,
    next_placeholder_id,
};
pub use profile::{SenderKind, SenderProfile, Viewer};
pub use room::{Room, RoomMember};
pub use typing::TypingSignal;
