pub mod media;
pub mod message;
pub mod user;

pub use media::{Blob, ObjectUrls};
pub use message::{Message, MessageDraft, MessageKind, MessageLog, Sender};
pub use user::{RemoteId, User};
