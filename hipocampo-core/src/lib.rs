pub mod api;
pub mod app;
pub mod audio;
pub mod chat;
pub mod config;
pub mod error;
pub mod models;
pub mod phone;
pub mod store;

#[cfg(test)]
mod test_support;

pub use api::{AgentApi, ApiClient, ApiError};
pub use app::{App, AuthError, Screen};
pub use audio::{
    AudioRecorder, DeviceError, MediaDevices, Meter, PlaybackSink, RecorderError, RecorderState,
    SilentPlayback, UnavailableDevices,
};
pub use chat::{ChatSession, SendOutcome, SkipReason};
pub use config::HipocampoConfig;
pub use error::HipocampoError;
pub use models::{Blob, Message, MessageKind, ObjectUrls, RemoteId, Sender, User};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, PersistentCell};

#[cfg(feature = "microphone")]
pub use audio::cpal_backend::{CpalDevices, CpalPlayback};
