//! Call lifecycle: media, provider link, transcript, recording, persistence.

pub mod manager;
pub mod media;
pub mod recorder;
pub mod session;

pub use manager::{CallConfig, CallManager, CLOSING_MESSAGE};
pub use media::{MediaSource, MediaStream};
pub use recorder::{AudioBlob, AudioBuffer, Track};
pub use session::{CallCommand, CallMetadata, CallUpdate, EndReason, RelayEvent, Session, SessionId};
