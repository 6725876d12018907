use crate::Result;
use async_trait::async_trait;
use std::fmt;

/// Provides the caller's audio input for one call.
#[async_trait]
pub trait MediaSource: Send {
    /// # Errors
    /// Returns [`crate::Error::MediaAccess`] when the input is denied,
    /// unsupported, or never becomes available.
    async fn acquire(&mut self) -> Result<MediaStream>;
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A live audio input. Releasing it stops the capture; dropping it releases
/// it if that has not happened yet.
pub struct MediaStream {
    sample_rate: u32,
    release: Option<ReleaseHook>,
    released: bool,
}

impl MediaStream {
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate, release: None, released: false }
    }

    #[must_use]
    pub fn on_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub const fn is_live(&self) -> bool {
        !self.released
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        tracing::debug!("Releasing audio input");
        if let Some(hook) = self.release.take() {
            hook();
        }
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("sample_rate", &self.sample_rate)
            .field("live", &self.is_live())
            .finish()
    }
}
