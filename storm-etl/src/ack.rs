use std::fmt;

use crate::error::AckError;

/// Settles the source position of one fetched record.
///
/// Both operations consume the capability, so a record is settled at most once.
pub trait Acknowledge: Send + Sync {
    /// Advance the source position past this record.
    fn ack(self: Box<Self>) -> Result<(), AckError>;

    /// Release the record without advancing, it will be redelivered.
    fn nack(self: Box<Self>);
}

/// Token handed out alongside each fetched record.
pub struct AckHandle {
    inner: Box<dyn Acknowledge>,
}

impl AckHandle {
    pub fn new(inner: impl Acknowledge + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    pub fn ack(self) -> Result<(), AckError> {
        self.inner.ack()
    }

    pub fn nack(self) {
        self.inner.nack()
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AckHandle")
    }
}
