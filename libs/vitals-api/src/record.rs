/// One transport unit. The transport never interprets `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was read from or is addressed to.
    pub topic: String,
    /// Broker position, when the transport knows one.
    pub offset: Option<u64>,
    /// Opaque bytes (UTF-8 JSON for vitals topics).
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            offset: None,
            payload,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Payload as text for diagnostics. Invalid UTF-8 is replaced, never fails.
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
