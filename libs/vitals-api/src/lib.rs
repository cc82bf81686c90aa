pub mod error;
pub mod record;
pub mod transport;
pub mod vitals;

pub use error::{ErrorKind, TransportError};
pub use record::Message;
pub use transport::{
    ConsumerSettings, InboundStream, OffsetReset, OutboundPublisher, SecurityProtocol,
    SecuritySettings, Transport,
};
pub use vitals::{VitalField, VitalsRecord};
