pub mod codec;
pub mod envelope;
pub mod gateway;
pub mod relay;

pub use envelope::{Direction, Envelope, SignalPayload};
pub use gateway::{SecurityGateway, SecurityPolicy};
pub use relay::SignalRelay;
