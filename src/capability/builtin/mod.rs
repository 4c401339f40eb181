pub mod clock;
pub mod kv;
pub mod rng;

pub use clock::ClockCapability;
pub use kv::KvCapability;
pub use rng::RngCapability;
