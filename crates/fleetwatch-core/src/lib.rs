pub mod feed;
pub mod liveness;
pub mod telemetry;
pub mod wire;
