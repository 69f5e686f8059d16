pub mod capture;
pub mod channels;
pub mod controller;
pub mod diagnostics;
pub mod events;
pub mod interfaces;
pub mod logging;
pub mod remote;
pub mod retrieval;
pub mod timesync;

pub use controller::SnifferController;
