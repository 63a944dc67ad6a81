//! Keep live telemetry from an MPPT solar charge controller fresh over Bluetooth Low Energy.
//!
//! Tested with a controller that advertises itself as "Solar regulator".
//!
//! The controller answers a two byte poll (`OK`) with an ASCII record split over several
//! notifications. There is no length prefix: a chunk ending in CR continues the record,
//! a chunk ending in LF closes it, and the leading part of the record tends to arrive after
//! the part that follows it. [`FrameBuffer`] puts the record back together and
//! [`frame_decoder::decode`] turns it into a [`Reading`].
//!
//! The radio link is unreliable, so [`LinkSession`] runs forever: it rediscovers and
//! reconnects after every failure, and after ten failed cycles in a row it resets the
//! local Bluetooth stack.
//!
//! Currently the following data can be read:
//!
//! - Charging current (A)
//! - Battery voltage (V)
//! - Panel voltage (V)
//! - Charging power (W)
//! - Charged capacity (Ah)
//! - Energy harvested today (Wh)
//!
//! # Example
//!
//! ```no_run
//! # use std::time::Duration;
//! # use mpptread::*;
//! #
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let transport = BleTransport::new(config.device.service).await?;
//!     let radio = SystemRadioReset::new(config.recovery.steps.clone());
//!     let store = TelemetryStore::new();
//!     let mut session = LinkSession::new(transport, &config, store.clone(), radio);
//!     tokio::spawn(async move { session.run().await });
//!     loop {
//!         println!("{:?}", store.get_last_reading());
//!         tokio::time::sleep(Duration::from_secs(30)).await;
//!     }
//! # }
//! ```

mod ble_transport;
mod config;
mod error;
mod link_session;
pub mod message;
mod reading;
mod recovery;
mod store;
mod transport;

pub use ble_transport::BleConnection;
pub use ble_transport::BleTransport;
pub use config::Config;
pub use config::DeviceConfig;
pub use config::RecoveryConfig;
pub use config::ReportConfig;
pub use config::ResetStep;
pub use config::TimingConfig;
pub use error::LinkError;
pub use link_session::LinkSession;
pub use link_session::SessionState;
pub use message::frame_buffer::FrameBuffer;
pub use message::frame_decoder;
pub use message::frame_decoder::DecodeError;
pub use reading::Reading;
pub use reading::VoltageSample;
pub use recovery::RadioReset;
pub use recovery::RecoveryPolicy;
pub use recovery::SystemRadioReset;
pub use store::TelemetryStore;
pub use transport::CharacteristicId;
pub use transport::Chunk;
pub use transport::ChunkCallback;
pub use transport::Subscription;
pub use transport::Transport;
