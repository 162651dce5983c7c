//! USB microcontroller board discovery and lifecycle tracking.
//!
//! Raw USB endpoints (hidraw and tty nodes) are enumerated and watched
//! through udev, grouped into [`Board`]s by USB port, and reported to
//! registered callbacks as boards appear, change mode, go missing and are
//! finally dropped.
//!
//! ```no_run
//! use boardmon::{BoardEvent, Context, DeviceFilter, Monitor};
//!
//! # fn main() -> boardmon::Result<()> {
//! let ctx = Context::new()?;
//! let mut monitor = Monitor::new(&ctx, DeviceFilter::all())?;
//! monitor.register_callback(|board, event| {
//!     if event == BoardEvent::Added {
//!         println!("{} {}", board.tag(), board.model_name());
//!     }
//!     Ok(())
//! });
//! monitor.start()?;
//! monitor.wait(None, |_| Ok(false))?;
//! # Ok(())
//! # }
//! ```

pub mod board;
pub mod board_manager;
pub mod collections;
pub mod config;
pub mod device;
pub mod device_monitor;
pub mod error;
pub mod filter;
pub mod monitor;
pub mod tracing;
pub mod transport;

pub use board::{
    Board, BoardEvent, BoardInterface, BoardState, BoardSummary, Capabilities, Capability,
    InterfaceHandle,
};
pub use board_manager::CallbackId;
pub use config::MonitorConfig;
pub use device::{DeviceEvent, DeviceType, RawDevice};
pub use error::{Error, Result};
pub use filter::{DeviceFilter, DeviceMatch};
pub use monitor::Monitor;
pub use transport::Context;
