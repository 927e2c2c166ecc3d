//! slotd-core: Core library for the memory card and USB mode daemon.
//!
//! This library holds the state machines that keep memory card slots
//! mounted, shared over USB or swapped on, and the system collaborators
//! they drive.
//!
//! # Modules
//!
//! - [`card`]: Card slot state machine and card operations
//! - [`usb`]: USB cable mode state machine and USB host storages
//! - [`swap`]: Swap files on cards
//! - [`coordinator`]: Dispatches every input to the state machines
//! - [`registry`]: Device tree abstraction; [`disk`] scans the real one with `lsblk`
//! - [`mount`]: Helper programs (mount, unmount, check, format, ...)
//! - [`protocol`]: Signed JSON-lines control protocol
//! - [`config`]: TOML configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use slotd_core::{Config, Coordinator, Services};
//! use slotd_core::disk::SysfsRegistry;
//! use slotd_core::executor::SystemRunner;
//! use slotd_core::status::StatusBoard;
//! use slotd_core::swap::SystemSwap;
//! use slotd_core::timer::SystemClock;
//! # struct Silent;
//! # impl slotd_core::dialog::DialogGateway for Silent {
//! #     fn open_dialog(&mut self, _: slotd_core::dialog::Severity, _: &slotd_core::dialog::Notice) -> Option<slotd_core::dialog::DialogId> { None }
//! #     fn close_dialog(&mut self, _: slotd_core::dialog::DialogId) {}
//! #     fn show_banner(&mut self, _: &slotd_core::dialog::Notice) {}
//! #     fn show_note(&mut self, _: &slotd_core::dialog::Notice) {}
//! #     fn broadcast_exit(&mut self) -> bool { false }
//! # }
//!
//! let config = Config::locate(None).unwrap();
//! let services = Services {
//!     registry: Box::new(SysfsRegistry::scan(&config).unwrap()),
//!     runner: Box::new(SystemRunner::new()),
//!     dialogs: Box::new(Silent),
//!     status: Box::new(StatusBoard::with_dir(&config.daemon.state_dir).unwrap()),
//!     swap: Box::new(SystemSwap::new(Path::new("/proc"))),
//!     clock: Box::new(SystemClock::new()),
//! };
//! let mut coordinator = Coordinator::new(&config, services);
//! coordinator.start();
//! coordinator.fire_due_timers();
//! coordinator.shutdown();
//! ```

pub mod card;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod dialog;
pub mod disk;
pub mod error;
pub mod event;
pub mod executor;
pub mod fat;
pub mod mount;
pub mod protocol;
pub mod registry;
pub mod slot;
pub mod status;
pub mod swap;
pub mod timer;
pub mod usb;
pub mod volume;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::{Coordinator, Services};
pub use error::{Error, RequestError, Result};
pub use event::{Input, Reply, Request};
pub use slot::Slot;
