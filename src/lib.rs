//! # twinode
//!
//! Runtime pieces for small robot-control nodes that talk over a two-wire bus:
//! a cooperative tick scheduler, a USI-style bus slave, a round-robin bus
//! master, and the host command link that ties them to a PC.
//!
//! ## Features
//!
//! - **Tick scheduler**: fixed table of deferred calls, wrap-safe 16-bit deadlines
//! - **Fatal fault path**: numeric fault codes, serial report frame, blink pattern
//! - **Bus slave**: interrupt-driven state machine with bounded task-side waits
//! - **Bus master**: non-blocking poller, one bus step per scheduler pass
//! - **Host link**: compact command frames with a 3-bit payload size code
//! - **Simulation**: the whole brain/satellite set running on a simulated bus
//!
//! ## Quick Start
//!
//! ```rust
//! use twinode::{Clock, Fault, Scheduler};
//!
//! fn blink(sched: &mut Scheduler<'_, u32, u16, 4>, count: &mut u32, period: u16) -> Result<(), Fault> {
//!     *count += 1;
//!     sched.after(period, blink, period)
//! }
//!
//! let clock = Clock::new();
//! let mut sched: Scheduler<'_, u32, u16, 4> = Scheduler::new(&clock);
//! let mut count = 0;
//! sched.after(0, blink, 10).unwrap();
//!
//! for _ in 0..25 {
//!     sched.schedule(&mut count).unwrap();
//!     clock.advance(1);
//! }
//! assert_eq!(count, 3);
//! ```
//!
//! ## Architecture
//!
//! - [`clock`] - tick counter and bounded waits
//! - [`scheduler`] - deferred-call table
//! - [`fault`] - fatal fault codes and the halt path
//! - [`ring`] - interrupt/task byte queue
//! - [`slave`] - two-wire slave engine
//! - [`master`] - two-wire master poller
//! - [`registers`], [`hostlink`] - host-facing data and framing
//! - [`node`] - brain and satellite tasks
//! - [`sim`] - simulated bus and node set
//! - [`config`] - JSON-loadable configuration

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod clock;
pub mod config;
pub mod error;
pub mod fault;
pub mod hostlink;
pub mod master;
pub mod node;
pub mod registers;
pub mod ring;
pub mod scheduler;
pub mod sim;
pub mod slave;

// Re-export main public types for convenience
pub use clock::{Clock, Tick, Timeout};
pub use config::NodeConfig;
pub use error::{BusError, ConfigError, HostLinkError, SimError};
pub use fault::{Fault, FaultHandler, FaultMode, FaultReport};
pub use hostlink::{decode_frame, encode_counter_report, HostCommand};
pub use master::{DeviceConfig, Direction, PollState, Poller, PollerConfig, TwiError, TwiMaster};
pub use node::{Brain, Satellite, SatelliteRole};
pub use registers::SharedRegisters;
pub use ring::RingBuffer;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
pub use sim::{Mp2Rig, Mp2Slaves, SimBus, SimUsi};
pub use slave::{BusSlave, SlaveConfig, SlaveEngine, SlaveState, SlaveWatchdog, UsiAction, UsiPort};
