//! Core library for the vnic virtual Ethernet adapter.
//!
//! This library lets several independent consumers share one virtual
//! Ethernet adapter: protocol stacks, packet sniffers, and one bridging
//! channel that relays frames to a remote hub.
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! - `addr`: Hardware and DLSAP addresses, instance address generation
//! - `frame`: Ethernet link header parsing and synthesis
//! - `primitive`: Negotiation requests, acknowledgments and error codes
//! - `registry`: Channel slot table with hold-counted lifetimes
//! - `instance`: Adapter instances and their attached-channel lists
//! - `negotiate`: Per-channel attach/bind state machine
//! - `envelope`: Unit-data indications for non-raw consumers
//! - `distribute`: Inbound fan-out and bridge forwarding
//! - `engine`: Entry points tying the above together
//! - `proto` / `transport`: Record framing and TCP link to the hub
//! - `control`: Configuration and delivery counters
//!
//! # Example
//!
//! ```no_run
//! use vnic_core::{Engine, EngineConfig, Request};
//!
//! let engine = Engine::new(EngineConfig::default());
//! engine.create_instance(0)?;
//!
//! let ip = engine.open();
//! ip.request(Request::Attach { ppa: 0 })?;
//! ip.request(Request::Bind { sap: 0x0800 })?;
//! # Ok::<(), vnic_core::EngineError>(())
//! ```

pub mod addr;
pub mod budget;
pub mod channel;
pub mod control;
pub mod distribute;
pub mod engine;
pub mod envelope;
pub mod frame;
pub mod instance;
mod negotiate;
pub mod primitive;
pub mod proto;
pub mod registry;
mod sync;
pub mod transport;

pub use addr::{DlsapAddr, MacAddr};
pub use channel::{ChannelFlags, ChannelId, ChannelStatus};
pub use control::{BridgeConfig, EngineConfig, EngineStats};
pub use engine::{Endpoint, Engine, EngineError, ServiceWorker};
pub use envelope::UnitDataInd;
pub use frame::EtherHeader;
pub use primitive::{DlError, DlState, Ioctl, Primitive, Request, Upstream};
