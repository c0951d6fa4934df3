//! Frame brokering between one device and many clients
//!
//! ```text
//!                          Arc<Broker>
//!                ┌────────────────────────────┐
//!   DeviceAdapter│ clients: Vec<Weak<..>>     │
//!   deliver_frame│ requests: pending/next     │
//!   ────────────►│ tracker:  {id, ref_count}  │
//!                │ master:   Weak<..>         │
//!                └──────┬──────────┬──────────┘
//!                       │          │
//!                       ▼          ▼
//!                 [VirtualClient] [VirtualClient]
//!                  ready/held      ready/held
//! ```
//!
//! Each frame from the device serves the pending paced requests (one
//! snapshot per cycle, rate-limited per client), fans out to every unpaced
//! client, and is either tracked with the number of acceptances or handed
//! straight back to the device when nobody took it.

pub mod config;
pub mod hub;

pub(crate) mod requests;
pub(crate) mod tracker;

pub use config::BrokerConfig;
pub use hub::{Broker, StreamPhase};
