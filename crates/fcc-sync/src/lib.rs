//! Live state synchronizer for the device console.
//!
//! A [`Session`] mirrors the devices behind one remote call channel. It is
//! driven entirely by explicit events (channel lifecycle, push
//! notifications, call replies, poll timer firings, operator actions) and
//! never performs I/O itself: outbound calls go through the
//! [`RemoteChannel`] the transport layer hands it.

pub mod actions;
pub mod alerts;
pub mod channel;
pub mod device;
mod dispatch;
pub mod error;
pub mod model;
pub mod notify;
mod poller;
pub mod registry;
pub mod scripts;
pub mod session;

pub use actions::{DeviceAction, EntityKind, GlobalAction, MotorOwner};
pub use alerts::{Alert, AlertCoalescer, AlertKind, AlertResponse};
pub use channel::{
    CallId, ChannelClosed, OutboundRequest, RecordingChannel, RemoteChannel, RequestBody,
};
pub use device::{DeviceMirror, EntityGroup, MirrorId, MonitorEntry};
pub use error::{ProtocolError, SyncError};
pub use model::TempSlot;
pub use notify::Notification;
pub use registry::{Registry, Slot};
pub use scripts::{PayloadSandbox, ScriptError, ScriptSandbox};
pub use session::{ActiveContext, Epoch, GlobalSettings, LinkState, Session, SessionConfig};
