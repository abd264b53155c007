//! Core types shared across the bridge.
//!
//! ## Architecture
//!
//! - [`RawFrame`] is a decoded video frame with zero-copy pixel data
//! - [`SequencedFrame`] is a frame that survived decimation, stamped in arrival order
//! - [`SessionId`], [`ChannelId`] and [`TrackId`] identify sessions, signaling channels and
//!   remote tracks
//! - [`ConnectionState`], [`TrackInfo`] and [`TrackStatus`] mirror what the transport layer
//!   reports about the peer connection
//! - [`IceCandidate`] is the candidate payload moved between signaling and transport
//!
//! ## Usage Example
//!
//! ```rust
//! use hlsbridge::types::{RawFrame, i420_frame_len};
//!
//! let frame = RawFrame::blank_i420(640, 360);
//! assert_eq!(frame.len(), i420_frame_len(640, 360));
//! assert_eq!((frame.width, frame.height), (640, 360));
//! ```

mod candidate;
mod frame;
mod ids;
mod media;

pub use candidate::IceCandidate;
pub use frame::{RawFrame, SequencedFrame, i420_frame_len};
pub use ids::{ChannelId, SessionId, TrackId};
pub use media::{ConnectionState, TrackInfo, TrackKind, TrackStatus};
