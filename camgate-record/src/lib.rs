pub mod consumer;
pub mod error;
pub mod hub;
pub mod jobs;
pub mod mutation;
pub mod muxer;
pub mod naming;
pub mod ring;
pub mod session;
pub mod source;
pub mod supervisor;

pub use consumer::{AdapterPolicy, ConsumerAdapter};
pub use error::{RecordError, Result};
pub use hub::{LiveStream, LiveStreamHub};
pub use jobs::{FinalizeRunner, RetentionSweep};
pub use mutation::{MutationAction, MutationError, StreamMutation};
pub use muxer::HeaderCachingConsumer;
pub use naming::SegmentWindow;
pub use ring::{Clock, RingOptions, RotationHandle, SegmentRing, SwitchEvent};
pub use session::{RecordingRegistry, RecordingSession, SessionStatus};
pub use source::{
    ChunkReceiver, ChunkSender, ChunkSink, ConsumerInfo, SourceError, StreamConsumer,
    StreamSource, TrackFilter, CHUNK_CHANNEL_CAPACITY,
};
pub use supervisor::RecordingSupervisor;
