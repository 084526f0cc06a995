//! Tuner state machine.
//!
//! Mediates exclusive access to the single hardware tuner:
//! - serializes `tune`/`stop` against one mutex
//! - owns at most one live media pipeline at a time
//! - fans out media samples and status snapshots through lossy hubs

pub mod pipeline;

use crate::atsc::{Channel, ChannelMap};
use crate::hub::{Hub, Subscription};
use bytes::Bytes;
use log::{info, warn};
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Subscribers' status buffer depth. Snapshots are small and frequent
/// transitions are rare, so a shallow buffer is plenty.
const STATUS_BUFFER: usize = 16;

/// Subscribers' media buffer depth. Roughly one second of combined
/// audio/video samples; a client that lags further resynchronizes at the
/// next keyframe.
const MEDIA_BUFFER: usize = 64;

/// Video pipeline implementation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoPipelineVariant {
    /// Software H.264 encode.
    #[default]
    Default,
    /// Reduced-resolution software encode for weak CPUs.
    LowPower,
    /// VA-API hardware-accelerated encode.
    Vaapi,
}

impl VideoPipelineVariant {
    /// Parse a variant name. Unknown values collapse to `Default`.
    pub fn parse(s: &str) -> Self {
        match s {
            "lowpower" => VideoPipelineVariant::LowPower,
            "vaapi" => VideoPipelineVariant::Vaapi,
            _ => VideoPipelineVariant::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoPipelineVariant::Default => "default",
            VideoPipelineVariant::LowPower => "lowpower",
            VideoPipelineVariant::Vaapi => "vaapi",
        }
    }
}

/// The media kind of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// One encoded audio or video frame with presentation metadata.
///
/// Produced in strictly increasing per-kind presentation order; `Bytes`
/// payloads make fan-out clones cheap.
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub kind: MediaKind,
    pub data: Bytes,
    pub duration: Duration,
    pub keyframe: bool,
}

/// Terminal fault reported by a media pipeline, at most once per lifetime.
#[derive(Debug, Clone)]
pub struct PipelineError {
    pub cause: String,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline error: {}", self.cause)
    }
}

impl Error for PipelineError {}

/// Observable state of the tuner.
///
/// Serializes to the status wire format:
/// `{"State": "...", "ChannelName": ..., "Error": ...}` with irrelevant
/// fields omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "State", rename_all = "lowercase")]
pub enum TunerStatus {
    Stopped,
    Tuning {
        #[serde(rename = "ChannelName")]
        channel_name: String,
    },
    Playing {
        #[serde(rename = "ChannelName")]
        channel_name: String,
    },
    Error {
        #[serde(rename = "ChannelName")]
        channel_name: String,
        #[serde(rename = "Error")]
        message: String,
    },
}

/// Error returned by tuner operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunerError {
    ChannelNotFound(String),
}

impl fmt::Display for TunerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunerError::ChannelNotFound(name) => write!(f, "channel not found: {}", name),
        }
    }
}

impl Error for TunerError {}

/// Sink invoked by a pipeline for every media sample. Must not block.
pub type SampleSink = Arc<dyn Fn(MediaSample) + Send + Sync>;

/// Sink invoked by a pipeline for its single terminal error. Must not block.
pub type ErrorSink = Arc<dyn Fn(PipelineError) + Send + Sync>;

/// Lifecycle contract of a live media pipeline.
///
/// `stop` is idempotent, blocks until the hardware is released, and
/// guarantees that no sink fires after it returns.
pub trait MediaPipeline: Send + Sync {
    fn stop(&self);
}

/// Constructor for pipelines: either fully activates the hardware and
/// returns, or fails with no resources held.
pub type PipelineFactory = Box<
    dyn Fn(&Channel, SampleSink, ErrorSink) -> Result<Box<dyn MediaPipeline>, PipelineError>
        + Send
        + Sync,
>;

struct Inner {
    status: TunerStatus,
    pipeline: Option<Box<dyn MediaPipeline>>,
    /// Bumped by every `tune`/`stop`. Error sinks capture the generation of
    /// the pipeline they belong to; a mismatch means the tuner has already
    /// moved on and the late error is ignored.
    generation: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    status: Hub<TunerStatus>,
    media: Hub<MediaSample>,
}

impl Shared {
    fn set_status(&self, inner: &mut Inner, status: TunerStatus) {
        inner.status = status.clone();
        self.status.publish(status);
    }

    /// Apply a pipeline fault reported for `generation`. Runs on a dedicated
    /// thread, never on the pipeline's callback thread.
    fn pipeline_failed(&self, generation: u64, error: PipelineError) {
        let mut inner = self.inner.lock().unwrap();
        if inner.generation != generation {
            return;
        }
        let channel_name = match &inner.status {
            TunerStatus::Tuning { channel_name } | TunerStatus::Playing { channel_name } => {
                channel_name.clone()
            }
            _ => return,
        };
        warn!("Pipeline for channel {} failed: {}", channel_name, error.cause);
        if let Some(pipeline) = inner.pipeline.take() {
            pipeline.stop();
        }
        self.set_status(
            &mut inner,
            TunerStatus::Error {
                channel_name,
                message: error.cause,
            },
        );
    }
}

/// Process-wide owner of the hardware tuner and its media pipeline.
pub struct Tuner {
    channels: ChannelMap,
    factory: PipelineFactory,
    shared: Arc<Shared>,
}

impl Tuner {
    /// Create a tuner backed by the GStreamer pipeline for `variant`.
    pub fn new(channels: ChannelMap, variant: VideoPipelineVariant) -> Self {
        Self::with_factory(
            channels,
            Box::new(move |channel, samples, errors| {
                pipeline::GstTunerPipeline::start(channel, variant, samples, errors)
                    .map(|p| Box::new(p) as Box<dyn MediaPipeline>)
            }),
        )
    }

    /// Create a tuner with an injected pipeline constructor.
    pub fn with_factory(channels: ChannelMap, factory: PipelineFactory) -> Self {
        Self {
            channels,
            factory,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    status: TunerStatus::Stopped,
                    pipeline: None,
                    generation: 0,
                }),
                status: Hub::new(STATUS_BUFFER),
                media: Hub::new(MEDIA_BUFFER),
            }),
        }
    }

    /// Channel names in catalog order.
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.names()
    }

    /// Tune to the named channel, tearing down any current pipeline first.
    ///
    /// Blocks until the new pipeline is active (or has failed). Pipeline
    /// failures surface through the `Error` status, not the return value.
    pub fn tune(&self, name: &str) -> Result<(), TunerError> {
        let mut inner = self.shared.inner.lock().unwrap();

        let channel = self
            .channels
            .lookup(name)
            .ok_or_else(|| TunerError::ChannelNotFound(name.to_string()))?
            .clone();

        inner.generation += 1;
        let generation = inner.generation;

        self.shared.set_status(
            &mut inner,
            TunerStatus::Tuning {
                channel_name: channel.name.clone(),
            },
        );

        if let Some(pipeline) = inner.pipeline.take() {
            pipeline.stop();
        }

        let sample_sink: SampleSink = {
            let shared = self.shared.clone();
            Arc::new(move |sample| shared.media.publish(sample))
        };
        let error_sink: ErrorSink = {
            let shared = self.shared.clone();
            // The pipeline reports faults from its own threads; hand the
            // transition off so the callback never waits on the tuner mutex.
            Arc::new(move |error| {
                let shared = shared.clone();
                std::thread::spawn(move || shared.pipeline_failed(generation, error));
            })
        };

        match (self.factory)(&channel, sample_sink, error_sink) {
            Ok(pipeline) => {
                inner.pipeline = Some(pipeline);
                info!("Tuned to channel {}", channel.name);
                self.shared.set_status(
                    &mut inner,
                    TunerStatus::Playing {
                        channel_name: channel.name,
                    },
                );
            }
            Err(error) => {
                warn!("Failed to tune to channel {}: {}", channel.name, error.cause);
                self.shared.set_status(
                    &mut inner,
                    TunerStatus::Error {
                        channel_name: channel.name,
                        message: error.cause,
                    },
                );
            }
        }
        Ok(())
    }

    /// Stop any current pipeline and release the hardware. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.generation += 1;
        if let Some(pipeline) = inner.pipeline.take() {
            pipeline.stop();
            info!("Tuner stopped");
        }
        self.shared.set_status(&mut inner, TunerStatus::Stopped);
    }

    /// Current status.
    pub fn status(&self) -> TunerStatus {
        self.shared.inner.lock().unwrap().status.clone()
    }

    /// Atomic snapshot of the current status plus a live delta stream. No
    /// transition can fall between the snapshot and the subscription.
    pub fn subscribe_status(&self) -> (TunerStatus, Subscription<TunerStatus>) {
        let inner = self.shared.inner.lock().unwrap();
        let subscription = self.shared.status.subscribe();
        (inner.status.clone(), subscription)
    }

    /// Live media sample stream. Delivers nothing while no pipeline exists.
    pub fn subscribe_media(&self) -> Subscription<MediaSample> {
        self.shared.media.subscribe()
    }
}
