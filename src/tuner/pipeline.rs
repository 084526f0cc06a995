//! GStreamer tuner pipeline.
//!
//! Captures an ATSC transport stream from the DVB tuner, demultiplexes the
//! selected program, transcodes to H.264 + Opus, and delivers encoded frames
//! through the tuner's sample sink:
//! - dvbsrc locked to the channel's frequency/modulation
//! - tsdemux selecting the channel's program
//! - per-variant video encode, Opus audio encode
//! - two appsinks feeding [`MediaSample`]s to the sink callbacks

use super::{ErrorSink, MediaKind, MediaPipeline, MediaSample, PipelineError, SampleSink, VideoPipelineVariant};
use crate::atsc::Channel;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Bus poll interval for the monitor thread.
const BUS_POLL_INTERVAL_MS: u64 = 100;

/// How long startup waits for the tuner to lock and decoders to preroll.
const START_TIMEOUT_SECONDS: u64 = 10;

/// A live, hardware-bound capture-and-encode pipeline for one channel.
pub struct GstTunerPipeline {
    pipeline: gst::Pipeline,
    stopped: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl GstTunerPipeline {
    /// Build and activate the pipeline for `channel`.
    ///
    /// Returns only once the pipeline has started playing; on any failure the
    /// partially-built pipeline is torn down and no resources stay allocated.
    pub fn start(
        channel: &Channel,
        variant: VideoPipelineVariant,
        samples: SampleSink,
        errors: ErrorSink,
    ) -> Result<Self, PipelineError> {
        gst::init().map_err(|e| PipelineError {
            cause: format!("GStreamer init failed: {}", e),
        })?;

        let description = pipeline_description(channel, variant);
        debug!("Launching pipeline: {}", description);

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| PipelineError {
                cause: format!("pipeline construction failed: {}", e),
            })?
            .downcast::<gst::Pipeline>()
            .map_err(|_| PipelineError {
                cause: "pipeline description did not produce a pipeline".to_string(),
            })?;

        let stopped = Arc::new(AtomicBool::new(false));
        attach_sink(&pipeline, "video-sink", MediaKind::Video, samples.clone(), stopped.clone())?;
        attach_sink(&pipeline, "audio-sink", MediaKind::Audio, samples, stopped.clone())?;

        let bus = pipeline.bus().ok_or_else(|| PipelineError {
            cause: "pipeline has no bus".to_string(),
        })?;

        if let Err(cause) = start_playing(&pipeline, &bus) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(PipelineError {
                cause: format!(
                    "failed to start pipeline for channel {} ({} Hz): {}",
                    channel.name, channel.frequency_hz, cause
                ),
            });
        }

        info!(
            "Pipeline playing: channel {} at {} Hz ({} video)",
            channel.name,
            channel.frequency_hz,
            variant.as_str()
        );

        let monitor = {
            let stopped = stopped.clone();
            std::thread::spawn(move || monitor_bus(bus, errors, stopped))
        };

        Ok(Self {
            pipeline,
            stopped,
            monitor: Mutex::new(Some(monitor)),
        })
    }
}

impl MediaPipeline for GstTunerPipeline {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Null tears down the streaming threads synchronously; once it
        // returns, no appsink callback can fire again.
        if self.pipeline.set_state(gst::State::Null).is_err() {
            warn!("Failed to set pipeline to Null during stop");
        }
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GstTunerPipeline {
    fn drop(&mut self) {
        MediaPipeline::stop(self);
    }
}

/// Request `Playing` and block until the whole pipeline gets there.
///
/// A live DVB pipeline finishes its state change asynchronously (the tuner
/// has to lock, decodebin has to pick decoders), so `set_state` returning
/// `Async` says nothing about the outcome. Wait for the transition to
/// complete and report the bus error when it does not.
fn start_playing(pipeline: &gst::Pipeline, bus: &gst::Bus) -> Result<(), String> {
    if pipeline.set_state(gst::State::Playing).is_err() {
        return Err(pop_bus_error(bus).unwrap_or_else(|| "state change refused".to_string()));
    }

    let (result, state, _) = pipeline.state(gst::ClockTime::from_seconds(START_TIMEOUT_SECONDS));
    match result {
        Ok(_) if state == gst::State::Playing => Ok(()),
        Ok(gst::StateChangeSuccess::Async) => Err(format!(
            "timed out after {}s waiting for playback (stuck in {:?})",
            START_TIMEOUT_SECONDS, state
        )),
        Ok(_) => Err(format!("pipeline settled in state {:?}", state)),
        Err(_) => Err(pop_bus_error(bus).unwrap_or_else(|| "state change failed".to_string())),
    }
}

/// Take the first pending error message off the bus, if any.
fn pop_bus_error(bus: &gst::Bus) -> Option<String> {
    while let Some(message) = bus.pop_filtered(&[gst::MessageType::Error]) {
        if let gst::MessageView::Error(err) = message.view() {
            return Some(error_cause(&err));
        }
    }
    None
}

fn error_cause(err: &gst::message::Error) -> String {
    match err.debug() {
        Some(detail) => format!("{} ({})", err.error(), detail),
        None => err.error().to_string(),
    }
}

/// Assemble the gst-launch description for a channel and variant.
fn pipeline_description(channel: &Channel, variant: VideoPipelineVariant) -> String {
    format!(
        "dvbsrc delsys=atsc modulation={modulation} frequency={frequency} pids={video_pid}:{audio_pid} \
         ! tsdemux program-number={program} name=demux \
         demux. ! queue ! decodebin ! {video_encode} \
         ! h264parse config-interval=-1 \
         ! video/x-h264,stream-format=byte-stream,alignment=au \
         ! appsink name=video-sink sync=false max-buffers=8 drop=true \
         demux. ! queue ! decodebin ! audioconvert ! audioresample \
         ! opusenc bitrate=128000 \
         ! appsink name=audio-sink sync=false max-buffers=8 drop=true",
        modulation = channel.modulation.as_dvb_str(),
        frequency = channel.frequency_hz,
        video_pid = channel.video_pid,
        audio_pid = channel.audio_pid,
        program = channel.program_id,
        video_encode = video_encode_fragment(variant),
    )
}

/// Video encode sub-pipeline for a variant. Every variant produces
/// byte-stream H.264 so downstream consumers never care which one ran.
fn video_encode_fragment(variant: VideoPipelineVariant) -> &'static str {
    match variant {
        VideoPipelineVariant::Default => {
            "videoconvert ! x264enc tune=zerolatency speed-preset=veryfast \
             bitrate=8000 key-int-max=60 ! video/x-h264,profile=constrained-baseline"
        }
        VideoPipelineVariant::LowPower => {
            "videoscale ! video/x-raw,width=960,height=540 \
             ! videoconvert ! x264enc tune=zerolatency speed-preset=ultrafast \
             bitrate=4000 key-int-max=60 ! video/x-h264,profile=constrained-baseline"
        }
        VideoPipelineVariant::Vaapi => {
            "vaapipostproc ! vaapih264enc rate-control=cbr bitrate=8000 keyframe-period=60"
        }
    }
}

/// Wire a named appsink to the sample sink.
fn attach_sink(
    pipeline: &gst::Pipeline,
    name: &str,
    kind: MediaKind,
    samples: SampleSink,
    stopped: Arc<AtomicBool>,
) -> Result<(), PipelineError> {
    let appsink = pipeline
        .by_name(name)
        .and_then(|element| element.downcast::<gst_app::AppSink>().ok())
        .ok_or_else(|| PipelineError {
            cause: format!("pipeline is missing appsink {:?}", name),
        })?;

    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |appsink| {
                let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Flushing)?;
                if stopped.load(Ordering::SeqCst) {
                    return Ok(gst::FlowSuccess::Ok);
                }
                if let Some(buffer) = sample.buffer() {
                    if let Ok(map) = buffer.map_readable() {
                        samples(MediaSample {
                            kind,
                            data: Bytes::copy_from_slice(map.as_slice()),
                            duration: buffer
                                .duration()
                                .map(|d| Duration::from_nanos(d.nseconds()))
                                .unwrap_or_default(),
                            keyframe: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
                        });
                    }
                }
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );
    Ok(())
}

/// Watch the pipeline bus until stopped, reporting the first fatal fault.
fn monitor_bus(bus: gst::Bus, errors: ErrorSink, stopped: Arc<AtomicBool>) {
    let poll = gst::ClockTime::from_mseconds(BUS_POLL_INTERVAL_MS);
    while !stopped.load(Ordering::SeqCst) {
        let Some(message) = bus.timed_pop(poll) else {
            continue;
        };
        match message.view() {
            gst::MessageView::Error(err) => {
                if !stopped.load(Ordering::SeqCst) {
                    errors(PipelineError {
                        cause: error_cause(&err),
                    });
                }
                break;
            }
            gst::MessageView::Eos(_) => {
                // A live broadcast never ends; EOS means the source died.
                if !stopped.load(Ordering::SeqCst) {
                    errors(PipelineError {
                        cause: "unexpected end of stream".to_string(),
                    });
                }
                break;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atsc::Modulation;

    fn test_channel() -> Channel {
        Channel {
            name: "ABC".to_string(),
            frequency_hz: 189_028_615,
            modulation: Modulation::Vsb8,
            video_pid: 49,
            audio_pid: 52,
            program_id: 3,
        }
    }

    #[test]
    fn test_description_includes_tuning_parameters() {
        let description = pipeline_description(&test_channel(), VideoPipelineVariant::Default);
        assert!(description.contains("modulation=8vsb"));
        assert!(description.contains("frequency=189028615"));
        assert!(description.contains("pids=49:52"));
        assert!(description.contains("program-number=3"));
        assert!(description.contains("name=video-sink"));
        assert!(description.contains("name=audio-sink"));
    }

    #[test]
    fn test_variants_share_output_framing() {
        for variant in [
            VideoPipelineVariant::Default,
            VideoPipelineVariant::LowPower,
            VideoPipelineVariant::Vaapi,
        ] {
            let description = pipeline_description(&test_channel(), variant);
            assert!(
                description.contains("h264parse"),
                "variant {:?} must produce H.264",
                variant
            );
            assert!(description.contains("opusenc"));
        }
    }

    #[test]
    fn test_variant_encoder_selection() {
        let default = pipeline_description(&test_channel(), VideoPipelineVariant::Default);
        assert!(default.contains("x264enc"));

        let lowpower = pipeline_description(&test_channel(), VideoPipelineVariant::LowPower);
        assert!(lowpower.contains("speed-preset=ultrafast"));
        assert!(lowpower.contains("videoscale"));

        let vaapi = pipeline_description(&test_channel(), VideoPipelineVariant::Vaapi);
        assert!(vaapi.contains("vaapih264enc"));
    }
}
