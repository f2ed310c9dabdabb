//! VP8 encoder pipeline for one Cropper's cropped output (§4.5's chosen
//! codec, see `SPEC_FULL.md`'s `[NEGOTIATE]` section and `DESIGN.md`).
//!
//! Grounded in `beam-agent::encoder::Encoder`: the same
//! appsrc → encoder → appsink shape, trimmed from H.264's NVIDIA/VA-API/
//! software three-way detection down to a single software `vp8enc`
//! pipeline, since there is no per-viewer hardware to match profiles
//! against.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use anyhow::{bail, Context};
use gstreamer::prelude::*;
use gstreamer::{self as gst, ClockTime, ElementFactory, FlowError};
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};

pub struct Vp8Encoder {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    encoded_rx: std::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    _bus_watch: gst::bus::BusWatchGuard,
    pipeline_error: Arc<AtomicBool>,
}

impl Vp8Encoder {
    /// Builds a pipeline sized to one Cropper's cropped output. Dimension
    /// changes require a fresh encoder (and track) rather than reconfiguring
    /// this one in place — see `ViewerSession::apply_region`.
    pub fn new(width: u32, height: u32, frame_rate: u32) -> anyhow::Result<Self> {
        let pipeline = gst::Pipeline::new();

        let appsrc_elem = ElementFactory::make("appsrc")
            .name("src")
            .build()
            .context("Failed to create appsrc")?;

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .field("width", width as i32)
            .field("height", height as i32)
            .field("framerate", gst::Fraction::new(frame_rate as i32, 1))
            .build();

        let appsrc = appsrc_elem
            .dynamic_cast::<AppSrc>()
            .map_err(|_| anyhow::anyhow!("Failed to cast to AppSrc"))?;
        appsrc.set_caps(Some(&caps));
        appsrc.set_is_live(true);
        appsrc.set_format(gst::Format::Time);
        appsrc.set_property("block", false);
        appsrc.set_property("max-bytes", 0u64);

        let encoder = ElementFactory::make("vp8enc")
            .property("deadline", 1i64)
            .property("keyframe-max-dist", 30i32)
            .property("target-bitrate", 2_000_000i32)
            .build()
            .context("Failed to create vp8enc")?;

        let appsink_elem = ElementFactory::make("appsink")
            .name("sink")
            .property("sync", false)
            .property("async", false)
            .property("emit-signals", true)
            .property("max-buffers", 1u32)
            .property("drop", true)
            .build()
            .context("Failed to create appsink")?;

        let appsink = appsink_elem
            .dynamic_cast::<AppSink>()
            .map_err(|_| anyhow::anyhow!("Failed to cast to AppSink"))?;

        let (encoded_tx, encoded_rx) = mpsc::channel::<Vec<u8>>();
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| FlowError::Error)?;
                    let _ = encoded_tx.send(map.to_vec());
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .add_many([appsrc.upcast_ref(), &encoder, appsink.upcast_ref()])
            .context("Failed to add elements to pipeline")?;
        gst::Element::link_many([appsrc.upcast_ref(), &encoder, appsink.upcast_ref()])
            .context("Failed to link pipeline elements")?;

        let pipeline_error = Arc::new(AtomicBool::new(false));
        let pipeline_error_flag = Arc::clone(&pipeline_error);
        let bus = pipeline.bus().context("Failed to get pipeline bus")?;
        let _bus_watch = bus
            .add_watch(move |_, msg| {
                use gst::MessageView;
                if let MessageView::Error(err) = msg.view() {
                    tracing::error!(error = %err.error(), "VP8 encoder pipeline error");
                    pipeline_error_flag.store(true, Ordering::Relaxed);
                }
                gst::glib::ControlFlow::Continue
            })
            .context("Failed to add bus watch")?;

        pipeline
            .set_state(gst::State::Playing)
            .context("Failed to set pipeline to Playing")?;

        Ok(Self {
            pipeline,
            appsrc,
            encoded_rx: std::sync::Mutex::new(encoded_rx),
            _bus_watch,
            pipeline_error,
        })
    }

    pub fn encode_frame(&self, rgb: Vec<u8>, pts: u64) -> anyhow::Result<()> {
        let mut buffer = gst::Buffer::from_slice(rgb);
        {
            let buffer_mut = buffer
                .get_mut()
                .expect("freshly-created GstBuffer should have unique ownership");
            buffer_mut.set_pts(ClockTime::from_nseconds(pts));
        }
        self.appsrc
            .push_buffer(buffer)
            .context("Failed to push buffer to appsrc")?;
        Ok(())
    }

    pub fn pull_encoded(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let rx = self.encoded_rx.lock().unwrap_or_else(|e| e.into_inner());
        match rx.try_recv() {
            Ok(data) => Ok(Some(data)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => bail!("VP8 encoder pipeline disconnected"),
        }
    }

    pub fn has_error(&self) -> bool {
        self.pipeline_error.load(Ordering::Relaxed)
    }
}

impl Drop for Vp8Encoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
