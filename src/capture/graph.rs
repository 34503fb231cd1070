//! Capture graph: one input stream feeding one video data output.
//!
//! The graph is rebuilt as a single transaction on every start:
//! [`CaptureGraph::begin_configuration`] detaches whatever was attached
//! before, inputs and outputs are added, and
//! [`CaptureGraph::commit_configuration`] closes the bracket. Samples from
//! the input are handed to the output's capture queue, a dedicated thread
//! that processes one sample at a time in arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Sender, TrySendError};
use tracing::{debug, info, trace, warn};

use super::device::{CaptureDevice, DeviceError, DeviceStream, StreamSettings};
use super::frame::{Orientation, PixelFormat, SampleBuffer};

/// Runs on the capture queue for every delivered sample
pub type SampleHandler = Box<dyn FnMut(Option<SampleBuffer>) + Send + 'static>;

/// Result of handing a sample to a [`FrameSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// The capture queue was still busy; the sample was dropped
    Discarded,
    /// The output has been unbound; the producer should stop
    Closed,
}

/// Producer end of a capture queue, handed to device streams
#[derive(Clone)]
pub struct FrameSink {
    tx: Sender<Option<SampleBuffer>>,
    dropped: Arc<AtomicU64>,
}

impl FrameSink {
    /// Hand `sample` to the capture queue. A sample arriving while another
    /// one is still pending is late and gets dropped.
    pub fn deliver(&self, sample: Option<SampleBuffer>) -> Delivery {
        match self.tx.try_send(sample) {
            Ok(()) => Delivery::Accepted,
            Err(TrySendError::Full(late)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("camtex_frames_dropped_total").increment(1);
                trace!(sequence = late.map(|s| s.sequence), "late frame discarded");
                Delivery::Discarded
            }
            Err(TrySendError::Disconnected(_)) => Delivery::Closed,
        }
    }

    /// Samples discarded because the capture queue was busy
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct CaptureQueue {
    // Exits after draining once every sink is gone.
    worker: JoinHandle<()>,
}

/// Output that hands samples of one pixel format to a capture queue
pub struct VideoDataOutput {
    format: PixelFormat,
    queue: Option<CaptureQueue>,
    dropped: Arc<AtomicU64>,
}

impl VideoDataOutput {
    pub fn new(format: PixelFormat) -> Self {
        Self {
            format,
            queue: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn bind(&mut self, mut handler: SampleHandler) -> std::io::Result<FrameSink> {
        let (tx, rx) = flume::bounded(1);

        let worker = thread::Builder::new()
            .name("camtex-capture".into())
            .spawn(move || {
                debug!("capture queue started");
                for sample in rx.iter() {
                    handler(sample);
                }
                debug!("capture queue drained");
            })?;

        self.queue = Some(CaptureQueue { worker });
        Ok(FrameSink {
            tx,
            dropped: self.dropped.clone(),
        })
    }

    /// Wait for the capture queue to finish its pending sample. The input
    /// must already be stopped so that no sink is left.
    fn unbind(&mut self) {
        if let Some(queue) = self.queue.take() {
            if queue.worker.join().is_err() {
                warn!("capture queue panicked");
            }
        }
    }
}

/// An opened device attached to the graph
pub struct CaptureInput {
    device: Arc<dyn CaptureDevice>,
    stream: Box<dyn DeviceStream>,
}

impl CaptureInput {
    pub fn new(device: Arc<dyn CaptureDevice>, stream: Box<dyn DeviceStream>) -> Self {
        Self { device, stream }
    }
}

#[derive(Default)]
pub struct CaptureGraph {
    input: Option<CaptureInput>,
    output: Option<VideoDataOutput>,
    configuring: bool,
    running: bool,
}

impl CaptureGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_configuration(&mut self) {
        self.stop_running();
        self.input = None;
        self.output = None;
        self.configuring = true;
    }

    pub fn commit_configuration(&mut self) {
        self.configuring = false;
        debug!(
            input = self.input.as_ref().map(|i| i.device.name()),
            output = ?self.output.as_ref().map(|o| o.format),
            "capture graph committed"
        );
    }

    /// An input is accepted when the slot is free and the device exposes
    /// at least one usable video format.
    pub fn can_add_input(&self, input: &CaptureInput) -> bool {
        self.input.is_none() && !input.stream.formats().is_empty()
    }

    /// Attach `input`; a rejected input is handed back.
    pub fn add_input(&mut self, input: CaptureInput) -> Result<(), CaptureInput> {
        if !self.can_add_input(&input) {
            return Err(input);
        }
        self.input = Some(input);
        Ok(())
    }

    /// An output is accepted when the attached input can deliver its format.
    pub fn can_add_output(&self, output: &VideoDataOutput) -> bool {
        self.output.is_none()
            && self
                .input
                .as_ref()
                .is_some_and(|input| input.stream.formats().contains(&output.format))
    }

    pub fn add_output(&mut self, output: VideoDataOutput) -> Result<(), VideoDataOutput> {
        if !self.can_add_output(&output) {
            return Err(output);
        }
        self.output = Some(output);
        Ok(())
    }

    pub fn device_id(&self) -> Option<&str> {
        self.input.as_ref().map(|i| i.device.unique_id())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Bind `handler` to the output's capture queue and start the input.
    pub fn start_running(&mut self, settings: &StreamSettings, handler: SampleHandler) -> Result<(), DeviceError> {
        if self.configuring {
            warn!("starting a capture graph inside an open configuration bracket");
        }
        let (Some(input), Some(output)) = (self.input.as_mut(), self.output.as_mut()) else {
            return Err(DeviceError::Stream(std::io::Error::other(
                "capture graph has no input or output attached",
            )));
        };

        let sink = output.bind(handler)?;
        if let Err(e) = input.stream.start(settings, sink) {
            output.unbind();
            return Err(e);
        }

        self.running = true;
        info!(device = input.device.name(), ?settings, "capture graph running");
        Ok(())
    }

    pub fn stop_running(&mut self) {
        if !self.running {
            return;
        }
        if let Some(input) = self.input.as_mut() {
            input.stream.stop();
        }
        if let Some(output) = self.output.as_mut() {
            output.unbind();
        }
        self.running = false;
        info!("capture graph stopped");
    }

    pub fn set_orientation(&mut self, orientation: Option<Orientation>) {
        if let Some(input) = self.input.as_mut() {
            input.stream.set_orientation(orientation);
        }
    }
}

impl Drop for CaptureGraph {
    fn drop(&mut self) {
        self.stop_running();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{DevicePosition, MediaTime};
    use std::time::Duration;

    #[derive(Debug)]
    struct FixedDevice;

    impl CaptureDevice for FixedDevice {
        fn unique_id(&self) -> &str {
            "fixed"
        }
        fn name(&self) -> &str {
            "Fixed"
        }
        fn position(&self) -> DevicePosition {
            DevicePosition::Front
        }
        fn open(&self) -> Result<Box<dyn DeviceStream>, DeviceError> {
            Ok(Box::new(FixedStream(vec![PixelFormat::Nv12])))
        }
    }

    struct FixedStream(Vec<PixelFormat>);

    impl DeviceStream for FixedStream {
        fn formats(&self) -> Vec<PixelFormat> {
            self.0.clone()
        }
        fn start(&mut self, _: &StreamSettings, _: FrameSink) -> Result<(), DeviceError> {
            Ok(())
        }
        fn stop(&mut self) {}
    }

    fn input(formats: Vec<PixelFormat>) -> CaptureInput {
        CaptureInput::new(Arc::new(FixedDevice), Box::new(FixedStream(formats)))
    }

    fn sample(sequence: u64) -> Option<SampleBuffer> {
        Some(SampleBuffer::new(None, MediaTime::new(sequence as i64, 30), sequence))
    }

    #[test]
    fn rejects_input_without_formats() {
        let mut graph = CaptureGraph::new();
        graph.begin_configuration();
        assert!(graph.add_input(input(vec![])).is_err());
        assert!(graph.add_input(input(vec![PixelFormat::Nv12])).is_ok());
        assert!(graph.add_input(input(vec![PixelFormat::Nv12])).is_err());
        graph.commit_configuration();
    }

    #[test]
    fn rejects_output_in_unsupported_format() {
        let mut graph = CaptureGraph::new();
        graph.begin_configuration();
        assert!(graph.add_output(VideoDataOutput::new(PixelFormat::Nv12)).is_err());

        graph.add_input(input(vec![PixelFormat::Nv12])).ok();
        assert!(graph.add_output(VideoDataOutput::new(PixelFormat::Bgra32)).is_err());
        assert!(graph.add_output(VideoDataOutput::new(PixelFormat::Nv12)).is_ok());
        graph.commit_configuration();
    }

    #[test]
    fn begin_configuration_detaches_previous_graph() {
        let mut graph = CaptureGraph::new();
        graph.begin_configuration();
        graph.add_input(input(vec![PixelFormat::Nv12])).ok();
        graph.commit_configuration();
        assert_eq!(graph.device_id(), Some("fixed"));

        graph.begin_configuration();
        assert!(graph.device_id().is_none());
        assert!(graph.configuring);
    }

    /// Delivers one sample from `start` and lets go of the sink
    struct OneShotStream;

    impl DeviceStream for OneShotStream {
        fn formats(&self) -> Vec<PixelFormat> {
            vec![PixelFormat::Nv12]
        }
        fn start(&mut self, _: &StreamSettings, sink: FrameSink) -> Result<(), DeviceError> {
            sink.deliver(sample(1));
            Ok(())
        }
        fn stop(&mut self) {}
    }

    #[test]
    fn stopping_waits_for_the_pending_sample() {
        let mut graph = CaptureGraph::new();
        graph.begin_configuration();
        graph
            .add_input(CaptureInput::new(Arc::new(FixedDevice), Box::new(OneShotStream)))
            .ok();
        graph.add_output(VideoDataOutput::new(PixelFormat::Nv12)).ok();
        graph.commit_configuration();

        let handled = Arc::new(AtomicU64::new(0));
        let counter = handled.clone();
        let settings = StreamSettings {
            format: PixelFormat::Nv12,
            width: 64,
            height: 48,
            fps: 30,
            buffer_count: 2,
            orientation: None,
        };
        graph
            .start_running(
                &settings,
                Box::new(move |_| {
                    std::thread::sleep(Duration::from_millis(50));
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        graph.stop_running();
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert!(!graph.is_running());
    }

    #[test]
    fn busy_capture_queue_discards_late_frames() {
        let (entered_tx, entered_rx) = flume::unbounded();
        let (release_tx, release_rx) = flume::unbounded::<()>();
        let (seen_tx, seen_rx) = flume::unbounded();

        let mut output = VideoDataOutput::new(PixelFormat::Nv12);
        let sink = output
            .bind(Box::new(move |sample| {
                let sequence = sample.map(|s| s.sequence);
                entered_tx.send(sequence).ok();
                release_rx.recv().ok();
                seen_tx.send(sequence).ok();
            }))
            .expect("spawn capture queue");

        assert_eq!(sink.deliver(sample(1)), Delivery::Accepted);
        assert_eq!(entered_rx.recv_timeout(Duration::from_secs(2)).ok(), Some(Some(1)));

        // Queue is busy with #1: #2 waits in the single slot, #3 is late.
        assert_eq!(sink.deliver(sample(2)), Delivery::Accepted);
        assert_eq!(sink.deliver(sample(3)), Delivery::Discarded);
        assert_eq!(sink.dropped(), 1);
        assert_eq!(output.dropped_frames(), 1);

        release_tx.send(()).ok();
        release_tx.send(()).ok();
        let seen: Vec<_> = (0..2)
            .filter_map(|_| seen_rx.recv_timeout(Duration::from_secs(2)).ok())
            .collect();
        assert_eq!(seen, vec![Some(1), Some(2)]);
    }
}
