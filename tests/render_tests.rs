use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use camtex::capture::frame::BufferId;
use camtex::error::RenderError;
use camtex::gpu::{HostPlane, Texture, TextureFormat, TextureKey};
use camtex::render::{
    Completion, QuadDraw, RenderBackend, RenderHooks, RenderSlot, Renderer, TickOutcome, Topology,
};
use flume::Sender;

fn texture(buffer: u64) -> Texture {
    Texture::new(
        TextureKey {
            buffer: BufferId(buffer),
            plane: 0,
        },
        4,
        4,
        TextureFormat::Bgra8Unorm,
        Arc::new(HostPlane::new(Bytes::from(vec![0u8; 64]), 16)),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Handles {
    submission: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Submit(BufferId),
    DidRender(BufferId),
}

type Job = (Completion<Handles>, usize);

/// Completes submissions on its own "GPU" thread after `latency`
struct RecordingBackend {
    pipeline_ready: bool,
    fail_submissions: bool,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    draws: Arc<Mutex<Vec<(BufferId, u32, QuadDraw)>>>,
    log: Arc<Mutex<Vec<Step>>>,
    gpu: Sender<Job>,
}

impl RecordingBackend {
    fn new(latency: Duration, log: Arc<Mutex<Vec<Step>>>) -> Self {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let (gpu, jobs) = flume::unbounded::<Job>();
        {
            let in_flight = in_flight.clone();
            thread::spawn(move || {
                for (on_complete, submission) in jobs.iter() {
                    thread::sleep(latency);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    on_complete(Handles { submission });
                }
            });
        }

        Self {
            pipeline_ready: true,
            fail_submissions: false,
            in_flight,
            peak: Arc::new(AtomicUsize::new(0)),
            draws: Arc::default(),
            log,
            gpu,
        }
    }

    fn drawn(&self) -> Vec<BufferId> {
        self.draws.lock().unwrap().iter().map(|(id, _, _)| *id).collect()
    }
}

impl RenderBackend for RecordingBackend {
    type Target = u32;
    type Handles = Handles;

    fn pipeline_ready(&self) -> bool {
        self.pipeline_ready
    }

    fn submit(
        &mut self,
        target: u32,
        texture: &Texture,
        draw: QuadDraw,
        on_complete: Completion<Handles>,
    ) -> Result<(), RenderError> {
        if self.fail_submissions {
            return Err(RenderError::TargetLost("simulated".into()));
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let mut draws = self.draws.lock().unwrap();
        draws.push((texture.key().buffer, target, draw));
        self.log.lock().unwrap().push(Step::Submit(texture.key().buffer));
        let submission = draws.len();
        drop(draws);

        self.gpu
            .send((on_complete, submission))
            .map_err(|_| RenderError::TargetLost("gpu thread gone".into()))
    }
}

struct LoggingHooks {
    log: Arc<Mutex<Vec<Step>>>,
    substitute: Option<Arc<Texture>>,
    handles: Mutex<Vec<Handles>>,
}

impl RenderHooks<Handles> for LoggingHooks {
    fn will_render(&self, texture: Arc<Texture>) -> Arc<Texture> {
        self.substitute.clone().unwrap_or(texture)
    }

    fn did_render(&self, texture: &Texture, handles: &Handles) {
        self.log.lock().unwrap().push(Step::DidRender(texture.key().buffer));
        self.handles.lock().unwrap().push(*handles);
    }
}

fn renderer(latency: Duration) -> Renderer<RecordingBackend> {
    Renderer::new(
        Arc::new(RenderSlot::new()),
        RecordingBackend::new(latency, Arc::default()),
    )
}

#[test]
fn empty_slot_tick_draws_nothing_and_releases_the_gate() {
    let mut renderer = renderer(Duration::ZERO);
    let asked_for_target = AtomicBool::new(false);

    let outcome = renderer.draw(|| {
        asked_for_target.store(true, Ordering::SeqCst);
        Some(0)
    });

    assert_eq!(outcome, TickOutcome::NoTexture);
    assert!(!asked_for_target.load(Ordering::SeqCst));
    assert!(renderer.backend().drawn().is_empty());
    assert!(renderer.is_idle());
    assert_eq!(renderer.stats().skipped, 1);
}

#[test]
fn each_tick_draws_one_full_screen_strip_quad() {
    let mut renderer = renderer(Duration::ZERO);
    renderer.slot().set(texture(1));

    assert_eq!(renderer.draw(|| Some(7)), TickOutcome::Submitted);

    let draws = renderer.backend().draws.lock().unwrap().clone();
    assert_eq!(draws.len(), 1);
    let (buffer, target, draw) = draws[0];
    assert_eq!((buffer, target), (BufferId(1), 7));
    assert_eq!(draw.topology, Topology::TriangleStrip);
    assert_eq!((draw.vertex_count, draw.instance_count), (4, 1));
}

#[test]
fn tick_renders_only_the_latest_of_many_sets() {
    let mut renderer = renderer(Duration::ZERO);

    for round in 0..3u64 {
        for n in 0..5 {
            renderer.slot().set(texture(round * 10 + n));
        }
        assert_eq!(renderer.draw(|| Some(0)), TickOutcome::Submitted);
    }

    assert_eq!(
        renderer.backend().drawn(),
        vec![BufferId(4), BufferId(14), BufferId(24)]
    );
}

#[test]
fn concurrent_capture_and_render_keep_one_submission_in_flight() {
    let mut renderer = renderer(Duration::from_millis(2));
    let slot = renderer.slot().clone();
    let done = Arc::new(AtomicBool::new(false));

    let capture = {
        let done = done.clone();
        thread::spawn(move || {
            let mut id = 0;
            while !done.load(Ordering::SeqCst) {
                slot.set(texture(id));
                id += 1;
                thread::sleep(Duration::from_micros(200));
            }
        })
    };

    // Let the first texture land before rendering
    while renderer.slot().is_empty() {
        thread::yield_now();
    }
    for _ in 0..60 {
        renderer.draw(|| Some(0));
    }
    done.store(true, Ordering::SeqCst);
    capture.join().unwrap();

    let backend = renderer.backend();
    assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
    assert_eq!(renderer.stats().submitted, 60);

    // Nothing is ever drawn twice out of order: ids only move forward
    let drawn = backend.drawn();
    assert!(drawn.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn unavailable_target_or_pipeline_skips_and_releases() {
    let mut renderer = renderer(Duration::ZERO);
    renderer.slot().set(texture(1));

    assert_eq!(renderer.draw(|| None), TickOutcome::TargetUnavailable);
    assert!(renderer.is_idle());

    renderer.backend_mut().pipeline_ready = false;
    assert_eq!(renderer.draw(|| Some(0)), TickOutcome::PipelineUnavailable);
    assert!(renderer.is_idle());

    renderer.backend_mut().pipeline_ready = true;
    assert_eq!(renderer.draw(|| Some(0)), TickOutcome::Submitted);
    assert_eq!(renderer.backend().drawn(), vec![BufferId(1)]);
    assert_eq!(renderer.stats().skipped, 2);
}

#[test]
fn failed_submission_releases_the_gate_without_post_render_hook() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let hooks = Arc::new(LoggingHooks {
        log: log.clone(),
        substitute: None,
        handles: Mutex::default(),
    });
    let mut backend = RecordingBackend::new(Duration::ZERO, log.clone());
    backend.fail_submissions = true;
    let mut renderer = Renderer::with_hooks(Arc::new(RenderSlot::new()), backend, hooks.clone());
    renderer.slot().set(texture(1));

    assert_eq!(renderer.draw(|| Some(0)), TickOutcome::Failed);
    assert!(renderer.is_idle());
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn hooks_can_swap_the_texture_and_run_before_the_next_submission() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let hooks = Arc::new(LoggingHooks {
        log: log.clone(),
        substitute: Some(Arc::new(texture(99))),
        handles: Mutex::default(),
    });
    let backend = RecordingBackend::new(Duration::from_millis(5), log.clone());
    let mut renderer = Renderer::with_hooks(Arc::new(RenderSlot::new()), backend, hooks.clone());
    renderer.slot().set(texture(1));

    for _ in 0..3 {
        assert_eq!(renderer.draw(|| Some(0)), TickOutcome::Submitted);
    }
    // Wait for the last completion
    let _ = renderer.draw(|| None);

    let steps = log.lock().unwrap().clone();
    assert_eq!(
        steps,
        vec![
            Step::Submit(BufferId(99)),
            Step::DidRender(BufferId(99)),
            Step::Submit(BufferId(99)),
            Step::DidRender(BufferId(99)),
            Step::Submit(BufferId(99)),
            Step::DidRender(BufferId(99)),
        ]
    );
    let handles = hooks.handles.lock().unwrap().clone();
    assert_eq!(
        handles,
        vec![
            Handles { submission: 1 },
            Handles { submission: 2 },
            Handles { submission: 3 }
        ]
    );
    assert_eq!(renderer.stats().completed, 3);
}
