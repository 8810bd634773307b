/**
 * ============================================================================
 * INPUT RECORDER MODULE
 * ============================================================================
 *
 * PURPOSE: Timestamped capture of keyboard, pointer, and gamepad events
 *
 * DESIGN:
 * - OS hooks never touch the event buffer directly: the hook callback and
 *   the gamepad poll loop push through an EventTap into a bounded channel,
 *   and one consumer thread drains that channel into the ring buffer. This
 *   keeps OS callback latency decoupled from downstream cost.
 * - Global hooks are process-wide, so one hook thread is installed lazily
 *   and routed to whichever recorder is currently armed.
 * - Pointer move events are decimated by a fixed per-stream counter (1 in
 *   N); clicks, scrolls, and keys are never decimated.
 * - Every timestamp is (now - session_start) + latency_offset, never
 *   wall-clock.
 *
 * ============================================================================
 */

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::capture::{elapsed_ms, join_timeout};
use crate::error::{Error, Result};
use crate::types::{ActionKind, DeviceClass, RawInputEvent};

// Ring buffer capacity; generous for human/device event rates
const BUFFER_CAPACITY: usize = 10_000;

// Hook-to-consumer channel capacity
const CHANNEL_CAPACITY: usize = 8_192;

// Keep 1 in N pointer move events
const MOVE_DECIMATION: u64 = 10;

const CONSUMER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const GAMEPAD_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const GAMEPAD_INIT_TIMEOUT: Duration = Duration::from_secs(3);

// Back-off after a gamepad read failure or disconnect
const GAMEPAD_BACKOFF: Duration = Duration::from_millis(500);

// =============================================================================
// Event tap
// =============================================================================

// Handle for pushing events into a recorder's channel. Hooks, the gamepad
// poll loop, and synthetic producers (tests, calibration tools) all go
// through the same tap so every event is stamped identically.
#[derive(Clone)]
pub struct EventTap {
    tx: Sender<RawInputEvent>,
    origin: Instant,
    latency_offset_ms: i64,
    last_pointer: Arc<Mutex<(f64, f64)>>,
}

impl EventTap {
    fn stamp(&self) -> i64 {
        elapsed_ms(self.origin) + self.latency_offset_ms
    }

    fn push(&self, event: RawInputEvent) {
        // Hooks must never block; an overflowing channel sheds the event
        if self.tx.try_send(event).is_err() {
            log::debug!("Input channel full, shedding event");
        }
    }

    pub fn key_press(&self, key: &str) {
        self.push(RawInputEvent {
            timestamp_ms: self.stamp(),
            device: DeviceClass::Keyboard,
            control: key.to_string(),
            action: ActionKind::Press,
            value: Some(1.0),
            x_position: None,
            y_position: None,
        });
    }

    pub fn key_release(&self, key: &str) {
        self.push(RawInputEvent {
            timestamp_ms: self.stamp(),
            device: DeviceClass::Keyboard,
            control: key.to_string(),
            action: ActionKind::Release,
            value: Some(0.0),
            x_position: None,
            y_position: None,
        });
    }

    pub fn pointer_button(&self, button: &str, pressed: bool) {
        let (x, y) = *self.last_pointer.lock();
        self.push(RawInputEvent {
            timestamp_ms: self.stamp(),
            device: DeviceClass::Mouse,
            control: button.to_string(),
            action: if pressed {
                ActionKind::Press
            } else {
                ActionKind::Release
            },
            value: Some(if pressed { 1.0 } else { 0.0 }),
            x_position: Some(x),
            y_position: Some(y),
        });
    }

    pub fn pointer_move(&self, x: f64, y: f64) {
        *self.last_pointer.lock() = (x, y);
        self.push(RawInputEvent {
            timestamp_ms: self.stamp(),
            device: DeviceClass::Mouse,
            control: "move".to_string(),
            action: ActionKind::Move,
            value: None,
            x_position: Some(x),
            y_position: Some(y),
        });
    }

    pub fn pointer_scroll(&self, delta_y: f64) {
        let (x, y) = *self.last_pointer.lock();
        self.push(RawInputEvent {
            timestamp_ms: self.stamp(),
            device: DeviceClass::Mouse,
            control: "scroll".to_string(),
            action: ActionKind::Scroll,
            value: Some(delta_y),
            x_position: Some(x),
            y_position: Some(y),
        });
    }

    pub fn gamepad(&self, device: DeviceClass, control: &str, action: ActionKind, value: f64) {
        self.push(RawInputEvent {
            timestamp_ms: self.stamp(),
            device,
            control: control.to_string(),
            action,
            value: Some(value),
            x_position: None,
            y_position: None,
        });
    }

    // Track pointer position for coordinate-less button events without
    // recording a move
    fn note_pointer(&self, x: f64, y: f64) {
        *self.last_pointer.lock() = (x, y);
    }
}

// =============================================================================
// Global hook routing
// =============================================================================

struct HookRoute {
    tap: EventTap,
    capture_pointer: bool,
}

// Whichever recorder is currently armed receives hook events. OS-level
// hooks are inherently process-global; this is the single routing point.
static HOOK_ROUTE: Lazy<Mutex<Option<HookRoute>>> = Lazy::new(|| Mutex::new(None));

static HOOK_THREAD: Once = Once::new();
static HOOK_FAILED: AtomicBool = AtomicBool::new(false);

fn ensure_hook_thread() {
    HOOK_THREAD.call_once(|| {
        let spawned = std::thread::Builder::new()
            .name("input-hooks".to_string())
            .spawn(|| {
                // listen() blocks for the process lifetime; the route decides
                // whether events go anywhere
                if let Err(e) = rdev::listen(route_hook_event) {
                    HOOK_FAILED.store(true, Ordering::SeqCst);
                    log::error!("Failed to install global input hooks: {:?}", e);
                }
            });
        if spawned.is_err() {
            HOOK_FAILED.store(true, Ordering::SeqCst);
        }
    });
}

fn route_hook_event(event: rdev::Event) {
    let guard = HOOK_ROUTE.lock();
    let Some(route) = guard.as_ref() else {
        return;
    };

    match event.event_type {
        rdev::EventType::KeyPress(key) => route.tap.key_press(&format!("{:?}", key)),
        rdev::EventType::KeyRelease(key) => route.tap.key_release(&format!("{:?}", key)),
        rdev::EventType::ButtonPress(button) => {
            if route.capture_pointer {
                route.tap.pointer_button(&format!("{:?}", button), true);
            }
        }
        rdev::EventType::ButtonRelease(button) => {
            if route.capture_pointer {
                route.tap.pointer_button(&format!("{:?}", button), false);
            }
        }
        rdev::EventType::MouseMove { x, y } => {
            if route.capture_pointer {
                route.tap.pointer_move(x, y);
            } else {
                route.tap.note_pointer(x, y);
            }
        }
        rdev::EventType::Wheel { delta_y, .. } => {
            if route.capture_pointer {
                route.tap.pointer_scroll(delta_y as f64);
            }
        }
    }
}

// =============================================================================
// Input recorder
// =============================================================================

pub struct InputRecorder {
    device: DeviceClass,
    capture_pointer: bool,
    latency_offset_ms: i64,
    buffer: Arc<Mutex<VecDeque<RawInputEvent>>>,
    armed: Arc<AtomicBool>,
    tap: Option<EventTap>,
    consumer: Option<JoinHandle<()>>,
    gamepad: Option<JoinHandle<()>>,
}

impl InputRecorder {
    pub fn new(device: DeviceClass, capture_pointer: bool, latency_offset_ms: i64) -> Self {
        InputRecorder {
            device,
            // Pointer capture only applies to the keyboard device class
            capture_pointer: capture_pointer && device == DeviceClass::Keyboard,
            latency_offset_ms,
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(1024))),
            armed: Arc::new(AtomicBool::new(false)),
            tap: None,
            consumer: None,
            gamepad: None,
        }
    }

    // Begin recording, attaching OS hooks or the gamepad poll loop.
    pub fn start(&mut self, session_start: Instant) -> Result<()> {
        self.arm(session_start, true)
    }

    // Tap for synthetic event injection (calibration, tests). Live while
    // recording.
    pub fn tap(&self) -> Option<EventTap> {
        self.tap.clone()
    }

    pub(crate) fn arm(&mut self, session_start: Instant, attach_os_sources: bool) -> Result<()> {
        if self.tap.is_some() {
            return Err(Error::InputCapture(
                "input recorder already started".to_string(),
            ));
        }

        let (tx, rx) = bounded::<RawInputEvent>(CHANNEL_CAPACITY);
        let tap = EventTap {
            tx,
            origin: session_start,
            latency_offset_ms: self.latency_offset_ms,
            last_pointer: Arc::new(Mutex::new((0.0, 0.0))),
        };

        self.armed.store(true, Ordering::SeqCst);
        self.buffer.lock().clear();

        let consumer = {
            let buffer = self.buffer.clone();
            std::thread::Builder::new()
                .name("input-consumer".to_string())
                .spawn(move || consume_loop(rx, buffer))?
        };
        self.consumer = Some(consumer);

        if attach_os_sources {
            if self.device.is_gamepad() {
                match spawn_gamepad_loop(self.device, tap.clone(), self.armed.clone()) {
                    Ok(handle) => self.gamepad = Some(handle),
                    Err(e) => {
                        // Release the last sender so the consumer can exit
                        drop(tap);
                        self.disarm_consumer();
                        return Err(e);
                    }
                }
            } else {
                if HOOK_FAILED.load(Ordering::SeqCst) {
                    drop(tap);
                    self.disarm_consumer();
                    return Err(Error::InputCapture(
                        "global input hooks unavailable".to_string(),
                    ));
                }
                ensure_hook_thread();
                *HOOK_ROUTE.lock() = Some(HookRoute {
                    tap: tap.clone(),
                    capture_pointer: self.capture_pointer,
                });
                log::info!(
                    "Keyboard capture started (pointer capture: {})",
                    self.capture_pointer
                );
            }
        }

        self.tap = Some(tap);
        Ok(())
    }

    fn disarm_consumer(&mut self) {
        self.armed.store(false, Ordering::SeqCst);
        self.tap = None;
        if let Some(handle) = self.consumer.take() {
            join_timeout(handle, CONSUMER_JOIN_TIMEOUT, "input-consumer");
        }
    }

    // Stop recording and return the ordered event snapshot.
    pub fn stop(&mut self) -> Vec<RawInputEvent> {
        self.armed.store(false, Ordering::SeqCst);

        // Detach the hook route first so no new events flow in
        {
            let mut route = HOOK_ROUTE.lock();
            *route = None;
        }

        if let Some(handle) = self.gamepad.take() {
            join_timeout(handle, GAMEPAD_JOIN_TIMEOUT, "gamepad-poll");
        }

        // Dropping the last tap disconnects the channel; the consumer drains
        // what is already queued and exits
        self.tap = None;
        if let Some(handle) = self.consumer.take() {
            join_timeout(handle, CONSUMER_JOIN_TIMEOUT, "input-consumer");
        }

        let events: Vec<RawInputEvent> = self.buffer.lock().drain(..).collect();
        log::info!("Input capture stopped, {} events buffered", events.len());
        events
    }
}

// Single consumer draining hook/gamepad channels into the ring buffer
fn consume_loop(rx: Receiver<RawInputEvent>, buffer: Arc<Mutex<VecDeque<RawInputEvent>>>) {
    let mut move_count: u64 = 0;

    loop {
        let event = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        // Fixed-counter decimation of pointer moves; everything else is kept
        if event.device == DeviceClass::Mouse && event.action == ActionKind::Move {
            move_count += 1;
            if (move_count - 1) % MOVE_DECIMATION != 0 {
                continue;
            }
        }

        let mut buffer = buffer.lock();
        if buffer.len() >= BUFFER_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }
}

// Dedicated polling task for gamepad devices. Read failures and
// disconnects log, back off briefly, and retry; they never end the session.
fn spawn_gamepad_loop(
    device: DeviceClass,
    tap: EventTap,
    armed: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let (init_tx, init_rx) = bounded::<std::result::Result<(), String>>(1);

    let handle = std::thread::Builder::new()
        .name("gamepad-poll".to_string())
        .spawn(move || {
            let mut gilrs = match gilrs::Gilrs::new() {
                Ok(gilrs) => {
                    let _ = init_tx.send(Ok(()));
                    gilrs
                }
                Err(e) => {
                    let _ = init_tx.send(Err(format!("{}", e)));
                    return;
                }
            };

            log::info!("Gamepad capture started ({})", device);

            while armed.load(Ordering::SeqCst) {
                while let Some(event) = gilrs.next_event() {
                    match event.event {
                        gilrs::EventType::ButtonPressed(button, _) => {
                            tap.gamepad(device, &format!("{:?}", button), ActionKind::Press, 1.0);
                        }
                        gilrs::EventType::ButtonReleased(button, _) => {
                            tap.gamepad(device, &format!("{:?}", button), ActionKind::Release, 0.0);
                        }
                        gilrs::EventType::ButtonChanged(button, value, _) => {
                            tap.gamepad(
                                device,
                                &format!("{:?}", button),
                                ActionKind::Move,
                                f64::from(value),
                            );
                        }
                        gilrs::EventType::AxisChanged(axis, value, _) => {
                            tap.gamepad(
                                device,
                                &format!("{:?}", axis),
                                ActionKind::Move,
                                f64::from(value),
                            );
                        }
                        gilrs::EventType::Connected => {
                            log::info!("Gamepad connected");
                        }
                        gilrs::EventType::Disconnected => {
                            log::warn!("Gamepad disconnected, waiting for reconnect");
                            std::thread::sleep(GAMEPAD_BACKOFF);
                        }
                        _ => {}
                    }
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        })?;

    match init_rx.recv_timeout(GAMEPAD_INIT_TIMEOUT) {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => Err(Error::InputCapture(format!(
            "gamepad subsystem failed to initialize: {}",
            e
        ))),
        Err(_) => Err(Error::InputCapture(
            "gamepad subsystem did not initialize in time".to_string(),
        )),
    }
}
