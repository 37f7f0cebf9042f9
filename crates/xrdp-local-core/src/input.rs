//! Input events bound for the protocol module.
//!
//! Window-system events are translated into [`InputEvent`]s on the render
//! thread and queued; the transport worker drains the queue and turns each
//! event into a module message.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use bitflags::bitflags;
use tracing::trace;

/// Message codes understood by the module's event entry point.
pub mod msg {
    pub const WM_KEYDOWN: i32 = 15;
    pub const WM_KEYUP: i32 = 16;
    pub const WM_KEYBRD_SYNC: i32 = 17;
    pub const WM_MOUSEMOVE: i32 = 100;
    pub const WM_LBUTTONUP: i32 = 101;
    pub const WM_LBUTTONDOWN: i32 = 102;
    pub const WM_INVALIDATE: i32 = 200;
}

bitflags! {
    /// Keyboard flags carried next to a scancode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyFlags: u32 {
        /// Extended (E0-prefixed) scancode.
        const EXTENDED = 0x0100;
    }
}

/// Scancode plus flags, ready for a key message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scancode {
    pub code: u32,
    pub flags: KeyFlags,
}

impl Scancode {
    pub const fn new(code: u32, flags: KeyFlags) -> Self {
        Self { code, flags }
    }
}

/// Keys whose evdev keycode does not map onto the scancode by offset.
const EXTENDED_KEYS: &[(u32, Scancode)] = &[
    (104, Scancode::new(28, KeyFlags::EXTENDED)),  // KP Enter
    (105, Scancode::new(29, KeyFlags::EXTENDED)),  // Right Ctrl
    (106, Scancode::new(104, KeyFlags::EXTENDED)), // KP Divide
    (107, Scancode::new(55, KeyFlags::EXTENDED)),  // Print
    (108, Scancode::new(56, KeyFlags::EXTENDED)),  // Right Alt
    (110, Scancode::new(71, KeyFlags::EXTENDED)),  // Home
    (111, Scancode::new(72, KeyFlags::EXTENDED)),  // Up
    (112, Scancode::new(73, KeyFlags::EXTENDED)),  // Page Up
    (113, Scancode::new(75, KeyFlags::EXTENDED)),  // Left
    (114, Scancode::new(77, KeyFlags::EXTENDED)),  // Right
    (115, Scancode::new(79, KeyFlags::EXTENDED)),  // End
    (116, Scancode::new(80, KeyFlags::EXTENDED)),  // Down
    (117, Scancode::new(81, KeyFlags::EXTENDED)),  // Page Down
    (118, Scancode::new(82, KeyFlags::EXTENDED)),  // Insert
    (119, Scancode::new(83, KeyFlags::EXTENDED)),  // Delete
    (127, Scancode::new(102, KeyFlags::empty())),  // Pause
    (135, Scancode::new(93, KeyFlags::empty())),   // Menu
];

/// Map an X (evdev) keycode to the scancode the module expects.
pub fn scancode_for_keycode(keycode: u32) -> Scancode {
    EXTENDED_KEYS
        .iter()
        .find(|(k, _)| *k == keycode)
        .map(|(_, s)| *s)
        .unwrap_or_else(|| Scancode::new(keycode.saturating_sub(8), KeyFlags::empty()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Move,
    /// Protocol button number, starting at 1.
    ButtonDown(u32),
    ButtonUp(u32),
    KeyDown,
    KeyUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: InputKind,
    pub x: i32,
    pub y: i32,
    pub code: u32,
    pub flags: KeyFlags,
}

/// One call into the module's event entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleMessage {
    pub msg: i32,
    pub param1: isize,
    pub param2: isize,
    pub param3: isize,
    pub param4: isize,
}

impl ModuleMessage {
    pub fn new(msg: i32, param1: isize, param2: isize, param3: isize, param4: isize) -> Self {
        Self {
            msg,
            param1,
            param2,
            param3,
            param4,
        }
    }

    /// Asks the module to resynchronize keyboard lock state.
    pub fn keyboard_sync() -> Self {
        Self::new(msg::WM_KEYBRD_SYNC, 0, 0, 0, 0)
    }

    /// Asks the module to redraw `x,y w×h`.
    pub fn invalidate(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self::new(
            msg::WM_INVALIDATE,
            ((x as isize & 0xffff) << 16) | (y as isize & 0xffff),
            ((width as isize & 0xffff) << 16) | (height as isize & 0xffff),
            0,
            0,
        )
    }
}

impl InputEvent {
    pub fn pointer_move(x: i32, y: i32) -> Self {
        Self {
            kind: InputKind::Move,
            x,
            y,
            code: 0,
            flags: KeyFlags::empty(),
        }
    }

    pub fn button_down(x: i32, y: i32, button: u32) -> Self {
        Self {
            kind: InputKind::ButtonDown(button),
            ..Self::pointer_move(x, y)
        }
    }

    pub fn button_up(x: i32, y: i32, button: u32) -> Self {
        Self {
            kind: InputKind::ButtonUp(button),
            ..Self::pointer_move(x, y)
        }
    }

    pub fn key_down(scancode: Scancode) -> Self {
        Self {
            kind: InputKind::KeyDown,
            x: 0,
            y: 0,
            code: scancode.code,
            flags: scancode.flags,
        }
    }

    pub fn key_up(scancode: Scancode) -> Self {
        Self {
            kind: InputKind::KeyUp,
            ..Self::key_down(scancode)
        }
    }

    /// Encode as a module message.
    ///
    /// Buttons use `WM_LBUTTONUP + 2(n-1)` for release and the next code for
    /// press. Keys carry the scancode in param3 and the flags in param4.
    pub fn message(&self) -> ModuleMessage {
        let (x, y) = (self.x as isize, self.y as isize);
        match self.kind {
            InputKind::Move => ModuleMessage::new(msg::WM_MOUSEMOVE, x, y, 0, 0),
            InputKind::ButtonUp(n) => ModuleMessage::new(button_code(n, false), x, y, 0, 0),
            InputKind::ButtonDown(n) => ModuleMessage::new(button_code(n, true), x, y, 0, 0),
            InputKind::KeyDown => ModuleMessage::new(
                msg::WM_KEYDOWN,
                0,
                0,
                self.code as isize,
                self.flags.bits() as isize,
            ),
            InputKind::KeyUp => ModuleMessage::new(
                msg::WM_KEYUP,
                0,
                0,
                self.code as isize,
                self.flags.bits() as isize,
            ),
        }
    }
}

fn button_code(button: u32, down: bool) -> i32 {
    let base = msg::WM_LBUTTONUP + 2 * (button.max(1) as i32 - 1);
    if down { base + 1 } else { base }
}

/// Events for an X button press. Wheel buttons (4-7) produce a complete
/// click; their releases are ignored by [`events_for_button_release`].
pub fn events_for_button_press(x: i32, y: i32, x_button: u8) -> Vec<InputEvent> {
    match x_button {
        4..=7 => {
            let n = x_button as u32;
            vec![InputEvent::button_down(x, y, n), InputEvent::button_up(x, y, n)]
        }
        _ => match protocol_button(x_button) {
            Some(n) => vec![InputEvent::button_down(x, y, n)],
            None => {
                trace!("Ignoring press of button {}", x_button);
                Vec::new()
            }
        },
    }
}

pub fn events_for_button_release(x: i32, y: i32, x_button: u8) -> Vec<InputEvent> {
    match x_button {
        4..=7 => Vec::new(),
        _ => protocol_button(x_button)
            .map(|n| vec![InputEvent::button_up(x, y, n)])
            .unwrap_or_default(),
    }
}

/// X swaps middle and right relative to the protocol numbering.
fn protocol_button(x_button: u8) -> Option<u32> {
    match x_button {
        1 => Some(1),
        2 => Some(3),
        3 => Some(2),
        4..=9 => Some(x_button as u32),
        _ => None,
    }
}

/// FIFO shared by the render thread (producer) and the transport worker.
#[derive(Debug, Default)]
pub struct InputEventQueue {
    events: Mutex<VecDeque<InputEvent>>,
}

impl InputEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: InputEvent) {
        self.lock().push_back(event);
    }

    pub fn extend(&self, events: impl IntoIterator<Item = InputEvent>) {
        self.lock().extend(events);
    }

    /// Take everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<InputEvent> {
        let mut events = self.lock();
        events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<InputEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keycode_mapping() {
        assert_eq!(scancode_for_keycode(38), Scancode::new(30, KeyFlags::empty()));
        assert_eq!(scancode_for_keycode(105), Scancode::new(29, KeyFlags::EXTENDED));
        assert_eq!(scancode_for_keycode(111), Scancode::new(72, KeyFlags::EXTENDED));
        assert_eq!(scancode_for_keycode(127), Scancode::new(102, KeyFlags::empty()));
        assert_eq!(scancode_for_keycode(135), Scancode::new(93, KeyFlags::empty()));
        assert_eq!(scancode_for_keycode(3).code, 0);
    }

    #[test]
    fn test_navigation_and_right_modifier_keys_are_extended() {
        let expected = [
            (104, 28),
            (105, 29),
            (106, 104),
            (107, 55),
            (108, 56),
            (110, 71),
            (111, 72),
            (112, 73),
            (113, 75),
            (114, 77),
            (115, 79),
            (116, 80),
            (117, 81),
            (118, 82),
            (119, 83),
        ];
        for (keycode, code) in expected {
            assert_eq!(
                scancode_for_keycode(keycode),
                Scancode::new(code, KeyFlags::EXTENDED),
                "keycode {}",
                keycode
            );
        }
        // Keys between the table entries keep the plain offset.
        assert_eq!(scancode_for_keycode(109), Scancode::new(101, KeyFlags::empty()));
        assert_eq!(scancode_for_keycode(120), Scancode::new(112, KeyFlags::empty()));
    }

    #[test]
    fn test_button_message_codes() {
        assert_eq!(InputEvent::button_up(0, 0, 1).message().msg, 101);
        assert_eq!(InputEvent::button_down(0, 0, 1).message().msg, 102);
        assert_eq!(InputEvent::button_up(0, 0, 2).message().msg, 103);
        assert_eq!(InputEvent::button_down(0, 0, 3).message().msg, 106);
        assert_eq!(InputEvent::button_down(0, 0, 4).message().msg, 108);
        assert_eq!(InputEvent::button_up(0, 0, 9).message().msg, 117);
    }

    #[test]
    fn test_move_and_key_messages() {
        assert_eq!(
            InputEvent::pointer_move(10, 20).message(),
            ModuleMessage::new(msg::WM_MOUSEMOVE, 10, 20, 0, 0)
        );
        let up = InputEvent::key_up(Scancode::new(28, KeyFlags::EXTENDED)).message();
        assert_eq!(up, ModuleMessage::new(msg::WM_KEYUP, 0, 0, 28, 0x100));
    }

    #[test]
    fn test_x_buttons_map_to_protocol_buttons() {
        let press = |b| events_for_button_press(1, 2, b);
        assert_eq!(press(1), vec![InputEvent::button_down(1, 2, 1)]);
        assert_eq!(press(2), vec![InputEvent::button_down(1, 2, 3)]);
        assert_eq!(press(3), vec![InputEvent::button_down(1, 2, 2)]);
        assert_eq!(press(8), vec![InputEvent::button_down(1, 2, 8)]);
        assert!(press(12).is_empty());
    }

    #[test]
    fn test_wheel_press_is_full_click_and_release_ignored() {
        assert_eq!(
            events_for_button_press(5, 6, 4),
            vec![InputEvent::button_down(5, 6, 4), InputEvent::button_up(5, 6, 4)]
        );
        assert!(events_for_button_release(5, 6, 4).is_empty());
        assert_eq!(
            events_for_button_release(5, 6, 3),
            vec![InputEvent::button_up(5, 6, 2)]
        );
    }

    #[test]
    fn test_invalidate_packs_coordinates() {
        let m = ModuleMessage::invalidate(1, 2, 640, 480);
        assert_eq!(m.msg, msg::WM_INVALIDATE);
        assert_eq!(m.param1, (1 << 16) | 2);
        assert_eq!(m.param2, (640 << 16) | 480);
    }

    #[test]
    fn test_queue_drains_in_order() {
        let queue = InputEventQueue::new();
        let events = [
            InputEvent::pointer_move(1, 1),
            InputEvent::button_down(1, 1, 1),
            InputEvent::button_up(1, 1, 1),
        ];
        queue.extend(events);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain(), events.to_vec());
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }
}
