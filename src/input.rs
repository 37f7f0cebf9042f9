//! Translation of X11 window events.

use x11rb::protocol::Event;
use xrdp_local_core::input::{
    InputEvent, events_for_button_press, events_for_button_release, scancode_for_keycode,
};
use xrdp_local_core::sink::Region;

use crate::window::WindowAtoms;

#[derive(Debug, PartialEq)]
pub enum WindowEvent {
    Input(Vec<InputEvent>),
    Expose(Region),
    Close,
    Ignore,
}

pub fn translate(event: &Event, atoms: &WindowAtoms) -> WindowEvent {
    match event {
        Event::MotionNotify(e) => {
            WindowEvent::Input(vec![InputEvent::pointer_move(e.event_x as i32, e.event_y as i32)])
        }
        Event::ButtonPress(e) => {
            WindowEvent::Input(events_for_button_press(e.event_x as i32, e.event_y as i32, e.detail))
        }
        Event::ButtonRelease(e) => {
            WindowEvent::Input(events_for_button_release(e.event_x as i32, e.event_y as i32, e.detail))
        }
        Event::KeyPress(e) => {
            WindowEvent::Input(vec![InputEvent::key_down(scancode_for_keycode(e.detail as u32))])
        }
        Event::KeyRelease(e) => {
            WindowEvent::Input(vec![InputEvent::key_up(scancode_for_keycode(e.detail as u32))])
        }
        Event::Expose(e) => WindowEvent::Expose(Region::new(
            e.x as i32,
            e.y as i32,
            e.width as u32,
            e.height as u32,
        )),
        Event::ClientMessage(e)
            if e.type_ == atoms.wm_protocols
                && e.format == 32
                && e.data.as_data32()[0] == atoms.wm_delete_window =>
        {
            WindowEvent::Close
        }
        Event::DestroyNotify(_) => WindowEvent::Close,
        _ => WindowEvent::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x11rb::protocol::xproto::{
        ButtonPressEvent, ClientMessageData, ClientMessageEvent, KeyButMask, KeyPressEvent,
        MotionNotifyEvent,
    };
    use xrdp_local_core::input::{InputKind, KeyFlags};

    fn atoms() -> WindowAtoms {
        WindowAtoms {
            wm_protocols: 100,
            wm_delete_window: 101,
            motif_wm_hints: 102,
            net_wm_name: 103,
            utf8_string: 104,
        }
    }

    fn button(detail: u8) -> ButtonPressEvent {
        ButtonPressEvent {
            response_type: 4,
            detail,
            sequence: 0,
            time: 0,
            root: 1,
            event: 2,
            child: 0,
            root_x: 0,
            root_y: 0,
            event_x: 30,
            event_y: 40,
            state: KeyButMask::from(0u16),
            same_screen: true,
        }
    }

    #[test]
    fn test_right_button_becomes_protocol_button_two() {
        let got = translate(&Event::ButtonPress(button(3)), &atoms());
        assert_eq!(got, WindowEvent::Input(vec![InputEvent::button_down(30, 40, 2)]));
    }

    #[test]
    fn test_wheel_release_is_dropped() {
        let got = translate(&Event::ButtonRelease(button(5)), &atoms());
        assert_eq!(got, WindowEvent::Input(Vec::new()));
    }

    #[test]
    fn test_motion_and_keys() {
        let motion = MotionNotifyEvent {
            response_type: 6,
            detail: x11rb::protocol::xproto::Motion::NORMAL,
            sequence: 0,
            time: 0,
            root: 1,
            event: 2,
            child: 0,
            root_x: 0,
            root_y: 0,
            event_x: 5,
            event_y: 6,
            state: KeyButMask::from(0u16),
            same_screen: true,
        };
        assert_eq!(
            translate(&Event::MotionNotify(motion), &atoms()),
            WindowEvent::Input(vec![InputEvent::pointer_move(5, 6)])
        );

        let key = KeyPressEvent {
            response_type: 2,
            detail: 113,
            sequence: 0,
            time: 0,
            root: 1,
            event: 2,
            child: 0,
            root_x: 0,
            root_y: 0,
            event_x: 0,
            event_y: 0,
            state: KeyButMask::from(0u16),
            same_screen: true,
        };
        let WindowEvent::Input(events) = translate(&Event::KeyPress(key), &atoms()) else {
            panic!("expected input");
        };
        assert_eq!(events[0].kind, InputKind::KeyDown);
        assert_eq!((events[0].code, events[0].flags), (75, KeyFlags::EXTENDED));
    }

    #[test]
    fn test_delete_window_closes() {
        let msg = ClientMessageEvent::new(32, 2, 100u32, ClientMessageData::from([101u32, 0, 0, 0, 0]));
        assert_eq!(translate(&Event::ClientMessage(msg), &atoms()), WindowEvent::Close);

        let other = ClientMessageEvent::new(32, 2, 100u32, ClientMessageData::from([55u32, 0, 0, 0, 0]));
        assert_eq!(translate(&Event::ClientMessage(other), &atoms()), WindowEvent::Ignore);
    }
}
