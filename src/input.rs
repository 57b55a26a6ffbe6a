//! Mouse, keyboard and screen primitives driven by the control channel.
//!
//! Real OS input injection is platform-specific and lives behind the
//! [`InputDevice`] trait. The crate ships [`VirtualInput`], which keeps the state a
//! real device would have (cursor position, held buttons and keys) and logs each
//! action, so scripts run unchanged on machines where injection isn't available.

use std::collections::BTreeSet;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

/// Why an input device could not act.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("input device unavailable: {0}")]
    Unavailable(String),
}

/// Screen dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl Default for ScreenSize {
    fn default() -> Self {
        ScreenSize {
            width: 1920,
            height: 1080,
        }
    }
}

impl FromStr for ScreenSize {
    type Err = String;

    /// Parses `WIDTHxHEIGHT`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s}"))?;
        let width = w.trim().parse().map_err(|_| format!("bad width in {s}"))?;
        let height = h.trim().parse().map_err(|_| format!("bad height in {s}"))?;
        if width == 0 || height == 0 {
            return Err(format!("screen must be non-empty, got {s}"));
        }
        Ok(ScreenSize { width, height })
    }
}

/// A cursor position in screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// The mouse buttons and wheel directions a script can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MouseButton {
    Left,
    Right,
    Center,
    WheelDown,
    WheelUp,
    WheelLeft,
    WheelRight,
}

impl MouseButton {
    /// The name scripts use for this button.
    pub fn name(self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Center => "center",
            MouseButton::WheelDown => "wheelDown",
            MouseButton::WheelUp => "wheelUp",
            MouseButton::WheelLeft => "wheelLeft",
            MouseButton::WheelRight => "wheelRight",
        }
    }
}

impl FromStr for MouseButton {
    type Err = ();

    /// ```
    /// use autohook::input::MouseButton;
    /// assert_eq!("middle".parse(), Ok(MouseButton::Center));
    /// assert_eq!("wheelUp".parse(), Ok(MouseButton::WheelUp));
    /// assert!("thumb".parse::<MouseButton>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "left" => MouseButton::Left,
            "right" => MouseButton::Right,
            "center" | "centre" | "middle" => MouseButton::Center,
            "wheelDown" => MouseButton::WheelDown,
            "wheelUp" => MouseButton::WheelUp,
            "wheelLeft" => MouseButton::WheelLeft,
            "wheelRight" => MouseButton::WheelRight,
            _ => return Err(()),
        })
    }
}

/// Keys that are not a single character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NamedKey {
    Enter,
    Tab,
    Escape,
    Backspace,
    Delete,
    Space,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    Shift,
    Control,
    Alt,
    Command,
    F(u8),
}

/// A key a script can press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Char(char),
    Named(NamedKey),
}

impl FromStr for Key {
    type Err = ();

    /// ```
    /// use autohook::input::{Key, NamedKey};
    /// assert_eq!("a".parse(), Ok(Key::Char('a')));
    /// assert_eq!("PageUp".parse(), Ok(Key::Named(NamedKey::PageUp)));
    /// assert_eq!("f12".parse(), Ok(Key::Named(NamedKey::F(12))));
    /// assert!("f13".parse::<Key>().is_err());
    /// assert!("".parse::<Key>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            return Ok(Key::Char(c));
        }
        let lower = s.to_ascii_lowercase();
        let named = match lower.as_str() {
            "enter" => NamedKey::Enter,
            "tab" => NamedKey::Tab,
            "escape" => NamedKey::Escape,
            "backspace" => NamedKey::Backspace,
            "delete" => NamedKey::Delete,
            "space" => NamedKey::Space,
            "up" => NamedKey::Up,
            "down" => NamedKey::Down,
            "left" => NamedKey::Left,
            "right" => NamedKey::Right,
            "home" => NamedKey::Home,
            "end" => NamedKey::End,
            "pageup" => NamedKey::PageUp,
            "pagedown" => NamedKey::PageDown,
            "shift" => NamedKey::Shift,
            "control" => NamedKey::Control,
            "alt" => NamedKey::Alt,
            "command" => NamedKey::Command,
            f => match f.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
                Some(n @ 1..=12) => NamedKey::F(n),
                _ => return Err(()),
            },
        };
        Ok(Key::Named(named))
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Char(c) => write!(f, "{c}"),
            Key::Named(NamedKey::F(n)) => write!(f, "f{n}"),
            Key::Named(named) => write!(f, "{}", format!("{named:?}").to_ascii_lowercase()),
        }
    }
}

/// An OS-level input capability.
pub trait InputDevice: Send + Sync + Debug {
    fn screen_size(&self) -> Result<ScreenSize, Error>;
    fn mouse_location(&self) -> Result<Point, Error>;
    /// Moves the cursor instantly.
    fn jump_mouse(&self, to: Point) -> Result<(), Error>;
    /// Moves the cursor as a user would, generating intermediate motion.
    fn move_mouse(&self, to: Point) -> Result<(), Error>;
    fn click(&self, button: MouseButton, double: bool) -> Result<(), Error>;
    fn mouse_down(&self, button: MouseButton) -> Result<(), Error>;
    fn mouse_up(&self, button: MouseButton) -> Result<(), Error>;
    fn key_press(&self, key: Key) -> Result<(), Error>;
    fn key_down(&self, key: Key) -> Result<(), Error>;
    fn key_up(&self, key: Key) -> Result<(), Error>;
}

/// Something a [`VirtualInput`] was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Jump(Point),
    Move(Point),
    Click { button: MouseButton, double: bool },
    MouseDown(MouseButton),
    MouseUp(MouseButton),
    KeyPress(Key),
    KeyDown(Key),
    KeyUp(Key),
}

#[derive(Debug, Default)]
struct VirtualState {
    cursor: Point,
    buttons: BTreeSet<MouseButton>,
    keys: BTreeSet<Key>,
    events: Vec<InputEvent>,
}

/// An input device that only records what it is told.
#[derive(Debug)]
pub struct VirtualInput {
    screen: ScreenSize,
    state: Mutex<VirtualState>,
}

impl VirtualInput {
    /// A device with the cursor at the origin and nothing held.
    pub fn new(screen: ScreenSize) -> Self {
        VirtualInput {
            screen,
            state: Mutex::new(VirtualState::default()),
        }
    }

    /// Everything done so far, oldest first.
    pub fn events(&self) -> Vec<InputEvent> {
        self.state().events.clone()
    }

    /// Buttons currently held down.
    pub fn pressed_buttons(&self) -> Vec<MouseButton> {
        self.state().buttons.iter().copied().collect()
    }

    /// Keys currently held down.
    pub fn pressed_keys(&self) -> Vec<Key> {
        self.state().keys.iter().copied().collect()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clamp(&self, p: Point) -> Point {
        Point {
            x: p.x.clamp(0, self.screen.width as i32 - 1),
            y: p.y.clamp(0, self.screen.height as i32 - 1),
        }
    }

    fn record(&self, event: InputEvent, apply: impl FnOnce(&mut VirtualState)) {
        logwise::info_sync!("virtual input {event}", event = logwise::privacy::LogIt(&event));
        let mut state = self.state();
        apply(&mut state);
        state.events.push(event);
    }
}

impl InputDevice for VirtualInput {
    fn screen_size(&self) -> Result<ScreenSize, Error> {
        Ok(self.screen)
    }

    fn mouse_location(&self) -> Result<Point, Error> {
        Ok(self.state().cursor)
    }

    fn jump_mouse(&self, to: Point) -> Result<(), Error> {
        let to = self.clamp(to);
        self.record(InputEvent::Jump(to), |s| s.cursor = to);
        Ok(())
    }

    fn move_mouse(&self, to: Point) -> Result<(), Error> {
        let to = self.clamp(to);
        self.record(InputEvent::Move(to), |s| s.cursor = to);
        Ok(())
    }

    fn click(&self, button: MouseButton, double: bool) -> Result<(), Error> {
        self.record(InputEvent::Click { button, double }, |_| {});
        Ok(())
    }

    fn mouse_down(&self, button: MouseButton) -> Result<(), Error> {
        self.record(InputEvent::MouseDown(button), |s| {
            s.buttons.insert(button);
        });
        Ok(())
    }

    fn mouse_up(&self, button: MouseButton) -> Result<(), Error> {
        self.record(InputEvent::MouseUp(button), |s| {
            s.buttons.remove(&button);
        });
        Ok(())
    }

    fn key_press(&self, key: Key) -> Result<(), Error> {
        self.record(InputEvent::KeyPress(key), |_| {});
        Ok(())
    }

    fn key_down(&self, key: Key) -> Result<(), Error> {
        self.record(InputEvent::KeyDown(key), |s| {
            s.keys.insert(key);
        });
        Ok(())
    }

    fn key_up(&self, key: Key) -> Result<(), Error> {
        self.record(InputEvent::KeyUp(key), |s| {
            s.keys.remove(&key);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_is_clamped_to_screen() {
        let input = VirtualInput::new(ScreenSize { width: 100, height: 50 });
        input.jump_mouse(Point { x: -5, y: 20 }).unwrap();
        assert_eq!(input.mouse_location().unwrap(), Point { x: 0, y: 20 });
        input.move_mouse(Point { x: 500, y: 500 }).unwrap();
        assert_eq!(input.mouse_location().unwrap(), Point { x: 99, y: 49 });
    }

    #[test]
    fn held_state_follows_down_and_up() {
        let input = VirtualInput::new(ScreenSize::default());
        input.mouse_down(MouseButton::Left).unwrap();
        input.key_down(Key::Named(NamedKey::Shift)).unwrap();
        input.key_down(Key::Char('a')).unwrap();
        assert_eq!(input.pressed_buttons(), vec![MouseButton::Left]);
        assert_eq!(input.pressed_keys().len(), 2);
        input.mouse_up(MouseButton::Left).unwrap();
        input.key_up(Key::Char('a')).unwrap();
        assert!(input.pressed_buttons().is_empty());
        assert_eq!(input.pressed_keys(), vec![Key::Named(NamedKey::Shift)]);
        assert_eq!(input.events().len(), 5);
    }

    #[test]
    fn screen_size_parses() {
        assert_eq!("800x600".parse(), Ok(ScreenSize { width: 800, height: 600 }));
        assert!("800".parse::<ScreenSize>().is_err());
        assert!("0x600".parse::<ScreenSize>().is_err());
    }

    #[test]
    fn key_names_display_back() {
        for name in ["enter", "pagedown", "f3", "z", "command"] {
            assert_eq!(name.parse::<Key>().unwrap().to_string(), name);
        }
    }
}
