//! Monitor layout reported to the protocol module at connect time.

use tracing::debug;

/// Upper bound on monitors the module accepts.
pub const MAX_MONITORS: usize = 16;

/// Frame interval when no monitor reports a refresh rate.
pub const DEFAULT_FRAME_INTERVAL_MS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Landscape,
    Portrait,
    LandscapeFlipped,
    PortraitFlipped,
}

impl Orientation {
    pub fn degrees(self) -> u32 {
        match self {
            Orientation::Landscape => 0,
            Orientation::Portrait => 90,
            Orientation::LandscapeFlipped => 180,
            Orientation::PortraitFlipped => 270,
        }
    }
}

/// A physical output as discovered on the local display.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Monitor {
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub width_mm: u32,
    pub height_mm: u32,
    pub orientation: Orientation,
    /// Hz, 0 when unknown.
    pub refresh_rate: u32,
    pub primary: bool,
}

/// One monitor entry as the module sees it. `right`/`bottom` are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorLayout {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub width_mm: u32,
    pub height_mm: u32,
    pub orientation: u32,
    pub desktop_scale: u32,
    pub device_scale: u32,
    pub is_primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayDescriptor {
    pub monitors: Vec<MonitorLayout>,
    pub session_width: u32,
    pub session_height: u32,
    pub frame_interval_ms: u32,
}

impl DisplayDescriptor {
    /// Build the layout from discovered monitors.
    ///
    /// The primary monitor goes first and is the only one flagged primary.
    /// At most `max_displays` monitors are kept (0 keeps all), never more
    /// than [`MAX_MONITORS`]. Returns `None` when there is nothing to show.
    pub fn build(monitors: &[Monitor], max_displays: usize) -> Option<Self> {
        let mut ordered: Vec<&Monitor> = monitors.iter().collect();
        ordered.sort_by_key(|m| !m.primary);

        let limit = match max_displays {
            0 => MAX_MONITORS,
            n => n.min(MAX_MONITORS),
        };
        ordered.truncate(limit);
        if ordered.is_empty() {
            return None;
        }

        let layouts: Vec<MonitorLayout> = ordered
            .iter()
            .enumerate()
            .map(|(i, m)| MonitorLayout {
                left: m.x,
                top: m.y,
                right: m.x + m.width as i32 - 1,
                bottom: m.y + m.height as i32 - 1,
                width_mm: m.width_mm,
                height_mm: m.height_mm,
                orientation: m.orientation.degrees(),
                desktop_scale: 100,
                device_scale: 100,
                is_primary: i == 0,
            })
            .collect();

        let session_width = layouts
            .iter()
            .map(|l| (l.right + 1).max(0) as u32)
            .fold(1, u32::max);
        let session_height = layouts
            .iter()
            .map(|l| (l.bottom + 1).max(0) as u32)
            .fold(1, u32::max);

        let frame_interval_ms = ordered
            .iter()
            .map(|m| m.refresh_rate)
            .filter(|&r| r > 0)
            .min()
            .map(|r| (1000 / r).max(1))
            .unwrap_or(DEFAULT_FRAME_INTERVAL_MS);

        debug!(
            "Display layout: {} monitor(s), session {}x{}, frame interval {}ms",
            layouts.len(),
            session_width,
            session_height,
            frame_interval_ms
        );

        Some(Self {
            monitors: layouts,
            session_width,
            session_height,
            frame_interval_ms,
        })
    }

    /// Size of the first (primary) monitor, used to start the session.
    pub fn primary_size(&self) -> (u32, u32) {
        self.monitors
            .first()
            .map(|l| ((l.right - l.left + 1) as u32, (l.bottom - l.top + 1) as u32))
            .unwrap_or((self.session_width, self.session_height))
    }
}
