//! Monitor discovery via RandR
//!
//! Uses RandR 1.5 monitors for geometry and the primary flag, and each
//! monitor's first CRTC for rotation and refresh rate. Falls back to the
//! root screen when RandR is unavailable.

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::randr::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{ConnectionExt as _, Screen};
use xrdp_local_core::display::{Monitor, Orientation};

/// RandR rotation bits to orientation.
fn orientation_from_rotation(bits: u16) -> Orientation {
    if bits & u16::from(randr::Rotation::ROTATE90) != 0 {
        Orientation::Portrait
    } else if bits & u16::from(randr::Rotation::ROTATE180) != 0 {
        Orientation::LandscapeFlipped
    } else if bits & u16::from(randr::Rotation::ROTATE270) != 0 {
        Orientation::PortraitFlipped
    } else {
        Orientation::Landscape
    }
}

/// Nearest whole refresh rate in Hz, 0 when the mode lacks timings.
fn refresh_rate(dot_clock: u32, htotal: u16, vtotal: u16) -> u32 {
    let total = htotal as u64 * vtotal as u64;
    if total == 0 {
        return 0;
    }
    ((dot_clock as u64 + total / 2) / total) as u32
}

/// All monitors of `screen`, never empty.
pub fn discover<C: Connection>(conn: &C, screen: &Screen) -> Result<Vec<Monitor>> {
    match randr_monitors(conn, screen) {
        Ok(monitors) if !monitors.is_empty() => {
            for m in &monitors {
                info!(
                    "Monitor {}: {}x{}+{}+{} {}Hz rot {}{}",
                    m.name,
                    m.width,
                    m.height,
                    m.x,
                    m.y,
                    m.refresh_rate,
                    m.orientation.degrees(),
                    if m.primary { " (primary)" } else { "" }
                );
            }
            Ok(monitors)
        }
        Ok(_) => {
            warn!("RandR reported no monitors, using root screen");
            Ok(vec![root_monitor(screen)])
        }
        Err(e) => {
            warn!("RandR monitor query failed ({:#}), using root screen", e);
            Ok(vec![root_monitor(screen)])
        }
    }
}

fn root_monitor(screen: &Screen) -> Monitor {
    Monitor {
        name: "screen".into(),
        x: 0,
        y: 0,
        width: screen.width_in_pixels as u32,
        height: screen.height_in_pixels as u32,
        width_mm: screen.width_in_millimeters as u32,
        height_mm: screen.height_in_millimeters as u32,
        orientation: Orientation::Landscape,
        refresh_rate: 0,
        primary: true,
    }
}

fn randr_monitors<C: Connection>(conn: &C, screen: &Screen) -> Result<Vec<Monitor>> {
    let root = screen.root;
    let reply = conn
        .randr_get_monitors(root, true)
        .context("RRGetMonitors request")?
        .reply()
        .context("RRGetMonitors reply")?;
    let resources = conn
        .randr_get_screen_resources_current(root)
        .context("RRGetScreenResourcesCurrent request")?
        .reply()
        .context("RRGetScreenResourcesCurrent reply")?;

    let mut monitors = Vec::with_capacity(reply.monitors.len());
    for info in reply.monitors {
        let name = conn
            .get_atom_name(info.name)?
            .reply()
            .map(|r| String::from_utf8_lossy(&r.name).into_owned())
            .unwrap_or_else(|_| format!("monitor-{}", monitors.len()));

        let (orientation, refresh) = info
            .outputs
            .first()
            .and_then(|&output| crtc_timing(conn, output, &resources).ok().flatten())
            .unwrap_or((Orientation::Landscape, 0));

        debug!("RandR monitor {} has {} output(s)", name, info.outputs.len());
        monitors.push(Monitor {
            name,
            x: info.x as i32,
            y: info.y as i32,
            width: info.width as u32,
            height: info.height as u32,
            width_mm: info.width_in_millimeters,
            height_mm: info.height_in_millimeters,
            orientation,
            refresh_rate: refresh,
            primary: info.primary,
        });
    }
    Ok(monitors)
}

fn crtc_timing<C: Connection>(
    conn: &C,
    output: randr::Output,
    resources: &randr::GetScreenResourcesCurrentReply,
) -> Result<Option<(Orientation, u32)>> {
    let output_info = conn
        .randr_get_output_info(output, resources.config_timestamp)?
        .reply()?;
    if output_info.crtc == x11rb::NONE {
        return Ok(None);
    }
    let crtc = conn
        .randr_get_crtc_info(output_info.crtc, resources.config_timestamp)?
        .reply()?;

    let refresh = resources
        .modes
        .iter()
        .find(|m| m.id == crtc.mode)
        .map(|m| refresh_rate(m.dot_clock, m.htotal, m.vtotal))
        .unwrap_or(0);

    Ok(Some((orientation_from_rotation(u16::from(crtc.rotation)), refresh)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_rate_rounds() {
        // 1920x1080@60 CVT reduced blanking
        assert_eq!(refresh_rate(138_500_000, 2080, 1111), 60);
        // 59.94 Hz mode
        assert_eq!(refresh_rate(148_350_000, 2200, 1125), 60);
        assert_eq!(refresh_rate(1, 0, 1125), 0);
    }

    #[test]
    fn test_rotation_bits() {
        assert_eq!(orientation_from_rotation(1), Orientation::Landscape);
        assert_eq!(orientation_from_rotation(2), Orientation::Portrait);
        assert_eq!(orientation_from_rotation(4), Orientation::LandscapeFlipped);
        assert_eq!(orientation_from_rotation(8 | 16), Orientation::PortraitFlipped);
    }
}
