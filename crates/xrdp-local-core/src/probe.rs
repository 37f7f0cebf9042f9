//! One-shot check of whether the loaded protocol module implements the
//! accelerated buffer request.
//!
//! Some module builds predate the request entry point and leave the slot in
//! their function table uninitialized rather than null. A null check alone
//! is not enough, so the address found in the slot must also lie inside the
//! module's own mapped image.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Address ranges a loaded module occupies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleImage {
    segments: Vec<Range<usize>>,
}

impl ModuleImage {
    pub fn new(segments: Vec<Range<usize>>) -> Self {
        Self { segments }
    }

    pub fn push(&mut self, segment: Range<usize>) {
        self.segments.push(segment);
    }

    pub fn segments(&self) -> &[Range<usize>] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.segments.iter().any(|s| s.contains(&addr))
    }
}

/// Configured answer, overriding detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityOverride {
    #[default]
    Auto,
    Supported,
    Unsupported,
}

/// What decided the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilitySource {
    Configured,
    /// The module's self-reported table size does not reach the slot.
    TableSize,
    NullEntry,
    ImageRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub supported: bool,
    pub source: CapabilitySource,
}

/// Facts about the module gathered by the caller.
pub struct ProbeInput<'a, F> {
    /// Size the module wrote into its table header, in bytes.
    pub table_size: usize,
    /// Offset one past the end of the request slot.
    pub slot_end: usize,
    /// Reads the slot. Only called once the slot is known to exist.
    pub read_slot: F,
    pub image: &'a ModuleImage,
}

/// Decide once per session whether to ask the module for accelerated
/// buffers.
pub fn decide<F: FnOnce() -> usize>(setting: CapabilityOverride, input: ProbeInput<'_, F>) -> Capability {
    let capability = match setting {
        CapabilityOverride::Supported => Capability {
            supported: true,
            source: CapabilitySource::Configured,
        },
        CapabilityOverride::Unsupported => Capability {
            supported: false,
            source: CapabilitySource::Configured,
        },
        CapabilityOverride::Auto if input.table_size < input.slot_end => Capability {
            supported: false,
            source: CapabilitySource::TableSize,
        },
        CapabilityOverride::Auto => match (input.read_slot)() {
            0 => Capability {
                supported: false,
                source: CapabilitySource::NullEntry,
            },
            addr => {
                let inside = input.image.contains(addr);
                debug!(
                    "Request slot {:#x} {} module image ({} segment(s))",
                    addr,
                    if inside { "inside" } else { "outside" },
                    input.image.segments().len()
                );
                Capability {
                    supported: inside,
                    source: CapabilitySource::ImageRange,
                }
            }
        },
    };
    info!(
        "Accelerated buffers {} ({:?})",
        if capability.supported { "supported" } else { "unsupported" },
        capability.source
    );
    capability
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> ModuleImage {
        ModuleImage::new(vec![0x7000_0000..0x7000_4000, 0x7001_0000..0x7001_2000])
    }

    fn probe(setting: CapabilityOverride, table_size: usize, slot: usize) -> Capability {
        let image = image();
        decide(
            setting,
            ProbeInput {
                table_size,
                slot_end: 128,
                read_slot: || slot,
                image: &image,
            },
        )
    }

    #[test]
    fn test_slot_inside_image_is_supported() {
        let c = probe(CapabilityOverride::Auto, 4096, 0x7001_0010);
        assert!(c.supported);
        assert_eq!(c.source, CapabilitySource::ImageRange);
    }

    #[test]
    fn test_slot_outside_image_is_unsupported() {
        assert!(!probe(CapabilityOverride::Auto, 4096, 0x7000_4000).supported);
        assert!(!probe(CapabilityOverride::Auto, 4096, 0xdead_beef).supported);
    }

    #[test]
    fn test_null_slot_is_unsupported() {
        let c = probe(CapabilityOverride::Auto, 4096, 0);
        assert_eq!(
            c,
            Capability {
                supported: false,
                source: CapabilitySource::NullEntry
            }
        );
    }

    #[test]
    fn test_short_table_is_never_read() {
        let image = image();
        let c = decide(
            CapabilityOverride::Auto,
            ProbeInput {
                table_size: 64,
                slot_end: 128,
                read_slot: || -> usize { panic!("slot read past table") },
                image: &image,
            },
        );
        assert_eq!(c.source, CapabilitySource::TableSize);
        assert!(!c.supported);
    }

    #[test]
    fn test_configured_setting_wins() {
        assert!(probe(CapabilityOverride::Supported, 0, 0).supported);
        let c = probe(CapabilityOverride::Unsupported, 4096, 0x7000_0010);
        assert!(!c.supported);
        assert_eq!(c.source, CapabilitySource::Configured);
    }
}
