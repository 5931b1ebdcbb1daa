//! X driver format registry and EGL config records (spec §3, §4.2).

use std::collections::HashMap;

use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};
use x11rb::protocol::xproto::{Screen, VisualClass, VisualId};

use crate::backend::{allocator::format, egl::display::DmabufFormat};

/// One fourcc this crate's driver knows how to render into or sample from,
/// split into renderable and external-only modifier lists (spec §3 "X
/// driver format").
#[derive(Debug, Clone)]
pub struct DriverFormat {
    /// The pixel format.
    pub fourcc: Fourcc,
    /// Bits per pixel, from the format tables.
    pub bpp: usize,
    /// Depth (used bits, excluding padding), from the format tables.
    pub depth: usize,
    /// Modifiers the driver can both render into and sample from.
    pub render_modifiers: Vec<Modifier>,
    /// Modifiers the driver can only import for sampling.
    pub external_modifiers: Vec<Modifier>,
}

impl DriverFormat {
    fn new(fourcc: Fourcc) -> Self {
        DriverFormat {
            fourcc,
            bpp: format::get_bpp(fourcc).unwrap_or(32),
            depth: format::get_depth(fourcc).unwrap_or(24),
            render_modifiers: Vec::new(),
            external_modifiers: Vec::new(),
        }
    }

    /// All modifiers, renderable first.
    pub fn all_modifiers(&self) -> impl Iterator<Item = Modifier> + '_ {
        self.render_modifiers
            .iter()
            .chain(self.external_modifiers.iter())
            .copied()
    }
}

/// The format registry built in step 8 of display instance creation:
/// driver-queried `(fourcc, modifier)` pairs, folded per fourcc into
/// renderable vs. external-only lists.
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    formats: HashMap<Fourcc, DriverFormat>,
}

impl FormatRegistry {
    /// Build the registry from the driver's render-capable and
    /// texture/import-only dma-buf format lists.
    pub fn build(render: &[DmabufFormat], texture: &[DmabufFormat]) -> FormatRegistry {
        let mut formats: HashMap<Fourcc, DriverFormat> = HashMap::new();

        for f in render {
            let entry = formats
                .entry(f.format)
                .or_insert_with(|| DriverFormat::new(f.format));
            if !entry.render_modifiers.contains(&f.modifier) {
                entry.render_modifiers.push(f.modifier);
            }
        }
        for f in texture {
            let entry = formats
                .entry(f.format)
                .or_insert_with(|| DriverFormat::new(f.format));
            if entry.render_modifiers.contains(&f.modifier) {
                continue;
            }
            if !entry.external_modifiers.contains(&f.modifier) {
                entry.external_modifiers.push(f.modifier);
            }
        }

        FormatRegistry { formats }
    }

    /// Look up a format by fourcc.
    pub fn get(&self, fourcc: Fourcc) -> Option<&DriverFormat> {
        self.formats.get(&fourcc)
    }

    /// Iterate every known format.
    pub fn iter(&self) -> impl Iterator<Item = &DriverFormat> {
        self.formats.values()
    }
}

/// One driver EGL config, mapped onto an X11 visual/fourcc (spec §3 "EGL
/// config record", §4.2).
#[derive(Debug, Clone)]
pub struct ConfigRecord {
    /// Opaque driver config handle (an `EGLConfig` as `*const c_void`, cast
    /// by the loader glue).
    pub handle: usize,
    /// The fourcc the driver reports for this config via
    /// `eglGetConfigAttrib(..., EGL_NATIVE_VISUAL_ID/format-ish attrib)`.
    pub fourcc: Fourcc,
    /// `EGL_WINDOW_BIT | EGL_PIXMAP_BIT`, set according to the algorithm below.
    pub surface_type: u32,
    /// The X visual id this config can be presented through, if any.
    pub native_visual_id: Option<VisualId>,
    /// The X visual class backing `native_visual_id` (always TrueColor when set).
    pub native_visual_type: Option<VisualClass>,
    /// Whether the driver itself can render natively into this visual.
    pub native_renderable: bool,
}

bitflags::bitflags! {
    /// `EGL_WINDOW_BIT`/`EGL_PIXMAP_BIT`-equivalent surface-type mask.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SurfaceType: u32 {
        /// The config can back a window surface.
        const WINDOW_BIT = 0b01;
        /// The config can back a pixmap surface.
        const PIXMAP_BIT = 0b10;
    }
}

/// One driver-exposed config before it has been matched against the screen
/// (the loader glue's raw input to [`build_config_list`]).
#[derive(Debug, Clone)]
pub struct RawDriverConfig {
    /// Opaque driver config handle.
    pub handle: usize,
    /// The fourcc the driver reports for this config.
    pub fourcc: Fourcc,
    /// Whether the driver itself can render natively into this format.
    pub native_renderable: bool,
}

/// Builds the config list (spec §4.2): for each driver-exposed config, look
/// its fourcc up in the format registry. A format absent from the registry
/// yields a config with neither bit set (still present in the list, but
/// unusable). A format present in the registry always gets `PIXMAP_BIT` (a
/// linear PRIME intermediate can always be synthesized server-side) and,
/// when the screen exposes a TrueColor visual whose channel masks exactly
/// match the format at its depth, also gets `WINDOW_BIT` and the visual id.
pub fn build_config_list(
    raw_configs: &[RawDriverConfig],
    registry: &FormatRegistry,
    screen: &Screen,
) -> Vec<ConfigRecord> {
    raw_configs
        .iter()
        .map(|raw| {
            let format = registry.get(raw.fourcc);

            let Some(format) = format else {
                return ConfigRecord {
                    handle: raw.handle,
                    fourcc: raw.fourcc,
                    surface_type: 0,
                    native_visual_id: None,
                    native_visual_type: None,
                    native_renderable: raw.native_renderable,
                };
            };

            let mut surface_type = SurfaceType::PIXMAP_BIT;
            let visual = find_truecolor_visual(screen, raw.fourcc, format.depth, format.bpp);
            let native_visual_id = visual.map(|v| v.visual_id);
            if native_visual_id.is_some() {
                surface_type |= SurfaceType::WINDOW_BIT;
            }

            ConfigRecord {
                handle: raw.handle,
                fourcc: raw.fourcc,
                surface_type: surface_type.bits(),
                native_visual_id,
                native_visual_type: native_visual_id.map(|_| VisualClass::TRUE_COLOR),
                native_renderable: raw.native_renderable,
            }
        })
        .collect()
}

struct MatchedVisual {
    visual_id: VisualId,
}

/// Finds a TrueColor visual on `screen` whose RGB masks exactly match
/// `fourcc`'s channel layout at the format's depth (spec step 4.2: "RGB
/// masks exactly match the format's channel widths/offsets at the format's
/// depth").
///
/// Depth alone does not disambiguate visuals that share it but differ in
/// channel order or widths (BGR vs RGB, 5-6-5 vs 5-5-5), so this compares
/// `red_mask`/`green_mask`/`blue_mask` directly against the fourcc's known
/// layout, the same way the reference EGL/X11 platform picks its one
/// supported visual by comparing `red_mask` against a literal mask.
fn find_truecolor_visual(screen: &Screen, fourcc: Fourcc, depth: usize, bpp: usize) -> Option<MatchedVisual> {
    let masks = rgb_masks(fourcc)?;
    screen.allowed_depths.iter().find_map(|d| {
        if d.depth as usize != depth {
            return None;
        }
        d.visuals
            .iter()
            .find(|v| {
                v.class == VisualClass::TRUE_COLOR
                    && visual_bpp(v.bits_per_rgb_value) >= bpp
                    && v.red_mask == masks.0
                    && v.green_mask == masks.1
                    && v.blue_mask == masks.2
            })
            .map(|v| MatchedVisual { visual_id: v.visual_id })
    })
}

fn visual_bpp(bits_per_rgb_value: u8) -> usize {
    (bits_per_rgb_value as usize) * 3
}

/// The (red, green, blue) channel masks a TrueColor visual must carry to
/// match `fourcc`'s layout. `None` for formats this crate never offers as a
/// window-capable config (packed YUV, etc).
fn rgb_masks(fourcc: Fourcc) -> Option<(u32, u32, u32)> {
    match fourcc {
        Fourcc::Xrgb8888 | Fourcc::Argb8888 => Some((0x00ff_0000, 0x0000_ff00, 0x0000_00ff)),
        Fourcc::Xbgr8888 | Fourcc::Abgr8888 => Some((0x0000_00ff, 0x0000_ff00, 0x00ff_0000)),
        Fourcc::Rgb888 => Some((0x00ff_0000, 0x0000_ff00, 0x0000_00ff)),
        Fourcc::Bgr888 => Some((0x0000_00ff, 0x0000_ff00, 0x00ff_0000)),
        Fourcc::Rgb565 => Some((0xf800, 0x07e0, 0x001f)),
        Fourcc::Bgr565 => Some((0x001f, 0x07e0, 0xf800)),
        Fourcc::Xrgb2101010 | Fourcc::Argb2101010 => Some((0x3ff0_0000, 0x000f_fc00, 0x0000_03ff)),
        Fourcc::Xbgr2101010 | Fourcc::Abgr2101010 => Some((0x0000_03ff, 0x000f_fc00, 0x3ff0_0000)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::egl::display::DmabufFormat;
    use drm_fourcc::DrmModifier;

    #[test]
    fn registry_splits_render_and_external() {
        let render = [DmabufFormat {
            format: Fourcc::Xrgb8888,
            modifier: DrmModifier::Linear,
        }];
        let texture = [
            DmabufFormat {
                format: Fourcc::Xrgb8888,
                modifier: DrmModifier::Linear,
            },
            DmabufFormat {
                format: Fourcc::Xrgb8888,
                modifier: DrmModifier::I915XTiled,
            },
        ];

        let registry = FormatRegistry::build(&render, &texture);
        let fmt = registry.get(Fourcc::Xrgb8888).unwrap();
        assert_eq!(fmt.render_modifiers, vec![DrmModifier::Linear]);
        assert_eq!(fmt.external_modifiers, vec![DrmModifier::I915XTiled]);
    }

    #[test]
    fn unknown_format_yields_empty_registry_entry() {
        let registry = FormatRegistry::build(&[], &[]);
        assert!(registry.get(Fourcc::Xrgb8888).is_none());
    }
}
