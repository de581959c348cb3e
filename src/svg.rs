// Copyright 2025 the Shelf Atlas Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dump a visual representation of an atlas in SVG format.
//!
//! The output is meant for debugging packing behavior: allocated blocks,
//! their wasted strips, optional labels, and (optionally) free blocks.
//! Rendering only reads the block enumeration and never mutates the
//! allocator.

use std::io;

use crate::{AtlasAllocator, Rectangle};

/// Options controlling what [`dump_svg`] renders.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DumpOptions {
    /// Render the wasted strip between each block's top and its shelf's top
    /// as a distinct overlay.
    ///
    /// Default value: true.
    pub waste: bool,

    /// Draw each in-use block's name centered on the block.
    ///
    /// Default value: true.
    pub names: bool,

    /// Draw per-block coordinate labels at the top-left corner.
    ///
    /// Default value: false.
    pub coords: bool,

    /// Outline each rectangle.
    ///
    /// Default value: false.
    pub stroke: bool,

    /// Also render free blocks.
    ///
    /// Default value: false.
    pub unused: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        DumpOptions {
            waste: true,
            names: true,
            coords: false,
            stroke: false,
            unused: false,
        }
    }
}

/// Dump a visual representation of the atlas in SVG format.
pub fn dump_svg(
    atlas: &AtlasAllocator,
    options: &DumpOptions,
    output: &mut dyn io::Write,
) -> io::Result<()> {
    use svg_fmt::*;

    writeln!(
        output,
        "{}",
        BeginSvg {
            w: atlas.size().width as f32,
            h: atlas.size().height as f32
        }
    )?;

    dump_into_svg(atlas, options, None, output)?;

    writeln!(output, "{}", EndSvg)
}

/// Dump a visual representation of the atlas in SVG, omitting the beginning
/// and end of the SVG document, so that it can be included in a larger
/// document.
///
/// If a rectangle is provided, translate and scale the output to fit it.
pub fn dump_into_svg(
    atlas: &AtlasAllocator,
    options: &DumpOptions,
    rect: Option<&Rectangle>,
    output: &mut dyn io::Write,
) -> io::Result<()> {
    use svg_fmt::*;

    let (sx, sy, tx, ty) = if let Some(rect) = rect {
        (
            rect.width() as f32 / atlas.size().width as f32,
            rect.height() as f32 / atlas.size().height as f32,
            rect.min.x as f32,
            rect.min.y as f32,
        )
    } else {
        (1.0, 1.0, 0.0, 0.0)
    };

    let stroke = |on: bool| {
        if on {
            Stroke::Color(black(), 1.0)
        } else {
            Stroke::None
        }
    };

    for block in atlas.blocks() {
        if !block.in_use && !options.unused {
            continue;
        }

        let color = if block.in_use {
            rgb(70, 70, 180)
        } else {
            rgb(50, 50, 50)
        };

        let x = block.offset as f32;
        let y = block.shelf_y as f32;
        let w = block.size.width as f32;
        let h = block.size.height as f32;

        writeln!(
            output,
            r#"    {}"#,
            rectangle(tx + x * sx, ty + y * sy, w * sx, h * sy)
                .fill(color)
                .stroke(stroke(options.stroke))
        )?;

        // The strip between the block's top and the shelf's top.
        if options.waste && block.in_use && block.size.height < block.shelf_height {
            let wy = (block.shelf_y + block.size.height) as f32;
            let wh = (block.shelf_height - block.size.height) as f32;
            writeln!(
                output,
                r#"    {}"#,
                rectangle(tx + x * sx, ty + wy * sy, w * sx, wh * sy)
                    .fill(rgb(170, 60, 60))
                    .stroke(stroke(options.stroke))
            )?;
        }

        if options.names && block.in_use {
            if let Some(name) = block.name {
                writeln!(
                    output,
                    r#"    {}"#,
                    text(tx + (x + w * 0.5) * sx, ty + (y + h * 0.5) * sy, name)
                        .align(Align::Center)
                        .color(rgb(230, 230, 230))
                        .size(10.0 * sy)
                )?;
            }
        }

        if options.coords {
            writeln!(
                output,
                r#"    {}"#,
                text(
                    tx + (x + 1.0) * sx,
                    ty + (y + 9.0) * sy,
                    format!("{},{}", block.offset, block.shelf_y),
                )
                .color(rgb(230, 230, 230))
                .size(8.0 * sy)
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{size2, AtlasAllocator};

    #[test]
    fn svg_dump() {
        let mut atlas = AtlasAllocator::new(size2(128, 128));
        atlas
            .allocate_named(size2(40, 30), Some("glyph_a"))
            .unwrap();
        atlas.allocate(size2(30, 25)).unwrap();

        let mut out = Vec::new();
        dump_svg(&atlas, &DumpOptions::default(), &mut out).unwrap();
        let svg = String::from_utf8(out).unwrap();

        assert!(svg.starts_with("<svg"));
        assert!(svg.trim_end().ends_with("</svg>"));
        assert!(svg.contains("rect"));
        assert!(svg.contains("glyph_a"));
    }

    #[test]
    fn svg_dump_unused() {
        let mut atlas = AtlasAllocator::new(size2(128, 128));
        atlas.allocate(size2(40, 30)).unwrap();

        let render = |options: &DumpOptions| {
            let mut out = Vec::new();
            dump_svg(&atlas, options, &mut out).unwrap();
            String::from_utf8(out).unwrap()
        };

        // Free blocks only show up when requested.
        let used_only = render(&DumpOptions::default());
        let everything = render(&DumpOptions {
            unused: true,
            coords: true,
            stroke: true,
            ..DumpOptions::default()
        });
        assert!(everything.len() > used_only.len());
        assert!(everything.contains("0,0"));
    }
}
