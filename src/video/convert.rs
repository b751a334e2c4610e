//! Conversion from hardware output layouts to I420 planes, and the reverse
//! packing used for encoder input.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConvertError;
use crate::hal::{CodecService, ColorFormatConstants, NativeConverter};
use crate::host::FrameAllocator;
use crate::video::{PlanarFrame, RawFrame};

/// Rounds `value` up to a multiple of `to`, a power of two. Values too close
/// to `u32::MAX` clamp to the largest multiple that fits.
pub fn align_up(value: u32, to: u32) -> u32 {
    let mask = !(to - 1);
    value.checked_add(to - 1).map_or(u32::MAX & mask, |padded| padded & mask)
}

/// Plane placement derived from the hardware's reported output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameGeometry {
    pub stride: u32,
    pub slice_height: u32,
    pub top: u32,
    pub left: u32,
    pub width: u32,
    pub height: u32,
}

impl FrameGeometry {
    pub fn from_raw(frame: &RawFrame) -> Self {
        Self {
            stride: frame.stride,
            slice_height: frame.slice_height,
            top: frame.crop.top,
            left: frame.crop.left,
            width: frame.crop.width(),
            height: frame.crop.height(),
        }
    }

    fn luma_size(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    fn chroma_size(&self) -> usize {
        self.luma_size() / 4
    }

    fn luma_offset(&self) -> usize {
        self.top as usize * self.stride as usize + self.left as usize
    }

    fn chroma_base(&self) -> usize {
        self.stride as usize * self.slice_height as usize
    }
}

/// Software layouts the converter knows how to unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SoftwareLayout {
    PackedSemiPlanar32m,
    Planar,
    SemiPlanar,
}

impl SoftwareLayout {
    pub fn from_color_format(format: u32, constants: &ColorFormatConstants) -> Option<Self> {
        if format == constants.yuv420_packed_semi_planar_32m {
            Some(SoftwareLayout::PackedSemiPlanar32m)
        } else if format == constants.yuv420_planar {
            Some(SoftwareLayout::Planar)
        } else if format == constants.yuv420_semi_planar {
            Some(SoftwareLayout::SemiPlanar)
        } else {
            None
        }
    }

    pub fn color_format(self, constants: &ColorFormatConstants) -> u32 {
        match self {
            SoftwareLayout::PackedSemiPlanar32m => constants.yuv420_packed_semi_planar_32m,
            SoftwareLayout::Planar => constants.yuv420_planar,
            SoftwareLayout::SemiPlanar => constants.yuv420_semi_planar,
        }
    }

    /// Applies the alignment each hardware layout mandates.
    pub fn align(self, mut geometry: FrameGeometry) -> FrameGeometry {
        match self {
            SoftwareLayout::PackedSemiPlanar32m => {
                geometry.stride = align_up(geometry.stride, 128);
                geometry.slice_height = align_up(geometry.slice_height, 32);
                geometry.top = align_up(geometry.top, 2);
                geometry.left = align_up(geometry.left, 2);
            }
            SoftwareLayout::Planar => geometry.stride = align_up(geometry.stride, 4),
            SoftwareLayout::SemiPlanar => geometry.stride = align_up(geometry.stride, 16),
        }
        geometry
    }
}

pub enum PixelConverter {
    Native {
        handle: Box<dyn NativeConverter>,
        geometry: FrameGeometry,
    },
    PackedSemiPlanar32m(FrameGeometry),
    Planar(FrameGeometry),
    SemiPlanar(FrameGeometry),
}

impl fmt::Debug for PixelConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelConverter")
            .field("kind", &self.name())
            .field("geometry", self.geometry())
            .finish()
    }
}

impl PixelConverter {
    /// Picks a converter for the first frame of a stream. The service's own
    /// conversion handle wins whenever one is offered.
    pub fn select(service: &dyn CodecService, frame: &RawFrame) -> Option<Self> {
        let geometry = FrameGeometry::from_raw(frame);
        if let Some(mut handle) = service.create_converter() {
            handle.set_crop_rect(frame.crop, frame.stride, frame.slice_height);
            return Some(PixelConverter::Native { handle, geometry });
        }
        let layout =
            SoftwareLayout::from_color_format(frame.color_format, &service.color_format_constants())?;
        Some(Self::with_layout(layout, geometry))
    }

    pub fn with_layout(layout: SoftwareLayout, geometry: FrameGeometry) -> Self {
        let geometry = layout.align(geometry);
        match layout {
            SoftwareLayout::PackedSemiPlanar32m => PixelConverter::PackedSemiPlanar32m(geometry),
            SoftwareLayout::Planar => PixelConverter::Planar(geometry),
            SoftwareLayout::SemiPlanar => PixelConverter::SemiPlanar(geometry),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelConverter::Native { .. } => "native",
            PixelConverter::PackedSemiPlanar32m(_) => "packed-semi-planar-32m",
            PixelConverter::Planar(_) => "planar",
            PixelConverter::SemiPlanar(_) => "semi-planar",
        }
    }

    pub fn geometry(&self) -> &FrameGeometry {
        match self {
            PixelConverter::Native { geometry, .. }
            | PixelConverter::PackedSemiPlanar32m(geometry)
            | PixelConverter::Planar(geometry)
            | PixelConverter::SemiPlanar(geometry) => geometry,
        }
    }

    /// Produces an I420 frame; timestamp and duration are left for the caller.
    pub fn convert(
        &mut self,
        allocator: &dyn FrameAllocator,
        frame: &RawFrame,
    ) -> Result<PlanarFrame, ConvertError> {
        match self {
            PixelConverter::Native { handle, geometry } => {
                convert_native(handle.as_mut(), geometry, allocator, &frame.data)
            }
            PixelConverter::PackedSemiPlanar32m(geometry) | PixelConverter::SemiPlanar(geometry) => {
                convert_semi_planar(geometry, allocator, &frame.data)
            }
            PixelConverter::Planar(geometry) => convert_planar(geometry, allocator, &frame.data),
        }
    }
}

fn convert_native(
    handle: &mut dyn NativeConverter,
    geometry: &FrameGeometry,
    allocator: &dyn FrameAllocator,
    input: &[u8],
) -> Result<PlanarFrame, ConvertError> {
    let width = geometry.width;
    let size = width as usize * geometry.height as usize;
    let mut buffer = vec![0u8; size * 3 / 2];
    handle.convert_to_i420(input, &mut buffer)?;

    let (y, chroma) = buffer.split_at(size);
    let (u, v) = chroma.split_at(size / 4);
    Ok(PlanarFrame {
        width,
        height: geometry.height,
        y: allocator.create_plane(y, width)?,
        u: allocator.create_plane(u, width / 2)?,
        v: allocator.create_plane(v, width / 2)?,
        ..PlanarFrame::default()
    })
}

fn convert_semi_planar(
    geometry: &FrameGeometry,
    allocator: &dyn FrameAllocator,
    input: &[u8],
) -> Result<PlanarFrame, ConvertError> {
    let stride = geometry.stride as usize;
    let chroma_size = geometry.chroma_size();
    let uv_offset = geometry.chroma_base()
        + (geometry.top as usize / 2) * stride
        + (geometry.left as usize / 2) * 2;

    let y_src = region(input, geometry.luma_offset(), geometry.luma_size(), "Y")?;
    let uv_src = region(input, uv_offset, chroma_size * 2, "UV")?;

    let y = allocator.create_plane(y_src, geometry.stride)?;
    let mut u = allocator.create_empty_plane(chroma_size, geometry.stride / 2)?;
    let mut v = allocator.create_empty_plane(chroma_size, geometry.stride / 2)?;
    deinterleave(&mut u.data, &mut v.data, uv_src);
    debug!(stride, chroma_size, "Unpacked semi-planar chroma");

    Ok(PlanarFrame {
        width: geometry.width,
        height: geometry.height,
        y,
        u,
        v,
        ..PlanarFrame::default()
    })
}

fn convert_planar(
    geometry: &FrameGeometry,
    allocator: &dyn FrameAllocator,
    input: &[u8],
) -> Result<PlanarFrame, ConvertError> {
    let chroma_stride = geometry.stride as usize / 2;
    let chroma_size = geometry.chroma_size();
    let chroma_crop =
        (geometry.top as usize / 2) * chroma_stride + geometry.left as usize / 2;
    let u_offset = geometry.chroma_base() + chroma_crop;
    let v_offset = geometry.chroma_base() + geometry.chroma_base() / 4 + chroma_crop;

    let y_src = region(input, geometry.luma_offset(), geometry.luma_size(), "Y")?;
    let u_src = region(input, u_offset, chroma_size, "U")?;
    let v_src = region(input, v_offset, chroma_size, "V")?;

    Ok(PlanarFrame {
        width: geometry.width,
        height: geometry.height,
        y: allocator.create_plane(y_src, geometry.stride)?,
        u: allocator.create_plane(u_src, geometry.stride / 2)?,
        v: allocator.create_plane(v_src, geometry.stride / 2)?,
        ..PlanarFrame::default()
    })
}

/// Splits `2 * n` interleaved bytes into two runs of `n`.
pub fn deinterleave(out0: &mut [u8], out1: &mut [u8], input: &[u8]) {
    for ((pair, first), second) in input.chunks_exact(2).zip(out0.iter_mut()).zip(out1.iter_mut()) {
        *first = pair[0];
        *second = pair[1];
    }
}

/// Packs a host I420 frame into one contiguous encoder input buffer.
///
/// `Planar` keeps Y, U, V back to back; the semi-planar layouts interleave
/// U and V after the luma rows.
pub fn pack_i420(frame: &PlanarFrame, layout: SoftwareLayout) -> Result<Vec<u8>, ConvertError> {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let chroma_width = width / 2;
    let chroma_height = height / 2;
    let mut out = Vec::with_capacity(width * height + 2 * chroma_width * chroma_height);

    for row in 0..height {
        let offset = row * frame.y.stride as usize;
        out.extend_from_slice(region(&frame.y.data, offset, width, "Y")?);
    }

    match layout {
        SoftwareLayout::Planar => {
            for (plane, name) in [(&frame.u, "U"), (&frame.v, "V")] {
                for row in 0..chroma_height {
                    let offset = row * plane.stride as usize;
                    out.extend_from_slice(region(&plane.data, offset, chroma_width, name)?);
                }
            }
        }
        SoftwareLayout::SemiPlanar | SoftwareLayout::PackedSemiPlanar32m => {
            for row in 0..chroma_height {
                let u = region(&frame.u.data, row * frame.u.stride as usize, chroma_width, "U")?;
                let v = region(&frame.v.data, row * frame.v.stride as usize, chroma_width, "V")?;
                for (cb, cr) in u.iter().zip(v) {
                    out.push(*cb);
                    out.push(*cr);
                }
            }
        }
    }
    Ok(out)
}

fn region<'a>(
    data: &'a [u8],
    offset: usize,
    len: usize,
    plane: &'static str,
) -> Result<&'a [u8], ConvertError> {
    data.get(offset..offset + len)
        .ok_or(ConvertError::ShortBuffer {
            plane,
            needed: offset + len,
            actual: data.len(),
        })
}
