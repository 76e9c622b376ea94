use super::{BootInfoError, Reader, ensure_len};
use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};

/// Bytes up to and including the direct-RGB colour info.
const DESCRIPTOR_LEN: usize = 29;

/// Colour type for direct RGB frame buffers.
pub const COLOUR_TYPE_RGB: u8 = 1;

/// The only pixel depth the console supports.
pub const SUPPORTED_DEPTH: u8 = 32;

/// Linear frame buffer handed over by the bootloader.
///
/// ```text
/// paddr u64 | pitch u32 | width u32 | height u32 | depth u8 | colour_type u8 |
/// reserved u8 | red_offset u8 | red_size u8 | green_offset u8 | green_size u8 |
/// blue_offset u8 | blue_size u8
/// ```
///
/// GRUB pads the payload to 30 bytes; trailing bytes are ignored.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FramebufferInfo {
    /// Physical base address of the linear frame buffer.
    pub paddr: PhysicalAddress,
    /// Bytes per scan line.
    pub pitch: u32,
    /// Visible width in pixels.
    pub width: u32,
    /// Visible height in pixels.
    pub height: u32,
    /// Bits per pixel.
    pub depth: u8,
    pub red: ColourField,
    pub green: ColourField,
    pub blue: ColourField,
}

/// Bit position and width of one colour channel inside a pixel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ColourField {
    pub offset: u8,
    pub size: u8,
}

impl FramebufferInfo {
    /// # Errors
    /// Only 32-bit direct RGB frame buffers are accepted.
    pub fn parse(payload: &[u8]) -> Result<Self, BootInfoError> {
        ensure_len("frame buffer", payload, DESCRIPTOR_LEN)?;
        let mut r = Reader::new(payload);
        let paddr = PhysicalAddress::new(r.u64());
        let pitch = r.u32();
        let width = r.u32();
        let height = r.u32();
        let depth = r.u8();
        let colour_type = r.u8();
        let reserved = r.u8();

        if colour_type != COLOUR_TYPE_RGB {
            return Err(BootInfoError::ColourType(colour_type));
        }
        if depth != SUPPORTED_DEPTH {
            return Err(BootInfoError::Depth(depth));
        }
        if reserved != 0 {
            return Err(BootInfoError::Reserved(reserved));
        }

        let mut field = || ColourField {
            offset: r.u8(),
            size: r.u8(),
        };
        let red = field();
        let green = field();
        let blue = field();

        let info = Self {
            paddr,
            pitch,
            width,
            height,
            depth,
            red,
            green,
            blue,
        };
        log::debug!(
            "frame buffer {}x{}x{} at {} ({} bytes)",
            info.width,
            info.height,
            info.depth,
            info.paddr,
            info.byte_len()
        );
        Ok(info)
    }

    #[must_use]
    pub const fn bytes_per_pixel(&self) -> u64 {
        self.depth as u64 / 8
    }

    /// Size of the visible buffer in bytes, honouring scan line padding.
    #[must_use]
    pub const fn byte_len(&self) -> u64 {
        let packed = self.width as u64 * self.bytes_per_pixel();
        let line = if (self.pitch as u64) > packed {
            self.pitch as u64
        } else {
            packed
        };
        line * self.height as u64
    }

    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        PhysicalRange::with_len(self.paddr, self.byte_len())
    }
}
