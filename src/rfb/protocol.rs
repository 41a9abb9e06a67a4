//! RFB 3.8 wire format, limited to what the client speaks.
//!
//! All multi-byte integers are big-endian (RFC 6143 §7).

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::RfbError;

/// Version banner sent in reply to the server's.
pub const PROTOCOL_VERSION: &[u8; 12] = b"RFB 003.008\n";
pub const BANNER_LEN: usize = 12;
pub const MIN_VERSION: (u32, u32) = (3, 8);

pub const SECURITY_NONE: u8 = 1;
pub const SECURITY_RESULT_OK: u32 = 0;

/// Upper bound for server-supplied strings (reasons, desktop name).
pub const MAX_STRING_LEN: u32 = 1024 * 1024;

// Client-to-server message types.
pub const MSG_SET_PIXEL_FORMAT: u8 = 0;
pub const MSG_SET_ENCODINGS: u8 = 2;
pub const MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

// Server-to-client message types.
pub const MSG_FRAMEBUFFER_UPDATE: u8 = 0;

pub const ENCODING_RAW: i32 = 0;

/// Parse `RFB xxx.yyy\n` into `(major, minor)`.
pub fn parse_version(banner: &[u8]) -> Option<(u32, u32)> {
    let text = std::str::from_utf8(banner).ok()?;
    let rest = text.strip_prefix("RFB ")?.strip_suffix('\n')?;
    let (major, minor) = rest.split_once('.')?;
    if major.len() != 3 || minor.len() != 3 {
        return None;
    }
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Pixel layout as carried in ServerInit and SetPixelFormat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_color: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    pub const WIRE_LEN: usize = 16;

    /// 32bpp little-endian with red in the low byte, so raw pixels arrive as
    /// `[r, g, b, x]` and can be copied straight into an RGBA buffer.
    pub const CLIENT: PixelFormat = PixelFormat {
        bits_per_pixel: 32,
        depth: 24,
        big_endian: false,
        true_color: true,
        red_max: 255,
        green_max: 255,
        blue_max: 255,
        red_shift: 0,
        green_shift: 8,
        blue_shift: 16,
    };

    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel as usize).div_ceil(8)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian as u8);
        buf.put_u8(self.true_color as u8);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3);
    }

    pub fn decode(raw: &[u8; Self::WIRE_LEN]) -> Self {
        Self {
            bits_per_pixel: raw[0],
            depth: raw[1],
            big_endian: raw[2] != 0,
            true_color: raw[3] != 0,
            red_max: u16::from_be_bytes([raw[4], raw[5]]),
            green_max: u16::from_be_bytes([raw[6], raw[7]]),
            blue_max: u16::from_be_bytes([raw[8], raw[9]]),
            red_shift: raw[10],
            green_shift: raw[11],
            blue_shift: raw[12],
        }
    }
}

/// Body of a ServerInit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
    pub name: String,
}

impl ServerInit {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, RfbError> {
        let width = reader.read_u16().await?;
        let height = reader.read_u16().await?;
        let mut raw = [0u8; PixelFormat::WIRE_LEN];
        reader.read_exact(&mut raw).await?;
        let name = read_string(reader).await?;
        Ok(Self {
            width,
            height,
            pixel_format: PixelFormat::decode(&raw),
            name,
        })
    }
}

/// Header of one rectangle inside a FramebufferUpdate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectHeader {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: i32,
}

impl RectHeader {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            x: reader.read_u16().await?,
            y: reader.read_u16().await?,
            width: reader.read_u16().await?,
            height: reader.read_u16().await?,
            encoding: reader.read_i32().await?,
        })
    }
}

/// Read a u32-length-prefixed string, replacing invalid UTF-8.
pub async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, RfbError> {
    let len = reader.read_u32().await?;
    if len > MAX_STRING_LEN {
        return Err(RfbError::StringTooLong(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub fn set_pixel_format(format: &PixelFormat) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + PixelFormat::WIRE_LEN);
    buf.put_u8(MSG_SET_PIXEL_FORMAT);
    buf.put_bytes(0, 3);
    format.encode(&mut buf);
    buf.freeze()
}

pub fn set_encodings(encodings: &[i32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + 4 * encodings.len());
    buf.put_u8(MSG_SET_ENCODINGS);
    buf.put_u8(0);
    buf.put_u16(encodings.len() as u16);
    for encoding in encodings {
        buf.put_i32(*encoding);
    }
    buf.freeze()
}

pub fn update_request(incremental: bool, x: u16, y: u16, width: u16, height: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(10);
    buf.put_u8(MSG_FRAMEBUFFER_UPDATE_REQUEST);
    buf.put_u8(incremental as u8);
    buf.put_u16(x);
    buf.put_u16(y);
    buf.put_u16(width);
    buf.put_u16(height);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_version_banners() {
        assert_eq!(parse_version(b"RFB 003.008\n"), Some((3, 8)));
        assert_eq!(parse_version(b"RFB 003.003\n"), Some((3, 3)));
        assert_eq!(parse_version(b"RFB 004.001\n"), Some((4, 1)));
        assert_eq!(parse_version(b"RFB 3.8\n"), None);
        assert_eq!(parse_version(b"HTTP/1.1 200"), None);
        assert!(parse_version(PROTOCOL_VERSION).unwrap() >= MIN_VERSION);
    }

    #[test]
    fn client_pixel_format_layout() {
        let mut buf = BytesMut::new();
        PixelFormat::CLIENT.encode(&mut buf);
        assert_eq!(
            &buf[..],
            &[32, 24, 0, 1, 0, 255, 0, 255, 0, 255, 0, 8, 16, 0, 0, 0]
        );
        let raw: [u8; 16] = buf[..].try_into().unwrap();
        assert_eq!(PixelFormat::decode(&raw), PixelFormat::CLIENT);
        assert_eq!(PixelFormat::CLIENT.bytes_per_pixel(), 4);
    }

    #[test]
    fn client_messages() {
        assert_eq!(set_pixel_format(&PixelFormat::CLIENT).len(), 20);
        assert_eq!(&set_encodings(&[ENCODING_RAW])[..], &[2, 0, 0, 1, 0, 0, 0, 0]);
        assert_eq!(
            &update_request(true, 0, 0, 1024, 768)[..],
            &[3, 1, 0, 0, 0, 0, 4, 0, 3, 0]
        );
    }

    #[tokio::test]
    async fn reads_server_init() {
        let mut msg = BytesMut::new();
        msg.put_u16(800);
        msg.put_u16(600);
        PixelFormat::CLIENT.encode(&mut msg);
        msg.put_u32(4);
        msg.put_slice(b"QEMU");

        let init = ServerInit::read_from(&mut &msg[..]).await.unwrap();
        assert_eq!((init.width, init.height), (800, 600));
        assert_eq!(init.name, "QEMU");
    }

    #[tokio::test]
    async fn oversized_string_is_rejected() {
        let mut msg = BytesMut::new();
        msg.put_u32(MAX_STRING_LEN + 1);
        let err = read_string(&mut &msg[..]).await.unwrap_err();
        assert!(matches!(err, RfbError::StringTooLong(_)));
    }
}
